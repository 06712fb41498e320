//! Dataset layouts and subject discovery.

use crate::error::{Error, Result};
use crate::transforms::intensity::LabelMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// On-disk layout of a registered dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetLayout {
    /// Registry key (matched case-insensitively).
    pub name: &'static str,
    /// Directory under the data root that holds the subjects.
    pub training_dir: &'static str,
    /// Subject directories live in groups whose name ends with this.
    pub group_suffix: &'static str,
    /// Modality keys in channel order; files end in `_<key>.nii.gz`.
    pub modalities: &'static [&'static str],
    /// Label key; file ends in `_<key>.nii.gz`.
    pub label: &'static str,
    /// Shape every volume of this dataset must have.
    pub full_vol_dim: [usize; 3],
    /// Label fix-up applied before sampling.
    pub label_map: LabelMap,
}

/// BraTS 2018 training data: `{HGG,LGG}/<subject>/<subject>_<key>.nii.gz`.
pub const BRATS2018: DatasetLayout = DatasetLayout {
    name: "brats2018",
    training_dir: "MICCAI_BraTS_2018_Data_Training",
    group_suffix: "GG",
    modalities: &["t1", "t1ce", "t2", "flair"],
    label: "seg",
    full_vol_dim: [240, 240, 155],
    label_map: LabelMap::Brats,
};

const REGISTRY: &[DatasetLayout] = &[BRATS2018];

/// Look up a layout by name, ignoring case.
pub fn resolve_layout(name: &str) -> Result<DatasetLayout> {
    REGISTRY
        .iter()
        .find(|layout| layout.name.eq_ignore_ascii_case(name))
        .cloned()
        .ok_or_else(|| Error::DatasetNotFound(name.to_string()))
}

/// Paths for one subject. Modalities follow the layout's order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectRecord {
    /// Subject identifier (its directory name).
    pub id: String,
    /// Subject directory.
    pub dir: PathBuf,
    /// One path per modality.
    pub modalities: Vec<PathBuf>,
    /// Segmentation label path.
    pub label: PathBuf,
}

impl DatasetLayout {
    /// Root of the subject tree for a given data path.
    pub fn training_path(&self, data_path: &Path) -> PathBuf {
        data_path.join(self.training_dir)
    }

    fn suffix(key: &str) -> String {
        format!("_{key}.nii.gz")
    }

    /// Find every subject under `data_path`, sorted by directory path.
    ///
    /// A subject lacking any modality or the label fails the whole
    /// discovery.
    pub fn discover(&self, data_path: &Path) -> Result<Vec<SubjectRecord>> {
        let root = self.training_path(data_path);
        if !root.is_dir() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("training directory {} does not exist", root.display()),
            )));
        }

        let mut dirs = Vec::new();
        for entry in WalkDir::new(&root).min_depth(2).max_depth(2) {
            let entry = entry.map_err(|e| Error::Io(e.into()))?;
            let in_group = entry
                .path()
                .parent()
                .and_then(Path::file_name)
                .is_some_and(|g| g.to_string_lossy().ends_with(self.group_suffix));
            if entry.file_type().is_dir() && in_group {
                dirs.push(entry.into_path());
            }
        }
        dirs.sort();

        dirs.into_iter().map(|dir| self.record(dir)).collect()
    }

    fn record(&self, dir: PathBuf) -> Result<SubjectRecord> {
        let id = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut files = Vec::new();
        for entry in WalkDir::new(&dir).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| Error::Io(e.into()))?;
            if entry.file_type().is_file() {
                files.push(entry.into_path());
            }
        }
        files.sort();

        let find = |key: &str| -> Result<PathBuf> {
            let suffix = Self::suffix(key);
            files
                .iter()
                .find(|p| {
                    p.file_name()
                        .is_some_and(|n| n.to_string_lossy().ends_with(&suffix))
                })
                .cloned()
                .ok_or_else(|| Error::MissingModality {
                    subject: id.clone(),
                    modality: key.to_string(),
                })
        };

        let modalities = self
            .modalities
            .iter()
            .map(|key| find(key))
            .collect::<Result<Vec<_>>>()?;
        let label = find(self.label)?;

        Ok(SubjectRecord {
            id,
            dir,
            modalities,
            label,
        })
    }
}
