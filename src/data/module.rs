//! Train/validation data module.

use crate::config::DataParams;
use crate::data::batch::BatchIter;
use crate::data::dataset::{Split, SubVolumeDataset};
use crate::data::manifest::{
    manifest_name, read_key, read_manifest, write_key, CacheEntry, ManifestKey,
};
use crate::data::sampler::{SamplerConfig, SubVolumeSampler};
use crate::data::subjects::{resolve_layout, DatasetLayout, SubjectRecord};
use crate::error::{Error, Result};
use crate::transforms::AugmentationPipeline;
use crate::volume::load_affine;
use std::path::PathBuf;
use tracing::{info, info_span};

/// Index of the first validation subject.
pub fn split_index(total: usize, ratio: f64) -> usize {
    ((total as f64 * ratio).floor() as usize).min(total)
}

/// Cache directory name for a split and crop size, e.g. `train_vol_32x32x32`.
pub fn cache_dir_name(split: Split, crop: [usize; 3]) -> String {
    format!("{split}_vol_{}x{}x{}", crop[0], crop[1], crop[2])
}

/// Owns the train and validation datasets.
#[derive(Debug)]
pub struct DataModule {
    params: DataParams,
    layout: Option<DatasetLayout>,
    subjects: usize,
    split_idx: usize,
    train: Option<SubVolumeDataset>,
    val: Option<SubVolumeDataset>,
}

impl DataModule {
    /// Create an unconfigured module; call [`DataModule::setup`] next.
    pub fn new(params: DataParams) -> Self {
        Self {
            params,
            layout: None,
            subjects: 0,
            split_idx: 0,
            train: None,
            val: None,
        }
    }

    /// Data settings.
    pub fn params(&self) -> &DataParams {
        &self.params
    }

    /// Resolve the layout, discover subjects, split them and build (or
    /// reload) both caches.
    pub fn setup(&mut self) -> Result<()> {
        let layout = resolve_layout(&self.params.dataset)?;
        let span = info_span!("setup", dataset = layout.name);
        let _enter = span.enter();

        let subjects = layout.discover(&self.params.data_path)?;
        let first = subjects.first().ok_or_else(|| {
            Error::Configuration(format!(
                "no subjects found under {}",
                layout.training_path(&self.params.data_path).display()
            ))
        })?;
        let affine = load_affine(&first.modalities[0])?;

        let split_idx = split_index(subjects.len(), self.params.split);
        info!(
            subjects = subjects.len(),
            train = split_idx,
            val = subjects.len() - split_idx,
            num_workers = self.params.num_workers,
            "subjects discovered"
        );

        let (train_subjects, val_subjects) = subjects.split_at(split_idx);
        let train_entries = self.entries(&layout, Split::Train, train_subjects)?;
        let val_entries = self.entries(&layout, Split::Val, val_subjects)?;

        let augmentation = self
            .params
            .augmentation
            .then(AugmentationPipeline::default);
        self.train = Some(SubVolumeDataset::new(
            Split::Train,
            train_entries,
            affine,
            augmentation,
        ));
        self.val = Some(SubVolumeDataset::new(Split::Val, val_entries, affine, None));
        self.subjects = subjects.len();
        self.split_idx = split_idx;
        self.layout = Some(layout);
        Ok(())
    }

    fn samples(&self, split: Split) -> usize {
        match split {
            Split::Train => self.params.train_samples,
            Split::Val => self.params.val_samples,
        }
    }

    /// Cache directory for a split.
    pub fn cache_dir(&self, layout: &DatasetLayout, split: Split) -> PathBuf {
        layout
            .training_path(&self.params.data_path)
            .join("generated")
            .join(cache_dir_name(split, self.params.vol_crop_dim))
    }

    /// Manifest path for a split.
    pub fn manifest_path(&self, layout: &DatasetLayout, split: Split) -> PathBuf {
        layout
            .training_path(&self.params.data_path)
            .join(manifest_name(layout.name, split.as_str(), self.samples(split)))
    }

    fn entries(
        &self,
        layout: &DatasetLayout,
        split: Split,
        subjects: &[SubjectRecord],
    ) -> Result<Vec<CacheEntry>> {
        let manifest = self.manifest_path(layout, split);
        let full_vol_dim = self.params.full_vol_dim.unwrap_or(layout.full_vol_dim);
        let key = ManifestKey {
            crop_size: self.params.vol_crop_dim,
            full_vol_dim,
            threshold: self.params.threshold,
            normalization: self.params.normalization,
            samples: self.samples(split),
            subjects: subjects.iter().map(|s| s.id.clone()).collect(),
        };

        if manifest.is_file() && !self.params.force_regenerate {
            if read_key(&manifest)?.as_ref() == Some(&key) {
                let entries = read_manifest(&manifest, layout.modalities.len())?;
                info!(
                    %split,
                    entries = entries.len(),
                    manifest = %manifest.display(),
                    "reusing cached sub-volumes"
                );
                return Ok(entries);
            }
            info!(
                %split,
                manifest = %manifest.display(),
                "cache settings changed, regenerating"
            );
        }

        let sampler = SubVolumeSampler::new(SamplerConfig {
            full_vol_dim,
            crop_size: self.params.vol_crop_dim,
            samples: self.samples(split),
            threshold: self.params.threshold,
            normalization: self.params.normalization,
            label_map: layout.label_map,
            modality_names: layout.modalities.iter().map(|m| m.to_string()).collect(),
            label_name: layout.label.to_string(),
            max_retries: self.params.max_retries,
            seed: self.params.seed.map(|s| match split {
                Split::Train => s,
                Split::Val => s.wrapping_add(1),
            }),
        });
        let entries = sampler.generate(subjects, &self.cache_dir(layout, split), &manifest)?;
        write_key(&manifest, &key)?;
        Ok(entries)
    }

    /// Subjects found by the last `setup`.
    pub fn num_subjects(&self) -> usize {
        self.subjects
    }

    /// Index of the first validation subject.
    pub fn split_idx(&self) -> usize {
        self.split_idx
    }

    fn not_ready() -> Error {
        Error::Configuration("DataModule::setup must run before requesting data".to_string())
    }

    /// Training dataset.
    pub fn train_dataset(&self) -> Result<&SubVolumeDataset> {
        self.train.as_ref().ok_or_else(Self::not_ready)
    }

    /// Validation dataset.
    pub fn val_dataset(&self) -> Result<&SubVolumeDataset> {
        self.val.as_ref().ok_or_else(Self::not_ready)
    }

    /// Shuffled training batches.
    pub fn train_batches(&self) -> Result<BatchIter<'_>> {
        self.train_batches_seeded(self.params.seed)
    }

    /// Shuffled training batches with an explicit seed (e.g. seed + epoch).
    pub fn train_batches_seeded(&self, seed: Option<u64>) -> Result<BatchIter<'_>> {
        Ok(BatchIter::shuffled(
            self.train_dataset()?,
            self.params.train_batch_size,
            seed,
        ))
    }

    /// Validation batches in order.
    pub fn val_batches(&self) -> Result<BatchIter<'_>> {
        Ok(BatchIter::sequential(
            self.val_dataset()?,
            self.params.train_batch_size,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_index() {
        assert_eq!(split_index(244, 0.8), 195);
        assert_eq!(split_index(10, 0.0), 0);
        assert_eq!(split_index(10, 1.0), 10);
        assert_eq!(split_index(3, 0.5), 1);
    }

    #[test]
    fn test_cache_dir_name() {
        assert_eq!(cache_dir_name(Split::Val, [64, 64, 48]), "val_vol_64x64x48");
    }

    #[test]
    fn test_batches_before_setup_is_error() {
        let params: DataParams =
            serde_yaml::from_str("data_path: /nowhere\ndataset: brats2018\n").unwrap();
        let module = DataModule::new(params);
        assert!(matches!(module.train_batches(), Err(Error::Configuration(_))));
        assert!(matches!(module.val_batches(), Err(Error::Configuration(_))));
    }
}
