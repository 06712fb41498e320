//! Lazily loaded sub-volume dataset.

use crate::data::manifest::CacheEntry;
use crate::error::{Error, Result};
use crate::transforms::AugmentationPipeline;
use crate::volume::load_volume;
use ndarray::{Array3, ArrayD, Axis};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Which side of the subject split a dataset covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    /// Subjects `[0, split_idx)`.
    Train,
    /// Subjects `[split_idx, N)`.
    Val,
}

impl Split {
    /// Name used in cache directories and manifests.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Val => "val",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One retrieved sample.
///
/// Augmented train samples carry modalities as `[1, D, H, W]`; otherwise
/// modalities are `[D, H, W]`. The label is always `[D, H, W]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Modality arrays in channel order.
    pub modalities: Vec<ArrayD<f32>>,
    /// Label array.
    pub label: Array3<f32>,
}

/// Dataset over a list of cache entries.
#[derive(Debug, Clone)]
pub struct SubVolumeDataset {
    split: Split,
    entries: Vec<CacheEntry>,
    affine: [[f32; 4]; 4],
    augmentation: Option<AugmentationPipeline>,
}

impl SubVolumeDataset {
    /// Build a dataset. Augmentation only ever runs on the train split.
    pub fn new(
        split: Split,
        entries: Vec<CacheEntry>,
        affine: [[f32; 4]; 4],
        augmentation: Option<AugmentationPipeline>,
    ) -> Self {
        Self {
            split,
            entries,
            affine,
            augmentation,
        }
    }

    /// Number of cache entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Split this dataset covers.
    pub fn split(&self) -> Split {
        self.split
    }

    /// Cache entries in manifest order.
    pub fn entries(&self) -> &[CacheEntry] {
        &self.entries
    }

    /// Affine of the first discovered T1 volume.
    pub fn affine(&self) -> [[f32; 4]; 4] {
        self.affine
    }

    /// Whether `get` will augment.
    pub fn augments(&self) -> bool {
        self.split == Split::Train && self.augmentation.is_some()
    }

    /// Load entry `index`.
    pub fn get(&self, index: usize) -> Result<Sample> {
        self.load(index, None)
    }

    /// Load entry `index` with a fixed augmentation seed.
    pub fn get_seeded(&self, index: usize, seed: u64) -> Result<Sample> {
        self.load(index, Some(seed))
    }

    fn load(&self, index: usize, seed: Option<u64>) -> Result<Sample> {
        let entry = self.entries.get(index).ok_or(Error::IndexOutOfRange {
            index,
            len: self.entries.len(),
        })?;

        let read = |path: &Path| {
            load_volume(path)
                .map(|v| v.data)
                .map_err(|e| Error::corrupt_cache(index, path, e))
        };
        let modalities = entry
            .modalities
            .iter()
            .map(|p| read(p))
            .collect::<Result<Vec<_>>>()?;
        let label = read(&entry.label)?;

        match self.augmentation.as_ref().filter(|_| self.split == Split::Train) {
            Some(pipeline) => {
                let (modalities, label) = pipeline.apply(modalities, label, seed)?;
                Ok(Sample {
                    modalities: modalities
                        .into_iter()
                        .map(|m| m.insert_axis(Axis(0)).into_dyn())
                        .collect(),
                    label,
                })
            }
            None => Ok(Sample {
                modalities: modalities.into_iter().map(Array3::into_dyn).collect(),
                label,
            }),
        }
    }
}
