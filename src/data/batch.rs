//! Collating samples into batches.

use crate::data::dataset::{Sample, SubVolumeDataset};
use crate::error::{Error, Result};
use crate::transforms::augment::get_rng;
use ndarray::{stack, Array4, Array5, ArrayD, ArrayView4, Axis, Ix4};
use rand::seq::SliceRandom;

/// A collated batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// One `[B, 1, D, H, W]` tensor per modality.
    pub inputs: Vec<Array5<f32>>,
    /// Labels, `[B, D, H, W]`.
    pub target: Array4<f32>,
}

impl Batch {
    /// Number of samples.
    pub fn len(&self) -> usize {
        self.target.len_of(Axis(0))
    }

    /// True for a batch without samples.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of modality tensors.
    pub fn modalities(&self) -> usize {
        self.inputs.len()
    }
}

fn with_channel(array: &ArrayD<f32>) -> Result<ArrayView4<'_, f32>> {
    let view = array.view();
    let view = match view.ndim() {
        3 => view.insert_axis(Axis(0)),
        4 => view,
        n => {
            return Err(Error::InvalidDimensions(format!(
                "sample modality must be 3D or 4D, got {n}D"
            )))
        }
    };
    view.into_dimensionality::<Ix4>()
        .map_err(|e| Error::InvalidDimensions(e.to_string()))
}

/// Stack samples along a new batch axis.
///
/// 3D modalities gain a channel axis so every input is `[B, 1, D, H, W]`.
pub fn collate(samples: &[Sample]) -> Result<Batch> {
    let first = samples
        .first()
        .ok_or_else(|| Error::InvalidDimensions("cannot collate an empty batch".to_string()))?;
    let modalities = first.modalities.len();
    if let Some(bad) = samples.iter().find(|s| s.modalities.len() != modalities) {
        return Err(Error::ShapeMismatch(format!(
            "sample has {} modalities, batch started with {modalities}",
            bad.modalities.len()
        )));
    }

    let shape_err = |e: ndarray::ShapeError| Error::ShapeMismatch(e.to_string());
    let inputs = (0..modalities)
        .map(|m| {
            let views = samples
                .iter()
                .map(|s| with_channel(&s.modalities[m]))
                .collect::<Result<Vec<_>>>()?;
            stack(Axis(0), &views).map_err(shape_err)
        })
        .collect::<Result<Vec<_>>>()?;

    let labels: Vec<_> = samples.iter().map(|s| s.label.view()).collect();
    let target = stack(Axis(0), &labels).map_err(shape_err)?;

    Ok(Batch { inputs, target })
}

/// Iterator over the batches of a dataset.
///
/// The last batch may be smaller than `batch_size`.
#[derive(Debug)]
pub struct BatchIter<'a> {
    dataset: &'a SubVolumeDataset,
    order: Vec<usize>,
    batch_size: usize,
    cursor: usize,
    seed: Option<u64>,
}

impl<'a> BatchIter<'a> {
    /// Batches in dataset order.
    pub fn sequential(dataset: &'a SubVolumeDataset, batch_size: usize) -> Self {
        Self {
            dataset,
            order: (0..dataset.len()).collect(),
            batch_size: batch_size.max(1),
            cursor: 0,
            seed: None,
        }
    }

    /// Batches over a random permutation. With a seed, both the order and
    /// the per-sample augmentation are reproducible.
    pub fn shuffled(dataset: &'a SubVolumeDataset, batch_size: usize, seed: Option<u64>) -> Self {
        let mut iter = Self::sequential(dataset, batch_size);
        iter.order.shuffle(&mut get_rng(seed));
        iter.seed = seed;
        iter
    }

    /// Total number of batches this iterator yields.
    pub fn num_batches(&self) -> usize {
        self.order.len().div_ceil(self.batch_size)
    }
}

/// SplitMix64 finalizer.
fn mix(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Augmentation seed for dataset index `index` under iterator seed `seed`.
///
/// The two inputs are mixed separately so `(seed + 1, i)` and
/// `(seed, i + 1)` do not collide.
fn sample_seed(seed: u64, index: usize) -> u64 {
    mix(mix(seed) ^ (index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

impl Iterator for BatchIter<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let indices = &self.order[self.cursor..end];
        self.cursor = end;

        let samples = indices
            .iter()
            .map(|&i| match self.seed {
                Some(seed) => self.dataset.get_seeded(i, sample_seed(seed, i)),
                None => self.dataset.get(i),
            })
            .collect::<Result<Vec<_>>>();
        Some(samples.and_then(|s| collate(&s)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.order.len() - self.cursor).div_ceil(self.batch_size);
        (remaining, Some(remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn sample(value: f32, with_axis: bool) -> Sample {
        let m = Array3::from_elem((2, 3, 4), value);
        let m = if with_axis {
            m.insert_axis(Axis(0)).into_dyn()
        } else {
            m.into_dyn()
        };
        Sample {
            modalities: vec![m.clone(), m * 2.0],
            label: Array3::from_elem((2, 3, 4), 1.0),
        }
    }

    #[test]
    fn test_sample_seeds_differ_across_epochs() {
        for seed in 0..8u64 {
            for i in 0..64usize {
                assert_ne!(sample_seed(seed + 1, i), sample_seed(seed, i + 1));
                assert_ne!(sample_seed(seed, i), sample_seed(seed, i + 1));
            }
        }
        assert_eq!(sample_seed(3, 5), sample_seed(3, 5));
    }

    #[test]
    fn test_collate_adds_channel_axis() {
        let batch = collate(&[sample(1.0, false), sample(2.0, false), sample(3.0, false)]).unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.modalities(), 2);
        assert_eq!(batch.inputs[0].shape(), &[3, 1, 2, 3, 4]);
        assert_eq!(batch.inputs[1][[2, 0, 0, 0, 0]], 6.0);
        assert_eq!(batch.target.shape(), &[3, 2, 3, 4]);
    }

    #[test]
    fn test_collate_accepts_channel_first_samples() {
        let batch = collate(&[sample(1.0, true), sample(2.0, true)]).unwrap();
        assert_eq!(batch.inputs[0].shape(), &[2, 1, 2, 3, 4]);
    }

    #[test]
    fn test_collate_empty_is_error() {
        assert!(collate(&[]).is_err());
    }

    #[test]
    fn test_collate_shape_mismatch() {
        let mut odd = sample(1.0, false);
        odd.label = Array3::zeros((1, 1, 1));
        assert!(matches!(
            collate(&[sample(1.0, false), odd]),
            Err(Error::ShapeMismatch(_))
        ));
    }
}
