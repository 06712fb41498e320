//! Intensity normalization and label remapping.

use ndarray::{Array3, ArrayView3};
use serde::{Deserialize, Serialize};

/// Per-modality normalization applied to each crop before it is cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalization {
    /// Leave intensities as loaded.
    None,
    /// Standardize with mean/std of the crop's non-zero voxels.
    Mean,
    /// Rescale the crop to `[0, 1]` with its own min/max.
    Max,
    /// Standardize with mean/std of the full volume.
    #[default]
    FullVolumeMean,
    /// Rescale to `[0, 1]` with the full volume's min/max.
    MaxMin,
    /// Standardize non-zero voxels with full-volume brain statistics, then
    /// map them into `[10, 110]`; background stays 0.
    Brats,
}

impl Normalization {
    /// Whether statistics must be taken from the full volume before cropping.
    pub fn needs_full_volume(self) -> bool {
        matches!(self, Self::FullVolumeMean | Self::MaxMin | Self::Brats)
    }
}

/// Summary statistics used by the full-volume modes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizationStats {
    /// Mean over all voxels.
    pub mean: f32,
    /// Population standard deviation over all voxels.
    pub std: f32,
    /// Mean over non-zero voxels.
    pub nonzero_mean: f32,
    /// Standard deviation over non-zero voxels.
    pub nonzero_std: f32,
    /// Minimum voxel value.
    pub min: f32,
    /// Maximum voxel value.
    pub max: f32,
}

fn mean_std<'a>(values: impl Iterator<Item = &'a f32>) -> (f32, f32) {
    let (mut n, mut sum, mut sum_sq) = (0usize, 0f64, 0f64);
    for &v in values {
        n += 1;
        sum += f64::from(v);
        sum_sq += f64::from(v) * f64::from(v);
    }
    if n == 0 {
        return (0.0, 0.0);
    }
    let mean = sum / n as f64;
    let var = (sum_sq / n as f64 - mean * mean).max(0.0);
    (mean as f32, var.sqrt() as f32)
}

impl NormalizationStats {
    /// Compute statistics over `data`.
    pub fn compute(data: ArrayView3<'_, f32>) -> Self {
        let (mean, std) = mean_std(data.iter());
        let (nonzero_mean, nonzero_std) = mean_std(data.iter().filter(|v| **v != 0.0));
        let (min, max) = data
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        Self {
            mean,
            std,
            nonzero_mean,
            nonzero_std,
            min: if min.is_finite() { min } else { 0.0 },
            max: if max.is_finite() { max } else { 0.0 },
        }
    }
}

fn safe_div(value: f32) -> f32 {
    if value.abs() > f32::EPSILON {
        value
    } else {
        1.0
    }
}

/// Normalize a crop in place.
///
/// `full` carries the full-volume statistics; it is ignored by the modes
/// that work on the crop alone.
pub fn normalize(crop: &mut Array3<f32>, mode: Normalization, full: &NormalizationStats) {
    match mode {
        Normalization::None => {}
        Normalization::Mean => {
            let local = NormalizationStats::compute(crop.view());
            let std = safe_div(local.nonzero_std);
            crop.mapv_inplace(|v| (v - local.nonzero_mean) / std);
        }
        Normalization::Max => {
            let local = NormalizationStats::compute(crop.view());
            let range = safe_div(local.max - local.min);
            crop.mapv_inplace(|v| (v - local.min) / range);
        }
        Normalization::FullVolumeMean => {
            let std = safe_div(full.std);
            crop.mapv_inplace(|v| (v - full.mean) / std);
        }
        Normalization::MaxMin => {
            let range = safe_div(full.max - full.min);
            crop.mapv_inplace(|v| (v - full.min) / range);
        }
        Normalization::Brats => {
            let std = safe_div(full.nonzero_std);
            let z = |v: f32| (v - full.nonzero_mean) / std;
            let lo = z(full.min);
            let range = safe_div(z(full.max) - lo);
            crop.mapv_inplace(|v| {
                if v == 0.0 {
                    0.0
                } else {
                    100.0 * (z(v) - lo) / range + 10.0
                }
            });
        }
    }
}

/// Dataset-specific label fix-ups applied before the foreground test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelMap {
    /// Labels are used as stored.
    Identity,
    /// BraTS enhancing tumour (4) becomes class 3, closing the gap in the
    /// label set.
    Brats,
}

impl LabelMap {
    /// Remap label values in place.
    pub fn apply(self, label: &mut Array3<f32>) {
        match self {
            Self::Identity => {}
            Self::Brats => label.mapv_inplace(|v| if v == 4.0 { 3.0 } else { v }),
        }
    }
}

/// Fraction of voxels with a label greater than zero.
pub fn foreground_fraction(label: ArrayView3<'_, f32>) -> f32 {
    if label.is_empty() {
        return 0.0;
    }
    let fg = label.iter().filter(|&&v| v > 0.0).count();
    fg as f32 / label.len() as f32
}
