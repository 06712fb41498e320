//! Foreground-constrained random crops, cached to disk.

use crate::data::manifest::{write_manifest, CacheEntry};
use crate::data::subjects::SubjectRecord;
use crate::error::{Error, Result};
use crate::transforms::augment::get_rng;
use crate::transforms::intensity::{
    foreground_fraction, normalize, LabelMap, Normalization, NormalizationStats,
};
use crate::transforms::{clamp_extent, crop};
use crate::volume::{load_volume, save_volume, Volume};
use ndarray::ArrayView3;
use rand::Rng;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Settings for one sampling run.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplerConfig {
    /// Shape every source volume must have.
    pub full_vol_dim: [usize; 3],
    /// Requested crop extent.
    pub crop_size: [usize; 3],
    /// Crops per subject.
    pub samples: usize,
    /// Minimum fraction of foreground label voxels in an accepted crop.
    pub threshold: f32,
    /// Intensity normalization per modality.
    pub normalization: Normalization,
    /// Label fix-up before the foreground test.
    pub label_map: LabelMap,
    /// Modality keys, used in cache file names.
    pub modality_names: Vec<String>,
    /// Label key, used in cache file names.
    pub label_name: String,
    /// Origin draws per crop before the last candidate is accepted.
    pub max_retries: usize,
    /// Seed for reproducible sampling.
    pub seed: Option<u64>,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            full_vol_dim: [240, 240, 155],
            crop_size: [32, 32, 32],
            samples: 10,
            threshold: 0.1,
            normalization: Normalization::default(),
            label_map: LabelMap::Identity,
            modality_names: ["t1", "t1ce", "t2", "flair"].map(String::from).to_vec(),
            label_name: "seg".to_string(),
            max_retries: 100,
            seed: None,
        }
    }
}

/// Chosen crop origin and whether it met the threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CropChoice {
    /// Corner of the crop.
    pub origin: [usize; 3],
    /// Foreground fraction of the label inside the crop.
    pub foreground: f32,
    /// Number of origins drawn.
    pub attempts: usize,
    /// False when the retry budget ran out.
    pub accepted: bool,
}

/// Draw crop origins until the label foreground reaches `threshold`.
///
/// Gives up after `max_retries` draws and returns the last candidate.
pub fn choose_crop<R: Rng>(
    label: ArrayView3<'_, f32>,
    extent: [usize; 3],
    threshold: f32,
    max_retries: usize,
    rng: &mut R,
) -> CropChoice {
    let (d, h, w) = label.dim();
    let shape = [d, h, w];
    let extent = clamp_extent(shape, extent);
    let budget = max_retries.max(1);

    let mut choice = CropChoice {
        origin: [0; 3],
        foreground: 0.0,
        attempts: 0,
        accepted: false,
    };
    for attempt in 1..=budget {
        let origin = [0, 1, 2].map(|a| rng.gen_range(0..=shape[a] - extent[a]));
        let foreground = foreground_fraction(crop(label, origin, extent).view());
        choice = CropChoice {
            origin,
            foreground,
            attempts: attempt,
            accepted: foreground >= threshold,
        };
        if choice.accepted {
            break;
        }
    }
    choice
}

/// Shift an affine so it maps crop indices to the same world points.
fn crop_affine(affine: [[f32; 4]; 4], origin: [usize; 3]) -> [[f32; 4]; 4] {
    let mut out = affine;
    for (row, out_row) in affine.iter().zip(out.iter_mut()).take(3) {
        out_row[3] = row[3]
            + row[0] * origin[0] as f32
            + row[1] * origin[1] as f32
            + row[2] * origin[2] as f32;
    }
    out
}

/// Generates the sub-volume cache for a list of subjects.
#[derive(Debug, Clone)]
pub struct SubVolumeSampler {
    config: SamplerConfig,
}

impl SubVolumeSampler {
    /// Create a sampler.
    pub fn new(config: SamplerConfig) -> Self {
        Self { config }
    }

    /// Sampler settings.
    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    fn check_shape(&self, path: &Path, volume: &Volume) -> Result<()> {
        if volume.shape() != self.config.full_vol_dim {
            return Err(Error::ShapeMismatch(format!(
                "{} has shape {:?}, expected {:?}",
                path.display(),
                volume.shape(),
                self.config.full_vol_dim
            )));
        }
        Ok(())
    }

    /// Crop every subject `samples` times into `cache_dir`, then write the
    /// manifest to `manifest_path`.
    pub fn generate(
        &self,
        subjects: &[SubjectRecord],
        cache_dir: &Path,
        manifest_path: &Path,
    ) -> Result<Vec<CacheEntry>> {
        let cfg = &self.config;
        std::fs::create_dir_all(cache_dir)?;
        let mut rng = get_rng(cfg.seed);
        let mut entries = Vec::with_capacity(subjects.len() * cfg.samples);

        info!(
            subjects = subjects.len(),
            samples = cfg.samples,
            crop = ?cfg.crop_size,
            cache = %cache_dir.display(),
            "generating sub-volumes"
        );

        for subject in subjects {
            if subject.modalities.len() != cfg.modality_names.len() {
                return Err(Error::Configuration(format!(
                    "subject {} has {} modalities, sampler expects {}",
                    subject.id,
                    subject.modalities.len(),
                    cfg.modality_names.len()
                )));
            }

            let mut modalities = Vec::with_capacity(subject.modalities.len());
            for path in &subject.modalities {
                let volume = load_volume(path)?;
                self.check_shape(path, &volume)?;
                let stats = cfg
                    .normalization
                    .needs_full_volume()
                    .then(|| NormalizationStats::compute(volume.data.view()));
                modalities.push((volume, stats));
            }
            let mut label = load_volume(&subject.label)?;
            self.check_shape(&subject.label, &label)?;
            cfg.label_map.apply(&mut label.data);

            let extent = clamp_extent(label.shape(), cfg.crop_size);
            for sample in 0..cfg.samples {
                let choice = choose_crop(
                    label.data.view(),
                    extent,
                    cfg.threshold,
                    cfg.max_retries,
                    &mut rng,
                );
                if choice.accepted {
                    debug!(
                        subject = %subject.id,
                        sample,
                        attempts = choice.attempts,
                        "crop accepted"
                    );
                } else {
                    warn!(
                        subject = %subject.id,
                        sample,
                        foreground = choice.foreground,
                        threshold = cfg.threshold,
                        "retry budget exhausted, keeping last crop"
                    );
                }

                let mut paths = Vec::with_capacity(modalities.len());
                for ((volume, stats), name) in modalities.iter().zip(&cfg.modality_names) {
                    let mut region = crop(volume.data.view(), choice.origin, extent);
                    let stats = stats.unwrap_or_else(|| NormalizationStats::compute(region.view()));
                    normalize(&mut region, cfg.normalization, &stats);
                    let path = cache_path(cache_dir, &subject.id, sample, name);
                    save_volume(&path, region.view(), crop_affine(volume.affine, choice.origin))?;
                    paths.push(path);
                }

                let region = crop(label.data.view(), choice.origin, extent);
                let label_path = cache_path(cache_dir, &subject.id, sample, &cfg.label_name);
                save_volume(&label_path, region.view(), crop_affine(label.affine, choice.origin))?;

                entries.push(CacheEntry {
                    modalities: paths,
                    label: label_path,
                });
            }
            debug!(subject = %subject.id, "subject sampled");
        }

        write_manifest(manifest_path, &entries)?;
        info!(entries = entries.len(), manifest = %manifest_path.display(), "manifest written");
        Ok(entries)
    }
}

/// `<cache_dir>/<subject>_s<sample>_<key>.nii`
pub fn cache_path(cache_dir: &Path, subject: &str, sample: usize, key: &str) -> PathBuf {
    cache_dir.join(format!("{subject}_s{sample}_{key}.nii"))
}
