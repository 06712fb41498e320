//! Run configuration.
//!
//! A YAML file with one section per collaborator. Required keys fail at
//! parse time; everything else carries a default.

use crate::error::{Error, Result};
use crate::transforms::Normalization;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Complete run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Dataset and sampling settings.
    pub data_params: DataParams,
    /// Experiment wrapper settings.
    pub exp_params: ExperimentParams,
    /// Baseline model settings.
    #[serde(default)]
    pub model_params: ModelParams,
    /// Fit loop settings.
    #[serde(default)]
    pub trainer_params: TrainerParams,
    /// Experiment tracker settings.
    #[serde(default)]
    pub tracking_params: TrackingParams,
}

/// Data module settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataParams {
    /// Root directory holding the dataset.
    pub data_path: PathBuf,
    /// Registered dataset name, e.g. `brats2018`.
    pub dataset: String,
    /// Number of segmentation classes.
    #[serde(default = "default_classes")]
    pub classes: usize,
    /// Crop extent `[D, H, W]`.
    #[serde(default = "default_crop_dim")]
    pub vol_crop_dim: [usize; 3],
    /// Samples per batch.
    #[serde(default = "default_batch_size")]
    pub train_batch_size: usize,
    /// Declared loader parallelism; batches are produced on the caller's thread.
    #[serde(default)]
    pub num_workers: usize,
    /// Fraction of subjects used for training.
    #[serde(default = "default_split")]
    pub split: f64,
    /// Crops per training subject.
    #[serde(default = "default_samples")]
    pub train_samples: usize,
    /// Crops per validation subject.
    #[serde(default = "default_samples")]
    pub val_samples: usize,
    /// Minimum label foreground fraction per crop.
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    /// Intensity normalization mode.
    #[serde(default)]
    pub normalization: Normalization,
    /// Augment training samples on retrieval.
    #[serde(default)]
    pub augmentation: bool,
    /// Origin draws per crop before accepting a low-foreground candidate.
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    /// Regenerate the cache even if a manifest exists.
    #[serde(default)]
    pub force_regenerate: bool,
    /// Override of the layout's full-volume shape.
    #[serde(default)]
    pub full_vol_dim: Option<[usize; 3]>,
    /// Seed for sampling, shuffling and augmentation.
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_classes() -> usize {
    4
}

fn default_crop_dim() -> [usize; 3] {
    [32, 32, 32]
}

fn default_batch_size() -> usize {
    4
}

fn default_split() -> f64 {
    0.8
}

fn default_samples() -> usize {
    10
}

fn default_threshold() -> f32 {
    0.1
}

fn default_max_retries() -> usize {
    100
}

/// Experiment wrapper settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentParams {
    /// `sgd`, `adam` or `rmsprop` (any case).
    pub optimizer: String,
    /// Learning rate.
    #[serde(default = "default_lr")]
    pub lr: f32,
    /// Momentum for SGD and RMSProp.
    #[serde(default)]
    pub momentum: f32,
    /// L2 weight decay.
    #[serde(default)]
    pub weight_decay: f32,
    /// RMSProp square-average smoothing.
    #[serde(default = "default_alpha")]
    pub alpha: f32,
    /// Modality tensors delivered per batch.
    #[serde(default = "default_modalities")]
    pub modalities: usize,
    /// Input channels the model expects.
    #[serde(default = "default_modalities")]
    pub in_channels: usize,
}

fn default_lr() -> f32 {
    1e-3
}

fn default_alpha() -> f32 {
    0.99
}

fn default_modalities() -> usize {
    4
}

/// Baseline model settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    /// Seed for weight initialization.
    #[serde(default)]
    pub init_seed: Option<u64>,
}

/// Fit loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerParams {
    /// Epochs to run.
    #[serde(default = "default_max_epochs")]
    pub max_epochs: usize,
    /// Log the step loss every this many training steps.
    #[serde(default = "default_log_every")]
    pub log_every_n_steps: usize,
}

impl Default for TrainerParams {
    fn default() -> Self {
        Self {
            max_epochs: default_max_epochs(),
            log_every_n_steps: default_log_every(),
        }
    }
}

fn default_max_epochs() -> usize {
    1
}

fn default_log_every() -> usize {
    10
}

/// Experiment tracker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingParams {
    /// Project name; a subdirectory of `save_dir`.
    #[serde(default = "default_project")]
    pub project: String,
    /// Directory the tracker writes under.
    #[serde(default = "default_save_dir")]
    pub save_dir: PathBuf,
    /// Run name; a timestamp when absent.
    #[serde(default)]
    pub run_name: Option<String>,
}

impl Default for TrackingParams {
    fn default() -> Self {
        Self {
            project: default_project(),
            save_dir: default_save_dir(),
            run_name: None,
        }
    }
}

fn default_project() -> String {
    "volseg".to_string()
}

fn default_save_dir() -> PathBuf {
    PathBuf::from("runs")
}

fn check(ok: bool, msg: impl FnOnce() -> String) -> Result<()> {
    if ok {
        Ok(())
    } else {
        Err(Error::Configuration(msg()))
    }
}

impl RunConfig {
    /// Parse YAML and validate.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(text).map_err(|e| Error::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a config file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&text)
    }

    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let d = &self.data_params;
        check(d.vol_crop_dim.iter().all(|&c| c > 0), || {
            format!("vol_crop_dim must be positive, got {:?}", d.vol_crop_dim)
        })?;
        if let Some(full) = d.full_vol_dim {
            check(full.iter().all(|&c| c > 0), || {
                format!("full_vol_dim must be positive, got {full:?}")
            })?;
        }
        check((0.0..=1.0).contains(&d.split), || {
            format!("split must be within [0, 1], got {}", d.split)
        })?;
        check((0.0..=1.0).contains(&d.threshold), || {
            format!("threshold must be within [0, 1], got {}", d.threshold)
        })?;
        check(d.train_batch_size > 0, || "train_batch_size must be > 0".to_string())?;
        check(d.classes > 0, || "classes must be > 0".to_string())?;

        let e = &self.exp_params;
        check(e.lr > 0.0 && e.lr.is_finite(), || {
            format!("lr must be positive, got {}", e.lr)
        })?;
        check(e.weight_decay >= 0.0, || {
            format!("weight_decay must be >= 0, got {}", e.weight_decay)
        })?;
        check(e.momentum >= 0.0, || {
            format!("momentum must be >= 0, got {}", e.momentum)
        })?;
        check((0.0..1.0).contains(&e.alpha), || {
            format!("alpha must be within [0, 1), got {}", e.alpha)
        })?;

        check(self.trainer_params.log_every_n_steps > 0, || {
            "log_every_n_steps must be > 0".to_string()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r"
data_params:
  data_path: /data
  dataset: brats2018
exp_params:
  optimizer: rmsprop
";

    #[test]
    fn test_minimal_config_gets_defaults() {
        let cfg = RunConfig::from_yaml(MINIMAL).unwrap();
        assert_eq!(cfg.data_params.vol_crop_dim, [32, 32, 32]);
        assert_eq!(cfg.data_params.split, 0.8);
        assert_eq!(cfg.data_params.normalization, Normalization::FullVolumeMean);
        assert!(!cfg.data_params.augmentation);
        assert_eq!(cfg.exp_params.modalities, 4);
        assert_eq!(cfg.exp_params.alpha, 0.99);
        assert_eq!(cfg.trainer_params.max_epochs, 1);
        assert_eq!(cfg.tracking_params.project, "volseg");
    }

    #[test]
    fn test_missing_required_key_fails() {
        let text = "data_params:\n  dataset: brats2018\nexp_params:\n  optimizer: sgd\n";
        assert!(matches!(
            RunConfig::from_yaml(text),
            Err(Error::Configuration(msg)) if msg.contains("data_path")
        ));
    }

    #[test]
    fn test_full_config() {
        let text = r"
data_params:
  data_path: ./datasets
  dataset: BraTS2018
  classes: 4
  vol_crop_dim: [64, 64, 48]
  train_batch_size: 2
  split: 0.75
  normalization: brats
  augmentation: true
  seed: 7
exp_params:
  optimizer: adam
  lr: 0.01
  weight_decay: 0.0001
  modalities: 4
  in_channels: 2
trainer_params:
  max_epochs: 5
tracking_params:
  project: brats
  save_dir: /tmp/runs
";
        let cfg = RunConfig::from_yaml(text).unwrap();
        assert_eq!(cfg.data_params.vol_crop_dim, [64, 64, 48]);
        assert_eq!(cfg.data_params.normalization, Normalization::Brats);
        assert_eq!(cfg.data_params.seed, Some(7));
        assert_eq!(cfg.exp_params.in_channels, 2);
        assert_eq!(cfg.trainer_params.log_every_n_steps, 10);
        assert_eq!(cfg.tracking_params.save_dir, PathBuf::from("/tmp/runs"));
    }

    #[test]
    fn test_out_of_range_values_rejected() {
        let bad_split = MINIMAL.replace("dataset: brats2018", "dataset: brats2018\n  split: 1.5");
        assert!(matches!(
            RunConfig::from_yaml(&bad_split),
            Err(Error::Configuration(_))
        ));

        let bad_crop = MINIMAL.replace(
            "dataset: brats2018",
            "dataset: brats2018\n  vol_crop_dim: [0, 32, 32]",
        );
        assert!(RunConfig::from_yaml(&bad_crop).is_err());
    }
}
