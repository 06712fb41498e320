//! # volseg
//!
//! Training-data pipeline and training orchestration for 3D medical image
//! segmentation.
//!
//! Full-resolution multi-modal volumes (BraTS-style directory trees of
//! `NIfTI-1` files) are cropped once into fixed-size sub-volumes, cached on
//! disk with a manifest, and served as augmented batches to an experiment
//! wrapper that selects input channels, computes a soft Dice loss and drives
//! an optimizer.
//!
//! ```no_run
//! use volseg::config::RunConfig;
//! use volseg::data::DataModule;
//!
//! # fn main() -> volseg::Result<()> {
//! let config = RunConfig::from_file("config.yaml")?;
//! let mut data = DataModule::new(config.data_params);
//! data.setup()?;
//! for batch in data.train_batches()? {
//!     let batch = batch?;
//!     println!("{} samples", batch.len());
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod data;
pub mod error;
pub mod nifti;
pub mod training;
pub mod transforms;
pub mod volume;

pub use error::{Error, Result};
