//! `NIfTI-1` file format support.
//!
//! Reading and writing of `.nii` and `.nii.gz` volumes. Voxels are always
//! decoded to `f32`, whatever the on-disk type.

pub(crate) mod header;
pub(crate) mod image;
pub mod io;

pub use header::{DataType, NiftiHeader};
pub use image::NiftiImage;
pub use io::{load, load_header, save};
