//! Volume loader: one 3D `f32` array plus its voxel-to-world affine.

use crate::error::{Error, Result};
use crate::nifti::{self, NiftiImage};
use ndarray::{Array3, ArrayD, ArrayView3, Axis, Ix3};
use std::path::Path;

/// Identity voxel-to-world transform.
pub const IDENTITY_AFFINE: [[f32; 4]; 4] = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
    [0.0, 0.0, 0.0, 1.0],
];

/// A loaded 3D volume.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    /// Voxel intensities (scaling already applied).
    pub data: Array3<f32>,
    /// Voxel-to-world transform from the header.
    pub affine: [[f32; 4]; 4],
}

impl Volume {
    /// Spatial shape as an array.
    pub fn shape(&self) -> [usize; 3] {
        let (d, h, w) = self.data.dim();
        [d, h, w]
    }
}

/// Drop trailing singleton axes (e.g. `[D, H, W, 1]`) and require 3D.
fn into_3d(mut data: ArrayD<f32>) -> Result<Array3<f32>> {
    while data.ndim() > 3 && data.shape()[data.ndim() - 1] == 1 {
        let last = data.ndim() - 1;
        data = data.index_axis_move(Axis(last), 0);
    }
    let shape = data.shape().to_vec();
    data.into_dimensionality::<Ix3>()
        .map_err(|_| Error::InvalidDimensions(format!("expected a 3D volume, got shape {shape:?}")))
}

/// Load a `.nii`/`.nii.gz` volume.
pub fn load_volume<P: AsRef<Path>>(path: P) -> Result<Volume> {
    let image = nifti::load(path)?;
    let affine = image.affine();
    Ok(Volume {
        data: into_3d(image.into_data())?,
        affine,
    })
}

/// Read only the affine from a volume header.
pub fn load_affine<P: AsRef<Path>>(path: P) -> Result<[[f32; 4]; 4]> {
    Ok(nifti::load_header(path)?.affine())
}

/// Write a 3D array as NIfTI (`f32`, compression chosen by extension).
pub fn save_volume<P: AsRef<Path>>(
    path: P,
    data: ArrayView3<'_, f32>,
    affine: [[f32; 4]; 4],
) -> Result<()> {
    let image = NiftiImage::from_array(data.to_owned().into_dyn(), affine);
    nifti::save(&image, path)
}
