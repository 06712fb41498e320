//! Spatial and intensity operations on 3D volumes.
//!
//! Everything here works on `Array3<f32>` views so the sampler and the
//! augmentation pipeline can share one set of primitives.

pub mod augment;
pub mod intensity;

pub use augment::{AugmentationPipeline, AugmentationPipelineBuilder, Transform, TransformKind};
pub use intensity::{Normalization, NormalizationStats};

use ndarray::{s, Array1, Array3, ArrayView3, Axis, Zip};

/// Reverse the selected axes.
#[must_use]
pub fn flip(data: ArrayView3<'_, f32>, axes: [bool; 3]) -> Array3<f32> {
    let mut view = data;
    for (axis, &on) in axes.iter().enumerate() {
        if on {
            view.invert_axis(Axis(axis));
        }
    }
    view.to_owned()
}

/// Clamp a requested crop extent to the volume, per axis.
pub fn clamp_extent(shape: [usize; 3], size: [usize; 3]) -> [usize; 3] {
    [size[0].min(shape[0]), size[1].min(shape[1]), size[2].min(shape[2])]
}

/// Copy out the region starting at `origin` with extent `size`.
///
/// The extent is truncated where it would overrun the volume.
#[must_use]
pub fn crop(data: ArrayView3<'_, f32>, origin: [usize; 3], size: [usize; 3]) -> Array3<f32> {
    let shape = data.dim();
    let end = |axis: usize, extent: usize| {
        let dim = [shape.0, shape.1, shape.2][axis];
        (origin[axis] + extent).min(dim)
    };
    data.slice(s![
        origin[0]..end(0, size[0]),
        origin[1]..end(1, size[1]),
        origin[2]..end(2, size[2])
    ])
    .to_owned()
}

fn gaussian_kernel(sigma: f32) -> Array1<f32> {
    // Truncate at four standard deviations.
    let radius = (4.0 * sigma).ceil().max(0.0) as usize;
    let denom = 2.0 * sigma * sigma;
    let mut kernel = Array1::from_shape_fn(2 * radius + 1, |i| {
        let x = i as f32 - radius as f32;
        (-x * x / denom).exp()
    });
    let sum = kernel.sum();
    kernel /= sum;
    kernel
}

/// Separable Gaussian blur with zero padding outside the volume.
pub fn gaussian_smooth(data: &mut Array3<f32>, sigma: f32) {
    if sigma <= 0.0 {
        return;
    }
    let kernel = gaussian_kernel(sigma);
    let radius = kernel.len() / 2;

    for axis in 0..3 {
        let mut out = Array3::<f32>::zeros(data.raw_dim());
        Zip::from(out.lanes_mut(Axis(axis)))
            .and(data.lanes(Axis(axis)))
            .for_each(|mut dst, src| {
                let n = src.len();
                for (i, d) in dst.iter_mut().enumerate() {
                    let lo = i.saturating_sub(radius);
                    let hi = (i + radius).min(n.saturating_sub(1));
                    let mut acc = 0.0;
                    for j in lo..=hi {
                        acc += src[j] * kernel[j + radius - i];
                    }
                    *d = acc;
                }
            });
        *data = out;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(shape: (usize, usize, usize)) -> Array3<f32> {
        let n = shape.0 * shape.1 * shape.2;
        Array3::from_shape_vec(shape, (0..n).map(|i| i as f32).collect()).unwrap()
    }

    #[test]
    fn test_flip_single_axis() {
        let data = ramp((2, 3, 4));
        let flipped = flip(data.view(), [false, true, false]);
        assert_eq!(flipped[[0, 0, 0]], data[[0, 2, 0]]);
        assert_eq!(flipped[[1, 2, 3]], data[[1, 0, 3]]);
    }

    #[test]
    fn test_flip_twice_is_identity() {
        let data = ramp((3, 3, 3));
        let axes = [true, false, true];
        assert_eq!(flip(flip(data.view(), axes).view(), axes), data);
    }

    #[test]
    fn test_crop_region() {
        let data = ramp((4, 4, 4));
        let c = crop(data.view(), [1, 2, 0], [2, 2, 3]);
        assert_eq!(c.dim(), (2, 2, 3));
        assert_eq!(c[[0, 0, 0]], data[[1, 2, 0]]);
        assert_eq!(c[[1, 1, 2]], data[[2, 3, 2]]);
    }

    #[test]
    fn test_crop_truncates_oversized_extent() {
        let data = ramp((4, 4, 2));
        let c = crop(data.view(), [0, 0, 0], [3, 3, 5]);
        assert_eq!(c.dim(), (3, 3, 2));
        assert_eq!(clamp_extent([4, 4, 2], [3, 3, 5]), [3, 3, 2]);
    }

    #[test]
    fn test_kernel_is_normalized() {
        let k = gaussian_kernel(2.0);
        assert_eq!(k.len(), 17);
        assert!((k.sum() - 1.0).abs() < 1e-5);
        assert!(k[8] > k[7]);
    }

    #[test]
    fn test_smoothing_preserves_constant_interior() {
        let mut data = Array3::from_elem((20, 20, 20), 1.0f32);
        gaussian_smooth(&mut data, 1.0);
        assert!((data[[10, 10, 10]] - 1.0).abs() < 1e-4);
        // Zero padding pulls the border down.
        assert!(data[[0, 0, 0]] < 0.9);
    }
}
