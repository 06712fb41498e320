//! Random augmentation of co-registered modality/label crops.
//!
//! One transform is drawn per call and applied identically to every modality
//! and to the label, so spatial alignment survives augmentation.

use crate::error::{Error, Result};
use crate::transforms::{flip, gaussian_smooth};
use ndarray::{Array3, ArrayView3};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;

/// Random number generator with optional seeding for reproducibility.
#[allow(clippy::option_if_let_else)] // match is clearer than map_or_else here
pub(crate) fn get_rng(seed: Option<u64>) -> ChaCha8Rng {
    match seed {
        Some(s) => ChaCha8Rng::seed_from_u64(s),
        None => ChaCha8Rng::from_entropy(),
    }
}

/// A transform family the pipeline can choose from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransformKind {
    /// Additive Gaussian noise on the modalities.
    GaussianNoise {
        /// Noise mean.
        mean: f32,
        /// Noise standard deviation.
        std: f32,
    },
    /// Flip each spatial axis with probability 0.5.
    Flip,
    /// Smooth random displacement field.
    Elastic {
        /// Displacement scale.
        alpha: f32,
        /// Gaussian smoothing of the raw field.
        sigma: f32,
    },
}

/// A concrete, already-sampled transform.
#[derive(Debug, Clone)]
pub enum Transform {
    /// Inputs pass through untouched.
    Identity,
    /// Noise with a fixed base seed; each modality gets its own stream.
    Noise {
        /// Noise mean.
        mean: f32,
        /// Noise standard deviation.
        std: f32,
        /// Base seed for the per-chunk generators.
        seed: u64,
    },
    /// Axes to reverse.
    Flip {
        /// One flag per spatial axis.
        axes: [bool; 3],
    },
    /// Per-voxel displacement along each axis.
    Elastic {
        /// `[dx, dy, dz]`, each shaped like the inputs.
        field: Box<[Array3<f32>; 3]>,
    },
}

/// Offset between per-modality noise seeds so their chunk seeds never overlap.
const MODALITY_SEED_STRIDE: u64 = 1 << 32;

impl Transform {
    /// Apply to the `index`-th modality array.
    pub fn apply_to_modality(&self, data: &Array3<f32>, index: usize) -> Result<Array3<f32>> {
        match self {
            Self::Identity => Ok(data.clone()),
            Self::Noise { mean, std, seed } => {
                let mut out = data.clone();
                let seed = seed.wrapping_add(index as u64 * MODALITY_SEED_STRIDE);
                add_gaussian_noise(&mut out, *mean, *std, seed)?;
                Ok(out)
            }
            Self::Flip { axes } => Ok(flip(data.view(), *axes)),
            Self::Elastic { field } => resample(data.view(), field, Interpolation::Linear),
        }
    }

    /// Apply to the label array. Never introduces new label values.
    pub fn apply_to_label(&self, label: &Array3<f32>) -> Result<Array3<f32>> {
        match self {
            Self::Identity | Self::Noise { .. } => Ok(label.clone()),
            Self::Flip { axes } => Ok(flip(label.view(), *axes)),
            Self::Elastic { field } => resample(label.view(), field, Interpolation::Nearest),
        }
    }
}

/// Randomly applies one of a set of transforms with probability `p`.
///
/// # Example
///
/// ```ignore
/// let pipeline = AugmentationPipeline::builder().prob(0.5).no_elastic().build();
/// let (modalities, label) = pipeline.apply(modalities, label, Some(42))?;
/// ```
#[derive(Debug, Clone)]
pub struct AugmentationPipeline {
    transforms: Vec<TransformKind>,
    p: f32,
}

impl Default for AugmentationPipeline {
    /// Noise (mean 0, std 0.01), flip and elastic (alpha 1, sigma 20), p = 0.5.
    fn default() -> Self {
        Self::builder().build()
    }
}

impl AugmentationPipeline {
    /// Start a builder with the default transform set.
    pub fn builder() -> AugmentationPipelineBuilder {
        AugmentationPipelineBuilder::new()
    }

    /// Probability that any transform is applied.
    pub fn prob(&self) -> f32 {
        self.p
    }

    /// Configured transform families.
    pub fn transforms(&self) -> &[TransformKind] {
        &self.transforms
    }

    /// Draw the transform for inputs of `shape`.
    pub fn sample<R: Rng>(&self, shape: [usize; 3], rng: &mut R) -> Transform {
        if self.transforms.is_empty() || rng.gen::<f32>() >= self.p {
            return Transform::Identity;
        }
        match self.transforms[rng.gen_range(0..self.transforms.len())] {
            TransformKind::GaussianNoise { mean, std } => Transform::Noise {
                mean,
                std,
                seed: rng.gen(),
            },
            TransformKind::Flip => {
                let mut axes = [false; 3];
                axes[rng.gen_range(0..3)] = true;
                Transform::Flip { axes }
            }
            TransformKind::Elastic { alpha, sigma } => Transform::Elastic {
                field: Box::new([
                    displacement(shape, alpha, sigma, rng),
                    displacement(shape, alpha, sigma, rng),
                    displacement(shape, alpha, sigma, rng),
                ]),
            },
        }
    }

    /// Augment one sample. All arrays must share a shape.
    pub fn apply(
        &self,
        modalities: Vec<Array3<f32>>,
        label: Array3<f32>,
        seed: Option<u64>,
    ) -> Result<(Vec<Array3<f32>>, Array3<f32>)> {
        let dim = label.dim();
        if let Some(bad) = modalities.iter().find(|m| m.dim() != dim) {
            return Err(Error::ShapeMismatch(format!(
                "modality shape {:?} differs from label shape {:?}",
                bad.dim(),
                dim
            )));
        }

        let mut rng = get_rng(seed);
        let transform = self.sample([dim.0, dim.1, dim.2], &mut rng);
        if matches!(transform, Transform::Identity) {
            return Ok((modalities, label));
        }

        let modalities = modalities
            .iter()
            .enumerate()
            .map(|(i, m)| transform.apply_to_modality(m, i))
            .collect::<Result<Vec<_>>>()?;
        let label = transform.apply_to_label(&label)?;
        Ok((modalities, label))
    }
}

/// Builder for [`AugmentationPipeline`].
#[derive(Debug, Clone)]
pub struct AugmentationPipelineBuilder {
    p: f32,
    noise: Option<(f32, f32)>,
    flip: bool,
    elastic: Option<(f32, f32)>,
}

impl Default for AugmentationPipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AugmentationPipelineBuilder {
    /// Default set: noise, flip and elastic, applied half the time.
    pub fn new() -> Self {
        Self {
            p: 0.5,
            noise: Some((0.0, 0.01)),
            flip: true,
            elastic: Some((1.0, 20.0)),
        }
    }

    /// Set the probability of applying a transform.
    pub fn prob(mut self, p: f32) -> Self {
        self.p = p;
        self
    }

    /// Set Gaussian noise mean and standard deviation.
    pub fn noise(mut self, mean: f32, std: f32) -> Self {
        self.noise = Some((mean, std));
        self
    }

    /// Set elastic deformation strength and smoothness.
    pub fn elastic(mut self, alpha: f32, sigma: f32) -> Self {
        self.elastic = Some((alpha, sigma));
        self
    }

    /// Disable Gaussian noise.
    pub fn no_noise(mut self) -> Self {
        self.noise = None;
        self
    }

    /// Disable random flipping.
    pub fn no_flip(mut self) -> Self {
        self.flip = false;
        self
    }

    /// Disable elastic deformation.
    pub fn no_elastic(mut self) -> Self {
        self.elastic = None;
        self
    }

    /// Finish building.
    pub fn build(self) -> AugmentationPipeline {
        let mut transforms = Vec::with_capacity(3);
        if let Some((mean, std)) = self.noise {
            transforms.push(TransformKind::GaussianNoise { mean, std });
        }
        if self.flip {
            transforms.push(TransformKind::Flip);
        }
        if let Some((alpha, sigma)) = self.elastic {
            transforms.push(TransformKind::Elastic { alpha, sigma });
        }
        AugmentationPipeline {
            transforms,
            p: self.p.clamp(0.0, 1.0),
        }
    }
}

/// Add N(mean, std) noise in place. Deterministic for a given seed
/// regardless of the rayon pool size.
pub fn add_gaussian_noise(data: &mut Array3<f32>, mean: f32, std: f32, seed: u64) -> Result<()> {
    const CHUNK_SIZE: usize = 8192;

    let slice = data.as_slice_memory_order_mut().ok_or_else(|| {
        Error::InvalidDimensions("array must be contiguous for noise operation".to_string())
    })?;

    let fill = |chunk_idx: usize, chunk: &mut [f32]| {
        let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(chunk_idx as u64));
        for v in chunk {
            let u1: f32 = rng.gen::<f32>().max(1e-10);
            let u2: f32 = rng.gen();
            let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos();
            *v += mean + z * std;
        }
    };

    if slice.len() > CHUNK_SIZE {
        slice
            .par_chunks_mut(CHUNK_SIZE)
            .enumerate()
            .for_each(|(i, chunk)| fill(i, chunk));
    } else {
        fill(0, slice);
    }
    Ok(())
}

fn displacement<R: Rng>(shape: [usize; 3], alpha: f32, sigma: f32, rng: &mut R) -> Array3<f32> {
    let mut field =
        Array3::from_shape_simple_fn((shape[0], shape[1], shape[2]), || rng.gen_range(-1.0..=1.0));
    gaussian_smooth(&mut field, sigma);
    field *= alpha;
    field
}

#[derive(Debug, Clone, Copy)]
enum Interpolation {
    Linear,
    Nearest,
}

fn resample(
    data: ArrayView3<'_, f32>,
    field: &[Array3<f32>; 3],
    interp: Interpolation,
) -> Result<Array3<f32>> {
    let dim = data.dim();
    if field.iter().any(|f| f.dim() != dim) {
        return Err(Error::ShapeMismatch(format!(
            "displacement field does not match array shape {dim:?}"
        )));
    }
    let shape = [dim.0, dim.1, dim.2];
    if shape.contains(&0) {
        return Ok(data.to_owned());
    }

    // Out-of-grid samples replicate the edge voxel.
    let clamp = |c: f32, a: usize| c.clamp(0.0, (shape[a] - 1) as f32);
    Ok(Array3::from_shape_fn(dim, |(i, j, k)| {
        let coord = [
            clamp(i as f32 + field[0][[i, j, k]], 0),
            clamp(j as f32 + field[1][[i, j, k]], 1),
            clamp(k as f32 + field[2][[i, j, k]], 2),
        ];
        match interp {
            Interpolation::Nearest => {
                let idx = |a: usize| (coord[a].round() as usize).min(shape[a] - 1);
                data[[idx(0), idx(1), idx(2)]]
            }
            Interpolation::Linear => trilinear(&data, coord, shape),
        }
    }))
}

fn trilinear(data: &ArrayView3<'_, f32>, coord: [f32; 3], shape: [usize; 3]) -> f32 {
    let mut lo = [0usize; 3];
    let mut hi = [0usize; 3];
    let mut w = [0f32; 3];
    for a in 0..3 {
        let base = (coord[a].floor() as usize).min(shape[a].saturating_sub(2));
        lo[a] = base;
        hi[a] = (base + 1).min(shape[a] - 1);
        w[a] = coord[a] - base as f32;
    }

    let mut acc = 0.0;
    for (dx, x) in [(1.0 - w[0], lo[0]), (w[0], hi[0])] {
        for (dy, y) in [(1.0 - w[1], lo[1]), (w[1], hi[1])] {
            for (dz, z) in [(1.0 - w[2], lo[2]), (w[2], hi[2])] {
                acc += dx * dy * dz * data[[x, y, z]];
            }
        }
    }
    acc
}
