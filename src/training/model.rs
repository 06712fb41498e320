//! The model seam and a per-voxel linear baseline.

use crate::error::{Error, Result};
use crate::training::optim::Optimizer;
use crate::transforms::augment::get_rng;
use ndarray::{Array5, ArrayView5, Axis, Zip};
use rand::Rng;

/// A segmentation network mapping `[B, in, D, H, W]` to `[B, out, D, H, W]`.
///
/// Models that train must accumulate gradients in `backward` and consume them
/// in `apply_gradients`; frozen models can keep the no-op defaults.
pub trait SegmentationModel {
    /// Input channels expected by `forward`.
    fn in_channels(&self) -> usize;

    /// Output channels (classes).
    fn out_channels(&self) -> usize;

    /// Forward pass.
    fn forward(&self, input: ArrayView5<'_, f32>) -> Result<Array5<f32>>;

    /// Accumulate parameter gradients given `d loss / d output`.
    fn backward(
        &mut self,
        _input: ArrayView5<'_, f32>,
        _grad_output: ArrayView5<'_, f32>,
    ) -> Result<()> {
        Ok(())
    }

    /// Clear accumulated gradients.
    fn zero_grad(&mut self) {}

    /// Update parameters with the accumulated gradients.
    fn apply_gradients(&mut self, _optimizer: &mut Optimizer) -> Result<()> {
        Ok(())
    }
}

/// 1x1x1 convolution: every voxel is mapped independently from input
/// channels to class logits.
#[derive(Debug, Clone, PartialEq)]
pub struct PointwiseConv3d {
    in_channels: usize,
    out_channels: usize,
    /// Weights `[out][in]` row-major, then one bias per output channel.
    params: Vec<f32>,
    grads: Vec<f32>,
}

impl PointwiseConv3d {
    /// Uniform init in `[-1/sqrt(in), 1/sqrt(in)]`.
    pub fn new(in_channels: usize, out_channels: usize, seed: Option<u64>) -> Self {
        let bound = 1.0 / (in_channels.max(1) as f32).sqrt();
        let mut rng = get_rng(seed);
        let len = out_channels * (in_channels + 1);
        let params = (0..len).map(|_| rng.gen_range(-bound..=bound)).collect();
        Self {
            in_channels,
            out_channels,
            params,
            grads: vec![0.0; len],
        }
    }

    /// Flat parameter vector (weights then biases).
    pub fn params(&self) -> &[f32] {
        &self.params
    }

    /// Accumulated gradients, same layout as [`Self::params`].
    pub fn grads(&self) -> &[f32] {
        &self.grads
    }

    fn weight(&self, o: usize, i: usize) -> f32 {
        self.params[o * self.in_channels + i]
    }

    fn bias_offset(&self) -> usize {
        self.out_channels * self.in_channels
    }

    fn check_input(&self, input: &ArrayView5<'_, f32>) -> Result<()> {
        if input.len_of(Axis(1)) != self.in_channels {
            return Err(Error::ShapeMismatch(format!(
                "model expects {} input channels, got {}",
                self.in_channels,
                input.len_of(Axis(1))
            )));
        }
        Ok(())
    }
}

impl SegmentationModel for PointwiseConv3d {
    fn in_channels(&self) -> usize {
        self.in_channels
    }

    fn out_channels(&self) -> usize {
        self.out_channels
    }

    fn forward(&self, input: ArrayView5<'_, f32>) -> Result<Array5<f32>> {
        self.check_input(&input)?;
        let (b, _, d, h, w) = input.dim();
        let mut out = Array5::<f32>::zeros((b, self.out_channels, d, h, w));
        let bias = self.bias_offset();

        for (o, mut channel) in out.axis_iter_mut(Axis(1)).enumerate() {
            channel.fill(self.params[bias + o]);
            for (i, x) in input.axis_iter(Axis(1)).enumerate() {
                channel.scaled_add(self.weight(o, i), &x);
            }
        }
        Ok(out)
    }

    fn backward(
        &mut self,
        input: ArrayView5<'_, f32>,
        grad_output: ArrayView5<'_, f32>,
    ) -> Result<()> {
        self.check_input(&input)?;
        let (b, _, d, h, w) = input.dim();
        if grad_output.dim() != (b, self.out_channels, d, h, w) {
            return Err(Error::ShapeMismatch(format!(
                "grad_output shape {:?} does not match forward output",
                grad_output.dim()
            )));
        }

        let bias = self.bias_offset();
        for (o, g) in grad_output.axis_iter(Axis(1)).enumerate() {
            self.grads[bias + o] += g.sum();
            for (i, x) in input.axis_iter(Axis(1)).enumerate() {
                let dw = Zip::from(&g).and(&x).fold(0.0, |acc, &a, &b| acc + a * b);
                self.grads[o * self.in_channels + i] += dw;
            }
        }
        Ok(())
    }

    fn zero_grad(&mut self) {
        self.grads.iter_mut().for_each(|g| *g = 0.0);
    }

    fn apply_gradients(&mut self, optimizer: &mut Optimizer) -> Result<()> {
        optimizer.step(&self.grads, &mut self.params)
    }
}
