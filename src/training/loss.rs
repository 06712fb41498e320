//! Segmentation losses.

use crate::error::{Error, Result};
use ndarray::{Array5, ArrayView4, ArrayView5, Axis, Zip};

/// A loss over `[B, C, D, H, W]` logits and `[B, D, H, W]` integer labels.
pub trait LossFn {
    /// Scalar loss and a per-channel score.
    fn evaluate(&self, output: ArrayView5<'_, f32>, target: ArrayView4<'_, f32>)
        -> Result<(f32, Vec<f32>)>;

    /// Gradient of the loss with respect to `output`.
    fn gradient(&self, output: ArrayView5<'_, f32>, target: ArrayView4<'_, f32>)
        -> Result<Array5<f32>>;
}

/// Soft Dice over sigmoid probabilities against a one-hot target.
///
/// `loss = 1 - mean_c dice_c`, with each channel's Dice computed over the
/// whole batch.
#[derive(Debug, Clone, PartialEq)]
pub struct DiceLoss {
    classes: usize,
    smooth: f32,
}

impl DiceLoss {
    /// Dice loss over `classes` output channels.
    pub fn new(classes: usize) -> Self {
        Self {
            classes,
            smooth: 1e-6,
        }
    }

    /// Number of output channels expected.
    pub fn classes(&self) -> usize {
        self.classes
    }

    fn check(&self, output: &ArrayView5<'_, f32>, target: &ArrayView4<'_, f32>) -> Result<()> {
        let (b, c, d, h, w) = output.dim();
        if c != self.classes {
            return Err(Error::ShapeMismatch(format!(
                "output has {c} channels, loss expects {}",
                self.classes
            )));
        }
        if target.dim() != (b, d, h, w) {
            return Err(Error::ShapeMismatch(format!(
                "target shape {:?} does not match output {:?}",
                target.dim(),
                output.dim()
            )));
        }
        Ok(())
    }

    /// Per channel: `(intersection, sum of probabilities + sum of target)`.
    fn channel_sums(
        output: &ArrayView5<'_, f32>,
        target: &ArrayView4<'_, f32>,
        class: usize,
    ) -> (f32, f32) {
        let logits = output.index_axis(Axis(1), class);
        let class = class as f32;
        Zip::from(&logits)
            .and(target)
            .fold((0.0, 0.0), |(inter, total), &x, &t| {
                let p = sigmoid(x);
                let t = one_hot(t, class);
                (inter + p * t, total + p + t)
            })
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

fn one_hot(label: f32, class: f32) -> f32 {
    if label.round() == class {
        1.0
    } else {
        0.0
    }
}

impl LossFn for DiceLoss {
    fn evaluate(
        &self,
        output: ArrayView5<'_, f32>,
        target: ArrayView4<'_, f32>,
    ) -> Result<(f32, Vec<f32>)> {
        self.check(&output, &target)?;
        let dice: Vec<f32> = (0..self.classes)
            .map(|c| {
                let (inter, total) = Self::channel_sums(&output, &target, c);
                (2.0 * inter + self.smooth) / (total + self.smooth)
            })
            .collect();
        let mean = dice.iter().sum::<f32>() / dice.len().max(1) as f32;
        Ok((1.0 - mean, dice))
    }

    fn gradient(
        &self,
        output: ArrayView5<'_, f32>,
        target: ArrayView4<'_, f32>,
    ) -> Result<Array5<f32>> {
        self.check(&output, &target)?;
        let mut grad = Array5::<f32>::zeros(output.raw_dim());
        let scale = -1.0 / self.classes as f32;

        for c in 0..self.classes {
            let (inter, total) = Self::channel_sums(&output, &target, c);
            let num = 2.0 * inter + self.smooth;
            let den = total + self.smooth;
            let class = c as f32;
            Zip::from(grad.index_axis_mut(Axis(1), c))
                .and(output.index_axis(Axis(1), c))
                .and(&target)
                .for_each(|g, &x, &t| {
                    let p = sigmoid(x);
                    let t = one_hot(t, class);
                    // d(dice)/dp, chained through the sigmoid.
                    let ddice = (2.0 * t * den - num) / (den * den);
                    *g = scale * ddice * p * (1.0 - p);
                });
        }
        Ok(grad)
    }
}
