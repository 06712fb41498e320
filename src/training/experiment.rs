//! Experiment wrapper: input assembly, step functions and optimizer choice.

use crate::config::ExperimentParams;
use crate::data::Batch;
use crate::error::{Error, Result};
use crate::training::channels::channel_selection;
use crate::training::loss::LossFn;
use crate::training::model::SegmentationModel;
use crate::training::optim::Optimizer;
use ndarray::{concatenate, Array5, ArrayView5, Axis};

/// Loss and per-channel score of one step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    /// Scalar loss.
    pub loss: f32,
    /// Per-channel score from the loss (Dice for [`crate::training::DiceLoss`]).
    pub per_channel: Vec<f32>,
}

/// Binds a model, a loss and the experiment hyperparameters.
#[derive(Debug)]
pub struct Experiment<M, L> {
    model: M,
    loss: L,
    params: ExperimentParams,
    selection: &'static [usize],
}

impl<M: SegmentationModel, L: LossFn> Experiment<M, L> {
    /// Validate the modality/channel combination against the model.
    pub fn new(model: M, loss: L, params: ExperimentParams) -> Result<Self> {
        let selection = channel_selection(params.modalities, params.in_channels)?;
        if model.in_channels() != params.in_channels {
            return Err(Error::Configuration(format!(
                "model takes {} input channels, experiment selects {}",
                model.in_channels(),
                params.in_channels
            )));
        }
        Ok(Self {
            model,
            loss,
            params,
            selection,
        })
    }

    /// Hyperparameters.
    pub fn params(&self) -> &ExperimentParams {
        &self.params
    }

    /// Wrapped model.
    pub fn model(&self) -> &M {
        &self.model
    }

    /// Mutable access to the wrapped model.
    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    /// Concatenate the selected modality tensors along the channel axis.
    pub fn prepare_input(&self, batch: &Batch) -> Result<Array5<f32>> {
        if batch.modalities() != self.params.modalities {
            return Err(Error::ShapeMismatch(format!(
                "batch has {} modality tensors, experiment configured for {}",
                batch.modalities(),
                self.params.modalities
            )));
        }
        let views: Vec<ArrayView5<'_, f32>> = self
            .selection
            .iter()
            .map(|&i| batch.inputs[i].view())
            .collect();
        concatenate(Axis(1), &views).map_err(|e| Error::ShapeMismatch(e.to_string()))
    }

    fn evaluate(
        &self,
        input: ArrayView5<'_, f32>,
        batch: &Batch,
    ) -> Result<(Array5<f32>, StepOutput)> {
        let output = self.model.forward(input)?;
        let (loss, per_channel) = self.loss.evaluate(output.view(), batch.target.view())?;
        Ok((output, StepOutput { loss, per_channel }))
    }

    /// Forward, loss and backward. Gradients are left on the model for
    /// [`Experiment::optimizer_step`].
    pub fn training_step(&mut self, batch: &Batch) -> Result<StepOutput> {
        let input = self.prepare_input(batch)?;
        let (output, step) = self.evaluate(input.view(), batch)?;
        let grad = self.loss.gradient(output.view(), batch.target.view())?;
        self.model.zero_grad();
        self.model.backward(input.view(), grad.view())?;
        Ok(step)
    }

    /// Forward and loss only.
    pub fn validation_step(&self, batch: &Batch) -> Result<StepOutput> {
        let input = self.prepare_input(batch)?;
        Ok(self.evaluate(input.view(), batch)?.1)
    }

    /// Build the configured optimizer.
    pub fn build_optimizer(&self) -> Result<Optimizer> {
        Optimizer::from_params(&self.params)
    }

    /// Apply the gradients of the last training step.
    pub fn optimizer_step(&mut self, optimizer: &mut Optimizer) -> Result<()> {
        self.model.apply_gradients(optimizer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::loss::DiceLoss;
    use crate::training::model::PointwiseConv3d;
    use ndarray::Array4;

    fn params(modalities: usize, channels: usize) -> ExperimentParams {
        ExperimentParams {
            optimizer: "sgd".to_string(),
            lr: 0.5,
            momentum: 0.0,
            weight_decay: 0.0,
            alpha: 0.99,
            modalities,
            in_channels: channels,
        }
    }

    fn experiment(
        model: PointwiseConv3d,
        params: ExperimentParams,
    ) -> Experiment<PointwiseConv3d, DiceLoss> {
        Experiment::new(model, DiceLoss::new(2), params).unwrap()
    }

    fn batch(modalities: usize) -> Batch {
        Batch {
            inputs: (0..modalities)
                .map(|m| Array5::from_elem((2, 1, 2, 2, 2), m as f32))
                .collect(),
            target: Array4::from_shape_fn((2, 2, 2, 2), |(b, z, _, _)| ((b + z) % 2) as f32),
        }
    }

    #[test]
    fn test_four_to_three_drops_second_modality() {
        let exp = experiment(PointwiseConv3d::new(3, 2, Some(0)), params(4, 3));
        let input = exp.prepare_input(&batch(4)).unwrap();
        assert_eq!(input.dim(), (2, 3, 2, 2, 2));
        assert_eq!(input[[0, 0, 0, 0, 0]], 0.0);
        assert_eq!(input[[0, 1, 0, 0, 0]], 2.0);
        assert_eq!(input[[0, 2, 0, 0, 0]], 3.0);
    }

    #[test]
    fn test_model_channel_mismatch_is_configuration_error() {
        let model = PointwiseConv3d::new(4, 2, None);
        let result = Experiment::new(model, DiceLoss::new(2), params(4, 2));
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_training_reduces_loss() {
        let mut exp = experiment(PointwiseConv3d::new(1, 2, Some(1)), params(1, 1));
        let mut b = batch(1);
        // Intensity equals the label so a linear model can separate classes.
        b.inputs[0] = b.target.clone().insert_axis(Axis(1)) * 4.0 - 2.0;

        let mut opt = exp.build_optimizer().unwrap();
        let first = exp.training_step(&b).unwrap().loss;
        for _ in 0..200 {
            exp.training_step(&b).unwrap();
            exp.optimizer_step(&mut opt).unwrap();
        }
        let last = exp.validation_step(&b).unwrap().loss;
        assert!(last < first, "loss went from {first} to {last}");
    }

    #[test]
    fn test_validation_leaves_gradients_alone() {
        let mut exp = experiment(PointwiseConv3d::new(2, 2, Some(0)), params(2, 2));
        exp.training_step(&batch(2)).unwrap();
        let grads = exp.model().grads().to_vec();
        exp.validation_step(&batch(2)).unwrap();
        assert_eq!(exp.model().grads(), grads.as_slice());
    }
}
