//! Sequential fit loop.

use crate::config::TrainerParams;
use crate::data::{Batch, DataModule};
use crate::error::Result;
use crate::training::experiment::{Experiment, StepOutput};
use crate::training::loss::LossFn;
use crate::training::model::SegmentationModel;
use crate::training::tracking::{Metrics, Tracker};
use tracing::{debug, info, info_span};

/// Aggregated metrics of one epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochMetrics {
    /// Zero-based epoch.
    pub epoch: usize,
    /// Mean training loss.
    pub train_loss: f32,
    /// Mean validation loss, if the validation split has batches.
    pub val_loss: Option<f32>,
    /// Mean validation score per output channel.
    pub val_per_channel: Vec<f32>,
}

/// Result of [`Trainer::fit`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FitSummary {
    /// One entry per completed epoch.
    pub epochs: Vec<EpochMetrics>,
    /// Optimizer steps taken.
    pub steps: usize,
}

#[derive(Default)]
struct Running {
    batches: usize,
    loss: f64,
    per_channel: Vec<f64>,
}

impl Running {
    fn add(&mut self, step: &StepOutput) {
        self.batches += 1;
        self.loss += f64::from(step.loss);
        if self.per_channel.len() < step.per_channel.len() {
            self.per_channel.resize(step.per_channel.len(), 0.0);
        }
        for (acc, &v) in self.per_channel.iter_mut().zip(&step.per_channel) {
            *acc += f64::from(v);
        }
    }

    fn mean_loss(&self) -> Option<f32> {
        (self.batches > 0).then(|| (self.loss / self.batches as f64) as f32)
    }

    fn mean_per_channel(&self) -> Vec<f32> {
        let n = self.batches.max(1) as f64;
        self.per_channel.iter().map(|v| (v / n) as f32).collect()
    }
}

/// Runs epochs of training and validation.
#[derive(Debug, Clone)]
pub struct Trainer {
    params: TrainerParams,
    seed: Option<u64>,
}

impl Trainer {
    /// Trainer with an optional shuffle seed (offset by the epoch).
    pub fn new(params: TrainerParams, seed: Option<u64>) -> Self {
        Self { params, seed }
    }

    /// Fit the experiment on the data module's splits.
    ///
    /// `setup` must already have run on `data`.
    pub fn fit<M, L>(
        &self,
        experiment: &mut Experiment<M, L>,
        data: &DataModule,
        tracker: &mut dyn Tracker,
    ) -> Result<FitSummary>
    where
        M: SegmentationModel,
        L: LossFn,
    {
        let mut optimizer = experiment.build_optimizer()?;
        info!(
            optimizer = optimizer.name(),
            lr = optimizer.lr(),
            epochs = self.params.max_epochs,
            "starting fit"
        );

        let mut summary = FitSummary::default();
        for epoch in 0..self.params.max_epochs {
            let span = info_span!("epoch", epoch);
            let _enter = span.enter();

            let mut train = Running::default();
            let seed = self.seed.map(|s| s.wrapping_add(epoch as u64));
            for batch in data.train_batches_seeded(seed)? {
                let step = experiment.training_step(&batch?)?;
                experiment.optimizer_step(&mut optimizer)?;
                summary.steps += 1;
                train.add(&step);

                if summary.steps % self.params.log_every_n_steps == 0 {
                    debug!(step = summary.steps, loss = step.loss, "train step");
                    let metrics = Metrics::from([
                        ("train/step_loss".to_string(), f64::from(step.loss)),
                        ("epoch".to_string(), epoch as f64),
                    ]);
                    tracker.log(summary.steps, &metrics)?;
                }
            }

            let mut val = Running::default();
            for batch in data.val_batches()? {
                let batch: Batch = batch?;
                val.add(&experiment.validation_step(&batch)?);
            }

            let metrics = EpochMetrics {
                epoch,
                train_loss: train.mean_loss().unwrap_or(f32::NAN),
                val_loss: val.mean_loss(),
                val_per_channel: val.mean_per_channel(),
            };
            info!(
                train_loss = metrics.train_loss,
                val_loss = ?metrics.val_loss,
                "epoch finished"
            );
            tracker.log(summary.steps, &epoch_metrics(&metrics))?;
            summary.epochs.push(metrics);
        }
        Ok(summary)
    }
}

fn epoch_metrics(m: &EpochMetrics) -> Metrics {
    let mut metrics = Metrics::new();
    metrics.insert("epoch".to_string(), m.epoch as f64);
    if m.train_loss.is_finite() {
        metrics.insert("train/loss".to_string(), f64::from(m.train_loss));
    }
    if let Some(loss) = m.val_loss {
        metrics.insert("val/loss".to_string(), f64::from(loss));
    }
    for (c, score) in m.val_per_channel.iter().enumerate() {
        metrics.insert(format!("val/dice_{c}"), f64::from(*score));
    }
    metrics
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_means() {
        let mut r = Running::default();
        assert_eq!(r.mean_loss(), None);
        r.add(&StepOutput {
            loss: 1.0,
            per_channel: vec![0.2, 0.4],
        });
        r.add(&StepOutput {
            loss: 0.0,
            per_channel: vec![0.4, 0.6],
        });
        assert_eq!(r.mean_loss(), Some(0.5));
        let pc = r.mean_per_channel();
        assert!((pc[0] - 0.3).abs() < 1e-6 && (pc[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_epoch_metrics_keys() {
        let m = epoch_metrics(&EpochMetrics {
            epoch: 2,
            train_loss: 0.7,
            val_loss: None,
            val_per_channel: vec![0.1],
        });
        assert_eq!(m["epoch"], 2.0);
        assert!(m.contains_key("train/loss"));
        assert!(!m.contains_key("val/loss"));
        assert!(m.contains_key("val/dice_0"));
    }
}
