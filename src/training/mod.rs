//! Experiment wrapper, optimizers, loss, baseline model, fit loop and
//! tracking.

pub mod channels;
pub mod experiment;
pub mod loss;
pub mod model;
pub mod optim;
pub mod trainer;
pub mod tracking;

pub use channels::channel_selection;
pub use experiment::{Experiment, StepOutput};
pub use loss::{DiceLoss, LossFn};
pub use model::{PointwiseConv3d, SegmentationModel};
pub use optim::{Adam, Optimizer, RmsProp, Sgd};
pub use trainer::{EpochMetrics, FitSummary, Trainer};
pub use tracking::{JsonlTracker, Metrics, RunInfo, Tracker};
