//! First-order optimizers over flat parameter slices.
//!
//! Update rules follow PyTorch's `SGD`, `Adam` and `RMSprop` with L2 weight
//! decay folded into the gradient. State buffers are sized on the first
//! step.

use crate::config::ExperimentParams;
use crate::error::{Error, Result};

fn check_lengths(state: &mut Vec<f32>, grad: &[f32], params: &[f32]) -> Result<()> {
    if grad.len() != params.len() {
        return Err(Error::ShapeMismatch(format!(
            "gradient has {} entries, parameters have {}",
            grad.len(),
            params.len()
        )));
    }
    if state.is_empty() {
        state.resize(params.len(), 0.0);
    } else if state.len() != params.len() {
        return Err(Error::ShapeMismatch(format!(
            "optimizer state holds {} entries, parameters have {}",
            state.len(),
            params.len()
        )));
    }
    Ok(())
}

/// Stochastic gradient descent with momentum.
#[derive(Debug, Clone, PartialEq)]
pub struct Sgd {
    /// Learning rate.
    pub lr: f32,
    /// Momentum factor; 0 disables the buffer.
    pub momentum: f32,
    /// L2 penalty.
    pub weight_decay: f32,
    velocity: Vec<f32>,
}

impl Sgd {
    /// Creates a new `Sgd` optimizer.
    pub fn new(lr: f32, momentum: f32, weight_decay: f32) -> Self {
        Self {
            lr,
            momentum,
            weight_decay,
            velocity: Vec::new(),
        }
    }

    fn step(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()> {
        check_lengths(&mut self.velocity, grad, params)?;
        let Self {
            lr,
            momentum: mu,
            weight_decay: wd,
            ..
        } = *self;

        params
            .iter_mut()
            .zip(grad)
            .zip(self.velocity.iter_mut())
            .for_each(|((p, &g), v)| {
                let g = g + wd * *p;
                *v = mu * *v + g;
                *p -= lr * if mu != 0.0 { *v } else { g };
            });
        Ok(())
    }
}

/// Adam with bias correction.
#[derive(Debug, Clone, PartialEq)]
pub struct Adam {
    /// Learning rate.
    pub lr: f32,
    /// First moment decay.
    pub beta1: f32,
    /// Second moment decay.
    pub beta2: f32,
    /// Denominator guard.
    pub eps: f32,
    /// L2 penalty.
    pub weight_decay: f32,
    beta1_t: f32,
    beta2_t: f32,
    m: Vec<f32>,
    v: Vec<f32>,
}

impl Adam {
    /// Creates a new `Adam` optimizer with betas (0.9, 0.999) and eps 1e-8.
    pub fn new(lr: f32, weight_decay: f32) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay,
            beta1_t: 1.0,
            beta2_t: 1.0,
            m: Vec::new(),
            v: Vec::new(),
        }
    }

    fn step(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()> {
        check_lengths(&mut self.m, grad, params)?;
        check_lengths(&mut self.v, grad, params)?;
        let Self {
            lr,
            beta1: b1,
            beta2: b2,
            eps,
            weight_decay: wd,
            ..
        } = *self;

        self.beta1_t *= b1;
        self.beta2_t *= b2;
        let bc1 = 1.0 - self.beta1_t;
        let bc2_sqrt = (1.0 - self.beta2_t).sqrt();

        params
            .iter_mut()
            .zip(grad)
            .zip(self.m.iter_mut().zip(self.v.iter_mut()))
            .for_each(|((p, &g), (m, v))| {
                let g = g + wd * *p;
                *m = b1 * *m + (1.0 - b1) * g;
                *v = b2 * *v + (1.0 - b2) * g * g;
                *p -= lr * (*m / bc1) / (v.sqrt() / bc2_sqrt + eps);
            });
        Ok(())
    }
}

/// RMSProp with optional momentum.
#[derive(Debug, Clone, PartialEq)]
pub struct RmsProp {
    /// Learning rate.
    pub lr: f32,
    /// Square-average smoothing constant.
    pub alpha: f32,
    /// Denominator guard.
    pub eps: f32,
    /// Momentum factor; 0 disables the buffer.
    pub momentum: f32,
    /// L2 penalty.
    pub weight_decay: f32,
    square_avg: Vec<f32>,
    buffer: Vec<f32>,
}

impl RmsProp {
    /// Creates a new `RmsProp` optimizer with eps 1e-8.
    pub fn new(lr: f32, alpha: f32, momentum: f32, weight_decay: f32) -> Self {
        Self {
            lr,
            alpha,
            eps: 1e-8,
            momentum,
            weight_decay,
            square_avg: Vec::new(),
            buffer: Vec::new(),
        }
    }

    fn step(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()> {
        check_lengths(&mut self.square_avg, grad, params)?;
        check_lengths(&mut self.buffer, grad, params)?;
        let Self {
            lr,
            alpha,
            eps,
            momentum: mu,
            weight_decay: wd,
            ..
        } = *self;

        params
            .iter_mut()
            .zip(grad)
            .zip(self.square_avg.iter_mut().zip(self.buffer.iter_mut()))
            .for_each(|((p, &g), (sq, buf))| {
                let g = g + wd * *p;
                *sq = alpha * *sq + (1.0 - alpha) * g * g;
                let scaled = g / (sq.sqrt() + eps);
                if mu > 0.0 {
                    *buf = mu * *buf + scaled;
                    *p -= lr * *buf;
                } else {
                    *p -= lr * scaled;
                }
            });
        Ok(())
    }
}

/// An optimizer built from the experiment's selector.
#[derive(Debug, Clone, PartialEq)]
pub enum Optimizer {
    /// Stochastic gradient descent.
    Sgd(Sgd),
    /// Adam.
    Adam(Adam),
    /// RMSProp.
    RmsProp(RmsProp),
}

impl Optimizer {
    /// Build from a case-insensitive name and the experiment hyperparameters.
    pub fn from_params(params: &ExperimentParams) -> Result<Self> {
        match params.optimizer.to_ascii_lowercase().as_str() {
            "sgd" => Ok(Self::Sgd(Sgd::new(
                params.lr,
                params.momentum,
                params.weight_decay,
            ))),
            "adam" => Ok(Self::Adam(Adam::new(params.lr, params.weight_decay))),
            "rmsprop" => Ok(Self::RmsProp(RmsProp::new(
                params.lr,
                params.alpha,
                params.momentum,
                params.weight_decay,
            ))),
            _ => Err(Error::UnrecognizedOptimizer(params.optimizer.clone())),
        }
    }

    /// Lowercase name of the algorithm.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sgd(_) => "sgd",
            Self::Adam(_) => "adam",
            Self::RmsProp(_) => "rmsprop",
        }
    }

    /// Current learning rate.
    pub fn lr(&self) -> f32 {
        match self {
            Self::Sgd(o) => o.lr,
            Self::Adam(o) => o.lr,
            Self::RmsProp(o) => o.lr,
        }
    }

    /// Apply one update to `params` in place.
    pub fn step(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()> {
        match self {
            Self::Sgd(o) => o.step(grad, params),
            Self::Adam(o) => o.step(grad, params),
            Self::RmsProp(o) => o.step(grad, params),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(name: &str) -> ExperimentParams {
        ExperimentParams {
            optimizer: name.to_string(),
            lr: 0.1,
            momentum: 0.0,
            weight_decay: 0.0,
            alpha: 0.99,
            modalities: 4,
            in_channels: 4,
        }
    }

    #[test]
    fn test_names_are_case_insensitive() {
        assert_eq!(Optimizer::from_params(&params("SGD")).unwrap().name(), "sgd");
        assert_eq!(Optimizer::from_params(&params("Adam")).unwrap().name(), "adam");
        assert_eq!(Optimizer::from_params(&params("RMSprop")).unwrap().name(), "rmsprop");
        assert!(matches!(
            Optimizer::from_params(&params("adagrad")),
            Err(Error::UnrecognizedOptimizer(name)) if name == "adagrad"
        ));
    }

    #[test]
    fn test_sgd_plain_step() {
        let mut opt = Sgd::new(0.1, 0.0, 0.0);
        let mut p = [1.0, 2.0];
        opt.step(&[1.0, -1.0], &mut p).unwrap();
        assert!((p[0] - 0.9).abs() < 1e-6);
        assert!((p[1] - 2.1).abs() < 1e-6);
    }

    #[test]
    fn test_sgd_momentum_accumulates() {
        let mut opt = Sgd::new(1.0, 0.5, 0.0);
        let mut p = [0.0];
        opt.step(&[1.0], &mut p).unwrap();
        opt.step(&[1.0], &mut p).unwrap();
        // v1 = 1, v2 = 1.5
        assert!((p[0] + 2.5).abs() < 1e-6);
    }

    #[test]
    fn test_sgd_weight_decay() {
        let mut opt = Sgd::new(0.1, 0.0, 0.5);
        let mut p = [2.0];
        opt.step(&[0.0], &mut p).unwrap();
        assert!((p[0] - 1.9).abs() < 1e-6);
    }

    #[test]
    fn test_adam_first_step_is_lr_sized() {
        let mut opt = Adam::new(0.01, 0.0);
        let mut p = [1.0, 1.0];
        opt.step(&[3.0, -0.5], &mut p).unwrap();
        assert!((p[0] - 0.99).abs() < 1e-5);
        assert!((p[1] - 1.01).abs() < 1e-5);
    }

    #[test]
    fn test_rmsprop_first_step() {
        let mut opt = RmsProp::new(0.01, 0.99, 0.0, 0.0);
        let mut p = [0.0];
        opt.step(&[2.0], &mut p).unwrap();
        // sq = 0.01 * 4 = 0.04, step = 0.01 * 2 / 0.2
        assert!((p[0] + 0.1).abs() < 1e-5);
    }

    #[test]
    fn test_length_mismatch() {
        let mut opt = Optimizer::from_params(&params("adam")).unwrap();
        let mut p = [0.0; 3];
        assert!(matches!(
            opt.step(&[0.0; 2], &mut p),
            Err(Error::ShapeMismatch(_))
        ));
        opt.step(&[0.0; 3], &mut p).unwrap();
        let mut q = [0.0; 4];
        assert!(opt.step(&[0.0; 4], &mut q).is_err());
    }
}
