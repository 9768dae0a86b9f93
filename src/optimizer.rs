//! Momentum SGD with L2 weight decay.

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::Optimizer;

use crate::config::TrainingConfig;
use crate::error::{FinetuneError, Result};

/// Optimizer configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamsSgd {
    /// Learning rate
    pub lr: f64,
    /// Momentum factor
    pub momentum: f64,
    /// L2 penalty added to the gradient
    pub weight_decay: f64,
}

impl Default for ParamsSgd {
    fn default() -> Self {
        Self {
            lr: 0.1,
            momentum: 0.9,
            weight_decay: 1e-4,
        }
    }
}

impl From<&TrainingConfig> for ParamsSgd {
    fn from(config: &TrainingConfig) -> Self {
        Self {
            lr: config.learning_rate,
            momentum: config.momentum,
            weight_decay: config.weight_decay,
        }
    }
}

impl ParamsSgd {
    /// Create the optimizer over `vars`.
    ///
    /// # Errors
    ///
    /// Returns an error if the optimizer cannot be created.
    pub fn build(self, vars: Vec<Var>) -> Result<MomentumSgd> {
        MomentumSgd::new(vars, self)
            .map_err(|e| FinetuneError::Model(format!("Failed to create SGD: {e}")))
    }
}

#[derive(Debug)]
struct VarState {
    var: Var,
    velocity: Option<Tensor>,
}

/// Stochastic gradient descent with momentum and weight decay.
///
/// Per parameter `p` with gradient `g`:
/// `d = g + weight_decay * p`, `v = momentum * v + d` (`v = d` on the first
/// step), `p = p - lr * v`.
#[derive(Debug)]
pub struct MomentumSgd {
    vars: Vec<VarState>,
    params: ParamsSgd,
}

impl MomentumSgd {
    /// Number of parameters being optimized.
    #[must_use]
    pub fn num_vars(&self) -> usize {
        self.vars.len()
    }

    /// Current configuration.
    #[must_use]
    pub fn params(&self) -> &ParamsSgd {
        &self.params
    }
}

impl Optimizer for MomentumSgd {
    type Config = ParamsSgd;

    fn new(vars: Vec<Var>, params: ParamsSgd) -> candle_core::Result<Self> {
        let vars = vars
            .into_iter()
            .filter(|var| var.dtype().is_float())
            .map(|var| VarState {
                var,
                velocity: None,
            })
            .collect();
        Ok(Self { vars, params })
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        let ParamsSgd {
            lr,
            momentum,
            weight_decay,
        } = self.params;
        for state in &mut self.vars {
            let theta = &state.var;
            let Some(grad) = grads.get(theta) else {
                continue;
            };
            let d = if weight_decay == 0.0 {
                grad.clone()
            } else {
                grad.add(&theta.as_tensor().affine(weight_decay, 0.0)?)?
            };
            let v = match &state.velocity {
                Some(prev) if momentum != 0.0 => prev.affine(momentum, 0.0)?.add(&d)?,
                _ => d,
            };
            theta.set(&theta.as_tensor().sub(&v.affine(lr, 0.0)?)?)?;
            state.velocity = Some(v.detach());
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }
}
