//! Per-epoch cosine learning rate schedule.

use candle_nn::Optimizer;

/// Cosine multiplier for `epoch` out of `total_epochs`, floored at `floor`.
///
/// `((1 + cos(epoch * pi / total_epochs)) / 2) * (1 - floor) + floor`. Equals 1
/// at epoch 0 and `floor` at `total_epochs`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn cosine_multiplier(epoch: usize, total_epochs: usize, floor: f64) -> f64 {
    if total_epochs == 0 {
        return 1.0;
    }
    let angle = epoch as f64 * std::f64::consts::PI / total_epochs as f64;
    ((1.0 + angle.cos()) / 2.0) * (1.0 - floor) + floor
}

/// Learning rate scheduler stepped once per completed epoch.
#[derive(Debug, Clone)]
pub struct LRScheduler {
    /// Base learning rate
    base_lr: f64,
    /// Total number of epochs
    total_epochs: usize,
    /// Final multiplier
    floor: f64,
    /// Current epoch
    current_epoch: usize,
}

impl LRScheduler {
    /// Create a new scheduler positioned at epoch 0.
    #[must_use]
    pub fn new(base_lr: f64, total_epochs: usize, floor: f64) -> Self {
        Self {
            base_lr,
            total_epochs,
            floor,
            current_epoch: 0,
        }
    }

    /// Epochs stepped so far.
    #[must_use]
    pub fn epoch(&self) -> usize {
        self.current_epoch
    }

    /// Multiplier for the current epoch.
    #[must_use]
    pub fn multiplier(&self) -> f64 {
        cosine_multiplier(self.current_epoch, self.total_epochs, self.floor)
    }

    /// Get learning rate for the current epoch.
    #[must_use]
    pub fn get_lr(&self) -> f64 {
        self.base_lr * self.multiplier()
    }

    /// Advance one epoch, update the optimizer and return the new rate.
    pub fn step<O: Optimizer>(&mut self, optimizer: &mut O) -> f64 {
        self.current_epoch += 1;
        let lr = self.get_lr();
        optimizer.set_learning_rate(lr);
        lr
    }
}
