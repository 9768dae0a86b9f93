//! Configuration parsing and validation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{FinetuneError, Result};

/// File name of the per-epoch parameter checkpoint inside `output_dir`.
pub const CHECKPOINT_FILE: &str = "model_data.safetensors";

/// File name of the class index map inside `output_dir`.
pub const CLASS_INDEX_FILE: &str = "class_indices.json";

/// Main configuration for a fine-tuning run.
///
/// # Example
///
/// ```rust
/// use vision_finetune_rs::FinetuneConfig;
///
/// # fn main() -> vision_finetune_rs::Result<()> {
/// let mut config = FinetuneConfig::default();
/// config.num_classes = 2;
/// config.training.epochs = 5;
/// config.validate()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinetuneConfig {
    /// Number of output classes of the classifier.
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,

    /// Dataset configuration.
    #[serde(default)]
    pub data: DataConfig,

    /// Training hyperparameters.
    #[serde(default)]
    pub training: TrainingConfig,

    /// Pretrained snapshot to transfer from (`.safetensors`, `.pth`, `.pt`, `.bin`).
    #[serde(default)]
    pub weights: Option<String>,

    /// Freeze every parameter outside the classification layer.
    #[serde(default = "default_true")]
    pub freeze_layers: bool,

    /// Substring identifying classification-layer parameters.
    #[serde(default = "default_freeze_marker")]
    pub freeze_marker: String,

    /// Compute device: `cpu`, `cuda`, `cuda:N`, `N`, `metal` or `metal:N`.
    #[serde(default = "default_device")]
    pub device: String,

    /// Directory receiving the checkpoint and class index map.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Seed for the training shuffle order and, on CUDA or Metal, the device
    /// RNG used for parameter initialisation. CPU initialisation is unseeded.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_num_classes() -> usize {
    5
}
fn default_true() -> bool {
    true
}
fn default_freeze_marker() -> String {
    "fc".into()
}
fn default_device() -> String {
    "cuda:0".into()
}
fn default_output_dir() -> String {
    ".".into()
}
fn default_seed() -> u64 {
    42
}

impl Default for FinetuneConfig {
    fn default() -> Self {
        Self {
            num_classes: default_num_classes(),
            data: DataConfig::default(),
            training: TrainingConfig::default(),
            weights: None,
            freeze_layers: true,
            freeze_marker: default_freeze_marker(),
            device: default_device(),
            output_dir: default_output_dir(),
            seed: default_seed(),
        }
    }
}

/// Dataset configuration.
///
/// `path` must contain `train/` and `val/`, each with one subdirectory per class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Dataset root.
    #[serde(default = "default_data_path")]
    pub path: String,

    /// Side length of the square network input.
    #[serde(default = "default_image_size")]
    pub image_size: usize,

    /// Upper bound on decode workers; `None` derives it from the batch size.
    #[serde(default)]
    pub num_workers: Option<usize>,
}

fn default_data_path() -> String {
    "./data/flower_photos".into()
}
fn default_image_size() -> usize {
    224
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            path: default_data_path(),
            image_size: default_image_size(),
            num_workers: None,
        }
    }
}

impl DataConfig {
    /// Directory of the training split.
    #[must_use]
    pub fn train_dir(&self) -> PathBuf {
        Path::new(&self.path).join("train")
    }

    /// Directory of the validation split.
    #[must_use]
    pub fn val_dir(&self) -> PathBuf {
        Path::new(&self.path).join("val")
    }
}

/// Training hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Number of training epochs.
    #[serde(default = "default_epochs")]
    pub epochs: usize,

    /// Samples per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Base learning rate.
    #[serde(default = "default_lr")]
    pub learning_rate: f64,

    /// Floor of the cosine schedule as a fraction of the base learning rate.
    #[serde(default = "default_lr_floor")]
    pub lr_floor: f64,

    /// SGD momentum.
    #[serde(default = "default_momentum")]
    pub momentum: f64,

    /// L2 weight decay.
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,

    /// Draw progress bars.
    #[serde(default = "default_true")]
    pub show_progress: bool,
}

fn default_epochs() -> usize {
    30
}
fn default_batch_size() -> usize {
    16
}
fn default_lr() -> f64 {
    0.1
}
fn default_lr_floor() -> f64 {
    0.1
}
fn default_momentum() -> f64 {
    0.9
}
fn default_weight_decay() -> f64 {
    1e-4
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            batch_size: default_batch_size(),
            learning_rate: default_lr(),
            lr_floor: default_lr_floor(),
            momentum: default_momentum(),
            weight_decay: default_weight_decay(),
            show_progress: true,
        }
    }
}

impl FinetuneConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid YAML.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check numeric settings.
    ///
    /// Filesystem preconditions are checked separately by [`Self::check_paths`].
    ///
    /// ```rust
    /// use vision_finetune_rs::FinetuneConfig;
    ///
    /// let mut config = FinetuneConfig::default();
    /// assert!(config.validate().is_ok());
    ///
    /// config.training.lr_floor = 1.5;
    /// assert!(config.validate().is_err());
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`FinetuneError::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.num_classes == 0 {
            return Err(FinetuneError::Config("num_classes must be > 0".into()));
        }
        if self.training.epochs == 0 {
            return Err(FinetuneError::Config("training.epochs must be > 0".into()));
        }
        if self.training.batch_size == 0 {
            return Err(FinetuneError::Config(
                "training.batch_size must be > 0".into(),
            ));
        }
        if !(self.training.learning_rate.is_finite() && self.training.learning_rate > 0.0) {
            return Err(FinetuneError::Config(
                "training.learning_rate must be a positive number".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.training.lr_floor) {
            return Err(FinetuneError::Config(
                "training.lr_floor must be in [0, 1)".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.training.momentum) {
            return Err(FinetuneError::Config(
                "training.momentum must be in [0, 1)".into(),
            ));
        }
        if self.training.weight_decay < 0.0 {
            return Err(FinetuneError::Config(
                "training.weight_decay must be >= 0".into(),
            ));
        }
        if self.data.image_size == 0 {
            return Err(FinetuneError::Config("data.image_size must be > 0".into()));
        }
        if self.freeze_layers && self.freeze_marker.is_empty() {
            return Err(FinetuneError::Config(
                "freeze_marker is required when freeze_layers is set".into(),
            ));
        }
        Ok(())
    }

    /// Check that the dataset root and the optional weights file exist.
    ///
    /// # Errors
    ///
    /// Returns [`FinetuneError::Config`] naming the missing path.
    pub fn check_paths(&self) -> Result<()> {
        if !Path::new(&self.data.path).exists() {
            return Err(FinetuneError::Config(format!(
                "dataset root does not exist: {}",
                self.data.path
            )));
        }
        for split in [self.data.train_dir(), self.data.val_dir()] {
            if !split.is_dir() {
                return Err(FinetuneError::Config(format!(
                    "dataset split directory does not exist: {}",
                    split.display()
                )));
            }
        }
        if let Some(weights) = &self.weights {
            if !Path::new(weights).exists() {
                return Err(FinetuneError::Config(format!(
                    "weights file does not exist: {weights}"
                )));
            }
        }
        Ok(())
    }

    /// Location of the per-epoch checkpoint.
    #[must_use]
    pub fn checkpoint_path(&self) -> PathBuf {
        Path::new(&self.output_dir).join(CHECKPOINT_FILE)
    }

    /// Location of the class index map.
    #[must_use]
    pub fn class_index_path(&self) -> PathBuf {
        Path::new(&self.output_dir).join(CLASS_INDEX_FILE)
    }
}
