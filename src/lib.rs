//! # vision-finetune-rs
//!
//! Transfer-learning fine-tuner for image classifiers, built on candle.
//!
//! A run takes a directory-structured image dataset, optionally transfers
//! pretrained parameters into a freshly built classifier, freezes everything
//! except the classification layer and trains with momentum SGD under a cosine
//! learning-rate schedule. The full parameter set is checkpointed after every
//! epoch.
//!
//! ## Features
//!
//! - **Partial weight transfer** - Only parameters with matching element counts
//!   are copied; the rest keep their initial values and are reported
//! - **Layer freezing** - Frozen parameters enter the forward pass as constants
//! - **Divergence guard** - A non-finite loss stops the run with a typed error
//! - **YAML Configuration** - Every setting has a default and a CLI flag
//!
//! ## Quick Start (CLI)
//!
//! ```bash
//! # Write a default configuration
//! vision-finetune init finetune.yaml
//!
//! # Train, overriding file values with flags
//! vision-finetune train --config finetune.yaml --epochs 10 --device cpu
//!
//! # List the parameters of a pretrained file
//! vision-finetune inspect pretrained.safetensors
//! ```
//!
//! ## Quick Start (Library)
//!
//! ```no_run
//! use vision_finetune_rs::FinetuneConfig;
//!
//! # fn main() -> vision_finetune_rs::Result<()> {
//! let mut config = FinetuneConfig::from_file("finetune.yaml")?;
//! config.training.epochs = 5;
//!
//! for report in vision_finetune_rs::run(config)? {
//!     println!("epoch {}: accuracy {:.3}", report.epoch, report.accuracy);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Custom classifiers and data
//!
//! Anything implementing [`Classifier`] can be trained by [`Trainer`], and any
//! [`SampleSource`] can feed it:
//!
//! ```rust
//! use candle_core::{Device, Tensor};
//! use vision_finetune_rs::{CompactNet, FinetuneConfig, TensorSource, Trainer};
//!
//! # fn main() -> vision_finetune_rs::Result<()> {
//! let dir = tempfile::tempdir()?;
//! let mut config = FinetuneConfig {
//!     num_classes: 2,
//!     device: "cpu".into(),
//!     output_dir: dir.path().to_string_lossy().into(),
//!     ..Default::default()
//! };
//! config.training.epochs = 1;
//! config.training.show_progress = false;
//!
//! let images = Tensor::zeros((4, 3, 32, 32), candle_core::DType::F32, &Device::Cpu)?;
//! let labels = Tensor::new(&[0u32, 1, 0, 1], &Device::Cpu)?;
//! let mut train = TensorSource::new(images.clone(), labels.clone(), 2)?;
//! let mut val = TensorSource::new(images, labels, 2)?;
//!
//! let mut trainer: Trainer<CompactNet> = Trainer::with_device(config, Device::Cpu)?;
//! let reports = trainer.train(&mut train, &mut val)?;
//! assert_eq!(reports.len(), 1);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod error;
pub mod model;
pub mod optimizer;
pub mod params;
pub mod scheduler;
pub mod trainer;

pub use config::{DataConfig, FinetuneConfig, TrainingConfig};
pub use dataset::{Batch, ClassIndex, ImageFolder, SampleSource, TensorSource};
pub use error::{DivergenceError, FinetuneError, Result};
pub use model::{Classifier, CompactNet};
pub use params::{
    transfer_weights, FreezePolicy, ParameterSnapshot, ParameterStore, TransferOutcome,
    TransferReport,
};
pub use scheduler::{cosine_multiplier, LRScheduler};
pub use trainer::{run, EpochReport, Trainer};
