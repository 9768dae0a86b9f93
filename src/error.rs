//! Error types for vision-finetune-rs.
//!
//! Everything fallible in the crate returns [`Result`], whose error side is
//! [`FinetuneError`]. A diverged run is reported through the dedicated
//! [`DivergenceError`] so callers can tell it apart from ordinary failures.
//!
//! # Example - Pattern Matching
//!
//! ```rust
//! use vision_finetune_rs::{FinetuneConfig, FinetuneError};
//!
//! let mut config = FinetuneConfig::default();
//! config.training.epochs = 0;
//!
//! match config.validate() {
//!     Ok(()) => println!("config ok"),
//!     Err(FinetuneError::Config(msg)) => eprintln!("Configuration error: {msg}"),
//!     Err(e) => eprintln!("Other error: {e}"),
//! }
//! ```

use thiserror::Error;

/// Result type alias for vision-finetune-rs operations.
pub type Result<T> = std::result::Result<T, FinetuneError>;

/// A non-finite loss was observed during training.
///
/// Fatal by construction: the orchestrator stops the run without writing a
/// checkpoint for the epoch in which it happened.
#[derive(Error, Debug, Clone, Copy, PartialEq)]
#[error("non-finite loss {loss} at epoch {epoch}, batch {batch}")]
pub struct DivergenceError {
    /// Zero-based epoch index.
    pub epoch: usize,
    /// Zero-based batch index within the epoch.
    pub batch: usize,
    /// The offending loss value (NaN or infinite).
    pub loss: f32,
}

/// Errors that can occur in vision-finetune-rs.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum FinetuneError {
    /// Configuration error (bad values, missing paths, unknown device).
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid configuration file.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Dataset layout or decoding error.
    #[error("dataset error: {0}")]
    Dataset(String),

    /// Model construction or parameter store error.
    #[error("model error: {0}")]
    Model(String),

    /// Training diverged.
    #[error(transparent)]
    Divergence(#[from] DivergenceError),

    /// Checkpoint or snapshot persistence error.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Image decoding error.
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    /// JSON serialization error.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Progress bar template error.
    #[error("template error: {0}")]
    Template(String),

    /// Other errors.
    #[error("{0}")]
    Other(String),
}

impl FinetuneError {
    /// Whether this error is a training divergence.
    #[must_use]
    pub fn is_divergence(&self) -> bool {
        matches!(self, FinetuneError::Divergence(_))
    }
}

impl From<indicatif::style::TemplateError> for FinetuneError {
    fn from(err: indicatif::style::TemplateError) -> Self {
        FinetuneError::Template(err.to_string())
    }
}

impl From<rayon::ThreadPoolBuildError> for FinetuneError {
    fn from(err: rayon::ThreadPoolBuildError) -> Self {
        FinetuneError::Dataset(format!("failed to start decode workers: {err}"))
    }
}
