//! Error types for the training engine.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while building or training the network.
#[derive(Debug, Error)]
pub enum Vote3DeepError {
    /// Invalid engine or network configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A grid or filter bank has the wrong channel width.
    #[error("channel mismatch in {context}: expected {expected}, got {got}")]
    ChannelMismatch {
        /// Where the mismatch was detected.
        context: String,
        /// Channel count required by the network.
        expected: usize,
        /// Channel count found.
        got: usize,
    },

    /// A tensor does not have the shape the network requires.
    #[error("shape mismatch for {name}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        /// Tensor name.
        name: String,
        /// Expected shape.
        expected: Vec<usize>,
        /// Actual shape.
        got: Vec<usize>,
    },

    /// Checkpoint requested for resume does not exist.
    #[error("checkpoint not found: {}", path.display())]
    MissingCheckpoint {
        /// Path that was looked up.
        path: PathBuf,
    },

    /// Checkpoint exists but cannot be decoded into network parameters.
    #[error("corrupt checkpoint {}: {reason}", path.display())]
    CorruptCheckpoint {
        /// Checkpoint path.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// A crop could not be materialized into a sparse grid.
    #[error("crop {}: {reason}", path.display())]
    Crop {
        /// Crop path.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// Non-finite loss or gradient.
    #[error("numerical instability at epoch {epoch}, batch {batch}: {what}")]
    NumericalInstability {
        /// Epoch index.
        epoch: usize,
        /// Batch index within the epoch.
        batch: usize,
        /// Which quantity went non-finite.
        what: String,
    },

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (run config, mined pool) error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Writing an `.npz` archive failed.
    #[error("npz write error: {0}")]
    NpzWrite(#[from] ndarray_npy::WriteNpzError),
}

impl Vote3DeepError {
    /// Creates an invalid configuration error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig(reason.into())
    }

    /// Creates a corrupt checkpoint error.
    pub fn corrupt_checkpoint(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::CorruptCheckpoint {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Creates a crop loading error.
    pub fn crop(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Crop {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether a training loop may drop the offending crop and carry on.
    ///
    /// Only unreadable data qualifies; a channel or shape mismatch means the
    /// corpus does not fit the network and the run must stop.
    pub fn is_skippable_crop(&self) -> bool {
        matches!(self, Self::Crop { .. } | Self::Io(_))
    }
}

/// Result type for training engine operations.
pub type Result<T> = std::result::Result<T, Vote3DeepError>;
