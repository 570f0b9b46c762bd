use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DataError>;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed dataset file {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },

    #[error("dataset not found under {0} (run with --download to fetch it)")]
    Missing(PathBuf),

    #[error("download failed: {0}")]
    Download(String),

    #[error("index {index} out of range for dataset of length {len}")]
    OutOfRange { index: usize, len: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("worker pool error: {0}")]
    WorkerPool(String),
}
