use thiserror::Error;

use tiermem_core::{AllocError, ConfigError, InvariantViolation};

/// Errors surfaced by the harness.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("allocation failed: {0}")]
    Alloc(#[from] AllocError),
    #[error("engine invariant violated: {0}")]
    Invariant(#[from] InvariantViolation),
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("{failures} validation error(s) in {path}")]
    Validation { path: String, failures: usize },
    #[error("worker thread panicked")]
    WorkerPanicked,
}
