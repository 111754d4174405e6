//! Error types for sheetflow

use std::time::Duration;
use thiserror::Error;

/// Result type alias for sheetflow operations
pub type Result<T> = std::result::Result<T, SheetflowError>;

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum SheetflowError {
    #[error("Source not found: {0}")]
    NotFound(String),

    #[error("Invalid range: start={start}, end={end}, source length={len}")]
    InvalidRange { start: usize, end: usize, len: usize },

    #[error("Memory limit exceeded: {current_mb:.1} MB in use, limit {limit_mb:.1} MB")]
    MemoryLimitExceeded { current_mb: f64, limit_mb: f64 },

    #[error("Memory budget exceeded: grew {growth_mb:.1} MB during traversal, budget {budget_mb:.1} MB")]
    MemoryBudgetExceeded { growth_mb: f64, budget_mb: f64 },

    #[error("Thread safety violation in chunk {chunk_id}: {reason}")]
    ThreadSafetyViolation { chunk_id: usize, reason: String },

    #[error("Recovery failed after {attempts} attempts: {reason}")]
    RecoveryFailed { attempts: u32, reason: String },

    #[error("Data error: {0}")]
    DataError(String),

    #[error("Processing error: {0}")]
    ProcessingError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Thread pool error: {0}")]
    ThreadPoolError(String),

    #[error("Memory probe error: {0}")]
    ProbeError(String),

    #[error("View not supported by source: {0}")]
    ViewUnsupported(String),

    #[error("Processing cancelled")]
    Cancelled,

    #[error("Deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl SheetflowError {
    /// Stable tag for this error, used in serialized results.
    pub fn kind(&self) -> &'static str {
        match self {
            SheetflowError::NotFound(_) => "not_found",
            SheetflowError::InvalidRange { .. } => "invalid_range",
            SheetflowError::MemoryLimitExceeded { .. } => "memory_limit_exceeded",
            SheetflowError::MemoryBudgetExceeded { .. } => "memory_budget_exceeded",
            SheetflowError::ThreadSafetyViolation { .. } => "thread_safety_violation",
            SheetflowError::RecoveryFailed { .. } => "recovery_failed",
            SheetflowError::DataError(_) => "data_error",
            SheetflowError::ProcessingError(_) => "processing_error",
            SheetflowError::ConfigError(_) => "config_error",
            SheetflowError::ThreadPoolError(_) => "thread_pool_error",
            SheetflowError::ProbeError(_) => "probe_error",
            SheetflowError::ViewUnsupported(_) => "view_unsupported",
            SheetflowError::Cancelled => "cancelled",
            SheetflowError::DeadlineExceeded(_) => "deadline_exceeded",
            SheetflowError::IoError(_) => "io_error",
            SheetflowError::SerializationError(_) => "serialization_error",
        }
    }

    /// True for the two memory-exhaustion variants.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(
            self,
            SheetflowError::MemoryLimitExceeded { .. } | SheetflowError::MemoryBudgetExceeded { .. }
        )
    }
}

impl From<polars::error::PolarsError> for SheetflowError {
    fn from(err: polars::error::PolarsError) -> Self {
        SheetflowError::DataError(err.to_string())
    }
}

impl From<serde_json::Error> for SheetflowError {
    fn from(err: serde_json::Error) -> Self {
        SheetflowError::SerializationError(err.to_string())
    }
}

/// Render a caught panic payload as text.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
