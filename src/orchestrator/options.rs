//! Per-run options and cancellation.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, SheetflowError};
use crate::processing::OptimizationLevel;

/// Overall strategy for a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMode {
    #[default]
    StreamingOptimized,
    MemoryConservative,
    SpeedPriority,
}

impl ProcessingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingMode::StreamingOptimized => "streaming_optimized",
            ProcessingMode::MemoryConservative => "memory_conservative",
            ProcessingMode::SpeedPriority => "speed_priority",
        }
    }
}

impl std::str::FromStr for ProcessingMode {
    type Err = SheetflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "streaming_optimized" | "streaming" => Ok(ProcessingMode::StreamingOptimized),
            "memory_conservative" | "memory" => Ok(ProcessingMode::MemoryConservative),
            "speed_priority" | "speed" => Ok(ProcessingMode::SpeedPriority),
            other => Err(SheetflowError::ConfigError(format!(
                "unknown processing mode: {other}"
            ))),
        }
    }
}

/// Post-run verification depth
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityAssuranceLevel {
    Basic,
    #[default]
    Standard,
    Enterprise,
}

impl std::str::FromStr for QualityAssuranceLevel {
    type Err = SheetflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "basic" => Ok(QualityAssuranceLevel::Basic),
            "standard" => Ok(QualityAssuranceLevel::Standard),
            "enterprise" => Ok(QualityAssuranceLevel::Enterprise),
            other => Err(SheetflowError::ConfigError(format!(
                "unknown quality assurance level: {other}"
            ))),
        }
    }
}

/// Options for one `process` call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingOptions {
    /// Overrides the mode's chunk size
    pub chunk_size: Option<usize>,
    pub memory_limit_mb: f64,
    pub enable_parallel_processing: bool,
    pub max_workers: usize,
    pub processing_mode: ProcessingMode,
    pub enable_auto_recovery: bool,
    pub quality_assurance_level: QualityAssuranceLevel,
    pub optimization_level: OptimizationLevel,
    /// Processed chunks that keep their payload through emergency mitigation
    pub retained_chunks: usize,
    pub max_recovery_attempts: u32,
    /// Wall-clock limit for the run, checked between chunks
    pub deadline_secs: Option<f64>,
}

impl Default for ProcessingOptions {
    fn default() -> Self {
        Self {
            chunk_size: None,
            memory_limit_mb: 1024.0,
            enable_parallel_processing: true,
            max_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            processing_mode: ProcessingMode::default(),
            enable_auto_recovery: true,
            quality_assurance_level: QualityAssuranceLevel::default(),
            optimization_level: OptimizationLevel::default(),
            retained_chunks: 3,
            max_recovery_attempts: 3,
            deadline_secs: None,
        }
    }
}

impl ProcessingOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load options from a JSON file; missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let options: Self = serde_json::from_str(&text)?;
        options.validate()?;
        Ok(options)
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    pub fn with_memory_limit_mb(mut self, limit_mb: f64) -> Self {
        self.memory_limit_mb = limit_mb;
        self
    }

    pub fn with_parallel(mut self, enabled: bool) -> Self {
        self.enable_parallel_processing = enabled;
        self
    }

    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers;
        self
    }

    pub fn with_mode(mut self, mode: ProcessingMode) -> Self {
        self.processing_mode = mode;
        self
    }

    pub fn with_auto_recovery(mut self, enabled: bool) -> Self {
        self.enable_auto_recovery = enabled;
        self
    }

    pub fn with_quality_assurance(mut self, level: QualityAssuranceLevel) -> Self {
        self.quality_assurance_level = level;
        self
    }

    pub fn with_optimization_level(mut self, level: OptimizationLevel) -> Self {
        self.optimization_level = level;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline_secs = Some(deadline.as_secs_f64());
        self
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_secs
            .filter(|s| s.is_finite() && *s >= 0.0)
            .map(Duration::from_secs_f64)
    }

    pub fn memory_limit_bytes(&self) -> u64 {
        (self.memory_limit_mb * crate::memory::MB) as u64
    }

    pub fn validate(&self) -> Result<()> {
        if self.memory_limit_mb.is_nan() || self.memory_limit_mb <= 0.0 {
            return Err(SheetflowError::ConfigError(
                "memory_limit_mb must be > 0".to_string(),
            ));
        }
        if self.chunk_size == Some(0) {
            return Err(SheetflowError::ConfigError("chunk_size must be > 0".to_string()));
        }
        if self.max_workers == 0 {
            return Err(SheetflowError::ConfigError("max_workers must be > 0".to_string()));
        }
        if let Some(secs) = self.deadline_secs {
            if !secs.is_finite() || secs < 0.0 {
                return Err(SheetflowError::ConfigError(
                    "deadline_secs must be a non-negative number".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Cooperative cancellation flag, checked between chunks.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
