//! sheetflow - Memory-managed chunked processing for large tabular files
//!
//! This crate processes CSV, JSON, and Parquet sources that may not fit
//! comfortably in memory:
//! - Bounded-memory chunk reading with adaptive chunk sizes
//! - Parallel chunk transforms with per-chunk fallback
//! - Buffer pooling and a background memory monitor
//! - Cached zero-copy row-range extraction
//!
//! # Modules
//!
//! ## Sources
//! - [`source`] - Data sources, table handles, and the chunk reader
//!
//! ## Memory
//! - [`memory`] - Memory probes, buffer pool, alerts, and the monitor
//!
//! ## Processing
//! - [`processing`] - Chunk processor and dtype optimization
//! - [`range`] - Row-range views over cached sources
//! - [`orchestrator`] - Edge-case detection, recovery, and end-to-end runs
//!
//! ## Services
//! - [`cli`] - Command-line interface

// Core error handling
pub mod error;

// Sources
pub mod source;

// Infrastructure
pub mod memory;

// Processing
pub mod processing;
pub mod range;
pub mod orchestrator;

// Services
pub mod cli;

pub use error::{Result, SheetflowError};

/// Re-export commonly used types
pub mod prelude {
    // Error handling
    pub use crate::error::{Result, SheetflowError};

    // Sources
    pub use crate::source::{
        Chunk, ChunkReader, DataSource, FileSource, MemorySource, ReaderConfig, SchemaKey,
        SourceMetadata, TableHandle,
    };

    // Memory management
    pub use crate::memory::{
        AlertLevel, AlertThresholds, BufferPool, BufferPoolConfig, MemoryAlert, MemoryMonitor,
        MemoryProbe, MonitorConfig, PooledBuffer, SystemProbe,
    };

    // Chunk processing
    pub use crate::processing::{
        ChunkProcessor, ChunkProcessorConfig, OptimizationLevel, ProcessorMetrics, Transform,
    };

    // Range extraction
    pub use crate::range::{RangeView, RangeViewExtractor};

    // Orchestration
    pub use crate::orchestrator::{
        CancellationToken, EdgeCase, LargeFileProcessor, ProcessingMode, ProcessingOptions,
        ProcessingOutput, ProcessingResult, QualityAssuranceLevel, RunStatus,
    };
}
