//! Chunk processing: transformation, parallel dispatch and dtype optimization.

pub mod optimize;
pub mod processor;

pub use optimize::{optimize_frame, DtypePlan, OptimizationLevel};
pub use processor::{
    ChunkProcessor, ChunkProcessorConfig, ProcessedChunks, ProcessorMetrics, SizeBand, Transform,
};
