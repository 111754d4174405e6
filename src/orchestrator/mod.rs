//! Large-file orchestration: edge-case detection, configuration adaptation,
//! guarded chunk processing and recovery.

pub mod adaptive;
pub mod edge_cases;
pub mod options;
pub mod processor;
pub mod result;

pub use adaptive::{adapt_config, AdaptedConfig, DEFAULT_CHUNK_SIZE, MIN_CHUNK_SIZE};
pub use edge_cases::{detect_edge_cases, EdgeCase, EdgeCaseThresholds, EnvironmentReport};
pub use options::{CancellationToken, ProcessingMode, ProcessingOptions, QualityAssuranceLevel};
pub use processor::LargeFileProcessor;
pub use result::{ProcessingOutput, ProcessingResult, RunStatus};
