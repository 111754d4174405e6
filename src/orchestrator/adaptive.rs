//! Run configuration from the processing mode and detected edge cases.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::edge_cases::EdgeCase;
use super::options::{ProcessingMode, ProcessingOptions};
use crate::processing::OptimizationLevel;

/// Smallest chunk size adaptation or mitigation will pick
pub const MIN_CHUNK_SIZE: usize = 100;

/// Chunk size used when nothing else decides
pub const DEFAULT_CHUNK_SIZE: usize = 10_000;

/// Settings chosen for one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptedConfig {
    pub chunk_size: usize,
    /// Chunks between in-loop memory checks
    pub gc_frequency: usize,
    pub monitoring_interval: Duration,
    pub parallel: bool,
    pub max_workers: usize,
    pub optimization_level: OptimizationLevel,
}

fn mode_defaults(mode: ProcessingMode) -> (usize, usize, Duration) {
    match mode {
        ProcessingMode::StreamingOptimized => (DEFAULT_CHUNK_SIZE, 5, Duration::from_secs(1)),
        ProcessingMode::MemoryConservative => (2_000, 2, Duration::from_millis(500)),
        ProcessingMode::SpeedPriority => (25_000, 10, Duration::from_secs(2)),
    }
}

pub fn adapt_config(options: &ProcessingOptions, edge_cases: &[EdgeCase]) -> AdaptedConfig {
    let (mode_chunk, mut gc_frequency, mut interval) = mode_defaults(options.processing_mode);
    let mut chunk_size = options.chunk_size.unwrap_or(mode_chunk);
    let mut max_workers = options.max_workers.max(1);
    let mut optimization_level = options.optimization_level;

    for case in edge_cases {
        match case {
            EdgeCase::VeryLargeFile => {
                chunk_size /= 2;
                gc_frequency = gc_frequency.min(3);
            }
            EdgeCase::ExtremelyLargeFile => {
                chunk_size /= 4;
                gc_frequency = gc_frequency.min(2);
                interval = interval.min(Duration::from_millis(500));
            }
            EdgeCase::HighMemoryPressure => {
                chunk_size /= 2;
                gc_frequency = 1;
                interval = interval.min(Duration::from_millis(250));
                optimization_level = OptimizationLevel::Aggressive;
            }
            EdgeCase::HighCpuLoad => {
                max_workers = (max_workers / 2).max(1);
            }
            _ => {}
        }
    }

    AdaptedConfig {
        chunk_size: chunk_size.max(MIN_CHUNK_SIZE),
        gc_frequency: gc_frequency.max(1),
        monitoring_interval: interval,
        parallel: options.enable_parallel_processing && max_workers > 1,
        max_workers,
        optimization_level,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_conservative_on_small_file() {
        let options = ProcessingOptions::new().with_mode(ProcessingMode::MemoryConservative);
        let config = adapt_config(&options, &[]);
        assert!(config.chunk_size < DEFAULT_CHUNK_SIZE);
        assert!(config.gc_frequency <= 2);
        assert_eq!(config.monitoring_interval, Duration::from_millis(500));
    }

    #[test]
    fn test_speed_priority_uses_large_chunks() {
        let options = ProcessingOptions::new().with_mode(ProcessingMode::SpeedPriority);
        let config = adapt_config(&options, &[]);
        assert_eq!(config.chunk_size, 25_000);
        assert_eq!(config.gc_frequency, 10);
    }

    #[test]
    fn test_edge_cases_shrink_further() {
        let options = ProcessingOptions::new().with_max_workers(8);
        let config = adapt_config(
            &options,
            &[EdgeCase::ExtremelyLargeFile, EdgeCase::HighMemoryPressure, EdgeCase::HighCpuLoad],
        );
        assert_eq!(config.chunk_size, 1250);
        assert_eq!(config.gc_frequency, 1);
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.optimization_level, OptimizationLevel::Aggressive);
    }

    #[test]
    fn test_chunk_floor() {
        let options = ProcessingOptions::new().with_chunk_size(150);
        let config = adapt_config(&options, &[EdgeCase::VeryLargeFile]);
        assert_eq!(config.chunk_size, MIN_CHUNK_SIZE);
    }

    #[test]
    fn test_single_worker_is_sequential() {
        let options = ProcessingOptions::new().with_max_workers(1);
        assert!(!adapt_config(&options, &[]).parallel);
    }
}
