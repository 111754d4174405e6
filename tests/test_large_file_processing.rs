//! Integration tests for end-to-end processing of files on disk

use polars::prelude::*;
use sheetflow::memory::{MemoryProbe, MemorySample, MB};
use sheetflow::prelude::*;
use std::io::Write;
use std::sync::Arc;
use tempfile::TempDir;

// ============================================================================
// Helpers
// ============================================================================

/// Probe reporting a steady, comfortable memory picture.
struct SteadyProbe;

impl MemoryProbe for SteadyProbe {
    fn sample(&self) -> sheetflow::Result<MemorySample> {
        Ok(MemorySample {
            timestamp: chrono::Utc::now(),
            process_bytes: (200.0 * MB) as u64,
            system_total_bytes: 16 * 1024 * 1024 * 1024,
            system_available_bytes: 12 * 1024 * 1024 * 1024,
        })
    }
}

fn write_csv(dir: &TempDir, name: &str, rows: usize) -> String {
    let path = dir.path().join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "id,value,label").unwrap();
    for i in 0..rows {
        writeln!(file, "{},{},row{}", i, i as f64 * 0.5, i % 7).unwrap();
    }
    path.to_string_lossy().into_owned()
}

fn processor() -> LargeFileProcessor {
    LargeFileProcessor::with_probe(Arc::new(FileSource::new()), Arc::new(SteadyProbe)).unwrap()
}

fn ids(chunks: &[Chunk]) -> Vec<i64> {
    chunks
        .iter()
        .flat_map(|chunk| {
            let rows = chunk.rows().expect("chunk payload");
            let col = rows.column("id").unwrap().cast(&DataType::Int64).unwrap();
            col.i64().unwrap().into_no_null_iter().collect::<Vec<_>>()
        })
        .collect()
}

// ============================================================================
// End-to-end runs
// ============================================================================

#[test]
fn test_csv_processed_in_chunks() {
    let dir = TempDir::new().unwrap();
    let path = write_csv(&dir, "data.csv", 2_500);

    let options = ProcessingOptions::new().with_chunk_size(1_000);
    let result = processor().process(&path, &options);

    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.rows_processed, 2_500);
    assert_eq!(result.chunks_processed, 3);
    assert_eq!(result.effective_chunk_size, 1_000);
    assert!(result.error.is_none());
}

#[test]
fn test_missing_file_reports_failure() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("absent.csv");

    let result = processor().process(&path.to_string_lossy(), &ProcessingOptions::new());

    assert!(!result.success);
    assert_eq!(result.status, RunStatus::Failure);
    assert!(result.has_edge_case(EdgeCase::FileNotFound));
    assert_eq!(result.error_kind.as_deref(), Some("not_found"));
    assert_eq!(result.rows_processed, 0);
}

#[test]
fn test_transform_applied_and_order_kept() {
    let dir = TempDir::new().unwrap();
    let path = write_csv(&dir, "data.csv", 2_300);

    let double = |df: DataFrame| -> sheetflow::Result<DataFrame> {
        let out = df
            .lazy()
            .with_column((col("value") * lit(2.0)).alias("doubled"))
            .collect()?;
        Ok(out)
    };

    let options = ProcessingOptions::new().with_chunk_size(500).with_max_workers(4);
    let output = processor().process_with(&path, &options, &double);

    assert!(output.result.success, "error: {:?}", output.result.error);
    assert_eq!(output.chunks.len(), 5);
    for chunk in output.chunks.iter().filter(|c| c.has_payload()) {
        assert!(chunk.rows().unwrap().column("doubled").is_ok());
    }

    let retained: Vec<Chunk> = output.chunks.into_iter().filter(|c| c.has_payload()).collect();
    let seen = ids(&retained);
    let mut sorted = seen.clone();
    sorted.sort_unstable();
    assert_eq!(seen, sorted);
}

#[test]
fn test_parallel_and_sequential_agree() {
    let dir = TempDir::new().unwrap();
    let path = write_csv(&dir, "data.csv", 1_750);
    let handle = FileSource::new().open(&path).unwrap();
    let probe: Arc<dyn MemoryProbe> = Arc::new(SteadyProbe);

    let run = |parallel: bool| -> Vec<i64> {
        let config = ChunkProcessorConfig::default()
            .with_chunk_size(250)
            .with_parallel(parallel)
            .with_max_workers(3);
        let processor = ChunkProcessor::new(config, Arc::clone(&probe)).unwrap();
        let identity = |df: DataFrame| -> sheetflow::Result<DataFrame> { Ok(df) };
        let chunks: Vec<Chunk> = processor
            .process(Arc::clone(&handle), &identity)
            .unwrap()
            .collect::<sheetflow::Result<_>>()
            .unwrap();
        assert_eq!(chunks.len(), 7);
        ids(&chunks)
    };

    let sequential = run(false);
    let parallel = run(true);
    assert_eq!(sequential, parallel);
    assert_eq!(sequential, (0..1_750).collect::<Vec<i64>>());
}

#[test]
fn test_narrowed_chunks_stack_back_together() {
    let dir = TempDir::new().unwrap();
    let path = write_csv(&dir, "wide.csv", 70_000);

    let identity = |df: DataFrame| -> sheetflow::Result<DataFrame> { Ok(df) };
    let options = ProcessingOptions::new()
        .with_chunk_size(10_000)
        .with_optimization_level(OptimizationLevel::Moderate);
    let output = processor().process_with(&path, &options, &identity);
    assert!(output.result.success, "error: {:?}", output.result.error);
    assert_eq!(output.chunks.len(), 7);

    let mut stacked = output.chunks[0].rows().unwrap().clone();
    for chunk in &output.chunks[1..] {
        stacked.vstack_mut(chunk.rows().unwrap()).unwrap();
    }
    assert_eq!(stacked.height(), 70_000);
    assert_eq!(stacked.column("id").unwrap().dtype(), &DataType::Int32);
}

#[test]
fn test_options_loaded_from_json() {
    let dir = TempDir::new().unwrap();
    let path = write_csv(&dir, "data.csv", 900);
    let config = dir.path().join("options.json");
    std::fs::write(
        &config,
        r#"{"chunk_size": 300, "processing_mode": "memory_conservative", "quality_assurance_level": "enterprise"}"#,
    )
    .unwrap();

    let options = ProcessingOptions::from_json_file(&config).unwrap();
    let result = processor().process(&path, &options);

    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(result.chunks_processed, 3);
    assert!(result.warnings.is_empty());
}

#[test]
fn test_result_serializes() {
    let dir = TempDir::new().unwrap();
    let path = write_csv(&dir, "data.csv", 120);

    let result = processor().process(&path, &ProcessingOptions::new());
    let json = result.to_json().unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();

    assert_eq!(value["rows_processed"], 120);
    assert_eq!(value["success"], true);
}
