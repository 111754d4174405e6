//! Integration tests for row-range extraction

use polars::prelude::*;
use sheetflow::prelude::*;
use sheetflow::range::{CellValue, RangeExtractorConfig};
use std::io::Write;
use std::sync::Arc;
use tempfile::TempDir;

fn write_csv(dir: &TempDir, rows: usize) -> String {
    let path = dir.path().join("rows.csv");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "id,name").unwrap();
    for i in 0..rows {
        writeln!(file, "{},name{}", i, i).unwrap();
    }
    path.to_string_lossy().into_owned()
}

#[test]
fn test_range_past_end_is_clamped() {
    let dir = TempDir::new().unwrap();
    let path = write_csv(&dir, 500);
    let extractor = RangeViewExtractor::new(Arc::new(FileSource::new()));

    let view = extractor.get_range(&path, 0, 1_000).unwrap();
    assert_eq!(view.len(), 500);
    assert_eq!(view.end, 500);
}

#[test]
fn test_range_matches_source_slice() {
    let dir = TempDir::new().unwrap();
    let path = write_csv(&dir, 400);
    let extractor = RangeViewExtractor::new(Arc::new(FileSource::new()));
    let full = FileSource::new().open(&path).unwrap().read_range(0, 400).unwrap();

    let view = extractor.get_range(&path, 120, 180).unwrap();
    assert!(view.rows().equals(&full.slice(120, 60)));
    assert_eq!(extractor.get_cache_size(), 1);
}

#[test]
fn test_invalid_ranges_rejected() {
    let dir = TempDir::new().unwrap();
    let path = write_csv(&dir, 50);
    let extractor = RangeViewExtractor::new(Arc::new(FileSource::new()));

    assert!(extractor.get_range(&path, 10, 10).is_err());
    assert!(extractor.get_range(&path, 50, 60).is_err());
    let missing = dir.path().join("missing.csv");
    let err = extractor
        .get_range(&missing.to_string_lossy(), 0, 10)
        .unwrap_err();
    assert_eq!(err.kind(), "not_found");
}

#[test]
fn test_large_range_sub_batched() {
    let dir = TempDir::new().unwrap();
    let path = write_csv(&dir, 1_000);
    let config = RangeExtractorConfig {
        batch_threshold_rows: 100,
        sub_batch_rows: 64,
        ..RangeExtractorConfig::default()
    };
    let extractor = RangeViewExtractor::with_config(Arc::new(FileSource::new()), config);

    let view = extractor.get_range(&path, 100, 900).unwrap();
    assert_eq!(view.len(), 800);
    let ids = view.rows().column("id").unwrap().cast(&DataType::Int64).unwrap();
    assert_eq!(ids.i64().unwrap().get(0), Some(100));
    assert_eq!(ids.i64().unwrap().get(799), Some(899));
}

#[test]
fn test_records_carry_cell_values() {
    let dir = TempDir::new().unwrap();
    let path = write_csv(&dir, 20);
    let extractor = RangeViewExtractor::new(Arc::new(FileSource::new()));

    let records = extractor.get_records(&path, 5, 8).unwrap();
    assert_eq!(records.columns, vec!["id".to_string(), "name".to_string()]);
    assert_eq!(records.rows.len(), 3);
    assert_eq!(records.rows[0][0], CellValue::Int(5));
    assert_eq!(records.rows[2][1], CellValue::Text("name7".to_string()));
}
