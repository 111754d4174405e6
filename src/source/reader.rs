//! Chunk Reader
//!
//! Sequential traversal of a table in fixed-size chunks, with a guard on
//! process-memory growth since the traversal started.
//!
//! The table behind the handle is already loaded, so the budget bounds how
//! much the traversal itself (and whatever the caller keeps alive between
//! pulls) adds on top of the loaded source. It is not a streaming I/O bound.

use polars::prelude::*;
use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::{DataSource, TableHandle};
use crate::error::{Result, SheetflowError};
use crate::memory::probe::{MemoryProbe, MB};

/// Configuration for a chunk traversal
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Rows per chunk (the last chunk may be shorter)
    pub chunk_size: usize,
    /// Allowed process-memory growth in bytes; `None` disables the guard
    pub memory_budget_bytes: Option<u64>,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            chunk_size: 10_000,
            memory_budget_bytes: None,
        }
    }
}

impl ReaderConfig {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            ..Default::default()
        }
    }

    pub fn with_memory_budget_mb(mut self, budget_mb: f64) -> Self {
        self.memory_budget_bytes = Some((budget_mb * MB) as u64);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(SheetflowError::ConfigError("chunk_size must be > 0".to_string()));
        }
        Ok(())
    }
}

/// An ordered batch of rows from one traversal.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Ordinal within the traversal, starting at 0
    pub id: usize,
    /// Source rows covered, half-open
    pub row_range: Range<usize>,
    rows: Option<DataFrame>,
    /// Rows covered; kept after the payload is cleared
    pub row_count: usize,
    /// Estimated payload footprint in bytes
    pub memory_bytes: usize,
    /// Time spent producing this chunk
    pub processing_time: Duration,
    /// Whether the chunk went through transformation and optimization
    pub optimized: bool,
}

impl Chunk {
    pub fn new(id: usize, row_range: Range<usize>, rows: DataFrame) -> Self {
        let row_count = row_range.len();
        let memory_bytes = rows.estimated_size();
        Self {
            id,
            row_range,
            rows: Some(rows),
            row_count,
            memory_bytes,
            processing_time: Duration::ZERO,
            optimized: false,
        }
    }

    pub fn rows(&self) -> Option<&DataFrame> {
        self.rows.as_ref()
    }

    pub fn take_rows(&mut self) -> Option<DataFrame> {
        self.memory_bytes = 0;
        self.rows.take()
    }

    /// Replace the payload. The row range is unchanged.
    pub fn set_rows(&mut self, rows: DataFrame) {
        self.memory_bytes = rows.estimated_size();
        self.rows = Some(rows);
    }

    pub fn has_payload(&self) -> bool {
        self.rows.is_some()
    }

    /// Drop the payload, keeping the row range and counts.
    pub fn clear_payload(&mut self) -> usize {
        let freed = self.memory_bytes;
        self.rows = None;
        self.memory_bytes = 0;
        freed
    }

    pub fn start_row(&self) -> usize {
        self.row_range.start
    }

    /// Index of the last row in the chunk (inclusive)
    pub fn end_row(&self) -> usize {
        self.row_range.end.saturating_sub(1)
    }

    pub fn len(&self) -> usize {
        self.row_count
    }

    pub fn is_empty(&self) -> bool {
        self.row_count == 0
    }
}

/// Lazy iterator of [`Chunk`]s over a table.
///
/// After a `MemoryBudgetExceeded` error the reader stops without advancing.
/// [`ChunkReader::rebaseline`] re-arms it at the same position.
pub struct ChunkReader {
    handle: Arc<dyn TableHandle>,
    probe: Arc<dyn MemoryProbe>,
    chunk_size: usize,
    budget_bytes: Option<u64>,
    baseline_bytes: u64,
    position: usize,
    next_id: usize,
    peak_growth_bytes: u64,
    halted: bool,
}

impl ChunkReader {
    /// Open `locator` on `source` and start a traversal at row 0.
    pub fn open(
        source: &dyn DataSource,
        locator: &str,
        config: ReaderConfig,
        probe: Arc<dyn MemoryProbe>,
    ) -> Result<Self> {
        config.validate()?;
        let handle = source.open(locator)?;
        Self::from_handle(handle, config, probe)
    }

    /// Start a traversal over an already opened handle.
    pub fn from_handle(
        handle: Arc<dyn TableHandle>,
        config: ReaderConfig,
        probe: Arc<dyn MemoryProbe>,
    ) -> Result<Self> {
        config.validate()?;
        let baseline_bytes = match config.memory_budget_bytes {
            Some(_) => probe.process_bytes()?,
            None => 0,
        };
        Ok(Self {
            handle,
            probe,
            chunk_size: config.chunk_size,
            budget_bytes: config.memory_budget_bytes,
            baseline_bytes,
            position: 0,
            next_id: 0,
            peak_growth_bytes: 0,
            halted: false,
        })
    }

    /// Resume at `row`, numbering chunks from `first_id`.
    pub fn starting_at(mut self, row: usize, first_id: usize) -> Self {
        self.position = row.min(self.handle.len());
        self.next_id = first_id;
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Change the size of chunks not yet read.
    pub fn set_chunk_size(&mut self, chunk_size: usize) {
        self.chunk_size = chunk_size.max(1);
    }

    /// Reset the growth baseline to current usage and clear a budget halt.
    pub fn rebaseline(&mut self) -> Result<()> {
        if self.budget_bytes.is_some() {
            self.baseline_bytes = self.probe.process_bytes()?;
        }
        self.halted = false;
        Ok(())
    }

    /// Next row to be read
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn next_id(&self) -> usize {
        self.next_id
    }

    pub fn total_rows(&self) -> usize {
        self.handle.len()
    }

    pub fn handle(&self) -> &Arc<dyn TableHandle> {
        &self.handle
    }

    /// Largest growth over the baseline observed so far
    pub fn peak_growth_bytes(&self) -> u64 {
        self.peak_growth_bytes
    }

    /// Chunks left at the current chunk size
    pub fn remaining_chunks(&self) -> usize {
        let remaining = self.handle.len().saturating_sub(self.position);
        remaining.div_ceil(self.chunk_size)
    }

    fn check_budget(&mut self) -> Result<()> {
        let Some(budget) = self.budget_bytes else {
            return Ok(());
        };

        let current = match self.probe.process_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Memory probe failed, skipping budget check");
                return Ok(());
            }
        };

        let growth = current.saturating_sub(self.baseline_bytes);
        self.peak_growth_bytes = self.peak_growth_bytes.max(growth);
        if growth > budget {
            return Err(SheetflowError::MemoryBudgetExceeded {
                growth_mb: growth as f64 / MB,
                budget_mb: budget as f64 / MB,
            });
        }
        Ok(())
    }
}

impl Iterator for ChunkReader {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        let len = self.handle.len();
        if self.halted || self.position >= len {
            return None;
        }

        let started = Instant::now();
        let start = self.position;
        let end = (start + self.chunk_size).min(len);

        let rows = match self.handle.read_range(start, end) {
            Ok(rows) => rows,
            Err(e) => {
                self.halted = true;
                return Some(Err(e));
            }
        };

        if let Err(e) = self.check_budget() {
            self.halted = true;
            return Some(Err(e));
        }

        let mut chunk = Chunk::new(self.next_id, start..end, rows);
        chunk.processing_time = started.elapsed();

        debug!(chunk_id = chunk.id, start, end, "Read chunk");

        self.position = end;
        self.next_id += 1;
        Some(Ok(chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::probe::testing::ScriptedProbe;
    use crate::memory::probe::SystemProbe;
    use crate::source::MemorySource;

    fn numbered(n: usize) -> DataFrame {
        df!(
            "id" => (0..n as i64).collect::<Vec<_>>(),
            "value" => (0..n).map(|i| i as f64 * 1.5).collect::<Vec<_>>()
        )
        .unwrap()
    }

    fn source_with(n: usize) -> MemorySource {
        MemorySource::new().with_table("t", numbered(n))
    }

    #[test]
    fn test_ten_thousand_rows_in_ten_chunks() {
        let source = source_with(10_000);
        let reader =
            ChunkReader::open(&source, "t", ReaderConfig::new(1000), SystemProbe::shared()).unwrap();

        let chunks: Vec<Chunk> = reader.map(|c| c.unwrap()).collect();
        assert_eq!(chunks.len(), 10);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.id, i);
            assert_eq!(chunk.len(), 1000);
        }
        assert_eq!(chunks.last().unwrap().end_row(), 9999);
    }

    #[test]
    fn test_ranges_partition_source() {
        for (n, size) in [(1usize, 1usize), (7, 3), (100, 7), (1001, 1000), (50, 50)] {
            let source = source_with(n);
            let reader =
                ChunkReader::open(&source, "t", ReaderConfig::new(size), SystemProbe::shared())
                    .unwrap();
            let chunks: Vec<Chunk> = reader.map(|c| c.unwrap()).collect();

            assert_eq!(chunks.len(), n.div_ceil(size));
            assert_eq!(chunks.iter().map(|c| c.len()).sum::<usize>(), n);
            let mut expected_start = 0;
            for chunk in &chunks[..chunks.len() - 1] {
                assert_eq!(chunk.len(), size);
            }
            for chunk in &chunks {
                assert_eq!(chunk.row_range.start, expected_start);
                expected_start = chunk.row_range.end;
            }
            assert_eq!(expected_start, n);
        }
    }

    #[test]
    fn test_empty_source_yields_nothing() {
        let source = MemorySource::new().with_table("empty", numbered(0));
        let mut reader =
            ChunkReader::open(&source, "empty", ReaderConfig::new(10), SystemProbe::shared())
                .unwrap();
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_missing_source() {
        let source = MemorySource::new();
        let result = ChunkReader::open(&source, "nope", ReaderConfig::new(10), SystemProbe::shared());
        assert!(matches!(result, Err(SheetflowError::NotFound(_))));
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let source = source_with(10);
        let result = ChunkReader::open(&source, "t", ReaderConfig::new(0), SystemProbe::shared());
        assert!(matches!(result, Err(SheetflowError::ConfigError(_))));
    }

    #[test]
    fn test_budget_exceeded_then_rebaseline() {
        let source = source_with(30);
        let probe = ScriptedProbe::new(100.0, 50.0);
        let config = ReaderConfig::new(10).with_memory_budget_mb(50.0);
        let mut reader = ChunkReader::open(&source, "t", config, probe.clone()).unwrap();

        assert!(reader.next().unwrap().is_ok());

        probe.set_process_mb(200.0);
        let err = reader.next().unwrap().unwrap_err();
        assert!(matches!(err, SheetflowError::MemoryBudgetExceeded { .. }));
        assert!(reader.next().is_none());
        assert_eq!(reader.position(), 10);

        reader.rebaseline().unwrap();
        let rest: Vec<Chunk> = reader.map(|c| c.unwrap()).collect();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].id, 1);
        assert_eq!(rest[0].row_range, 10..20);
    }

    #[test]
    fn test_clear_payload_keeps_counts() {
        let mut chunk = Chunk::new(0, 0..5, numbered(5));
        assert!(chunk.has_payload());
        assert!(chunk.clear_payload() > 0);
        assert!(!chunk.has_payload());
        assert_eq!(chunk.len(), 5);
        assert_eq!(chunk.row_range, 0..5);
    }

    #[test]
    fn test_starting_at_continues_ids() {
        let source = source_with(25);
        let reader = ChunkReader::open(&source, "t", ReaderConfig::new(10), SystemProbe::shared())
            .unwrap()
            .starting_at(10, 1);
        let ids: Vec<usize> = reader.map(|c| c.unwrap().id).collect();
        assert_eq!(ids, vec![1, 2]);
    }
}
