//! Chunk Processor
//!
//! Applies a transformation to every chunk of a table. In parallel mode chunks
//! are read in windows and dispatched to a bounded rayon pool; results are
//! always yielded in ascending chunk id order.

use parking_lot::Mutex;
use polars::prelude::*;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::optimize::{DtypePlan, OptimizationLevel};
use crate::error::{panic_message, Result, SheetflowError};
use crate::memory::probe::{MemoryProbe, MB};
use crate::source::{Chunk, ChunkReader, ReaderConfig, TableHandle};

/// Per-chunk transformation
pub type Transform = dyn Fn(DataFrame) -> Result<DataFrame> + Send + Sync;

/// Table size classes used by adaptive sizing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeBand {
    Small,  // < 10 MB
    Medium, // < 100 MB
    Large,
}

impl SizeBand {
    pub fn from_bytes(bytes: u64) -> Self {
        let mb = bytes as f64 / MB;
        if mb < 10.0 {
            SizeBand::Small
        } else if mb < 100.0 {
            SizeBand::Medium
        } else {
            SizeBand::Large
        }
    }

    pub fn chunk_size(&self) -> usize {
        match self {
            SizeBand::Small => 5000,
            SizeBand::Medium => 2000,
            SizeBand::Large => 1000,
        }
    }
}

/// Configuration for [`ChunkProcessor`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkProcessorConfig {
    /// Rows per chunk when adaptive sizing is off
    pub chunk_size: usize,
    /// Floor for chunk sizes reduced by error recovery
    pub min_chunk_size: usize,
    pub optimization_level: OptimizationLevel,
    pub parallel: bool,
    pub max_workers: usize,
    /// Pick the chunk size from the table's size band
    pub adaptive_sizing: bool,
    /// Read two windows' worth of chunks per dispatch instead of one
    pub pipeline_optimization: bool,
    /// Retry failed chunks and budget overruns at half the chunk size
    pub error_recovery: bool,
    /// Allowed process-memory growth during a traversal
    pub memory_budget_mb: Option<f64>,
}

impl Default for ChunkProcessorConfig {
    fn default() -> Self {
        Self {
            chunk_size: 10_000,
            min_chunk_size: 100,
            optimization_level: OptimizationLevel::default(),
            parallel: true,
            max_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            adaptive_sizing: false,
            pipeline_optimization: true,
            error_recovery: true,
            memory_budget_mb: None,
        }
    }
}

impl ChunkProcessorConfig {
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers;
        self
    }

    pub fn with_optimization_level(mut self, level: OptimizationLevel) -> Self {
        self.optimization_level = level;
        self
    }

    pub fn with_adaptive_sizing(mut self, enabled: bool) -> Self {
        self.adaptive_sizing = enabled;
        self
    }

    pub fn with_error_recovery(mut self, enabled: bool) -> Self {
        self.error_recovery = enabled;
        self
    }

    pub fn with_memory_budget_mb(mut self, budget_mb: f64) -> Self {
        self.memory_budget_mb = Some(budget_mb);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(SheetflowError::ConfigError("chunk_size must be > 0".to_string()));
        }
        if self.min_chunk_size == 0 {
            return Err(SheetflowError::ConfigError(
                "min_chunk_size must be > 0".to_string(),
            ));
        }
        if self.max_workers == 0 {
            return Err(SheetflowError::ConfigError("max_workers must be > 0".to_string()));
        }
        Ok(())
    }

    fn window_depth(&self) -> usize {
        if !self.parallel {
            1
        } else if self.pipeline_optimization {
            self.max_workers * 2
        } else {
            self.max_workers
        }
    }
}

/// Counters and ratios for one processing run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessorMetrics {
    pub workers: usize,
    pub effective_chunk_size: usize,
    pub chunks_processed: usize,
    pub rows_processed: usize,
    pub optimized_chunks: usize,
    pub fallback_chunks: usize,
    pub thread_safety_violations: usize,
    pub error_recovery_count: usize,
    /// Summed task time across workers
    pub busy_secs: f64,
    /// Time spent inside dispatch windows
    pub dispatch_secs: f64,
    /// Time spent producing chunks, excluding time the consumer holds them
    pub wall_secs: f64,
    pub raw_bytes: u64,
    pub output_bytes: u64,
    pub parallel_efficiency: f64,
    pub worker_utilization: f64,
    pub throughput_rows_per_sec: f64,
    /// Summed task time over dispatch time; 1.0 is sequential speed
    pub performance_improvement_ratio: f64,
    /// Percent throughput gained over sequential execution
    pub throughput_improvement: f64,
    /// Percent of raw chunk bytes saved by optimization
    pub memory_efficiency_improvement: f64,
    #[serde(skip)]
    windows: usize,
    #[serde(skip)]
    occupancy_sum: f64,
}

impl ProcessorMetrics {
    fn for_run(workers: usize, chunk_size: usize) -> Self {
        Self {
            workers,
            effective_chunk_size: chunk_size,
            performance_improvement_ratio: 1.0,
            ..Default::default()
        }
    }

    fn record_task(&mut self, task: &TaskResult) {
        self.chunks_processed += 1;
        self.rows_processed += task.chunk.row_count;
        self.busy_secs += task.busy.as_secs_f64();
        self.raw_bytes += task.raw_bytes as u64;
        self.output_bytes += task.chunk.memory_bytes as u64;
        if task.chunk.optimized {
            self.optimized_chunks += 1;
        } else {
            self.fallback_chunks += 1;
        }
    }

    fn record_window(&mut self, elapsed: Duration, tasks: usize) {
        self.dispatch_secs += elapsed.as_secs_f64();
        self.windows += 1;
        self.occupancy_sum += (tasks.min(self.workers) as f64 / self.workers.max(1) as f64).min(1.0);
        self.recompute();
    }

    fn record_wall(&mut self, elapsed: Duration) {
        self.wall_secs += elapsed.as_secs_f64();
        self.recompute();
    }

    fn record_recovery(&mut self, chunk_size: usize) {
        self.error_recovery_count += 1;
        self.effective_chunk_size = chunk_size;
    }

    fn recompute(&mut self) {
        if self.dispatch_secs > 0.0 {
            self.performance_improvement_ratio = self.busy_secs / self.dispatch_secs;
        }
        self.parallel_efficiency =
            (self.performance_improvement_ratio / self.workers.max(1) as f64).min(1.0);
        if self.windows > 0 {
            self.worker_utilization = self.occupancy_sum / self.windows as f64;
        }
        if self.wall_secs > 0.0 {
            self.throughput_rows_per_sec = self.rows_processed as f64 / self.wall_secs;
        }
        self.throughput_improvement = (self.performance_improvement_ratio - 1.0) * 100.0;
        if self.raw_bytes > 0 {
            self.memory_efficiency_improvement =
                (self.raw_bytes as f64 - self.output_bytes as f64) / self.raw_bytes as f64 * 100.0;
        }
    }
}

struct TaskResult {
    chunk: Chunk,
    busy: Duration,
    raw_bytes: usize,
    failure: Option<String>,
}

fn guarded(transform: &Transform, df: DataFrame) -> Result<DataFrame> {
    catch_unwind(AssertUnwindSafe(|| transform(df)))
        .map_err(|payload| SheetflowError::ProcessingError(panic_message(&*payload)))?
}

fn run_task(transform: &Transform, plan: &DtypePlan, mut chunk: Chunk) -> TaskResult {
    let started = Instant::now();
    let raw_bytes = chunk.memory_bytes;
    let failure = match chunk.rows().cloned() {
        None => Some("chunk has no payload".to_string()),
        Some(raw) => match guarded(transform, raw) {
            Ok(mut df) => {
                plan.apply(&mut df);
                chunk.set_rows(df);
                chunk.optimized = true;
                None
            }
            Err(e) => Some(e.to_string()),
        },
    };
    let busy = started.elapsed();
    chunk.processing_time += busy;
    TaskResult {
        chunk,
        busy,
        raw_bytes,
        failure,
    }
}

/// Transform both halves of the chunk separately and stitch them back.
fn run_split(transform: &Transform, plan: &DtypePlan, chunk: &mut Chunk) -> Result<()> {
    let raw = chunk
        .rows()
        .cloned()
        .ok_or_else(|| SheetflowError::ProcessingError("chunk has no payload".to_string()))?;
    let height = raw.height();
    if height < 2 {
        return Err(SheetflowError::ProcessingError(
            "chunk too small to split".to_string(),
        ));
    }
    let mid = height / 2;
    let mut joined = guarded(transform, raw.slice(0, mid))?;
    let tail = guarded(transform, raw.slice(mid as i64, height - mid))?;
    joined.vstack_mut(&tail)?;
    plan.apply(&mut joined);
    chunk.set_rows(joined);
    chunk.optimized = true;
    Ok(())
}

/// Runs transformations over chunk traversals.
pub struct ChunkProcessor {
    config: ChunkProcessorConfig,
    probe: Arc<dyn MemoryProbe>,
    metrics: Arc<Mutex<ProcessorMetrics>>,
}

impl ChunkProcessor {
    pub fn new(config: ChunkProcessorConfig, probe: Arc<dyn MemoryProbe>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            probe,
            metrics: Arc::new(Mutex::new(ProcessorMetrics::default())),
        })
    }

    pub fn config(&self) -> &ChunkProcessorConfig {
        &self.config
    }

    /// Chunk size a traversal of `handle` starts with.
    pub fn effective_chunk_size(&self, handle: &dyn TableHandle) -> usize {
        if self.config.adaptive_sizing {
            SizeBand::from_bytes(handle.memory_bytes() as u64).chunk_size()
        } else {
            self.config.chunk_size
        }
    }

    /// Process every chunk of `handle`. Resets the metrics.
    pub fn process<'t>(
        &self,
        handle: Arc<dyn TableHandle>,
        transform: &'t Transform,
    ) -> Result<ProcessedChunks<'t>> {
        let chunk_size = self.effective_chunk_size(handle.as_ref());
        *self.metrics.lock() = ProcessorMetrics::for_run(self.worker_count(), chunk_size);
        info!(
            source = handle.locator(),
            rows = handle.len(),
            chunk_size,
            parallel = self.config.parallel,
            "Starting chunk processing"
        );
        self.traverse(handle, 0, 0, chunk_size, transform)
    }

    /// Resume processing at `start_row`, numbering chunks from `first_id`.
    ///
    /// Metrics keep accumulating from the previous run.
    pub fn process_from<'t>(
        &self,
        handle: Arc<dyn TableHandle>,
        start_row: usize,
        first_id: usize,
        chunk_size: usize,
        transform: &'t Transform,
    ) -> Result<ProcessedChunks<'t>> {
        let chunk_size = chunk_size.max(1);
        {
            let mut metrics = self.metrics.lock();
            metrics.workers = self.worker_count();
            metrics.effective_chunk_size = chunk_size;
        }
        debug!(start_row, first_id, chunk_size, "Resuming chunk processing");
        self.traverse(handle, start_row, first_id, chunk_size, transform)
    }

    pub fn metrics(&self) -> ProcessorMetrics {
        self.metrics.lock().clone()
    }

    fn worker_count(&self) -> usize {
        if self.config.parallel {
            self.config.max_workers
        } else {
            1
        }
    }

    /// Column types every chunk of a traversal over `handle` is narrowed to.
    fn plan_for(&self, handle: &dyn TableHandle) -> Result<DtypePlan> {
        let level = self.config.optimization_level;
        if level == OptimizationLevel::Conservative || handle.is_empty() {
            return Ok(DtypePlan::default());
        }
        let full = match handle.view(0, handle.len()) {
            Ok(df) => df,
            Err(_) => handle.read_range(0, handle.len())?,
        };
        let plan = DtypePlan::from_frame(&full, level);
        debug!(columns = plan.len(), "Planned dtype narrowing");
        Ok(plan)
    }

    fn traverse<'t>(
        &self,
        handle: Arc<dyn TableHandle>,
        start_row: usize,
        first_id: usize,
        chunk_size: usize,
        transform: &'t Transform,
    ) -> Result<ProcessedChunks<'t>> {
        let plan = self.plan_for(handle.as_ref())?;
        let mut reader_config = ReaderConfig::new(chunk_size);
        if let Some(budget) = self.config.memory_budget_mb {
            reader_config = reader_config.with_memory_budget_mb(budget);
        }
        let reader = ChunkReader::from_handle(handle, reader_config, Arc::clone(&self.probe))?
            .starting_at(start_row, first_id);

        let pool = if self.config.parallel {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(self.config.max_workers)
                    .thread_name(|i| format!("sheetflow-worker-{i}"))
                    .build()
                    .map_err(|e| SheetflowError::ThreadPoolError(e.to_string()))?,
            )
        } else {
            None
        };

        Ok(ProcessedChunks {
            reader,
            transform,
            pool,
            plan,
            depth: self.config.window_depth(),
            error_recovery: self.config.error_recovery,
            min_chunk_size: self.config.min_chunk_size,
            ready: VecDeque::new(),
            pending_error: None,
            exhausted: false,
            metrics: Arc::clone(&self.metrics),
        })
    }
}

/// Lazy sequence of processed chunks in ascending id order.
///
/// A failed transformation never ends the sequence: the raw chunk is yielded
/// with `optimized == false`. Errors from reading the source are yielded once,
/// after every chunk read before them.
pub struct ProcessedChunks<'t> {
    reader: ChunkReader,
    transform: &'t Transform,
    pool: Option<rayon::ThreadPool>,
    plan: DtypePlan,
    depth: usize,
    error_recovery: bool,
    min_chunk_size: usize,
    ready: VecDeque<Chunk>,
    pending_error: Option<SheetflowError>,
    exhausted: bool,
    metrics: Arc<Mutex<ProcessorMetrics>>,
}

impl<'t> ProcessedChunks<'t> {
    pub fn chunk_size(&self) -> usize {
        self.reader.chunk_size()
    }

    /// Resize chunks not yet read. Already buffered chunks keep their size.
    pub fn set_chunk_size(&mut self, chunk_size: usize) {
        self.reader.set_chunk_size(chunk_size);
        self.metrics.lock().effective_chunk_size = self.reader.chunk_size();
    }

    /// First source row not yet read
    pub fn position(&self) -> usize {
        self.reader.position()
    }

    pub fn total_rows(&self) -> usize {
        self.reader.total_rows()
    }

    pub fn metrics(&self) -> ProcessorMetrics {
        self.metrics.lock().clone()
    }

    fn halve_chunk_size(&mut self) -> usize {
        let halved = (self.reader.chunk_size() / 2).max(self.min_chunk_size);
        self.reader.set_chunk_size(halved);
        halved
    }

    fn read_window(&mut self) -> Vec<Chunk> {
        let mut window = Vec::with_capacity(self.depth);
        let mut retried = false;
        while window.len() < self.depth {
            match self.reader.next() {
                None => break,
                Some(Ok(chunk)) => {
                    retried = false;
                    window.push(chunk);
                }
                Some(Err(e @ SheetflowError::MemoryBudgetExceeded { .. }))
                    if self.error_recovery && !retried =>
                {
                    retried = true;
                    let halved = self.halve_chunk_size();
                    warn!(error = %e, chunk_size = halved, "Memory budget exceeded, retrying with smaller chunks");
                    if let Err(e) = self.reader.rebaseline() {
                        self.pending_error = Some(e);
                        break;
                    }
                    self.metrics.lock().record_recovery(halved);
                }
                Some(Err(e)) => {
                    self.pending_error = Some(e);
                    break;
                }
            }
        }
        window
    }

    fn run_parallel(&self, pool: &rayon::ThreadPool, window: Vec<Chunk>) -> Vec<Chunk> {
        let transform = self.transform;
        let plan = &self.plan;
        let tasks = window.len();
        let started = Instant::now();
        let mut results: Vec<TaskResult> = pool.install(|| {
            window
                .into_par_iter()
                .map(|chunk| run_task(transform, plan, chunk))
                .collect()
        });
        let elapsed = started.elapsed();
        results.sort_by_key(|r| r.chunk.id);

        let mut metrics = self.metrics.lock();
        for result in &results {
            if let Some(reason) = &result.failure {
                metrics.thread_safety_violations += 1;
                let violation = SheetflowError::ThreadSafetyViolation {
                    chunk_id: result.chunk.id,
                    reason: reason.clone(),
                };
                warn!(error = %violation, "Parallel task failed, using unoptimized chunk");
            }
            metrics.record_task(result);
        }
        metrics.record_window(elapsed, tasks);
        results.into_iter().map(|r| r.chunk).collect()
    }

    fn run_sequential(&mut self, window: Vec<Chunk>) -> Vec<Chunk> {
        let mut out = Vec::with_capacity(window.len());
        for chunk in window {
            let started = Instant::now();
            let mut result = run_task(self.transform, &self.plan, chunk);

            if let Some(reason) = result.failure.take() {
                let recovered = self.error_recovery
                    && match run_split(self.transform, &self.plan, &mut result.chunk) {
                        Ok(()) => true,
                        Err(e) => {
                            debug!(chunk_id = result.chunk.id, error = %e, "Split retry failed");
                            false
                        }
                    };
                if recovered {
                    let halved = self.halve_chunk_size();
                    self.metrics.lock().record_recovery(halved);
                    info!(chunk_id = result.chunk.id, chunk_size = halved, "Recovered chunk at half size");
                } else {
                    warn!(chunk_id = result.chunk.id, error = %reason, "Chunk transformation failed, using unoptimized chunk");
                }
                result.busy = started.elapsed();
            }

            let mut metrics = self.metrics.lock();
            metrics.record_task(&result);
            metrics.record_window(started.elapsed(), 1);
            drop(metrics);
            out.push(result.chunk);
        }
        out
    }

    fn advance(&mut self) -> Option<Result<Chunk>> {
        loop {
            if let Some(chunk) = self.ready.pop_front() {
                debug!(chunk_id = chunk.id, rows = chunk.row_count, "Processed chunk");
                return Some(Ok(chunk));
            }
            if let Some(e) = self.pending_error.take() {
                self.exhausted = true;
                return Some(Err(e));
            }
            if self.exhausted {
                return None;
            }

            let window = self.read_window();
            if window.is_empty() {
                if self.pending_error.is_none() {
                    self.exhausted = true;
                }
                continue;
            }

            let processed = match self.pool.take() {
                Some(pool) => {
                    let processed = self.run_parallel(&pool, window);
                    self.pool = Some(pool);
                    processed
                }
                None => self.run_sequential(window),
            };
            self.ready.extend(processed);
        }
    }
}

impl Iterator for ProcessedChunks<'_> {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        let started = Instant::now();
        let item = self.advance();
        self.metrics.lock().record_wall(started.elapsed());
        item
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::probe::testing::ScriptedProbe;
    use crate::memory::probe::SystemProbe;
    use crate::source::LoadedTable;

    fn table(n: usize) -> Arc<dyn TableHandle> {
        let df = df!(
            "id" => (0..n as i64).collect::<Vec<_>>(),
            "value" => (0..n).map(|i| i as f64 * 0.5).collect::<Vec<_>>()
        )
        .unwrap();
        Arc::new(LoadedTable::new("t", df))
    }

    fn doubled(df: DataFrame) -> Result<DataFrame> {
        let doubled = df.column("value")?.as_materialized_series() * 2.0;
        let mut df = df;
        df.with_column(doubled.with_name("doubled".into()))?;
        Ok(df)
    }

    fn first_id(df: &DataFrame) -> i64 {
        df.column("id")
            .unwrap()
            .cast(&DataType::Int64)
            .unwrap()
            .as_materialized_series()
            .i64()
            .unwrap()
            .get(0)
            .unwrap()
    }

    fn sequential(chunk_size: usize) -> ChunkProcessorConfig {
        ChunkProcessorConfig::default()
            .with_chunk_size(chunk_size)
            .with_parallel(false)
    }

    #[test]
    fn test_sequential_processing_in_order() {
        let processor = ChunkProcessor::new(sequential(1000), SystemProbe::shared()).unwrap();
        let chunks: Vec<Chunk> = processor
            .process(table(4500), &doubled)
            .unwrap()
            .map(|c| c.unwrap())
            .collect();

        assert_eq!(chunks.len(), 5);
        assert!(chunks.iter().enumerate().all(|(i, c)| c.id == i && c.optimized));
        assert!(chunks[0].rows().unwrap().column("doubled").is_ok());
        let metrics = processor.metrics();
        assert_eq!(metrics.rows_processed, 4500);
        assert_eq!(metrics.chunks_processed, 5);
        assert_eq!(metrics.thread_safety_violations, 0);
    }

    #[test]
    fn test_parallel_output_sorted_by_id() {
        let config = ChunkProcessorConfig::default()
            .with_chunk_size(500)
            .with_max_workers(4);
        let processor = ChunkProcessor::new(config, SystemProbe::shared()).unwrap();
        let ids: Vec<usize> = processor
            .process(table(10_000), &doubled)
            .unwrap()
            .map(|c| c.unwrap().id)
            .collect();

        assert_eq!(ids, (0..20).collect::<Vec<_>>());
        let metrics = processor.metrics();
        assert_eq!(metrics.workers, 4);
        assert!(metrics.worker_utilization > 0.0);
        assert!(metrics.parallel_efficiency <= 1.0);
    }

    #[test]
    fn test_panicking_task_is_replaced_by_fallback() {
        let config = ChunkProcessorConfig::default()
            .with_chunk_size(500)
            .with_max_workers(4);
        let processor = ChunkProcessor::new(config, SystemProbe::shared()).unwrap();
        let flaky = |df: DataFrame| -> Result<DataFrame> {
            if first_id(&df) == 1500 {
                panic!("worker blew up");
            }
            doubled(df)
        };

        let chunks: Vec<Chunk> = processor
            .process(table(10_000), &flaky)
            .unwrap()
            .map(|c| c.unwrap())
            .collect();

        assert_eq!(chunks.len(), 20);
        assert!(chunks.windows(2).all(|w| w[0].id < w[1].id));
        assert!(!chunks[3].optimized);
        assert!(chunks[3].rows().unwrap().column("doubled").is_err());
        assert_eq!(chunks[3].len(), 500);
        assert!(chunks.iter().filter(|c| c.id != 3).all(|c| c.optimized));
        assert_eq!(processor.metrics().thread_safety_violations, 1);
        assert_eq!(processor.metrics().fallback_chunks, 1);
    }

    #[test]
    fn test_sequential_failure_retries_at_half_size() {
        let processor = ChunkProcessor::new(sequential(600), SystemProbe::shared()).unwrap();
        let picky = |df: DataFrame| -> Result<DataFrame> {
            if df.height() > 300 {
                return Err(SheetflowError::ProcessingError("too many rows".to_string()));
            }
            doubled(df)
        };

        let chunks: Vec<Chunk> = processor
            .process(table(1200), &picky)
            .unwrap()
            .map(|c| c.unwrap())
            .collect();

        // 600 fails and is split, the rest are read at 300
        assert_eq!(chunks[0].len(), 600);
        assert_eq!(chunks[1].len(), 300);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.optimized));
        assert_eq!(chunks[0].rows().unwrap().height(), 600);
        let metrics = processor.metrics();
        assert_eq!(metrics.error_recovery_count, 1);
        assert_eq!(metrics.effective_chunk_size, 300);
    }

    #[test]
    fn test_unrecoverable_failure_yields_raw_chunk() {
        let config = sequential(100).with_error_recovery(false);
        let processor = ChunkProcessor::new(config, SystemProbe::shared()).unwrap();
        let failing = |_: DataFrame| -> Result<DataFrame> {
            Err(SheetflowError::ProcessingError("nope".to_string()))
        };
        let chunks: Vec<Chunk> = processor
            .process(table(250), &failing)
            .unwrap()
            .map(|c| c.unwrap())
            .collect();
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| !c.optimized && c.has_payload()));
        assert_eq!(processor.metrics().fallback_chunks, 3);
    }

    #[test]
    fn test_adaptive_sizing_uses_size_band() {
        let config = sequential(123).with_adaptive_sizing(true);
        let processor = ChunkProcessor::new(config, SystemProbe::shared()).unwrap();
        let handle = table(12_000);
        assert_eq!(processor.effective_chunk_size(handle.as_ref()), 5000);
        let sizes: Vec<usize> = processor
            .process(handle, &doubled)
            .unwrap()
            .map(|c| c.unwrap().len())
            .collect();
        assert_eq!(sizes, vec![5000, 5000, 2000]);
    }

    #[test]
    fn test_size_bands() {
        assert_eq!(SizeBand::from_bytes(1024), SizeBand::Small);
        assert_eq!(SizeBand::from_bytes(50 * 1024 * 1024), SizeBand::Medium);
        assert_eq!(SizeBand::from_bytes(2 * 1024 * 1024 * 1024), SizeBand::Large);
    }

    #[test]
    fn test_budget_overrun_halves_and_retries() {
        let probe = ScriptedProbe::new(200.0, 10.0);
        // baseline, chunk 0 check, chunk 1 check (over), rebaseline
        probe.queue_process_mb(&[100.0, 100.0, 200.0, 200.0]);
        let config = sequential(1000).with_memory_budget_mb(10.0);
        let processor = ChunkProcessor::new(config, probe).unwrap();

        let sizes: Vec<usize> = processor
            .process(table(4000), &doubled)
            .unwrap()
            .map(|c| c.unwrap().len())
            .collect();

        assert_eq!(sizes, vec![1000, 500, 500, 500, 500, 500, 500]);
        assert_eq!(processor.metrics().error_recovery_count, 1);
    }

    #[test]
    fn test_repeated_budget_overrun_surfaces_error() {
        let probe = ScriptedProbe::new(400.0, 10.0);
        // baseline, chunk 0 check (over), rebaseline, retry check (over)
        probe.queue_process_mb(&[100.0, 200.0, 200.0, 300.0]);
        let config = sequential(1000).with_memory_budget_mb(10.0);
        let processor = ChunkProcessor::new(config, probe).unwrap();

        let mut chunks = processor.process(table(4000), &doubled).unwrap();
        let err = chunks.next().unwrap().unwrap_err();
        assert_eq!(err.kind(), "memory_budget_exceeded");
        assert!(chunks.next().is_none());
    }

    #[test]
    fn test_process_from_continues_ids() {
        let processor = ChunkProcessor::new(sequential(250), SystemProbe::shared()).unwrap();
        let chunks: Vec<Chunk> = processor
            .process_from(table(1000), 500, 2, 250, &doubled)
            .unwrap()
            .map(|c| c.unwrap())
            .collect();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].id, 2);
        assert_eq!(chunks[0].start_row(), 500);
        assert_eq!(first_id(chunks[1].rows().unwrap()), 750);
    }

    #[test]
    fn test_set_chunk_size_mid_stream() {
        let processor = ChunkProcessor::new(sequential(400), SystemProbe::shared()).unwrap();
        let mut chunks = processor.process(table(1000), &doubled).unwrap();
        assert_eq!(chunks.next().unwrap().unwrap().len(), 400);
        chunks.set_chunk_size(100);
        let rest: Vec<usize> = chunks.map(|c| c.unwrap().len()).collect();
        assert_eq!(rest, vec![100; 6]);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config = ChunkProcessorConfig::default().with_max_workers(0);
        assert!(ChunkProcessor::new(config, SystemProbe::shared()).is_err());
    }

    #[test]
    fn test_chunks_of_one_run_share_dtypes() {
        let config = ChunkProcessorConfig::default()
            .with_chunk_size(10_000)
            .with_max_workers(3)
            .with_optimization_level(OptimizationLevel::Moderate);
        let processor = ChunkProcessor::new(config, SystemProbe::shared()).unwrap();
        let chunks: Vec<Chunk> = processor
            .process(table(70_000), &doubled)
            .unwrap()
            .map(|c| c.unwrap())
            .collect();
        assert_eq!(chunks.len(), 7);

        let mut stacked = chunks[0].rows().unwrap().clone();
        for chunk in &chunks[1..] {
            let rows = chunk.rows().unwrap();
            assert_eq!(rows.column("id").unwrap().dtype(), &DataType::Int32);
            stacked.vstack_mut(rows).unwrap();
        }
        assert_eq!(stacked.height(), 70_000);
        assert_eq!(first_id(&stacked), 0);
    }
}
