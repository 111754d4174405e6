//! Large-File Processor
//!
//! Drives one run end to end: edge-case detection, configuration adaptation,
//! chunk processing under an in-loop memory guard, bounded recovery from
//! memory exhaustion, and quality checks. Every failure becomes a
//! [`ProcessingResult`]; nothing escapes, panics included.

use parking_lot::Mutex;
use polars::prelude::DataFrame;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use super::adaptive::{adapt_config, MIN_CHUNK_SIZE};
use super::edge_cases::{detect_edge_cases, EdgeCase, EdgeCaseThresholds};
use super::options::{CancellationToken, ProcessingOptions, QualityAssuranceLevel};
use super::result::{ProcessingOutput, ProcessingResult};
use crate::error::{panic_message, Result, SheetflowError};
use crate::memory::{
    BufferPool, BufferPoolConfig, BufferShape, ComponentHealth, MemoryMonitor, MemoryProbe,
    MonitorConfig, MonitoringStatistics, OptimizationKind, PoolStatistics, SystemProbe, MB,
};
use crate::processing::{
    ChunkProcessor, ChunkProcessorConfig, OptimizationLevel, ProcessedChunks, ProcessorMetrics,
    Transform,
};
use crate::source::{Chunk, DataSource, SchemaKey, TableHandle};

/// Usage over the limit that forces a collection
const COLLECTION_RATIO: f64 = 0.8;
/// Usage over the limit, after collection, that triggers emergency mitigation
const EMERGENCY_RATIO: f64 = 0.9;

fn passthrough(df: DataFrame) -> Result<DataFrame> {
    Ok(df)
}

struct RunContext<'a> {
    options: &'a ProcessingOptions,
    started: Instant,
    limit_bytes: u64,
    gc_frequency: usize,
    result: ProcessingResult,
    chunks: Vec<Chunk>,
    next_row: usize,
    next_id: usize,
    peak_bytes: u64,
}

impl<'a> RunContext<'a> {
    fn new(locator: &str, options: &'a ProcessingOptions, started: Instant) -> Self {
        Self {
            options,
            started,
            limit_bytes: options.memory_limit_bytes().max(1),
            gc_frequency: 1,
            result: ProcessingResult::started(locator),
            chunks: Vec::new(),
            next_row: 0,
            next_id: 0,
            peak_bytes: 0,
        }
    }

    fn note_optimization(&mut self, name: impl Into<String>) {
        let name = name.into();
        if !self.result.optimizations_applied.contains(&name) {
            self.result.optimizations_applied.push(name);
        }
    }
}

/// Orchestrates large-file runs over one data source.
///
/// Owns its buffer pool and memory monitor; the monitor runs only while a
/// run is in progress.
pub struct LargeFileProcessor {
    source: Arc<dyn DataSource>,
    probe: Arc<dyn MemoryProbe>,
    pool: Arc<BufferPool>,
    monitor: MemoryMonitor,
    thresholds: EdgeCaseThresholds,
    cancel: CancellationToken,
    last_metrics: Mutex<ProcessorMetrics>,
    last_health: Mutex<BTreeMap<String, ComponentHealth>>,
}

impl LargeFileProcessor {
    pub fn new(source: Arc<dyn DataSource>) -> Result<Self> {
        Self::with_probe(source, SystemProbe::shared())
    }

    pub fn with_probe(source: Arc<dyn DataSource>, probe: Arc<dyn MemoryProbe>) -> Result<Self> {
        Self::with_components(
            source,
            probe,
            BufferPoolConfig::default(),
            MonitorConfig::default(),
        )
    }

    pub fn with_components(
        source: Arc<dyn DataSource>,
        probe: Arc<dyn MemoryProbe>,
        pool_config: BufferPoolConfig,
        monitor_config: MonitorConfig,
    ) -> Result<Self> {
        let pool = BufferPool::new(pool_config, Arc::clone(&probe))?;
        let monitor = MemoryMonitor::new(monitor_config, Arc::clone(&probe))?;

        let pool_limit = (pool.config().max_memory_mb * MB) as u64;
        monitor.register_component("buffer_pool", &pool, pool_limit);
        let weak_pool = Arc::downgrade(&pool);
        monitor.on_optimization(move |kind| {
            let Some(pool) = weak_pool.upgrade() else {
                return 0;
            };
            match kind {
                OptimizationKind::Collect => 0,
                OptimizationKind::Cleanup => pool.cleanup(),
                OptimizationKind::AggressiveCollect => pool.clear(),
            }
        });

        Ok(Self {
            source,
            probe,
            pool,
            monitor,
            thresholds: EdgeCaseThresholds::default(),
            cancel: CancellationToken::new(),
            last_metrics: Mutex::new(ProcessorMetrics::default()),
            last_health: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn with_edge_case_thresholds(mut self, thresholds: EdgeCaseThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Token that cancels the current run at the next chunk boundary.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn monitor(&self) -> &MemoryMonitor {
        &self.monitor
    }

    /// Process `locator` without transforming rows.
    pub fn process(&self, locator: &str, options: &ProcessingOptions) -> ProcessingResult {
        self.process_with(locator, options, &passthrough).result
    }

    /// Process `locator`, applying `transform` to every chunk.
    pub fn process_with(
        &self,
        locator: &str,
        options: &ProcessingOptions,
        transform: &Transform,
    ) -> ProcessingOutput {
        let started = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.run(locator, options, transform, started)
        }));

        let mut output = match outcome {
            Ok(output) => output,
            Err(payload) => {
                self.monitor.stop();
                let err = SheetflowError::ProcessingError(format!(
                    "panic during processing: {}",
                    panic_message(&*payload)
                ));
                error!(source = locator, error = %err, "Processing aborted");
                let mut result = ProcessingResult::started(locator);
                result.fail(&err);
                result.component_health = self.get_component_health();
                ProcessingOutput {
                    result,
                    chunks: Vec::new(),
                }
            }
        };
        output.result.processing_time_secs = started.elapsed().as_secs_f64();
        self.cancel.reset();
        output
    }

    fn run(
        &self,
        locator: &str,
        options: &ProcessingOptions,
        transform: &Transform,
        started: Instant,
    ) -> ProcessingOutput {
        let mut ctx = RunContext::new(locator, options, started);
        info!(
            source = locator,
            mode = options.processing_mode.as_str(),
            memory_limit_mb = options.memory_limit_mb,
            "Starting large-file processing"
        );

        if let Err(e) = options.validate() {
            return self.fail_run(ctx, e);
        }

        let meta = match self.source.probe(locator) {
            Ok(meta) => meta,
            Err(e) => return self.fail_run(ctx, e),
        };

        let env = detect_edge_cases(&meta, self.probe.as_ref(), ctx.limit_bytes, &self.thresholds);
        for case in &env.edge_cases {
            ctx.result.add_edge_case(*case);
        }
        ctx.peak_bytes = env.process_bytes;

        let adapted = adapt_config(options, &env.edge_cases);
        ctx.gc_frequency = adapted.gc_frequency;
        ctx.result.effective_chunk_size = adapted.chunk_size;
        debug!(?adapted, "Adapted run configuration");
        if adapted.parallel {
            ctx.note_optimization(format!("parallel_processing(workers={})", adapted.max_workers));
        }
        if adapted.optimization_level != OptimizationLevel::Conservative {
            ctx.note_optimization(format!("dtype_optimization({:?})", adapted.optimization_level).to_lowercase());
        }

        let handle = match self.source.open(locator) {
            Ok(handle) => handle,
            Err(e) => return self.fail_run(ctx, e),
        };
        if handle.is_empty() {
            ctx.result.add_edge_case(EdgeCase::EmptySource);
            ctx.result.succeed();
            return self.finalize(ctx);
        }

        if let Err(e) = self.pool.set_max_memory_mb(options.memory_limit_mb) {
            return self.fail_run(ctx, e);
        }
        self.monitor.register_component("buffer_pool", &self.pool, ctx.limit_bytes);
        self.monitor.set_monitoring_interval(adapted.monitoring_interval);
        if let Err(e) = self.monitor.start() {
            warn!(error = %e, "Memory monitor failed to start");
            ctx.result.warnings.push(format!("memory monitor unavailable: {e}"));
        }

        let config = ChunkProcessorConfig {
            chunk_size: adapted.chunk_size,
            min_chunk_size: MIN_CHUNK_SIZE,
            optimization_level: adapted.optimization_level,
            parallel: adapted.parallel,
            max_workers: adapted.max_workers,
            adaptive_sizing: false,
            pipeline_optimization: true,
            error_recovery: options.enable_auto_recovery,
            memory_budget_mb: Some(options.memory_limit_mb),
        };
        let processor = match ChunkProcessor::new(config, Arc::clone(&self.probe)) {
            Ok(processor) => processor,
            Err(e) => return self.fail_run(ctx, e),
        };

        let outcome = self.process_chunks(&mut ctx, &processor, &handle, transform, adapted.chunk_size);
        let metrics = processor.metrics();
        *self.last_metrics.lock() = metrics.clone();

        match outcome {
            Ok(()) => {
                self.quality_check(&mut ctx, handle.as_ref(), &metrics);
                ctx.result.succeed();
                self.finalize(ctx)
            }
            Err(e) => self.fail_run(ctx, e),
        }
    }

    fn process_chunks(
        &self,
        ctx: &mut RunContext<'_>,
        processor: &ChunkProcessor,
        handle: &Arc<dyn TableHandle>,
        transform: &Transform,
        chunk_size: usize,
    ) -> Result<()> {
        let mut chunk_size = chunk_size;
        let mut attempts = 0u32;
        let mut first_pass = true;

        loop {
            let mut stream = if first_pass {
                first_pass = false;
                processor.process(Arc::clone(handle), transform)?
            } else {
                processor.process_from(Arc::clone(handle), ctx.next_row, ctx.next_id, chunk_size, transform)?
            };
            let outcome = self.drive(ctx, &mut stream);
            chunk_size = stream.chunk_size();
            ctx.result.effective_chunk_size = chunk_size;
            drop(stream);

            let err = match outcome {
                Ok(()) => return Ok(()),
                Err(e) if e.is_out_of_memory() && ctx.options.enable_auto_recovery => e,
                Err(e) => return Err(e),
            };

            ctx.result.add_edge_case(EdgeCase::MemoryRecovery);
            warn!(error = %err, resume_row = ctx.next_row, "Memory exhausted, attempting recovery");

            let mut recovered = false;
            while attempts < ctx.options.max_recovery_attempts {
                attempts += 1;
                ctx.result.recovery_attempts = attempts;
                let ratio = self.recover(ctx);
                info!(attempt = attempts, usage_pct = ratio * 100.0, "Recovery attempt finished");
                if ratio < EMERGENCY_RATIO {
                    recovered = true;
                    break;
                }
            }
            if !recovered {
                return Err(SheetflowError::RecoveryFailed {
                    attempts,
                    reason: err.to_string(),
                });
            }

            ctx.result.degraded = true;
            chunk_size = (chunk_size / 2).max(MIN_CHUNK_SIZE);
            ctx.result.effective_chunk_size = chunk_size;
        }
    }

    fn drive(&self, ctx: &mut RunContext<'_>, stream: &mut ProcessedChunks<'_>) -> Result<()> {
        let mut since_check = 0;
        loop {
            self.check_interrupts(ctx)?;
            let Some(item) = stream.next() else {
                return Ok(());
            };
            let chunk = item?;
            let staged = self.stage_through_pool(&chunk);
            ctx.next_row = chunk.row_range.end;
            ctx.next_id = chunk.id + 1;
            ctx.chunks.push(chunk);
            staged?;

            since_check += 1;
            if since_check >= ctx.gc_frequency {
                since_check = 0;
                self.memory_guard(ctx, stream);
            }
        }
    }

    fn check_interrupts(&self, ctx: &RunContext<'_>) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(SheetflowError::Cancelled);
        }
        if let Some(deadline) = ctx.options.deadline() {
            if ctx.started.elapsed() >= deadline {
                return Err(SheetflowError::DeadlineExceeded(deadline));
            }
        }
        Ok(())
    }

    /// Stage the chunk's rows in a pooled buffer of matching shape.
    ///
    /// The buffer shares the rows with the chunk until it is reused for a
    /// later chunk or flushed, which drops the pool's reference.
    fn stage_through_pool(&self, chunk: &Chunk) -> Result<()> {
        let Some(rows) = chunk.rows() else {
            return Ok(());
        };
        let mut buffer = self
            .pool
            .acquire(BufferShape::of(rows), &SchemaKey::from_frame(rows))?;
        buffer.set_payload(rows.clone());
        self.pool.release(buffer);
        Ok(())
    }

    /// Process memory over the run's limit, tracking the peak.
    fn usage_ratio(&self, ctx: &mut RunContext<'_>) -> Option<f64> {
        match self.probe.process_bytes() {
            Ok(bytes) => {
                ctx.peak_bytes = ctx.peak_bytes.max(bytes);
                Some(bytes as f64 / ctx.limit_bytes as f64)
            }
            Err(e) => {
                warn!(error = %e, "Memory probe failed, skipping memory check");
                None
            }
        }
    }

    fn force_collection(&self, ctx: &mut RunContext<'_>) -> u64 {
        let freed = self.pool.cleanup();
        ctx.note_optimization("forced_collection");
        debug!(freed_bytes = freed, "Forced collection");
        freed
    }

    fn memory_guard(&self, ctx: &mut RunContext<'_>, stream: &mut ProcessedChunks<'_>) {
        let Some(ratio) = self.usage_ratio(ctx) else {
            return;
        };
        if ratio <= COLLECTION_RATIO {
            return;
        }
        self.force_collection(ctx);
        let Some(ratio) = self.usage_ratio(ctx) else {
            return;
        };
        if ratio > EMERGENCY_RATIO {
            self.emergency_mitigation(ctx, stream, ratio);
        }
    }

    fn emergency_mitigation(&self, ctx: &mut RunContext<'_>, stream: &mut ProcessedChunks<'_>, ratio: f64) {
        let chunk_size = (stream.chunk_size() / 3).max(MIN_CHUNK_SIZE);
        stream.set_chunk_size(chunk_size);
        let flushed = self.pool.clear();

        let cut = ctx.chunks.len().saturating_sub(ctx.options.retained_chunks);
        let mut dropped = 0;
        let mut dropped_bytes = 0;
        for chunk in ctx.chunks[..cut].iter_mut().filter(|c| c.has_payload()) {
            dropped_bytes += chunk.clear_payload();
            dropped += 1;
        }

        warn!(
            usage_pct = ratio * 100.0,
            chunk_size,
            flushed_bytes = flushed,
            dropped_payloads = dropped,
            dropped_bytes,
            "Emergency memory mitigation"
        );
        ctx.result.add_edge_case(EdgeCase::EmergencyMitigation);
        ctx.result.degraded = true;
        ctx.result.effective_chunk_size = chunk_size;
        ctx.note_optimization("emergency_mitigation");
        if dropped > 0 {
            ctx.result
                .warnings
                .push(format!("dropped payloads of {dropped} chunks under memory pressure"));
        }
    }

    /// Collect and flush the pool. Returns usage over the limit afterwards.
    fn recover(&self, ctx: &mut RunContext<'_>) -> f64 {
        self.force_collection(ctx);
        self.pool.clear();
        ctx.note_optimization("memory_recovery");
        self.usage_ratio(ctx).unwrap_or(f64::INFINITY)
    }

    fn quality_check(&self, ctx: &mut RunContext<'_>, handle: &dyn TableHandle, metrics: &ProcessorMetrics) {
        let level = ctx.options.quality_assurance_level;
        if level == QualityAssuranceLevel::Basic {
            return;
        }

        let covered: usize = ctx.chunks.iter().map(|c| c.row_count).sum();
        if covered != handle.len() {
            ctx.result.warnings.push(format!(
                "chunks cover {covered} rows but the source has {}",
                handle.len()
            ));
        }
        let contiguous = ctx.chunks.iter().enumerate().all(|(i, c)| c.id == i)
            && ctx
                .chunks
                .windows(2)
                .all(|w| w[0].row_range.end == w[1].row_range.start);
        if !contiguous {
            ctx.result
                .warnings
                .push("chunk ids or row ranges are not contiguous".to_string());
        }

        if level == QualityAssuranceLevel::Enterprise {
            let mut schemas = ctx.chunks.iter().filter_map(|c| c.rows().map(SchemaKey::from_frame));
            if let Some(first) = schemas.next() {
                let changed = schemas.filter(|s| *s != first).count();
                if changed > 0 {
                    ctx.result
                        .warnings
                        .push(format!("{changed} chunks have a different schema from the first"));
                }
            }
            let mut dtypes = ctx.chunks.iter().filter_map(|c| c.rows().map(|df| df.dtypes()));
            if let Some(first) = dtypes.next() {
                let changed = dtypes.filter(|d| *d != first).count();
                if changed > 0 {
                    ctx.result
                        .warnings
                        .push(format!("{changed} chunks have different column types from the first"));
                }
            }
            if metrics.fallback_chunks > 0 {
                ctx.result.warnings.push(format!(
                    "{} chunks were left unoptimized after transformation failures",
                    metrics.fallback_chunks
                ));
            }
            if metrics.thread_safety_violations > 0 {
                ctx.result.warnings.push(format!(
                    "{} parallel tasks failed",
                    metrics.thread_safety_violations
                ));
            }
        }
    }

    fn fail_run(&self, mut ctx: RunContext<'_>, err: SheetflowError) -> ProcessingOutput {
        match &err {
            SheetflowError::NotFound(_) => ctx.result.add_edge_case(EdgeCase::FileNotFound),
            SheetflowError::Cancelled => ctx.result.add_edge_case(EdgeCase::Cancelled),
            SheetflowError::DeadlineExceeded(_) => {
                ctx.result.add_edge_case(EdgeCase::DeadlineExceeded)
            }
            _ => {}
        }
        error!(source = %ctx.result.source, kind = err.kind(), error = %err, "Processing failed");
        ctx.result.fail(&err);
        self.finalize(ctx)
    }

    fn finalize(&self, mut ctx: RunContext<'_>) -> ProcessingOutput {
        if let Err(e) = self.monitor.tick() {
            debug!(error = %e, "Final monitor sample failed");
        }
        self.monitor.stop();

        let health: BTreeMap<String, ComponentHealth> =
            self.monitor.component_health().into_iter().collect();
        *self.last_health.lock() = health.clone();

        let stats = self.monitor.statistics();
        let result = &mut ctx.result;
        result.component_health = health;
        result.peak_memory_bytes = ctx.peak_bytes.max(stats.peak_process_bytes);
        result.rows_processed = ctx.chunks.iter().map(|c| c.row_count).sum();
        result.chunks_processed = ctx.chunks.len();
        result.processing_time_secs = ctx.started.elapsed().as_secs_f64();

        info!(
            source = %result.source,
            status = ?result.status,
            rows = result.rows_processed,
            chunks = result.chunks_processed,
            secs = result.processing_time_secs,
            "Large-file processing finished"
        );
        ProcessingOutput {
            result: ctx.result,
            chunks: ctx.chunks,
        }
    }

    pub fn get_pool_statistics(&self) -> PoolStatistics {
        self.pool.statistics()
    }

    pub fn get_monitoring_statistics(&self) -> MonitoringStatistics {
        self.monitor.statistics()
    }

    /// Metrics of the most recent run
    pub fn get_performance_metrics(&self) -> ProcessorMetrics {
        self.last_metrics.lock().clone()
    }

    pub fn get_component_health(&self) -> BTreeMap<String, ComponentHealth> {
        let live = self.monitor.component_health();
        if live.is_empty() {
            self.last_health.lock().clone()
        } else {
            live.into_iter().collect()
        }
    }
}
