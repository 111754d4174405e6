//! Buffer Pool
//!
//! Reuse of table-shaped buffers bucketed by shape and schema, with LRU
//! eviction, a process-memory ceiling, and automatic cleanup.

use parking_lot::Mutex;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::monitor::MonitoredComponent;
use super::probe::{MemoryProbe, MB};
use crate::error::{Result, SheetflowError};
use crate::source::SchemaKey;

/// Estimated allocation cost avoided per reused MB, in milliseconds.
const ALLOC_MS_PER_MB: f64 = 0.25;

/// Configuration for [`BufferPool`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferPoolConfig {
    /// Maximum entries held by the pool
    pub max_pool_size: usize,
    /// Process-memory ceiling checked before every acquire, in MB
    pub max_memory_mb: f64,
    /// Relative row/column difference still considered compatible
    pub size_tolerance: f64,
    /// Evict the LRU entry when full; otherwise refuse new entries
    pub enable_eviction: bool,
    /// Pool memory / ceiling ratio that triggers cleanup
    pub auto_cleanup_threshold: f64,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            max_pool_size: 32,
            max_memory_mb: 1024.0,
            size_tolerance: 0.2,
            enable_eviction: true,
            auto_cleanup_threshold: 0.8,
        }
    }
}

impl BufferPoolConfig {
    pub fn with_max_pool_size(mut self, size: usize) -> Self {
        self.max_pool_size = size;
        self
    }

    pub fn with_max_memory_mb(mut self, mb: f64) -> Self {
        self.max_memory_mb = mb;
        self
    }

    pub fn with_size_tolerance(mut self, tolerance: f64) -> Self {
        self.size_tolerance = tolerance;
        self
    }

    pub fn with_eviction(mut self, enabled: bool) -> Self {
        self.enable_eviction = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_pool_size == 0 {
            return Err(SheetflowError::ConfigError("max_pool_size must be > 0".to_string()));
        }
        if self.max_memory_mb <= 0.0 {
            return Err(SheetflowError::ConfigError("max_memory_mb must be > 0".to_string()));
        }
        if !(0.0..1.0).contains(&self.size_tolerance) {
            return Err(SheetflowError::ConfigError(
                "size_tolerance must be in [0, 1)".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.auto_cleanup_threshold) || self.auto_cleanup_threshold == 0.0 {
            return Err(SheetflowError::ConfigError(
                "auto_cleanup_threshold must be in (0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}

/// Rows × columns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BufferShape {
    pub rows: usize,
    pub cols: usize,
}

impl BufferShape {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }

    pub fn of(df: &DataFrame) -> Self {
        Self::new(df.height(), df.width())
    }

    /// Both dimensions within `tolerance` relative difference.
    pub fn within_tolerance(&self, other: &BufferShape, tolerance: f64) -> bool {
        fn close(a: usize, b: usize, tolerance: f64) -> bool {
            let largest = a.max(b);
            if largest == 0 {
                return true;
            }
            (a.abs_diff(b) as f64 / largest as f64) <= tolerance
        }
        close(self.rows, other.rows, tolerance) && close(self.cols, other.cols, tolerance)
    }
}

/// Shape and schema signature of a pooled buffer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BufferKey {
    pub shape: BufferShape,
    pub schema: SchemaKey,
}

/// Buffer size category by row count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferCategory {
    /// Fewer than 1,000 rows
    Small,
    /// 1,000 - 100,000 rows
    Medium,
    /// More than 100,000 rows
    Large,
}

impl BufferCategory {
    pub fn from_rows(rows: usize) -> Self {
        if rows < 1_000 {
            BufferCategory::Small
        } else if rows <= 100_000 {
            BufferCategory::Medium
        } else {
            BufferCategory::Large
        }
    }
}

/// Where an acquired buffer came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferOrigin {
    Fresh,
    Pooled,
}

/// A table-shaped buffer owned by whoever acquired it
#[derive(Debug)]
pub struct PooledBuffer {
    key: BufferKey,
    payload: Option<DataFrame>,
    created_at: Instant,
    last_accessed: Instant,
    access_count: u64,
    memory_bytes: usize,
    origin: BufferOrigin,
}

impl PooledBuffer {
    fn fresh(key: BufferKey) -> Self {
        let now = Instant::now();
        Self {
            key,
            payload: None,
            created_at: now,
            last_accessed: now,
            access_count: 1,
            memory_bytes: 0,
            origin: BufferOrigin::Fresh,
        }
    }

    pub fn key(&self) -> &BufferKey {
        &self.key
    }

    pub fn origin(&self) -> BufferOrigin {
        self.origin
    }

    pub fn is_pooled(&self) -> bool {
        self.origin == BufferOrigin::Pooled
    }

    pub fn payload(&self) -> Option<&DataFrame> {
        self.payload.as_ref()
    }

    /// Store a table in the buffer, replacing any previous payload.
    pub fn set_payload(&mut self, df: DataFrame) {
        self.memory_bytes = df.estimated_size();
        self.payload = Some(df);
    }

    pub fn take_payload(&mut self) -> Option<DataFrame> {
        self.memory_bytes = 0;
        self.payload.take()
    }

    /// Drop the payload and return the bytes it held.
    pub fn clear_payload(&mut self) -> usize {
        let freed = self.memory_bytes;
        self.payload = None;
        self.memory_bytes = 0;
        freed
    }

    pub fn memory_bytes(&self) -> usize {
        self.memory_bytes
    }

    pub fn access_count(&self) -> u64 {
        self.access_count
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_time(&self) -> Duration {
        self.last_accessed.elapsed()
    }

    fn touch(&mut self) {
        self.last_accessed = Instant::now();
        self.access_count += 1;
    }
}

/// Result of returning a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Admitted,
    /// Admitted after evicting the least recently used entry
    AdmittedWithEviction,
    /// Pool full and eviction disabled; the buffer was dropped
    Rejected,
}

/// Count of pooled entries per size category
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SizeHistogram {
    pub small: usize,
    pub medium: usize,
    pub large: usize,
}

/// Snapshot of pool statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolStatistics {
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    pub pooled_entries: usize,
    /// Bytes held by pooled payloads
    pub memory_usage_bytes: usize,
    pub size_histogram: SizeHistogram,
    pub eviction_count: u64,
    pub rejected_count: u64,
    pub cleanup_count: u64,
    pub bytes_freed: u64,
    pub estimated_time_saved_ms: f64,
    pub estimated_memory_saved_bytes: u64,
}

/// Pool of reusable [`PooledBuffer`]s.
///
/// Entries are kept in LRU order: front is least recently used.
pub struct BufferPool {
    config: BufferPoolConfig,
    /// Current ceiling in MB, as f64 bits
    max_memory_mb: AtomicU64,
    probe: Arc<dyn MemoryProbe>,
    entries: Mutex<VecDeque<PooledBuffer>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    rejections: AtomicU64,
    cleanups: AtomicU64,
    bytes_freed: AtomicU64,
    reused_bytes: AtomicU64,
}

impl BufferPool {
    pub fn new(config: BufferPoolConfig, probe: Arc<dyn MemoryProbe>) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            max_memory_mb: AtomicU64::new(config.max_memory_mb.to_bits()),
            config,
            probe,
            entries: Mutex::new(VecDeque::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
            cleanups: AtomicU64::new(0),
            bytes_freed: AtomicU64::new(0),
            reused_bytes: AtomicU64::new(0),
        }))
    }

    /// Configuration the pool was built with. The ceiling may since have moved.
    pub fn config(&self) -> &BufferPoolConfig {
        &self.config
    }

    pub fn max_memory_mb(&self) -> f64 {
        f64::from_bits(self.max_memory_mb.load(Ordering::Relaxed))
    }

    /// Move the process-memory ceiling checked by `acquire`.
    pub fn set_max_memory_mb(&self, mb: f64) -> Result<()> {
        if mb.is_nan() || mb <= 0.0 {
            return Err(SheetflowError::ConfigError("max_memory_mb must be > 0".to_string()));
        }
        self.max_memory_mb.store(mb.to_bits(), Ordering::Relaxed);
        debug!(max_memory_mb = mb, "Buffer pool ceiling updated");
        Ok(())
    }

    fn check_memory_ceiling(&self) -> Result<()> {
        let current = match self.probe.process_bytes() {
            Ok(bytes) => bytes as f64 / MB,
            Err(e) => {
                warn!(error = %e, "Memory probe failed, skipping pool ceiling check");
                return Ok(());
            }
        };
        let limit = self.max_memory_mb();
        if current > limit {
            return Err(SheetflowError::MemoryLimitExceeded {
                current_mb: current,
                limit_mb: limit,
            });
        }
        Ok(())
    }

    /// Get a buffer compatible with `shape` and `schema`.
    ///
    /// Fails with `MemoryLimitExceeded` when the process is over the ceiling.
    pub fn acquire(&self, shape: BufferShape, schema: &SchemaKey) -> Result<PooledBuffer> {
        self.check_memory_ceiling()?;

        let mut entries = self.entries.lock();
        let tolerance = self.config.size_tolerance;

        // Most recently used first
        let found = entries
            .iter()
            .rposition(|b| &b.key.schema == schema && b.key.shape.within_tolerance(&shape, tolerance));

        if let Some(index) = found {
            if let Some(mut buffer) = entries.remove(index) {
                drop(entries);
                buffer.touch();
                buffer.origin = BufferOrigin::Pooled;
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.reused_bytes
                    .fetch_add(buffer.memory_bytes as u64, Ordering::Relaxed);
                return Ok(buffer);
            }
        }
        drop(entries);

        self.misses.fetch_add(1, Ordering::Relaxed);
        Ok(PooledBuffer::fresh(BufferKey {
            shape,
            schema: schema.clone(),
        }))
    }

    /// Return a buffer to the pool as most recently used.
    pub fn release(&self, mut buffer: PooledBuffer) -> ReleaseOutcome {
        let mut entries = self.entries.lock();
        let mut outcome = ReleaseOutcome::Admitted;

        if entries.len() >= self.config.max_pool_size {
            if !self.config.enable_eviction {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                return ReleaseOutcome::Rejected;
            }
            if let Some(mut evicted) = entries.pop_front() {
                let freed = evicted.clear_payload();
                self.bytes_freed.fetch_add(freed as u64, Ordering::Relaxed);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                outcome = ReleaseOutcome::AdmittedWithEviction;
            }
        }

        buffer.last_accessed = Instant::now();
        entries.push_back(buffer);

        let pool_bytes: usize = entries.iter().map(|b| b.memory_bytes).sum();
        let ceiling = self.max_memory_mb() * MB;
        let needs_cleanup = pool_bytes as f64 / ceiling >= self.config.auto_cleanup_threshold;
        drop(entries);

        if needs_cleanup {
            self.cleanup();
        }
        outcome
    }

    /// Evict the oldest third of entries (keeping at least two) and drop their payloads.
    ///
    /// Returns the bytes freed.
    pub fn cleanup(&self) -> u64 {
        let mut entries = self.entries.lock();
        let len = entries.len();
        if len <= 2 {
            return 0;
        }
        let to_evict = len.div_ceil(3).min(len - 2);

        let mut by_age: Vec<(usize, Instant)> =
            entries.iter().enumerate().map(|(i, b)| (i, b.created_at)).collect();
        by_age.sort_by_key(|&(_, created)| created);
        let mut doomed: Vec<usize> = by_age.into_iter().take(to_evict).map(|(i, _)| i).collect();
        doomed.sort_unstable_by(|a, b| b.cmp(a));

        let mut freed = 0u64;
        for index in doomed {
            if let Some(mut evicted) = entries.remove(index) {
                freed += evicted.clear_payload() as u64;
            }
        }
        drop(entries);

        self.evictions.fetch_add(to_evict as u64, Ordering::Relaxed);
        self.cleanups.fetch_add(1, Ordering::Relaxed);
        self.bytes_freed.fetch_add(freed, Ordering::Relaxed);
        debug!(evicted = to_evict, freed_bytes = freed, "Buffer pool cleanup");
        freed
    }

    /// Drop every pooled entry. Returns the bytes freed.
    pub fn clear(&self) -> u64 {
        let drained: Vec<PooledBuffer> = self.entries.lock().drain(..).collect();
        let freed: u64 = drained.into_iter().map(|mut b| b.clear_payload() as u64).sum();
        self.bytes_freed.fetch_add(freed, Ordering::Relaxed);
        freed
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Bytes held by pooled payloads
    pub fn memory_usage(&self) -> usize {
        self.entries.lock().iter().map(|b| b.memory_bytes).sum()
    }

    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total > 0 {
            hits as f64 / total as f64
        } else {
            0.0
        }
    }

    pub fn statistics(&self) -> PoolStatistics {
        let (pooled_entries, memory_usage_bytes, size_histogram) = {
            let entries = self.entries.lock();
            let mut histogram = SizeHistogram::default();
            for buffer in entries.iter() {
                match BufferCategory::from_rows(buffer.key.shape.rows) {
                    BufferCategory::Small => histogram.small += 1,
                    BufferCategory::Medium => histogram.medium += 1,
                    BufferCategory::Large => histogram.large += 1,
                }
            }
            let bytes = entries.iter().map(|b| b.memory_bytes).sum();
            (entries.len(), bytes, histogram)
        };

        let reused = self.reused_bytes.load(Ordering::Relaxed);
        PoolStatistics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            hit_ratio: self.hit_ratio(),
            pooled_entries,
            memory_usage_bytes,
            size_histogram,
            eviction_count: self.evictions.load(Ordering::Relaxed),
            rejected_count: self.rejections.load(Ordering::Relaxed),
            cleanup_count: self.cleanups.load(Ordering::Relaxed),
            bytes_freed: self.bytes_freed.load(Ordering::Relaxed),
            estimated_time_saved_ms: reused as f64 / MB * ALLOC_MS_PER_MB,
            estimated_memory_saved_bytes: reused,
        }
    }
}

impl MonitoredComponent for BufferPool {
    fn memory_bytes(&self) -> u64 {
        self.memory_usage() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::probe::testing::ScriptedProbe;

    fn schema() -> SchemaKey {
        SchemaKey::new(["a", "b", "c", "d", "e"])
    }

    fn pool(config: BufferPoolConfig) -> Arc<BufferPool> {
        BufferPool::new(config, ScriptedProbe::new(100.0, 40.0)).unwrap()
    }

    fn frame(rows: usize) -> DataFrame {
        df!("a" => (0..rows as i64).collect::<Vec<_>>()).unwrap()
    }

    #[test]
    fn test_miss_without_release_then_hit_within_tolerance() {
        let pool = pool(BufferPoolConfig::default().with_size_tolerance(0.2));

        let first = pool.acquire(BufferShape::new(1000, 5), &schema()).unwrap();
        let second = pool.acquire(BufferShape::new(1000, 5), &schema()).unwrap();
        assert_eq!(first.origin(), BufferOrigin::Fresh);
        assert_eq!(second.origin(), BufferOrigin::Fresh);

        pool.release(first);
        let third = pool.acquire(BufferShape::new(1050, 5), &schema()).unwrap();
        assert_eq!(third.origin(), BufferOrigin::Pooled);
        assert_eq!(third.access_count(), 2);

        let stats = pool.statistics();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert!((stats.hit_ratio - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_schema_mismatch_is_miss() {
        let pool = pool(BufferPoolConfig::default());
        let buffer = pool.acquire(BufferShape::new(100, 2), &SchemaKey::new(["x", "y"])).unwrap();
        pool.release(buffer);

        let other = pool.acquire(BufferShape::new(100, 2), &SchemaKey::new(["x", "z"])).unwrap();
        assert_eq!(other.origin(), BufferOrigin::Fresh);
    }

    #[test]
    fn test_outside_tolerance_is_miss() {
        let pool = pool(BufferPoolConfig::default().with_size_tolerance(0.1));
        let buffer = pool.acquire(BufferShape::new(1000, 5), &schema()).unwrap();
        pool.release(buffer);

        let other = pool.acquire(BufferShape::new(1500, 5), &schema()).unwrap();
        assert_eq!(other.origin(), BufferOrigin::Fresh);
    }

    #[test]
    fn test_lru_eviction_caps_pool_size() {
        let pool = pool(BufferPoolConfig::default().with_max_pool_size(3));
        for rows in [10, 2_000, 40_000, 800_000] {
            let buffer = pool.acquire(BufferShape::new(rows, 1), &schema()).unwrap();
            pool.release(buffer);
            assert!(pool.len() <= 3);
        }
        let stats = pool.statistics();
        assert_eq!(stats.pooled_entries, 3);
        assert_eq!(stats.eviction_count, 1);
        // 10-row entry was LRU and got evicted
        assert_eq!(stats.size_histogram.small, 0);
        assert_eq!(stats.size_histogram.medium, 2);
        assert_eq!(stats.size_histogram.large, 1);
    }

    #[test]
    fn test_rejects_when_eviction_disabled() {
        let pool = pool(BufferPoolConfig::default().with_max_pool_size(1).with_eviction(false));
        let a = pool.acquire(BufferShape::new(10, 1), &schema()).unwrap();
        let b = pool.acquire(BufferShape::new(99_999, 1), &schema()).unwrap();
        assert_eq!(pool.release(a), ReleaseOutcome::Admitted);
        assert_eq!(pool.release(b), ReleaseOutcome::Rejected);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.statistics().rejected_count, 1);
    }

    #[test]
    fn test_memory_ceiling_fails_fast() {
        let probe = ScriptedProbe::new(2048.0, 40.0);
        let pool = BufferPool::new(BufferPoolConfig::default().with_max_memory_mb(1024.0), probe).unwrap();
        let result = pool.acquire(BufferShape::new(10, 1), &schema());
        assert!(matches!(result, Err(SheetflowError::MemoryLimitExceeded { .. })));
    }

    #[test]
    fn test_raised_ceiling_admits_acquire() {
        let probe = ScriptedProbe::new(1500.0, 40.0);
        let pool = BufferPool::new(BufferPoolConfig::default(), probe).unwrap();
        assert!(pool.acquire(BufferShape::new(10, 1), &schema()).is_err());

        pool.set_max_memory_mb(8192.0).unwrap();
        assert_eq!(pool.max_memory_mb(), 8192.0);
        assert!(pool.acquire(BufferShape::new(10, 1), &schema()).is_ok());
        assert!(pool.set_max_memory_mb(0.0).is_err());
        assert_eq!(pool.config().max_memory_mb, 1024.0);
    }

    #[test]
    fn test_reuse_of_filled_buffer_counts_savings() {
        let pool = pool(BufferPoolConfig::default());
        let mut buffer = pool.acquire(BufferShape::new(1000, 1), &SchemaKey::new(["a"])).unwrap();
        buffer.set_payload(frame(1000));
        let held = buffer.memory_bytes();
        assert!(held > 0);
        pool.release(buffer);
        assert_eq!(pool.memory_usage(), held);

        let mut reused = pool.acquire(BufferShape::new(1000, 1), &SchemaKey::new(["a"])).unwrap();
        assert!(reused.is_pooled());
        let stats = pool.statistics();
        assert_eq!(stats.estimated_memory_saved_bytes, held as u64);
        assert!(stats.estimated_time_saved_ms > 0.0);

        assert_eq!(reused.take_payload().map(|df| df.height()), Some(1000));
        assert_eq!(reused.memory_bytes(), 0);
    }

    #[test]
    fn test_cleanup_keeps_at_least_two() {
        let pool = pool(BufferPoolConfig::default());
        for rows in [1, 100, 10_000] {
            let mut buffer = pool.acquire(BufferShape::new(rows, 1), &schema()).unwrap();
            buffer.set_payload(frame(rows));
            pool.release(buffer);
        }
        let freed = pool.cleanup();
        assert!(freed > 0);
        assert_eq!(pool.len(), 2);

        pool.cleanup();
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_auto_cleanup_on_release() {
        // Tiny ceiling so a single payload crosses the threshold
        let config = BufferPoolConfig {
            max_memory_mb: 0.01,
            auto_cleanup_threshold: 0.5,
            ..Default::default()
        };
        let probe = ScriptedProbe::new(0.0, 40.0);
        let pool = BufferPool::new(config, probe).unwrap();

        for rows in [5_000, 5_001, 5_002, 5_003] {
            let mut buffer = pool
                .acquire(BufferShape::new(rows, 1), &SchemaKey::new([format!("c{rows}")]))
                .unwrap();
            buffer.set_payload(frame(rows));
            pool.release(buffer);
        }
        let stats = pool.statistics();
        assert!(stats.cleanup_count > 0);
        assert!(stats.bytes_freed > 0);
        assert!(stats.pooled_entries >= 2);
    }

    #[test]
    fn test_clear_frees_payloads() {
        let pool = pool(BufferPoolConfig::default());
        let mut buffer = pool.acquire(BufferShape::new(100, 1), &schema()).unwrap();
        buffer.set_payload(frame(100));
        pool.release(buffer);
        assert!(pool.memory_usage() > 0);

        assert!(pool.clear() > 0);
        assert!(pool.is_empty());
        assert_eq!(pool.memory_usage(), 0);
    }
}
