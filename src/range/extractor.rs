//! Range View Extractor
//!
//! Serves row sub-ranges of cached sources as views over the loaded data where
//! the source supports it, with a copying fallback.

use parking_lot::Mutex;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use super::cache::SourceCache;
use crate::error::{Result, SheetflowError};
use crate::memory::monitor::MonitoredComponent;
use crate::source::{DataSource, TableHandle};

/// Configuration for [`RangeViewExtractor`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeExtractorConfig {
    /// Ranges longer than this are materialized in sub-batches
    pub batch_threshold_rows: usize,
    pub sub_batch_rows: usize,
    pub max_cached_sources: usize,
}

impl Default for RangeExtractorConfig {
    fn default() -> Self {
        Self {
            batch_threshold_rows: 100_000,
            sub_batch_rows: 10_000,
            max_cached_sources: 8,
        }
    }
}

impl RangeExtractorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.sub_batch_rows == 0 || self.max_cached_sources == 0 {
            return Err(SheetflowError::ConfigError(
                "sub_batch_rows and max_cached_sources must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Rows `[start, end)` of one source.
#[derive(Debug, Clone)]
pub struct RangeView {
    pub source_key: String,
    pub start: usize,
    /// Exclusive, clamped to the source length
    pub end: usize,
    rows: DataFrame,
    /// Backed by the cached source rather than a copy
    pub is_view: bool,
    /// The optimized path failed and the copying path was used
    pub used_fallback: bool,
    pub memory_bytes: usize,
}

impl RangeView {
    pub fn rows(&self) -> &DataFrame {
        &self.rows
    }

    pub fn into_rows(self) -> DataFrame {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// One cell of a materialized record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<AnyValue<'_>> for CellValue {
    fn from(value: AnyValue<'_>) -> Self {
        match value {
            AnyValue::Null => CellValue::Null,
            AnyValue::Boolean(b) => CellValue::Bool(b),
            AnyValue::Int8(v) => CellValue::Int(v as i64),
            AnyValue::Int16(v) => CellValue::Int(v as i64),
            AnyValue::Int32(v) => CellValue::Int(v as i64),
            AnyValue::Int64(v) => CellValue::Int(v),
            AnyValue::UInt8(v) => CellValue::Int(v as i64),
            AnyValue::UInt16(v) => CellValue::Int(v as i64),
            AnyValue::UInt32(v) => CellValue::Int(v as i64),
            AnyValue::UInt64(v) => match i64::try_from(v) {
                Ok(v) => CellValue::Int(v),
                Err(_) => CellValue::Float(v as f64),
            },
            AnyValue::Float32(v) => CellValue::Float(v as f64),
            AnyValue::Float64(v) => CellValue::Float(v),
            AnyValue::String(s) => CellValue::Text(s.to_string()),
            AnyValue::StringOwned(s) => CellValue::Text(s.to_string()),
            other => CellValue::Text(other.to_string()),
        }
    }
}

/// One row of cells, in column order
pub type Record = Vec<CellValue>;

/// Materialized rows of a range
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Records {
    pub columns: Vec<String>,
    pub rows: Vec<Record>,
}

/// Extractor counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RangeStats {
    pub cached_sources: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_evictions: u64,
    pub cached_bytes: u64,
    pub ranges_served: u64,
    pub views: u64,
    pub sub_batched: u64,
    pub fallbacks: u64,
}

#[derive(Default)]
struct Counters {
    ranges_served: u64,
    views: u64,
    sub_batched: u64,
    fallbacks: u64,
}

/// Sub-range extraction over cached sources.
pub struct RangeViewExtractor {
    source: Arc<dyn DataSource>,
    config: RangeExtractorConfig,
    cache: Mutex<SourceCache>,
    counters: Mutex<Counters>,
}

impl RangeViewExtractor {
    pub fn new(source: Arc<dyn DataSource>) -> Self {
        Self::with_config(source, RangeExtractorConfig::default())
    }

    pub fn with_config(source: Arc<dyn DataSource>, config: RangeExtractorConfig) -> Self {
        let capacity = config.max_cached_sources;
        Self {
            source,
            config,
            cache: Mutex::new(SourceCache::new(capacity)),
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn config(&self) -> &RangeExtractorConfig {
        &self.config
    }

    /// The cached handle for `locator`, opening it on first use.
    fn handle_for(&self, locator: &str) -> Result<Arc<dyn TableHandle>> {
        // Held across the open so concurrent callers load a source once
        let mut cache = self.cache.lock();
        if let Some(handle) = cache.get(locator) {
            return Ok(handle);
        }
        let handle = self.source.open(locator)?;
        debug!(source = locator, rows = handle.len(), "Cached source");
        if let Some(evicted) = cache.insert(locator.to_string(), Arc::clone(&handle)) {
            debug!(source = %evicted, "Evicted cached source");
        }
        Ok(handle)
    }

    fn materialize_batched(&self, handle: &dyn TableHandle, start: usize, end: usize) -> Result<DataFrame> {
        let step = self.config.sub_batch_rows;
        let mut out = handle.read_range(start, (start + step).min(end))?;
        let mut at = start + step;
        while at < end {
            let next = (at + step).min(end);
            out.vstack_mut(&handle.read_range(at, next)?)?;
            at = next;
        }
        Ok(out)
    }

    /// Extract rows `[start, end)` of `locator`. `end` is clamped to the source length.
    pub fn get_range(&self, locator: &str, start: usize, end: usize) -> Result<RangeView> {
        let handle = self.handle_for(locator)?;
        let len = handle.len();
        if start >= end || start >= len {
            return Err(SheetflowError::InvalidRange { start, end, len });
        }
        let end = end.min(len);
        let rows = end - start;

        let optimized = if rows > self.config.batch_threshold_rows {
            self.materialize_batched(handle.as_ref(), start, end)
                .map(|df| (df, false))
        } else {
            handle.view(start, rows).map(|df| (df, true))
        };

        let mut counters = self.counters.lock();
        counters.ranges_served += 1;
        let (frame, is_view, used_fallback) = match optimized {
            Ok((df, is_view)) => {
                if is_view {
                    counters.views += 1;
                } else {
                    counters.sub_batched += 1;
                }
                (df, is_view, false)
            }
            Err(e) => {
                match &e {
                    SheetflowError::ViewUnsupported(_) => {
                        debug!(source = locator, "Views unsupported, copying range")
                    }
                    _ => warn!(source = locator, error = %e, "Optimized range path failed, copying"),
                }
                let df = handle.read_range(start, end)?;
                counters.fallbacks += 1;
                (df, false, true)
            }
        };

        Ok(RangeView {
            source_key: locator.to_string(),
            start,
            end,
            memory_bytes: if is_view { 0 } else { frame.estimated_size() },
            rows: frame,
            is_view,
            used_fallback,
        })
    }

    /// Materialize rows `[start, end)` as records, converting in sub-batches.
    pub fn get_records(&self, locator: &str, start: usize, end: usize) -> Result<Records> {
        let view = self.get_range(locator, start, end)?;
        let df = view.rows();
        let columns: Vec<String> = df
            .get_column_names()
            .into_iter()
            .map(|s| s.to_string())
            .collect();

        let mut rows = Vec::with_capacity(df.height());
        let mut offset = 0;
        while offset < df.height() {
            let batch_len = self.config.sub_batch_rows.min(df.height() - offset);
            let batch = df.slice(offset as i64, batch_len);
            let series: Vec<&Series> = batch
                .get_columns()
                .iter()
                .map(|c| c.as_materialized_series())
                .collect();
            for i in 0..batch_len {
                let mut record = Vec::with_capacity(series.len());
                for s in &series {
                    record.push(CellValue::from(s.get(i)?));
                }
                rows.push(record);
            }
            offset += batch_len;
        }

        Ok(Records { columns, rows })
    }

    /// Drop every cached source.
    pub fn clear_cache(&self) -> usize {
        self.cache.lock().clear()
    }

    /// Number of cached sources
    pub fn get_cache_size(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn stats(&self) -> RangeStats {
        let cache = self.cache.lock();
        let counters = self.counters.lock();
        RangeStats {
            cached_sources: cache.len(),
            cache_hits: cache.hits(),
            cache_misses: cache.misses(),
            cache_evictions: cache.evictions(),
            cached_bytes: cache.memory_bytes(),
            ranges_served: counters.ranges_served,
            views: counters.views,
            sub_batched: counters.sub_batched,
            fallbacks: counters.fallbacks,
        }
    }
}

impl MonitoredComponent for RangeViewExtractor {
    fn memory_bytes(&self) -> u64 {
        self.cache.lock().memory_bytes()
    }
}
