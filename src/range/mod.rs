//! Sub-range extraction over cached sources.

mod cache;
pub mod extractor;

pub use cache::{CacheEntry, SourceCache};
pub use extractor::{
    CellValue, RangeExtractorConfig, RangeStats, RangeView, RangeViewExtractor, Record, Records,
};
