//! Source Module
//!
//! The `DataSource` boundary consumed by the engine, the generic polars-backed
//! loaders, and the bounded-memory chunk reader.

mod file;
mod memory;
pub mod reader;

use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{Result, SheetflowError};

pub use file::{FileSource, SourceFormat};
pub use memory::MemorySource;
pub use reader::{Chunk, ChunkReader, ReaderConfig};

/// Column-name set identifying a table's schema.
///
/// Only names are compared; column types are deliberately ignored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct SchemaKey(BTreeSet<String>);

impl SchemaKey {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(names.into_iter().map(Into::into).collect())
    }

    pub fn from_frame(df: &DataFrame) -> Self {
        Self::new(df.get_column_names().into_iter().map(|s| s.to_string()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

/// What a source reports about itself before it is loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub locator: String,
    /// Size on disk, or estimated in-memory size for non-file sources
    pub size_bytes: u64,
    /// Filesystem path when the source is a file
    pub path: Option<PathBuf>,
}

/// An opened, row-addressable table.
pub trait TableHandle: Send + Sync {
    /// Locator the handle was opened from
    fn locator(&self) -> &str;

    /// Number of rows
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Column-name set
    fn schema(&self) -> SchemaKey;

    /// Rows `[start, end)`. May copy.
    fn read_range(&self, start: usize, end: usize) -> Result<DataFrame>;

    /// `len` rows from `start` sharing the backing store, when supported.
    fn view(&self, _start: usize, _len: usize) -> Result<DataFrame> {
        Err(SheetflowError::ViewUnsupported(self.locator().to_string()))
    }

    /// Estimated in-memory footprint
    fn memory_bytes(&self) -> usize;
}

/// Capability supplied by format-specific readers.
pub trait DataSource: Send + Sync {
    /// Inspect a source without loading it. `NotFound` when inaccessible.
    fn probe(&self, locator: &str) -> Result<SourceMetadata>;

    /// Open a source for row access. `NotFound` when inaccessible.
    fn open(&self, locator: &str) -> Result<Arc<dyn TableHandle>>;
}

/// A fully loaded DataFrame exposed as a [`TableHandle`].
#[derive(Debug, Clone)]
pub struct LoadedTable {
    locator: String,
    frame: DataFrame,
}

impl LoadedTable {
    pub fn new(locator: impl Into<String>, frame: DataFrame) -> Self {
        Self {
            locator: locator.into(),
            frame,
        }
    }

    pub fn frame(&self) -> &DataFrame {
        &self.frame
    }

    fn check_bounds(&self, start: usize, end: usize) -> Result<()> {
        let len = self.frame.height();
        if start > end || end > len {
            return Err(SheetflowError::InvalidRange { start, end, len });
        }
        Ok(())
    }
}

impl TableHandle for LoadedTable {
    fn locator(&self) -> &str {
        &self.locator
    }

    fn len(&self) -> usize {
        self.frame.height()
    }

    fn schema(&self) -> SchemaKey {
        SchemaKey::from_frame(&self.frame)
    }

    fn read_range(&self, start: usize, end: usize) -> Result<DataFrame> {
        self.check_bounds(start, end)?;
        Ok(self.frame.slice(start as i64, end - start))
    }

    fn view(&self, start: usize, len: usize) -> Result<DataFrame> {
        self.check_bounds(start, start + len)?;
        Ok(self.frame.slice(start as i64, len))
    }

    fn memory_bytes(&self) -> usize {
        self.frame.estimated_size()
    }
}
