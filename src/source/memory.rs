//! In-memory data source
//!
//! Serves DataFrames registered under a name. Useful for embedding the engine
//! behind another reader and for tests.

use parking_lot::RwLock;
use polars::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

use super::{DataSource, LoadedTable, SourceMetadata, TableHandle};
use crate::error::{Result, SheetflowError};

/// Named DataFrames served as tables
#[derive(Default)]
pub struct MemorySource {
    tables: RwLock<HashMap<String, DataFrame>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a table
    pub fn insert(&self, name: impl Into<String>, df: DataFrame) {
        self.tables.write().insert(name.into(), df);
    }

    /// Builder-style register
    pub fn with_table(self, name: impl Into<String>, df: DataFrame) -> Self {
        self.insert(name, df);
        self
    }

    pub fn remove(&self, name: &str) -> Option<DataFrame> {
        self.tables.write().remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.read().contains_key(name)
    }
}

impl DataSource for MemorySource {
    fn probe(&self, locator: &str) -> Result<SourceMetadata> {
        let tables = self.tables.read();
        let df = tables
            .get(locator)
            .ok_or_else(|| SheetflowError::NotFound(locator.to_string()))?;
        Ok(SourceMetadata {
            locator: locator.to_string(),
            size_bytes: df.estimated_size() as u64,
            path: None,
        })
    }

    fn open(&self, locator: &str) -> Result<Arc<dyn TableHandle>> {
        let tables = self.tables.read();
        let df = tables
            .get(locator)
            .ok_or_else(|| SheetflowError::NotFound(locator.to_string()))?;
        Ok(Arc::new(LoadedTable::new(locator, df.clone())))
    }
}
