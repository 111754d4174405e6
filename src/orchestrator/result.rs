//! Outcome of one orchestrated run.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::edge_cases::EdgeCase;
use crate::error::{Result, SheetflowError};
use crate::memory::ComponentHealth;
use crate::source::Chunk;

/// Final state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    /// Completed after memory recovery or emergency mitigation
    PartialRecovery,
    Failure,
}

/// Everything a caller learns about a run. Always produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingResult {
    pub success: bool,
    pub status: RunStatus,
    pub source: String,
    pub rows_processed: usize,
    pub chunks_processed: usize,
    pub processing_time_secs: f64,
    pub peak_memory_bytes: u64,
    pub error: Option<String>,
    /// Stable error tag, see [`SheetflowError::kind`]
    pub error_kind: Option<String>,
    pub edge_cases: Vec<EdgeCase>,
    pub recovery_attempts: u32,
    pub optimizations_applied: Vec<String>,
    pub component_health: BTreeMap<String, ComponentHealth>,
    pub degraded: bool,
    pub effective_chunk_size: usize,
    pub warnings: Vec<String>,
}

impl ProcessingResult {
    pub(crate) fn started(source: &str) -> Self {
        Self {
            success: false,
            status: RunStatus::Failure,
            source: source.to_string(),
            rows_processed: 0,
            chunks_processed: 0,
            processing_time_secs: 0.0,
            peak_memory_bytes: 0,
            error: None,
            error_kind: None,
            edge_cases: Vec::new(),
            recovery_attempts: 0,
            optimizations_applied: Vec::new(),
            component_health: BTreeMap::new(),
            degraded: false,
            effective_chunk_size: 0,
            warnings: Vec::new(),
        }
    }

    pub(crate) fn add_edge_case(&mut self, case: EdgeCase) {
        if !self.edge_cases.contains(&case) {
            self.edge_cases.push(case);
        }
    }

    pub(crate) fn fail(&mut self, error: &SheetflowError) {
        self.success = false;
        self.status = RunStatus::Failure;
        self.error = Some(error.to_string());
        self.error_kind = Some(error.kind().to_string());
    }

    pub(crate) fn succeed(&mut self) {
        self.success = true;
        self.status = if self.degraded {
            RunStatus::PartialRecovery
        } else {
            RunStatus::Success
        };
        self.error = None;
        self.error_kind = None;
    }

    pub fn has_edge_case(&self, case: EdgeCase) -> bool {
        self.edge_cases.contains(&case)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// A result together with the chunks the run produced.
#[derive(Debug)]
pub struct ProcessingOutput {
    pub result: ProcessingResult,
    pub chunks: Vec<Chunk>,
}
