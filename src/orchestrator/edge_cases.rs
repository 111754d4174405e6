//! Edge-case detection before a run.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::memory::{MemoryProbe, MB};
use crate::source::SourceMetadata;

/// Condition observed before or during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeCase {
    FileNotFound,
    VeryLargeFile,
    ExtremelyLargeFile,
    HighMemoryPressure,
    HighCpuLoad,
    LowDiskSpace,
    EmptySource,
    Cancelled,
    DeadlineExceeded,
    MemoryRecovery,
    EmergencyMitigation,
}

impl EdgeCase {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeCase::FileNotFound => "file_not_found",
            EdgeCase::VeryLargeFile => "very_large_file",
            EdgeCase::ExtremelyLargeFile => "extremely_large_file",
            EdgeCase::HighMemoryPressure => "high_memory_pressure",
            EdgeCase::HighCpuLoad => "high_cpu_load",
            EdgeCase::LowDiskSpace => "low_disk_space",
            EdgeCase::EmptySource => "empty_source",
            EdgeCase::Cancelled => "cancelled",
            EdgeCase::DeadlineExceeded => "deadline_exceeded",
            EdgeCase::MemoryRecovery => "memory_recovery",
            EdgeCase::EmergencyMitigation => "emergency_mitigation",
        }
    }
}

impl std::fmt::Display for EdgeCase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detection cut-offs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeCaseThresholds {
    pub very_large_mb: f64,
    pub extremely_large_mb: f64,
    /// Process memory over the run's limit
    pub memory_pressure_ratio: f64,
    pub high_cpu_pct: f64,
    /// Free disk below `file size × factor` is low
    pub low_disk_factor: f64,
}

impl Default for EdgeCaseThresholds {
    fn default() -> Self {
        Self {
            very_large_mb: 500.0,
            extremely_large_mb: 1024.0,
            memory_pressure_ratio: 0.8,
            high_cpu_pct: 90.0,
            low_disk_factor: 2.0,
        }
    }
}

/// What detection saw
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvironmentReport {
    pub edge_cases: Vec<EdgeCase>,
    pub file_size_bytes: u64,
    pub process_bytes: u64,
    pub memory_ratio: f64,
    pub cpu_pct: f64,
    pub free_disk_bytes: Option<u64>,
}

impl EnvironmentReport {
    pub fn has(&self, case: EdgeCase) -> bool {
        self.edge_cases.contains(&case)
    }
}

pub fn detect_edge_cases(
    meta: &SourceMetadata,
    probe: &dyn MemoryProbe,
    memory_limit_bytes: u64,
    thresholds: &EdgeCaseThresholds,
) -> EnvironmentReport {
    let mut report = EnvironmentReport {
        file_size_bytes: meta.size_bytes,
        ..Default::default()
    };

    let size_mb = meta.size_bytes as f64 / MB;
    if size_mb > thresholds.extremely_large_mb {
        report.edge_cases.push(EdgeCase::ExtremelyLargeFile);
    } else if size_mb > thresholds.very_large_mb {
        report.edge_cases.push(EdgeCase::VeryLargeFile);
    }

    match probe.process_bytes() {
        Ok(bytes) => {
            report.process_bytes = bytes;
            report.memory_ratio = bytes as f64 / memory_limit_bytes.max(1) as f64;
            if report.memory_ratio > thresholds.memory_pressure_ratio {
                report.edge_cases.push(EdgeCase::HighMemoryPressure);
            }
        }
        Err(e) => warn!(error = %e, "Memory probe failed during edge-case detection"),
    }

    report.cpu_pct = probe.cpu_usage_pct();
    if report.cpu_pct > thresholds.high_cpu_pct {
        report.edge_cases.push(EdgeCase::HighCpuLoad);
    }

    if let Some(path) = &meta.path {
        report.free_disk_bytes = probe.available_disk_bytes(path);
        if let Some(free) = report.free_disk_bytes {
            if (free as f64) < meta.size_bytes as f64 * thresholds.low_disk_factor {
                report.edge_cases.push(EdgeCase::LowDiskSpace);
            }
        }
    }

    debug!(
        edge_cases = ?report.edge_cases,
        size_mb,
        memory_ratio = report.memory_ratio,
        cpu_pct = report.cpu_pct,
        "Edge-case detection finished"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::probe::testing::ScriptedProbe;
    use std::path::PathBuf;

    fn meta(size_mb: f64, path: Option<PathBuf>) -> SourceMetadata {
        SourceMetadata {
            locator: "data.csv".to_string(),
            size_bytes: (size_mb * MB) as u64,
            path,
        }
    }

    const LIMIT: u64 = 1024 * 1024 * 1024;

    #[test]
    fn test_quiet_environment() {
        let probe = ScriptedProbe::new(100.0, 30.0);
        let report = detect_edge_cases(&meta(1.0, None), probe.as_ref(), LIMIT, &Default::default());
        assert!(report.edge_cases.is_empty());
        assert!(report.memory_ratio < 0.2);
    }

    #[test]
    fn test_size_bands() {
        let probe = ScriptedProbe::new(10.0, 30.0);
        let thresholds = EdgeCaseThresholds::default();
        let very = detect_edge_cases(&meta(600.0, None), probe.as_ref(), LIMIT, &thresholds);
        assert_eq!(very.edge_cases, vec![EdgeCase::VeryLargeFile]);
        let extreme = detect_edge_cases(&meta(2048.0, None), probe.as_ref(), LIMIT, &thresholds);
        assert_eq!(extreme.edge_cases, vec![EdgeCase::ExtremelyLargeFile]);
    }

    #[test]
    fn test_pressure_cpu_and_disk() {
        let probe = ScriptedProbe::new(900.0, 30.0);
        probe.set_cpu_pct(97.0);
        probe.set_disk_bytes(Some(1024));
        let report = detect_edge_cases(
            &meta(1.0, Some(PathBuf::from("/tmp/data.csv"))),
            probe.as_ref(),
            LIMIT,
            &Default::default(),
        );
        assert!(report.has(EdgeCase::HighMemoryPressure));
        assert!(report.has(EdgeCase::HighCpuLoad));
        assert!(report.has(EdgeCase::LowDiskSpace));
    }

    #[test]
    fn test_tags_are_snake_case() {
        assert_eq!(EdgeCase::FileNotFound.to_string(), "file_not_found");
        assert_eq!(
            serde_json::to_string(&EdgeCase::EmergencyMitigation).unwrap(),
            "\"emergency_mitigation\""
        );
    }
}
