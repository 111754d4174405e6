//! Memory Alerts
//!
//! Alert levels, watermark thresholds, and the alert value type dispatched by
//! the memory monitor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SheetflowError};

/// Severity of a memory alert, ordered `Warning < Critical < Emergency`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Warning,
    Critical,
    Emergency,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Warning => "warning",
            AlertLevel::Critical => "critical",
            AlertLevel::Emergency => "emergency",
        }
    }

    fn base_severity(&self) -> f64 {
        match self {
            AlertLevel::Warning => 0.3,
            AlertLevel::Critical => 0.6,
            AlertLevel::Emergency => 0.9,
        }
    }

    /// Default remediation hint
    pub fn suggested_action(&self) -> &'static str {
        match self {
            AlertLevel::Warning => "reduce chunk size or release pooled buffers",
            AlertLevel::Critical => "run cleanup and flush the buffer pool",
            AlertLevel::Emergency => "apply emergency mitigation: shrink chunks, drop retained payloads",
        }
    }
}

/// Watermarks in percent, `warning <= critical <= emergency`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlertThresholds {
    pub warning: f64,
    pub critical: f64,
    pub emergency: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            warning: 80.0,
            critical: 90.0,
            emergency: 95.0,
        }
    }
}

impl AlertThresholds {
    pub fn new(warning: f64, critical: f64, emergency: f64) -> Result<Self> {
        let thresholds = Self {
            warning,
            critical,
            emergency,
        };
        thresholds.validate()?;
        Ok(thresholds)
    }

    pub fn validate(&self) -> Result<()> {
        let in_range = |v: f64| v > 0.0 && v <= 100.0;
        if !(in_range(self.warning) && in_range(self.critical) && in_range(self.emergency)) {
            return Err(SheetflowError::ConfigError(format!(
                "alert thresholds must be in (0, 100]: {:?}",
                self
            )));
        }
        if !(self.warning <= self.critical && self.critical <= self.emergency) {
            return Err(SheetflowError::ConfigError(format!(
                "alert thresholds must satisfy warning <= critical <= emergency: {:?}",
                self
            )));
        }
        Ok(())
    }

    /// Highest level whose threshold `usage_pct` reaches, if any.
    pub fn level_for(&self, usage_pct: f64) -> Option<AlertLevel> {
        if usage_pct >= self.emergency {
            Some(AlertLevel::Emergency)
        } else if usage_pct >= self.critical {
            Some(AlertLevel::Critical)
        } else if usage_pct >= self.warning {
            Some(AlertLevel::Warning)
        } else {
            None
        }
    }

    pub fn threshold_for(&self, level: AlertLevel) -> f64 {
        match level {
            AlertLevel::Warning => self.warning,
            AlertLevel::Critical => self.critical,
            AlertLevel::Emergency => self.emergency,
        }
    }
}

/// An alert raised by the memory monitor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryAlert {
    pub level: AlertLevel,
    /// Memory in use when the alert fired, in bytes
    pub usage_bytes: u64,
    /// Usage as a percentage of the relevant limit
    pub usage_pct: f64,
    /// Threshold that was crossed, in percent
    pub threshold_pct: f64,
    pub timestamp: DateTime<Utc>,
    /// Set for component-scoped alerts
    pub source_component: Option<String>,
    pub suggested_action: String,
    /// 0–1, grows with level and with distance past the threshold
    pub severity_score: f64,
}

impl MemoryAlert {
    pub fn new(level: AlertLevel, usage_bytes: u64, usage_pct: f64, threshold_pct: f64) -> Self {
        Self {
            level,
            usage_bytes,
            usage_pct,
            threshold_pct,
            timestamp: Utc::now(),
            source_component: None,
            suggested_action: level.suggested_action().to_string(),
            severity_score: severity_score(level, usage_pct, threshold_pct),
        }
    }

    pub fn for_component(mut self, name: impl Into<String>) -> Self {
        self.source_component = Some(name.into());
        self
    }

    pub fn with_suggested_action(mut self, action: impl Into<String>) -> Self {
        self.suggested_action = action.into();
        self
    }
}

fn severity_score(level: AlertLevel, usage_pct: f64, threshold_pct: f64) -> f64 {
    let headroom = (100.0 - threshold_pct).max(1.0);
    let overshoot = ((usage_pct - threshold_pct) / headroom).clamp(0.0, 1.0);
    (level.base_severity() + 0.1 * overshoot).min(1.0)
}
