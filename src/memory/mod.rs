//! Memory Module
//!
//! Memory probes, threshold alerts, a shape-keyed buffer pool,
//! and the background memory monitor.

pub mod alerts;
pub mod monitor;
pub mod pool;
pub mod probe;

pub use alerts::{AlertLevel, AlertThresholds, MemoryAlert};
pub use monitor::{
    ComponentHealth, HealthStatus, MemoryMonitor, MonitorConfig, MonitoredComponent,
    MonitoringStatistics, OptimizationKind, OptimizationRecord, TickReport,
};
pub use pool::{
    BufferCategory, BufferKey, BufferOrigin, BufferPool, BufferPoolConfig, BufferShape,
    PoolStatistics, PooledBuffer, ReleaseOutcome, SizeHistogram,
};
pub use probe::{MemoryProbe, MemorySample, SystemProbe, MB};
