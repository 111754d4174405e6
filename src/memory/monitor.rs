//! Memory Monitor
//!
//! Background sampling of process and system memory with threshold alerts,
//! automatic reclaim actions, per-component tracking, and rolling statistics.
//! One monitor owns at most one sampling thread.

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::alerts::{AlertLevel, AlertThresholds, MemoryAlert};
use super::probe::{MemoryProbe, MemorySample};
use crate::error::{Result, SheetflowError};

/// Anything whose memory footprint the monitor can track.
pub trait MonitoredComponent: Send + Sync {
    /// Current footprint in bytes
    fn memory_bytes(&self) -> u64;
}

/// Health of a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
    Unknown,
}

/// Snapshot of a registered component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub memory_bytes: u64,
    pub baseline_bytes: u64,
    pub limit_bytes: u64,
    /// Growth over the baseline, saturating at zero
    pub delta_bytes: u64,
    pub last_checked: DateTime<Utc>,
}

/// Reclaim action triggered by an optimization threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationKind {
    /// Routine collection (`auto_gc` threshold)
    Collect,
    /// Cache and pool cleanup (`cleanup` threshold)
    Cleanup,
    /// Aggressive collection (`emergency_optimization` threshold)
    AggressiveCollect,
}

/// One executed optimization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationRecord {
    pub kind: OptimizationKind,
    pub bytes_freed: u64,
    pub usage_pct: f64,
    pub timestamp: DateTime<Utc>,
}

/// Configuration for [`MemoryMonitor`]
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Time between samples
    pub monitoring_interval: Duration,
    /// Alert watermarks, percent of total system memory
    pub thresholds: AlertThresholds,
    /// Keep a ring of recent samples
    pub enable_history: bool,
    pub history_size: usize,
    /// Run reclaim actions when optimization thresholds are reached
    pub enable_auto_optimization: bool,
    pub auto_gc_threshold: f64,
    pub cleanup_threshold: f64,
    pub emergency_optimization_threshold: f64,
    /// Minimum time between two optimizations
    pub optimization_cooldown: Duration,
    /// Consecutive loop errors before the monitor stops itself
    pub max_error_threshold: u32,
    /// Errors closer together than this double the sleep
    pub rapid_error_window: Duration,
    pub max_backoff_factor: u32,
    /// Recent alerts kept for inspection
    pub alert_log_size: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            monitoring_interval: Duration::from_secs(1),
            thresholds: AlertThresholds::default(),
            enable_history: true,
            history_size: 1000,
            enable_auto_optimization: true,
            auto_gc_threshold: 75.0,
            cleanup_threshold: 85.0,
            emergency_optimization_threshold: 92.0,
            optimization_cooldown: Duration::from_secs(5),
            max_error_threshold: 5,
            rapid_error_window: Duration::from_secs(5),
            max_backoff_factor: 8,
            alert_log_size: 256,
        }
    }
}

impl MonitorConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.monitoring_interval = interval;
        self
    }

    pub fn with_thresholds(mut self, thresholds: AlertThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_auto_optimization(mut self, enabled: bool) -> Self {
        self.enable_auto_optimization = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.thresholds.validate()?;
        if self.monitoring_interval.is_zero() {
            return Err(SheetflowError::ConfigError(
                "monitoring_interval must be > 0".to_string(),
            ));
        }
        if self.max_error_threshold == 0 {
            return Err(SheetflowError::ConfigError(
                "max_error_threshold must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    fn optimization_for(&self, usage_pct: f64) -> Option<OptimizationKind> {
        if usage_pct >= self.emergency_optimization_threshold {
            Some(OptimizationKind::AggressiveCollect)
        } else if usage_pct >= self.cleanup_threshold {
            Some(OptimizationKind::Cleanup)
        } else if usage_pct >= self.auto_gc_threshold {
            Some(OptimizationKind::Collect)
        } else {
            None
        }
    }
}

/// Snapshot of monitor statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitoringStatistics {
    pub running: bool,
    pub samples: u64,
    pub current_process_bytes: u64,
    pub current_system_pct: f64,
    pub peak_process_bytes: u64,
    pub average_process_bytes: f64,
    pub variance: f64,
    pub std_dev: f64,
    pub warning_alerts: u64,
    pub critical_alerts: u64,
    pub emergency_alerts: u64,
    pub component_alerts: u64,
    pub optimizations_run: u64,
    pub bytes_freed: u64,
    pub error_count: u64,
    pub consecutive_errors: u32,
    /// Set when the loop stopped itself after too many errors
    pub self_shutdown: bool,
    pub history_len: usize,
    pub registered_components: usize,
}

/// What one monitoring iteration did
#[derive(Debug, Clone)]
pub struct TickReport {
    pub sample: MemorySample,
    pub alerts: Vec<MemoryAlert>,
    pub optimization: Option<OptimizationRecord>,
}

type AlertHandler = Box<dyn Fn(&MemoryAlert) + Send + Sync>;
type OptimizationHandler = Box<dyn Fn(OptimizationKind) -> u64 + Send + Sync>;

struct RegisteredComponent {
    handle: Weak<dyn MonitoredComponent>,
    baseline_bytes: u64,
    limit_bytes: u64,
    over_limit: bool,
}

#[derive(Default)]
struct RollingStats {
    count: u64,
    mean: f64,
    m2: f64,
    peak: u64,
}

impl RollingStats {
    fn push(&mut self, value: u64) {
        self.count += 1;
        let x = value as f64;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
        self.peak = self.peak.max(value);
    }

    fn variance(&self) -> f64 {
        if self.count > 0 {
            self.m2 / self.count as f64
        } else {
            0.0
        }
    }
}

#[derive(Default)]
struct MonitorState {
    history: VecDeque<MemorySample>,
    latest: Option<MemorySample>,
    alerts: VecDeque<MemoryAlert>,
    optimizations: VecDeque<OptimizationRecord>,
    components: HashMap<String, RegisteredComponent>,
    health: HashMap<String, ComponentHealth>,
    stats: RollingStats,
    last_level: Option<AlertLevel>,
    last_optimization: Option<Instant>,
    alert_counts: [u64; 3],
    component_alerts: u64,
    optimizations_run: u64,
    bytes_freed: u64,
    error_count: u64,
    consecutive_errors: u32,
    last_error_at: Option<Instant>,
    backoff_factor: u32,
    self_shutdown: bool,
}

struct MonitorShared {
    config: Mutex<MonitorConfig>,
    probe: Arc<dyn MemoryProbe>,
    state: Mutex<MonitorState>,
    alert_handlers: RwLock<Vec<AlertHandler>>,
    optimization_handlers: RwLock<Vec<OptimizationHandler>>,
    running: AtomicBool,
    wake: Mutex<bool>,
    wake_signal: Condvar,
}

impl MonitorShared {
    fn tick(&self) -> Result<TickReport> {
        let sample = self.probe.sample()?;
        let usage_pct = sample.system_used_pct();
        let config = self.config.lock().clone();

        let mut alerts = Vec::new();
        let (pending_optimization, live_components) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            if config.enable_history {
                state.history.push_back(sample.clone());
                while state.history.len() > config.history_size {
                    state.history.pop_front();
                }
            }
            state.latest = Some(sample.clone());
            state.stats.push(sample.process_bytes);

            // Fire on a rising level; re-arm as the level falls
            let level = config.thresholds.level_for(usage_pct);
            if let Some(level) = level {
                if state.last_level.map_or(true, |last| level > last) {
                    let threshold = config.thresholds.threshold_for(level);
                    alerts.push(MemoryAlert::new(
                        level,
                        sample
                            .system_total_bytes
                            .saturating_sub(sample.system_available_bytes),
                        usage_pct,
                        threshold,
                    ));
                }
            }
            state.last_level = level;

            let cooled_down = state
                .last_optimization
                .map_or(true, |at| at.elapsed() >= config.optimization_cooldown);
            let pending = if config.enable_auto_optimization && cooled_down {
                config.optimization_for(usage_pct)
            } else {
                None
            };

            let before = state.components.len();
            state.components.retain(|_, c| c.handle.strong_count() > 0);
            let pruned = before - state.components.len();
            if pruned > 0 {
                debug!(pruned, "Pruned dropped components");
            }
            let live: Vec<(String, Arc<dyn MonitoredComponent>, u64, u64, bool)> = state
                .components
                .iter()
                .filter_map(|(name, c)| {
                    c.handle
                        .upgrade()
                        .map(|h| (name.clone(), h, c.baseline_bytes, c.limit_bytes, c.over_limit))
                })
                .collect();
            state.health.retain(|name, _| state.components.contains_key(name));

            (pending, live)
        };

        // Components are measured outside the state lock
        let mut health_updates = Vec::with_capacity(live_components.len());
        for (name, component, baseline, limit, was_over) in live_components {
            let current = component.memory_bytes();
            let delta = current.saturating_sub(baseline);
            let ratio = if limit > 0 { delta as f64 / limit as f64 } else { 0.0 };
            let over = limit > 0 && delta > limit;

            let status = if ratio > 1.5 {
                HealthStatus::Critical
            } else if over || ratio > 0.8 {
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            };

            if over && !was_over {
                let level = if ratio > 2.0 {
                    AlertLevel::Emergency
                } else if ratio > 1.5 {
                    AlertLevel::Critical
                } else {
                    AlertLevel::Warning
                };
                alerts.push(
                    MemoryAlert::new(level, current, ratio * 100.0, 100.0)
                        .for_component(name.clone())
                        .with_suggested_action(format!("reduce memory held by {name}")),
                );
            }

            health_updates.push((
                over,
                ComponentHealth {
                    name,
                    status,
                    memory_bytes: current,
                    baseline_bytes: baseline,
                    limit_bytes: limit,
                    delta_bytes: delta,
                    last_checked: Utc::now(),
                },
            ));
        }

        let optimization = pending_optimization.map(|kind| {
            let bytes_freed: u64 = self
                .optimization_handlers
                .read()
                .iter()
                .map(|handler| handler(kind))
                .sum();
            debug!(?kind, bytes_freed, usage_pct, "Memory optimization executed");
            OptimizationRecord {
                kind,
                bytes_freed,
                usage_pct,
                timestamp: Utc::now(),
            }
        });

        {
            let mut state = self.state.lock();
            for (over, health) in health_updates {
                if let Some(c) = state.components.get_mut(&health.name) {
                    c.over_limit = over;
                }
                if state.components.contains_key(&health.name) {
                    state.health.insert(health.name.clone(), health);
                }
            }

            for alert in &alerts {
                if alert.source_component.is_some() {
                    state.component_alerts += 1;
                } else {
                    state.alert_counts[alert.level as usize] += 1;
                }
                state.alerts.push_back(alert.clone());
            }
            while state.alerts.len() > config.alert_log_size {
                state.alerts.pop_front();
            }

            if let Some(record) = &optimization {
                state.last_optimization = Some(Instant::now());
                state.optimizations_run += 1;
                state.bytes_freed += record.bytes_freed;
                state.optimizations.push_back(record.clone());
                while state.optimizations.len() > config.alert_log_size {
                    state.optimizations.pop_front();
                }
            }
        }

        if !alerts.is_empty() {
            let handlers = self.alert_handlers.read();
            for alert in &alerts {
                warn!(
                    level = alert.level.as_str(),
                    usage_pct = alert.usage_pct,
                    component = alert.source_component.as_deref().unwrap_or("process"),
                    "Memory alert"
                );
                for handler in handlers.iter() {
                    handler(alert);
                }
            }
        }

        Ok(TickReport {
            sample,
            alerts,
            optimization,
        })
    }

    fn record_success(&self) {
        let mut state = self.state.lock();
        state.consecutive_errors = 0;
        state.backoff_factor = 1;
        state.last_error_at = None;
    }

    /// Returns (consecutive errors, sleep multiplier).
    fn record_error(&self, config: &MonitorConfig) -> (u32, u32) {
        let mut state = self.state.lock();
        let now = Instant::now();
        let rapid = state
            .last_error_at
            .is_some_and(|at| now.duration_since(at) < config.rapid_error_window);
        state.backoff_factor = if rapid {
            (state.backoff_factor.max(1) * 2).min(config.max_backoff_factor.max(1))
        } else {
            1
        };
        state.last_error_at = Some(now);
        state.error_count += 1;
        state.consecutive_errors += 1;
        (state.consecutive_errors, state.backoff_factor)
    }

    fn sleep(&self, duration: Duration) {
        let mut woken = self.wake.lock();
        if !*woken {
            self.wake_signal.wait_for(&mut woken, duration);
        }
        *woken = false;
    }

    fn run_loop(self: Arc<Self>) {
        info!("Memory monitor started");
        while self.running.load(Ordering::SeqCst) {
            let config = self.config.lock().clone();
            let outcome = catch_unwind(AssertUnwindSafe(|| self.tick()));

            let failure = match outcome {
                Ok(Ok(_)) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some("panic inside monitoring iteration".to_string()),
            };

            let mut sleep_for = config.monitoring_interval;
            match failure {
                None => self.record_success(),
                Some(reason) => {
                    let (consecutive, backoff) = self.record_error(&config);
                    warn!(error = %reason, consecutive, "Memory monitor iteration failed");
                    if consecutive >= config.max_error_threshold {
                        error!(
                            consecutive,
                            "Memory monitor stopping after repeated errors"
                        );
                        self.state.lock().self_shutdown = true;
                        self.running.store(false, Ordering::SeqCst);
                        break;
                    }
                    sleep_for *= backoff;
                }
            }

            self.sleep(sleep_for);
        }
        info!("Memory monitor stopped");
    }
}

/// Background memory monitor.
///
/// `Stopped → Running` on [`start`](Self::start), back on [`stop`](Self::stop)
/// or drop. All accessors return snapshots.
pub struct MemoryMonitor {
    shared: Arc<MonitorShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryMonitor {
    pub fn new(config: MonitorConfig, probe: Arc<dyn MemoryProbe>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(MonitorShared {
                config: Mutex::new(config),
                probe,
                state: Mutex::new(MonitorState {
                    backoff_factor: 1,
                    ..Default::default()
                }),
                alert_handlers: RwLock::new(Vec::new()),
                optimization_handlers: RwLock::new(Vec::new()),
                running: AtomicBool::new(false),
                wake: Mutex::new(false),
                wake_signal: Condvar::new(),
            }),
            worker: Mutex::new(None),
        })
    }

    /// Spawn the sampling thread. No-op if already running.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Reap a loop that stopped itself
        if let Some(handle) = worker.take() {
            let _ = handle.join();
        }

        {
            let mut state = self.shared.state.lock();
            state.self_shutdown = false;
            state.consecutive_errors = 0;
            state.backoff_factor = 1;
        }
        *self.shared.wake.lock() = false;

        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("sheetflow-memory-monitor".to_string())
            .spawn(move || shared.run_loop())
            .map_err(|e| {
                self.shared.running.store(false, Ordering::SeqCst);
                SheetflowError::ThreadPoolError(e.to_string())
            })?;
        *worker = Some(handle);
        Ok(())
    }

    /// Signal the sampling thread and wait for it to exit.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        {
            let mut woken = self.shared.wake.lock();
            *woken = true;
            self.shared.wake_signal.notify_all();
        }
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Run one monitoring iteration on the calling thread.
    pub fn tick(&self) -> Result<TickReport> {
        self.shared.tick()
    }

    pub fn config(&self) -> MonitorConfig {
        self.shared.config.lock().clone()
    }

    /// Takes effect from the next iteration.
    pub fn set_monitoring_interval(&self, interval: Duration) {
        if !interval.is_zero() {
            self.shared.config.lock().monitoring_interval = interval;
        }
    }

    pub fn on_alert<F>(&self, handler: F)
    where
        F: Fn(&MemoryAlert) + Send + Sync + 'static,
    {
        self.shared.alert_handlers.write().push(Box::new(handler));
    }

    /// Register a reclaim action. It returns the bytes it freed.
    pub fn on_optimization<F>(&self, handler: F)
    where
        F: Fn(OptimizationKind) -> u64 + Send + Sync + 'static,
    {
        self.shared.optimization_handlers.write().push(Box::new(handler));
    }

    /// Track a component through a non-owning handle.
    ///
    /// The current footprint becomes the baseline; growth beyond `limit_bytes`
    /// raises a component-scoped alert. Re-registering a name replaces it.
    pub fn register_component<C>(&self, name: impl Into<String>, component: &Arc<C>, limit_bytes: u64)
    where
        C: MonitoredComponent + 'static,
    {
        let handle: Weak<dyn MonitoredComponent> = Arc::downgrade(component) as Weak<dyn MonitoredComponent>;
        let baseline_bytes = component.memory_bytes();
        self.shared.state.lock().components.insert(
            name.into(),
            RegisteredComponent {
                handle,
                baseline_bytes,
                limit_bytes,
                over_limit: false,
            },
        );
    }

    pub fn unregister_component(&self, name: &str) -> bool {
        let mut state = self.shared.state.lock();
        state.health.remove(name);
        state.components.remove(name).is_some()
    }

    pub fn statistics(&self) -> MonitoringStatistics {
        let state = self.shared.state.lock();
        let variance = state.stats.variance();
        MonitoringStatistics {
            running: self.is_running(),
            samples: state.stats.count,
            current_process_bytes: state.latest.as_ref().map_or(0, |s| s.process_bytes),
            current_system_pct: state.latest.as_ref().map_or(0.0, |s| s.system_used_pct()),
            peak_process_bytes: state.stats.peak,
            average_process_bytes: state.stats.mean,
            variance,
            std_dev: variance.sqrt(),
            warning_alerts: state.alert_counts[AlertLevel::Warning as usize],
            critical_alerts: state.alert_counts[AlertLevel::Critical as usize],
            emergency_alerts: state.alert_counts[AlertLevel::Emergency as usize],
            component_alerts: state.component_alerts,
            optimizations_run: state.optimizations_run,
            bytes_freed: state.bytes_freed,
            error_count: state.error_count,
            consecutive_errors: state.consecutive_errors,
            self_shutdown: state.self_shutdown,
            history_len: state.history.len(),
            registered_components: state.components.len(),
        }
    }

    pub fn history(&self) -> Vec<MemorySample> {
        self.shared.state.lock().history.iter().cloned().collect()
    }

    pub fn latest_sample(&self) -> Option<MemorySample> {
        self.shared.state.lock().latest.clone()
    }

    pub fn recent_alerts(&self) -> Vec<MemoryAlert> {
        self.shared.state.lock().alerts.iter().cloned().collect()
    }

    pub fn optimizations(&self) -> Vec<OptimizationRecord> {
        self.shared.state.lock().optimizations.iter().cloned().collect()
    }

    pub fn component_health(&self) -> HashMap<String, ComponentHealth> {
        self.shared.state.lock().health.clone()
    }
}

impl Drop for MemoryMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
