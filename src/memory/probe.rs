//! Memory Probing
//!
//! Samples process and system memory, CPU load, and free disk space.
//! Everything that reads process memory goes through [`MemoryProbe`] so the
//! pool, reader, monitor, and orchestrator can share one sampler.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::{Disks, Pid, ProcessesToUpdate, System, MINIMUM_CPU_UPDATE_INTERVAL};

use crate::error::{Result, SheetflowError};

/// Bytes per megabyte.
pub const MB: f64 = 1024.0 * 1024.0;

/// A point-in-time memory reading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySample {
    /// When the sample was taken
    pub timestamp: DateTime<Utc>,
    /// Resident memory of this process in bytes
    pub process_bytes: u64,
    /// Total physical memory in bytes
    pub system_total_bytes: u64,
    /// Available physical memory in bytes
    pub system_available_bytes: u64,
}

impl MemorySample {
    /// System memory in use as a percentage of total (0–100).
    pub fn system_used_pct(&self) -> f64 {
        if self.system_total_bytes == 0 {
            return 0.0;
        }
        let used = self.system_total_bytes.saturating_sub(self.system_available_bytes);
        used as f64 / self.system_total_bytes as f64 * 100.0
    }

    /// Process resident memory in MB.
    pub fn process_mb(&self) -> f64 {
        self.process_bytes as f64 / MB
    }
}

/// Source of memory, CPU, and disk readings.
pub trait MemoryProbe: Send + Sync {
    /// Take a memory sample.
    fn sample(&self) -> Result<MemorySample>;

    /// Resident memory of this process in bytes.
    fn process_bytes(&self) -> Result<u64> {
        Ok(self.sample()?.process_bytes)
    }

    /// Average CPU usage across cores (0–100).
    fn cpu_usage_pct(&self) -> f64 {
        0.0
    }

    /// Free space on the disk holding `path`, if it can be determined.
    fn available_disk_bytes(&self, _path: &Path) -> Option<u64> {
        None
    }
}

/// Time still to wait before a CPU refresh yields a usable reading.
fn cpu_refresh_wait(since_last: Duration) -> Duration {
    MINIMUM_CPU_UPDATE_INTERVAL.saturating_sub(since_last)
}

/// [`MemoryProbe`] backed by `sysinfo`.
///
/// CPU usage is a delta between two refreshes; the probe refreshes once on
/// construction and each reading waits out the rest of sysinfo's minimum
/// update interval when called sooner.
pub struct SystemProbe {
    system: Mutex<System>,
    cpu_refreshed_at: Mutex<Instant>,
    pid: Pid,
}

impl SystemProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        system.refresh_cpu_usage();
        Self {
            system: Mutex::new(system),
            cpu_refreshed_at: Mutex::new(Instant::now()),
            pid: Pid::from_u32(std::process::id()),
        }
    }

    /// A shared probe, ready to hand to components.
    pub fn shared() -> Arc<dyn MemoryProbe> {
        Arc::new(Self::new())
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemProbe {
    fn sample(&self) -> Result<MemorySample> {
        let mut system = self.system.lock();
        system.refresh_memory();
        system.refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);

        let process_bytes = system
            .process(self.pid)
            .map(|p| p.memory())
            .ok_or_else(|| SheetflowError::ProbeError(format!("process {} not visible", self.pid)))?;

        Ok(MemorySample {
            timestamp: Utc::now(),
            process_bytes,
            system_total_bytes: system.total_memory(),
            system_available_bytes: system.available_memory(),
        })
    }

    fn cpu_usage_pct(&self) -> f64 {
        let mut system = self.system.lock();
        let mut refreshed_at = self.cpu_refreshed_at.lock();
        let wait = cpu_refresh_wait(refreshed_at.elapsed());
        if !wait.is_zero() {
            std::thread::sleep(wait);
        }
        system.refresh_cpu_usage();
        *refreshed_at = Instant::now();
        drop(refreshed_at);
        let cpus = system.cpus();
        if cpus.is_empty() {
            0.0
        } else {
            cpus.iter().map(|c| c.cpu_usage()).sum::<f32>() as f64 / cpus.len() as f64
        }
    }

    fn available_disk_bytes(&self, path: &Path) -> Option<u64> {
        let target = path.canonicalize().ok()?;
        let disks = Disks::new_with_refreshed_list();

        // Longest mount point that prefixes the path
        disks
            .list()
            .iter()
            .filter(|d| target.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .map(|d| d.available_space())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_probe_sample() {
        let probe = SystemProbe::new();
        let sample = probe.sample().unwrap();
        assert!(sample.process_bytes > 0);
        assert!(sample.system_total_bytes > 0);
        assert!((0.0..=100.0).contains(&sample.system_used_pct()));
    }

    #[test]
    fn test_used_pct_handles_zero_total() {
        let sample = MemorySample {
            timestamp: Utc::now(),
            process_bytes: 10,
            system_total_bytes: 0,
            system_available_bytes: 0,
        };
        assert_eq!(sample.system_used_pct(), 0.0);
    }

    #[test]
    fn test_cpu_usage_in_range() {
        let probe = SystemProbe::new();
        let cpu = probe.cpu_usage_pct();
        assert!(cpu.is_finite());
        assert!((0.0..=100.0).contains(&cpu));
    }

    #[test]
    fn test_first_cpu_reading_waits_for_update_interval() {
        assert_eq!(cpu_refresh_wait(Duration::ZERO), MINIMUM_CPU_UPDATE_INTERVAL);
        assert_eq!(cpu_refresh_wait(MINIMUM_CPU_UPDATE_INTERVAL * 2), Duration::ZERO);

        let probe = SystemProbe::new();
        let started = Instant::now();
        probe.cpu_usage_pct();
        assert!(started.elapsed() + Duration::from_millis(5) >= MINIMUM_CPU_UPDATE_INTERVAL);
    }
}
