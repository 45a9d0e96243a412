//! Memory pressure monitoring and the should-cleanup-now decision.
//!
//! The cleaner does not run on a fixed schedule alone; it also fires early
//! when the process is using too large a fraction of system memory. This
//! module owns both triggers and the read-only memory diagnostics.

use serde::Serialize;
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessExt, System, SystemExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Read-only memory diagnostics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MemoryStats {
    /// Resident memory of this process in bytes.
    pub process_bytes: u64,
    /// Total system memory in bytes.
    pub total_bytes: u64,
    /// Process share of system memory (0.0–1.0).
    pub used_fraction: f64,
    /// Seconds since cleanup last ran.
    pub since_last_cleanup: u64,
    /// Garbage-collection requests issued so far.
    pub gc_requests: u64,
}

struct MonitorInner {
    sys: System,
    last_cleanup: Instant,
    gc_requests: u64,
}

/// Decides when cleanup should run and reports memory diagnostics.
pub struct MemoryMonitor {
    cleanup_interval: Duration,
    memory_threshold: f64,
    inner: Mutex<MonitorInner>,
}

impl MemoryMonitor {
    /// Creates a monitor that requests cleanup every `cleanup_interval` or
    /// whenever the process exceeds `memory_threshold` of system memory.
    pub fn new(cleanup_interval: Duration, memory_threshold: f64) -> Self {
        Self {
            cleanup_interval,
            memory_threshold,
            inner: Mutex::new(MonitorInner {
                sys: System::new(),
                last_cleanup: Instant::now(),
                gc_requests: 0,
            }),
        }
    }

    /// True if the cleanup interval has elapsed or process memory is over the
    /// configured threshold.
    pub async fn should_cleanup(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.last_cleanup.elapsed() >= self.cleanup_interval {
            return true;
        }
        let fraction = Self::refresh_fraction(&mut inner.sys);
        if fraction > self.memory_threshold {
            warn!(
                "Process memory at {:.1}% of system, over {:.1}% threshold",
                fraction * 100.0,
                self.memory_threshold * 100.0
            );
            return true;
        }
        false
    }

    /// Records that a cleanup pass just ran.
    pub async fn mark_cleanup(&self) {
        self.inner.lock().await.last_cleanup = Instant::now();
    }

    /// Current memory diagnostics.
    pub async fn get_memory_stats(&self) -> MemoryStats {
        let mut inner = self.inner.lock().await;
        let fraction = Self::refresh_fraction(&mut inner.sys);
        let pid = Pid::from(std::process::id() as usize);
        let process_bytes = inner.sys.process(pid).map(|p| p.memory()).unwrap_or(0);
        MemoryStats {
            process_bytes,
            total_bytes: inner.sys.total_memory(),
            used_fraction: fraction,
            since_last_cleanup: inner.last_cleanup.elapsed().as_secs(),
            gc_requests: inner.gc_requests,
        }
    }

    /// Human-readable alerts for the diagnostics surface.
    pub async fn get_alerts(&self) -> Vec<String> {
        let stats = self.get_memory_stats().await;
        let mut alerts = Vec::new();
        if stats.used_fraction > self.memory_threshold {
            alerts.push(format!(
                "memory: process at {:.1}% of system (threshold {:.1}%)",
                stats.used_fraction * 100.0,
                self.memory_threshold * 100.0
            ));
        }
        if stats.since_last_cleanup > 2 * self.cleanup_interval.as_secs().max(1) {
            alerts.push(format!(
                "cleanup: last ran {}s ago (interval {}s)",
                stats.since_last_cleanup,
                self.cleanup_interval.as_secs()
            ));
        }
        alerts
    }

    /// Requests garbage collection.
    ///
    /// Rust has no collector to invoke; the request is counted and the actual
    /// reclamation happens through the cleaner's trim passes. Kept as an
    /// explicit operation so administrative tooling has something to call.
    pub async fn force_gc(&self) {
        let mut inner = self.inner.lock().await;
        inner.gc_requests += 1;
        debug!("Garbage collection requested ({} total)", inner.gc_requests);
    }

    fn refresh_fraction(sys: &mut System) -> f64 {
        sys.refresh_memory();
        let pid = Pid::from(std::process::id() as usize);
        sys.refresh_process(pid);
        let total = sys.total_memory();
        if total == 0 {
            return 0.0;
        }
        let process = sys.process(pid).map(|p| p.memory()).unwrap_or(0);
        process as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_zero_interval_always_requests_cleanup() {
        let monitor = MemoryMonitor::new(Duration::from_secs(0), 0.95);
        assert!(monitor.should_cleanup().await);
    }

    #[tokio::test]
    async fn test_fresh_mark_suppresses_interval_trigger() {
        let monitor = MemoryMonitor::new(Duration::from_secs(3_600), 1.1);
        monitor.mark_cleanup().await;
        // Threshold above 1.0 can never fire, and the interval just reset.
        assert!(!monitor.should_cleanup().await);
    }

    #[tokio::test]
    async fn test_memory_stats_are_populated() {
        let monitor = MemoryMonitor::new(Duration::from_secs(60), 0.9);
        let stats = monitor.get_memory_stats().await;
        assert!(stats.total_bytes > 0);
        assert!(stats.used_fraction >= 0.0 && stats.used_fraction <= 1.0);
    }

    #[tokio::test]
    async fn test_force_gc_counts_requests() {
        let monitor = MemoryMonitor::new(Duration::from_secs(60), 0.9);
        monitor.force_gc().await;
        monitor.force_gc().await;
        assert_eq!(monitor.get_memory_stats().await.gc_requests, 2);
    }
}
