//! Host resource sampling and the throttle/worker-sizing decisions derived
//! from it.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::{Disks, ProcessesToUpdate, System};

use crate::config::ManagerConfig;

/// Bounded in-memory history depth for trend inspection.
const HISTORY_CAP: usize = 1000;

/// One snapshot of host resource usage.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceSample {
    /// Global CPU usage in percent.
    pub cpu_percent: f64,
    /// Memory usage in percent.
    pub memory_percent: f64,
    /// Available memory in MiB.
    pub memory_available_mb: u64,
    /// Disk usage in percent across all mounted disks.
    pub disk_percent: f64,
    /// One-minute load average.
    pub load_avg_1m: f64,
    /// Number of live processes.
    pub process_count: usize,
    /// When the sample was taken.
    pub timestamp: DateTime<Utc>,
}

/// Source of resource snapshots. The production probe queries the OS; tests
/// substitute a probe with fixed readings.
pub trait ResourceProbe: Send + Sync {
    /// Take a bounded-cost snapshot of host resource usage.
    fn sample(&self) -> ResourceSample;

    /// Number of logical CPU cores.
    fn cpu_count(&self) -> usize {
        num_cpus::get()
    }
}

struct ProbeState {
    system: System,
    disks: Disks,
}

/// Production probe backed by `sysinfo`. Refreshes CPU, memory, process,
/// and disk readings on every sample; no I/O beyond OS queries.
pub struct SystemProbe {
    state: Mutex<ProbeState>,
}

impl SystemProbe {
    /// Create a probe with an initial full refresh so the first CPU reading
    /// has a baseline.
    #[must_use]
    pub fn new() -> Self {
        let mut system = System::new_all();
        system.refresh_all();
        Self {
            state: Mutex::new(ProbeState {
                system,
                disks: Disks::new_with_refreshed_list(),
            }),
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SystemProbe {
    fn sample(&self) -> ResourceSample {
        let mut state = self.state.lock();
        state.system.refresh_memory();
        state.system.refresh_cpu_usage();
        state.system.refresh_processes(ProcessesToUpdate::All, true);
        state.disks.refresh(true);

        let total_mem = state.system.total_memory();
        let avail_mem = state.system.available_memory();
        let memory_percent = if total_mem == 0 {
            0.0
        } else {
            (total_mem.saturating_sub(avail_mem)) as f64 / total_mem as f64 * 100.0
        };

        let (disk_total, disk_avail) = state
            .disks
            .iter()
            .fold((0_u64, 0_u64), |(total, avail), disk| {
                (total + disk.total_space(), avail + disk.available_space())
            });
        let disk_percent = if disk_total == 0 {
            0.0
        } else {
            (disk_total.saturating_sub(disk_avail)) as f64 / disk_total as f64 * 100.0
        };

        ResourceSample {
            cpu_percent: f64::from(state.system.global_cpu_usage()),
            memory_percent,
            memory_available_mb: avail_mem / (1024 * 1024),
            disk_percent,
            load_avg_1m: System::load_average().one,
            process_count: state.system.processes().len(),
            timestamp: Utc::now(),
        }
    }
}

/// Probe returning fixed readings; the deterministic seam for throttle and
/// sizing tests.
#[derive(Debug, Clone)]
pub struct StaticProbe {
    /// Fixed CPU reading.
    pub cpu_percent: f64,
    /// Fixed memory reading.
    pub memory_percent: f64,
    /// Fixed core count.
    pub cores: usize,
}

impl ResourceProbe for StaticProbe {
    fn sample(&self) -> ResourceSample {
        ResourceSample {
            cpu_percent: self.cpu_percent,
            memory_percent: self.memory_percent,
            memory_available_mb: 1024,
            disk_percent: 40.0,
            load_avg_1m: 0.5,
            process_count: 100,
            timestamp: Utc::now(),
        }
    }

    fn cpu_count(&self) -> usize {
        self.cores
    }
}

/// Samples host resources and derives the throttle decision and the
/// recommended worker count that drive backpressure and autoscaling.
pub struct ResourceMonitor {
    probe: Arc<dyn ResourceProbe>,
    cpu_throttle_threshold: f64,
    memory_throttle_threshold: f64,
    cpu_scale_threshold: f64,
    memory_scale_threshold: f64,
    preferred_max_workers: usize,
    history: Mutex<VecDeque<ResourceSample>>,
}

impl ResourceMonitor {
    /// Create a monitor over `probe` with thresholds from `config`.
    #[must_use]
    pub fn new(probe: Arc<dyn ResourceProbe>, config: &ManagerConfig) -> Self {
        Self {
            probe,
            cpu_throttle_threshold: config.cpu_throttle_threshold,
            memory_throttle_threshold: config.memory_throttle_threshold,
            cpu_scale_threshold: config.cpu_scale_threshold,
            memory_scale_threshold: config.memory_scale_threshold,
            preferred_max_workers: config.preferred_max_workers,
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAP)),
        }
    }

    /// Take a snapshot without recording it.
    #[must_use]
    pub fn sample(&self) -> ResourceSample {
        self.probe.sample()
    }

    /// Whether workers should idle instead of dequeuing: CPU or memory above
    /// the configured throttle thresholds.
    #[must_use]
    pub fn should_throttle(&self) -> bool {
        let sample = self.probe.sample();
        sample.cpu_percent > self.cpu_throttle_threshold
            || sample.memory_percent > self.memory_throttle_threshold
    }

    /// Piecewise worker sizing from current load. Always within
    /// `[1, preferred_max_workers]`.
    #[must_use]
    pub fn recommended_worker_count(&self) -> usize {
        let sample = self.probe.sample();
        let cores = self.probe.cpu_count().max(1);

        let raw = if sample.cpu_percent > self.cpu_scale_threshold {
            cores / 2
        } else if sample.memory_percent > self.memory_scale_threshold {
            cores / 3
        } else {
            cores.saturating_sub(1).min(self.preferred_max_workers)
        };

        raw.clamp(1, self.preferred_max_workers)
    }

    /// Sample and append to the bounded history, evicting the oldest entry
    /// past capacity.
    pub fn record(&self) -> ResourceSample {
        let sample = self.probe.sample();
        let mut history = self.history.lock();
        if history.len() >= HISTORY_CAP {
            history.pop_front();
        }
        history.push_back(sample.clone());
        sample
    }

    /// Copy of the recorded history, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<ResourceSample> {
        self.history.lock().iter().cloned().collect()
    }

    /// Number of recorded samples.
    #[must_use]
    pub fn history_depth(&self) -> usize {
        self.history.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(cpu: f64, memory: f64, cores: usize) -> ResourceMonitor {
        let probe = Arc::new(StaticProbe {
            cpu_percent: cpu,
            memory_percent: memory,
            cores,
        });
        ResourceMonitor::new(probe, &ManagerConfig::default())
    }

    #[test]
    fn throttles_on_cpu_or_memory() {
        assert!(monitor(95.0, 20.0, 8).should_throttle());
        assert!(monitor(20.0, 90.0, 8).should_throttle());
        assert!(!monitor(50.0, 50.0, 8).should_throttle());
        // Thresholds are strict inequalities.
        assert!(!monitor(90.0, 85.0, 8).should_throttle());
    }

    #[test]
    fn sizing_follows_the_piecewise_rule() {
        // High CPU: half the cores.
        assert_eq!(monitor(85.0, 20.0, 8).recommended_worker_count(), 4);
        // High memory: a third of the cores.
        assert_eq!(monitor(20.0, 80.0, 9).recommended_worker_count(), 3);
        // Normal: cores - 1 capped at the preferred maximum.
        assert_eq!(monitor(20.0, 20.0, 4).recommended_worker_count(), 3);
        assert_eq!(monitor(20.0, 20.0, 32).recommended_worker_count(), 8);
    }

    #[test]
    fn sizing_is_always_within_bounds() {
        let config = ManagerConfig::default();
        for cpu in [0.0, 50.0, 81.0, 100.0] {
            for memory in [0.0, 50.0, 76.0, 100.0] {
                for cores in [1, 2, 3, 8, 64] {
                    let count = monitor(cpu, memory, cores).recommended_worker_count();
                    assert!(count >= 1, "cpu={cpu} mem={memory} cores={cores}");
                    assert!(
                        count <= config.preferred_max_workers,
                        "cpu={cpu} mem={memory} cores={cores} count={count}"
                    );
                }
            }
        }
    }

    #[test]
    fn history_is_bounded() {
        let mon = monitor(10.0, 10.0, 4);
        for _ in 0..(HISTORY_CAP + 10) {
            mon.record();
        }
        assert_eq!(mon.history_depth(), HISTORY_CAP);
        assert_eq!(mon.history().len(), HISTORY_CAP);
    }

    #[test]
    fn system_probe_reports_plausible_values() {
        let probe = SystemProbe::new();
        let sample = probe.sample();
        assert!(sample.cpu_percent >= 0.0);
        assert!(sample.memory_percent >= 0.0 && sample.memory_percent <= 100.0);
        assert!(probe.cpu_count() > 0);
    }
}
