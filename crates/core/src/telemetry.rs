//! Telemetry contracts consumed by the engine on every poll.
//!
//! Collection itself happens outside the engine; these types only describe
//! what a collector hands over.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{EngineError, Result};

/// A process identifier as reported by the OS.
pub type Pid = u32;

/// One process as seen in a single telemetry poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSample {
    pub pid: Pid,
    pub name: String,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    #[serde(default)]
    pub io_read_bytes: u64,
    #[serde(default)]
    pub io_write_bytes: u64,
    #[serde(default)]
    pub thread_count: u32,
    /// OS scheduling priority (nice value on unix).
    #[serde(default)]
    pub os_priority: i32,
}

impl ProcessSample {
    /// Combined read + write bytes.
    pub fn io_bytes(&self) -> u64 {
        self.io_read_bytes.saturating_add(self.io_write_bytes)
    }

    /// Whether the usage numbers can be fed into the numeric components.
    pub fn is_well_formed(&self) -> bool {
        self.cpu_percent.is_finite()
            && self.memory_percent.is_finite()
            && self.cpu_percent >= 0.0
            && self.memory_percent >= 0.0
    }

    /// Resource usage snapshot with I/O on the percentage scale of cpu and memory.
    pub fn usage(&self, io_threshold: f64) -> ResourceUsage {
        ResourceUsage {
            cpu: self.cpu_percent,
            memory: self.memory_percent,
            io: io_percent(self.io_bytes(), io_threshold),
        }
    }
}

/// Map raw I/O bytes onto `[0, 100]` relative to the configured I/O threshold.
pub fn io_percent(io_bytes: u64, io_threshold: f64) -> f64 {
    if io_threshold <= 0.0 {
        return 0.0;
    }
    (100.0 * io_bytes as f64 / io_threshold).min(100.0)
}

/// The `(cpu%, mem%, io%)` usage vector used for similarity and priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu: f64,
    pub memory: f64,
    pub io: f64,
}

impl ResourceUsage {
    pub fn as_array(&self) -> [f64; 3] {
        [self.cpu, self.memory, self.io]
    }
}

/// System-wide aggregate plus per-process samples from one poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    #[serde(default)]
    pub context_switches: u64,
    #[serde(default)]
    pub interrupts: u64,
    #[serde(default)]
    pub processes: Vec<ProcessSample>,
}

impl TelemetrySnapshot {
    /// Reject snapshots whose aggregate numbers cannot be used at all.
    pub fn validate(&self) -> Result<()> {
        if !self.cpu_percent.is_finite() || self.cpu_percent < 0.0 {
            return Err(EngineError::MalformedSnapshot(format!(
                "cpu_percent = {}",
                self.cpu_percent
            )));
        }
        if !self.memory_percent.is_finite() || self.memory_percent < 0.0 {
            return Err(EngineError::MalformedSnapshot(format!(
                "memory_percent = {}",
                self.memory_percent
            )));
        }
        Ok(())
    }

    /// Aggregate vector fed to the drift and anomaly detectors.
    pub fn aggregate(&self) -> [f64; 4] {
        [
            self.cpu_percent,
            self.memory_percent,
            self.context_switches as f64,
            self.interrupts as f64,
        ]
    }

    /// Well-formed samples with each pid kept once (its first occurrence),
    /// in snapshot order.
    pub fn unique_processes(&self) -> Vec<&ProcessSample> {
        let mut seen = HashSet::with_capacity(self.processes.len());
        let mut duplicates = 0usize;
        let procs: Vec<&ProcessSample> = self
            .processes
            .iter()
            .filter(|p| p.is_well_formed())
            .filter(|p| {
                let first = seen.insert(p.pid);
                if !first {
                    duplicates += 1;
                }
                first
            })
            .collect();
        if duplicates > 0 {
            warn!(count = duplicates, "dropping duplicate process samples");
        }
        procs
    }

    /// The `n` busiest well-formed processes by `cpu% + mem%`, descending.
    /// Ties fall back to ascending pid so the selection is stable. A pid
    /// listed twice counts once, with its first sample.
    pub fn busiest(&self, n: usize) -> Vec<&ProcessSample> {
        let mut procs = self.unique_processes();
        procs.sort_by(|a, b| {
            let la = a.cpu_percent + a.memory_percent;
            let lb = b.cpu_percent + b.memory_percent;
            lb.total_cmp(&la).then(a.pid.cmp(&b.pid))
        });
        procs.truncate(n);
        procs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(pid: Pid, cpu: f64, mem: f64) -> ProcessSample {
        ProcessSample {
            pid,
            name: format!("proc-{pid}"),
            cpu_percent: cpu,
            memory_percent: mem,
            io_read_bytes: 0,
            io_write_bytes: 0,
            thread_count: 1,
            os_priority: 0,
        }
    }

    fn snapshot(processes: Vec<ProcessSample>) -> TelemetrySnapshot {
        TelemetrySnapshot {
            timestamp: Utc::now(),
            cpu_percent: 50.0,
            memory_percent: 40.0,
            context_switches: 1000,
            interrupts: 500,
            processes,
        }
    }

    #[test]
    fn busiest_orders_by_load_then_pid() {
        let snap = snapshot(vec![
            sample(300, 10.0, 10.0),
            sample(200, 50.0, 5.0),
            sample(100, 5.0, 15.0),
            sample(400, 40.0, 15.0),
        ]);
        let top: Vec<Pid> = snap.busiest(3).iter().map(|p| p.pid).collect();
        assert_eq!(top, vec![200, 400, 100]);
    }

    #[test]
    fn busiest_skips_malformed_samples() {
        let snap = snapshot(vec![sample(1, f64::NAN, 1.0), sample(2, 1.0, 1.0)]);
        let top: Vec<Pid> = snap.busiest(10).iter().map(|p| p.pid).collect();
        assert_eq!(top, vec![2]);
    }

    #[test]
    fn busiest_keeps_first_sample_of_duplicate_pid() {
        let snap = snapshot(vec![
            sample(500, 10.0, 5.0),
            sample(600, 20.0, 5.0),
            sample(500, 90.0, 5.0),
        ]);
        let top = snap.busiest(10);
        assert_eq!(top.len(), 2);
        let p500 = top.iter().find(|p| p.pid == 500).unwrap();
        assert_eq!(p500.cpu_percent, 10.0);
        assert_eq!(top[0].pid, 600);
    }

    #[test]
    fn unique_processes_preserves_snapshot_order() {
        let snap = snapshot(vec![
            sample(3, 1.0, 1.0),
            sample(1, 1.0, 1.0),
            sample(3, 5.0, 5.0),
            sample(2, f64::NAN, 1.0),
        ]);
        let pids: Vec<Pid> = snap.unique_processes().iter().map(|p| p.pid).collect();
        assert_eq!(pids, vec![3, 1]);
    }

    #[test]
    fn validate_rejects_nan_aggregate() {
        let mut snap = snapshot(vec![]);
        assert!(snap.validate().is_ok());
        snap.cpu_percent = f64::NAN;
        assert!(matches!(
            snap.validate(),
            Err(EngineError::MalformedSnapshot(_))
        ));
    }

    #[test]
    fn io_percent_is_capped() {
        assert_eq!(io_percent(0, 1_000_000.0), 0.0);
        assert!((io_percent(500_000, 1_000_000.0) - 50.0).abs() < 1e-9);
        assert_eq!(io_percent(5_000_000, 1_000_000.0), 100.0);
        assert_eq!(io_percent(5_000_000, 0.0), 0.0);
    }

    #[test]
    fn deserializes_minimal_json() {
        let json = r#"{
            "timestamp": "2024-01-01T00:00:00Z",
            "cpu_percent": 12.5,
            "memory_percent": 30.0,
            "processes": [{"pid": 500, "name": "worker", "cpu_percent": 1.0, "memory_percent": 2.0}]
        }"#;
        let snap: TelemetrySnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(snap.processes.len(), 1);
        assert_eq!(snap.processes[0].thread_count, 0);
        assert_eq!(snap.context_switches, 0);
    }
}
