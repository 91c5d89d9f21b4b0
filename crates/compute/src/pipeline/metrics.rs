use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Engine operational metrics, updated by every component run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineMetrics {
    /// Completed runs by component name.
    pub runs: HashMap<String, u64>,
    /// Average run duration by component name.
    pub avg_duration: HashMap<String, Duration>,
    /// Last completed run by component name.
    pub last_run: HashMap<String, DateTime<Utc>>,
    /// Runs refused by the cadence gate.
    pub skipped: HashMap<String, u64>,
    /// Recoverable faults by component name.
    pub faults: HashMap<String, u64>,

    pub actions_executed: u64,
    pub actions_failed: u64,
    pub actions_filtered: u64,
    /// Processes the synthesizer refused to target.
    pub processes_excluded: u64,

    pub drift_events: u64,
    pub anomaly_events: u64,
    /// Current shared predictor learning rate.
    pub learning_rate: f64,
    pub tracked_processes: usize,
}

impl EngineMetrics {
    /// Record a completed component run.
    pub fn record_run(&mut self, component: &str, duration: Duration, at: DateTime<Utc>) {
        let count = {
            let c = self.runs.entry(component.to_string()).or_default();
            *c += 1;
            *c
        };
        self.last_run.insert(component.to_string(), at);

        let prev_avg = self
            .avg_duration
            .get(component)
            .copied()
            .unwrap_or_default();

        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        let new_avg = if count == 1 {
            duration
        } else {
            let prev_nanos = prev_avg.as_nanos() as f64;
            let cur_nanos = duration.as_nanos() as f64;
            let avg_nanos = prev_nanos + (cur_nanos - prev_nanos) / count as f64;
            Duration::from_nanos(avg_nanos as u64)
        };
        self.avg_duration.insert(component.to_string(), new_avg);
    }

    pub fn record_skip(&mut self, component: &str) {
        *self.skipped.entry(component.to_string()).or_default() += 1;
    }

    pub fn record_faults(&mut self, component: &str, count: usize) {
        if count > 0 {
            *self.faults.entry(component.to_string()).or_default() += count as u64;
        }
    }

    pub fn runs_of(&self, component: &str) -> u64 {
        self.runs.get(component).copied().unwrap_or(0)
    }

    pub fn skips_of(&self, component: &str) -> u64 {
        self.skipped.get(component).copied().unwrap_or(0)
    }

    pub fn faults_of(&self, component: &str) -> u64 {
        self.faults.get(component).copied().unwrap_or(0)
    }
}
