//! System-wide drift and anomaly detection over the aggregate vector
//! (cpu%, mem%, context switches, interrupts).

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use neurapulse_core::{EngineConfig, Result, TelemetrySnapshot};

use crate::algorithms::adwin::Adwin;
use crate::algorithms::half_space_trees::HalfSpaceTrees;
use crate::algorithms::mix_seed;

const AGGREGATE_DIMS: usize = 4;
const MONITOR_SALT: u64 = 0x4853_5421;

/// Online min-max scaler for unbounded counters.
#[derive(Debug, Clone, Default)]
struct MinMaxScaler {
    min: Option<f64>,
    max: Option<f64>,
}

impl MinMaxScaler {
    /// Widen the range with `x`, then scale `x` into `[0, 1]`.
    fn learn_and_scale(&mut self, x: f64) -> f64 {
        let min = self.min.map_or(x, |m| m.min(x));
        let max = self.max.map_or(x, |m| m.max(x));
        self.min = Some(min);
        self.max = Some(max);
        if max - min <= f64::EPSILON {
            return 0.0;
        }
        (x - min) / (max - min)
    }
}

/// Result of feeding one snapshot to the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MonitorOutcome {
    pub drift: bool,
    pub anomaly: bool,
    pub score: f64,
}

pub struct DriftAndAnomalyMonitor {
    config: Arc<EngineConfig>,
    drift: Vec<Adwin>,
    trees: HalfSpaceTrees,
    switches: MinMaxScaler,
    interrupts: MinMaxScaler,
    last_score: f64,
    drift_events: u64,
    anomaly_events: u64,
}

impl DriftAndAnomalyMonitor {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        let trees = HalfSpaceTrees::new(
            AGGREGATE_DIMS,
            config.anomaly_trees,
            config.anomaly_tree_height as u32,
            config.anomaly_window_size,
            mix_seed(config.seed, 0, MONITOR_SALT),
        );
        info!(
            delta = config.drift_delta,
            trees = config.anomaly_trees,
            window = config.anomaly_window_size,
            threshold = config.anomaly_score_threshold,
            "DriftAndAnomalyMonitor initialized"
        );
        Self {
            drift: (0..AGGREGATE_DIMS).map(|_| Adwin::new(config.drift_delta)).collect(),
            trees,
            switches: MinMaxScaler::default(),
            interrupts: MinMaxScaler::default(),
            last_score: 0.0,
            drift_events: 0,
            anomaly_events: 0,
            config,
        }
    }

    /// Feed one snapshot to both detectors.
    ///
    /// A malformed snapshot leaves every detector untouched.
    pub fn update(&mut self, snapshot: &TelemetrySnapshot) -> Result<MonitorOutcome> {
        snapshot.validate()?;
        let aggregate = snapshot.aggregate();

        // Every detector sees the value, even after one has already cut.
        let mut drift = false;
        for (detector, value) in self.drift.iter_mut().zip(aggregate.iter()) {
            drift |= detector.update(*value);
        }

        let x = [
            (aggregate[0] / 100.0).clamp(0.0, 1.0),
            (aggregate[1] / 100.0).clamp(0.0, 1.0),
            self.switches.learn_and_scale(aggregate[2]),
            self.interrupts.learn_and_scale(aggregate[3]),
        ];
        self.trees.learn(&x);
        let score = self.trees.score(&x);
        let anomaly = score > self.config.anomaly_score_threshold;

        self.last_score = score;
        if drift {
            self.drift_events += 1;
            info!(
                cpu = aggregate[0],
                memory = aggregate[1],
                "concept drift detected"
            );
        }
        if anomaly {
            self.anomaly_events += 1;
            warn!(
                score,
                cpu = aggregate[0],
                memory = aggregate[1],
                context_switches = aggregate[2],
                interrupts = aggregate[3],
                "anomalous system state"
            );
        }
        debug!(score, drift, anomaly, "monitor tick");

        Ok(MonitorOutcome { drift, anomaly, score })
    }

    /// Score of the most recent snapshot.
    pub fn last_score(&self) -> f64 {
        self.last_score
    }

    pub fn drift_events(&self) -> u64 {
        self.drift_events
    }

    pub fn anomaly_events(&self) -> u64 {
        self.anomaly_events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use neurapulse_core::EngineError;

    fn snapshot(cpu: f64, mem: f64, switches: u64, interrupts: u64) -> TelemetrySnapshot {
        TelemetrySnapshot {
            timestamp: Utc::now(),
            cpu_percent: cpu,
            memory_percent: mem,
            context_switches: switches,
            interrupts,
            processes: vec![],
        }
    }

    fn monitor(window: usize) -> DriftAndAnomalyMonitor {
        let config = EngineConfig {
            anomaly_window_size: window,
            ..EngineConfig::default()
        };
        DriftAndAnomalyMonitor::new(Arc::new(config))
    }

    #[test]
    fn steady_load_is_quiet() {
        let mut m = monitor(50);
        for _ in 0..300 {
            let out = m.update(&snapshot(30.0, 40.0, 1000, 500)).unwrap();
            assert!(!out.drift);
            assert!(!out.anomaly);
        }
        assert_eq!(m.drift_events(), 0);
        assert_eq!(m.anomaly_events(), 0);
    }

    #[test]
    fn level_shift_signals_drift() {
        let mut m = monitor(50);
        for _ in 0..256 {
            m.update(&snapshot(20.0, 30.0, 1000, 500)).unwrap();
        }
        let mut drifted = false;
        for _ in 0..256 {
            if m.update(&snapshot(90.0, 85.0, 1000, 500)).unwrap().drift {
                drifted = true;
                break;
            }
        }
        assert!(drifted);
        assert_eq!(m.drift_events(), 1);
    }

    #[test]
    fn spike_scores_as_anomaly() {
        let mut m = monitor(50);
        for _ in 0..100 {
            m.update(&snapshot(10.0, 10.0, 0, 0)).unwrap();
        }
        assert!(m.last_score() < 0.1);
        let out = m.update(&snapshot(100.0, 100.0, 1_000_000, 1_000_000)).unwrap();
        assert!(out.score > m.config.anomaly_score_threshold, "score {}", out.score);
        assert!(out.anomaly);
        assert_eq!(m.anomaly_events(), 1);
    }

    #[test]
    fn malformed_snapshot_is_rejected() {
        let mut m = monitor(50);
        let err = m.update(&snapshot(f64::NAN, 10.0, 0, 0)).unwrap_err();
        assert!(matches!(err, EngineError::MalformedSnapshot(_)));
        assert_eq!(m.last_score(), 0.0);
    }

    #[test]
    fn min_max_scaler_tracks_range() {
        let mut s = MinMaxScaler::default();
        assert_eq!(s.learn_and_scale(10.0), 0.0);
        assert_eq!(s.learn_and_scale(20.0), 1.0);
        assert!((s.learn_and_scale(15.0) - 0.5).abs() < 1e-12);
    }
}
