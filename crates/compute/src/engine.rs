use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use neurapulse_core::{
    EngineConfig, EngineError, OptimizationAction, Pid, ProcessSample, ResourceUsage, Result,
    TelemetrySnapshot,
};

use crate::algorithms::relaxation::{PriorityRelaxation, RelaxationRecord};
use crate::algorithms::similarity::SimilarityGraph;
use crate::control::ProcessControl;
use crate::pipeline::{
    ActionSynthesizer, ContinualPredictor, DriftAndAnomalyMonitor, EngineMetrics, FeatureSample,
    MonitorOutcome, Prediction,
};
use crate::scheduler::CadenceGate;

const OBSERVE: &str = "observe";
const RELAXATION: &str = "relaxation";
const SYNTHESIS: &str = "synthesis";
const PREDICTOR: &str = "predictor";
const MONITOR: &str = "monitor";

/// What a full [`Engine::tick`] did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    /// Whether the snapshot was accepted by the telemetry stage.
    pub observed: bool,
    /// Relaxation record, if the relaxation cadence fired and succeeded.
    pub relaxation: Option<RelaxationRecord>,
    /// Actions applied this tick.
    pub actions: Vec<OptimizationAction>,
}

/// The scheduling engine. Owns every component behind its own lock; no
/// call holds two component locks at once.
pub struct Engine {
    config: Arc<EngineConfig>,
    control: Arc<dyn ProcessControl>,
    graph: RwLock<SimilarityGraph>,
    relaxation: RwLock<PriorityRelaxation>,
    predictor: RwLock<ContinualPredictor>,
    monitor: Mutex<DriftAndAnomalyMonitor>,
    synthesizer: RwLock<ActionSynthesizer>,
    metrics: RwLock<EngineMetrics>,
    relaxation_gate: CadenceGate,
    action_gate: CadenceGate,
}

fn poisoned<E: std::fmt::Display>(what: &'static str) -> impl FnOnce(E) -> EngineError {
    move |e| EngineError::LockPoisoned(format!("{} lock: {}", what, e))
}

impl Engine {
    /// Build an engine. Fails if `config` does not validate.
    pub fn new(config: Arc<EngineConfig>, control: Arc<dyn ProcessControl>) -> Result<Self> {
        config.validate()?;

        let relaxation = PriorityRelaxation::new(Arc::clone(&config))?;
        let predictor = ContinualPredictor::new(Arc::clone(&config))?;
        let monitor = DriftAndAnomalyMonitor::new(Arc::clone(&config));
        let synthesizer = ActionSynthesizer::new(Arc::clone(&config));

        let metrics = EngineMetrics {
            learning_rate: predictor.learning_rate(),
            ..EngineMetrics::default()
        };

        info!(
            max_tracked = config.max_tracked_processes,
            relaxation_interval_ms = config.relaxation_interval_ms,
            action_cooldown_ms = config.action_cooldown_ms,
            "Engine initialized"
        );

        Ok(Self {
            graph: RwLock::new(SimilarityGraph::new(config.entanglement_threshold)),
            relaxation: RwLock::new(relaxation),
            predictor: RwLock::new(predictor),
            monitor: Mutex::new(monitor),
            synthesizer: RwLock::new(synthesizer),
            metrics: RwLock::new(metrics),
            relaxation_gate: CadenceGate::new(RELAXATION, config.relaxation_interval()),
            action_gate: CadenceGate::new(SYNTHESIS, config.action_cooldown()),
            config,
            control,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Telemetry tick: refresh the graph, relaxation states, predictors and
    /// monitor from `snapshot`, then react to drift and anomalies.
    pub fn observe(&self, snapshot: &TelemetrySnapshot) -> Result<()> {
        let start = Instant::now();

        if let Err(e) = snapshot.validate() {
            warn!(error = %e, "snapshot rejected");
            self.with_metrics(|m| m.record_faults(OBSERVE, 1));
            return Err(e);
        }

        let malformed = snapshot
            .processes
            .iter()
            .filter(|p| !p.is_well_formed())
            .count();
        if malformed > 0 {
            warn!(count = malformed, "skipping malformed process samples");
        }

        let tracked: Vec<&ProcessSample> = snapshot.busiest(self.config.max_tracked_processes);
        let entries: Vec<(Pid, ResourceUsage)> = tracked
            .iter()
            .map(|p| (p.pid, p.usage(self.config.io_threshold)))
            .collect();

        let graph = SimilarityGraph::build(&entries, self.config.entanglement_threshold);
        *self.graph.write().map_err(poisoned("graph"))? = graph;

        let tracked_count = {
            let mut relaxation = self.relaxation.write().map_err(poisoned("relaxation"))?;
            relaxation.observe(&entries, snapshot.timestamp);
            relaxation.tracked()
        };

        let predictor_faults = {
            let mut predictor = self.predictor.write().map_err(poisoned("predictor"))?;
            predictor.update(&tracked).faults.len()
        };

        let outcome = {
            let mut monitor = self.monitor.lock().map_err(poisoned("monitor"))?;
            monitor.update(snapshot)
        };

        let learning_rate = match outcome {
            Ok(outcome) => self.react(outcome)?,
            Err(e) => {
                warn!(error = %e, "monitor skipped this tick");
                self.with_metrics(|m| m.record_faults(MONITOR, 1));
                self.predictor.read().map_err(poisoned("predictor"))?.learning_rate()
            }
        };

        let elapsed = start.elapsed();
        self.with_metrics(|m| {
            m.record_faults(OBSERVE, malformed);
            m.record_faults(PREDICTOR, predictor_faults);
            m.record_run(OBSERVE, elapsed, snapshot.timestamp);
            m.learning_rate = learning_rate;
            m.tracked_processes = tracked_count;
        });
        debug!(
            processes = entries.len(),
            elapsed_us = elapsed.as_micros() as u64,
            "telemetry tick complete"
        );
        Ok(())
    }

    /// Apply the monitor's verdict to the predictors. Returns the shared
    /// learning rate afterwards.
    fn react(&self, outcome: MonitorOutcome) -> Result<f64> {
        let mut predictor = self.predictor.write().map_err(poisoned("predictor"))?;

        if outcome.anomaly {
            let rate = predictor.escalate_learning_rate();
            info!(score = outcome.score, learning_rate = rate, "learning rate escalated");
        } else if let Some(rate) = predictor.recover_learning_rate() {
            debug!(learning_rate = rate, "learning rate recovering");
        }

        if outcome.drift {
            let models = predictor.reset_all();
            info!(models, "drift: predictors reset");
        }
        let rate = predictor.learning_rate();
        drop(predictor);

        self.with_metrics(|m| {
            if outcome.drift {
                m.drift_events += 1;
            }
            if outcome.anomaly {
                m.anomaly_events += 1;
            }
        });
        Ok(rate)
    }

    /// Relaxation tick, gated by the relaxation cadence.
    ///
    /// `Ok(None)` when the cadence refused the run or nothing is tracked.
    /// On error the previous states are kept and the cadence is not advanced.
    pub fn optimize(&self, now: DateTime<Utc>) -> Result<Option<RelaxationRecord>> {
        let Some(guard) = self.relaxation_gate.try_begin(now) else {
            self.with_metrics(|m| m.record_skip(RELAXATION));
            return Ok(None);
        };
        let start = Instant::now();

        let graph = self.graph.read().map_err(poisoned("graph"))?.clone();
        let result = self
            .relaxation
            .write()
            .map_err(poisoned("relaxation"))?
            .relax(&graph, now);

        match result {
            Ok(record) => {
                guard.complete();
                let elapsed = start.elapsed();
                self.with_metrics(|m| m.record_run(RELAXATION, elapsed, now));
                Ok(record)
            }
            Err(e) => {
                warn!(error = %e, "relaxation tick failed; keeping previous states");
                self.with_metrics(|m| m.record_faults(RELAXATION, 1));
                Err(e)
            }
        }
    }

    /// Action tick, gated by the action cooldown. Returns the actions that
    /// were applied; empty when the cooldown refused the run.
    pub fn synthesize(&self, snapshot: &TelemetrySnapshot, now: DateTime<Utc>) -> Vec<OptimizationAction> {
        if let Err(e) = snapshot.validate() {
            warn!(error = %e, "synthesis skipped malformed snapshot");
            self.with_metrics(|m| m.record_faults(SYNTHESIS, 1));
            return Vec::new();
        }
        let Some(guard) = self.action_gate.try_begin(now) else {
            self.with_metrics(|m| m.record_skip(SYNTHESIS));
            return Vec::new();
        };
        let start = Instant::now();

        let outcome = match self.synthesizer.write() {
            Ok(mut synthesizer) => synthesizer.synthesize(snapshot, self.control.as_ref(), now),
            Err(e) => {
                warn!(error = %e, "synthesizer lock poisoned");
                self.with_metrics(|m| m.record_faults(SYNTHESIS, 1));
                return Vec::new();
            }
        };
        guard.complete();

        let elapsed = start.elapsed();
        self.with_metrics(|m| {
            m.record_run(SYNTHESIS, elapsed, now);
            m.actions_executed += outcome.executed.len() as u64;
            m.actions_failed += outcome.failed as u64;
            m.actions_filtered += outcome.filtered as u64;
            m.processes_excluded += outcome.excluded as u64;
        });
        if !outcome.executed.is_empty() {
            info!(
                executed = outcome.executed.len(),
                failed = outcome.failed,
                "actions applied"
            );
        }
        outcome.executed
    }

    /// Run the telemetry, relaxation and action stages for one snapshot,
    /// using its timestamp as the clock.
    pub fn tick(&self, snapshot: &TelemetrySnapshot) -> TickReport {
        let now = snapshot.timestamp;
        let observed = match self.observe(snapshot) {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "telemetry stage skipped");
                false
            }
        };
        let relaxation = self.optimize(now).unwrap_or_else(|e| {
            debug!(error = %e, "relaxation stage skipped");
            None
        });
        let actions = self.synthesize(snapshot, now);
        TickReport {
            observed,
            relaxation,
            actions,
        }
    }

    // ── Queries ───────────────────────────────────────────────

    pub fn predict(&self, pid: Pid) -> Option<Prediction> {
        self.predictor.read().ok()?.predict(pid)
    }

    /// Feature history the predictor holds for `pid`, oldest first.
    pub fn window_of(&self, pid: Pid) -> Vec<FeatureSample> {
        self.predictor
            .read()
            .map(|p| p.window_of(pid))
            .unwrap_or_default()
    }

    pub fn priority_of(&self, pid: Pid) -> Option<f64> {
        self.relaxation.read().ok()?.priority_of(pid)
    }

    pub fn related(&self, pid: Pid) -> BTreeSet<Pid> {
        self.graph
            .read()
            .map(|g| g.related(pid))
            .unwrap_or_default()
    }

    /// Coupling effect on `pid` at its last observed cpu load; `None` if
    /// the pid is not in the current graph.
    pub fn coupling_effect(&self, pid: Pid) -> Option<f64> {
        let graph = self.graph.read().ok()?;
        let usage = graph.usage(pid)?;
        Some(graph.coupling_effect(pid, usage.cpu))
    }

    /// Executed actions, oldest first.
    pub fn history(&self) -> Vec<OptimizationAction> {
        self.synthesizer
            .read()
            .map(|s| s.history())
            .unwrap_or_default()
    }

    /// Relaxation records, oldest first.
    pub fn optimization_log(&self) -> Vec<RelaxationRecord> {
        self.relaxation
            .read()
            .map(|r| r.optimization_log())
            .unwrap_or_default()
    }

    pub fn temperature(&self) -> Option<f64> {
        self.relaxation.read().ok().map(|r| r.temperature())
    }

    pub fn learning_rate(&self) -> Option<f64> {
        self.predictor.read().ok().map(|p| p.learning_rate())
    }

    pub fn anomaly_score(&self) -> Option<f64> {
        self.monitor.lock().ok().map(|m| m.last_score())
    }

    /// Snapshot of the current metrics.
    pub fn metrics(&self) -> EngineMetrics {
        self.metrics
            .read()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    fn with_metrics(&self, f: impl FnOnce(&mut EngineMetrics)) {
        if let Ok(mut m) = self.metrics.write() {
            f(&mut m);
        }
    }
}
