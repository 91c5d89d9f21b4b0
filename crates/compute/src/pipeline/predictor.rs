//! Per-process online usage prediction.
//!
//! Every tracked pid owns a bounded window of raw feature samples and a
//! [`WindowRegressor`]. Once the window is full, each new sample triggers a
//! single training step: the oldest `W - 1` vectors are the input and the
//! newest vector's (cpu, mem, io) is the target. All models share one
//! learning rate, governed by [`LearningRateSchedule`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use neurapulse_core::{EngineConfig, EngineError, Pid, ProcessSample, Result};

use crate::algorithms::mix_seed;
use crate::algorithms::regressor::{FEATURES, TARGETS, WindowRegressor};

const PREDICTOR_SALT: u64 = 0x5052_4544;

/// Predicted next-tick usage in natural units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Prediction {
    pub cpu: f64,
    pub memory: f64,
    /// Combined read + write bytes.
    pub io: f64,
}

/// The features of one process sample, as held in a predictor window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FeatureSample {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    /// Combined read + write bytes.
    pub io_bytes: u64,
    pub thread_count: u32,
    pub os_priority: i32,
}

impl FeatureSample {
    pub fn of(sample: &ProcessSample) -> Self {
        Self {
            cpu_percent: sample.cpu_percent,
            memory_percent: sample.memory_percent,
            io_bytes: sample.io_bytes(),
            thread_count: sample.thread_count,
            os_priority: sample.os_priority,
        }
    }

    /// Model space: cpu/100, mem/100, ln(1+io), ln(1+threads), os_priority/20.
    pub fn scaled(&self) -> [f64; FEATURES] {
        [
            self.cpu_percent / 100.0,
            self.memory_percent / 100.0,
            (self.io_bytes as f64).ln_1p(),
            f64::from(self.thread_count).ln_1p(),
            f64::from(self.os_priority) / 20.0,
        ]
    }
}

/// Scale one sample into model space.
pub fn scale_features(sample: &ProcessSample) -> [f64; FEATURES] {
    FeatureSample::of(sample).scaled()
}

/// Map a model output back to natural units.
pub fn unscale_prediction(y: [f64; TARGETS]) -> Prediction {
    Prediction {
        cpu: (y[0] * 100.0).clamp(0.0, 100.0),
        memory: (y[1] * 100.0).clamp(0.0, 100.0),
        io: y[2].exp_m1().max(0.0),
    }
}

/// Shared learning rate: doubled on anomalies, halved back towards the
/// base rate after a run of clean ticks.
#[derive(Debug, Clone)]
pub struct LearningRateSchedule {
    base: f64,
    max: f64,
    recovery_ticks: u32,
    current: f64,
    clean_ticks: u32,
}

impl LearningRateSchedule {
    pub fn new(base: f64, max: f64, recovery_ticks: u32) -> Self {
        Self {
            base,
            max,
            recovery_ticks,
            current: base,
            clean_ticks: 0,
        }
    }

    pub fn current(&self) -> f64 {
        self.current
    }

    /// Double the rate (capped at the maximum) and restart the clean count.
    pub fn on_anomaly(&mut self) -> f64 {
        self.clean_ticks = 0;
        self.current = (self.current * 2.0).min(self.max);
        self.current
    }

    /// Count a clean tick. Returns the new rate when it changed.
    pub fn on_clean_tick(&mut self) -> Option<f64> {
        self.clean_ticks = self.clean_ticks.saturating_add(1);
        if self.clean_ticks <= self.recovery_ticks || self.current <= self.base {
            return None;
        }
        self.current = (self.current / 2.0).max(self.base);
        Some(self.current)
    }
}

#[derive(Debug, Clone)]
struct PredictorState {
    window: VecDeque<FeatureSample>,
    model: WindowRegressor,
    last_loss: Option<f64>,
    absent_ticks: u32,
}

/// What one [`ContinualPredictor::update`] did.
#[derive(Debug, Default)]
pub struct PredictorUpdate {
    /// Pids that took a training step.
    pub trained: Vec<Pid>,
    /// Per-entity faults; those pids kept their previous model.
    pub faults: Vec<EngineError>,
    pub evicted: Vec<Pid>,
}

pub struct ContinualPredictor {
    config: Arc<EngineConfig>,
    entries: HashMap<Pid, PredictorState>,
    schedule: LearningRateSchedule,
    /// Bumped on every reset so rebuilt models draw fresh weights.
    generation: u64,
}

impl ContinualPredictor {
    pub fn new(config: Arc<EngineConfig>) -> Result<Self> {
        if config.window_size < 2 {
            return Err(EngineError::InvalidConfig(format!(
                "window_size must be at least 2, got {}",
                config.window_size
            )));
        }
        info!(
            window = config.window_size,
            learning_rate = config.base_learning_rate,
            "ContinualPredictor initialized"
        );
        Ok(Self {
            schedule: LearningRateSchedule::new(
                config.base_learning_rate,
                config.max_learning_rate,
                config.learning_rate_recovery_ticks,
            ),
            config,
            entries: HashMap::new(),
            generation: 0,
        })
    }

    fn new_model(&self, pid: Pid) -> WindowRegressor {
        WindowRegressor::new(
            self.config.window_size - 1,
            self.schedule.current(),
            mix_seed(self.config.seed, pid, PREDICTOR_SALT.wrapping_add(self.generation)),
        )
    }

    /// Feed one tick of samples, train every full window, evict stale pids.
    pub fn update(&mut self, samples: &[&ProcessSample]) -> PredictorUpdate {
        let mut outcome = PredictorUpdate::default();
        let capacity = self.config.window_size;

        for entry in self.entries.values_mut() {
            entry.absent_ticks = entry.absent_ticks.saturating_add(1);
        }

        let mut seen: Vec<Pid> = Vec::with_capacity(samples.len());
        let mut first = HashSet::with_capacity(samples.len());
        for sample in samples {
            if !sample.is_well_formed() {
                outcome.faults.push(EngineError::entity(
                    sample.pid,
                    "non-finite or negative usage",
                ));
                continue;
            }
            if !first.insert(sample.pid) {
                debug!(pid = sample.pid, "duplicate sample ignored");
                continue;
            }
            if !self.entries.contains_key(&sample.pid) {
                let model = self.new_model(sample.pid);
                self.entries.insert(
                    sample.pid,
                    PredictorState {
                        window: VecDeque::with_capacity(capacity + 1),
                        model,
                        last_loss: None,
                        absent_ticks: 0,
                    },
                );
            }
            if let Some(entry) = self.entries.get_mut(&sample.pid) {
                entry.window.push_back(FeatureSample::of(sample));
                while entry.window.len() > capacity {
                    entry.window.pop_front();
                }
                entry.absent_ticks = 0;
                seen.push(sample.pid);
            }
        }
        seen.sort_unstable();

        // Train on copies; merge back in pid order once every step is done.
        let jobs: Vec<(Pid, WindowRegressor, Vec<[f64; FEATURES]>)> = seen
            .iter()
            .filter_map(|pid| {
                let entry = self.entries.get(pid)?;
                (entry.window.len() == capacity).then(|| {
                    (*pid, entry.model.clone(), entry.window.iter().map(FeatureSample::scaled).collect())
                })
            })
            .collect();

        let results: Vec<(Pid, std::result::Result<(WindowRegressor, f64), EngineError>)> = jobs
            .into_par_iter()
            .map(|(pid, mut model, window)| {
                let last = window[capacity - 1];
                let target = [last[0], last[1], last[2]];
                let result = match model.train_step(&window[..capacity - 1], target) {
                    Some(loss) => Ok((model, loss)),
                    None => Err(EngineError::entity(pid, "non-finite training loss")),
                };
                (pid, result)
            })
            .collect();

        for (pid, result) in results {
            match result {
                Ok((model, loss)) => {
                    if let Some(entry) = self.entries.get_mut(&pid) {
                        entry.model = model;
                        entry.last_loss = Some(loss);
                        outcome.trained.push(pid);
                    }
                }
                Err(e) => outcome.faults.push(e),
            }
        }

        let limit = self.config.eviction_absent_ticks;
        let mut evicted: Vec<Pid> = self
            .entries
            .iter()
            .filter(|(_, e)| e.absent_ticks >= limit)
            .map(|(pid, _)| *pid)
            .collect();
        evicted.sort_unstable();
        for pid in &evicted {
            self.entries.remove(pid);
        }
        outcome.evicted = evicted;

        for fault in &outcome.faults {
            warn!(error = %fault, "predictor skipped process");
        }
        debug!(
            trained = outcome.trained.len(),
            tracked = self.entries.len(),
            "predictor tick complete"
        );
        outcome
    }

    /// Next-tick usage for `pid`; `None` if unknown or the window is not full.
    pub fn predict(&self, pid: Pid) -> Option<Prediction> {
        let entry = self.entries.get(&pid)?;
        if entry.window.len() < self.config.window_size {
            return None;
        }
        let recent: Vec<[f64; FEATURES]> = entry.window.iter().skip(1).map(FeatureSample::scaled).collect();
        let y = entry.model.predict(&recent);
        if y.iter().any(|v| !v.is_finite()) {
            return None;
        }
        Some(unscale_prediction(y))
    }

    /// Feature history of `pid`, oldest first; empty if the pid is unknown.
    pub fn window_of(&self, pid: Pid) -> Vec<FeatureSample> {
        self.entries
            .get(&pid)
            .map(|e| e.window.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Loss of the last training step for `pid`.
    pub fn last_loss(&self, pid: Pid) -> Option<f64> {
        self.entries.get(&pid).and_then(|e| e.last_loss)
    }

    /// Clear every window and rebuild every model at the current rate.
    pub fn reset_all(&mut self) -> usize {
        self.generation = self.generation.wrapping_add(1);
        let mut pids: Vec<Pid> = self.entries.keys().copied().collect();
        pids.sort_unstable();
        for pid in &pids {
            let model = self.new_model(*pid);
            if let Some(entry) = self.entries.get_mut(pid) {
                entry.window.clear();
                entry.model = model;
                entry.last_loss = None;
            }
        }
        info!(models = pids.len(), "predictor models reset");
        pids.len()
    }

    /// Anomaly tick: double the shared rate and push it to every model.
    pub fn escalate_learning_rate(&mut self) -> f64 {
        let rate = self.schedule.on_anomaly();
        self.apply_learning_rate(rate);
        rate
    }

    /// Clean tick: possibly step the shared rate back towards the base.
    pub fn recover_learning_rate(&mut self) -> Option<f64> {
        let rate = self.schedule.on_clean_tick()?;
        self.apply_learning_rate(rate);
        Some(rate)
    }

    fn apply_learning_rate(&mut self, rate: f64) {
        for entry in self.entries.values_mut() {
            entry.model.set_learning_rate(rate);
        }
    }

    pub fn learning_rate(&self) -> f64 {
        self.schedule.current()
    }

    pub fn tracked(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    fn model_learning_rate(&self, pid: Pid) -> Option<f64> {
        self.entries.get(&pid).map(|e| e.model.learning_rate())
    }
}
