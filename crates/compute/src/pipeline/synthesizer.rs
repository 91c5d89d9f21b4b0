//! Turns one telemetry snapshot into a filtered batch of optimization actions.
//!
//! A candidate either never exists (its process is protected), is filtered
//! for falling below the action threshold, or is applied and recorded.
//! Actions whose application fails are dropped from the batch and never
//! reach the history.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use neurapulse_core::action::keys;
use neurapulse_core::{
    ActionType, EngineConfig, IoPriority, OptimizationAction, ParamValue, PriorityClass,
    ProcessSample, TelemetrySnapshot,
};

use crate::control::ProcessControl;

/// Working-set fraction for processes above this memory share.
const HEAVY_MEMORY_PERCENT: f64 = 80.0;
/// Affinity spans every core above this cpu share.
const HEAVY_CPU_PERCENT: f64 = 80.0;

/// Bitmask of the low `cores` cpus; saturates at 64.
pub fn affinity_mask(cores: usize) -> u64 {
    if cores >= 64 {
        u64::MAX
    } else {
        (1u64 << cores) - 1
    }
}

/// Working-set limit in bytes for a process using `memory_percent` of RAM.
pub fn working_set_limit(memory_percent: f64, total_memory_bytes: u64) -> u64 {
    let factor = if memory_percent > HEAVY_MEMORY_PERCENT { 0.5 } else { 0.75 };
    let limit = memory_percent / 100.0 * total_memory_bytes as f64 * factor;
    if limit.is_finite() && limit > 0.0 {
        limit.floor() as u64
    } else {
        0
    }
}

/// What one synthesis tick produced.
#[derive(Debug, Clone, Default)]
pub struct SynthesisOutcome {
    /// Applied and recorded, in application order.
    pub executed: Vec<OptimizationAction>,
    pub failed: usize,
    /// Candidates below the action threshold.
    pub filtered: usize,
    /// Processes skipped as protected or critical.
    pub excluded: usize,
}

pub struct ActionSynthesizer {
    config: Arc<EngineConfig>,
    history: VecDeque<OptimizationAction>,
}

impl ActionSynthesizer {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        let capacity = config.history_capacity;
        Self {
            config,
            history: VecDeque::with_capacity(capacity),
        }
    }

    /// Whether any action may target `sample` at all.
    pub fn is_eligible(&self, sample: &ProcessSample) -> bool {
        sample.pid >= self.config.critical_pid_ceiling
            && !self.config.is_protected_name(&sample.name)
            && sample.is_well_formed()
    }

    /// Candidate actions for `snapshot`, before the threshold filter.
    ///
    /// Protected processes never produce a candidate. A pid listed more than
    /// once is judged by its first well-formed sample only. Returns the candidates
    /// and the number of processes excluded.
    pub fn candidates(&self, snapshot: &TelemetrySnapshot, now: DateTime<Utc>) -> (Vec<OptimizationAction>, usize) {
        let cfg = &self.config;
        let mut eligible: Vec<&ProcessSample> = Vec::with_capacity(snapshot.processes.len());
        let mut seen = HashSet::with_capacity(snapshot.processes.len());
        let mut excluded = 0;
        let mut duplicates = 0;
        for sample in &snapshot.processes {
            if sample.is_well_formed() && !seen.insert(sample.pid) {
                duplicates += 1;
                continue;
            }
            if self.is_eligible(sample) {
                eligible.push(sample);
            } else {
                excluded += 1;
            }
        }
        if duplicates > 0 {
            warn!(count = duplicates, "ignoring duplicate process samples");
        }
        eligible.sort_by_key(|s| s.pid);

        let mut out = Vec::new();

        if snapshot.cpu_percent > cfg.cpu_threshold {
            let mut by_cpu = eligible.clone();
            by_cpu.sort_by(|a, b| b.cpu_percent.total_cmp(&a.cpu_percent).then(a.pid.cmp(&b.pid)));
            for s in by_cpu.iter().take(cfg.top_consumers) {
                if s.cpu_percent <= cfg.process_cpu_threshold {
                    continue;
                }
                let cores = if s.cpu_percent > HEAVY_CPU_PERCENT {
                    cfg.cpu_count
                } else {
                    (cfg.cpu_count / 2).max(1)
                };
                out.push(
                    OptimizationAction::new(s.pid, ActionType::Cpu, s.cpu_percent / 100.0, now)
                        .with_param(keys::PRIORITY_CLASS, ParamValue::Priority(PriorityClass::BelowNormal))
                        .with_param(keys::AFFINITY_MASK, ParamValue::Integer(affinity_mask(cores))),
                );
            }
        }

        if snapshot.memory_percent > cfg.memory_threshold {
            let mut by_mem = eligible.clone();
            by_mem.sort_by(|a, b| {
                b.memory_percent
                    .total_cmp(&a.memory_percent)
                    .then(a.pid.cmp(&b.pid))
            });
            for s in by_mem.iter().take(cfg.top_consumers) {
                if s.memory_percent <= cfg.process_memory_threshold {
                    continue;
                }
                let limit = working_set_limit(s.memory_percent, cfg.total_memory_bytes);
                out.push(
                    OptimizationAction::new(s.pid, ActionType::Memory, s.memory_percent / 100.0, now)
                        .with_param(keys::PRIORITY_CLASS, ParamValue::Priority(PriorityClass::BelowNormal))
                        .with_param(keys::WORKING_SET_LIMIT, ParamValue::Integer(limit)),
                );
            }
        }

        for s in &eligible {
            if s.io_bytes() as f64 > cfg.io_threshold {
                out.push(
                    OptimizationAction::new(s.pid, ActionType::Io, cfg.io_action_priority, now)
                        .with_param(keys::PRIORITY_CLASS, ParamValue::Priority(PriorityClass::BelowNormal))
                        .with_param(keys::IO_PRIORITY, ParamValue::Io(IoPriority::Low)),
                );
            }
            if s.thread_count > cfg.thread_threshold {
                out.push(
                    OptimizationAction::new(s.pid, ActionType::Thread, cfg.thread_action_priority, now)
                        .with_param(keys::PRIORITY_CLASS, ParamValue::Priority(PriorityClass::BelowNormal))
                        .with_param(keys::THREAD_LIMIT, ParamValue::Integer(u64::from(cfg.thread_threshold))),
                );
            }
        }

        (out, excluded)
    }

    /// Run one synthesis tick: build candidates, filter, apply, record.
    pub fn synthesize(
        &mut self,
        snapshot: &TelemetrySnapshot,
        control: &dyn ProcessControl,
        now: DateTime<Utc>,
    ) -> SynthesisOutcome {
        let (candidates, excluded) = self.candidates(snapshot, now);
        let mut outcome = SynthesisOutcome {
            excluded,
            ..SynthesisOutcome::default()
        };

        for action in candidates {
            if action.priority < self.config.action_threshold {
                outcome.filtered += 1;
                continue;
            }
            match control.apply(&action) {
                Ok(()) => {
                    self.record(action.clone());
                    outcome.executed.push(action);
                }
                Err(e) => {
                    warn!(
                        pid = action.pid,
                        action = %action.action_type,
                        error = %e,
                        "action failed"
                    );
                    outcome.failed += 1;
                }
            }
        }

        debug!(
            executed = outcome.executed.len(),
            failed = outcome.failed,
            filtered = outcome.filtered,
            excluded = outcome.excluded,
            "synthesis tick complete"
        );
        outcome
    }

    fn record(&mut self, action: OptimizationAction) {
        self.history.push_back(action);
        while self.history.len() > self.config.history_capacity {
            self.history.pop_front();
        }
    }

    /// Executed actions, oldest first.
    pub fn history(&self) -> Vec<OptimizationAction> {
        self.history.iter().cloned().collect()
    }
}
