//! Iterative priority relaxation over the coupling graph.
//!
//! Every tracked process owns a unit-length state vector. A relaxation tick
//! pulls each state towards the states of the processes it is coupled to,
//! scaled by the current temperature, renormalizes, and repeats for a fixed
//! number of steps. The mean of the final state is blended with raw usage
//! into a priority in `[0, 1]`. The temperature then decays geometrically.
//!
//! Steps are Jacobi updates: every force in a step is computed from the
//! previous step's states, so the per-process map can run in parallel.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info};

use neurapulse_core::{EngineConfig, EngineError, Pid, ResourceUsage, Result};

use super::mix_seed;
use super::similarity::SimilarityGraph;

/// Weight of the relaxed state in the final priority.
const STATE_WEIGHT: f64 = 0.7;
/// Weight of raw cpu/memory usage in the final priority.
const USAGE_WEIGHT: f64 = 0.3;
/// Norms below this are treated as the zero vector.
const MIN_NORM: f64 = 1e-12;

/// Relaxation state of one tracked process.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessState {
    pub pid: Pid,
    /// Unit-length state vector of dimension K.
    pub state: Vec<f64>,
    /// Last computed priority in `[0, 1]`; `None` until first relaxed.
    pub priority: Option<f64>,
    pub usage: ResourceUsage,
    pub last_update: DateTime<Utc>,
    #[serde(skip)]
    absent_ticks: u32,
}

/// One entry of the relaxation log.
#[derive(Debug, Clone, Serialize)]
pub struct RelaxationRecord {
    pub timestamp: DateTime<Utc>,
    /// Temperature the tick ran at (before decay).
    pub temperature: f64,
    pub priorities: BTreeMap<Pid, f64>,
}

/// Scale `v` to unit length; `None` for zero or non-finite vectors.
pub fn normalize(v: &[f64]) -> Option<Vec<f64>> {
    let norm = v.iter().map(|x| x * x).sum::<f64>().sqrt();
    if !norm.is_finite() || norm < MIN_NORM {
        return None;
    }
    Some(v.iter().map(|x| x / norm).collect())
}

/// `0.7 * mean(state) + 0.3 * avg(cpu%, mem%) / 100`, clamped to `[0, 1]`.
pub fn blend_priority(state: &[f64], usage: &ResourceUsage) -> f64 {
    let state_score = if state.is_empty() {
        0.0
    } else {
        state.iter().sum::<f64>() / state.len() as f64
    };
    let usage_score = (usage.cpu + usage.memory) / 2.0 / 100.0;
    (STATE_WEIGHT * state_score + USAGE_WEIGHT * usage_score).clamp(0.0, 1.0)
}

pub struct PriorityRelaxation {
    config: Arc<EngineConfig>,
    states: HashMap<Pid, ProcessState>,
    temperature: f64,
    log: VecDeque<RelaxationRecord>,
}

impl PriorityRelaxation {
    pub fn new(config: Arc<EngineConfig>) -> Result<Self> {
        if config.state_dimension == 0 {
            return Err(EngineError::InvalidConfig(
                "state_dimension must be at least 1".into(),
            ));
        }
        if config.relaxation_steps == 0 {
            return Err(EngineError::InvalidConfig(
                "relaxation_steps must be at least 1".into(),
            ));
        }
        info!(
            dimension = config.state_dimension,
            steps = config.relaxation_steps,
            "PriorityRelaxation initialized"
        );
        Ok(Self {
            temperature: config.initial_temperature,
            config,
            states: HashMap::new(),
            log: VecDeque::new(),
        })
    }

    /// Refresh usage for the processes seen this tick and age out the rest.
    ///
    /// New pids get a seeded random unit state. A pid listed twice keeps its
    /// first usage. Returns the evicted pids.
    pub fn observe(&mut self, entries: &[(Pid, ResourceUsage)], timestamp: DateTime<Utc>) -> Vec<Pid> {
        let dim = self.config.state_dimension;
        let seed = self.config.seed;

        for state in self.states.values_mut() {
            state.absent_ticks = state.absent_ticks.saturating_add(1);
        }

        let mut refreshed = HashSet::with_capacity(entries.len());
        for (pid, usage) in entries {
            if !refreshed.insert(*pid) {
                continue;
            }
            let state = self.states.entry(*pid).or_insert_with(|| ProcessState {
                pid: *pid,
                state: random_unit_vector(dim, mix_seed(seed, *pid, 0)),
                priority: None,
                usage: *usage,
                last_update: timestamp,
                absent_ticks: 0,
            });
            state.usage = *usage;
            state.last_update = timestamp;
            state.absent_ticks = 0;
        }

        let limit = self.config.eviction_absent_ticks;
        let mut evicted: Vec<Pid> = self
            .states
            .values()
            .filter(|s| s.absent_ticks >= limit)
            .map(|s| s.pid)
            .collect();
        evicted.sort_unstable();
        for pid in &evicted {
            self.states.remove(pid);
        }
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "evicted relaxation states");
        }
        evicted
    }

    /// Run one relaxation tick over the processes in `graph`.
    ///
    /// Nothing is committed unless the whole tick succeeds. Returns `None`
    /// when no tracked process is in the graph.
    pub fn relax(&mut self, graph: &SimilarityGraph, now: DateTime<Utc>) -> Result<Option<RelaxationRecord>> {
        // Positions in the graph of the pids we hold a state for.
        let members: Vec<(usize, Pid)> = graph
            .pids()
            .iter()
            .enumerate()
            .filter(|(_, pid)| self.states.contains_key(*pid))
            .map(|(i, pid)| (i, *pid))
            .collect();
        if members.is_empty() {
            return Ok(None);
        }

        let coupling = graph.coupling_matrix();
        let temperature = self.temperature;
        let dim = self.config.state_dimension;

        let mut current: Vec<Vec<f64>> = members
            .iter()
            .map(|(_, pid)| self.states[pid].state.clone())
            .collect();

        for _ in 0..self.config.relaxation_steps {
            current = (0..members.len())
                .into_par_iter()
                .map(|i| relax_one(i, &members, &coupling, &current, temperature, dim))
                .collect();
        }

        let mut priorities = BTreeMap::new();
        for ((_, pid), state) in members.iter().zip(current.iter()) {
            if state.iter().any(|x| !x.is_finite()) {
                return Err(EngineError::component(
                    "relaxation",
                    format!("non-finite state for pid {}", pid),
                ));
            }
            priorities.insert(*pid, blend_priority(state, &self.states[pid].usage));
        }

        // Commit.
        for ((_, pid), state) in members.iter().zip(current.into_iter()) {
            if let Some(entry) = self.states.get_mut(pid) {
                entry.state = state;
                entry.priority = Some(priorities[pid]);
            }
        }

        let record = RelaxationRecord {
            timestamp: now,
            temperature,
            priorities,
        };
        self.log.push_back(record.clone());
        while self.log.len() > self.config.optimization_log_capacity {
            self.log.pop_front();
        }

        self.temperature =
            (self.temperature * self.config.annealing_rate).max(self.config.min_temperature);

        debug!(
            processes = members.len(),
            temperature,
            next_temperature = self.temperature,
            "relaxation tick complete"
        );

        Ok(Some(record))
    }

    pub fn priority_of(&self, pid: Pid) -> Option<f64> {
        self.states.get(&pid).and_then(|s| s.priority)
    }

    pub fn state_of(&self, pid: Pid) -> Option<&ProcessState> {
        self.states.get(&pid)
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    pub fn tracked(&self) -> usize {
        self.states.len()
    }

    /// Relaxation records, oldest first.
    pub fn optimization_log(&self) -> Vec<RelaxationRecord> {
        self.log.iter().cloned().collect()
    }

    #[cfg(test)]
    fn set_state(&mut self, pid: Pid, state: Vec<f64>) {
        if let Some(entry) = self.states.get_mut(&pid) {
            entry.state = state;
        }
    }
}

/// One Jacobi update of member `i`. Keeps the previous state when the
/// updated vector collapses to zero.
fn relax_one(
    i: usize,
    members: &[(usize, Pid)],
    coupling: &[Vec<f64>],
    current: &[Vec<f64>],
    temperature: f64,
    dim: usize,
) -> Vec<f64> {
    let gi = members[i].0;
    let mut force = vec![0.0; dim];
    for (j, (gj, _)) in members.iter().enumerate() {
        if i == j {
            continue;
        }
        let c = coupling[gi][*gj];
        if c == 0.0 {
            continue;
        }
        for d in 0..dim {
            force[d] += c * (current[j][d] - current[i][d]);
        }
    }

    let candidate: Vec<f64> = current[i]
        .iter()
        .zip(force.iter())
        .map(|(s, f)| s + f * temperature)
        .collect();

    normalize(&candidate).unwrap_or_else(|| current[i].clone())
}

/// A unit vector with entries drawn from `[0, 1)`, re-drawn if degenerate.
fn random_unit_vector(dim: usize, seed: u64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    for _ in 0..8 {
        let v: Vec<f64> = (0..dim).map(|_| rng.gen::<f64>()).collect();
        if let Some(unit) = normalize(&v) {
            return unit;
        }
    }
    vec![1.0 / (dim as f64).sqrt(); dim]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(cpu: f64, memory: f64, io: f64) -> ResourceUsage {
        ResourceUsage { cpu, memory, io }
    }

    fn config() -> Arc<EngineConfig> {
        Arc::new(EngineConfig::default())
    }

    fn entries() -> Vec<(Pid, ResourceUsage)> {
        vec![
            (101, usage(90.0, 10.0, 0.0)),
            (102, usage(88.0, 12.0, 0.0)),
            (103, usage(5.0, 60.0, 80.0)),
            (104, usage(0.0, 0.0, 0.0)),
            (105, usage(30.0, 30.0, 30.0)),
        ]
    }

    fn norm(v: &[f64]) -> f64 {
        v.iter().map(|x| x * x).sum::<f64>().sqrt()
    }

    #[test]
    fn zero_dimension_is_rejected() {
        let config = Arc::new(EngineConfig {
            state_dimension: 0,
            ..EngineConfig::default()
        });
        assert!(matches!(
            PriorityRelaxation::new(config),
            Err(EngineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn new_states_are_unit_length() {
        let mut relax = PriorityRelaxation::new(config()).unwrap();
        relax.observe(&entries(), Utc::now());
        for (pid, _) in entries() {
            let s = relax.state_of(pid).unwrap();
            assert_eq!(s.state.len(), 4);
            assert!((norm(&s.state) - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn relaxed_states_stay_normalized_and_priorities_bounded() {
        let mut relax = PriorityRelaxation::new(config()).unwrap();
        let entries = entries();
        for _ in 0..5 {
            relax.observe(&entries, Utc::now());
            let graph = SimilarityGraph::build(&entries, 0.7);
            let record = relax.relax(&graph, Utc::now()).unwrap().unwrap();
            assert_eq!(record.priorities.len(), entries.len());
            for (pid, _) in &entries {
                let s = relax.state_of(*pid).unwrap();
                assert!((norm(&s.state) - 1.0).abs() < 1e-6);
                let p = relax.priority_of(*pid).unwrap();
                assert!((0.0..=1.0).contains(&p), "priority {} out of range", p);
            }
        }
    }

    #[test]
    fn priority_is_unknown_until_relaxed() {
        let mut relax = PriorityRelaxation::new(config()).unwrap();
        let entries = entries();
        relax.observe(&entries, Utc::now());
        assert!(relax.state_of(101).is_some());
        assert_eq!(relax.priority_of(101), None);

        let graph = SimilarityGraph::build(&entries[..2], 0.7);
        relax.relax(&graph, Utc::now()).unwrap();
        assert!(relax.priority_of(101).is_some());
        assert!(relax.priority_of(102).is_some());
        // Tracked but outside the relaxed graph.
        assert_eq!(relax.priority_of(103), None);
    }

    #[test]
    fn duplicate_entry_keeps_first_usage() {
        let mut relax = PriorityRelaxation::new(config()).unwrap();
        relax.observe(&[(7, usage(10.0, 5.0, 0.0)), (7, usage(90.0, 5.0, 0.0))], Utc::now());
        assert_eq!(relax.state_of(7).unwrap().usage, usage(10.0, 5.0, 0.0));
        assert_eq!(relax.tracked(), 1);
    }

    #[test]
    fn deterministic_given_seed() {
        let entries = entries();
        let graph = SimilarityGraph::build(&entries, 0.7);
        let ts = Utc::now();

        let mut a = PriorityRelaxation::new(config()).unwrap();
        let mut b = PriorityRelaxation::new(config()).unwrap();
        a.observe(&entries, ts);
        b.observe(&entries, ts);
        let ra = a.relax(&graph, ts).unwrap().unwrap();
        let rb = b.relax(&graph, ts).unwrap().unwrap();
        assert_eq!(ra.priorities, rb.priorities);
    }

    #[test]
    fn temperature_decays_to_floor() {
        let cfg = Arc::new(EngineConfig {
            relaxation_steps: 1,
            ..EngineConfig::default()
        });
        let mut relax = PriorityRelaxation::new(cfg).unwrap();
        let entries = entries();
        let graph = SimilarityGraph::build(&entries, 0.7);
        relax.observe(&entries, Utc::now());

        let first = relax.relax(&graph, Utc::now()).unwrap().unwrap();
        assert!((first.temperature - 1.0).abs() < 1e-12);
        assert!((relax.temperature() - 0.95).abs() < 1e-12);

        for _ in 0..200 {
            relax.relax(&graph, Utc::now()).unwrap();
        }
        assert!((relax.temperature() - 0.01).abs() < 1e-12);
    }

    #[test]
    fn log_is_bounded() {
        let cfg = Arc::new(EngineConfig {
            relaxation_steps: 1,
            optimization_log_capacity: 3,
            ..EngineConfig::default()
        });
        let mut relax = PriorityRelaxation::new(cfg).unwrap();
        let entries = entries();
        let graph = SimilarityGraph::build(&entries, 0.7);
        relax.observe(&entries, Utc::now());
        for _ in 0..10 {
            relax.relax(&graph, Utc::now()).unwrap();
        }
        let log = relax.optimization_log();
        assert_eq!(log.len(), 3);
        assert!(log[0].temperature > log[2].temperature);
    }

    #[test]
    fn empty_graph_is_a_no_op() {
        let mut relax = PriorityRelaxation::new(config()).unwrap();
        let result = relax.relax(&SimilarityGraph::new(0.7), Utc::now()).unwrap();
        assert!(result.is_none());
        assert_eq!(relax.temperature(), 1.0);
        assert!(relax.optimization_log().is_empty());
    }

    #[test]
    fn absent_pids_are_evicted_after_limit() {
        let cfg = Arc::new(EngineConfig {
            eviction_absent_ticks: 3,
            ..EngineConfig::default()
        });
        let mut relax = PriorityRelaxation::new(cfg).unwrap();
        relax.observe(&[(1, usage(10.0, 10.0, 0.0)), (2, usage(20.0, 5.0, 0.0))], Utc::now());

        let only_one = [(1, usage(10.0, 10.0, 0.0))];
        assert!(relax.observe(&only_one, Utc::now()).is_empty());
        assert!(relax.observe(&only_one, Utc::now()).is_empty());
        assert!(relax.state_of(2).is_some());
        assert_eq!(relax.observe(&only_one, Utc::now()), vec![2]);
        assert!(relax.state_of(2).is_none());
        assert_eq!(relax.tracked(), 1);
    }

    #[test]
    fn reappearing_pid_resets_absence() {
        let cfg = Arc::new(EngineConfig {
            eviction_absent_ticks: 2,
            ..EngineConfig::default()
        });
        let mut relax = PriorityRelaxation::new(cfg).unwrap();
        let both = [(1, usage(10.0, 10.0, 0.0)), (2, usage(20.0, 5.0, 0.0))];
        let one = [(1, usage(10.0, 10.0, 0.0))];
        relax.observe(&both, Utc::now());
        relax.observe(&one, Utc::now());
        relax.observe(&both, Utc::now());
        relax.observe(&one, Utc::now());
        assert!(relax.state_of(2).is_some());
    }

    #[test]
    fn collapsing_update_keeps_previous_state() {
        // One idle process and one busy one: similarity 0, coupling 1.
        // With temperature 0.5 and opposite states, s + 0.5 * (-s - s) = 0.
        let cfg = Arc::new(EngineConfig {
            initial_temperature: 0.5,
            relaxation_steps: 1,
            ..EngineConfig::default()
        });
        let mut relax = PriorityRelaxation::new(cfg).unwrap();
        let entries = [(1, usage(0.0, 0.0, 0.0)), (2, usage(50.0, 50.0, 0.0))];
        relax.observe(&entries, Utc::now());
        relax.set_state(1, vec![1.0, 0.0, 0.0, 0.0]);
        relax.set_state(2, vec![-1.0, 0.0, 0.0, 0.0]);

        let graph = SimilarityGraph::build(&entries, 0.7);
        relax.relax(&graph, Utc::now()).unwrap();

        assert_eq!(relax.state_of(1).unwrap().state, vec![1.0, 0.0, 0.0, 0.0]);
        assert_eq!(relax.state_of(2).unwrap().state, vec![-1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn blend_priority_weights() {
        let p = blend_priority(&[0.5, 0.5, 0.5, 0.5], &usage(100.0, 100.0, 0.0));
        assert!((p - (0.7 * 0.5 + 0.3)).abs() < 1e-12);
        assert_eq!(blend_priority(&[-1.0, 0.0], &usage(0.0, 0.0, 0.0)), 0.0);
        assert_eq!(blend_priority(&[1.0, 1.0], &usage(400.0, 100.0, 0.0)), 1.0);
    }

    #[test]
    fn normalize_rejects_zero() {
        assert!(normalize(&[0.0, 0.0]).is_none());
        assert!(normalize(&[f64::NAN, 1.0]).is_none());
        let v = normalize(&[3.0, 4.0]).unwrap();
        assert!((v[0] - 0.6).abs() < 1e-12 && (v[1] - 0.8).abs() < 1e-12);
    }
}
