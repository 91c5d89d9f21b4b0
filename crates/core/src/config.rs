use std::env;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

const ENV_PREFIX: &str = "NEURAPULSE";

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_NEURAPULSE_{KEY} first, falls back to NEURAPULSE_{KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}_{}", profile, ENV_PREFIX, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(&format!("{}_{}", ENV_PREFIX, key))
}

fn profiled_env_parse<T: std::str::FromStr>(profile: &str, key: &str, default: T) -> T {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_list(profile: &str, key: &str, default: Vec<String>) -> Vec<String> {
    match profiled_env_opt(profile, key) {
        Some(v) => v
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        None => default,
    }
}

// ── Engine config ─────────────────────────────────────────────

/// Every tunable of the engine. Built once and shared read-only by all
/// components; nothing inside the engine reads the environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    // Action synthesis
    pub cpu_threshold: f64,
    pub memory_threshold: f64,
    /// Summed read+write bytes above which an io action is raised.
    pub io_threshold: f64,
    pub action_threshold: f64,
    pub process_cpu_threshold: f64,
    pub process_memory_threshold: f64,
    pub thread_threshold: u32,
    /// How many top consumers the cpu/memory passes look at.
    pub top_consumers: usize,
    pub io_action_priority: f64,
    pub thread_action_priority: f64,
    pub action_cooldown_ms: u64,
    pub protected_process_names: Vec<String>,
    pub critical_pid_ceiling: u32,
    pub history_capacity: usize,

    // Similarity graph
    pub entanglement_threshold: f64,
    pub max_tracked_processes: usize,

    // Priority relaxation
    pub state_dimension: usize,
    pub initial_temperature: f64,
    pub annealing_rate: f64,
    pub min_temperature: f64,
    pub relaxation_steps: usize,
    pub relaxation_interval_ms: u64,
    pub optimization_log_capacity: usize,

    // Continual predictor
    pub window_size: usize,
    pub base_learning_rate: f64,
    pub max_learning_rate: f64,
    pub learning_rate_recovery_ticks: u32,

    // Drift / anomaly monitor
    pub drift_delta: f64,
    pub anomaly_score_threshold: f64,
    pub anomaly_trees: usize,
    pub anomaly_tree_height: usize,
    pub anomaly_window_size: usize,

    // Per-pid bookkeeping
    pub eviction_absent_ticks: u32,

    // Host facts used to size affinity masks and working sets
    pub cpu_count: usize,
    pub total_memory_bytes: u64,

    /// Seed for state vectors, model weights and tree splits.
    pub seed: u64,
}

fn default_protected_names() -> Vec<String> {
    ["system", "svchost.exe", "explorer.exe", "systemd", "init", "kthreadd"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cpu_threshold: 80.0,
            memory_threshold: 85.0,
            io_threshold: 1_000_000.0,
            action_threshold: 0.7,
            process_cpu_threshold: 50.0,
            process_memory_threshold: 50.0,
            thread_threshold: 100,
            top_consumers: 5,
            io_action_priority: 0.8,
            thread_action_priority: 0.7,
            action_cooldown_ms: 500,
            protected_process_names: default_protected_names(),
            critical_pid_ceiling: 100,
            history_capacity: 1000,

            entanglement_threshold: 0.7,
            max_tracked_processes: 64,

            state_dimension: 4,
            initial_temperature: 1.0,
            annealing_rate: 0.95,
            min_temperature: 0.01,
            relaxation_steps: 100,
            relaxation_interval_ms: 1000,
            optimization_log_capacity: 256,

            window_size: 10,
            base_learning_rate: 0.001,
            max_learning_rate: 0.064,
            learning_rate_recovery_ticks: 10,

            drift_delta: 0.002,
            anomaly_score_threshold: 0.8,
            anomaly_trees: 10,
            anomaly_tree_height: 8,
            anomaly_window_size: 250,

            eviction_absent_ticks: 5,

            cpu_count: default_cpu_count(),
            total_memory_bytes: 16 * 1024 * 1024 * 1024,

            seed: 42,
        }
    }
}

impl EngineConfig {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `NEURAPULSE_PROFILE`. When set (e.g. `LAPTOP`),
    /// every key is first looked up as `LAPTOP_NEURAPULSE_{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_opt("NEURAPULSE_PROFILE")
            .unwrap_or_default()
            .to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        let d = Self::default();
        Self {
            cpu_threshold: profiled_env_parse(p, "CPU_THRESHOLD", d.cpu_threshold),
            memory_threshold: profiled_env_parse(p, "MEMORY_THRESHOLD", d.memory_threshold),
            io_threshold: profiled_env_parse(p, "IO_THRESHOLD", d.io_threshold),
            action_threshold: profiled_env_parse(p, "ACTION_THRESHOLD", d.action_threshold),
            process_cpu_threshold: profiled_env_parse(p, "PROCESS_CPU_THRESHOLD", d.process_cpu_threshold),
            process_memory_threshold: profiled_env_parse(p, "PROCESS_MEMORY_THRESHOLD", d.process_memory_threshold),
            thread_threshold: profiled_env_parse(p, "THREAD_THRESHOLD", d.thread_threshold),
            top_consumers: profiled_env_parse(p, "TOP_CONSUMERS", d.top_consumers),
            io_action_priority: profiled_env_parse(p, "IO_ACTION_PRIORITY", d.io_action_priority),
            thread_action_priority: profiled_env_parse(p, "THREAD_ACTION_PRIORITY", d.thread_action_priority),
            action_cooldown_ms: profiled_env_parse(p, "ACTION_COOLDOWN_MS", d.action_cooldown_ms),
            protected_process_names: profiled_env_list(p, "PROTECTED_PROCESS_NAMES", d.protected_process_names),
            critical_pid_ceiling: profiled_env_parse(p, "CRITICAL_PID_CEILING", d.critical_pid_ceiling),
            history_capacity: profiled_env_parse(p, "HISTORY_CAPACITY", d.history_capacity),
            entanglement_threshold: profiled_env_parse(p, "ENTANGLEMENT_THRESHOLD", d.entanglement_threshold),
            max_tracked_processes: profiled_env_parse(p, "MAX_TRACKED_PROCESSES", d.max_tracked_processes),
            state_dimension: profiled_env_parse(p, "STATE_DIMENSION", d.state_dimension),
            initial_temperature: profiled_env_parse(p, "INITIAL_TEMPERATURE", d.initial_temperature),
            annealing_rate: profiled_env_parse(p, "ANNEALING_RATE", d.annealing_rate),
            min_temperature: profiled_env_parse(p, "MIN_TEMPERATURE", d.min_temperature),
            relaxation_steps: profiled_env_parse(p, "RELAXATION_STEPS", d.relaxation_steps),
            relaxation_interval_ms: profiled_env_parse(p, "RELAXATION_INTERVAL_MS", d.relaxation_interval_ms),
            optimization_log_capacity: profiled_env_parse(p, "OPTIMIZATION_LOG_CAPACITY", d.optimization_log_capacity),
            window_size: profiled_env_parse(p, "WINDOW_SIZE", d.window_size),
            base_learning_rate: profiled_env_parse(p, "BASE_LEARNING_RATE", d.base_learning_rate),
            max_learning_rate: profiled_env_parse(p, "MAX_LEARNING_RATE", d.max_learning_rate),
            learning_rate_recovery_ticks: profiled_env_parse(p, "LEARNING_RATE_RECOVERY_TICKS", d.learning_rate_recovery_ticks),
            drift_delta: profiled_env_parse(p, "DRIFT_DELTA", d.drift_delta),
            anomaly_score_threshold: profiled_env_parse(p, "ANOMALY_SCORE_THRESHOLD", d.anomaly_score_threshold),
            anomaly_trees: profiled_env_parse(p, "ANOMALY_TREES", d.anomaly_trees),
            anomaly_tree_height: profiled_env_parse(p, "ANOMALY_TREE_HEIGHT", d.anomaly_tree_height),
            anomaly_window_size: profiled_env_parse(p, "ANOMALY_WINDOW_SIZE", d.anomaly_window_size),
            eviction_absent_ticks: profiled_env_parse(p, "EVICTION_ABSENT_TICKS", d.eviction_absent_ticks),
            cpu_count: profiled_env_parse(p, "CPU_COUNT", d.cpu_count),
            total_memory_bytes: profiled_env_parse(p, "TOTAL_MEMORY_BYTES", d.total_memory_bytes),
            seed: profiled_env_parse(p, "SEED", d.seed),
        }
    }

    /// Parse a TOML file. Missing keys keep their defaults.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::InvalidConfig(format!("failed to read {}: {}", path.display(), e))
        })?;
        toml::from_str(&content).map_err(|e| {
            EngineError::InvalidConfig(format!("failed to parse {}: {}", path.display(), e))
        })
    }

    pub fn action_cooldown(&self) -> Duration {
        Duration::from_millis(self.action_cooldown_ms)
    }

    pub fn relaxation_interval(&self) -> Duration {
        Duration::from_millis(self.relaxation_interval_ms)
    }

    /// Whether `name` is in the protected set (case-insensitive).
    pub fn is_protected_name(&self, name: &str) -> bool {
        let lower = name.to_lowercase();
        self.protected_process_names
            .iter()
            .any(|p| p.to_lowercase() == lower)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        fn bad(msg: String) -> Result<()> {
            Err(EngineError::InvalidConfig(msg))
        }

        let finite = [
            ("cpu_threshold", self.cpu_threshold),
            ("memory_threshold", self.memory_threshold),
            ("io_threshold", self.io_threshold),
            ("process_cpu_threshold", self.process_cpu_threshold),
            ("process_memory_threshold", self.process_memory_threshold),
            ("initial_temperature", self.initial_temperature),
            ("drift_delta", self.drift_delta),
        ];
        for (name, v) in finite {
            if !v.is_finite() {
                return bad(format!("{} must be finite, got {}", name, v));
            }
        }

        let unit = [
            ("action_threshold", self.action_threshold),
            ("entanglement_threshold", self.entanglement_threshold),
            ("anomaly_score_threshold", self.anomaly_score_threshold),
            ("io_action_priority", self.io_action_priority),
            ("thread_action_priority", self.thread_action_priority),
        ];
        for (name, v) in unit {
            if !(0.0..=1.0).contains(&v) {
                return bad(format!("{} must be in [0, 1], got {}", name, v));
            }
        }

        if self.state_dimension == 0 {
            return bad("state_dimension must be at least 1".into());
        }
        if self.window_size < 2 {
            return bad(format!("window_size must be at least 2, got {}", self.window_size));
        }
        if self.relaxation_steps == 0 {
            return bad("relaxation_steps must be at least 1".into());
        }
        if self.max_tracked_processes == 0 {
            return bad("max_tracked_processes must be at least 1".into());
        }
        if !(self.annealing_rate > 0.0 && self.annealing_rate <= 1.0) {
            return bad(format!("annealing_rate must be in (0, 1], got {}", self.annealing_rate));
        }
        if !(self.min_temperature > 0.0 && self.min_temperature <= self.initial_temperature) {
            return bad(format!(
                "min_temperature must be in (0, initial_temperature], got {}",
                self.min_temperature
            ));
        }
        if !(self.base_learning_rate > 0.0 && self.base_learning_rate <= self.max_learning_rate)
            || !self.max_learning_rate.is_finite()
        {
            return bad(format!(
                "learning rates must satisfy 0 < base ({}) <= max ({})",
                self.base_learning_rate, self.max_learning_rate
            ));
        }
        if !(self.drift_delta > 0.0 && self.drift_delta < 1.0) {
            return bad(format!("drift_delta must be in (0, 1), got {}", self.drift_delta));
        }
        if self.cpu_count == 0 {
            return bad("cpu_count must be at least 1".into());
        }
        if self.history_capacity == 0 || self.optimization_log_capacity == 0 {
            return bad("history and optimization log capacities must be at least 1".into());
        }
        if self.anomaly_trees == 0 || self.anomaly_tree_height == 0 || self.anomaly_window_size == 0 {
            return bad("anomaly trees, height and window size must be at least 1".into());
        }
        // Heap-indexed trees; keep the node count sane.
        if self.anomaly_tree_height > 20 {
            return bad(format!(
                "anomaly_tree_height must be at most 20, got {}",
                self.anomaly_tree_height
            ));
        }
        if self.eviction_absent_ticks == 0 {
            return bad("eviction_absent_ticks must be at least 1".into());
        }
        Ok(())
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Engine config:");
        tracing::info!(
            "  actions:     cpu>{} mem>{} io>{} threshold={} cooldown={}ms",
            self.cpu_threshold,
            self.memory_threshold,
            self.io_threshold,
            self.action_threshold,
            self.action_cooldown_ms
        );
        tracing::info!(
            "  relaxation:  K={} steps={} rate={} interval={}ms",
            self.state_dimension,
            self.relaxation_steps,
            self.annealing_rate,
            self.relaxation_interval_ms
        );
        tracing::info!(
            "  predictor:   window={} lr={} (max {})",
            self.window_size,
            self.base_learning_rate,
            self.max_learning_rate
        );
        tracing::info!(
            "  tracking:    max={} evict_after={} ticks, protected={:?}",
            self.max_tracked_processes,
            self.eviction_absent_ticks,
            self.protected_process_names
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.state_dimension, 4);
        assert_eq!(config.window_size, 10);
        assert_eq!(config.action_cooldown(), Duration::from_millis(500));
        assert_eq!(config.relaxation_interval(), Duration::from_secs(1));
    }

    #[test]
    fn zero_state_dimension_is_fatal() {
        let config = EngineConfig {
            state_dimension: 0,
            ..EngineConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), crate::error::FaultKind::Fatal);
    }

    #[test]
    fn rejects_out_of_range_thresholds() {
        let config = EngineConfig {
            action_threshold: 1.5,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());

        let config = EngineConfig {
            annealing_rate: 0.0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());

        let config = EngineConfig {
            min_temperature: 2.0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());

        let config = EngineConfig {
            base_learning_rate: 0.5,
            max_learning_rate: 0.1,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn protected_names_are_case_insensitive() {
        let config = EngineConfig::default();
        assert!(config.is_protected_name("SvcHost.exe"));
        assert!(config.is_protected_name("System"));
        assert!(!config.is_protected_name("worker.exe"));
    }

    #[test]
    fn toml_file_keeps_defaults_for_missing_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "cpu_threshold = 70.0").unwrap();
        writeln!(file, "state_dimension = 8").unwrap();
        writeln!(file, "protected_process_names = [\"sshd\"]").unwrap();

        let config = EngineConfig::from_toml_file(file.path()).unwrap();
        assert_eq!(config.cpu_threshold, 70.0);
        assert_eq!(config.state_dimension, 8);
        assert_eq!(config.memory_threshold, 85.0);
        assert!(config.is_protected_name("sshd"));
        assert!(!config.is_protected_name("svchost.exe"));
    }

    #[test]
    fn unreadable_toml_is_invalid_config() {
        let err = EngineConfig::from_toml_file(Path::new("/nonexistent/neurapulse.toml"))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));
    }

    #[test]
    fn profile_overrides_fall_back_to_plain_keys() {
        // Unique key names so parallel tests do not race on the same variables.
        env::set_var("NEURAPULSE_SEED", "7");
        env::set_var("TESTPROF_NEURAPULSE_WINDOW_SIZE", "16");
        env::set_var("NEURAPULSE_WINDOW_SIZE", "12");

        let config = EngineConfig::for_profile("testprof");
        assert_eq!(config.window_size, 16);
        assert_eq!(config.seed, 7);

        let config = EngineConfig::for_profile("");
        assert_eq!(config.window_size, 12);

        env::remove_var("NEURAPULSE_SEED");
        env::remove_var("TESTPROF_NEURAPULSE_WINDOW_SIZE");
        env::remove_var("NEURAPULSE_WINDOW_SIZE");
    }
}
