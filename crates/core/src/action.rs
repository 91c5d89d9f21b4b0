//! Optimization actions handed to the process control layer.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::telemetry::Pid;

/// Parameter keys understood by process control implementations.
pub mod keys {
    pub const PRIORITY_CLASS: &str = "priority_class";
    pub const AFFINITY_MASK: &str = "affinity_mask";
    pub const WORKING_SET_LIMIT: &str = "working_set_limit";
    pub const IO_PRIORITY: &str = "io_priority";
    pub const THREAD_LIMIT: &str = "thread_limit";
}

/// Resource an action targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Cpu,
    Memory,
    Io,
    Thread,
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Cpu => "cpu",
            Self::Memory => "memory",
            Self::Io => "io",
            Self::Thread => "thread",
        };
        f.write_str(s)
    }
}

/// Scheduling class requested for a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityClass {
    Idle,
    BelowNormal,
    Normal,
    AboveNormal,
    High,
}

impl PriorityClass {
    /// Whether this class is below the default scheduling class.
    pub fn is_lowered(&self) -> bool {
        matches!(self, Self::Idle | Self::BelowNormal)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoPriority {
    Low,
    Normal,
}

/// A single action parameter: a number or one of the known enums.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Integer(u64),
    Priority(PriorityClass),
    Io(IoPriority),
}

impl ParamValue {
    pub fn as_integer(&self) -> Option<u64> {
        match self {
            Self::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_priority_class(&self) -> Option<PriorityClass> {
        match self {
            Self::Priority(p) => Some(*p),
            _ => None,
        }
    }

    pub fn as_io_priority(&self) -> Option<IoPriority> {
        match self {
            Self::Io(p) => Some(*p),
            _ => None,
        }
    }
}

/// An immutable request to adjust one process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationAction {
    pub pid: Pid,
    pub action_type: ActionType,
    pub parameters: BTreeMap<String, ParamValue>,
    /// Urgency in `[0, 1]`; compared against the action threshold.
    pub priority: f64,
    pub timestamp: DateTime<Utc>,
}

impl OptimizationAction {
    pub fn new(pid: Pid, action_type: ActionType, priority: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            pid,
            action_type,
            parameters: BTreeMap::new(),
            priority: priority.clamp(0.0, 1.0),
            timestamp,
        }
    }

    pub fn with_param(mut self, key: &str, value: ParamValue) -> Self {
        self.parameters.insert(key.to_string(), value);
        self
    }

    pub fn param(&self, key: &str) -> Option<&ParamValue> {
        self.parameters.get(key)
    }

    pub fn priority_class(&self) -> Option<PriorityClass> {
        self.param(keys::PRIORITY_CLASS)
            .and_then(ParamValue::as_priority_class)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_is_clamped() {
        let a = OptimizationAction::new(1, ActionType::Cpu, 1.7, Utc::now());
        assert_eq!(a.priority, 1.0);
        let a = OptimizationAction::new(1, ActionType::Cpu, -0.2, Utc::now());
        assert_eq!(a.priority, 0.0);
    }

    #[test]
    fn params_serialize_flat() {
        let a = OptimizationAction::new(500, ActionType::Cpu, 0.92, Utc::now())
            .with_param(keys::PRIORITY_CLASS, ParamValue::Priority(PriorityClass::BelowNormal))
            .with_param(keys::AFFINITY_MASK, ParamValue::Integer(0xff));
        let json = serde_json::to_value(&a).unwrap();
        assert_eq!(json["action_type"], "cpu");
        assert_eq!(json["parameters"]["priority_class"], "below_normal");
        assert_eq!(json["parameters"]["affinity_mask"], 255);

        let back: OptimizationAction = serde_json::from_value(json).unwrap();
        assert_eq!(back.priority_class(), Some(PriorityClass::BelowNormal));
        assert_eq!(
            back.param(keys::AFFINITY_MASK).and_then(ParamValue::as_integer),
            Some(0xff)
        );
    }

    #[test]
    fn lowered_classes() {
        assert!(PriorityClass::BelowNormal.is_lowered());
        assert!(PriorityClass::Idle.is_lowered());
        assert!(!PriorityClass::Normal.is_lowered());
        assert!(!PriorityClass::High.is_lowered());
    }
}
