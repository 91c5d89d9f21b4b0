use thiserror::Error;

/// How far a fault is allowed to propagate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Skip the offending pid; the rest of the tick proceeds.
    Entity,
    /// Keep the component's previous committed state and skip this tick's emission.
    Component,
    /// The engine cannot run; surface to the caller.
    Fatal,
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Malformed snapshot: {0}")]
    MalformedSnapshot(String),

    #[error("{component} failed: {reason}")]
    Component {
        component: &'static str,
        reason: String,
    },

    #[error("Process {pid}: {reason}")]
    Entity { pid: u32, reason: String },

    #[error("Control failed for process {pid}: {reason}")]
    Control { pid: u32, reason: String },

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),
}

impl EngineError {
    pub fn component(component: &'static str, reason: impl Into<String>) -> Self {
        Self::Component {
            component,
            reason: reason.into(),
        }
    }

    pub fn entity(pid: u32, reason: impl Into<String>) -> Self {
        Self::Entity {
            pid,
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> FaultKind {
        match self {
            Self::InvalidConfig(_) => FaultKind::Fatal,
            Self::Entity { .. } | Self::Control { .. } => FaultKind::Entity,
            Self::MalformedSnapshot(_) | Self::Component { .. } | Self::LockPoisoned(_) => {
                FaultKind::Component
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
