//! The seam to whatever actually changes process scheduling on the host.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::info;

use neurapulse_core::{OptimizationAction, Result};

/// Applies optimization actions to live processes.
///
/// Implementations must be safe to call from any thread. A failure affects
/// only the action it was called with.
pub trait ProcessControl: Send + Sync {
    fn apply(&self, action: &OptimizationAction) -> Result<()>;
}

/// Logs every action and reports success without touching the OS.
#[derive(Debug, Default)]
pub struct DryRunControl {
    applied: AtomicU64,
}

impl DryRunControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of actions seen so far.
    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }
}

impl ProcessControl for DryRunControl {
    fn apply(&self, action: &OptimizationAction) -> Result<()> {
        self.applied.fetch_add(1, Ordering::Relaxed);
        info!(
            pid = action.pid,
            action = %action.action_type,
            priority = action.priority,
            parameters = ?action.parameters,
            "dry run: would apply action"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use neurapulse_core::ActionType;

    #[test]
    fn dry_run_counts_and_succeeds() {
        let control = DryRunControl::new();
        let action = OptimizationAction::new(500, ActionType::Cpu, 0.9, Utc::now());
        assert!(control.apply(&action).is_ok());
        assert!(control.apply(&action).is_ok());
        assert_eq!(control.applied(), 2);
    }
}
