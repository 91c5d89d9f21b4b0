use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

/// Wall-clock cadence for one periodic component.
///
/// A run may start when no other run of the same component is in flight and
/// at least `interval` has passed since the last completed run. Missed
/// cadences are skipped, never queued.
#[derive(Debug)]
pub struct CadenceGate {
    name: &'static str,
    interval: chrono::Duration,
    last_run: Mutex<Option<DateTime<Utc>>>,
    in_flight: AtomicBool,
}

/// An admitted run. Dropping it without [`CadenceGuard::complete`] releases
/// the gate but leaves the last completed run unchanged.
#[derive(Debug)]
pub struct CadenceGuard<'a> {
    gate: &'a CadenceGate,
    started_at: DateTime<Utc>,
}

impl CadenceGate {
    pub fn new(name: &'static str, interval: Duration) -> Self {
        let interval = chrono::Duration::from_std(interval).unwrap_or(chrono::Duration::MAX);
        Self {
            name,
            interval,
            last_run: Mutex::new(None),
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether a run at `now` would be admitted, ignoring in-flight runs.
    pub fn should_run(&self, now: DateTime<Utc>) -> bool {
        match *self.last_run.lock().unwrap_or_else(|e| e.into_inner()) {
            None => true,
            Some(last) => now.signed_duration_since(last) >= self.interval,
        }
    }

    /// Try to start a run at `now`.
    pub fn try_begin(&self, now: DateTime<Utc>) -> Option<CadenceGuard<'_>> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(component = self.name, "run already in flight");
            return None;
        }
        if !self.should_run(now) {
            self.in_flight.store(false, Ordering::Release);
            return None;
        }
        Some(CadenceGuard {
            gate: self,
            started_at: now,
        })
    }

    pub fn last_run(&self) -> Option<DateTime<Utc>> {
        *self.last_run.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }
}

impl CadenceGuard<'_> {
    /// Mark the run successful; the next run is measured from its start.
    pub fn complete(self) {
        *self.gate.last_run.lock().unwrap_or_else(|e| e.into_inner()) = Some(self.started_at);
    }
}

impl Drop for CadenceGuard<'_> {
    fn drop(&mut self) {
        self.gate.in_flight.store(false, Ordering::Release);
    }
}
