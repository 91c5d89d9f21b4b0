//! Cadence control for the engine's periodic components.
//!
//! Telemetry is pushed in by the caller; relaxation and action synthesis each
//! run on their own wall-clock cadence behind a [`CadenceGate`].

pub mod cadence;

pub use cadence::{CadenceGate, CadenceGuard};
