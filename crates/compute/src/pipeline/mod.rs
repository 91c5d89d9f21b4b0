//! Engine components built on top of the numeric algorithms.
//!
//! Each component owns its per-pid state and is driven once per tick by the
//! [`Engine`](crate::engine::Engine):
//!
//! - **predictor**: per-process online usage models.
//! - **monitor**: system-wide drift and anomaly detection.
//! - **synthesizer**: filtered, recorded optimization actions.

pub mod metrics;
pub mod monitor;
pub mod predictor;
pub mod synthesizer;

pub use metrics::EngineMetrics;
pub use monitor::{DriftAndAnomalyMonitor, MonitorOutcome};
pub use predictor::{
    ContinualPredictor, FeatureSample, LearningRateSchedule, Prediction, PredictorUpdate,
};
pub use synthesizer::{ActionSynthesizer, SynthesisOutcome};
