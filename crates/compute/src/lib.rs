pub mod algorithms;
pub mod control;
pub mod engine;
pub mod pipeline;
pub mod scheduler;

pub use algorithms::relaxation::{PriorityRelaxation, ProcessState, RelaxationRecord};
pub use algorithms::similarity::{SimilarityEdge, SimilarityGraph};
pub use control::{DryRunControl, ProcessControl};
pub use engine::{Engine, TickReport};
pub use pipeline::{
    ActionSynthesizer, ContinualPredictor, DriftAndAnomalyMonitor, EngineMetrics, FeatureSample,
    Prediction,
};
pub use scheduler::CadenceGate;
