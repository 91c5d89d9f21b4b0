pub mod action;
pub mod config;
pub mod error;
pub mod telemetry;

pub use action::*;
pub use config::EngineConfig;
pub use error::*;
pub use telemetry::*;
