// Dependency-driven workflow execution engine for Conveyor

pub mod config;
pub mod dispatch;
pub mod error;
pub mod graph;
pub mod history;
pub mod scheduler;
pub mod store;
pub mod types;

pub use config::EngineConfig;
pub use error::EngineError;
pub use scheduler::{start_engine, Scheduler};
pub use types::*;
