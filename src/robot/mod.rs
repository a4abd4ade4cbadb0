pub mod models;
pub mod position;
pub mod registry;
pub mod strategy;
pub mod worker_pool;

pub use models::{Alert, RobotPosition, RobotState, RobotStatus, Signal, SignalRecord, SignalType};
pub use registry::{RobotEntry, RobotHandle, RobotRegistry};
pub use strategy::{execute_job, JobKind, JobResult, RobotJob, Strategy, StrategyError, StrategyRegistry};
pub use worker_pool::StrategyWorkerPool;

#[cfg(test)]
mod tests;
