pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod error;
pub mod job;
pub mod model;
pub mod phases;
pub mod replica;
pub mod report;
pub mod runner;
pub mod runners;

pub use checkpoint::{Checkpointer, CheckpointRecord, FileCheckpointer};
pub use config::TrainConfig;
pub use error::{Result, WorkflowError};
pub use model::{Model, ModelState, Parameter};
pub use phases::{Phase, PhaseController, PhaseOutput};
pub use replica::{DistributedModel, ReplicaOptions};
pub use report::{MetricsReport, RunResult};
pub use runner::{Runner, TrainedConfigs};
