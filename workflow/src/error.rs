use std::{error::Error, fmt, io, path::PathBuf};

use launcher::{CollectiveError, LaunchError};

/// The workflow module's result type.
pub type Result<T> = std::result::Result<T, WorkflowError>;

/// Failures of the train and evaluation workflow.
#[derive(Debug)]
pub enum WorkflowError {
    /// The configuration or the command line is invalid.
    Config(String),
    /// Weights or a checkpoint could not be read into the model.
    CheckpointLoad { path: PathBuf, reason: String },
    /// A stored state doesn't match the model it's loaded into.
    IncompatibleState(String),
    /// A parameter got no gradient and unused parameters are not allowed.
    UnusedParameter { name: String },
    GradientLength {
        name: String,
        got: usize,
        expected: usize,
    },
    Collective(CollectiveError),
    Launch(LaunchError),
    /// The runner collaborator failed.
    Runner(anyhow::Error),
    Io(io::Error),
    Json(serde_json::Error),
}

impl fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "invalid configuration: {msg}"),
            Self::CheckpointLoad { path, reason } => {
                write!(f, "failed to load {}: {reason}", path.display())
            }
            Self::IncompatibleState(msg) => write!(f, "incompatible state: {msg}"),
            Self::UnusedParameter { name } => write!(
                f,
                "parameter {name} received no gradient, enable find_unused_parameters if this is expected"
            ),
            Self::GradientLength {
                name,
                got,
                expected,
            } => write!(
                f,
                "gradient of {name} has {got} values, expected {expected}"
            ),
            Self::Collective(e) => write!(f, "collective error: {e}"),
            Self::Launch(e) => write!(f, "launch error: {e}"),
            Self::Runner(e) => write!(f, "runner failed: {e}"),
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Json(e) => write!(f, "json error: {e}"),
        }
    }
}

impl Error for WorkflowError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Collective(e) => Some(e),
            Self::Launch(e) => Some(e),
            Self::Runner(e) => e.source(),
            Self::Io(e) => Some(e),
            Self::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for WorkflowError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for WorkflowError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

impl From<CollectiveError> for WorkflowError {
    fn from(e: CollectiveError) -> Self {
        Self::Collective(e)
    }
}

impl From<LaunchError> for WorkflowError {
    fn from(e: LaunchError) -> Self {
        Self::Launch(e)
    }
}
