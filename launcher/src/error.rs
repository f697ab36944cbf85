use std::{error::Error, fmt, io, process::ExitStatus, time::Duration};

/// The launcher's result type.
pub type Result<T> = std::result::Result<T, LaunchError>;

/// Everything that can stop a job from being launched or from completing.
///
/// All of these are job-fatal, a group with a missing member can't make progress.
#[derive(Debug)]
pub enum LaunchError {
    /// The job specification is inconsistent, caught before spawning anything.
    InvalidSpec(String),
    /// A local worker process could not be started.
    Spawn { local_rank: usize, source: io::Error },
    /// A worker failed to form or join the communication group.
    Rendezvous(String),
    /// A local worker process terminated unsuccessfully.
    WorkerExited {
        local_rank: usize,
        status: ExitStatus,
    },
    /// Every worker finished but the local leader never handed back its result.
    MissingResult,
    /// The entry point of an in-process worker failed, after post-mortem inspection.
    Entry {
        rank: usize,
        source: anyhow::Error,
    },
    Collective(CollectiveError),
    Io(io::Error),
}

impl fmt::Display for LaunchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSpec(msg) => write!(f, "invalid job spec: {msg}"),
            Self::Spawn { local_rank, source } => {
                write!(f, "failed to spawn local worker {local_rank}: {source}")
            }
            Self::Rendezvous(msg) => write!(f, "rendezvous failed: {msg}"),
            Self::WorkerExited { local_rank, status } => {
                write!(f, "local worker {local_rank} exited with {status}")
            }
            Self::MissingResult => {
                write!(f, "the local leader finished without reporting a result")
            }
            Self::Entry { rank, source } => write!(f, "worker {rank} failed: {source:#}"),
            Self::Collective(e) => write!(f, "collective error: {e}"),
            Self::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for LaunchError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Spawn { source, .. } => Some(source),
            Self::Entry { source, .. } => Some(&**source),
            Self::Collective(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for LaunchError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<CollectiveError> for LaunchError {
    fn from(e: CollectiveError) -> Self {
        Self::Collective(e)
    }
}

/// Failures of a single collective operation.
#[derive(Debug)]
pub enum CollectiveError {
    /// The link to another member broke, usually because that member died.
    Io(io::Error),
    /// A member sent something that doesn't belong to the collective being run.
    Protocol { expected: &'static str, got: String },
    /// A member contributed a tensor of the wrong length.
    SizeMismatch { rank: usize, got: usize, expected: usize },
    /// Another member reported an error instead of taking part.
    Remote(String),
    /// The optional collective deadline expired.
    Timeout(Duration),
    Codec(serde_json::Error),
}

impl fmt::Display for CollectiveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Protocol { expected, got } => {
                write!(f, "protocol violation: expected {expected}, got {got}")
            }
            Self::SizeMismatch {
                rank,
                got,
                expected,
            } => write!(
                f,
                "rank {rank} contributed {got} values, expected {expected}"
            ),
            Self::Remote(msg) => write!(f, "remote error: {msg}"),
            Self::Timeout(d) => write!(f, "collective did not complete within {d:?}"),
            Self::Codec(e) => write!(f, "codec error: {e}"),
        }
    }
}

impl Error for CollectiveError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Codec(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CollectiveError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for CollectiveError {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e)
    }
}
