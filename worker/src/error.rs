use std::{error::Error, fmt, io, path::PathBuf};

use comms::collective::CollectiveErr;
use machine_learning::MlErr;
use tokio::task::JoinError;

/// The worker module's result type.
pub type Result<T> = std::result::Result<T, WorkerErr>;

/// Worker runtime failures, every one of them is fatal to the training run.
#[derive(Debug)]
pub enum WorkerErr {
    Io(io::Error),
    Collective(CollectiveErr),
    Ml(MlErr),
    Config(String),
    Dataset(String),
    Decode {
        path: PathBuf,
        detail: String,
    },
    Checkpoint {
        path: PathBuf,
        detail: String,
    },
    StateNotSynchronized,
    Task(JoinError),
}

impl fmt::Display for WorkerErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerErr::Io(e) => write!(f, "io error: {e}"),
            WorkerErr::Collective(e) => write!(f, "collective failed: {e}"),
            WorkerErr::Ml(e) => write!(f, "model failed: {e}"),
            WorkerErr::Config(detail) => write!(f, "invalid configuration: {detail}"),
            WorkerErr::Dataset(detail) => write!(f, "invalid dataset: {detail}"),
            WorkerErr::Decode { path, detail } => {
                write!(f, "failed to load example {}: {detail}", path.display())
            }
            WorkerErr::Checkpoint { path, detail } => {
                write!(f, "checkpoint {} failed: {detail}", path.display())
            }
            WorkerErr::StateNotSynchronized => write!(
                f,
                "tried to average gradients before the initial state was broadcast"
            ),
            WorkerErr::Task(e) => write!(f, "compute task failed: {e}"),
        }
    }
}

impl Error for WorkerErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            WorkerErr::Io(e) => Some(e),
            WorkerErr::Collective(e) => Some(e),
            WorkerErr::Ml(e) => Some(e),
            WorkerErr::Task(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for WorkerErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<CollectiveErr> for WorkerErr {
    fn from(value: CollectiveErr) -> Self {
        Self::Collective(value)
    }
}

impl From<MlErr> for WorkerErr {
    fn from(value: MlErr) -> Self {
        Self::Ml(value)
    }
}

impl From<JoinError> for WorkerErr {
    fn from(value: JoinError) -> Self {
        Self::Task(value)
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<WorkerErr> for io::Error {
    fn from(value: WorkerErr) -> Self {
        match value {
            WorkerErr::Io(e) => e,
            WorkerErr::Config(_) => io::Error::new(io::ErrorKind::InvalidInput, value),
            WorkerErr::Dataset(_) => io::Error::new(io::ErrorKind::NotFound, value),
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
