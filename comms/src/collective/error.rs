use std::{
    error::Error,
    fmt::{self, Display},
    io,
};

use crate::msg::OpHeader;

/// The result type used by every collective implementation.
pub type Result<T> = std::result::Result<T, CollectiveErr>;

/// Collective communication failures, none of them are recoverable at this layer.
#[derive(Debug)]
pub enum CollectiveErr {
    Io(io::Error),
    Desync {
        rank: usize,
        expected: OpHeader,
        got: OpHeader,
    },
    InvalidRoot {
        root: usize,
        size: usize,
    },
    Handshake(String),
    UnexpectedMessage {
        rank: usize,
        got: &'static str,
    },
    Aborted(String),
}

impl Display for CollectiveErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectiveErr::Io(e) => write!(f, "io error: {e}"),
            CollectiveErr::Desync {
                rank,
                expected,
                got,
            } => write!(
                f,
                "collective desynchronized: rank {rank} issued {got} while the fleet expected {expected}"
            ),
            CollectiveErr::InvalidRoot { root, size } => {
                write!(f, "root rank {root} is out of range for a fleet of {size}")
            }
            CollectiveErr::Handshake(detail) => write!(f, "fleet handshake failed: {detail}"),
            CollectiveErr::UnexpectedMessage { rank, got } => {
                write!(f, "unexpected message from rank {rank}: got {got}")
            }
            CollectiveErr::Aborted(detail) => write!(f, "the fleet aborted: {detail}"),
        }
    }
}

impl Error for CollectiveErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CollectiveErr::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CollectiveErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}
