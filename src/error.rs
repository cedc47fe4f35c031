use std::fmt;
use std::io;

use raft::node::ProposeError;

use crate::protocol::WireError;

/// Errors surfaced by the node layer.
///
/// Storage failures are fatal to the server loop: continuing with divergent in-memory and
/// durable state would break the recovery contract. Everything else is local and recoverable.
#[derive(Debug)]
pub enum Error {
    /// The cluster configuration is missing, unparsable, or inconsistent.
    Config(String),
    /// Stable storage could not be read or written.
    Storage(String),
    /// A wire document could not be produced or understood.
    Wire(WireError),
    /// A command was refused by the consensus state machine.
    Propose(ProposeError),
    /// The server loop has already exited.
    Stopped,
    /// An underlying socket or file operation failed.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(reason) => write!(f, "configuration error: {}", reason),
            Error::Storage(reason) => write!(f, "storage error: {}", reason),
            Error::Wire(err) => write!(f, "wire error: {}", err),
            Error::Propose(err) => write!(f, "propose refused: {}", err),
            Error::Stopped => write!(f, "server stopped"),
            Error::Io(err) => write!(f, "i/o error: {}", err),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(from: io::Error) -> Self {
        Error::Io(from)
    }
}

impl From<WireError> for Error {
    fn from(from: WireError) -> Self {
        Error::Wire(from)
    }
}
