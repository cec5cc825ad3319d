//! Connection-level error types.

use std::fmt;

pub use h3_codec::Code;
pub use h3_machine::{ConnectionError, StreamError};

use crate::transport::TransportError;

/// Transport failure while setting up the connection, before the event loop
/// is entered.
#[derive(Debug)]
pub struct SocketError {
    pub reason: String,
}

impl SocketError {
    pub(crate) fn new(op: &'static str, error: TransportError) -> Self {
        Self {
            reason: format!("{}: {}", op, error),
        }
    }
}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "socket error: {}", self.reason)
    }
}

impl std::error::Error for SocketError {}

/// Why the connection stopped.
#[derive(Debug)]
pub enum Error {
    /// Setup failed before the loop started.
    Socket(SocketError),
    /// A protocol violation terminated the connection.
    Connection(ConnectionError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Socket(e) => e.fmt(f),
            Error::Connection(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for Error {}

impl From<SocketError> for Error {
    fn from(e: SocketError) -> Self {
        Error::Socket(e)
    }
}

impl From<ConnectionError> for Error {
    fn from(e: ConnectionError) -> Self {
        Error::Connection(e)
    }
}

/// Why a stream's handler is being terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reason {
    /// The stream ran to completion or the handler stopped it.
    Normal,
    /// The stream was reset with the given code.
    Reset(Code),
    /// A handler callback failed.
    Internal,
    /// The whole connection is going down.
    Shutdown,
}
