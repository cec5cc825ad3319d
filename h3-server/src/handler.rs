//! The request-handler contract.
//!
//! A [`Handler`] is the pluggable per-connection request processor. The
//! connection task calls it synchronously: `init` when a request's headers
//! have been decoded, `data` for each body chunk, `info` for messages
//! addressed to the stream, and `terminate` exactly once at the end. Each
//! callback returns commands that the connection executes in order on the
//! owning stream.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use tracing::{error, Level};

use h3_machine::StreamId;

use crate::children::{ChildHandle, ChildId, ExitReason, ShutdownPolicy};
use crate::error::Reason;
use crate::request::Request;

/// A response body.
#[derive(Debug, Clone)]
pub enum Body {
    Bytes(Bytes),
    /// Stream `len` bytes of the file at `path`, starting at `offset`,
    /// through the transport's sendfile path.
    Sendfile {
        path: PathBuf,
        offset: u64,
        len: u64,
    },
}

impl Body {
    pub fn empty() -> Self {
        Body::Bytes(Bytes::new())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Body::Bytes(b) => b.is_empty(),
            Body::Sendfile { len, .. } => *len == 0,
        }
    }
}

impl From<Bytes> for Body {
    fn from(b: Bytes) -> Self {
        Body::Bytes(b)
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Self {
        Body::Bytes(Bytes::from_static(s.as_bytes()))
    }
}

/// Instructions a handler returns to the connection.
#[derive(Debug)]
pub enum Command {
    /// Send an informational (1xx) response.
    Inform {
        status: StatusCode,
        headers: HeaderMap,
    },
    /// Send a complete response.
    Response {
        status: StatusCode,
        headers: HeaderMap,
        body: Body,
    },
    /// Send the response headers, leaving the stream open for body data.
    Headers {
        status: StatusCode,
        headers: HeaderMap,
    },
    /// Send body data, optionally finishing the response.
    Data { fin: bool, body: Body },
    /// Send trailers and finish the response.
    Trailers(HeaderMap),
    /// Grow the receive window. Currently accepted and dropped.
    Flow(u64),
    /// Register a spawned child under this stream.
    Spawn {
        child: ChildHandle,
        shutdown: ShutdownPolicy,
    },
    /// Accepted silently.
    SetOptions(HashMap<String, String>),
    /// Emit a log record through the connection's logger.
    Log { level: Level, message: String },
    /// End this stream.
    Stop,
    /// Send a response only if none has been sent yet.
    ErrorResponse {
        status: StatusCode,
        headers: HeaderMap,
        body: Body,
    },
    /// Reserved. Server push is not implemented.
    Push,
}

/// A message delivered to a handler's `info` callback.
pub enum InfoMessage {
    /// A child registered on this stream exited.
    ChildExit { child: ChildId, reason: ExitReason },
    /// Anything another task sent through the [`ConnectionHandle`].
    ///
    /// [`ConnectionHandle`]: crate::transport::ConnectionHandle
    User(Box<dyn Any + Send>),
}

impl fmt::Debug for InfoMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InfoMessage::ChildExit { child, reason } => f
                .debug_struct("ChildExit")
                .field("child", child)
                .field("reason", reason)
                .finish(),
            InfoMessage::User(_) => f.write_str("User(..)"),
        }
    }
}

/// An error returned by a handler callback.
///
/// The connection logs it and resets the stream with `H3_INTERNAL_ERROR`;
/// the connection itself survives.
#[derive(Debug)]
pub struct HandlerError(pub Box<dyn std::error::Error + Send + Sync>);

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl<E: std::error::Error + Send + Sync + 'static> From<E> for HandlerError {
    fn from(e: E) -> Self {
        HandlerError(Box::new(e))
    }
}

/// The per-stream request processor.
pub trait Handler {
    /// Opaque per-stream state, owned by the connection between callbacks.
    type State;

    /// A request's headers are complete. Returns the initial commands and the
    /// stream state.
    fn init(
        &mut self,
        id: StreamId,
        request: Request,
    ) -> Result<(Vec<Command>, Self::State), HandlerError>;

    /// A chunk of the request body arrived. `fin` is set on the last chunk.
    fn data(
        &mut self,
        id: StreamId,
        fin: bool,
        data: Bytes,
        state: &mut Self::State,
    ) -> Result<Vec<Command>, HandlerError>;

    /// A message addressed to this stream arrived.
    fn info(
        &mut self,
        id: StreamId,
        message: InfoMessage,
        state: &mut Self::State,
    ) -> Result<Vec<Command>, HandlerError>;

    /// The stream is over; release whatever `state` holds.
    fn terminate(&mut self, id: StreamId, reason: &Reason, state: Self::State);

    /// Called when a callback fails, before the stream is reset.
    fn on_error(&mut self, id: StreamId, op: &'static str, error: &HandlerError) {
        error!(stream = %id, op, %error, "handler callback failed");
    }
}
