//! HTTP/3 server connection core.
//!
//! This crate drives one HTTP/3 connection on top of a message-driven QUIC
//! transport: it multiplexes bidirectional request streams and the
//! control/QPACK unidirectional streams, parses frames, assembles requests,
//! dispatches them to a pluggable [`Handler`], and serializes responses back
//! onto QUIC streams.
//!
//! The design is a single-owner actor: one task per connection owns all
//! state, blocks only on its inbox, and handles every event synchronously.
//! Handlers and the tasks they spawn talk back through a
//! [`ConnectionHandle`] addressed by stream id.

pub mod children;
mod config;
mod connection;
mod error;
pub mod handler;
mod registry;
mod request;
pub mod transport;

pub use config::Config;
pub use connection::Connection;
pub use error::{Code, ConnectionError, Error, Reason, SocketError, StreamError};
pub use handler::{Body, Command, Handler, HandlerError, InfoMessage};
pub use request::Request;
pub use transport::{
    ConnectionHandle, Dir, Event, SendFlag, ShutdownHalf, Transport, TransportError,
};

pub use h3_machine::StreamId;
