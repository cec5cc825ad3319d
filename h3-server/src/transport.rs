//! QUIC transport contract.
//!
//! The connection core is generic over any QUIC implementation that can
//! deliver stream events into the connection's inbox and accept writes
//! through the [`Transport`] trait. Stream handles are opaque values owned by
//! the transport; the core never stores them anywhere that outlives the
//! stream.

use std::fmt::{self, Debug};
use std::hash::Hash;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use h3_machine::StreamId;

use crate::children::{ChildId, ExitReason};
use crate::handler::InfoMessage;

/// An error reported by the transport on a direct call.
#[derive(Debug, Clone)]
pub struct TransportError {
    pub reason: String,
}

impl TransportError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.reason, f)
    }
}

impl std::error::Error for TransportError {}

/// Direction of a peer-opened stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dir {
    Bidi,
    Uni,
}

/// FIN flag on a stream write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFlag {
    None,
    Fin,
}

/// Which halves of a stream an abort applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownHalf {
    Both,
    Receive,
}

/// Operations the connection core performs on the QUIC transport.
///
/// Writes are expected to be non-blocking or buffered by the transport;
/// everything here is called synchronously from the connection task.
pub trait Transport {
    /// Opaque per-stream handle.
    type StreamRef: Clone + Eq + Hash + Debug;

    /// Opens a locally-initiated unidirectional stream.
    fn open_uni(&mut self) -> Result<Self::StreamRef, TransportError>;

    /// Writes bytes to a stream, optionally finishing the send half.
    fn send(
        &mut self,
        stream: &Self::StreamRef,
        data: Bytes,
        flag: SendFlag,
    ) -> Result<(), TransportError>;

    /// Streams a file region onto a stream, without finishing it.
    fn sendfile(
        &mut self,
        stream: &Self::StreamRef,
        path: &Path,
        offset: u64,
        len: u64,
    ) -> Result<(), TransportError>;

    /// Aborts one or both halves of a stream with an application error code.
    fn shutdown_stream(&mut self, stream: &Self::StreamRef, half: ShutdownHalf, code: u64);

    /// Closes the connection with an application error code.
    fn shutdown_connection(&mut self, code: u64);

    fn peername(&self) -> Result<SocketAddr, TransportError>;

    fn sockname(&self) -> Result<SocketAddr, TransportError>;

    /// Enables active delivery of events for a peer-opened stream.
    fn set_active(&mut self, stream: &Self::StreamRef) -> Result<(), TransportError>;
}

/// Everything that can arrive in the connection task's inbox.
///
/// Transport implementations deliver the stream-level variants; the
/// [`ConnectionHandle`] produces the rest.
#[derive(Debug)]
pub enum Event<R> {
    /// Bytes arrived on a stream, with the FIN bit of the QUIC frame.
    StreamData { stream: R, data: Bytes, fin: bool },
    /// The peer opened a stream.
    NewStream { stream: R, dir: Dir },
    /// A stream was closed by the transport.
    StreamClosed { stream: R },
    /// The connection is gone.
    ConnectionClosed,
    /// The transport is shutting the connection down.
    TransportShutdown,
    /// The peer shut down its send half of a stream.
    PeerSendShutdown { stream: R },
    /// Our send shutdown completed.
    SendShutdownComplete { stream: R },
    /// A message addressed to a stream's handler.
    StreamMessage { id: StreamId, message: InfoMessage },
    /// A monitored child task exited.
    ChildDown { child: ChildId, reason: ExitReason },
}

trait EventSink {
    fn stream_message(&self, id: StreamId, message: InfoMessage);
    fn child_down(&self, child: ChildId, reason: ExitReason);
}

impl<R: Send + 'static> EventSink for mpsc::UnboundedSender<Event<R>> {
    fn stream_message(&self, id: StreamId, message: InfoMessage) {
        // The connection may already be gone; senders outlive it.
        let _ = self.send(Event::StreamMessage { id, message });
    }

    fn child_down(&self, child: ChildId, reason: ExitReason) {
        let _ = self.send(Event::ChildDown { child, reason });
    }
}

/// A cheap, cloneable address for the connection task.
///
/// Handler tasks never touch the transport; they talk to the connection
/// exclusively through this handle, addressed by stream id.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<dyn EventSink + Send + Sync>,
}

impl ConnectionHandle {
    pub(crate) fn new<R: Send + 'static>(sender: mpsc::UnboundedSender<Event<R>>) -> Self {
        Self {
            inner: Arc::new(sender),
        }
    }

    /// Delivers `message` to the handler owning `id` through the connection
    /// task's inbox.
    pub fn send_to_stream(&self, id: StreamId, message: InfoMessage) {
        self.inner.stream_message(id, message);
    }

    pub(crate) fn child_down(&self, child: ChildId, reason: ExitReason) {
        self.inner.child_down(child, reason);
    }
}

impl Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ConnectionHandle")
    }
}
