//! The per-connection event loop.
//!
//! One task owns all connection state. It blocks only on the inbox; every
//! transport event, handler message, and child exit is handled synchronously
//! before the next receive. Handler commands for a given stream are executed
//! in the order they arrive, which is the ordering contract responses rely
//! on.

use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use h3_codec::{Code, Encode, Frame, Parsed, StreamType, UnidiKind};
use h3_machine::{
    ConnectionError, FrameOutcome, Machine, MachineError, PreparedTrailers, Role, StreamError,
    StreamId, StreamState,
};

use crate::children::{ChildId, Children, Down, ExitReason};
use crate::config::Config;
use crate::error::{Error, Reason, SocketError};
use crate::handler::{Body, Command, Handler, HandlerError, InfoMessage};
use crate::registry::{Registry, Status};
use crate::request;
use crate::transport::{ConnectionHandle, Dir, Event, SendFlag, ShutdownHalf, Transport};

/// What the loop does after an event.
enum Flow {
    Continue,
    Shutdown,
}

/// An HTTP/3 server connection.
///
/// Create one with [`Connection::new`] once the transport handshake is done,
/// wire the returned sender into the transport's event delivery, then drive
/// everything with [`Connection::run`].
pub struct Connection<T, H>
where
    T: Transport,
    H: Handler,
{
    transport: T,
    inbox: mpsc::UnboundedReceiver<Event<T::StreamRef>>,
    handle: ConnectionHandle,
    handler: H,
    machine: Machine,
    streams: Registry<T::StreamRef, H::State>,
    children: Children,
    peer: SocketAddr,
    local: SocketAddr,
    #[allow(dead_code)]
    control: T::StreamRef,
    encoder: T::StreamRef,
    #[allow(dead_code)]
    decoder: T::StreamRef,
}

impl<T, H> Connection<T, H>
where
    T: Transport,
    T::StreamRef: Send + 'static,
    H: Handler,
{
    /// Opens the local unidirectional trio, sends SETTINGS, and captures the
    /// address pair. Any transport failure here terminates the connection
    /// before the loop is entered.
    ///
    /// The returned sender is the connection's inbox: the transport delivers
    /// its stream events through it.
    pub fn new(
        mut transport: T,
        handler: H,
        config: Config,
    ) -> Result<(Self, mpsc::UnboundedSender<Event<T::StreamRef>>), SocketError> {
        let (settings, mut machine) = Machine::new(Role::Server, config.machine());

        let control = transport
            .open_uni()
            .map_err(|e| SocketError::new("open control stream", e))?;
        let encoder = transport
            .open_uni()
            .map_err(|e| SocketError::new("open encoder stream", e))?;
        let decoder = transport
            .open_uni()
            .map_err(|e| SocketError::new("open decoder stream", e))?;

        // The control stream leads with its type and our SETTINGS in one
        // write; the QPACK streams just announce their types.
        let mut buf = BytesMut::with_capacity(settings.len() + 1);
        StreamType::CONTROL.encode(&mut buf);
        buf.extend_from_slice(&settings);
        transport
            .send(&control, buf.freeze(), SendFlag::None)
            .map_err(|e| SocketError::new("send settings", e))?;

        let mut buf = BytesMut::new();
        StreamType::ENCODER.encode(&mut buf);
        transport
            .send(&encoder, buf.freeze(), SendFlag::None)
            .map_err(|e| SocketError::new("open encoder stream", e))?;

        let mut buf = BytesMut::new();
        StreamType::DECODER.encode(&mut buf);
        transport
            .send(&decoder, buf.freeze(), SendFlag::None)
            .map_err(|e| SocketError::new("open decoder stream", e))?;

        let peer = transport
            .peername()
            .map_err(|e| SocketError::new("peername", e))?;
        let local = transport
            .sockname()
            .map_err(|e| SocketError::new("sockname", e))?;

        let mut streams = Registry::default();
        let control_id = streams.insert(control.clone(), Status::Normal);
        let encoder_id = streams.insert(encoder.clone(), Status::Normal);
        let decoder_id = streams.insert(decoder.clone(), Status::Normal);
        machine.init_unidi_local_streams(control_id, encoder_id, decoder_id);

        let (sender, inbox) = mpsc::unbounded_channel();
        let handle = ConnectionHandle::new(sender.clone());

        Ok((
            Self {
                transport,
                inbox,
                handle,
                handler,
                machine,
                streams,
                children: Children::default(),
                peer,
                local,
                control,
                encoder,
                decoder,
            },
            sender,
        ))
    }

    /// The address other tasks use to message this connection.
    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn local(&self) -> SocketAddr {
        self.local
    }

    /// Drives the connection until it terminates.
    pub async fn run(mut self) -> Result<(), Error> {
        loop {
            let event = match self.inbox.recv().await {
                Some(event) => event,
                // Every sender is gone; the transport went away without a
                // closed event.
                None => Event::ConnectionClosed,
            };
            match self.event(event) {
                Ok(Flow::Continue) => (),
                Ok(Flow::Shutdown) => {
                    self.terminate_connection(Code::H3_NO_ERROR, Reason::Shutdown);
                    return Ok(());
                }
                Err(e) => {
                    error!(code = %e.code, reason = %e.reason, "connection error");
                    self.terminate_connection(e.code, Reason::Shutdown);
                    return Err(Error::Connection(e));
                }
            }
        }
    }

    fn event(&mut self, event: Event<T::StreamRef>) -> Result<Flow, ConnectionError> {
        match event {
            Event::StreamData { stream, data, fin } => self.stream_data(stream, data, fin),
            Event::NewStream { stream, dir } => {
                self.new_stream(stream, dir);
                Ok(Flow::Continue)
            }
            Event::StreamClosed { stream } => self.stream_closed(stream),
            Event::ConnectionClosed => Ok(Flow::Shutdown),
            Event::TransportShutdown => {
                trace!("transport shutdown notification");
                Ok(Flow::Continue)
            }
            Event::PeerSendShutdown { .. } | Event::SendShutdownComplete { .. } => {
                trace!("send shutdown notification");
                Ok(Flow::Continue)
            }
            Event::StreamMessage { id, message } => {
                self.stream_message(id, message);
                Ok(Flow::Continue)
            }
            Event::ChildDown { child, reason } => {
                self.child_down(child, reason);
                Ok(Flow::Continue)
            }
        }
    }

    fn new_stream(&mut self, r: T::StreamRef, dir: Dir) {
        if let Err(e) = self.transport.set_active(&r) {
            warn!(error = %e, "failed to enable active delivery");
        }
        let status = match dir {
            Dir::Uni => Status::Header,
            Dir::Bidi => Status::Normal,
        };
        let id = self.streams.insert(r, status);
        match dir {
            Dir::Uni => self.machine.init_unidi_stream(id),
            Dir::Bidi => self.machine.init_bidi_stream(id),
        }
        debug!(stream = %id, ?dir, "peer opened stream");
    }

    fn stream_closed(&mut self, r: T::StreamRef) -> Result<Flow, ConnectionError> {
        let Some(stream) = self.streams.get_mut(&r) else {
            return Ok(Flow::Continue);
        };
        let id = stream.id;
        self.machine.close_stream(id)?;
        self.terminate_stream(&r, Reason::Normal);
        Ok(Flow::Continue)
    }

    /// Feeds inbound bytes through the frame layer.
    fn stream_data(
        &mut self,
        r: T::StreamRef,
        data: Bytes,
        fin: bool,
    ) -> Result<Flow, ConnectionError> {
        let Some(stream) = self.streams.get_mut(&r) else {
            if self.streams.is_lingering(&r) {
                trace!("dropping data for lingering stream");
            } else {
                warn!(stream = ?r, "received data for unknown stream");
            }
            return Ok(Flow::Continue);
        };

        let id = stream.id;
        let mut status = stream.status;
        let buffered = std::mem::take(&mut stream.buffer);
        let mut data = if buffered.is_empty() {
            data
        } else {
            let mut joined = BytesMut::with_capacity(buffered.len() + data.len());
            joined.extend_from_slice(&buffered);
            joined.extend_from_slice(&data);
            joined.freeze()
        };

        loop {
            // a stream error in a previous iteration may have reset us
            if !self.streams.contains(&r) {
                return Ok(Flow::Continue);
            }

            match status {
                Status::Header => match h3_codec::parse_unidi_stream_header(&mut data) {
                    None => break,
                    Some(kind @ (UnidiKind::Control | UnidiKind::Encoder | UnidiKind::Decoder)) => {
                        self.machine.set_unidi_remote_stream_type(id, kind)?;
                        trace!(stream = %id, ?kind, "unidi stream classified");
                        status = Status::Normal;
                    }
                    Some(UnidiKind::Push) => {
                        //= https://www.rfc-editor.org/rfc/rfc9114#section-6.2.2
                        //# Clients MUST treat receipt of a push stream as a
                        //# connection error of type H3_STREAM_CREATION_ERROR.
                        // Mirrored: a server never accepts one either.
                        return Err(ConnectionError::new(
                            Code::H3_STREAM_CREATION_ERROR,
                            "client-initiated push stream",
                        ));
                    }
                    Some(UnidiKind::Unknown(ty)) => {
                        debug!(stream = %id, ty, "aborting unknown unidi stream");
                        self.transport.shutdown_stream(
                            &r,
                            ShutdownHalf::Receive,
                            Code::H3_STREAM_CREATION_ERROR.value(),
                        );
                        status = Status::Discard;
                    }
                },
                Status::Data { remaining } => {
                    if (data.len() as u64) < remaining {
                        if fin {
                            return Err(ConnectionError::new(
                                Code::H3_FRAME_ERROR,
                                "data frame truncated by end of stream",
                            ));
                        }
                        let chunk = std::mem::take(&mut data);
                        status = Status::Data {
                            remaining: remaining - chunk.len() as u64,
                        };
                        if !chunk.is_empty() {
                            self.machine_data(&r, id, chunk, false)?;
                        }
                        break;
                    }
                    let chunk = data.split_to(remaining as usize);
                    let chunk_fin = fin && data.is_empty();
                    status = Status::Normal;
                    self.machine_data(&r, id, chunk, chunk_fin)?;
                }
                Status::Normal => {
                    // QPACK side channels carry instructions, not frames.
                    if matches!(
                        self.machine.unidi_stream_kind(id),
                        Some(UnidiKind::Encoder | UnidiKind::Decoder)
                    ) {
                        self.machine.unidi_data(id, &data, fin)?;
                        data = Bytes::new();
                        break;
                    }

                    if data.is_empty() {
                        if fin {
                            self.stream_fin(&r, id)?;
                        }
                        break;
                    }

                    match h3_codec::parse(&mut data) {
                        Ok(Parsed::Frame(Frame::Data { len })) => {
                            self.machine_frame(&r, id, Frame::Data { len }, false)?;
                            status = Status::Data { remaining: len };
                        }
                        Ok(Parsed::Frame(frame)) => {
                            let frame_fin = fin && data.is_empty();
                            if let Flow::Shutdown = self.machine_frame(&r, id, frame, frame_fin)? {
                                return Ok(Flow::Shutdown);
                            }
                        }
                        Ok(Parsed::Ignored(_)) => self.machine.ignored_frame(id),
                        Ok(Parsed::More(_)) => {
                            //= https://www.rfc-editor.org/rfc/rfc9114#section-7.1
                            //# A frame sequence that terminates before the end
                            //# of a frame MUST be treated as a connection
                            //# error of type H3_FRAME_ERROR.
                            if fin {
                                return Err(ConnectionError::new(
                                    Code::H3_FRAME_ERROR,
                                    "frame truncated by end of stream",
                                ));
                            }
                            break;
                        }
                        Err(e) => {
                            return Err(ConnectionError::new(
                                h3_codec::error_to_code(&e),
                                e.to_string(),
                            ))
                        }
                    }
                }
                Status::Discard => {
                    data = Bytes::new();
                    break;
                }
            }
        }

        if let Some(stream) = self.streams.get_mut(&r) {
            stream.status = status;
            stream.buffer = data;
        }
        Ok(Flow::Continue)
    }

    /// The stream finished cleanly on a frame boundary.
    fn stream_fin(&mut self, r: &T::StreamRef, id: StreamId) -> Result<(), ConnectionError> {
        if self.machine.unidi_stream_kind(id) == Some(UnidiKind::Control) {
            return Err(ConnectionError::new(
                Code::H3_CLOSED_CRITICAL_STREAM,
                "control stream closed",
            ));
        }
        match self.machine.get_stream_remote_state(id) {
            // the request body ends here
            Some(StreamState::Nofin) => {
                self.machine_data(r, id, Bytes::new(), true)?;
            }
            //= https://www.rfc-editor.org/rfc/rfc9114#section-4.1
            //# If a client-initiated stream terminates without enough of the
            //# HTTP message to provide a complete request, the server SHOULD
            //# abort its response stream with the error code
            //# H3_REQUEST_INCOMPLETE.
            Some(StreamState::Idle) => self.reset_stream(
                r,
                StreamError {
                    code: Code::H3_REQUEST_INCOMPLETE,
                    reason: "stream ended before request headers".into(),
                },
            ),
            _ => (),
        }
        Ok(())
    }

    fn machine_frame(
        &mut self,
        r: &T::StreamRef,
        id: StreamId,
        frame: Frame,
        fin: bool,
    ) -> Result<Flow, ConnectionError> {
        match self.machine.frame(id, frame, fin) {
            Ok(outcome) => self.outcome(r, id, outcome),
            Err(MachineError::Stream(e)) => {
                self.reset_stream(r, e);
                Ok(Flow::Continue)
            }
            Err(MachineError::Connection(e)) => Err(e),
        }
    }

    fn machine_data(
        &mut self,
        r: &T::StreamRef,
        id: StreamId,
        chunk: Bytes,
        fin: bool,
    ) -> Result<Flow, ConnectionError> {
        match self.machine.data(id, chunk, fin) {
            Ok(outcome) => self.outcome(r, id, outcome),
            Err(MachineError::Stream(e)) => {
                self.reset_stream(r, e);
                Ok(Flow::Continue)
            }
            Err(MachineError::Connection(e)) => Err(e),
        }
    }

    fn outcome(
        &mut self,
        r: &T::StreamRef,
        id: StreamId,
        outcome: FrameOutcome,
    ) -> Result<Flow, ConnectionError> {
        match outcome {
            FrameOutcome::Nothing => Ok(Flow::Continue),
            FrameOutcome::GoAway(last_id) => {
                // No draining; any goaway takes the connection down now.
                info!(last_id, "goaway received, shutting down");
                Ok(Flow::Shutdown)
            }
            FrameOutcome::Trailers(_) => {
                // Request trailers are not forwarded to handlers yet.
                trace!(stream = %id, "dropping request trailers");
                Ok(Flow::Continue)
            }
            FrameOutcome::Data { chunk, fin } => {
                self.handler_data(r, id, chunk, fin);
                Ok(Flow::Continue)
            }
            FrameOutcome::Headers(headers) => {
                if !headers.instructions.is_empty() {
                    let encoder = self.encoder.clone();
                    self.write(&encoder, headers.instructions.clone(), SendFlag::None);
                }
                let request = match request::build(
                    id,
                    self.handle.clone(),
                    self.peer,
                    self.local,
                    headers,
                ) {
                    Ok(request) => request,
                    Err(e) => {
                        self.reset_stream(r, e);
                        return Ok(Flow::Continue);
                    }
                };
                match self.handler.init(id, request) {
                    Ok((commands, state)) => {
                        if let Some(stream) = self.streams.get_mut(r) {
                            stream.state = Some(state);
                        }
                        self.commands(r, id, commands);
                    }
                    Err(e) => self.handler_failure(r, id, "init", &e),
                }
                Ok(Flow::Continue)
            }
        }
    }

    fn handler_data(&mut self, r: &T::StreamRef, id: StreamId, chunk: Bytes, fin: bool) {
        let Some(stream) = self.streams.get_mut(r) else {
            return;
        };
        let Some(mut state) = stream.state.take() else {
            warn!(stream = %id, "body data with no handler state");
            return;
        };

        let result = self.handler.data(id, fin, chunk, &mut state);
        if let Some(stream) = self.streams.get_mut(r) {
            stream.state = Some(state);
        }
        match result {
            Ok(commands) => self.commands(r, id, commands),
            Err(e) => self.handler_failure(r, id, "data", &e),
        }
    }

    /// Arbitrary messages addressed to a stream's handler.
    fn stream_message(&mut self, id: StreamId, message: InfoMessage) {
        let Some(r) = self.streams.ref_of(id).cloned() else {
            if self.streams.is_lingering_id(id) {
                trace!(stream = %id, "dropping message for lingering stream");
            } else {
                warn!(stream = %id, "message for unknown stream");
            }
            return;
        };

        let Some(stream) = self.streams.get_mut(&r) else {
            return;
        };
        let Some(mut state) = stream.state.take() else {
            warn!(stream = %id, "message before handler init");
            return;
        };

        let result = self.handler.info(id, message, &mut state);
        if let Some(stream) = self.streams.get_mut(&r) {
            stream.state = Some(state);
        }
        match result {
            Ok(commands) => self.commands(&r, id, commands),
            Err(e) => self.handler_failure(&r, id, "info", &e),
        }
    }

    fn child_down(&mut self, child: ChildId, reason: ExitReason) {
        match self.children.down(child) {
            Down::Known(Some(id)) => {
                trace!(child = %child, stream = %id, ?reason, "child exited");
                self.stream_message(id, InfoMessage::ChildExit { child, reason });
            }
            Down::Known(None) => (),
            Down::Unknown => warn!(child = %child, "unknown child exited"),
        }
    }

    /// Executes handler commands in order on the owning stream.
    fn commands(&mut self, r: &T::StreamRef, id: StreamId, commands: Vec<Command>) {
        for command in commands {
            // an earlier Stop may have ended the stream
            if !self.streams.contains(r) {
                break;
            }
            match command {
                Command::Inform { status, headers } => {
                    debug_assert!(status.is_informational());
                    self.send_headers(r, id, status, &headers, false);
                }
                Command::Response {
                    status,
                    headers,
                    body,
                } => self.send_response(r, id, status, headers, body),
                Command::ErrorResponse {
                    status,
                    headers,
                    body,
                } => {
                    if self.machine.get_stream_local_state(id) == Some(StreamState::Idle) {
                        self.send_response(r, id, status, headers, body);
                    }
                }
                Command::Headers { status, headers } => {
                    self.send_headers(r, id, status, &headers, false)
                }
                Command::Data { fin, body } => self.send_data(r, id, fin, body),
                Command::Trailers(trailers) => self.send_trailers(r, id, trailers),
                Command::Flow(n) => {
                    // TODO: grow the QUIC receive window by n
                    trace!(stream = %id, n, "flow command ignored");
                }
                Command::Spawn { child, shutdown } => self.children.up(id, child, shutdown),
                Command::SetOptions(_) => (),
                Command::Log { level, message } => {
                    if level == tracing::Level::ERROR {
                        error!(stream = %id, "{}", message);
                    } else if level == tracing::Level::WARN {
                        warn!(stream = %id, "{}", message);
                    } else if level == tracing::Level::INFO {
                        info!(stream = %id, "{}", message);
                    } else if level == tracing::Level::DEBUG {
                        debug!(stream = %id, "{}", message);
                    } else {
                        trace!(stream = %id, "{}", message);
                    }
                }
                Command::Stop => self.stop_stream(r, id),
                Command::Push => warn!(stream = %id, "push is not implemented"),
            }
        }
    }

    fn send_headers(
        &mut self,
        r: &T::StreamRef,
        id: StreamId,
        status: StatusCode,
        headers: &HeaderMap,
        fin: bool,
    ) {
        let (fin, block, instructions) = self.machine.prepare_headers(id, status, headers, fin);
        // Encoder side-data must reach the peer no later than the headers
        // that depend on it.
        if !instructions.is_empty() {
            let encoder = self.encoder.clone();
            self.write(&encoder, instructions, SendFlag::None);
        }
        let mut buf = BytesMut::new();
        Frame::Headers(block).encode(&mut buf);
        self.write(r, buf.freeze(), send_flag(fin));
    }

    fn send_response(
        &mut self,
        r: &T::StreamRef,
        id: StreamId,
        status: StatusCode,
        headers: HeaderMap,
        body: Body,
    ) {
        if body.is_empty() {
            self.send_headers(r, id, status, &headers, true);
            return;
        }
        match body {
            Body::Bytes(bytes) => {
                // Headers and body go out in a single transport write.
                let (_, block, instructions) =
                    self.machine.prepare_headers(id, status, &headers, false);
                if !instructions.is_empty() {
                    let encoder = self.encoder.clone();
                    self.write(&encoder, instructions, SendFlag::None);
                }
                let mut buf = BytesMut::new();
                Frame::Headers(block).encode(&mut buf);
                Frame::Data {
                    len: bytes.len() as u64,
                }
                .encode(&mut buf);
                buf.extend_from_slice(&bytes);
                self.write(r, buf.freeze(), SendFlag::Fin);
                self.machine.close_bidi_stream_for_sending(id);
            }
            body @ Body::Sendfile { .. } => {
                self.send_headers(r, id, status, &headers, false);
                self.send_data(r, id, true, body);
            }
        }
    }

    fn send_data(&mut self, r: &T::StreamRef, id: StreamId, fin: bool, body: Body) {
        match body {
            Body::Bytes(bytes) => {
                let mut buf = BytesMut::new();
                Frame::Data {
                    len: bytes.len() as u64,
                }
                .encode(&mut buf);
                buf.extend_from_slice(&bytes);
                self.write(r, buf.freeze(), send_flag(fin));
            }
            Body::Sendfile { path, offset, len } => {
                let mut buf = BytesMut::new();
                Frame::Data { len }.encode(&mut buf);
                self.write(r, buf.freeze(), SendFlag::None);
                if let Err(e) = self.transport.sendfile(r, &path, offset, len) {
                    error!(error = %e, "sendfile failed");
                }
                if fin {
                    // the FIN rides on an empty terminating frame
                    let mut buf = BytesMut::new();
                    Frame::Data { len: 0 }.encode(&mut buf);
                    self.write(r, buf.freeze(), SendFlag::Fin);
                }
            }
        }
        if fin {
            self.machine.close_bidi_stream_for_sending(id);
        }
    }

    fn send_trailers(&mut self, r: &T::StreamRef, id: StreamId, trailers: HeaderMap) {
        match self.machine.prepare_trailers(id, &trailers) {
            PreparedTrailers::Trailers {
                block,
                instructions,
            } => {
                if !instructions.is_empty() {
                    let encoder = self.encoder.clone();
                    self.write(&encoder, instructions, SendFlag::None);
                }
                let mut buf = BytesMut::new();
                Frame::Headers(block).encode(&mut buf);
                self.write(r, buf.freeze(), SendFlag::Fin);
            }
            PreparedTrailers::None => {
                let mut buf = BytesMut::new();
                Frame::Data { len: 0 }.encode(&mut buf);
                self.write(r, buf.freeze(), SendFlag::Fin);
            }
        }
    }

    /// The handler is done with this stream.
    fn stop_stream(&mut self, r: &T::StreamRef, id: StreamId) {
        // If the peer is still sending, stop it.
        if self.machine.get_stream_remote_state(id) != Some(StreamState::Fin) {
            self.transport
                .shutdown_stream(r, ShutdownHalf::Receive, Code::H3_NO_ERROR.value());
            if let Some(stream) = self.streams.get_mut(r) {
                stream.status = Status::Discard;
            }
        }
        match self.machine.get_stream_local_state(id) {
            // no response was ever sent; answer for the handler
            Some(StreamState::Idle) => {
                self.send_headers(r, id, StatusCode::NO_CONTENT, &HeaderMap::new(), true);
            }
            // complete the open response
            Some(StreamState::Nofin) => {
                let mut buf = BytesMut::new();
                Frame::Data { len: 0 }.encode(&mut buf);
                self.write(r, buf.freeze(), SendFlag::Fin);
                self.machine.close_bidi_stream_for_sending(id);
            }
            _ => (),
        }
        self.terminate_stream(r, Reason::Normal);
    }

    /// Aborts both halves of the stream with an error code.
    fn reset_stream(&mut self, r: &T::StreamRef, error: StreamError) {
        debug!(code = %error.code, reason = %error.reason, "resetting stream");
        self.abort_stream(r, error.code, Reason::Reset(error.code));
    }

    /// A handler callback failed: log it and reset the stream.
    fn handler_failure(
        &mut self,
        r: &T::StreamRef,
        id: StreamId,
        op: &'static str,
        error: &HandlerError,
    ) {
        self.handler.on_error(id, op, error);
        self.abort_stream(r, Code::H3_INTERNAL_ERROR, Reason::Internal);
    }

    fn abort_stream(&mut self, r: &T::StreamRef, code: Code, reason: Reason) {
        self.transport
            .shutdown_stream(r, ShutdownHalf::Both, code.value());
        if let Some(stream) = self.streams.get_mut(r) {
            let id = stream.id;
            self.machine.reset_stream(id);
            self.terminate_stream(r, reason);
        }
    }

    fn terminate_stream(&mut self, r: &T::StreamRef, reason: Reason) {
        let Some(stream) = self.streams.remove(r) else {
            return;
        };
        if let Some(state) = stream.state {
            self.handler.terminate(stream.id, &reason, state);
        }
        self.children.shutdown(stream.id);
        self.streams.linger(r.clone(), stream.id);
    }

    fn terminate_connection(&mut self, code: Code, reason: Reason) {
        for (_, stream) in self.streams.drain() {
            if let Some(state) = stream.state {
                self.handler.terminate(stream.id, &reason, state);
            }
        }
        self.children.shutdown_all();
        self.transport.shutdown_connection(code.value());
    }

    fn write(&mut self, r: &T::StreamRef, data: Bytes, flag: SendFlag) {
        // Writes are buffered by the transport; a failure means the stream or
        // connection is already going away.
        if let Err(e) = self.transport.send(r, data, flag) {
            error!(error = %e, "transport send failed");
        }
    }
}

fn send_flag(fin: bool) -> SendFlag {
    if fin {
        SendFlag::Fin
    } else {
        SendFlag::None
    }
}
