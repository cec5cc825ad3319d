//! HTTP/3 per-connection protocol state machine.
//!
//! [`Machine`] tracks the protocol-level state of every stream on one
//! connection: which unidirectional streams carry the control and QPACK
//! channels, where each request stream stands in its HEADERS/DATA/trailers
//! sequence, and the local and remote send states the response path keys off.
//!
//! The machine never performs I/O. Frames go in, outcomes come out, and any
//! QPACK side-channel bytes are surfaced in return values so the caller can
//! order the writes onto the encoder and decoder streams deterministically.

mod headers;
pub mod qpack;

use std::collections::HashMap;
use std::fmt;

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode};
use tracing::{trace, warn};

use h3_codec::{Code, Encode, Frame, SettingId, Settings, UnidiKind};

pub use headers::Pseudo;
pub use qpack::Field;

/// Connection-scoped stream identifier assigned by the connection task.
///
/// Stream handles provided by the transport are opaque and must not outlive
/// the stream; this counter-assigned id is the value handed to everything
/// else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(u64);

impl StreamId {
    pub const fn new(id: u64) -> Self {
        StreamId(id)
    }

    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Protocol configuration.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Largest field section we are willing to receive.
    pub max_field_section_size: u64,
    /// Include a reserved-identifier entry in our SETTINGS.
    pub send_grease: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_field_section_size: h3_codec::VarInt::MAX.0,
            send_grease: true,
        }
    }
}

/// Terminates a single stream; the connection continues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamError {
    pub code: Code,
    pub reason: String,
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream error {}: {}", self.code, self.reason)
    }
}

impl std::error::Error for StreamError {}

/// Terminates the whole connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionError {
    pub code: Code,
    pub reason: String,
}

impl ConnectionError {
    pub fn new(code: Code, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connection error {}: {}", self.code, self.reason)
    }
}

impl std::error::Error for ConnectionError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineError {
    Stream(StreamError),
    Connection(ConnectionError),
}

impl From<StreamError> for MachineError {
    fn from(e: StreamError) -> Self {
        MachineError::Stream(e)
    }
}

impl From<ConnectionError> for MachineError {
    fn from(e: ConnectionError) -> Self {
        MachineError::Connection(e)
    }
}

/// Send state of one half of a request stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Nofin,
    Fin,
}

/// A fully decoded and validated request HEADERS frame.
#[derive(Debug)]
pub struct RequestHeaders {
    pub fin: bool,
    pub pseudo: Pseudo,
    pub fields: Vec<Field>,
    pub body_len: Option<u64>,
    /// Bytes to flush on the local encoder stream before acting on the
    /// headers. Empty with the static-only codec, but callers must preserve
    /// the ordering regardless.
    pub instructions: Bytes,
}

/// What a frame meant, once the machine has accounted for it.
#[derive(Debug)]
pub enum FrameOutcome {
    Nothing,
    Data { chunk: Bytes, fin: bool },
    Headers(RequestHeaders),
    Trailers(Vec<Field>),
    GoAway(u64),
}

/// Result of [`Machine::prepare_trailers`].
#[derive(Debug)]
pub enum PreparedTrailers {
    /// Send this block as a HEADERS frame with FIN.
    Trailers { block: Bytes, instructions: Bytes },
    /// Nothing to send; finish the stream with an empty DATA frame.
    None,
}

#[derive(Debug, Clone, Copy)]
struct PeerSettings {
    max_field_section_size: u64,
    qpack_max_table_capacity: u64,
    qpack_blocked_streams: u64,
}

#[derive(Debug)]
struct BidiState {
    remote: StreamState,
    local: StreamState,
    trailers_received: bool,
    body_len: Option<u64>,
    body_received: u64,
}

impl BidiState {
    fn new() -> Self {
        Self {
            remote: StreamState::Idle,
            local: StreamState::Idle,
            trailers_received: false,
            body_len: None,
            body_received: 0,
        }
    }
}

pub struct Machine {
    role: Role,
    config: Config,
    streams: HashMap<StreamId, BidiState>,
    local_control: Option<StreamId>,
    local_encoder: Option<StreamId>,
    local_decoder: Option<StreamId>,
    remote_unidi: HashMap<StreamId, Option<UnidiKind>>,
    remote_control: Option<StreamId>,
    remote_encoder: Option<StreamId>,
    remote_decoder: Option<StreamId>,
    peer_settings: Option<PeerSettings>,
    encoder_buf: BytesMut,
    decoder_buf: BytesMut,
    ignored_frames: u64,
}

impl Machine {
    /// Initializes the machine and returns the SETTINGS frame to send on the
    /// local control stream.
    pub fn new(role: Role, config: Config) -> (Bytes, Self) {
        let mut settings = Settings::default();
        if config.send_grease {
            //= https://www.rfc-editor.org/rfc/rfc9114#section-7.2.4.1
            //# Endpoints SHOULD include at least one such setting in their
            //# SETTINGS frame.
            settings
                .insert(SettingId::grease(), 0)
                .expect("grease setting");
        }
        settings
            .insert(SettingId::QPACK_MAX_TABLE_CAPACITY, 0)
            .expect("table capacity setting");
        settings
            .insert(SettingId::QPACK_BLOCKED_STREAMS, 0)
            .expect("blocked streams setting");
        settings
            .insert(
                SettingId::MAX_FIELD_SECTION_SIZE,
                config.max_field_section_size,
            )
            .expect("field section setting");

        let mut buf = BytesMut::new();
        Frame::Settings(settings).encode(&mut buf);

        (
            buf.freeze(),
            Self {
                role,
                config,
                streams: HashMap::new(),
                local_control: None,
                local_encoder: None,
                local_decoder: None,
                remote_unidi: HashMap::new(),
                remote_control: None,
                remote_encoder: None,
                remote_decoder: None,
                peer_settings: None,
                encoder_buf: BytesMut::new(),
                decoder_buf: BytesMut::new(),
                ignored_frames: 0,
            },
        )
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Records the local control/encoder/decoder stream trio.
    pub fn init_unidi_local_streams(&mut self, control: StreamId, encoder: StreamId, decoder: StreamId) {
        self.local_control = Some(control);
        self.local_encoder = Some(encoder);
        self.local_decoder = Some(decoder);
    }

    /// Registers a peer-opened unidirectional stream, type not yet known.
    pub fn init_unidi_stream(&mut self, id: StreamId) {
        self.remote_unidi.insert(id, None);
    }

    /// Registers a peer-opened bidirectional stream.
    pub fn init_bidi_stream(&mut self, id: StreamId) {
        self.streams.insert(id, BidiState::new());
    }

    /// Resolves the type of a previously registered unidirectional stream.
    pub fn set_unidi_remote_stream_type(
        &mut self,
        id: StreamId,
        kind: UnidiKind,
    ) -> Result<(), ConnectionError> {
        let slot = match kind {
            UnidiKind::Control => &mut self.remote_control,
            UnidiKind::Encoder => &mut self.remote_encoder,
            UnidiKind::Decoder => &mut self.remote_decoder,
            UnidiKind::Push | UnidiKind::Unknown(_) => {
                return Err(ConnectionError::new(
                    Code::H3_STREAM_CREATION_ERROR,
                    format!("cannot register {:?} stream", kind),
                ))
            }
        };

        //= https://www.rfc-editor.org/rfc/rfc9114#section-6.2.1
        //# Receipt of a second stream claiming to be a control stream MUST be
        //# treated as a connection error of type H3_STREAM_CREATION_ERROR.
        if slot.is_some() {
            return Err(ConnectionError::new(
                Code::H3_STREAM_CREATION_ERROR,
                format!("duplicate {:?} stream", kind),
            ));
        }
        *slot = Some(id);
        self.remote_unidi.insert(id, Some(kind));
        Ok(())
    }

    /// The resolved type of a remote unidirectional stream, if any.
    pub fn unidi_stream_kind(&self, id: StreamId) -> Option<UnidiKind> {
        self.remote_unidi.get(&id).copied().flatten()
    }

    /// Accounts for a complete non-DATA frame (or a DATA frame header).
    pub fn frame(
        &mut self,
        id: StreamId,
        frame: Frame,
        fin: bool,
    ) -> Result<FrameOutcome, MachineError> {
        if [self.local_control, self.local_encoder, self.local_decoder].contains(&Some(id)) {
            return Err(ConnectionError::new(
                Code::H3_INTERNAL_ERROR,
                "frame on a local unidirectional stream",
            )
            .into());
        }
        if self.remote_control == Some(id) {
            return self.control_frame(frame, fin).map_err(Into::into);
        }
        self.request_frame(id, frame, fin)
    }

    fn control_frame(&mut self, frame: Frame, fin: bool) -> Result<FrameOutcome, ConnectionError> {
        //= https://www.rfc-editor.org/rfc/rfc9114#section-6.2.1
        //# If either control stream is closed at any point, this MUST be
        //# treated as a connection error of type H3_CLOSED_CRITICAL_STREAM.
        if fin {
            return Err(ConnectionError::new(
                Code::H3_CLOSED_CRITICAL_STREAM,
                "control stream closed",
            ));
        }

        if self.peer_settings.is_none() {
            return match frame {
                Frame::Settings(settings) => {
                    let peer = PeerSettings {
                        max_field_section_size: settings
                            .get(SettingId::MAX_FIELD_SECTION_SIZE)
                            .unwrap_or(h3_codec::VarInt::MAX.0),
                        qpack_max_table_capacity: settings
                            .get(SettingId::QPACK_MAX_TABLE_CAPACITY)
                            .unwrap_or(0),
                        qpack_blocked_streams: settings
                            .get(SettingId::QPACK_BLOCKED_STREAMS)
                            .unwrap_or(0),
                    };
                    trace!(
                        max_field_section_size = peer.max_field_section_size,
                        qpack_max_table_capacity = peer.qpack_max_table_capacity,
                        qpack_blocked_streams = peer.qpack_blocked_streams,
                        "peer settings received"
                    );
                    self.peer_settings = Some(peer);
                    Ok(FrameOutcome::Nothing)
                }
                frame => Err(ConnectionError::new(
                    Code::H3_MISSING_SETTINGS,
                    format!("received {} before settings on control stream", frame),
                )),
            };
        }

        match frame {
            Frame::Settings(_) => Err(ConnectionError::new(
                Code::H3_FRAME_UNEXPECTED,
                "second settings frame on control stream",
            )),
            Frame::Goaway(last_id) => Ok(FrameOutcome::GoAway(last_id)),
            frame @ (Frame::CancelPush(_) | Frame::MaxPushId(_)) => {
                warn!("control frame ignored: {}", frame);
                Ok(FrameOutcome::Nothing)
            }
            frame => Err(ConnectionError::new(
                Code::H3_FRAME_UNEXPECTED,
                format!("{} on control stream", frame),
            )),
        }
    }

    fn request_frame(
        &mut self,
        id: StreamId,
        frame: Frame,
        fin: bool,
    ) -> Result<FrameOutcome, MachineError> {
        match frame {
            Frame::Headers(block) => self.request_headers(id, block, fin),
            Frame::Data { .. } => {
                // Header only; the body arrives through `data`.
                let state = self.bidi(id)?;
                if state.remote == StreamState::Idle || state.trailers_received {
                    return Err(self.frame_unexpected("data frame out of sequence"));
                }
                Ok(FrameOutcome::Nothing)
            }
            Frame::PushPromise(_) => {
                // Tolerated on request streams; nothing is ever promised back.
                self.ignored_frame(id);
                Ok(FrameOutcome::Nothing)
            }
            frame => Err(self.frame_unexpected(format!("{} on request stream", frame))),
        }
    }

    fn request_headers(
        &mut self,
        id: StreamId,
        block: Bytes,
        fin: bool,
    ) -> Result<FrameOutcome, MachineError> {
        let max_size = self.config.max_field_section_size;
        let state = self.bidi(id)?;
        if state.trailers_received {
            return Err(self.frame_unexpected("headers after trailers"));
        }

        //= https://www.rfc-editor.org/rfc/rfc9204#section-2.2.3
        //# When the decoder fails to interpret an encoded field section, it
        //# MUST treat this as a connection error of type
        //# QPACK_DECOMPRESSION_FAILED.
        let (fields, size) = qpack::decode_field_section(block).map_err(|e| {
            ConnectionError::new(qpack::error_to_code(&e), e.to_string())
        })?;

        if size > max_size {
            return Err(StreamError {
                code: Code::H3_EXCESSIVE_LOAD,
                reason: format!("field section of {} bytes exceeds limit", size),
            }
            .into());
        }

        let state = self.bidi(id)?;
        if state.remote == StreamState::Idle {
            let (pseudo, fields, body_len) = headers::parse_request(fields)?;
            if fin {
                if matches!(body_len, Some(n) if n != 0) {
                    return Err(StreamError {
                        code: Code::H3_MESSAGE_ERROR,
                        reason: "content-length with no body".into(),
                    }
                    .into());
                }
            }
            let state = self.bidi(id)?;
            state.remote = if fin { StreamState::Fin } else { StreamState::Nofin };
            state.body_len = body_len;
            Ok(FrameOutcome::Headers(RequestHeaders {
                fin,
                pseudo,
                fields,
                body_len,
                instructions: Bytes::new(),
            }))
        } else {
            let fields = headers::parse_trailers(fields)?;
            let state = self.bidi(id)?;
            state.trailers_received = true;
            if fin {
                state.remote = StreamState::Fin;
            }
            Ok(FrameOutcome::Trailers(fields))
        }
    }

    /// Accounts for a chunk of a DATA frame body.
    pub fn data(
        &mut self,
        id: StreamId,
        chunk: Bytes,
        fin: bool,
    ) -> Result<FrameOutcome, MachineError> {
        let (remote, trailers_received) = {
            let state = self.bidi(id)?;
            (state.remote, state.trailers_received)
        };
        if trailers_received {
            // only the end of the stream may follow trailers
            if chunk.is_empty() && fin {
                self.bidi(id)?.remote = StreamState::Fin;
                return Ok(FrameOutcome::Nothing);
            }
            return Err(self.frame_unexpected("data frame after trailers"));
        }
        if remote == StreamState::Idle {
            return Err(self.frame_unexpected("data frame out of sequence"));
        }

        let state = self.bidi(id)?;
        state.body_received += chunk.len() as u64;
        if let Some(expected) = state.body_len {
            //= https://www.rfc-editor.org/rfc/rfc9114#section-4.1.2
            //# A request or response that is defined as having content when it
            //# contains a Content-Length header field MUST be treated as
            //# malformed if the value of the Content-Length header field does
            //# not equal the sum of the DATA frame lengths received.
            if state.body_received > expected || (fin && state.body_received != expected) {
                return Err(StreamError {
                    code: Code::H3_MESSAGE_ERROR,
                    reason: "body does not match content-length".into(),
                }
                .into());
            }
        }
        if fin {
            state.remote = StreamState::Fin;
        }
        Ok(FrameOutcome::Data { chunk, fin })
    }

    /// Feeds bytes from a peer QPACK unidirectional stream.
    pub fn unidi_data(
        &mut self,
        id: StreamId,
        data: &[u8],
        fin: bool,
    ) -> Result<(), ConnectionError> {
        if fin {
            return Err(ConnectionError::new(
                Code::H3_CLOSED_CRITICAL_STREAM,
                "qpack stream closed",
            ));
        }

        let kind = self.unidi_stream_kind(id);
        let (buf, decode): (_, fn(&mut BytesMut) -> Result<(), qpack::Error>) = match kind {
            Some(UnidiKind::Encoder) => (&mut self.encoder_buf, qpack::decode_encoder_instructions),
            Some(UnidiKind::Decoder) => (&mut self.decoder_buf, qpack::decode_decoder_instructions),
            _ => {
                return Err(ConnectionError::new(
                    Code::H3_INTERNAL_ERROR,
                    "unidi data on non-qpack stream",
                ))
            }
        };

        buf.extend_from_slice(data);
        decode(buf).map_err(|e| ConnectionError::new(qpack::error_to_code(&e), e.to_string()))
    }

    /// Encodes response headers and moves the local send state.
    ///
    /// Informational statuses leave the stream idle so the final response can
    /// still follow.
    pub fn prepare_headers(
        &mut self,
        id: StreamId,
        status: StatusCode,
        headers: &HeaderMap,
        fin: bool,
    ) -> (bool, Bytes, Bytes) {
        let status_str = status.as_str().to_owned();
        let fields = std::iter::once((&b":status"[..], status_str.as_bytes()))
            .chain(headers.iter().map(|(n, v)| (n.as_str().as_bytes(), v.as_bytes())));
        let block = qpack::encode_field_section(fields);

        //= https://www.rfc-editor.org/rfc/rfc9114#section-4.2.2
        //# An implementation that has received this parameter SHOULD NOT send
        //# an HTTP message header that exceeds the indicated size.
        if let Some(peer) = &self.peer_settings {
            if block.len() as u64 > peer.max_field_section_size {
                warn!(
                    stream = %id,
                    size = block.len(),
                    limit = peer.max_field_section_size,
                    "header block exceeds the peer's field section limit"
                );
            }
        }

        if !status.is_informational() {
            if let Some(state) = self.streams.get_mut(&id) {
                state.local = if fin { StreamState::Fin } else { StreamState::Nofin };
            }
        }

        (fin, block, Bytes::new())
    }

    /// Encodes trailers, if there is anything to send.
    pub fn prepare_trailers(&mut self, id: StreamId, trailers: &HeaderMap) -> PreparedTrailers {
        if let Some(state) = self.streams.get_mut(&id) {
            state.local = StreamState::Fin;
        }
        if trailers.is_empty() {
            return PreparedTrailers::None;
        }

        let block = qpack::encode_field_section(
            trailers.iter().map(|(n, v)| (n.as_str().as_bytes(), v.as_bytes())),
        );
        PreparedTrailers::Trailers {
            block,
            instructions: Bytes::new(),
        }
    }

    /// Marks the local half finished.
    pub fn close_bidi_stream_for_sending(&mut self, id: StreamId) {
        if let Some(state) = self.streams.get_mut(&id) {
            state.local = StreamState::Fin;
        }
    }

    /// Forgets a stream that closed normally.
    pub fn close_stream(&mut self, id: StreamId) -> Result<(), ConnectionError> {
        if let Some(Some(kind)) = self.remote_unidi.remove(&id) {
            //= https://www.rfc-editor.org/rfc/rfc9114#section-6.2.1
            //# If either control stream is closed at any point, this MUST be
            //# treated as a connection error of type H3_CLOSED_CRITICAL_STREAM.
            return Err(ConnectionError::new(
                Code::H3_CLOSED_CRITICAL_STREAM,
                format!("{:?} stream closed", kind),
            ));
        }
        self.streams.remove(&id);
        Ok(())
    }

    /// Forgets a stream that was reset.
    pub fn reset_stream(&mut self, id: StreamId) {
        self.streams.remove(&id);
        self.remote_unidi.remove(&id);
    }

    /// Bookkeeping for frames that were skipped without being acted on.
    pub fn ignored_frame(&mut self, id: StreamId) {
        self.ignored_frames += 1;
        trace!(stream = %id, total = self.ignored_frames, "ignored frame");
    }

    pub fn get_stream_local_state(&self, id: StreamId) -> Option<StreamState> {
        self.streams.get(&id).map(|s| s.local)
    }

    pub fn get_stream_remote_state(&self, id: StreamId) -> Option<StreamState> {
        self.streams.get(&id).map(|s| s.remote)
    }

    fn bidi(&mut self, id: StreamId) -> Result<&mut BidiState, MachineError> {
        if self.streams.contains_key(&id) {
            return Ok(self.streams.get_mut(&id).expect("stream present"));
        }
        Err(ConnectionError::new(
            Code::H3_INTERNAL_ERROR,
            format!("frame on unknown stream {}", id),
        )
        .into())
    }

    fn frame_unexpected(&self, reason: impl Into<String>) -> MachineError {
        //= https://www.rfc-editor.org/rfc/rfc9114#section-4.1
        //# Receipt of an invalid sequence of frames MUST be treated as a
        //# connection error of type H3_FRAME_UNEXPECTED.
        ConnectionError::new(Code::H3_FRAME_UNEXPECTED, reason).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const CONTROL: StreamId = StreamId::new(100);
    const REQUEST: StreamId = StreamId::new(0);

    fn server() -> Machine {
        let (_, machine) = Machine::new(Role::Server, Config::default());
        machine
    }

    fn server_with_control() -> Machine {
        let mut machine = server();
        machine.init_unidi_stream(CONTROL);
        machine
            .set_unidi_remote_stream_type(CONTROL, UnidiKind::Control)
            .unwrap();
        machine
            .frame(CONTROL, Frame::Settings(Settings::default()), false)
            .unwrap();
        machine
    }

    fn request_headers_block(extra: &[(&str, &str)]) -> Bytes {
        let base = [
            (":method", "GET"),
            (":scheme", "https"),
            (":authority", "example.com"),
            (":path", "/"),
        ];
        qpack::encode_field_section(
            base.iter()
                .chain(extra.iter())
                .map(|(n, v)| (n.as_bytes(), v.as_bytes())),
        )
    }

    #[test]
    fn settings_frame_emitted_on_init() {
        let (settings, _) = Machine::new(Role::Server, Config::default());
        let mut buf = settings;
        match h3_codec::parse(&mut buf).unwrap() {
            h3_codec::Parsed::Frame(Frame::Settings(s)) => {
                assert_eq!(s.get(SettingId::QPACK_MAX_TABLE_CAPACITY), Some(0));
                assert_eq!(s.get(SettingId::QPACK_BLOCKED_STREAMS), Some(0));
            }
            other => panic!("expected settings, got {:?}", other),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn settings_must_come_first() {
        let mut machine = server();
        machine.init_unidi_stream(CONTROL);
        machine
            .set_unidi_remote_stream_type(CONTROL, UnidiKind::Control)
            .unwrap();
        let err = machine
            .frame(CONTROL, Frame::Goaway(0), false)
            .unwrap_err();
        assert_matches!(
            err,
            MachineError::Connection(ConnectionError { code, .. })
                if code == Code::H3_MISSING_SETTINGS
        );
    }

    #[test]
    fn second_settings_rejected() {
        let mut machine = server_with_control();
        let err = machine
            .frame(CONTROL, Frame::Settings(Settings::default()), false)
            .unwrap_err();
        assert_matches!(
            err,
            MachineError::Connection(ConnectionError { code, .. })
                if code == Code::H3_FRAME_UNEXPECTED
        );
    }

    #[test]
    fn goaway_surfaces() {
        let mut machine = server_with_control();
        assert_matches!(
            machine.frame(CONTROL, Frame::Goaway(4), false),
            Ok(FrameOutcome::GoAway(4))
        );
    }

    #[test]
    fn duplicate_control_stream() {
        let mut machine = server_with_control();
        machine.init_unidi_stream(StreamId::new(101));
        let err = machine
            .set_unidi_remote_stream_type(StreamId::new(101), UnidiKind::Control)
            .unwrap_err();
        assert_eq!(err.code, Code::H3_STREAM_CREATION_ERROR);
    }

    #[test]
    fn control_stream_fin_is_fatal() {
        let mut machine = server_with_control();
        let err = machine
            .frame(CONTROL, Frame::Goaway(0), true)
            .unwrap_err();
        assert_matches!(
            err,
            MachineError::Connection(ConnectionError { code, .. })
                if code == Code::H3_CLOSED_CRITICAL_STREAM
        );
    }

    #[test]
    fn request_flow_headers_then_data() {
        let mut machine = server_with_control();
        machine.init_bidi_stream(REQUEST);

        let block = request_headers_block(&[("content-length", "2")]);
        let outcome = machine
            .frame(REQUEST, Frame::Headers(block), false)
            .unwrap();
        let headers = match outcome {
            FrameOutcome::Headers(h) => h,
            other => panic!("expected headers, got {:?}", other),
        };
        assert!(!headers.fin);
        assert_eq!(headers.pseudo.method, http::Method::GET);
        assert_eq!(headers.body_len, Some(2));
        assert_eq!(machine.get_stream_remote_state(REQUEST), Some(StreamState::Nofin));

        machine
            .frame(REQUEST, Frame::Data { len: 2 }, false)
            .unwrap();
        assert_matches!(
            machine.data(REQUEST, Bytes::from_static(b"hi"), true),
            Ok(FrameOutcome::Data { fin: true, .. })
        );
        assert_eq!(machine.get_stream_remote_state(REQUEST), Some(StreamState::Fin));
    }

    #[test]
    fn data_before_headers_rejected() {
        let mut machine = server_with_control();
        machine.init_bidi_stream(REQUEST);
        let err = machine
            .frame(REQUEST, Frame::Data { len: 1 }, false)
            .unwrap_err();
        assert_matches!(
            err,
            MachineError::Connection(ConnectionError { code, .. })
                if code == Code::H3_FRAME_UNEXPECTED
        );
    }

    #[test]
    fn body_exceeding_content_length() {
        let mut machine = server_with_control();
        machine.init_bidi_stream(REQUEST);
        let block = request_headers_block(&[("content-length", "1")]);
        machine.frame(REQUEST, Frame::Headers(block), false).unwrap();
        machine.frame(REQUEST, Frame::Data { len: 3 }, false).unwrap();
        let err = machine
            .data(REQUEST, Bytes::from_static(b"abc"), true)
            .unwrap_err();
        assert_matches!(
            err,
            MachineError::Stream(StreamError { code, .. })
                if code == Code::H3_MESSAGE_ERROR
        );
    }

    #[test]
    fn malformed_headers_is_stream_error() {
        let mut machine = server_with_control();
        machine.init_bidi_stream(REQUEST);
        let block = qpack::encode_field_section(
            [(&b":method"[..], &b"GET"[..])].into_iter(),
        );
        let err = machine.frame(REQUEST, Frame::Headers(block), true).unwrap_err();
        assert_matches!(
            err,
            MachineError::Stream(StreamError { code, .. })
                if code == Code::H3_MESSAGE_ERROR
        );
    }

    #[test]
    fn oversized_field_section_is_stream_error() {
        let mut machine = server_with_control();
        machine.config.max_field_section_size = 64;
        machine.init_bidi_stream(REQUEST);
        let block = request_headers_block(&[("x-filler", "yyyyyyyyyyyyyyyyyyyyyyyy")]);
        let err = machine.frame(REQUEST, Frame::Headers(block), true).unwrap_err();
        assert_matches!(
            err,
            MachineError::Stream(StreamError { code, .. })
                if code == Code::H3_EXCESSIVE_LOAD
        );
    }

    #[test]
    fn trailers_after_body() {
        let mut machine = server_with_control();
        machine.init_bidi_stream(REQUEST);
        machine
            .frame(REQUEST, Frame::Headers(request_headers_block(&[])), false)
            .unwrap();
        machine.frame(REQUEST, Frame::Data { len: 1 }, false).unwrap();
        machine.data(REQUEST, Bytes::from_static(b"x"), false).unwrap();

        let trailer_block = qpack::encode_field_section(
            [(&b"grpc-status"[..], &b"0"[..])].into_iter(),
        );
        let outcome = machine
            .frame(REQUEST, Frame::Headers(trailer_block), true)
            .unwrap();
        assert_matches!(outcome, FrameOutcome::Trailers(fields) if fields.len() == 1);

        // nothing may follow trailers
        let err = machine
            .frame(REQUEST, Frame::Data { len: 1 }, false)
            .unwrap_err();
        assert_matches!(err, MachineError::Connection(_));
    }

    #[test]
    fn prepare_headers_moves_local_state() {
        let mut machine = server_with_control();
        machine.init_bidi_stream(REQUEST);
        assert_eq!(machine.get_stream_local_state(REQUEST), Some(StreamState::Idle));

        let mut headers = HeaderMap::new();
        headers.insert("server", "h3".parse().unwrap());

        let (fin, block, instructions) =
            machine.prepare_headers(REQUEST, StatusCode::EARLY_HINTS, &headers, false);
        assert!(!fin);
        assert!(!block.is_empty());
        assert!(instructions.is_empty());
        // informational responses leave the stream idle
        assert_eq!(machine.get_stream_local_state(REQUEST), Some(StreamState::Idle));

        machine.prepare_headers(REQUEST, StatusCode::OK, &headers, false);
        assert_eq!(machine.get_stream_local_state(REQUEST), Some(StreamState::Nofin));

        machine.close_bidi_stream_for_sending(REQUEST);
        assert_eq!(machine.get_stream_local_state(REQUEST), Some(StreamState::Fin));
    }

    #[test]
    fn prepared_response_decodes_with_split_cookies() {
        let mut machine = server_with_control();
        machine.init_bidi_stream(REQUEST);

        let mut headers = HeaderMap::new();
        headers.append("set-cookie", "a=1".parse().unwrap());
        headers.append("set-cookie", "b=2".parse().unwrap());

        let (_, block, _) = machine.prepare_headers(REQUEST, StatusCode::OK, &headers, true);
        let (fields, _) = qpack::decode_field_section(block).unwrap();
        let cookies: Vec<_> = fields
            .iter()
            .filter(|f| f.name == &b"set-cookie"[..])
            .collect();
        assert_eq!(cookies.len(), 2);
        assert_eq!(cookies[0].value, &b"a=1"[..]);
        assert_eq!(cookies[1].value, &b"b=2"[..]);
    }

    #[test]
    fn prepare_trailers_empty_map() {
        let mut machine = server_with_control();
        machine.init_bidi_stream(REQUEST);
        assert_matches!(
            machine.prepare_trailers(REQUEST, &HeaderMap::new()),
            PreparedTrailers::None
        );
        assert_eq!(machine.get_stream_local_state(REQUEST), Some(StreamState::Fin));
    }

    #[test]
    fn qpack_stream_tolerates_capacity_zero() {
        let mut machine = server_with_control();
        let enc = StreamId::new(102);
        machine.init_unidi_stream(enc);
        machine
            .set_unidi_remote_stream_type(enc, UnidiKind::Encoder)
            .unwrap();
        assert!(machine.unidi_data(enc, &[0b0010_0000], false).is_ok());

        let err = machine.unidi_data(enc, &[0b1100_0001, 0x01, b'x'], false).unwrap_err();
        assert_eq!(err.code, Code::QPACK_ENCODER_STREAM_ERROR);
    }

    #[test]
    fn closing_critical_stream_is_fatal() {
        let mut machine = server_with_control();
        let err = machine.close_stream(CONTROL).unwrap_err();
        assert_eq!(err.code, Code::H3_CLOSED_CRITICAL_STREAM);

        machine.init_bidi_stream(REQUEST);
        assert!(machine.close_stream(REQUEST).is_ok());
        assert_eq!(machine.get_stream_local_state(REQUEST), None);
    }
}
