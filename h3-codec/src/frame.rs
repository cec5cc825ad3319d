//! HTTP/3 frame parsing and serialization.

use std::fmt;

use bytes::{Buf, BufMut, Bytes};
use tracing::trace;

use crate::coding::Encode;
use crate::codes::Code;
use crate::varint::{BufExt, BufMutExt, UnexpectedEnd, VarInt};

#[derive(Debug, PartialEq)]
pub enum Error {
    Malformed,
    UnsupportedFrame(u64), // Known frames that are not allowed in h3
    InvalidFrameValue,
    Settings(SettingsError),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Malformed => write!(f, "frame is malformed"),
            Error::UnsupportedFrame(c) => write!(f, "frame 0x{:x} is not allowed in h3", c),
            Error::InvalidFrameValue => write!(f, "frame value is invalid"),
            Error::Settings(e) => write!(f, "settings frame: {}", e),
        }
    }
}

/// Maps a parse error to the H3 code the connection must be closed with.
pub fn error_to_code(error: &Error) -> Code {
    match error {
        Error::Malformed | Error::InvalidFrameValue => Code::H3_FRAME_ERROR,
        Error::UnsupportedFrame(_) => Code::H3_FRAME_UNEXPECTED,
        Error::Settings(_) => Code::H3_SETTINGS_ERROR,
    }
}

#[derive(Debug, PartialEq)]
pub enum Frame {
    /// A DATA frame header. The body is not part of the frame value: callers
    /// consume `len` bytes directly off the stream.
    Data { len: u64 },
    Headers(Bytes),
    CancelPush(u64),
    Settings(Settings),
    PushPromise(PushPromise),
    Goaway(u64),
    MaxPushId(u64),
}

/// Outcome of [`parse`].
#[derive(Debug, PartialEq)]
pub enum Parsed {
    /// A complete frame was consumed from the buffer. For `Frame::Data` only
    /// the frame header was consumed.
    Frame(Frame),
    /// An unknown frame type was consumed and skipped entirely.
    Ignored(u64),
    /// The buffer holds less than one frame; nothing was consumed. The value
    /// is the minimum total length needed to make progress.
    More(usize),
}

/// Parses a single frame off the front of `buf`.
///
/// `buf` is only advanced when the return value is `Frame` or `Ignored`; on
/// `More` the caller keeps the bytes and retries once more arrive.
pub fn parse(buf: &mut Bytes) -> Result<Parsed, Error> {
    let remaining = buf.remaining();
    let mut peek = buf.clone();

    let ty = match peek.get_var() {
        Ok(ty) => ty,
        Err(UnexpectedEnd) => return Ok(Parsed::More(remaining + 1)),
    };
    let len = match peek.get_var() {
        Ok(len) => len,
        Err(UnexpectedEnd) => return Ok(Parsed::More(remaining + 1)),
    };
    let header_len = remaining - peek.remaining();

    let ty = FrameType(ty);
    if ty == FrameType::DATA {
        buf.advance(header_len);
        return Ok(Parsed::Frame(Frame::Data { len }));
    }

    match ty {
        FrameType::H2_PRIORITY
        | FrameType::H2_PING
        | FrameType::H2_WINDOW_UPDATE
        | FrameType::H2_CONTINUATION => return Err(Error::UnsupportedFrame(ty.0)),
        _ => (),
    }

    if peek.remaining() < len as usize {
        return Ok(Parsed::More(header_len + len as usize));
    }

    let mut payload = peek.copy_to_bytes(len as usize);
    let frame = match ty {
        FrameType::HEADERS => Frame::Headers(payload),
        FrameType::SETTINGS => Frame::Settings(Settings::decode(&mut payload)?),
        FrameType::CANCEL_PUSH => Frame::CancelPush(single_varint_payload(&mut payload)?),
        FrameType::PUSH_PROMISE => Frame::PushPromise(PushPromise::decode(&mut payload)?),
        FrameType::GOAWAY => Frame::Goaway(single_varint_payload(&mut payload)?),
        FrameType::MAX_PUSH_ID => Frame::MaxPushId(single_varint_payload(&mut payload)?),
        _ => {
            //= https://www.rfc-editor.org/rfc/rfc9114#section-9
            //# Endpoints MUST NOT consider these frames to have any meaning
            //# upon receipt.
            trace!("ignoring unknown frame type {:#x}", ty.0);
            buf.advance(header_len + len as usize);
            return Ok(Parsed::Ignored(ty.0));
        }
    };

    trace!("got frame {}, len: {}", frame, len);
    buf.advance(header_len + len as usize);
    Ok(Parsed::Frame(frame))
}

fn single_varint_payload(payload: &mut Bytes) -> Result<u64, Error> {
    let value = payload.get_var().map_err(|_| Error::Malformed)?;
    if payload.has_remaining() {
        return Err(Error::Malformed);
    }
    Ok(value)
}

impl Encode for Frame {
    fn encode<T: BufMut>(&self, buf: &mut T) {
        match self {
            Frame::Data { len } => {
                FrameType::DATA.encode(buf);
                buf.write_var(*len);
            }
            Frame::Headers(block) => {
                FrameType::HEADERS.encode(buf);
                buf.write_var(block.len() as u64);
                buf.put_slice(block);
            }
            Frame::Settings(s) => s.encode(buf),
            Frame::CancelPush(id) => simple_frame_encode(FrameType::CANCEL_PUSH, *id, buf),
            Frame::PushPromise(p) => p.encode(buf),
            Frame::Goaway(id) => simple_frame_encode(FrameType::GOAWAY, *id, buf),
            Frame::MaxPushId(id) => simple_frame_encode(FrameType::MAX_PUSH_ID, *id, buf),
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Data { len } => write!(f, "Data({} bytes)", len),
            Frame::Headers(block) => write!(f, "Headers({} bytes)", block.len()),
            Frame::Settings(_) => write!(f, "Settings"),
            Frame::CancelPush(id) => write!(f, "CancelPush({})", id),
            Frame::PushPromise(p) => write!(f, "PushPromise({})", p.id),
            Frame::Goaway(id) => write!(f, "GoAway({})", id),
            Frame::MaxPushId(id) => write!(f, "MaxPushId({})", id),
        }
    }
}

macro_rules! frame_types {
    {$($name:ident = $val:expr,)*} => {
        impl FrameType {
            $(pub const $name: FrameType = FrameType($val);)*
        }
    }
}

frame_types! {
    DATA = 0x0,
    HEADERS = 0x1,
    H2_PRIORITY = 0x2,
    CANCEL_PUSH = 0x3,
    SETTINGS = 0x4,
    PUSH_PROMISE = 0x5,
    H2_PING = 0x6,
    GOAWAY = 0x7,
    H2_WINDOW_UPDATE = 0x8,
    H2_CONTINUATION = 0x9,
    MAX_PUSH_ID = 0xD,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct FrameType(pub u64);

impl FrameType {
    pub(crate) fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write_var(self.0);
    }
}

#[derive(Debug, PartialEq)]
pub struct PushPromise {
    pub id: u64,
    pub encoded: Bytes,
}

impl PushPromise {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, Error> {
        Ok(PushPromise {
            id: buf.get_var().map_err(|_| Error::Malformed)?,
            encoded: buf.copy_to_bytes(buf.remaining()),
        })
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        FrameType::PUSH_PROMISE.encode(buf);
        let len = VarInt::from_u64(self.id).expect("push id").size() + self.encoded.len();
        buf.write_var(len as u64);
        buf.write_var(self.id);
        buf.put_slice(&self.encoded);
    }
}

fn simple_frame_encode<B: BufMut>(ty: FrameType, id: u64, buf: &mut B) {
    ty.encode(buf);
    buf.write_var(VarInt::from_u64(id).expect("frame id").size() as u64);
    buf.write_var(id);
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub struct SettingId(pub u64);

impl SettingId {
    const NONE: SettingId = SettingId(0);

    /// A random reserved identifier of the `0x1f * N + 0x21` form.
    ///
    /// <https://www.rfc-editor.org/rfc/rfc9114#section-7.2.4.1>
    pub fn grease() -> Self {
        SettingId(0x1f * fastrand::u64(0..0x210842108421083) + 0x21)
    }

    fn is_supported(self) -> bool {
        matches!(
            self,
            SettingId::QPACK_MAX_TABLE_CAPACITY
                | SettingId::MAX_FIELD_SECTION_SIZE
                | SettingId::QPACK_BLOCKED_STREAMS
        )
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, UnexpectedEnd> {
        Ok(SettingId(buf.get_var()?))
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write_var(self.0);
    }
}

macro_rules! setting_identifiers {
    {$($name:ident = $val:expr,)*} => {
        impl SettingId {
            $(pub const $name: SettingId = SettingId($val);)*
        }
    }
}

setting_identifiers! {
    QPACK_MAX_TABLE_CAPACITY = 0x1,
    MAX_FIELD_SECTION_SIZE = 0x6,
    QPACK_BLOCKED_STREAMS = 0x7,
}

const SETTINGS_LEN: usize = 4;

#[derive(Debug, PartialEq)]
pub struct Settings {
    entries: [(SettingId, u64); SETTINGS_LEN],
    len: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            entries: [(SettingId::NONE, 0); SETTINGS_LEN],
            len: 0,
        }
    }
}

impl Settings {
    pub fn insert(&mut self, id: SettingId, value: u64) -> Result<(), SettingsError> {
        if self.len >= self.entries.len() {
            return Err(SettingsError::Exceeded);
        }

        if self.entries[..self.len].iter().any(|(i, _)| *i == id) {
            return Err(SettingsError::Repeated(id));
        }

        self.entries[self.len] = (id, value);
        self.len += 1;
        Ok(())
    }

    pub fn get(&self, id: SettingId) -> Option<u64> {
        self.entries[..self.len]
            .iter()
            .find(|(i, _)| *i == id)
            .map(|(_, v)| *v)
    }

    fn payload_len(&self) -> usize {
        self.entries[..self.len].iter().fold(0, |len, (id, val)| {
            len + VarInt::from_u64(id.0).expect("setting id").size()
                + VarInt::from_u64(*val).expect("setting value").size()
        })
    }

    pub(crate) fn encode<T: BufMut>(&self, buf: &mut T) {
        FrameType::SETTINGS.encode(buf);
        buf.write_var(self.payload_len() as u64);
        for (id, val) in self.entries[..self.len].iter() {
            id.encode(buf);
            buf.write_var(*val);
        }
    }

    pub(crate) fn decode<T: Buf>(buf: &mut T) -> Result<Settings, Error> {
        let mut settings = Settings::default();
        while buf.has_remaining() {
            let identifier = SettingId::decode(buf).map_err(|_| SettingsError::Malformed)?;
            let value = buf.get_var().map_err(|_| SettingsError::Malformed)?;

            //= https://www.rfc-editor.org/rfc/rfc9114#section-7.2.4
            //# Setting identifiers that an endpoint does not understand
            //# MUST be ignored.
            if identifier.is_supported() {
                settings.insert(identifier, value).map_err(Error::Settings)?;
            }
        }
        Ok(settings)
    }
}

#[derive(Debug, PartialEq)]
pub enum SettingsError {
    Exceeded,
    Malformed,
    Repeated(SettingId),
}

impl std::error::Error for SettingsError {}

impl fmt::Display for SettingsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingsError::Exceeded => {
                write!(f, "max settings number exceeded, check for duplicate entries")
            }
            SettingsError::Malformed => write!(f, "malformed settings frame"),
            SettingsError::Repeated(id) => write!(f, "got setting 0x{:x} twice", id.0),
        }
    }
}

impl From<SettingsError> for Error {
    fn from(e: SettingsError) -> Self {
        Self::Settings(e)
    }
}
