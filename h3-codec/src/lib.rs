//! HTTP/3 wire codec.
//!
//! Parsing and serialization for RFC 9114 frames and unidirectional stream
//! headers, plus the protocol error-code table. This crate is deliberately
//! free of any connection state: it only turns bytes into frames and back.

mod codes;
mod coding;
mod frame;
mod stream;
mod varint;

pub use codes::Code;
pub use coding::Encode;
pub use frame::{
    error_to_code, parse, Error, Frame, FrameType, Parsed, PushPromise, SettingId, Settings,
    SettingsError,
};
pub use stream::{parse_unidi_stream_header, StreamType, UnidiKind};
pub use varint::{BufExt, BufMutExt, UnexpectedEnd, VarInt};
