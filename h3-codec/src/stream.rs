//! Unidirectional stream headers.
//!
//! The first varint on a peer-opened unidirectional stream names the stream
//! type; everything after it belongs to that stream's own protocol.

use std::fmt;

use bytes::{Buf, BufMut, Bytes};

use crate::coding::Encode;
use crate::varint::{BufExt, BufMutExt};

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct StreamType(pub u64);

macro_rules! stream_types {
    {$($name:ident = $val:expr,)*} => {
        impl StreamType {
            $(pub const $name: StreamType = StreamType($val);)*
        }
    }
}

stream_types! {
    CONTROL = 0x00,
    PUSH = 0x01,
    ENCODER = 0x02,
    DECODER = 0x03,
}

impl Encode for StreamType {
    fn encode<W: BufMut>(&self, buf: &mut W) {
        buf.write_var(self.0);
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            StreamType::CONTROL => write!(f, "Control"),
            StreamType::ENCODER => write!(f, "Encoder"),
            StreamType::DECODER => write!(f, "Decoder"),
            StreamType::PUSH => write!(f, "Push"),
            x => write!(f, "StreamType({:#x})", x.0),
        }
    }
}

/// Classification of a peer-opened unidirectional stream.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum UnidiKind {
    Control,
    Encoder,
    Decoder,
    Push,
    Unknown(u64),
}

/// Reads the stream-type header off the front of `buf`.
///
/// Returns `None` when the varint is still incomplete; `buf` is only advanced
/// once the type is fully decoded.
pub fn parse_unidi_stream_header(buf: &mut Bytes) -> Option<UnidiKind> {
    let mut peek = buf.clone();
    let ty = peek.get_var().ok()?;
    buf.advance(buf.remaining() - peek.remaining());

    Some(match StreamType(ty) {
        StreamType::CONTROL => UnidiKind::Control,
        StreamType::ENCODER => UnidiKind::Encoder,
        StreamType::DECODER => UnidiKind::Decoder,
        StreamType::PUSH => UnidiKind::Push,
        _ => UnidiKind::Unknown(ty),
    })
}
