//! HTTP/3 and QPACK error codes.

use std::fmt;

/// An application error code, as carried in RESET_STREAM, STOP_SENDING, and
/// CONNECTION_CLOSE.
///
/// The table comes from RFC 9114 section 8.1 plus the three QPACK codes of
/// RFC 9204 section 6. Values outside the table are preserved as-is.
#[derive(PartialEq, Eq, Hash, Clone, Copy)]
pub struct Code {
    code: u64,
}

impl Code {
    /// The numeric value sent on the wire.
    pub const fn value(&self) -> u64 {
        self.code
    }
}

impl PartialEq<u64> for Code {
    fn eq(&self, other: &u64) -> bool {
        *other == self.code
    }
}

macro_rules! codes {
    (
        $(
            $(#[$docs:meta])*
            ($num:expr, $name:ident);
        )+
    ) => {
        impl Code {
        $(
            $(#[$docs])*
            pub const $name: Code = Code { code: $num };
        )+

            fn name(&self) -> Option<&'static str> {
                match self.code {
                $(
                    $num => Some(stringify!($name)),
                )+
                    _ => None,
                }
            }
        }
    }
}

codes! {
    /// Closes a stream or connection that is simply done, with nothing to
    /// report.
    (0x100, H3_NO_ERROR);

    /// A protocol violation with no more specific code, or one the endpoint
    /// chose not to name.
    (0x101, H3_GENERAL_PROTOCOL_ERROR);

    /// Something went wrong inside the HTTP stack itself.
    (0x102, H3_INTERNAL_ERROR);

    /// The peer opened a stream this endpoint will not accept.
    (0x103, H3_STREAM_CREATION_ERROR);

    /// A stream the connection cannot live without was closed or reset.
    (0x104, H3_CLOSED_CRITICAL_STREAM);

    /// A frame arrived on the wrong stream, or in a state where it is not
    /// allowed.
    (0x105, H3_FRAME_UNEXPECTED);

    /// A frame broke its layout or size rules.
    (0x106, H3_FRAME_ERROR);

    /// The peer's behavior looks like it is generating excessive load.
    (0x107, H3_EXCESSIVE_LOAD);

    /// A stream or push id was misused: past a limit, shrinking a limit, or
    /// reused.
    (0x108, H3_ID_ERROR);

    /// The payload of a SETTINGS frame was invalid.
    (0x109, H3_SETTINGS_ERROR);

    /// The control stream did not start with a SETTINGS frame.
    (0x10a, H3_MISSING_SETTINGS);

    /// The server refused the request without doing any application work.
    (0x10b, H3_REQUEST_REJECTED);

    /// The request, or its response, was cancelled.
    (0x10c, H3_REQUEST_CANCELLED);

    /// The peer's stream ended without a fully-formed message on it.
    (0x10d, H3_REQUEST_INCOMPLETE);

    /// A malformed HTTP message that cannot be processed.
    (0x10e, H3_MESSAGE_ERROR);

    /// The TCP connection behind a CONNECT request was reset or closed
    /// abnormally.
    (0x10f, H3_CONNECT_ERROR);

    /// The request cannot be served over HTTP/3; the peer should retry over
    /// HTTP/1.1.
    (0x110, H3_VERSION_FALLBACK);

    /// The decoder gave up on an encoded field section.
    (0x200, QPACK_DECOMPRESSION_FAILED);

    /// An instruction on the encoder stream could not be interpreted.
    (0x201, QPACK_ENCODER_STREAM_ERROR);

    /// An instruction on the decoder stream could not be interpreted.
    (0x202, QPACK_DECODER_STREAM_ERROR);
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "{:#x}", self.code),
        }
    }
}

impl fmt::Debug for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl From<Code> for u64 {
    fn from(code: Code) -> u64 {
        code.code
    }
}

impl From<u64> for Code {
    fn from(code: u64) -> Code {
        Code { code }
    }
}
