//! QPACK field-section codec (RFC 9204), dynamic table disabled.
//!
//! The connection advertises a table capacity of zero, so every field line is
//! either an indexed reference into the static table or a literal. The
//! encoder never emits Huffman-coded strings; the decoder rejects them, along
//! with any representation that would require the dynamic table.

mod prefix_int;
mod static_table;

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use h3_codec::Code;

/// Per-field overhead used when sizing a field section.
///
/// <https://www.rfc-editor.org/rfc/rfc9204#section-3.1.1>
const FIELD_OVERHEAD: u64 = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: Bytes,
    pub value: Bytes,
}

impl Field {
    pub fn new(name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    fn size(&self) -> u64 {
        self.name.len() as u64 + self.value.len() as u64 + FIELD_OVERHEAD
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    Decompression(&'static str),
    EncoderStream(&'static str),
    DecoderStream(&'static str),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Decompression(msg) => write!(f, "field section: {}", msg),
            Error::EncoderStream(msg) => write!(f, "encoder stream: {}", msg),
            Error::DecoderStream(msg) => write!(f, "decoder stream: {}", msg),
        }
    }
}

pub fn error_to_code(error: &Error) -> Code {
    match error {
        Error::Decompression(_) => Code::QPACK_DECOMPRESSION_FAILED,
        Error::EncoderStream(_) => Code::QPACK_ENCODER_STREAM_ERROR,
        Error::DecoderStream(_) => Code::QPACK_DECODER_STREAM_ERROR,
    }
}

/// Decodes a complete encoded field section.
///
/// Returns the fields and the section size as defined for
/// `SETTINGS_MAX_FIELD_SECTION_SIZE` comparisons.
pub fn decode_field_section(mut buf: Bytes) -> Result<(Vec<Field>, u64), Error> {
    // Encoded Field Section Prefix: Required Insert Count, then S + Delta Base.
    let (_, required_insert_count) = prefix_int::decode::<8, _>(&mut buf)
        .map_err(|_| Error::Decompression("truncated section prefix"))?;
    if required_insert_count != 0 {
        return Err(Error::Decompression("dynamic table reference"));
    }
    let (_, _base) = prefix_int::decode::<7, _>(&mut buf)
        .map_err(|_| Error::Decompression("truncated section prefix"))?;

    let mut fields = Vec::new();
    let mut size = 0u64;
    while buf.has_remaining() {
        let field = decode_field_line(&mut buf)?;
        size += field.size();
        fields.push(field);
    }
    Ok((fields, size))
}

fn decode_field_line(buf: &mut Bytes) -> Result<Field, Error> {
    let first = buf.chunk()[0];

    if first & 0b1000_0000 != 0 {
        // Indexed Field Line: 1 T IIIIII
        let (flags, index) = prefix_int::decode::<6, _>(buf)
            .map_err(|_| Error::Decompression("truncated indexed field"))?;
        if flags & 0b0100_0000 == 0 {
            return Err(Error::Decompression("dynamic table reference"));
        }
        let (name, value) =
            static_table::get(index).ok_or(Error::Decompression("static index out of range"))?;
        return Ok(Field::new(name.as_bytes(), value.as_bytes()));
    }

    if first & 0b0100_0000 != 0 {
        // Literal Field Line with Name Reference: 01 N T IIII
        let (flags, index) = prefix_int::decode::<4, _>(buf)
            .map_err(|_| Error::Decompression("truncated name reference"))?;
        if flags & 0b0001_0000 == 0 {
            return Err(Error::Decompression("dynamic table reference"));
        }
        let (name, _) =
            static_table::get(index).ok_or(Error::Decompression("static index out of range"))?;
        let value = decode_string::<7>(buf)?;
        return Ok(Field {
            name: Bytes::from_static(name.as_bytes()),
            value,
        });
    }

    if first & 0b0010_0000 != 0 {
        // Literal Field Line with Literal Name: 001 N H NNN
        let (flags, name_len) = prefix_int::decode::<3, _>(buf)
            .map_err(|_| Error::Decompression("truncated literal name"))?;
        if flags & 0b0000_1000 != 0 {
            return Err(Error::Decompression("huffman string"));
        }
        let name = take_bytes(buf, name_len)?;
        let value = decode_string::<7>(buf)?;
        return Ok(Field { name, value });
    }

    // Remaining patterns (0001, 0000) are post-base references.
    Err(Error::Decompression("dynamic table reference"))
}

fn decode_string<const F: u8>(buf: &mut Bytes) -> Result<Bytes, Error> {
    let (flags, len) =
        prefix_int::decode::<F, _>(buf).map_err(|_| Error::Decompression("truncated string"))?;
    // The Huffman bit sits just above the length prefix.
    if flags & (1 << F) != 0 {
        return Err(Error::Decompression("huffman string"));
    }
    take_bytes(buf, len)
}

fn take_bytes(buf: &mut Bytes, len: u64) -> Result<Bytes, Error> {
    if (buf.remaining() as u64) < len {
        return Err(Error::Decompression("truncated string"));
    }
    Ok(buf.split_to(len as usize))
}

/// Encodes a field section referencing only the static table.
pub fn encode_field_section<'a>(fields: impl Iterator<Item = (&'a [u8], &'a [u8])>) -> Bytes {
    let mut buf = BytesMut::new();
    // Required Insert Count = 0, S = 0, Delta Base = 0.
    prefix_int::encode::<8, _>(0, 0, &mut buf);
    prefix_int::encode::<7, _>(0, 0, &mut buf);

    for (name, value) in fields {
        encode_field_line(name, value, &mut buf);
    }
    buf.freeze()
}

fn encode_field_line(name: &[u8], value: &[u8], buf: &mut BytesMut) {
    if let Some(index) = static_table::find(name, value) {
        // Indexed Field Line, static table
        prefix_int::encode::<6, _>(0b1100_0000, index, buf);
        return;
    }

    if let Some(index) = static_table::find_name(name) {
        // Literal Field Line with Name Reference, static table
        prefix_int::encode::<4, _>(0b0101_0000, index, buf);
        encode_string::<7>(0, value, buf);
        return;
    }

    // Literal Field Line with Literal Name
    prefix_int::encode::<3, _>(0b0010_0000, name.len() as u64, buf);
    buf.put_slice(name);
    encode_string::<7>(0, value, buf);
}

fn encode_string<const F: u8>(flags: u8, value: &[u8], buf: &mut BytesMut) {
    prefix_int::encode::<F, _>(flags, value.len() as u64, buf);
    buf.put_slice(value);
}

/// Consumes complete instructions from the peer's encoder stream.
///
/// Partial trailing instructions are left in `buf` for the next call. With a
/// zero-capacity table the only acceptable instruction is "set capacity 0".
pub fn decode_encoder_instructions(buf: &mut BytesMut) -> Result<(), Error> {
    loop {
        let Some(&first) = buf.first() else {
            return Ok(());
        };
        let mut peek = &buf[..];

        if first & 0b1000_0000 != 0 || first & 0b1110_0000 == 0 {
            // Insert with Name Reference / Duplicate
            return Err(Error::EncoderStream("dynamic table insert"));
        }
        if first & 0b0100_0000 != 0 {
            // Insert with Literal Name
            return Err(Error::EncoderStream("dynamic table insert"));
        }

        // Set Dynamic Table Capacity: 001 CCCCC
        match prefix_int::decode::<5, _>(&mut peek) {
            Ok((_, 0)) => {
                let consumed = buf.len() - peek.len();
                buf.advance(consumed);
            }
            Ok((_, _)) => return Err(Error::EncoderStream("nonzero table capacity")),
            Err(prefix_int::Error::UnexpectedEnd) => return Ok(()),
            Err(prefix_int::Error::Overflow) => {
                return Err(Error::EncoderStream("capacity overflow"))
            }
        }
    }
}

/// Consumes complete instructions from the peer's decoder stream.
///
/// Nothing we send ever references the dynamic table, so acknowledgements and
/// insert-count increments have no section to refer to; stream cancellations
/// are valid and carry no state here.
pub fn decode_decoder_instructions(buf: &mut BytesMut) -> Result<(), Error> {
    loop {
        let Some(&first) = buf.first() else {
            return Ok(());
        };
        let mut peek = &buf[..];

        let result = if first & 0b1000_0000 != 0 {
            // Section Acknowledgment
            prefix_int::decode::<7, _>(&mut peek)
                .map(|_| Err(Error::DecoderStream("unexpected section acknowledgment")))
        } else if first & 0b0100_0000 != 0 {
            // Stream Cancellation
            prefix_int::decode::<6, _>(&mut peek).map(|_| Ok(()))
        } else {
            // Insert Count Increment
            prefix_int::decode::<6, _>(&mut peek)
                .map(|_| Err(Error::DecoderStream("unexpected insert count increment")))
        };

        match result {
            Ok(Ok(())) => {
                let consumed = buf.len() - peek.len();
                buf.advance(consumed);
            }
            Ok(Err(e)) => return Err(e),
            Err(prefix_int::Error::UnexpectedEnd) => return Ok(()),
            Err(prefix_int::Error::Overflow) => {
                return Err(Error::DecoderStream("instruction overflow"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(fields: &[(&str, &str)]) -> Vec<Field> {
        let block = encode_field_section(
            fields
                .iter()
                .map(|(n, v)| (n.as_bytes(), v.as_bytes())),
        );
        let (decoded, _) = decode_field_section(block).unwrap();
        decoded
    }

    #[test]
    fn roundtrip_static_indexed() {
        let decoded = roundtrip(&[(":method", "GET"), (":scheme", "https")]);
        assert_eq!(decoded[0], Field::new(&b":method"[..], &b"GET"[..]));
        assert_eq!(decoded[1], Field::new(&b":scheme"[..], &b"https"[..]));
    }

    #[test]
    fn roundtrip_name_reference() {
        let decoded = roundtrip(&[(":authority", "example.com")]);
        assert_eq!(
            decoded[0],
            Field::new(&b":authority"[..], &b"example.com"[..])
        );
    }

    #[test]
    fn roundtrip_literal_name() {
        let decoded = roundtrip(&[("x-custom", "yes"), ("x-empty", "")]);
        assert_eq!(decoded[0], Field::new(&b"x-custom"[..], &b"yes"[..]));
        assert_eq!(decoded[1], Field::new(&b"x-empty"[..], &b""[..]));
    }

    #[test]
    fn section_size_counts_overhead() {
        let block = encode_field_section([(&b"x-a"[..], &b"b"[..])].into_iter());
        let (_, size) = decode_field_section(block).unwrap();
        assert_eq!(size, 3 + 1 + FIELD_OVERHEAD);
    }

    #[test]
    fn rejects_dynamic_reference() {
        // Required Insert Count != 0
        let block = Bytes::copy_from_slice(&[0x02, 0x00]);
        assert_eq!(
            decode_field_section(block),
            Err(Error::Decompression("dynamic table reference"))
        );
    }

    #[test]
    fn rejects_huffman_value() {
        // name ref to static 17, value with H bit set
        let block = Bytes::copy_from_slice(&[0x00, 0x00, 0b0101_0000 | 1, 0b1000_0001, 0xff]);
        assert_eq!(
            decode_field_section(block),
            Err(Error::Decompression("huffman string"))
        );
    }

    #[test]
    fn rejects_truncated_section() {
        let block = Bytes::copy_from_slice(&[0x00, 0x00, 0b0101_0001, 0x05, b'h']);
        assert_eq!(
            decode_field_section(block),
            Err(Error::Decompression("truncated string"))
        );
    }

    #[test]
    fn encoder_instructions_capacity_zero_ok() {
        let mut buf = BytesMut::from(&[0b0010_0000u8][..]);
        assert_eq!(decode_encoder_instructions(&mut buf), Ok(()));
        assert!(buf.is_empty());
    }

    #[test]
    fn encoder_instructions_insert_rejected() {
        let mut buf = BytesMut::from(&[0b1100_0001u8, 0x01, b'x'][..]);
        assert_eq!(
            decode_encoder_instructions(&mut buf),
            Err(Error::EncoderStream("dynamic table insert"))
        );
    }

    #[test]
    fn decoder_instructions_cancellation_ignored() {
        let mut buf = BytesMut::from(&[0b0100_0100u8][..]);
        assert_eq!(decode_decoder_instructions(&mut buf), Ok(()));
        assert!(buf.is_empty());
    }

    #[test]
    fn decoder_instructions_ack_rejected() {
        let mut buf = BytesMut::from(&[0b1000_0100u8][..]);
        assert_eq!(
            decode_decoder_instructions(&mut buf),
            Err(Error::DecoderStream("unexpected section acknowledgment"))
        );
    }

    #[test]
    fn partial_instruction_left_buffered() {
        // 0b0011_1111 starts a multi-byte capacity value
        let mut buf = BytesMut::from(&[0b0011_1111u8][..]);
        assert_eq!(decode_encoder_instructions(&mut buf), Ok(()));
        assert_eq!(buf.len(), 1);
    }
}
