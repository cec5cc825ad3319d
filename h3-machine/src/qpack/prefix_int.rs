//! QPACK prefix integers (RFC 9204, section 4.1.1).

use bytes::{Buf, BufMut};

// 9 continuation bytes of 7 bits each already exceed 2^62.
const MAX_POWER: u32 = 9 * 7;

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    UnexpectedEnd,
    Overflow,
}

/// Decodes an integer with an `F`-bit prefix.
///
/// Returns the full first byte (so the caller can inspect the flag bits above
/// the prefix) together with the decoded value.
pub fn decode<const F: u8, B: Buf>(buf: &mut B) -> Result<(u8, u64), Error> {
    let mask = 0xffu8 >> (8 - F);
    if !buf.has_remaining() {
        return Err(Error::UnexpectedEnd);
    }
    let first = buf.get_u8();

    let prefix = first & mask;
    if prefix < mask {
        return Ok((first, prefix as u64));
    }

    let mut value = mask as u64;
    let mut power = 0u32;
    loop {
        if !buf.has_remaining() {
            return Err(Error::UnexpectedEnd);
        }
        let byte = buf.get_u8() as u64;
        value = value
            .checked_add((byte & 0x7f) << power)
            .ok_or(Error::Overflow)?;
        power += 7;

        if byte & 0x80 == 0 {
            return Ok((first, value));
        }
        if power >= MAX_POWER {
            return Err(Error::Overflow);
        }
    }
}

/// Encodes `value` with an `F`-bit prefix, OR-ing `flags` into the first byte.
pub fn encode<const F: u8, B: BufMut>(flags: u8, value: u64, buf: &mut B) {
    let mask = 0xffu8 >> (8 - F);
    if value < mask as u64 {
        buf.put_u8(flags | value as u8);
        return;
    }

    buf.put_u8(flags | mask);
    let mut rest = value - mask as u64;
    while rest >= 0x80 {
        buf.put_u8(0x80 | (rest & 0x7f) as u8);
        rest >>= 7;
    }
    buf.put_u8(rest as u8);
}
