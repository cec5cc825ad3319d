use bytes::BufMut;

/// Wire encoding of a protocol element.
pub trait Encode {
    fn encode<B: BufMut>(&self, buf: &mut B);
}
