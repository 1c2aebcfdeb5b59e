//! Bounds-checked payload reading and writing.
//!
//! Every read checks `remaining()` first; a short payload is a protocol
//! violation, never a panic.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{RelayError, Result};
use crate::protocol::types::MAX_NAME_LEN;

/// Cursor over a message body.
#[derive(Debug, Clone)]
pub struct PayloadReader {
    buf: Bytes,
}

impl PayloadReader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    fn need(&self, n: usize, what: &str) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(RelayError::protocol(format!(
                "truncated payload reading {what}: need {n}, have {}",
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn u8(&mut self) -> Result<u8> {
        self.need(1, "u8")?;
        Ok(self.buf.get_u8())
    }

    pub fn u16(&mut self) -> Result<u16> {
        self.need(2, "u16")?;
        Ok(self.buf.get_u16_le())
    }

    pub fn bytes(&mut self, n: usize) -> Result<Bytes> {
        self.need(n, "bytes")?;
        Ok(self.buf.split_to(n))
    }

    /// Everything left (zero-copy).
    pub fn rest(&mut self) -> Bytes {
        std::mem::take(&mut self.buf)
    }

    /// u8 length followed by UTF-8 text.
    pub fn short_string(&mut self) -> Result<String> {
        let len = usize::from(self.u8()?);
        let raw = self.bytes(len)?;
        utf8(raw)
    }

    /// Everything left as UTF-8 text.
    pub fn rest_string(&mut self) -> Result<String> {
        utf8(self.rest())
    }

    /// Everything left as text, replacing invalid sequences. For free-form
    /// text such as deny reasons and welcome messages.
    pub fn rest_text_lossy(&mut self) -> String {
        String::from_utf8_lossy(&self.rest()).into_owned()
    }
}

fn utf8(raw: Bytes) -> Result<String> {
    String::from_utf8(raw.to_vec()).map_err(|_| RelayError::protocol("name is not valid UTF-8"))
}

/// Builder for a message body.
#[derive(Debug, Default)]
pub struct PayloadWriter {
    buf: BytesMut,
}

impl PayloadWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u8(mut self, v: u8) -> Self {
        self.buf.put_u8(v);
        self
    }

    pub fn u16(mut self, v: u16) -> Self {
        self.buf.put_u16_le(v);
        self
    }

    pub fn bytes(mut self, v: &[u8]) -> Self {
        self.buf.put_slice(v);
        self
    }

    pub fn str(self, v: &str) -> Self {
        self.bytes(v.as_bytes())
    }

    /// u8 length followed by the text. Names longer than 255 bytes never
    /// reach the wire; they are rejected when first accepted.
    pub fn short_str(self, v: &str) -> Result<Self> {
        if v.len() > MAX_NAME_LEN {
            return Err(RelayError::Internal(format!(
                "name too long for wire: {} bytes",
                v.len()
            )));
        }
        let len = u8::try_from(v.len()).map_err(|_| RelayError::Internal("name length".into()))?;
        Ok(self.u8(len).str(v))
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn reads_back_what_was_written() {
        let body = PayloadWriter::new()
            .u8(2)
            .u16(0xBEEF)
            .short_str("Lobby")
            .unwrap()
            .str("tail")
            .finish();

        let mut r = PayloadReader::new(body);
        assert_eq!(r.u8().unwrap(), 2);
        assert_eq!(r.u16().unwrap(), 0xBEEF);
        assert_eq!(r.short_string().unwrap(), "Lobby");
        assert_eq!(r.rest_string().unwrap(), "tail");
        assert!(r.is_empty());
    }

    #[test]
    fn u16_is_little_endian() {
        let body = PayloadWriter::new().u16(0x0102).finish();
        assert_eq!(body.as_ref(), &[0x02, 0x01]);
    }

    #[test]
    fn truncation_is_a_protocol_violation() {
        let mut r = PayloadReader::new(Bytes::from_static(&[5, b'a', b'b']));
        let err = r.short_string().unwrap_err();
        assert_eq!(err.class().as_str(), "PROTOCOL_VIOLATION");

        let mut r = PayloadReader::new(Bytes::from_static(&[1]));
        assert!(r.u16().is_err());
    }

    #[test]
    fn invalid_utf8_name_is_rejected() {
        let mut r = PayloadReader::new(Bytes::from_static(&[0xFF, 0xFE]));
        assert!(r.rest_string().is_err());

        let mut r = PayloadReader::new(Bytes::from_static(&[0xFF, 0xFE]));
        assert_eq!(r.rest_text_lossy(), "\u{FFFD}\u{FFFD}");
    }

    #[test]
    fn overlong_short_str_is_refused() {
        let long = "x".repeat(256);
        assert!(PayloadWriter::new().short_str(&long).is_err());
        assert!(PayloadWriter::new().short_str(&long[..255]).is_ok());
    }
}
