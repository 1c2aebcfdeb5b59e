//! Stream and datagram framing (panic-free).
//!
//! Stream frame: `header`, length, payload. `header = (type << 4) | variant`.
//! The length is one byte below 254, `254` + u16 up to 65535, otherwise
//! `255` + u32 (little-endian).
//!
//! Datagram frame: `header`, optional u16 sender id (client → server only),
//! payload. The datagram boundary is the length.
//!
//! Parsing rules:
//! - Never index (`buf[0]`); read through `Buf` after `remaining()` checks.
//! - Never `unwrap()` / `expect()` / `panic!()` in production paths.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{RelayError, Result};
use crate::protocol::types::ClientId;

const LEN_U16_MARKER: u8 = 254;
const LEN_U32_MARKER: u8 = 255;

/// One complete protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Message type (4 bits).
    pub msg_type: u8,
    /// Application-defined tag (4 bits).
    pub variant: u8,
    /// Message body (zero-copy).
    pub payload: Bytes,
}

impl Frame {
    pub fn new(msg_type: u8, variant: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            msg_type: msg_type & 0x0F,
            variant: variant & 0x0F,
            payload: payload.into(),
        }
    }

    /// Empty-bodied frame of the given type.
    pub fn signal(msg_type: u8) -> Self {
        Self::new(msg_type, 0, Bytes::new())
    }

    pub fn from_header(header: u8, payload: Bytes) -> Self {
        Self {
            msg_type: header >> 4,
            variant: header & 0x0F,
            payload,
        }
    }

    pub fn header(&self) -> u8 {
        ((self.msg_type & 0x0F) << 4) | (self.variant & 0x0F)
    }

    /// Stream encoding of this frame.
    pub fn to_stream_bytes(&self) -> Result<Bytes> {
        let mut out = BytesMut::with_capacity(self.payload.len() + 6);
        encode_frame(self, &mut out)?;
        Ok(out.freeze())
    }
}

/// Append the stream encoding of `frame` to `dst`.
pub fn encode_frame(frame: &Frame, dst: &mut BytesMut) -> Result<()> {
    let len = frame.payload.len();
    dst.reserve(len + 6);
    dst.put_u8(frame.header());

    if len < usize::from(LEN_U16_MARKER) {
        dst.put_u8(len as u8);
    } else if let Ok(short) = u16::try_from(len) {
        dst.put_u8(LEN_U16_MARKER);
        dst.put_u16_le(short);
    } else {
        let long = u32::try_from(len).map_err(|_| RelayError::PayloadTooLarge {
            len,
            max: u32::MAX as usize,
        })?;
        dst.put_u8(LEN_U32_MARKER);
        dst.put_u32_le(long);
    }

    dst.put_slice(&frame.payload);
    Ok(())
}

/// Decode one frame from the front of `buf`.
///
/// Returns the frame and the number of bytes it occupied, or `None` when
/// `buf` does not yet hold a complete frame.
pub fn decode_frame(buf: &[u8]) -> Option<(Frame, usize)> {
    let (header, header_len, payload_len) = peek_header(buf)?;
    let total = header_len.checked_add(payload_len)?;
    let body = buf.get(header_len..total)?;
    Some((
        Frame::from_header(header, Bytes::copy_from_slice(body)),
        total,
    ))
}

/// Header byte, header length (header + length field) and declared payload
/// length, once enough bytes are buffered to know them.
fn peek_header(buf: &[u8]) -> Option<(u8, usize, usize)> {
    let mut cur = buf;
    if cur.remaining() < 2 {
        return None;
    }
    let header = cur.get_u8();

    match cur.get_u8() {
        LEN_U16_MARKER => {
            if cur.remaining() < 2 {
                return None;
            }
            Some((header, 4, usize::from(cur.get_u16_le())))
        }
        LEN_U32_MARKER => {
            if cur.remaining() < 4 {
                return None;
            }
            let len = usize::try_from(cur.get_u32_le()).unwrap_or(usize::MAX);
            Some((header, 6, len))
        }
        short => Some((header, 2, usize::from(short))),
    }
}

/// Incremental stream reassembly.
///
/// Bytes are pushed as the transport delivers them; complete frames are pulled
/// out in order. A frame is never surfaced before its whole payload arrived.
#[derive(Debug)]
pub struct FrameReader {
    buf: BytesMut,
    max_payload: usize,
}

impl FrameReader {
    pub fn new(max_payload: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_payload,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete frame, `Ok(None)` if more bytes are needed.
    ///
    /// A declared length above the limit fails as soon as the length field is
    /// readable, before any of the payload is buffered.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        let Some((header, header_len, payload_len)) = peek_header(&self.buf) else {
            return Ok(None);
        };

        if payload_len > self.max_payload {
            return Err(RelayError::PayloadTooLarge {
                len: payload_len,
                max: self.max_payload,
            });
        }

        let total = header_len + payload_len;
        if self.buf.len() < total {
            self.buf.reserve(total - self.buf.len());
            return Ok(None);
        }

        let mut raw = self.buf.split_to(total).freeze();
        raw.advance(header_len);
        Ok(Some(Frame::from_header(header, raw)))
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

/// Encode a datagram. Clients pass their id as `sender`; the server passes
/// `None`.
pub fn encode_datagram(frame: &Frame, sender: Option<ClientId>) -> Bytes {
    let mut out = BytesMut::with_capacity(frame.payload.len() + 3);
    out.put_u8(frame.header());
    if let Some(id) = sender {
        out.put_u16_le(id.0);
    }
    out.put_slice(&frame.payload);
    out.freeze()
}

/// Decode a datagram. `with_sender` is true on the server side, where every
/// datagram carries the sender's client id after the header.
pub fn decode_datagram(mut buf: Bytes, with_sender: bool) -> Result<(Frame, Option<ClientId>)> {
    let need = if with_sender { 3 } else { 1 };
    if buf.remaining() < need {
        return Err(RelayError::protocol("datagram too short"));
    }

    let header = buf.get_u8();
    let sender = if with_sender {
        Some(ClientId(buf.get_u16_le()))
    } else {
        None
    };

    Ok((Frame::from_header(header, buf), sender))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;

    fn encoded(len: usize) -> Bytes {
        Frame::new(2, 5, vec![0xAB; len]).to_stream_bytes().unwrap()
    }

    #[test]
    fn length_field_width_follows_payload_size() {
        assert_eq!(encoded(0).len(), 2);
        assert_eq!(encoded(253).len(), 2 + 253);

        let b = encoded(254);
        assert_eq!(b.get(1), Some(&254));
        assert_eq!(b.len(), 4 + 254);

        let b = encoded(65_535);
        assert_eq!(b.get(1), Some(&254));
        assert_eq!(b.len(), 4 + 65_535);

        let b = encoded(65_536);
        assert_eq!(b.get(1), Some(&255));
        assert_eq!(b.len(), 6 + 65_536);
    }

    #[test]
    fn header_packs_type_and_variant() {
        let f = Frame::new(9, 3, Bytes::new());
        assert_eq!(f.header(), 0x93);
        let back = Frame::from_header(0x93, Bytes::new());
        assert_eq!((back.msg_type, back.variant), (9, 3));
    }

    #[test]
    fn decode_restores_frames_across_size_classes() {
        for len in [0usize, 1, 253, 254, 255, 65_535, 65_536, 1 << 20] {
            let original = Frame::new(3, 15, vec![len as u8; len]);
            let bytes = original.to_stream_bytes().unwrap();
            let (decoded, used) = decode_frame(&bytes).expect("complete frame");
            assert_eq!(used, bytes.len(), "len={len}");
            assert_eq!(decoded, original, "len={len}");
        }
    }

    #[test]
    fn decode_waits_for_complete_frame() {
        let bytes = encoded(300);
        for cut in 0..bytes.len() {
            assert!(decode_frame(&bytes[..cut]).is_none(), "cut={cut}");
        }
    }

    #[test]
    fn reader_reassembles_byte_by_byte() {
        let mut reader = FrameReader::new(1 << 20);
        let bytes = encoded(1000);
        let mut got = Vec::new();
        for b in bytes.iter() {
            reader.push(&[*b]);
            while let Some(f) = reader.next_frame().unwrap() {
                got.push(f);
            }
        }
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].payload.len(), 1000);
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn reader_splits_concatenated_frames_in_order() {
        let mut wire = BytesMut::new();
        for i in 0..5u8 {
            encode_frame(&Frame::new(1, i, vec![i; i as usize * 100]), &mut wire).unwrap();
        }
        // Plus half of another frame.
        let tail = encoded(10);
        wire.extend_from_slice(&tail[..5]);

        let mut reader = FrameReader::new(1 << 20);
        reader.push(&wire);
        let mut variants = Vec::new();
        while let Some(f) = reader.next_frame().unwrap() {
            assert_eq!(f.payload.len(), f.variant as usize * 100);
            variants.push(f.variant);
        }
        assert_eq!(variants, vec![0, 1, 2, 3, 4]);
        assert_eq!(reader.buffered(), 5);

        reader.push(&tail[5..]);
        let last = reader.next_frame().unwrap().expect("tail frame");
        assert_eq!(last.payload.len(), 10);
    }

    #[test]
    fn reader_rejects_oversized_declaration_early() {
        let mut reader = FrameReader::new(1024);
        // Only the header of a 64 KiB frame.
        reader.push(&[0x10, 254, 0xFF, 0xFF]);
        let err = reader.next_frame().unwrap_err();
        assert_eq!(err.class().as_str(), "PAYLOAD_TOO_LARGE");
    }

    #[test]
    fn datagram_carries_sender_id() {
        let f = Frame::new(7, 0, Bytes::new());
        let dg = encode_datagram(&f, Some(ClientId(0x0102)));
        assert_eq!(dg.as_ref(), &[0x70, 0x02, 0x01]);

        let (back, sender) = decode_datagram(dg, true).unwrap();
        assert_eq!(back, f);
        assert_eq!(sender, Some(ClientId(0x0102)));
    }

    #[test]
    fn short_datagram_is_rejected() {
        let err = decode_datagram(Bytes::from_static(&[0x70, 0x01]), true).unwrap_err();
        assert_eq!(err.class().as_str(), "PROTOCOL_VIOLATION");
        assert!(decode_datagram(Bytes::new(), false).is_err());
    }
}
