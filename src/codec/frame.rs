//! AMQP frame layer and its Tokio codec adapter.
//!
//! [`FrameCodec`] implements Tokio's [`Decoder`] and [`Encoder`] so it can sit
//! under [`tokio_util::codec::Framed`] when a caller drives the engine from a
//! socket; the engine itself feeds the same decoder from `ingest`.
//!
//! # Frame Format
//!
//! | Field   | Offset | Size | Description                              |
//! |---------|--------|------|------------------------------------------|
//! | size    | 0      | 4    | Total frame size including this header   |
//! | doff    | 4      | 1    | Data offset in 4-byte words (minimum 2)  |
//! | type    | 5      | 1    | 0 = AMQP, 1 = SASL                       |
//! | channel | 6      | 2    | Session channel                          |
//! | ext     | 8      | var  | Extended header, `doff * 4 - 8` bytes    |
//! | body    | var    | var  | Performative followed by any payload     |

#![expect(clippy::big_endian_bytes, reason = "AMQP encodes numbers in network byte order")]

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use super::{error::DecodeError, performative::Performative, value::Value};

/// Size of the fixed frame header.
pub const FRAME_HEADER_LEN: usize = 8;
/// Smallest maximum frame size a peer may negotiate.
pub const MIN_MAX_FRAME_SIZE: u32 = 512;
/// Frame type code of AMQP frames.
pub const FRAME_TYPE_AMQP: u8 = 0;
/// Frame type code of SASL frames.
pub const FRAME_TYPE_SASL: u8 = 1;

/// Data offset (in 4-byte words) of frames without an extended header.
const DEFAULT_DOFF: u8 = 2;

/// Parsed fixed frame header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    /// Total frame size.
    pub size: u32,
    /// Data offset in 4-byte words.
    pub doff: u8,
    /// Frame type code.
    pub frame_type: u8,
    /// Channel number.
    pub channel: u16,
}

impl FrameHeader {
    /// Read a header from its 8-byte wire form.
    #[must_use]
    pub const fn from_bytes(buf: &[u8; FRAME_HEADER_LEN]) -> Self {
        let [s0, s1, s2, s3, doff, frame_type, c0, c1] = *buf;
        Self {
            size: u32::from_be_bytes([s0, s1, s2, s3]),
            doff,
            frame_type,
            channel: u16::from_be_bytes([c0, c1]),
        }
    }

    fn write_to(self, dst: &mut BytesMut) {
        dst.put_u32(self.size);
        dst.put_u8(self.doff);
        dst.put_u8(self.frame_type);
        dst.put_u16(self.channel);
    }
}

/// A frame split from the byte stream, before performative decoding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawFrame {
    /// Channel number.
    pub channel: u16,
    /// Frame type code.
    pub frame_type: u8,
    /// Frame body; empty for a heartbeat.
    pub body: Bytes,
}

impl RawFrame {
    /// An empty AMQP frame, used as a keepalive.
    #[must_use]
    pub const fn heartbeat() -> Self {
        Self {
            channel: 0,
            frame_type: FRAME_TYPE_AMQP,
            body: Bytes::new(),
        }
    }

    /// Build a frame carrying `performative` followed by `payload`.
    #[must_use]
    pub fn performative(channel: u16, performative: &Performative, payload: &[u8]) -> Self {
        let mut body = BytesMut::new();
        performative.to_value().encode(&mut body);
        body.put_slice(payload);
        Self {
            channel,
            frame_type: FRAME_TYPE_AMQP,
            body: body.freeze(),
        }
    }

    /// Return `true` for a frame with no body.
    #[must_use]
    pub fn is_heartbeat(&self) -> bool { self.body.is_empty() }

    /// Encoded length of the frame.
    #[must_use]
    pub fn wire_len(&self) -> usize { FRAME_HEADER_LEN + self.body.len() }

    /// Encode the frame to its wire form.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(self.wire_len());
        self.write_to(&mut dst);
        dst.freeze()
    }

    fn write_to(&self, dst: &mut BytesMut) {
        FrameHeader {
            size: wire_size(self.wire_len()),
            doff: DEFAULT_DOFF,
            frame_type: self.frame_type,
            channel: self.channel,
        }
        .write_to(dst);
        dst.put_slice(&self.body);
    }

    /// Decode the body as a performative plus trailing payload.
    ///
    /// # Errors
    /// Returns a [`DecodeError`] for non-AMQP frames, malformed performatives,
    /// or payload bytes after a performative other than Transfer.
    pub fn decode_body(&self) -> Result<(Performative, Bytes), DecodeError> {
        if self.frame_type != FRAME_TYPE_AMQP {
            return Err(DecodeError::UnsupportedFrameType(self.frame_type));
        }
        let mut src = self.body.clone();
        let performative = Performative::from_value(Value::decode(&mut src)?)?;
        if !src.is_empty() && !matches!(performative, Performative::Transfer(_)) {
            return Err(DecodeError::UnexpectedPayload(performative.name()));
        }
        Ok((performative, src))
    }
}

#[expect(
    clippy::cast_possible_truncation,
    reason = "frame sizes are bounded by the negotiated u32 maximum"
)]
const fn wire_size(len: usize) -> u32 { len as u32 }

/// Errors raised while splitting the byte stream into frames.
#[derive(Debug, Error)]
pub enum FrameError {
    /// A frame exceeded the negotiated maximum size.
    #[error("frame of {size} bytes exceeds maximum frame size {max}")]
    Oversized {
        /// Declared frame size.
        size: u32,
        /// Negotiated maximum.
        max: u32,
    },
    /// A frame declared a size smaller than its own header.
    #[error("invalid frame size {0}")]
    InvalidSize(u32),
    /// A frame declared a data offset inside the fixed header or past its end.
    #[error("invalid data offset {0}")]
    InvalidDataOffset(u8),
    /// I/O error from an underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Tokio codec for AMQP frames.
#[derive(Debug)]
pub struct FrameCodec {
    max_frame_size: u32,
}

impl Default for FrameCodec {
    fn default() -> Self { Self::new(u32::MAX) }
}

impl FrameCodec {
    /// Create a codec accepting frames up to `max_frame_size` bytes.
    #[must_use]
    pub const fn new(max_frame_size: u32) -> Self { Self { max_frame_size } }

    /// Current maximum frame size.
    #[must_use]
    pub const fn max_frame_size(&self) -> u32 { self.max_frame_size }

    /// Change the maximum once negotiated.
    pub const fn set_max_frame_size(&mut self, max: u32) { self.max_frame_size = max; }
}

impl Decoder for FrameCodec {
    type Error = FrameError;
    type Item = RawFrame;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(raw) = src.get(..FRAME_HEADER_LEN) else {
            return Ok(None);
        };
        let mut header_bytes = [0u8; FRAME_HEADER_LEN];
        header_bytes.copy_from_slice(raw);
        let header = FrameHeader::from_bytes(&header_bytes);

        if (header.size as usize) < FRAME_HEADER_LEN {
            return Err(FrameError::InvalidSize(header.size));
        }
        if header.size > self.max_frame_size {
            return Err(FrameError::Oversized {
                size: header.size,
                max: self.max_frame_size,
            });
        }
        let body_offset = usize::from(header.doff) * 4;
        if header.doff < DEFAULT_DOFF || body_offset > header.size as usize {
            return Err(FrameError::InvalidDataOffset(header.doff));
        }

        let frame_len = header.size as usize;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(frame_len);
        frame.advance(body_offset);
        Ok(Some(RawFrame {
            channel: header.channel,
            frame_type: header.frame_type,
            body: frame.freeze(),
        }))
    }
}

impl Encoder<RawFrame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: RawFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let size = wire_size(item.wire_len());
        if size > self.max_frame_size {
            return Err(FrameError::Oversized {
                size,
                max: self.max_frame_size,
            });
        }
        dst.reserve(item.wire_len());
        item.write_to(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::codec::performative::{Close, Open};

    fn decode_one(codec: &mut FrameCodec, bytes: &[u8]) -> Result<Option<RawFrame>, FrameError> {
        let mut buf = BytesMut::from(bytes);
        codec.decode(&mut buf)
    }

    #[test]
    fn heartbeat_is_eight_bytes() {
        assert_eq!(
            RawFrame::heartbeat().to_bytes().as_ref(),
            &[0, 0, 0, 8, 2, 0, 0, 0]
        );
    }

    #[test]
    fn encoded_frame_decodes_back() {
        let frame = RawFrame::performative(3, &Performative::Open(Open::new("peer")), &[]);
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        assert!(codec.encode(frame.clone(), &mut buf).is_ok());
        let decoded = codec.decode(&mut buf);
        assert!(matches!(decoded, Ok(Some(ref f)) if *f == frame));
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let bytes = RawFrame::performative(0, &Performative::Close(Close::default()), &[]).to_bytes();
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(bytes.get(..bytes.len() - 1).unwrap_or_default());
        assert!(matches!(codec.decode(&mut buf), Ok(None)));
        buf.put_slice(bytes.get(bytes.len() - 1..).unwrap_or_default());
        assert!(matches!(codec.decode(&mut buf), Ok(Some(_))));
    }

    #[test]
    fn extended_header_is_skipped() {
        let mut codec = FrameCodec::default();
        let bytes = [0, 0, 0, 12, 3, 0, 0, 1, 0xaa, 0xbb, 0xcc, 0xdd];
        let frame = decode_one(&mut codec, &bytes);
        assert!(matches!(frame, Ok(Some(ref f)) if f.channel == 1 && f.is_heartbeat()));
    }

    #[rstest]
    #[case(&[0, 0, 0, 4, 2, 0, 0, 0])]
    #[case(&[0, 0, 0, 8, 1, 0, 0, 0])]
    #[case(&[0, 0, 0, 8, 3, 0, 0, 0])]
    fn malformed_headers_are_rejected(#[case] bytes: &[u8]) {
        assert!(decode_one(&mut FrameCodec::default(), bytes).is_err());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut codec = FrameCodec::new(512);
        let result = decode_one(&mut codec, &[0, 0, 2, 1, 2, 0, 0, 0]);
        assert!(matches!(result, Err(FrameError::Oversized { size: 513, max: 512 })));
    }

    #[test]
    fn payload_after_close_is_rejected() {
        let frame = RawFrame::performative(0, &Performative::Close(Close::default()), b"x");
        assert_eq!(
            frame.decode_body().err(),
            Some(DecodeError::UnexpectedPayload("Close"))
        );
    }
}
