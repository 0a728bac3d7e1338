//! Frame codec for the socket and pipe modes
//!
//! Every frame is length-delimited and carries `[u64 id][u8 kind][payload]`.
//! The id pairs a response with its request; ids are never reused on one
//! connection.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Largest accepted frame, header included.
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

const HEADER_LEN: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Object bytes (request) or transformed bytes (response)
    Data = 0,
    Ping = 1,
    Pong = 2,
    /// Transform failed on the pod; payload is a UTF-8 message
    Error = 3,
}

impl TryFrom<u8> for FrameKind {
    type Error = io::Error;

    fn try_from(value: u8) -> Result<Self, io::Error> {
        match value {
            0 => Ok(FrameKind::Data),
            1 => Ok(FrameKind::Ping),
            2 => Ok(FrameKind::Pong),
            3 => Ok(FrameKind::Error),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown frame kind {}", other),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: u64,
    pub kind: FrameKind,
    pub payload: Bytes,
}

impl Frame {
    pub fn data(id: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            kind: FrameKind::Data,
            payload: payload.into(),
        }
    }

    pub fn error(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            kind: FrameKind::Error,
            payload: Bytes::from(message.into()),
        }
    }

    pub fn ping(id: u64) -> Self {
        Self {
            id,
            kind: FrameKind::Ping,
            payload: Bytes::new(),
        }
    }

    pub fn pong(id: u64) -> Self {
        Self {
            id,
            kind: FrameKind::Pong,
            payload: Bytes::new(),
        }
    }
}

#[derive(Debug)]
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_LEN)
                .new_codec(),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        let Some(mut buf) = self.inner.decode(src)? else {
            return Ok(None);
        };
        if buf.len() < HEADER_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {} bytes is shorter than its header", buf.len()),
            ));
        }
        let id = buf.get_u64();
        let kind = FrameKind::try_from(buf.get_u8())?;
        Ok(Some(Frame {
            id,
            kind,
            payload: buf.freeze(),
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), io::Error> {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + frame.payload.len());
        buf.put_u64(frame.id);
        buf.put_u8(frame.kind as u8);
        buf.put_slice(&frame.payload);
        self.inner.encode(buf.freeze(), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_waits_for_full_frame() {
        let mut codec = FrameCodec::new();
        let mut wire = BytesMut::new();
        codec.encode(Frame::data(7, "hello"), &mut wire).unwrap();

        let mut partial = wire.split_to(6);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.unsplit(wire);
        let frame = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(frame, Frame::data(7, "hello"));
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut codec = FrameCodec::new();
        let mut wire = BytesMut::new();
        codec.encode(Frame::ping(1), &mut wire).unwrap();
        codec.encode(Frame::error(2, "boom"), &mut wire).unwrap();

        assert_eq!(codec.decode(&mut wire).unwrap().unwrap().kind, FrameKind::Ping);
        let err = codec.decode(&mut wire).unwrap().unwrap();
        assert_eq!((err.id, err.kind), (2, FrameKind::Error));
        assert_eq!(&err.payload[..], b"boom");
    }

    #[test]
    fn test_short_frame_is_malformed() {
        let mut inner = LengthDelimitedCodec::new();
        let mut wire = BytesMut::new();
        inner.encode(Bytes::from_static(b"abc"), &mut wire).unwrap();

        let err = FrameCodec::new().decode(&mut wire).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_unknown_kind_is_malformed() {
        let mut inner = LengthDelimitedCodec::new();
        let mut wire = BytesMut::new();
        let mut body = BytesMut::new();
        body.put_u64(1);
        body.put_u8(42);
        inner.encode(body.freeze(), &mut wire).unwrap();

        assert!(FrameCodec::new().decode(&mut wire).is_err());
    }
}
