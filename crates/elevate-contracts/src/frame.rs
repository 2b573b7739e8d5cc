//! Length-prefixed frame codec.
//!
//! Wire layout of one frame:
//!
//! ```text
//! +----------------+-----------+--------------------+----------------+
//! | length (u32 LE)| type (u8) | correlation (u64 LE)| JSON payload  |
//! +----------------+-----------+--------------------+----------------+
//! ```
//!
//! `length` counts every byte after itself. Frames whose length exceeds the
//! codec limit are rejected before the body is buffered.

use crate::error::{ProtocolError, ProtocolResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Message frame: [4 bytes length LE][1 byte type][8 bytes correlation LE][JSON payload]
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Bytes between the length prefix and the payload.
pub const HEADER_SIZE: usize = 1 + 8;

const LENGTH_PREFIX_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    HandshakeRequest = 1,
    HandshakeResponse = 2,
    ActionRequest = 3,
    Progress = 4,
    Reply = 5,
    Cancel = 6,
    StatusChanged = 7,
}

impl MessageType {
    pub fn name(self) -> &'static str {
        match self {
            Self::HandshakeRequest => "handshake request",
            Self::HandshakeResponse => "handshake response",
            Self::ActionRequest => "action request",
            Self::Progress => "progress",
            Self::Reply => "reply",
            Self::Cancel => "cancel",
            Self::StatusChanged => "status changed",
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> ProtocolResult<Self> {
        Ok(match value {
            1 => Self::HandshakeRequest,
            2 => Self::HandshakeResponse,
            3 => Self::ActionRequest,
            4 => Self::Progress,
            5 => Self::Reply,
            6 => Self::Cancel,
            7 => Self::StatusChanged,
            other => return Err(ProtocolError::UnknownMessageType(other)),
        })
    }
}

/// One decoded frame with an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message_type: MessageType,
    pub correlation_id: u64,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(message_type: MessageType, correlation_id: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            message_type,
            correlation_id,
            payload: payload.into(),
        }
    }

    /// Bytes after the length prefix.
    pub fn body_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Fails with `FrameTooLarge` for frames this codec refuses to encode.
    pub fn check(&self, frame: &Frame) -> ProtocolResult<()> {
        let size = frame.body_len();
        if size > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            });
        }
        Ok(())
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> ProtocolResult<Option<Frame>> {
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let len = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }
        if len < HEADER_SIZE {
            return Err(ProtocolError::TruncatedFrame(HEADER_SIZE));
        }

        let total = LENGTH_PREFIX_SIZE + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_SIZE);
        let mut body = src.split_to(len);
        let message_type = MessageType::try_from(body.get_u8())?;
        let correlation_id = body.get_u64_le();

        Ok(Some(Frame {
            message_type,
            correlation_id,
            payload: body.freeze(),
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> ProtocolResult<()> {
        self.check(&frame)?;
        let len = frame.body_len();

        dst.reserve(LENGTH_PREFIX_SIZE + len);
        dst.put_u32_le(len as u32);
        dst.put_u8(frame.message_type as u8);
        dst.put_u64_le(frame.correlation_id);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(frame: Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec::new().encode(frame, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_header_layout() {
        let buf = encode(Frame::new(MessageType::Cancel, 7, Bytes::from_static(b"{}")));

        assert_eq!(&buf[..4], &(11u32).to_le_bytes());
        assert_eq!(buf[4], MessageType::Cancel as u8);
        assert_eq!(&buf[5..13], &7u64.to_le_bytes());
        assert_eq!(&buf[13..], b"{}");
    }

    #[test]
    fn test_partial_frames_wait_for_more_bytes() {
        let frame = Frame::new(MessageType::Progress, 3, Bytes::from_static(b"{\"percent\":5}"));
        let full = encode(frame.clone());
        let mut codec = FrameCodec::new();

        let mut partial = BytesMut::from(&full[..6]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full[6..]);
        assert_eq!(codec.decode(&mut partial).unwrap(), Some(frame));
        assert!(partial.is_empty());
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let first = Frame::new(MessageType::Progress, 1, Bytes::from_static(b"1"));
        let second = Frame::new(MessageType::Reply, 1, Bytes::from_static(b"2"));
        let mut buf = encode(first.clone());
        buf.extend_from_slice(&encode(second.clone()));

        let mut codec = FrameCodec::new();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(first));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(second));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_oversized_frame_rejected_before_buffering() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(1024);
        let err = FrameCodec::with_max_frame_size(64).decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { size: 1024, max: 64 }));
    }

    #[test]
    fn test_unknown_message_type() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(HEADER_SIZE as u32);
        buf.put_u8(99);
        buf.put_u64_le(0);
        let err = FrameCodec::new().decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownMessageType(99)));
    }

    #[test]
    fn test_length_shorter_than_header() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(3);
        buf.extend_from_slice(&[0, 0, 0]);
        let err = FrameCodec::new().decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::TruncatedFrame(_)));
    }
}
