//! Message envelopes: `flags(1) len(4 BE) payload(len)`.
//!
//! Connect streaming, gRPC and gRPC-Web all frame messages this way. They
//! differ only in which flag bit marks the final, end-of-stream message.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the envelope prefix.
pub const PREFIX_LEN: usize = 5;

/// Payload is compressed with the negotiated encoding.
pub const FLAG_COMPRESSED: u8 = 0x01;
/// Connect streaming end-of-stream message.
pub const FLAG_CONNECT_END_STREAM: u8 = 0x02;
/// gRPC-Web trailers message.
pub const FLAG_GRPC_WEB_TRAILERS: u8 = 0x80;
/// Either end-of-stream marker.
pub const END_STREAM_MASK: u8 = FLAG_CONNECT_END_STREAM | FLAG_GRPC_WEB_TRAILERS;

/// A parsed envelope prefix.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Envelope {
    pub flags: u8,
    pub len: u32,
}

impl Envelope {
    pub fn parse(prefix: [u8; PREFIX_LEN]) -> Self {
        Envelope {
            flags: prefix[0],
            len: u32::from_be_bytes([prefix[1], prefix[2], prefix[3], prefix[4]]),
        }
    }

    pub fn to_bytes(self) -> [u8; PREFIX_LEN] {
        let len = self.len.to_be_bytes();
        [self.flags, len[0], len[1], len[2], len[3]]
    }

    pub fn is_compressed(self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    pub fn is_end_stream(self) -> bool {
        self.flags & END_STREAM_MASK != 0
    }
}

/// Frame `payload` with the given flags.
pub fn encode(flags: u8, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(PREFIX_LEN + payload.len());
    buf.put_u8(flags);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// A complete message pulled from a [`FrameBuffer`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub flags: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn envelope(&self) -> Envelope {
        Envelope {
            flags: self.flags,
            len: self.payload.len() as u32,
        }
    }
}

/// Error from a [`FrameBuffer`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("message size {size} is larger than configured max {max}")]
    TooLarge { size: u32, max: u32 },

    #[error("protocol error: incomplete envelope: {remaining} trailing bytes")]
    Incomplete { remaining: usize },
}

/// Accumulates body chunks and yields complete envelopes.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
    max_size: Option<u32>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject messages whose declared length exceeds `max`.
    pub fn with_max_size(max: u32) -> Self {
        FrameBuffer {
            buf: BytesMut::new(),
            max_size: (max > 0).then_some(max),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.buf.len() < PREFIX_LEN {
            return Ok(None);
        }
        let mut prefix = [0u8; PREFIX_LEN];
        prefix.copy_from_slice(&self.buf[..PREFIX_LEN]);
        let env = Envelope::parse(prefix);
        if let Some(max) = self.max_size
            && env.len > max
            && !env.is_end_stream()
        {
            return Err(FrameError::TooLarge { size: env.len, max });
        }
        let total = PREFIX_LEN + env.len as usize;
        if self.buf.len() < total {
            return Ok(None);
        }
        self.buf.advance(PREFIX_LEN);
        let payload = self.buf.split_to(env.len as usize).freeze();
        Ok(Some(Frame {
            flags: env.flags,
            payload,
        }))
    }

    /// Call once the body has ended; leftover bytes are a framing error.
    pub fn finish(&self) -> Result<(), FrameError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(FrameError::Incomplete {
                remaining: self.buf.len(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_layout() {
        let env = Envelope {
            flags: FLAG_CONNECT_END_STREAM,
            len: 0x0102_0304,
        };
        assert_eq!(env.to_bytes(), [2, 1, 2, 3, 4]);
        assert_eq!(Envelope::parse(env.to_bytes()), env);
        assert!(env.is_end_stream());
        assert!(!env.is_compressed());
    }

    #[test]
    fn grpc_web_trailer_flag_is_end_stream() {
        let env = Envelope {
            flags: FLAG_GRPC_WEB_TRAILERS | FLAG_COMPRESSED,
            len: 0,
        };
        assert!(env.is_end_stream());
        assert!(env.is_compressed());
    }

    #[test]
    fn frames_split_across_chunks() {
        let mut wire = encode(0, b"hello").to_vec();
        wire.extend_from_slice(&encode(FLAG_CONNECT_END_STREAM, b"{}"));

        let mut frames = FrameBuffer::new();
        frames.push(&wire[..3]);
        assert_eq!(frames.next_frame().unwrap(), None);
        frames.push(&wire[3..8]);
        assert_eq!(frames.next_frame().unwrap(), None);
        frames.push(&wire[8..]);

        let first = frames.next_frame().unwrap().unwrap();
        assert_eq!(first.payload.as_ref(), b"hello");
        let second = frames.next_frame().unwrap().unwrap();
        assert_eq!(second.flags, FLAG_CONNECT_END_STREAM);
        assert_eq!(second.payload.as_ref(), b"{}");
        assert_eq!(frames.next_frame().unwrap(), None);
        frames.finish().unwrap();
    }

    #[test]
    fn oversized_message_rejected_before_payload_arrives() {
        let mut frames = FrameBuffer::with_max_size(4);
        frames.push(&[0, 0, 0, 0, 5]);
        assert_eq!(
            frames.next_frame(),
            Err(FrameError::TooLarge { size: 5, max: 4 })
        );
    }

    #[test]
    fn leftover_bytes_are_incomplete() {
        let mut frames = FrameBuffer::new();
        frames.push(&[0, 0, 0]);
        assert_eq!(
            frames.finish(),
            Err(FrameError::Incomplete { remaining: 3 })
        );
    }
}
