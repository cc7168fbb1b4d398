//! Tokio codec for length-prefixed stream frames
//!
//! Used on the unix-socket transport. Each frame is a 4-byte length in the
//! host's native byte order (the controller runs on the same machine)
//! followed by that many bytes of JSON.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;

/// Size of the length prefix in bytes
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Maximum frame body size (64 MiB)
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Codec for encoding/decoding length-prefixed frames
#[derive(Debug, Default)]
pub struct FrameCodec {
    /// Length of the frame being decoded, once its prefix has been read
    pending_length: Option<usize>,
}

impl FrameCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self {
            pending_length: None,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let length = match self.pending_length.take() {
            Some(length) => length,
            None => {
                if src.len() < LENGTH_PREFIX_SIZE {
                    return Ok(None);
                }
                src.get_u32_ne() as usize
            }
        };

        if length > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                max: MAX_FRAME_SIZE,
            });
        }

        if src.len() < length {
            self.pending_length = Some(length);
            src.reserve(length - src.len());
            return Ok(None);
        }

        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, body: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if body.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: body.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        dst.reserve(LENGTH_PREFIX_SIZE + body.len());
        dst.put_u32_ne(body.len() as u32);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_is_native_endian() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"{}"), &mut buf).unwrap();

        assert_eq!(&buf[..LENGTH_PREFIX_SIZE], &2u32.to_ne_bytes());
        assert_eq!(&buf[LENGTH_PREFIX_SIZE..], b"{}");
    }

    #[test]
    fn test_partial_read() {
        let mut codec = FrameCodec::new();
        let body = Bytes::from_static(br#"{"kind":"request","module":"about","action":"get"}"#);

        let mut full = BytesMut::new();
        codec.encode(body.clone(), &mut full).unwrap();

        // Prefix split in half
        let mut partial = full.split_to(2);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&full.split_to(10));

        // Prefix complete, body still short
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&full);

        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded, body);
        assert!(partial.is_empty());
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"one"), &mut buf).unwrap();
        codec.encode(Bytes::from_static(b"two"), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "one");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "two");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32_ne((MAX_FRAME_SIZE + 1) as u32);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }
}
