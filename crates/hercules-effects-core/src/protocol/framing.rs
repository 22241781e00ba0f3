//! Length-prefixed typed frame codec for worker stdio.
//!
//! Each frame is a 4-byte big-endian length prefix followed by the JSON
//! encoding of one message:
//!
//! ```text
//! +----------------------------+------------------+
//! | Length (4 bytes, BE)       | JSON payload     |
//! +----------------------------+------------------+
//! ```
//!
//! The announced length is validated against [`MAX_FRAME_SIZE`] before any
//! allocation, so a corrupt or hostile prefix cannot drive memory use.

use std::marker::PhantomData;

use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::codec::{Decoder, Encoder};

use super::error::{ProtocolError, MAX_FRAME_SIZE};

/// Length of the frame header.
const HEADER_LEN: usize = 4;

/// Codec turning an async byte stream into a stream of typed messages.
///
/// Used with [`tokio_util::codec::FramedRead`] /
/// [`tokio_util::codec::FramedWrite`] over a worker's stdio halves: the
/// controller reads `MessageCodec<Event>` and writes
/// `MessageCodec<Command>`, the worker the mirror image.
#[derive(Debug)]
pub struct MessageCodec<T> {
    /// Maximum accepted payload size.
    max_frame_size: usize,
    _message: PhantomData<fn() -> T>,
}

impl<T> MessageCodec<T> {
    /// Create a codec with the protocol-wide frame bound.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
            _message: PhantomData,
        }
    }

    /// Create a codec with a tighter frame bound.
    ///
    /// # Panics
    ///
    /// Panics if `max_size` exceeds [`MAX_FRAME_SIZE`].
    #[must_use]
    pub fn with_max_size(max_size: usize) -> Self {
        assert!(
            max_size <= MAX_FRAME_SIZE,
            "max_size {max_size} exceeds protocol limit {MAX_FRAME_SIZE}"
        );
        Self {
            max_frame_size: max_size,
            _message: PhantomData,
        }
    }
}

impl<T> Default for MessageCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for MessageCodec<T> {
    fn clone(&self) -> Self {
        Self {
            max_frame_size: self.max_frame_size,
            _message: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for MessageCodec<T> {
    type Item = T;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<T>, ProtocolError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        // Bound the read before reserving anything.
        if length > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                max: self.max_frame_size,
            });
        }

        let total_len = HEADER_LEN + length;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(length);

        Ok(Some(serde_json::from_slice(&payload)?))
    }
}

impl<T: Serialize> Encoder<T> for MessageCodec<T> {
    type Error = ProtocolError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let payload = serde_json::to_vec(&item)?;

        if payload.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: payload.len(),
                max: self.max_frame_size,
            });
        }

        dst.reserve(HEADER_LEN + payload.len());
        #[allow(clippy::cast_possible_truncation)] // Bounded above.
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::{Command, Event};

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut codec = MessageCodec::<Event>::new();
        let mut buf = BytesMut::new();

        codec.encode(Event::DaemonStarted, &mut buf).unwrap();

        // Wire format: 4-byte BE length, then the JSON payload.
        let payload_len = buf.len() - HEADER_LEN;
        assert_eq!(
            u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize,
            payload_len
        );

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Event::DaemonStarted);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_partial_header() {
        let mut codec = MessageCodec::<Event>::new();
        let mut buf = BytesMut::from(&[0u8, 0, 0][..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_decode_partial_payload() {
        let mut codec = MessageCodec::<Event>::new();
        // Header announces 10 bytes, only 5 present.
        let mut buf = BytesMut::from(&[0u8, 0, 0, 10, b'"', b'E', b'r', b'r', b'o'][..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 9);
    }

    #[test]
    fn test_decode_rejects_oversized_announcement() {
        let mut codec = MessageCodec::<Event>::new();
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        buf.extend_from_slice(&[0u8; 16]);

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::FrameTooLarge { size, max }
                if size == MAX_FRAME_SIZE + 1 && max == MAX_FRAME_SIZE
        ));
    }

    #[test]
    fn test_decode_rejects_garbage_payload() {
        let mut codec = MessageCodec::<Command>::new();
        let mut buf = BytesMut::new();
        buf.put_u32(4);
        buf.extend_from_slice(b"\x00\x01\x02\x03");

        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::Payload(_))
        ));
    }

    #[test]
    fn test_multiple_frames_decode_in_order() {
        let mut codec = MessageCodec::<Event>::new();
        let mut buf = BytesMut::new();

        codec
            .encode(Event::Error("first".to_string()), &mut buf)
            .unwrap();
        codec.encode(Event::EvaluationDone, &mut buf).unwrap();

        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap(),
            Event::Error("first".to_string())
        );
        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap(),
            Event::EvaluationDone
        );
        assert!(buf.is_empty());
    }

    #[test]
    #[should_panic(expected = "exceeds protocol limit")]
    fn test_with_max_size_rejects_excess() {
        let _ = MessageCodec::<Event>::with_max_size(MAX_FRAME_SIZE + 1);
    }
}
