use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::core::frame::{parse_header, Frame, HEADER_LEN};
use crate::error::{ProtocolError, Result};

/// Frame codec for byte-stream transports (TCP, pipes, in-memory duplex).
///
/// Decoding validates the declared length before reserving any space, so a
/// hostile header can not make the reader allocate the declared size.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let (msg_type, length) = parse_header(&src[..HEADER_LEN])?;
        let length = length as usize;

        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(length);
        frame.advance(HEADER_LEN);

        Ok(Some(Frame {
            msg_type,
            body: frame.freeze(),
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        frame.encode_into(dst);
        Ok(())
    }
}

/// Already-encoded payloads (from the outbound queue) pass through untouched.
impl Encoder<Bytes> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn test_partial_header_waits() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::from(&[1u8, 0, 0, 0, 12][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn test_partial_body_waits_then_completes() {
        let mut codec = FrameCodec;
        let encoded = Frame::new(3, vec![9u8; 16]).to_bytes();

        let mut buf = BytesMut::from(&encoded[..10]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&encoded[10..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.msg_type, 3);
        assert_eq!(frame.body.len(), 16);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(Frame::new(1, b"a".to_vec()), &mut buf).unwrap();
        codec.encode(Frame::new(2, b"bc".to_vec()), &mut buf).unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!((first.msg_type, &first.body[..]), (1, &b"a"[..]));
        assert_eq!((second.msg_type, &second.body[..]), (2, &b"bc"[..]));
    }

    #[test]
    fn test_oversized_header_does_not_reserve() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::with_capacity(16);
        buf.extend_from_slice(&5u32.to_le_bytes());
        buf.extend_from_slice(&u32::MAX.to_le_bytes());
        let capacity = buf.capacity();

        let result = codec.decode(&mut buf);
        assert!(matches!(result, Err(ProtocolError::MalformedFrame(_))));
        assert_eq!(buf.capacity(), capacity);
    }

    #[test]
    fn test_length_below_header_rejected() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&5u32.to_le_bytes());
        buf.extend_from_slice(&4u32.to_le_bytes());
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_encoded_bytes_pass_through() {
        let mut codec = FrameCodec;
        let payload = Frame::new(8, b"xyz".to_vec()).to_bytes();
        let mut buf = BytesMut::new();
        codec.encode(payload.clone(), &mut buf).unwrap();
        assert_eq!(&buf[..], &payload[..]);
    }
}
