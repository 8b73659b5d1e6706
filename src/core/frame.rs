use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{constants, ProtocolError, Result};

/// Size of the fixed frame header: message type + total length.
pub const HEADER_LEN: usize = 8;

/// Largest total length a frame may declare (1000 MiB).
pub const MAX_FRAME_LEN: u32 = 1024 * 1024 * 1000;

/// One complete protocol message.
///
/// The length field is never stored: it is always `8 + body.len()` and is
/// recomputed on every encode, so a frame can not carry an inconsistent length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: u32,
    pub body: Bytes,
}

impl Frame {
    pub fn new(msg_type: u32, body: impl Into<Bytes>) -> Self {
        Self {
            msg_type,
            body: body.into(),
        }
    }

    /// Frame with an empty body.
    pub fn empty(msg_type: u32) -> Self {
        Self {
            msg_type,
            body: Bytes::new(),
        }
    }

    /// Total wire length including the header.
    #[inline]
    pub fn length(&self) -> u32 {
        (HEADER_LEN + self.body.len()) as u32
    }

    /// Write header and body into `dst`.
    pub fn encode_into(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_LEN + self.body.len());
        dst.put_u32_le(self.msg_type);
        dst.put_u32_le(self.length());
        dst.extend_from_slice(&self.body);
    }

    /// Encode into a standalone payload ready for the outbound queue.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.body.len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Decode one complete message, e.g. a single WebSocket binary message.
    ///
    /// Everything after the header is the body; the declared length must
    /// cover at least the header and stay under the ceiling.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let (msg_type, _) = parse_header(data)?;
        Ok(Self {
            msg_type,
            body: Bytes::copy_from_slice(&data[HEADER_LEN..]),
        })
    }
}

/// Read and validate the 8-byte header at the start of `data`.
///
/// Returns the message type and the declared total length.
pub(crate) fn parse_header(data: &[u8]) -> Result<(u32, u32)> {
    if data.len() < HEADER_LEN {
        return Err(ProtocolError::MalformedFrame(
            constants::ERR_SHORT_HEADER.to_string(),
        ));
    }

    let msg_type = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    let length = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);

    if (length as usize) < HEADER_LEN {
        return Err(ProtocolError::MalformedFrame(
            constants::ERR_LENGTH_BELOW_HEADER.to_string(),
        ));
    }

    if length > MAX_FRAME_LEN {
        return Err(ProtocolError::MalformedFrame(format!(
            "declared length {length} exceeds {MAX_FRAME_LEN}"
        )));
    }

    Ok((msg_type, length))
}
