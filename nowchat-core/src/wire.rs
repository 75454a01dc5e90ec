//! Framing: one fixed 250-byte packed little-endian frame per radio packet.
//!
//! ```text
//! off  len  field
//!   0    1  type
//!   1    1  version
//!   2    4  unix timestamp (LE)
//!   6   16  sender device id (NUL-padded)
//!  22   16  sender display name (NUL-padded)
//!  38    1  channel
//!  39   16  target device id (NUL-padded, DIRECT only)
//!  55    2  payload length (LE)
//!  57  161  payload (NUL-padded)
//! 218   32  HMAC-SHA256 over bytes 0..218
//! ```

use crate::protocol::{
    MessageType, FRAME_SIZE, ID_FIELD_SIZE, MAX_PAYLOAD, PROTOCOL_VERSION, TAGGED_LEN, TAG_SIZE,
};
use crate::security::{FrameVerifier, SecurityError, TagCheck};
use crate::text::{self, DeviceId, DisplayName};

const OFF_TYPE: usize = 0;
const OFF_VERSION: usize = 1;
const OFF_TIMESTAMP: usize = 2;
const OFF_SENDER_ID: usize = 6;
const OFF_SENDER_NAME: usize = OFF_SENDER_ID + ID_FIELD_SIZE;
const OFF_CHANNEL: usize = OFF_SENDER_NAME + ID_FIELD_SIZE;
const OFF_TARGET_ID: usize = OFF_CHANNEL + 1;
const OFF_PAYLOAD_LEN: usize = OFF_TARGET_ID + ID_FIELD_SIZE;
const OFF_PAYLOAD: usize = OFF_PAYLOAD_LEN + 2;
const OFF_TAG: usize = OFF_PAYLOAD + MAX_PAYLOAD;

/// One decoded frame. Only produced by `decode_verified` (tag already checked) or by
/// `seal` (tag freshly computed).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrame {
    pub msg_type: MessageType,
    pub version: u8,
    pub timestamp: u32,
    pub sender_id: DeviceId,
    pub sender_name: DisplayName,
    pub channel: u8,
    pub target_id: Option<DeviceId>,
    pub payload: heapless::Vec<u8, MAX_PAYLOAD>,
    pub tag: [u8; TAG_SIZE],
}

impl WireFrame {
    /// Unsealed frame with `content` cut to the payload ceiling on a character boundary.
    pub fn new(
        msg_type: MessageType,
        timestamp: u32,
        sender_id: &str,
        sender_name: &str,
        channel: u8,
        target_id: Option<&str>,
        content: &str,
    ) -> Self {
        let content = text::truncate_to(content, MAX_PAYLOAD);
        let mut payload = heapless::Vec::new();
        // Cannot fail: truncated to capacity above.
        let _ = payload.extend_from_slice(content.as_bytes());
        Self {
            msg_type,
            version: PROTOCOL_VERSION,
            timestamp,
            sender_id: text::bounded(sender_id),
            sender_name: text::bounded(sender_name),
            channel,
            target_id: target_id.map(text::bounded),
            payload,
            tag: [0u8; TAG_SIZE],
        }
    }

    /// Payload as text. Invalid UTF-8 from the air is replaced, not rejected.
    pub fn content(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Serialize every field, including the current tag.
    pub fn encode(&self) -> [u8; FRAME_SIZE] {
        let mut out = [0u8; FRAME_SIZE];
        out[OFF_TYPE] = self.msg_type.into();
        out[OFF_VERSION] = self.version;
        out[OFF_TIMESTAMP..OFF_SENDER_ID].copy_from_slice(&self.timestamp.to_le_bytes());
        text::write_padded(&mut out[OFF_SENDER_ID..OFF_SENDER_NAME], &self.sender_id);
        text::write_padded(&mut out[OFF_SENDER_NAME..OFF_CHANNEL], &self.sender_name);
        out[OFF_CHANNEL] = self.channel;
        if let Some(target) = &self.target_id {
            text::write_padded(&mut out[OFF_TARGET_ID..OFF_PAYLOAD_LEN], target);
        }
        let len = self.payload.len() as u16;
        out[OFF_PAYLOAD_LEN..OFF_PAYLOAD].copy_from_slice(&len.to_le_bytes());
        out[OFF_PAYLOAD..OFF_PAYLOAD + self.payload.len()].copy_from_slice(&self.payload);
        out[OFF_TAG..].copy_from_slice(&self.tag);
        out
    }

    /// Compute the tag over every other byte and return the finished wire bytes.
    pub fn seal(&mut self, verifier: &FrameVerifier) -> Result<[u8; FRAME_SIZE], SecurityError> {
        let mut bytes = self.encode();
        self.tag = verifier.generate_tag(&bytes[..TAGGED_LEN])?;
        bytes[OFF_TAG..].copy_from_slice(&self.tag);
        Ok(bytes)
    }
}

/// Decode a received frame. Checks run in a fixed order and nothing past the version
/// byte is read until the tag has validated.
pub fn decode_verified(bytes: &[u8], verifier: &FrameVerifier) -> Result<WireFrame, FrameError> {
    decode_with_generation(bytes, verifier).map(|(frame, _)| frame)
}

/// As [`decode_verified`], also returning the key generation the tag was checked under.
pub(crate) fn decode_with_generation(
    bytes: &[u8],
    verifier: &FrameVerifier,
) -> Result<(WireFrame, u64), FrameError> {
    if bytes.len() != FRAME_SIZE {
        return Err(FrameError::Length { got: bytes.len() });
    }
    let version = bytes[OFF_VERSION];
    if version != PROTOCOL_VERSION {
        return Err(FrameError::Version { got: version });
    }
    let generation = match verifier.check_tag(&bytes[..TAGGED_LEN], &bytes[OFF_TAG..]) {
        TagCheck::Valid { generation } => generation,
        TagCheck::Invalid => return Err(FrameError::Authentication),
        TagCheck::Busy => return Err(FrameError::KeyBusy),
    };

    let msg_type = MessageType::try_from(bytes[OFF_TYPE]).map_err(FrameError::UnknownType)?;
    let len = u16::from_le_bytes([bytes[OFF_PAYLOAD_LEN], bytes[OFF_PAYLOAD_LEN + 1]]) as usize;
    if len > MAX_PAYLOAD {
        return Err(FrameError::PayloadLength { len });
    }
    // The length field must describe the payload exactly: padding after it is all zero.
    if bytes[OFF_PAYLOAD + len..OFF_TAG].iter().any(|&b| b != 0) {
        return Err(FrameError::PayloadLength { len });
    }
    let mut payload = heapless::Vec::new();
    let _ = payload.extend_from_slice(&bytes[OFF_PAYLOAD..OFF_PAYLOAD + len]);

    let target: DeviceId = text::read_padded(&bytes[OFF_TARGET_ID..OFF_PAYLOAD_LEN]);
    let mut tag = [0u8; TAG_SIZE];
    tag.copy_from_slice(&bytes[OFF_TAG..]);

    let frame = WireFrame {
        msg_type,
        version,
        timestamp: u32::from_le_bytes([
            bytes[OFF_TIMESTAMP],
            bytes[OFF_TIMESTAMP + 1],
            bytes[OFF_TIMESTAMP + 2],
            bytes[OFF_TIMESTAMP + 3],
        ]),
        sender_id: text::read_padded(&bytes[OFF_SENDER_ID..OFF_SENDER_NAME]),
        sender_name: text::read_padded(&bytes[OFF_SENDER_NAME..OFF_CHANNEL]),
        channel: bytes[OFF_CHANNEL],
        target_id: (!target.is_empty()).then_some(target),
        payload,
        tag,
    };
    Ok((frame, generation))
}

/// Why a received frame was dropped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame is {got} bytes, expected 250")]
    Length { got: usize },
    #[error("protocol version {got} not supported")]
    Version { got: u8 },
    #[error("authentication tag mismatch")]
    Authentication,
    #[error("unknown message type {0:#04x}")]
    UnknownType(u8),
    #[error("malformed payload length {len}")]
    PayloadLength { len: usize },
    #[error("message type not accepted over the air")]
    Unsupported,
    #[error("network key is being replaced")]
    KeyBusy,
}
