//! NowChat wire protocol: message types, version and frame geometry.

/// Current protocol version. Frames carrying any other version are dropped.
pub const PROTOCOL_VERSION: u8 = 1;

/// Total size of one frame on the air. Fixed by the radio's MTU.
pub const FRAME_SIZE: usize = 250;

/// Width of the NUL-padded device id and display name fields.
pub const ID_FIELD_SIZE: usize = 16;

/// Usable characters in a device id (one byte of the field stays NUL).
pub const DEVICE_ID_LEN: usize = ID_FIELD_SIZE - 1;

/// Usable characters in a display name.
pub const DISPLAY_NAME_LEN: usize = ID_FIELD_SIZE - 1;

/// Usable characters in a room tag.
pub const ROOM_TAG_LEN: usize = 31;

/// Payload ceiling per frame.
pub const MAX_PAYLOAD: usize = 161;

/// Authentication tag size (HMAC-SHA256).
pub const TAG_SIZE: usize = 32;

/// Bytes covered by the tag: everything except the tag itself.
pub const TAGGED_LEN: usize = FRAME_SIZE - TAG_SIZE;

/// Payload of a presence announcement.
pub const PRESENCE_PAYLOAD: &str = "online";

/// Payload of an authenticated knock.
pub const KNOCK_PAYLOAD: &str = "knock";

/// KNOCK_RESPONSE payloads.
pub const KNOCK_ALLOWED: &str = "allowed";
pub const KNOCK_DENIED: &str = "denied";

/// All frame types. Only a subset is carried in authenticated frames; see `is_transmittable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Broadcast = 0x01,
    Direct = 0x02,
    Channel = 0x03,
    /// Local only, never transmitted.
    System = 0x04,
    Presence = 0x05,
    /// Reserved. Blob transfer rides on text payloads instead.
    FileStart = 0x06,
    FileChunk = 0x07,
    FileEnd = 0x08,
    Knock = 0x09,
    KnockResponse = 0x0A,
    /// Unauthenticated discovery variant with its own, smaller frame.
    Beacon = 0x0B,
}

impl MessageType {
    /// Types this core builds into authenticated frames and accepts from the air.
    pub fn is_transmittable(self) -> bool {
        matches!(
            self,
            MessageType::Broadcast
                | MessageType::Direct
                | MessageType::Channel
                | MessageType::Presence
                | MessageType::Knock
                | MessageType::KnockResponse
        )
    }

    /// Types whose payload is user content (chat text or chunk sub-protocol).
    pub fn carries_content(self) -> bool {
        matches!(
            self,
            MessageType::Broadcast | MessageType::Direct | MessageType::Channel
        )
    }
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x01 => MessageType::Broadcast,
            0x02 => MessageType::Direct,
            0x03 => MessageType::Channel,
            0x04 => MessageType::System,
            0x05 => MessageType::Presence,
            0x06 => MessageType::FileStart,
            0x07 => MessageType::FileChunk,
            0x08 => MessageType::FileEnd,
            0x09 => MessageType::Knock,
            0x0A => MessageType::KnockResponse,
            0x0B => MessageType::Beacon,
            other => return Err(other),
        })
    }
}

impl From<MessageType> for u8 {
    fn from(t: MessageType) -> u8 {
        t as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_geometry_adds_up() {
        // type, version, timestamp, sender id, sender name, channel, target id, length, payload, tag
        let total = 1 + 1 + 4 + ID_FIELD_SIZE + ID_FIELD_SIZE + 1 + ID_FIELD_SIZE + 2 + MAX_PAYLOAD + TAG_SIZE;
        assert_eq!(total, FRAME_SIZE);
    }

    #[test]
    fn type_codes_match_wire_values() {
        for code in 0x01..=0x0Bu8 {
            let t = MessageType::try_from(code).unwrap();
            assert_eq!(u8::from(t), code);
        }
        assert_eq!(MessageType::try_from(0x00), Err(0x00));
        assert_eq!(MessageType::try_from(0x0C), Err(0x0C));
    }

    #[test]
    fn reserved_and_local_types_are_not_transmitted() {
        assert!(!MessageType::System.is_transmittable());
        assert!(!MessageType::FileChunk.is_transmittable());
        assert!(!MessageType::Beacon.is_transmittable());
        assert!(MessageType::Presence.is_transmittable());
        assert!(MessageType::KnockResponse.is_transmittable());
        assert!(!MessageType::Presence.carries_content());
    }
}
