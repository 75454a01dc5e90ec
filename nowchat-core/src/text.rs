//! Fixed-capacity text used by the wire contract. Truncation limits here are part of the frame format.

use crate::protocol::{DEVICE_ID_LEN, DISPLAY_NAME_LEN, ROOM_TAG_LEN};

/// Device id as carried on the wire (at most 15 bytes).
pub type DeviceId = heapless::String<DEVICE_ID_LEN>;

/// Display name as carried on the wire (at most 15 bytes).
pub type DisplayName = heapless::String<DISPLAY_NAME_LEN>;

/// Room / network name (at most 31 bytes).
pub type RoomTag = heapless::String<ROOM_TAG_LEN>;

/// Copy `s` into a bounded string, dropping whatever does not fit.
/// Cuts on a character boundary, so the result is always valid UTF-8.
pub fn bounded<const N: usize>(s: &str) -> heapless::String<N> {
    let mut out = heapless::String::new();
    for c in s.chars() {
        if out.push(c).is_err() {
            break;
        }
    }
    out
}

/// Longest prefix of `s` that fits in `max` bytes without splitting a character.
pub fn truncate_to(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Read a NUL-padded field: stop at the first NUL, keep at most `N` bytes.
pub fn read_padded<const N: usize>(field: &[u8]) -> heapless::String<N> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    bounded(&String::from_utf8_lossy(&field[..end]))
}

/// Write `s` into a zeroed, NUL-padded field. `s` must leave room for the terminator.
pub fn write_padded(field: &mut [u8], s: &str) {
    let n = s.len().min(field.len().saturating_sub(1));
    field[..n].copy_from_slice(&s.as_bytes()[..n]);
}
