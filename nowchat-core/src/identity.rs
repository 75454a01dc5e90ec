//! Device identity: stable device id and display name, derived from the link address.

use crate::link::LinkAddress;
use crate::text::{self, DeviceId, DisplayName};

/// Who this device is on the wire. Stable per device; the host persists it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    device_id: DeviceId,
    display_name: DisplayName,
}

impl DeviceIdentity {
    /// Both fields are truncated to 15 bytes.
    pub fn new(device_id: &str, display_name: &str) -> Self {
        Self {
            device_id: text::bounded(device_id),
            display_name: text::bounded(display_name),
        }
    }

    /// Derive identity from the radio's address: `LAB` + last four address bytes in hex,
    /// with the default `User<n>` display name.
    pub fn from_link_address(address: &LinkAddress) -> Self {
        let device_id = device_id_from_address(address);
        let display_name = default_display_name(&device_id);
        Self {
            device_id: text::bounded(&device_id),
            display_name: text::bounded(&display_name),
        }
    }

    pub fn device_id(&self) -> &str {
        self.device_id.as_str()
    }

    pub fn display_name(&self) -> &str {
        self.display_name.as_str()
    }

    /// Replace the display name. Empty names fall back to the default one.
    pub fn set_display_name(&mut self, name: &str) {
        let name = name.trim();
        self.display_name = if name.is_empty() {
            text::bounded(&default_display_name(self.device_id()))
        } else {
            text::bounded(name)
        };
    }
}

/// `LAB` followed by the last four address bytes as upper-case hex.
pub fn device_id_from_address(address: &LinkAddress) -> String {
    let b = address.as_bytes();
    format!("LAB{:02X}{:02X}{:02X}{:02X}", b[2], b[3], b[4], b[5])
}

/// `User<n>`: each of the last four id characters contributes `byte % 10` as a decimal digit.
pub fn default_display_name(device_id: &str) -> String {
    let bytes = device_id.as_bytes();
    let mut num: u32 = 0;
    if bytes.len() >= 4 {
        for &b in &bytes[bytes.len() - 4..] {
            num = num * 10 + u32::from(b % 10);
        }
    }
    format!("User{}", num % 10_000)
}
