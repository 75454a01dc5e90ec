//! Radio link seam: link-layer addresses and the unreliable send interface the host provides.

use std::fmt;
use std::str::FromStr;

use rand::RngCore;

/// 6-byte link-layer address. Peers are keyed by this; the link routes by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkAddress(pub [u8; 6]);

impl LinkAddress {
    /// Reserved address every station in range receives.
    pub const BROADCAST: LinkAddress = LinkAddress([0xFF; 6]);

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Random unicast address with the locally-administered bit set.
    pub fn random_local() -> Self {
        let mut bytes = [0u8; 6];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes[0] = (bytes[0] & 0xFE) | 0x02;
        LinkAddress(bytes)
    }
}

impl fmt::Display for LinkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid link address: {0}")]
pub struct ParseAddressError(String);

impl FromStr for LinkAddress {
    type Err = ParseAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 6];
        let mut parts = s.split(|c| c == ':' || c == '-');
        for byte in out.iter_mut() {
            let part = parts.next().ok_or_else(|| ParseAddressError(s.to_string()))?;
            if part.len() != 2 {
                return Err(ParseAddressError(s.to_string()));
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| ParseAddressError(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(ParseAddressError(s.to_string()));
        }
        Ok(LinkAddress(out))
    }
}

/// Unreliable, connectionless link with a fixed MTU (one frame).
///
/// Implemented by the host. `send` must not block for long: it is called from the
/// application loop. Receiving is not part of this trait; the host's receive callback
/// feeds a [`crate::inbound::ReceiveHandle`] instead.
pub trait RadioLink {
    /// Transmit one frame. Returns false if the link refused it (busy, unreachable).
    fn send(&mut self, address: &LinkAddress, frame: &[u8]) -> bool;

    /// Register a peer for encrypted unicast, where the link supports it.
    fn add_peer(&mut self, _address: &LinkAddress, _link_key: Option<&[u8; 16]>) -> bool {
        true
    }

    /// Forget a peer registered with `add_peer`.
    fn remove_peer(&mut self, _address: &LinkAddress) -> bool {
        true
    }
}

/// In-memory link that records every frame for tests.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingLink {
    pub sent: Vec<(LinkAddress, Vec<u8>)>,
    pub registered: Vec<LinkAddress>,
    pub fail_sends: bool,
}

#[cfg(test)]
impl RadioLink for RecordingLink {
    fn send(&mut self, address: &LinkAddress, frame: &[u8]) -> bool {
        if self.fail_sends {
            return false;
        }
        self.sent.push((*address, frame.to_vec()));
        true
    }

    fn add_peer(&mut self, address: &LinkAddress, _link_key: Option<&[u8; 16]>) -> bool {
        self.registered.push(*address);
        true
    }

    fn remove_peer(&mut self, address: &LinkAddress) -> bool {
        self.registered.retain(|a| a != address);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_parse_roundtrip() {
        let addr = LinkAddress([0x02, 0xAB, 0x00, 0x10, 0xFE, 0x7C]);
        let s = addr.to_string();
        assert_eq!(s, "02:AB:00:10:FE:7C");
        assert_eq!(s.parse::<LinkAddress>().unwrap(), addr);
        assert_eq!("02-ab-00-10-fe-7c".parse::<LinkAddress>().unwrap(), addr);
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!("02:AB:00:10:FE".parse::<LinkAddress>().is_err());
        assert!("02:AB:00:10:FE:7C:00".parse::<LinkAddress>().is_err());
        assert!("02:AB:00:10:FE:ZZ".parse::<LinkAddress>().is_err());
        assert!("2:AB:00:10:FE:7C".parse::<LinkAddress>().is_err());
    }

    #[test]
    fn random_local_is_unicast_and_local() {
        for _ in 0..16 {
            let addr = LinkAddress::random_local();
            assert_eq!(addr.0[0] & 0x01, 0);
            assert_eq!(addr.0[0] & 0x02, 0x02);
            assert!(!addr.is_broadcast());
        }
    }
}
