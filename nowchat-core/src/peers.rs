//! Peer table: bounded set of remote devices keyed by link address.

use crate::link::LinkAddress;
use crate::text::{self, DeviceId, DisplayName, RoomTag};

/// Peers are rejected, not evicted, past this many.
pub const MAX_PEERS: usize = 10;

/// Peers not heard from for this long are swept.
pub const PEER_TIMEOUT_MS: u64 = 5 * 60 * 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub address: LinkAddress,
    pub device_id: DeviceId,
    pub display_name: DisplayName,
    pub room_tag: RoomTag,
    pub last_seen_ms: u64,
    pub active: bool,
    pub raw_signal: Option<i32>,
    pub smoothed_signal: Option<i32>,
}

/// What `add_or_update` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerUpdate {
    /// New peer inserted and the caller asked for it to be announced.
    Joined,
    /// New peer inserted silently.
    Added,
    /// Existing peer at that address refreshed in place.
    Updated,
}

impl PeerUpdate {
    pub fn is_new(self) -> bool {
        !matches!(self, PeerUpdate::Updated)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeerError {
    #[error("peer table full ({capacity} peers)")]
    CapacityExceeded { capacity: usize },
}

/// Insertion-ordered peer table. Lookups are linear; the table is tiny.
#[derive(Debug)]
pub struct PeerRegistry {
    peers: Vec<Peer>,
    capacity: usize,
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::with_capacity(MAX_PEERS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            peers: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Insert a peer or overwrite the one at `address`. A full table fails instead of
    /// evicting; callers prune first if they want room.
    pub fn add_or_update(
        &mut self,
        address: LinkAddress,
        device_id: &str,
        display_name: &str,
        room_tag: &str,
        announce: bool,
        now_ms: u64,
    ) -> Result<PeerUpdate, PeerError> {
        if let Some(peer) = self.peers.iter_mut().find(|p| p.address == address) {
            peer.device_id = text::bounded(device_id);
            peer.display_name = text::bounded(display_name);
            if !room_tag.is_empty() {
                peer.room_tag = text::bounded(room_tag);
            }
            peer.last_seen_ms = now_ms;
            peer.active = true;
            return Ok(PeerUpdate::Updated);
        }
        if self.peers.len() >= self.capacity {
            return Err(PeerError::CapacityExceeded {
                capacity: self.capacity,
            });
        }
        self.peers.push(Peer {
            address,
            device_id: text::bounded(device_id),
            display_name: text::bounded(display_name),
            room_tag: text::bounded(room_tag),
            last_seen_ms: now_ms,
            active: true,
            raw_signal: None,
            smoothed_signal: None,
        });
        Ok(if announce {
            PeerUpdate::Joined
        } else {
            PeerUpdate::Added
        })
    }

    /// Record a signal reading and mark the peer seen. False for an unknown address.
    pub fn update_signal(&mut self, address: &LinkAddress, raw: i32, now_ms: u64) -> bool {
        let Some(peer) = self.peers.iter_mut().find(|p| p.address == *address) else {
            return false;
        };
        peer.last_seen_ms = now_ms;
        peer.active = true;
        peer.raw_signal = Some(raw);
        peer.smoothed_signal = Some(smooth(peer.smoothed_signal, raw));
        true
    }

    pub fn remove(&mut self, address: &LinkAddress) -> Option<Peer> {
        let index = self.peers.iter().position(|p| p.address == *address)?;
        Some(self.peers.remove(index))
    }

    /// Remove every peer silent for more than `timeout_ms`; returns them oldest-inserted first.
    pub fn sweep(&mut self, now_ms: u64, timeout_ms: u64) -> Vec<Peer> {
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(self.capacity);
        for peer in self.peers.drain(..) {
            if now_ms.saturating_sub(peer.last_seen_ms) > timeout_ms {
                removed.push(peer);
            } else {
                kept.push(peer);
            }
        }
        self.peers = kept;
        removed
    }

    pub fn find_by_address(&self, address: &LinkAddress) -> Option<&Peer> {
        self.peers.iter().find(|p| p.address == *address)
    }

    pub fn find_by_device_id(&self, device_id: &str) -> Option<&Peer> {
        self.peers.iter().find(|p| p.device_id.as_str() == device_id)
    }

    pub fn get(&self, index: usize) -> Option<&Peer> {
        self.peers.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// 70/30 exponential smoothing, seeded by the first reading.
fn smooth(previous: Option<i32>, raw: i32) -> i32 {
    match previous {
        None => raw,
        Some(s) => ((f64::from(s) * 7.0 + f64::from(raw) * 3.0) / 10.0).round() as i32,
    }
}
