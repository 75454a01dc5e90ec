//! Network key model: key derivation from the shared password, frame tagging (HMAC-SHA256),
//! constant-time verification, rotating privacy addresses, persisted network state.
//!
//! This is the only place that touches key material. Every tagging operation fails closed
//! while no network is joined.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, TryLockError};

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::identity::DeviceIdentity;
use crate::link::LinkAddress;
use crate::protocol::{ROOM_TAG_LEN, TAG_SIZE};
use crate::text::{self, RoomTag};

type HmacSha256 = Hmac<Sha256>;

/// Minimum password length for creating or joining a network.
pub const MIN_PASSWORD_LEN: usize = 8;

/// Privacy addresses rotate every five minutes.
pub const ADDRESS_ROTATION_SECS: u32 = 300;

/// Rotation windows accepted behind the current one (clock skew).
const ADDRESS_ROTATION_SKEW: u32 = 2;

const ROOM_COLOURS: [&str; 20] = [
    "Red", "Orange", "Yellow", "Green", "Blue", "Purple", "Pink", "Cyan", "Magenta", "Black",
    "White", "Gray", "Crimson", "Gold", "Silver", "Violet", "Indigo", "Lime", "Navy", "Teal",
];

/// Key material derived from the network password. Wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct NetworkKeys {
    tag_key: [u8; 32],
    link_key: [u8; 16],
}

impl NetworkKeys {
    /// `tag_key = SHA-256("HMAC" || secret)`, `link_key = SHA-256("PMK" || secret)[..16]`.
    /// Same derivation as deployed devices, so frames interoperate.
    fn derive(secret: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"HMAC");
        hasher.update(secret);
        let tag_key: [u8; 32] = hasher.finalize().into();

        let mut hasher = Sha256::new();
        hasher.update(b"PMK");
        hasher.update(secret);
        let pmk: [u8; 32] = hasher.finalize().into();
        let mut link_key = [0u8; 16];
        link_key.copy_from_slice(&pmk[..16]);

        Self { tag_key, link_key }
    }

    fn mac(&self) -> Result<HmacSha256, SecurityError> {
        HmacSha256::new_from_slice(&self.tag_key).map_err(|_| SecurityError::KeyInit)
    }
}

type SharedKeys = Arc<RwLock<Option<NetworkKeys>>>;

/// Outcome of a non-blocking tag check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagCheck {
    /// Tag matches under the key of this generation.
    Valid { generation: u64 },
    Invalid,
    /// Keys are being replaced right now; the frame was not checked.
    Busy,
}

/// Tag/verify view of the current network key. Cheap to clone and `Send`, so the
/// receive context can verify frames without touching the rest of the engine.
///
/// Every key install bumps a generation counter. Frames verified under an older
/// generation are stale once the key changed.
#[derive(Clone)]
pub struct FrameVerifier {
    keys: SharedKeys,
    generation: Arc<AtomicU64>,
}

impl FrameVerifier {
    fn new() -> Self {
        Self {
            keys: Arc::new(RwLock::new(None)),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn is_network_joined(&self) -> bool {
        matches!(self.keys.read().as_deref(), Ok(Some(_)))
    }

    /// Bumped by every join, leave and key change.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// HMAC-SHA256 over `bytes` under the network key.
    pub fn generate_tag(&self, bytes: &[u8]) -> Result<[u8; TAG_SIZE], SecurityError> {
        let guard = self.keys.read().map_err(|_| SecurityError::NotJoined)?;
        let keys = guard.as_ref().ok_or(SecurityError::NotJoined)?;
        let mut mac = keys.mac()?;
        mac.update(bytes);
        Ok(mac.finalize().into_bytes().into())
    }

    /// Constant-time check of `tag` against `bytes`. Never waits for the key lock: while
    /// keys are being installed the answer is `Busy`.
    pub fn check_tag(&self, bytes: &[u8], tag: &[u8]) -> TagCheck {
        let guard = match self.keys.try_read() {
            Ok(g) => g,
            Err(TryLockError::WouldBlock) => return TagCheck::Busy,
            Err(TryLockError::Poisoned(_)) => return TagCheck::Invalid,
        };
        // Installs bump the counter while holding the write guard.
        let generation = self.generation();
        let Some(keys) = guard.as_ref() else {
            return TagCheck::Invalid;
        };
        let Ok(mut mac) = keys.mac() else {
            return TagCheck::Invalid;
        };
        mac.update(bytes);
        match mac.verify_slice(tag) {
            Ok(()) => TagCheck::Valid { generation },
            Err(_) => TagCheck::Invalid,
        }
    }

    /// False when no network is joined or the keys are being replaced.
    pub fn verify_tag(&self, bytes: &[u8], tag: &[u8]) -> bool {
        matches!(self.check_tag(bytes, tag), TagCheck::Valid { .. })
    }

    /// Run `f` while the key lock is held for writing, as an install would.
    #[cfg(test)]
    pub(crate) fn with_keys_locked<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.keys.write();
        f()
    }
}

/// Persisted form of a created network (joined rooms are not persisted).
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct NetworkState {
    device_id: String,
    network_name: String,
    tag_key: [u8; 32],
    link_key: [u8; 16],
}

/// Device identity plus the network key. Sole authenticity seam of the protocol.
pub struct SecurityManager {
    identity: DeviceIdentity,
    network_name: RoomTag,
    persistent: bool,
    verifier: FrameVerifier,
}

impl SecurityManager {
    pub fn new(identity: DeviceIdentity) -> Self {
        Self {
            identity,
            network_name: RoomTag::new(),
            persistent: false,
            verifier: FrameVerifier::new(),
        }
    }

    pub fn for_link_address(address: &LinkAddress) -> Self {
        Self::new(DeviceIdentity::from_link_address(address))
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn device_id(&self) -> &str {
        self.identity.device_id()
    }

    pub fn display_name(&self) -> &str {
        self.identity.display_name()
    }

    pub fn set_display_name(&mut self, name: &str) {
        self.identity.set_display_name(name);
    }

    pub fn is_network_joined(&self) -> bool {
        self.verifier.is_network_joined()
    }

    /// Name of the joined network, empty when not joined.
    pub fn network_name(&self) -> &str {
        self.network_name.as_str()
    }

    /// Generation of the installed key, see [`FrameVerifier::generation`].
    pub fn key_generation(&self) -> u64 {
        self.verifier.generation()
    }

    /// Handle for the receive context. Follows later key changes.
    pub fn verifier(&self) -> FrameVerifier {
        self.verifier.clone()
    }

    /// Derive and install keys from a shared secret. Does not touch the network name.
    pub fn set_network_key(&mut self, secret: &str) -> Result<(), SecurityError> {
        if secret.is_empty() {
            return Err(SecurityError::EmptySecret);
        }
        self.install(Some(NetworkKeys::derive(secret.as_bytes())));
        Ok(())
    }

    /// Create a named network. The result can be persisted with `export_state`.
    pub fn create_network(&mut self, password: &str, name: &str) -> Result<(), SecurityError> {
        check_password(password)?;
        if name.is_empty() || name.len() > ROOM_TAG_LEN {
            return Err(SecurityError::InvalidNetworkName);
        }
        self.set_network_key(password)?;
        self.network_name = text::bounded(name);
        self.persistent = true;
        tracing::info!(network = %self.network_name, "created network");
        Ok(())
    }

    /// Join an existing network. The room name is derived from the password so every
    /// member sees the same one. Joined rooms are not persisted.
    pub fn join_network(&mut self, password: &str) -> Result<(), SecurityError> {
        check_password(password)?;
        self.set_network_key(password)?;
        self.network_name = text::bounded(&room_name_for(password));
        self.persistent = false;
        tracing::info!(network = %self.network_name, "joined network");
        Ok(())
    }

    /// Forget the network and wipe all key material.
    pub fn leave_network(&mut self) {
        self.install(None);
        self.network_name.clear();
        self.persistent = false;
        tracing::info!("left network");
    }

    pub fn generate_tag(&self, bytes: &[u8]) -> Result<[u8; TAG_SIZE], SecurityError> {
        self.verifier.generate_tag(bytes)
    }

    pub fn verify_tag(&self, bytes: &[u8], tag: &[u8]) -> bool {
        self.verifier.verify_tag(bytes, tag)
    }

    /// Encryption material for links that support encrypted unicast.
    pub fn link_key(&self) -> Option<[u8; 16]> {
        let guard = self.verifier.keys.read().ok()?;
        guard.as_ref().map(|k| k.link_key)
    }

    /// Privacy address for the rotation window containing `unix_secs`.
    pub fn rotated_address(&self, unix_secs: u32) -> Option<LinkAddress> {
        self.address_for_rotation(unix_secs / ADDRESS_ROTATION_SECS)
    }

    /// Accepts the current rotation window and the two before it.
    pub fn is_valid_rotated_address(&self, address: &LinkAddress, unix_secs: u32) -> bool {
        let rotation = unix_secs / ADDRESS_ROTATION_SECS;
        (0..=ADDRESS_ROTATION_SKEW).any(|back| {
            rotation
                .checked_sub(back)
                .and_then(|r| self.address_for_rotation(r))
                .is_some_and(|expected| expected == *address)
        })
    }

    fn address_for_rotation(&self, rotation: u32) -> Option<LinkAddress> {
        let tag = self.generate_tag(&rotation.to_be_bytes()).ok()?;
        let mut bytes = [0u8; 6];
        bytes.copy_from_slice(&tag[..6]);
        bytes[0] = (bytes[0] & 0xFE) | 0x02;
        Some(LinkAddress(bytes))
    }

    /// Serialize a created network for storage. Joined rooms are ephemeral.
    pub fn export_state(&self) -> Result<Vec<u8>, StateError> {
        let guard = self.verifier.keys.read().map_err(|_| StateError::NotJoined)?;
        let keys = guard.as_ref().ok_or(StateError::NotJoined)?;
        if !self.persistent {
            return Err(StateError::Ephemeral);
        }
        let state = NetworkState {
            device_id: self.device_id().to_string(),
            network_name: self.network_name.to_string(),
            tag_key: keys.tag_key,
            link_key: keys.link_key,
        };
        Ok(bincode::serialize(&state)?)
    }

    /// Restore a network saved with `export_state`. The stored device id wins over the
    /// current one so frames keep the same sender identity across restarts.
    pub fn restore_state(&mut self, bytes: &[u8]) -> Result<(), StateError> {
        let state: NetworkState = bincode::deserialize(bytes)?;
        if state.device_id.is_empty() || state.network_name.is_empty() {
            return Err(StateError::Invalid);
        }
        let display_name = self.identity.display_name().to_string();
        self.identity = DeviceIdentity::new(&state.device_id, &display_name);
        self.network_name = text::bounded(&state.network_name);
        self.persistent = true;
        self.install(Some(NetworkKeys {
            tag_key: state.tag_key,
            link_key: state.link_key,
        }));
        tracing::info!(network = %self.network_name, "restored network");
        Ok(())
    }

    fn install(&mut self, keys: Option<NetworkKeys>) {
        // A poisoned lock only means a reader panicked; the value is replaced wholesale.
        let mut guard = match self.verifier.keys.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = keys;
        self.verifier.generation.fetch_add(1, Ordering::AcqRel);
    }
}

fn check_password(password: &str) -> Result<(), SecurityError> {
    if password.len() < MIN_PASSWORD_LEN {
        return Err(SecurityError::PasswordTooShort {
            min: MIN_PASSWORD_LEN,
        });
    }
    Ok(())
}

/// `"<Colour> Room"`, colour picked by the first byte of SHA-256(password).
pub fn room_name_for(password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    let digest = hasher.finalize();
    let colour = ROOM_COLOURS[usize::from(digest[0]) % ROOM_COLOURS.len()];
    format!("{colour} Room")
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SecurityError {
    #[error("not joined to a network")]
    NotJoined,
    #[error("password must be at least {min} characters")]
    PasswordTooShort { min: usize },
    #[error("network name must be 1..=31 bytes")]
    InvalidNetworkName,
    #[error("network secret is empty")]
    EmptySecret,
    #[error("could not initialise MAC key")]
    KeyInit,
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("not joined to a network")]
    NotJoined,
    #[error("joined rooms are not persisted")]
    Ephemeral,
    #[error("stored network state is incomplete")]
    Invalid,
    #[error("state encoding: {0}")]
    Encode(#[from] bincode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SecurityManager {
        SecurityManager::new(DeviceIdentity::new("LAB00000001", "Ada"))
    }

    #[test]
    fn tagging_fails_closed_when_not_joined() {
        let sm = manager();
        assert!(!sm.is_network_joined());
        assert_eq!(sm.generate_tag(b"hello"), Err(SecurityError::NotJoined));
        assert!(!sm.verify_tag(b"hello", &[0u8; 32]));
        assert!(sm.link_key().is_none());
        assert!(sm.rotated_address(1_000).is_none());
    }

    #[test]
    fn tag_verifies_under_same_key_only() {
        let mut a = manager();
        let mut b = manager();
        let mut c = manager();
        a.set_network_key("K1").unwrap();
        b.set_network_key("K1").unwrap();
        c.set_network_key("K2").unwrap();
        let tag = a.generate_tag(b"frame bytes").unwrap();
        assert!(b.verify_tag(b"frame bytes", &tag));
        assert!(!b.verify_tag(b"frame bytez", &tag));
        assert!(!c.verify_tag(b"frame bytes", &tag));
    }

    #[test]
    fn verify_rejects_short_tag() {
        let mut a = manager();
        a.set_network_key("K1").unwrap();
        let tag = a.generate_tag(b"x").unwrap();
        assert!(!a.verify_tag(b"x", &tag[..16]));
    }

    #[test]
    fn create_and_join_check_password_length() {
        let mut sm = manager();
        assert_eq!(
            sm.join_network("short"),
            Err(SecurityError::PasswordTooShort { min: 8 })
        );
        assert_eq!(
            sm.create_network("long enough", ""),
            Err(SecurityError::InvalidNetworkName)
        );
        assert!(!sm.is_network_joined());
        sm.create_network("long enough", "Lab Crew").unwrap();
        assert!(sm.is_network_joined());
        assert_eq!(sm.network_name(), "Lab Crew");
    }

    #[test]
    fn joined_room_name_is_shared_by_password() {
        let mut a = manager();
        let mut b = manager();
        a.join_network("correct horse").unwrap();
        b.join_network("correct horse").unwrap();
        assert_eq!(a.network_name(), b.network_name());
        assert!(a.network_name().ends_with(" Room"));
        assert_eq!(a.network_name(), room_name_for("correct horse"));
    }

    #[test]
    fn leave_wipes_keys() {
        let mut sm = manager();
        sm.join_network("correct horse").unwrap();
        let verifier = sm.verifier();
        assert!(verifier.is_network_joined());
        sm.leave_network();
        assert!(!verifier.is_network_joined());
        assert_eq!(sm.network_name(), "");
        assert!(sm.generate_tag(b"x").is_err());
    }

    #[test]
    fn verifier_follows_key_changes() {
        let mut sm = manager();
        let verifier = sm.verifier();
        sm.set_network_key("K1").unwrap();
        let tag = sm.generate_tag(b"abc").unwrap();
        assert!(verifier.verify_tag(b"abc", &tag));
        sm.set_network_key("K2").unwrap();
        assert!(!verifier.verify_tag(b"abc", &tag));
    }

    #[test]
    fn every_install_bumps_generation() {
        let mut sm = manager();
        let verifier = sm.verifier();
        let g0 = verifier.generation();
        sm.set_network_key("K1").unwrap();
        let tag = sm.generate_tag(b"abc").unwrap();
        let g1 = sm.key_generation();
        assert!(g1 > g0);
        assert_eq!(verifier.check_tag(b"abc", &tag), TagCheck::Valid { generation: g1 });
        sm.set_network_key("K1").unwrap();
        assert!(sm.key_generation() > g1);
        sm.leave_network();
        assert_eq!(verifier.check_tag(b"abc", &tag), TagCheck::Invalid);
    }

    #[test]
    fn check_tag_does_not_wait_for_an_install() {
        let mut sm = manager();
        sm.set_network_key("K1").unwrap();
        let tag = sm.generate_tag(b"abc").unwrap();
        let verifier = sm.verifier();
        let during = verifier.with_keys_locked(|| verifier.check_tag(b"abc", &tag));
        assert_eq!(during, TagCheck::Busy);
        assert!(verifier.verify_tag(b"abc", &tag));
    }

    #[test]
    fn link_key_differs_from_tag_key_prefix() {
        let mut sm = manager();
        sm.set_network_key("K1").unwrap();
        let link_key = sm.link_key().unwrap();
        let keys = NetworkKeys::derive(b"K1");
        assert_eq!(link_key, keys.link_key);
        assert_ne!(&keys.tag_key[..16], &link_key[..]);
    }

    #[test]
    fn rotated_address_is_local_and_accepted_with_skew() {
        let mut sm = manager();
        sm.set_network_key("K1").unwrap();
        let t = 1_700_000_000u32;
        let addr = sm.rotated_address(t).unwrap();
        assert_eq!(addr.0[0] & 0x03, 0x02);
        assert!(sm.is_valid_rotated_address(&addr, t));
        assert!(sm.is_valid_rotated_address(&addr, t + 2 * ADDRESS_ROTATION_SECS));
        assert!(!sm.is_valid_rotated_address(&addr, t + 3 * ADDRESS_ROTATION_SECS));
        assert_eq!(sm.rotated_address(t), sm.rotated_address(t - t % 300 + 299));
    }

    #[test]
    fn export_restore_created_network() {
        let mut a = manager();
        a.create_network("long enough", "Lab Crew").unwrap();
        let bytes = a.export_state().unwrap();

        let mut b = SecurityManager::new(DeviceIdentity::new("LABFFFFFFFF", "Bob"));
        b.restore_state(&bytes).unwrap();
        assert_eq!(b.device_id(), "LAB00000001");
        assert_eq!(b.display_name(), "Bob");
        assert_eq!(b.network_name(), "Lab Crew");
        let tag = a.generate_tag(b"m").unwrap();
        assert!(b.verify_tag(b"m", &tag));
    }

    #[test]
    fn joined_rooms_are_not_exported() {
        let mut sm = manager();
        assert!(matches!(sm.export_state(), Err(StateError::NotJoined)));
        sm.join_network("correct horse").unwrap();
        assert!(matches!(sm.export_state(), Err(StateError::Ephemeral)));
    }

    #[test]
    fn restore_rejects_garbage() {
        let mut sm = manager();
        assert!(sm.restore_state(&[1, 2, 3]).is_err());
        assert!(!sm.is_network_joined());
    }
}
