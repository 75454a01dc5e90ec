//! Receive hand-off between the radio driver context and the application loop.
//!
//! The driver side ([`ReceiveHandle`]) only decodes, verifies and enqueues. It never
//! blocks: a full queue or a key install in progress is a counted drop. All state
//! mutation happens on the consumer side, where the engine drains the [`InboundQueue`]
//! and drops frames verified under a key that has since changed.

use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

use crate::link::LinkAddress;
use crate::security::FrameVerifier;
use crate::stats::LinkCounters;
use crate::wire::{self, FrameError, WireFrame};

/// Default hand-off depth, a few seconds of traffic at chat rates.
pub const DEFAULT_INBOUND_CAPACITY: usize = 32;

/// A frame that passed length, version and tag checks.
#[derive(Debug, Clone)]
pub struct VerifiedFrame {
    pub from: LinkAddress,
    /// Received signal strength, when the link reports one.
    pub rssi: Option<i32>,
    pub frame: WireFrame,
    /// Key generation the tag was checked under.
    pub generation: u64,
}

/// Create the hand-off pair. `verifier` should come from the engine's security manager
/// so both sides agree on the network key.
pub fn inbound_channel(
    verifier: FrameVerifier,
    counters: Arc<LinkCounters>,
    capacity: usize,
) -> (ReceiveHandle, InboundQueue) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        ReceiveHandle {
            tx,
            verifier,
            counters,
        },
        InboundQueue { rx },
    )
}

/// Driver-context side. Cloneable and `Send`.
#[derive(Clone)]
pub struct ReceiveHandle {
    tx: mpsc::Sender<VerifiedFrame>,
    verifier: FrameVerifier,
    counters: Arc<LinkCounters>,
}

impl ReceiveHandle {
    /// Receive callback body. Returns true when the frame was verified and queued.
    pub fn on_receive(&self, from: LinkAddress, rssi: Option<i32>, bytes: &[u8]) -> bool {
        let Some(verified) = verify_frame(&self.verifier, &self.counters, from, rssi, bytes)
        else {
            return false;
        };
        match self.tx.try_send(verified) {
            Ok(()) => {
                self.counters.record_received(bytes.len());
                true
            }
            Err(TrySendError::Full(_)) => {
                self.counters.record_queue_full();
                debug!(%from, "inbound queue full, frame dropped");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// Consumer side, owned by the application loop.
pub struct InboundQueue {
    rx: mpsc::Receiver<VerifiedFrame>,
}

impl InboundQueue {
    /// Next queued frame without waiting.
    pub fn try_next(&mut self) -> Option<VerifiedFrame> {
        self.rx.try_recv().ok()
    }

    /// Wait for the next frame. `None` once every `ReceiveHandle` is gone.
    pub async fn recv(&mut self) -> Option<VerifiedFrame> {
        self.rx.recv().await
    }
}

/// Decode and authenticate one received frame, counting and logging drops.
/// Types that never travel as authenticated frames are validation drops.
pub(crate) fn verify_frame(
    verifier: &FrameVerifier,
    counters: &LinkCounters,
    from: LinkAddress,
    rssi: Option<i32>,
    bytes: &[u8],
) -> Option<VerifiedFrame> {
    let result = wire::decode_with_generation(bytes, verifier).and_then(|(frame, generation)| {
        if frame.msg_type.is_transmittable() {
            Ok((frame, generation))
        } else {
            Err(FrameError::Unsupported)
        }
    });
    match result {
        Ok((frame, generation)) => Some(VerifiedFrame {
            from,
            rssi,
            frame,
            generation,
        }),
        Err(e) => {
            match e {
                FrameError::Authentication => counters.record_auth_drop(),
                FrameError::KeyBusy => counters.record_key_busy(),
                _ => counters.record_validation_drop(),
            }
            debug!(%from, error = %e, "frame dropped");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::DeviceIdentity;
    use crate::protocol::MessageType;
    use crate::security::SecurityManager;

    const FROM: LinkAddress = LinkAddress([2, 0, 0, 0, 0, 1]);

    fn joined(key: &str) -> SecurityManager {
        let mut sm = SecurityManager::new(DeviceIdentity::new("LAB00000001", "Ada"));
        sm.set_network_key(key).unwrap();
        sm
    }

    fn frame(sm: &SecurityManager, msg_type: MessageType, content: &str) -> [u8; 250] {
        let mut f = WireFrame::new(msg_type, 0, sm.device_id(), sm.display_name(), 0, None, content);
        f.seal(&sm.verifier()).unwrap()
    }

    #[test]
    fn verified_frames_are_queued() {
        let sm = joined("K1");
        let counters = LinkCounters::shared();
        let (handle, mut queue) = inbound_channel(sm.verifier(), counters.clone(), 4);
        assert!(handle.on_receive(FROM, Some(-40), &frame(&sm, MessageType::Broadcast, "hi")));
        let got = queue.try_next().unwrap();
        assert_eq!(got.from, FROM);
        assert_eq!(got.rssi, Some(-40));
        assert_eq!(got.frame.content(), "hi");
        assert!(queue.try_next().is_none());
        assert_eq!(counters.snapshot().messages_received, 1);
    }

    #[test]
    fn drops_are_counted_by_kind() {
        let a = joined("K1");
        let b = joined("K2");
        let counters = LinkCounters::shared();
        let (handle, mut queue) = inbound_channel(b.verifier(), counters.clone(), 4);

        assert!(!handle.on_receive(FROM, None, &frame(&a, MessageType::Broadcast, "hi")));
        assert!(!handle.on_receive(FROM, None, &[0u8; 10]));
        assert!(!handle.on_receive(FROM, None, &frame(&b, MessageType::System, "x")));

        assert!(queue.try_next().is_none());
        let s = counters.snapshot();
        assert_eq!(s.auth_drops, 1);
        assert_eq!(s.validation_drops, 2);
        assert_eq!(s.messages_received, 0);
    }

    #[test]
    fn full_queue_drops_without_blocking() {
        let sm = joined("K1");
        let counters = LinkCounters::shared();
        let (handle, mut queue) = inbound_channel(sm.verifier(), counters.clone(), 1);
        let bytes = frame(&sm, MessageType::Presence, "online");
        assert!(handle.on_receive(FROM, None, &bytes));
        assert!(!handle.on_receive(FROM, None, &bytes));
        assert_eq!(counters.snapshot().queue_full_drops, 1);
        assert!(queue.try_next().is_some());
        assert!(handle.on_receive(FROM, None, &bytes));
    }

    #[test]
    fn not_joined_receiver_drops_everything() {
        let sm = joined("K1");
        let idle = SecurityManager::new(DeviceIdentity::new("LAB00000002", "Bo"));
        let counters = LinkCounters::shared();
        let (handle, _queue) = inbound_channel(idle.verifier(), counters.clone(), 4);
        assert!(!handle.on_receive(FROM, None, &frame(&sm, MessageType::Broadcast, "hi")));
        assert_eq!(counters.snapshot().auth_drops, 1);
    }

    #[test]
    fn key_install_in_progress_drops_instead_of_waiting() {
        let sm = joined("K1");
        let counters = LinkCounters::shared();
        let verifier = sm.verifier();
        let (handle, mut queue) = inbound_channel(verifier.clone(), counters.clone(), 4);
        let bytes = frame(&sm, MessageType::Broadcast, "hi");

        let queued = verifier.with_keys_locked(|| handle.on_receive(FROM, None, &bytes));
        assert!(!queued);
        assert!(queue.try_next().is_none());
        let s = counters.snapshot();
        assert_eq!(s.key_busy_drops, 1);
        assert_eq!(s.auth_drops, 0);

        assert!(handle.on_receive(FROM, None, &bytes));
        assert_eq!(queue.try_next().unwrap().generation, sm.key_generation());
    }

    #[tokio::test]
    async fn recv_from_another_thread() {
        let sm = joined("K1");
        let (handle, mut queue) = inbound_channel(sm.verifier(), LinkCounters::shared(), 4);
        let bytes = frame(&sm, MessageType::Broadcast, "from driver");
        std::thread::spawn(move || {
            handle.on_receive(FROM, None, &bytes);
        })
        .join()
        .unwrap();
        let got = queue.recv().await.unwrap();
        assert_eq!(got.frame.content(), "from driver");
        // Handle dropped with the thread: the queue reports closure.
        assert!(queue.recv().await.is_none());
    }
}
