//! Host-driven protocol engine: the host feeds received frames and the clock in, the
//! engine builds frames, dispatches by type and feeds the display queue.
//!
//! All time is host milliseconds since the unix epoch (`now_ms`). Wire timestamps are
//! derived from it in whole seconds.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::chunk::{self, ChunkReassembler, ChunkReceiveResult, TransferError, BLOB_SIZE};
use crate::display::{DisplayMessage, DisplayQueue};
use crate::events::{BlobSink, BlobStore, UiEvent, UiEventSink};
use crate::inbound::{self, InboundQueue, ReceiveHandle, VerifiedFrame};
use crate::link::{LinkAddress, RadioLink};
use crate::peers::{Peer, PeerRegistry, PeerUpdate, PEER_TIMEOUT_MS};
use crate::protocol::{
    MessageType, FRAME_SIZE, KNOCK_ALLOWED, KNOCK_DENIED, KNOCK_PAYLOAD, MAX_PAYLOAD,
    PRESENCE_PAYLOAD,
};
use crate::scheduler::{OutgoingTarget, TransferScheduler, CHUNK_INTERVAL_MS};
use crate::security::{SecurityError, SecurityManager};
use crate::stats::{LinkCounters, LinkStats};
use crate::text;
use crate::wire::WireFrame;

pub const SYSTEM_SENDER_ID: &str = "SYSTEM";
pub const SYSTEM_SENDER_NAME: &str = "System";

/// Hold time for a message that names an inline image, so its chunks can land first.
pub const INLINE_IMAGE_DELAY_MS: u64 = 450;

pub const SWEEP_INTERVAL_MS: u64 = 60_000;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub peer_timeout_ms: u64,
    pub sweep_interval_ms: u64,
    pub inline_image_delay_ms: u64,
    pub chunk_interval_ms: u64,
    pub transfer_ttl_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            peer_timeout_ms: PEER_TIMEOUT_MS,
            sweep_interval_ms: SWEEP_INTERVAL_MS,
            inline_image_delay_ms: INLINE_IMAGE_DELAY_MS,
            chunk_interval_ms: CHUNK_INTERVAL_MS,
            transfer_ttl_ms: chunk::DEFAULT_TRANSFER_TTL_MS,
        }
    }
}

/// Last device that knocked and has not been answered yet.
#[derive(Debug, Clone)]
struct Knocker {
    device_id: String,
    name: String,
}

struct DelayedMessage {
    due_ms: u64,
    message: DisplayMessage,
}

/// Owns the peer table, display queue and chunk state. Driven from one loop.
pub struct ProtocolEngine<L: RadioLink, S: UiEventSink> {
    security: SecurityManager,
    peers: PeerRegistry,
    display: DisplayQueue,
    reassembler: ChunkReassembler,
    outgoing: TransferScheduler,
    delayed: VecDeque<DelayedMessage>,
    knocker: Option<Knocker>,
    link: L,
    events: S,
    blob_sink: Option<Box<dyn BlobSink + Send>>,
    counters: Arc<LinkCounters>,
    config: EngineConfig,
    last_sweep_ms: u64,
}

impl<L: RadioLink, S: UiEventSink> ProtocolEngine<L, S> {
    pub fn new(security: SecurityManager, link: L, events: S) -> Self {
        Self::with_config(security, link, events, EngineConfig::default())
    }

    pub fn with_config(security: SecurityManager, link: L, events: S, config: EngineConfig) -> Self {
        Self {
            security,
            peers: PeerRegistry::new(),
            display: DisplayQueue::new(),
            reassembler: ChunkReassembler::new(),
            outgoing: TransferScheduler::new(config.chunk_interval_ms),
            delayed: VecDeque::new(),
            knocker: None,
            link,
            events,
            blob_sink: None,
            counters: LinkCounters::shared(),
            config,
            last_sweep_ms: 0,
        }
    }

    /// Where completed inbound blobs go.
    pub fn set_blob_sink(&mut self, sink: Box<dyn BlobSink + Send>) {
        self.blob_sink = Some(sink);
    }

    pub fn security(&self) -> &SecurityManager {
        &self.security
    }

    /// Joining or leaving a network here is seen by every receive handle immediately.
    pub fn security_mut(&mut self) -> &mut SecurityManager {
        &mut self.security
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    pub fn display(&self) -> &DisplayQueue {
        &self.display
    }

    pub fn clear_display(&mut self) {
        self.display.clear();
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    pub fn events(&self) -> &S {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut S {
        &mut self.events
    }

    pub fn stats(&self) -> LinkStats {
        self.counters.snapshot()
    }

    /// Hand-off pair for this engine's network key and counters.
    pub fn receive_channel(&self, capacity: usize) -> (ReceiveHandle, InboundQueue) {
        inbound::inbound_channel(self.security.verifier(), self.counters.clone(), capacity)
    }

    /// Build and tag a frame. Content is cut to 161 bytes. Fails when not joined.
    pub fn create_message(
        &self,
        msg_type: MessageType,
        content: &str,
        channel: u8,
        target_id: Option<&str>,
        now_ms: u64,
    ) -> Result<[u8; FRAME_SIZE], SendError> {
        if !msg_type.is_transmittable() {
            return Err(SendError::NotTransmittable(msg_type));
        }
        let mut frame = WireFrame::new(
            msg_type,
            unix_secs(now_ms),
            self.security.device_id(),
            self.security.display_name(),
            channel,
            target_id,
            content,
        );
        Ok(frame.seal(&self.security.verifier())?)
    }

    /// Echo locally, then broadcast. The echo stays even if the link refuses the frame.
    pub fn send_broadcast(&mut self, content: &str, channel: u8, now_ms: u64) -> Result<(), SendError> {
        let bytes = self.create_message(MessageType::Broadcast, content, channel, None, now_ms)?;
        let sent = text::truncate_to(content, MAX_PAYLOAD);
        if !chunk::is_chunk_payload(sent) {
            let echo = self.own_message(MessageType::Broadcast, channel, sent.to_string(), now_ms);
            self.push_display(echo);
        }
        self.transmit(&LinkAddress::BROADCAST, &bytes)
    }

    /// Send to one known peer, echoing `→ <id>: <text>` locally.
    pub fn send_direct(&mut self, target_id: &str, content: &str, now_ms: u64) -> Result<(), SendError> {
        let bytes = self.create_message(MessageType::Direct, content, 0, Some(target_id), now_ms)?;
        let address = self.resolve(target_id)?;
        let sent = text::truncate_to(content, MAX_PAYLOAD);
        if !chunk::is_chunk_payload(sent) {
            let line = format!("→ {target_id}: {sent}");
            let echo = self.own_message(MessageType::Direct, 0, line, now_ms);
            self.push_display(echo);
        }
        self.transmit(&address, &bytes)
    }

    pub fn send_presence(&mut self, now_ms: u64) -> Result<(), SendError> {
        let bytes = self.create_message(MessageType::Presence, PRESENCE_PAYLOAD, 0, None, now_ms)?;
        self.transmit(&LinkAddress::BROADCAST, &bytes)
    }

    /// Ask a known peer's user to admit us.
    pub fn send_knock(&mut self, target_id: &str, now_ms: u64) -> Result<(), SendError> {
        let bytes = self.create_message(MessageType::Knock, KNOCK_PAYLOAD, 0, Some(target_id), now_ms)?;
        let address = self.resolve(target_id)?;
        self.transmit(&address, &bytes)
    }

    /// Name of the device whose knock is waiting for an answer.
    pub fn pending_knock(&self) -> Option<&str> {
        self.knocker.as_ref().map(|k| k.name.as_str())
    }

    /// Admit the last knocker. Returns its name.
    pub fn allow_knock(&mut self, now_ms: u64) -> Result<String, SendError> {
        self.answer_knock(true, now_ms)
    }

    /// Turn the last knocker away. Returns its name.
    pub fn deny_knock(&mut self, now_ms: u64) -> Result<String, SendError> {
        self.answer_knock(false, now_ms)
    }

    fn answer_knock(&mut self, allow: bool, now_ms: u64) -> Result<String, SendError> {
        let knocker = self.knocker.clone().ok_or(SendError::NoPendingKnock)?;
        let payload = if allow { KNOCK_ALLOWED } else { KNOCK_DENIED };
        let bytes = self.create_message(
            MessageType::KnockResponse,
            payload,
            0,
            Some(&knocker.device_id),
            now_ms,
        )?;
        let address = self.resolve(&knocker.device_id)?;
        self.transmit(&address, &bytes)?;
        self.knocker = None;
        let line = if allow {
            format!("{} has been allowed in", knocker.name)
        } else {
            format!("{} was turned away", knocker.name)
        };
        self.add_system_message(&line, 0, now_ms);
        Ok(knocker.name)
    }

    /// Queue a blob for paced sending by `poll`.
    pub fn send_blob(
        &mut self,
        id: &str,
        blob: &[u8; BLOB_SIZE],
        target: OutgoingTarget,
    ) -> Result<(), TransferError> {
        if !self.security.is_network_joined() {
            return Err(TransferError::NotJoined);
        }
        if let OutgoingTarget::Direct { device_id } = &target {
            if self.peers.find_by_device_id(device_id).is_none() {
                return Err(TransferError::UnknownPeer(device_id.to_string()));
            }
        }
        self.outgoing.enqueue(id, blob, target)?;
        info!(id, "transfer queued");
        Ok(())
    }

    /// Load `name` from `store` and queue it under the same id.
    pub fn send_blob_from(
        &mut self,
        store: &dyn BlobStore,
        name: &str,
        target: OutgoingTarget,
    ) -> Result<(), TransferError> {
        chunk::validate_transfer_id(name)?;
        let blob = store.load_blob(name)?;
        self.send_blob(name, &blob, target)
    }

    /// Stop an outgoing transfer before its next chunk.
    pub fn cancel_outgoing(&mut self, id: &str) -> bool {
        self.outgoing.cancel(id)
    }

    /// Outgoing transfers with the number of chunks sent so far.
    pub fn outgoing_transfers(&self) -> impl Iterator<Item = (&str, usize)> {
        self.outgoing.pending()
    }

    /// Drop the inbound transfer with this id, if it is the one in progress.
    pub fn abort_transfer(&mut self, id: &str) -> bool {
        let aborted = self.reassembler.abort(id);
        if aborted {
            info!(id, "inbound transfer aborted");
        }
        aborted
    }

    pub fn add_system_message(&mut self, content: &str, channel: u8, now_ms: u64) {
        self.push_display(DisplayMessage {
            sender_id: SYSTEM_SENDER_ID.to_string(),
            sender_name: SYSTEM_SENDER_NAME.to_string(),
            channel,
            msg_type: MessageType::System,
            timestamp: u64::from(unix_secs(now_ms)),
            content: content.to_string(),
            own: false,
        });
    }

    /// Forget a peer and unregister it from the link.
    pub fn remove_peer(&mut self, address: &LinkAddress) -> Option<Peer> {
        let peer = self.peers.remove(address)?;
        self.link.remove_peer(address);
        self.events.notify(UiEvent::PeerLeft);
        Some(peer)
    }

    /// Verify and dispatch in one step. True when the frame was accepted, which includes
    /// frames that are accepted but deliberately not displayed.
    pub fn handle_received(
        &mut self,
        from: LinkAddress,
        rssi: Option<i32>,
        bytes: &[u8],
        now_ms: u64,
    ) -> bool {
        let verifier = self.security.verifier();
        let Some(verified) = inbound::verify_frame(&verifier, &self.counters, from, rssi, bytes)
        else {
            return false;
        };
        self.counters.record_received(bytes.len());
        self.dispatch(verified, now_ms)
    }

    /// Dispatch everything queued by the receive context. Returns the number of frames
    /// dispatched; frames verified under a key that is no longer installed are dropped.
    pub fn drain(&mut self, queue: &mut InboundQueue, now_ms: u64) -> usize {
        let mut n = 0;
        while let Some(verified) = queue.try_next() {
            if self.dispatch(verified, now_ms) {
                n += 1;
            }
        }
        n
    }

    /// Consumer half of the receive path, for a frame that already passed verification.
    /// False when the frame was verified under a key that has since been replaced or
    /// removed, in which case nothing about it is kept.
    pub fn dispatch(&mut self, verified: VerifiedFrame, now_ms: u64) -> bool {
        let VerifiedFrame {
            from,
            rssi,
            frame,
            generation,
        } = verified;
        if !self.security.is_network_joined() || generation != self.security.key_generation() {
            self.counters.record_stale();
            debug!(%from, "frame verified under an old key, dropped");
            return false;
        }
        if frame.sender_id.as_str() == self.security.device_id() {
            debug!(%from, "own frame looped back");
            return true;
        }

        let for_me = frame.target_id.as_deref() == Some(self.security.device_id());
        match frame.msg_type {
            MessageType::Presence => self.admit_peer(from, &frame, now_ms),
            MessageType::Knock | MessageType::KnockResponse
                if frame.target_id.is_some() && !for_me =>
            {
                debug!(%from, msg_type = ?frame.msg_type, "knock for another device");
            }
            MessageType::Knock => {
                self.admit_peer(from, &frame, now_ms);
                self.knocker = Some(Knocker {
                    device_id: frame.sender_id.to_string(),
                    name: frame.sender_name.to_string(),
                });
                let line = format!("{} is knocking. Type 'allow' to admit.", frame.sender_name);
                self.add_system_message(&line, 0, now_ms);
            }
            MessageType::KnockResponse => {
                self.admit_peer(from, &frame, now_ms);
                let line = match frame.content().as_str() {
                    KNOCK_ALLOWED => format!("{} let you in", frame.sender_name),
                    _ => "Access denied".to_string(),
                };
                self.add_system_message(&line, 0, now_ms);
            }
            MessageType::Direct if !for_me => {
                debug!(%from, "direct frame for another device");
            }
            MessageType::Broadcast | MessageType::Channel | MessageType::Direct => {
                self.admit_peer(from, &frame, now_ms);
                self.classify(frame, now_ms);
            }
            other => debug!(%from, ?other, "frame type not dispatched"),
        }

        if let Some(rssi) = rssi {
            self.peers.update_signal(&from, rssi, now_ms);
        }
        true
    }

    /// Periodic work: release held messages, send the next due chunk, expire a stale
    /// inbound transfer and sweep silent peers.
    pub fn poll(&mut self, now_ms: u64) {
        self.release_delayed(now_ms);
        self.send_due_chunk(now_ms);
        if let Some(id) = self.reassembler.expire(now_ms, self.config.transfer_ttl_ms) {
            info!(id = %id, "inbound transfer expired");
        }
        if now_ms.saturating_sub(self.last_sweep_ms) >= self.config.sweep_interval_ms {
            self.last_sweep_ms = now_ms;
            self.sweep_peers(now_ms);
        }
    }

    fn admit_peer(&mut self, from: LinkAddress, frame: &WireFrame, now_ms: u64) {
        let result = self.peers.add_or_update(
            from,
            &frame.sender_id,
            &frame.sender_name,
            self.security.network_name(),
            true,
            now_ms,
        );
        match result {
            Ok(update) if update.is_new() => {
                let key = self.security.link_key();
                if !self.link.add_peer(&from, key.as_ref()) {
                    warn!(%from, "link refused peer registration");
                }
                if update == PeerUpdate::Joined {
                    info!(peer = %frame.sender_name, %from, "peer joined");
                    self.events.notify(UiEvent::PeerJoined {
                        name: frame.sender_name.to_string(),
                    });
                    let line = format!("{} joined", frame.sender_name);
                    self.add_system_message(&line, 0, now_ms);
                }
            }
            Ok(_) => {}
            Err(e) => warn!(%from, error = %e, "peer not added"),
        }
    }

    fn classify(&mut self, frame: WireFrame, now_ms: u64) {
        let content = frame.content();
        if chunk::is_chunk_payload(&content) {
            self.on_chunk(&content, now_ms);
            return;
        }

        let hold = has_inline_image_token(&content);
        let message = DisplayMessage {
            sender_id: frame.sender_id.to_string(),
            sender_name: frame.sender_name.to_string(),
            channel: frame.channel,
            msg_type: frame.msg_type,
            timestamp: u64::from(frame.timestamp),
            content,
            own: false,
        };
        if hold || !self.delayed.is_empty() {
            // Later lines wait behind a held one so display order matches arrival.
            let due_ms = if hold {
                now_ms + self.config.inline_image_delay_ms
            } else {
                now_ms
            };
            self.delayed.push_back(DelayedMessage { due_ms, message });
        } else {
            self.push_display(message);
        }
    }

    fn on_chunk(&mut self, content: &str, now_ms: u64) {
        match self.reassembler.accept(content, now_ms) {
            ChunkReceiveResult::Complete(blob) => {
                info!(id = %blob.id, "inbound transfer complete");
                if let Some(sink) = self.blob_sink.as_mut() {
                    sink.blob_received(&blob.id, &blob.data);
                }
                self.events.notify(UiEvent::TransferComplete {
                    id: blob.id.to_string(),
                });
            }
            ChunkReceiveResult::InProgress { received } => debug!(received, "chunk stored"),
            ChunkReceiveResult::Duplicate => debug!("duplicate chunk"),
            ChunkReceiveResult::Ignored => debug!("malformed chunk ignored"),
        }
    }

    fn release_delayed(&mut self, now_ms: u64) {
        while self.delayed.front().is_some_and(|d| d.due_ms <= now_ms) {
            if let Some(d) = self.delayed.pop_front() {
                self.push_display(d.message);
            }
        }
    }

    fn send_due_chunk(&mut self, now_ms: u64) {
        let Some(due) = self.outgoing.poll_due(now_ms) else {
            return;
        };
        let result = match &due.target {
            OutgoingTarget::Broadcast { channel } => {
                self.send_broadcast(&due.payload, *channel, now_ms)
            }
            OutgoingTarget::Direct { device_id } => {
                self.send_direct(device_id, &due.payload, now_ms)
            }
        };
        match result {
            Ok(()) if due.last => info!(id = %due.id, "transfer sent"),
            Ok(()) => debug!(id = %due.id, index = due.index, "chunk sent"),
            Err(e) => {
                warn!(id = %due.id, index = due.index, error = %e, "chunk not sent, transfer stopped");
                self.outgoing.cancel(&due.id);
            }
        }
    }

    fn sweep_peers(&mut self, now_ms: u64) {
        for peer in self.peers.sweep(now_ms, self.config.peer_timeout_ms) {
            self.link.remove_peer(&peer.address);
            info!(peer = %peer.display_name, address = %peer.address, "peer timed out");
            self.events.notify(UiEvent::PeerLeft);
        }
    }

    fn resolve(&self, device_id: &str) -> Result<LinkAddress, SendError> {
        self.peers
            .find_by_device_id(device_id)
            .map(|p| p.address)
            .ok_or_else(|| SendError::UnknownPeer(device_id.to_string()))
    }

    fn own_message(&self, msg_type: MessageType, channel: u8, content: String, now_ms: u64) -> DisplayMessage {
        DisplayMessage {
            sender_id: self.security.device_id().to_string(),
            sender_name: self.security.display_name().to_string(),
            channel,
            msg_type,
            timestamp: u64::from(unix_secs(now_ms)),
            content,
            own: true,
        }
    }

    fn push_display(&mut self, message: DisplayMessage) {
        self.display.push(message);
        self.events.notify(UiEvent::MessageAdded);
    }

    fn transmit(&mut self, address: &LinkAddress, bytes: &[u8]) -> Result<(), SendError> {
        if self.link.send(address, bytes) {
            self.counters.record_sent(bytes.len());
            Ok(())
        } else {
            self.counters.record_send_failure();
            warn!(%address, "link refused frame");
            Err(SendError::Transmit)
        }
    }
}

/// A `:` followed later by another `:` with at least one character in between.
pub fn has_inline_image_token(content: &str) -> bool {
    let Some(first) = content.find(':') else {
        return false;
    };
    content[first + 1..].find(':').is_some_and(|gap| gap > 0)
}

fn unix_secs(now_ms: u64) -> u32 {
    u32::try_from(now_ms / 1000).unwrap_or(u32::MAX)
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error(transparent)]
    Security(#[from] SecurityError),
    #[error("unknown peer {0:?}")]
    UnknownPeer(String),
    #[error("{0:?} frames are never transmitted")]
    NotTransmittable(MessageType),
    #[error("link refused the frame")]
    Transmit,
    #[error("nobody is knocking")]
    NoPendingKnock,
}
