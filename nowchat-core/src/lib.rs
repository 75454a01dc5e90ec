//! NowChat protocol core: authenticated chat over a short-range broadcast radio link.
//! Host-driven: no I/O of its own; the host feeds received frames and the clock in and
//! supplies the link to send on.

pub mod chunk;
pub mod display;
pub mod engine;
pub mod events;
pub mod ffi;
pub mod identity;
pub mod inbound;
pub mod link;
pub mod peers;
pub mod protocol;
pub mod scheduler;
pub mod security;
pub mod stats;
pub mod text;
pub mod wire;

pub use chunk::{ChunkReassembler, ChunkReceiveResult, TransferError, BLOB_SIZE};
pub use display::{DisplayMessage, DisplayQueue};
pub use engine::{EngineConfig, ProtocolEngine, SendError};
pub use events::{BlobSink, BlobStore, MemoryBlobStore, StoreError, UiEvent, UiEventSink};
pub use identity::DeviceIdentity;
pub use inbound::{inbound_channel, InboundQueue, ReceiveHandle, VerifiedFrame};
pub use link::{LinkAddress, RadioLink};
pub use peers::{Peer, PeerError, PeerRegistry};
pub use protocol::{MessageType, PROTOCOL_VERSION};
pub use scheduler::OutgoingTarget;
pub use security::{FrameVerifier, SecurityError, SecurityManager, StateError, TagCheck};
pub use stats::LinkStats;
pub use wire::{FrameError, WireFrame};
