//! Chunk sub-protocol: a 512-byte blob carried as 8 hex-encoded text chunks.
//!
//! Payload format: `TRANSFER:<id>:<index 0-7>:<128 hex chars>`.

use tracing::debug;

use crate::events::StoreError;
use crate::text;

pub const BLOB_SIZE: usize = 512;
pub const CHUNK_COUNT: usize = 8;
pub const CHUNK_SIZE: usize = BLOB_SIZE / CHUNK_COUNT;
pub const CHUNK_MARKER: &str = "TRANSFER:";

/// Longest id that keeps a chunk payload inside one frame (9 + 21 + 1 + 1 + 1 + 128 = 161).
pub const MAX_TRANSFER_ID_LEN: usize = 21;

/// Inbound transfers idle for longer than this are dropped by `expire`.
pub const DEFAULT_TRANSFER_TTL_MS: u64 = 30_000;

const ALL_CHUNKS: u8 = 0xFF;

pub type TransferId = heapless::String<MAX_TRANSFER_ID_LEN>;

pub fn is_chunk_payload(content: &str) -> bool {
    content.starts_with(CHUNK_MARKER)
}

/// Ids are 1..=21 characters and must not contain the field separator.
pub fn validate_transfer_id(id: &str) -> Result<TransferId, TransferError> {
    if id.is_empty() || id.len() > MAX_TRANSFER_ID_LEN || id.contains(':') {
        return Err(TransferError::InvalidId(id.to_string()));
    }
    Ok(text::bounded(id))
}

pub fn format_chunk(id: &str, index: usize, data: &[u8]) -> String {
    format!("{CHUNK_MARKER}{id}:{index}:{}", hex::encode_upper(data))
}

/// The 8 chunk payloads for `blob`, in index order.
pub fn split_into_chunks(id: &str, blob: &[u8; BLOB_SIZE]) -> Result<Vec<String>, TransferError> {
    let id = validate_transfer_id(id)?;
    Ok(blob
        .chunks_exact(CHUNK_SIZE)
        .enumerate()
        .map(|(index, data)| format_chunk(&id, index, data))
        .collect())
}

struct ParsedChunk<'a> {
    id: &'a str,
    index: usize,
    hex: &'a str,
}

/// None for anything that is not a well-formed chunk header with an index in 0..8.
fn parse_chunk(payload: &str) -> Option<ParsedChunk<'_>> {
    let rest = payload.strip_prefix(CHUNK_MARKER)?;
    let mut fields = rest.splitn(3, ':');
    let id = fields.next()?;
    let index: usize = fields.next()?.parse().ok()?;
    let hex = fields.next()?;
    if id.is_empty() || id.len() > MAX_TRANSFER_ID_LEN || index >= CHUNK_COUNT {
        return None;
    }
    Some(ParsedChunk { id, index, hex })
}

/// A fully reassembled blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedBlob {
    pub id: TransferId,
    pub data: Box<[u8; BLOB_SIZE]>,
}

/// In-progress inbound transfer.
#[derive(Debug, Clone)]
pub struct ChunkTransfer {
    id: TransferId,
    buffer: Box<[u8; BLOB_SIZE]>,
    received: u8,
    last_update_ms: u64,
}

impl ChunkTransfer {
    fn new(id: &str, now_ms: u64) -> Self {
        Self {
            id: text::bounded(id),
            buffer: Box::new([0u8; BLOB_SIZE]),
            received: 0,
            last_update_ms: now_ms,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn received_count(&self) -> u32 {
        self.received.count_ones()
    }

    pub fn has_chunk(&self, index: usize) -> bool {
        index < CHUNK_COUNT && self.received & (1 << index) != 0
    }

    pub fn is_complete(&self) -> bool {
        self.received == ALL_CHUNKS
    }

    /// Decode whole hex pairs into the chunk's slice. A short or bad payload leaves the
    /// rest of the slice as it was.
    fn store(&mut self, index: usize, hex: &str) {
        let slice = &mut self.buffer[index * CHUNK_SIZE..(index + 1) * CHUNK_SIZE];
        for (dst, pair) in slice.iter_mut().zip(hex.as_bytes().chunks_exact(2)) {
            let mut byte = [0u8; 1];
            if hex::decode_to_slice(pair, &mut byte).is_err() {
                break;
            }
            *dst = byte[0];
        }
        self.received |= 1 << index;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkReceiveResult {
    /// Not a usable chunk (bad header or index out of range). No state changed.
    Ignored,
    /// Chunk stored; transfer not yet complete.
    InProgress { received: u32 },
    /// That index was already stored for this transfer.
    Duplicate,
    /// Last chunk stored; in-progress state has been cleared.
    Complete(CompletedBlob),
}

/// Receiver side. One transfer at a time: a chunk for a different id replaces the
/// partial transfer wholesale.
#[derive(Debug, Default)]
pub struct ChunkReassembler {
    current: Option<ChunkTransfer>,
}

impl ChunkReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_progress(&self) -> Option<&ChunkTransfer> {
        self.current.as_ref()
    }

    pub fn accept(&mut self, payload: &str, now_ms: u64) -> ChunkReceiveResult {
        let Some(chunk) = parse_chunk(payload) else {
            return ChunkReceiveResult::Ignored;
        };

        let same = self
            .current
            .as_ref()
            .is_some_and(|t| t.id.as_str() == chunk.id);
        if !same {
            if let Some(old) = &self.current {
                debug!(
                    old = old.id(),
                    new = chunk.id,
                    received = old.received_count(),
                    "partial transfer replaced"
                );
            }
            self.current = Some(ChunkTransfer::new(chunk.id, now_ms));
        }
        let Some(transfer) = self.current.as_mut() else {
            return ChunkReceiveResult::Ignored;
        };

        if transfer.has_chunk(chunk.index) {
            return ChunkReceiveResult::Duplicate;
        }
        transfer.store(chunk.index, chunk.hex);
        transfer.last_update_ms = now_ms;

        if !transfer.is_complete() {
            return ChunkReceiveResult::InProgress {
                received: transfer.received_count(),
            };
        }
        match self.current.take() {
            Some(done) => ChunkReceiveResult::Complete(CompletedBlob {
                id: done.id,
                data: done.buffer,
            }),
            None => ChunkReceiveResult::Ignored,
        }
    }

    /// Drop the in-progress transfer if it has this id.
    pub fn abort(&mut self, id: &str) -> bool {
        if self.current.as_ref().is_some_and(|t| t.id.as_str() == id) {
            self.current = None;
            true
        } else {
            false
        }
    }

    /// Drop the in-progress transfer if nothing arrived for it for more than `ttl_ms`.
    pub fn expire(&mut self, now_ms: u64, ttl_ms: u64) -> Option<TransferId> {
        let stale = self
            .current
            .as_ref()
            .is_some_and(|t| now_ms.saturating_sub(t.last_update_ms) > ttl_ms);
        if stale {
            self.current.take().map(|t| t.id)
        } else {
            None
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("transfer id {0:?} must be 1..=21 characters without ':'")]
    InvalidId(String),
    #[error("transfer {0:?} is already queued")]
    Duplicate(String),
    #[error("not joined to a network")]
    NotJoined,
    #[error("unknown peer {0:?}")]
    UnknownPeer(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}
