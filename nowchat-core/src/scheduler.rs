//! Outgoing transfer scheduler: hands out one chunk per pacing slot.
//!
//! Transfers run one at a time in FIFO order. The host drives it through
//! `ProtocolEngine::poll`, so pacing never blocks the application loop.

use std::collections::VecDeque;

use crate::chunk::{self, TransferError, TransferId, BLOB_SIZE, CHUNK_COUNT};
use crate::text::DeviceId;

/// Gap between consecutive chunk frames.
pub const CHUNK_INTERVAL_MS: u64 = 250;

/// Where a transfer's chunks go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutgoingTarget {
    Broadcast { channel: u8 },
    Direct { device_id: DeviceId },
}

#[derive(Debug)]
struct OutgoingTransfer {
    id: TransferId,
    chunks: Vec<String>,
    next_index: usize,
    target: OutgoingTarget,
}

/// A chunk whose slot has come up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueChunk {
    pub id: TransferId,
    pub index: usize,
    pub payload: String,
    pub target: OutgoingTarget,
    /// True for the final chunk of its transfer.
    pub last: bool,
}

#[derive(Debug)]
pub struct TransferScheduler {
    queue: VecDeque<OutgoingTransfer>,
    interval_ms: u64,
    next_slot_ms: u64,
}

impl Default for TransferScheduler {
    fn default() -> Self {
        Self::new(CHUNK_INTERVAL_MS)
    }
}

impl TransferScheduler {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            queue: VecDeque::new(),
            interval_ms,
            next_slot_ms: 0,
        }
    }

    /// Queue a blob. Ids must be unique among queued transfers.
    pub fn enqueue(
        &mut self,
        id: &str,
        blob: &[u8; BLOB_SIZE],
        target: OutgoingTarget,
    ) -> Result<(), TransferError> {
        let id = chunk::validate_transfer_id(id)?;
        if self.queue.iter().any(|t| t.id == id) {
            return Err(TransferError::Duplicate(id.to_string()));
        }
        let chunks = chunk::split_into_chunks(&id, blob)?;
        self.queue.push_back(OutgoingTransfer {
            id,
            chunks,
            next_index: 0,
            target,
        });
        Ok(())
    }

    /// Next chunk if its slot is due at `now_ms`. Advances the transfer and books the
    /// following slot.
    pub fn poll_due(&mut self, now_ms: u64) -> Option<DueChunk> {
        if now_ms < self.next_slot_ms {
            return None;
        }
        let transfer = self.queue.front_mut()?;
        let index = transfer.next_index;
        let payload = std::mem::take(&mut transfer.chunks[index]);
        transfer.next_index += 1;
        let last = transfer.next_index == CHUNK_COUNT;
        let due = DueChunk {
            id: transfer.id.clone(),
            index,
            payload,
            target: transfer.target.clone(),
            last,
        };
        if last {
            self.queue.pop_front();
        }
        self.next_slot_ms = now_ms + self.interval_ms;
        Some(due)
    }

    /// Stop a queued or running transfer before its next chunk.
    pub fn cancel(&mut self, id: &str) -> bool {
        let before = self.queue.len();
        self.queue.retain(|t| t.id.as_str() != id);
        self.queue.len() != before
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
    }

    /// Queued transfer ids with the number of chunks already sent, front first.
    pub fn pending(&self) -> impl Iterator<Item = (&str, usize)> {
        self.queue.iter().map(|t| (t.id.as_str(), t.next_index))
    }
}
