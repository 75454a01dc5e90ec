//! Notifications to the UI layer and the blob storage seam.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

use crate::chunk::BLOB_SIZE;

/// Edge notifications. They say that something changed, not what to draw; the UI reads
/// the display queue and peer table itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    MessageAdded,
    PeerJoined { name: String },
    PeerLeft,
    TransferComplete { id: String },
}

pub trait UiEventSink {
    fn notify(&mut self, event: UiEvent);
}

impl UiEventSink for Vec<UiEvent> {
    fn notify(&mut self, event: UiEvent) {
        self.push(event);
    }
}

impl UiEventSink for UnboundedSender<UiEvent> {
    fn notify(&mut self, event: UiEvent) {
        // A closed UI just stops listening.
        let _ = self.send(event);
    }
}

/// Receives each completed inbound blob exactly once.
pub trait BlobSink {
    fn blob_received(&mut self, id: &str, blob: &[u8; BLOB_SIZE]);
}

/// Named 512-byte blobs, owned by the host's file storage.
pub trait BlobStore {
    fn load_blob(&self, name: &str) -> Result<[u8; BLOB_SIZE], StoreError>;
    /// Store a new blob. Never replaces an existing one: `StoreError::Exists`.
    fn save_blob(&mut self, name: &str, blob: &[u8; BLOB_SIZE]) -> Result<(), StoreError>;
}

impl<T: BlobStore> BlobSink for T {
    fn blob_received(&mut self, id: &str, blob: &[u8; BLOB_SIZE]) {
        if let Err(e) = self.save_blob(id, blob) {
            warn!(id, error = %e, "could not store received blob");
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no blob named {0:?}")]
    NotFound(String),
    #[error("a blob named {0:?} already exists")]
    Exists(String),
    #[error("blob is {len} bytes, expected 512")]
    InvalidSize { len: usize },
    #[error("invalid blob name {0:?}")]
    InvalidName(String),
    #[error("blob store unavailable")]
    Unavailable,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// In-memory store. Clones share the same contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<Mutex<HashMap<String, [u8; BLOB_SIZE]>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlobStore for MemoryBlobStore {
    fn load_blob(&self, name: &str) -> Result<[u8; BLOB_SIZE], StoreError> {
        let blobs = self.blobs.lock().map_err(|_| StoreError::Unavailable)?;
        blobs
            .get(name)
            .copied()
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    fn save_blob(&mut self, name: &str, blob: &[u8; BLOB_SIZE]) -> Result<(), StoreError> {
        let mut blobs = self.blobs.lock().map_err(|_| StoreError::Unavailable)?;
        match blobs.entry(name.to_string()) {
            Entry::Occupied(_) => Err(StoreError::Exists(name.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(*blob);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_shares_contents_between_clones() {
        let mut a = MemoryBlobStore::new();
        let b = a.clone();
        assert!(matches!(b.load_blob("x"), Err(StoreError::NotFound(_))));
        a.save_blob("x", &[7u8; BLOB_SIZE]).unwrap();
        assert_eq!(b.load_blob("x").unwrap(), [7u8; BLOB_SIZE]);
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn store_acts_as_sink() {
        let store = MemoryBlobStore::new();
        let mut sink: Box<dyn BlobSink> = Box::new(store.clone());
        sink.blob_received("pic", &[1u8; BLOB_SIZE]);
        assert_eq!(store.load_blob("pic").unwrap()[0], 1);
    }

    #[test]
    fn received_blob_does_not_replace_a_local_one() {
        let mut store = MemoryBlobStore::new();
        store.save_blob("pic", &[1u8; BLOB_SIZE]).unwrap();
        let mut sink: Box<dyn BlobSink> = Box::new(store.clone());
        sink.blob_received("pic", &[9u8; BLOB_SIZE]);
        assert_eq!(store.load_blob("pic").unwrap()[0], 1);
        assert!(matches!(
            store.save_blob("pic", &[2u8; BLOB_SIZE]),
            Err(StoreError::Exists(_))
        ));
    }

    #[test]
    fn channel_sink_forwards() {
        let (mut tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        tx.notify(UiEvent::MessageAdded);
        assert_eq!(rx.try_recv().unwrap(), UiEvent::MessageAdded);
        drop(rx);
        tx.notify(UiEvent::PeerLeft);
    }
}
