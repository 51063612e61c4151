//! Durable storage for configured keys.
//!
//! The replicator loads every stored envelope once at startup and writes
//! through on each change to a durable key. Stored envelopes never carry
//! delta versions.

use crate::envelope::DataEnvelope;
use crate::error::StoreError;
use crate::message::KeyId;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Maximum number of entries per `LoadData` event.
pub const LOAD_BATCH_SIZE: usize = 100;

/// Split loaded entries into `LoadData` batches of at most `batch_size`,
/// in key order.
pub fn load_batches(
    entries: BTreeMap<KeyId, DataEnvelope>,
    batch_size: usize,
) -> impl Iterator<Item = BTreeMap<KeyId, DataEnvelope>> {
    let batch_size = batch_size.max(1);
    let mut entries = entries.into_iter().peekable();
    std::iter::from_fn(move || {
        entries.peek()?;
        Some(entries.by_ref().take(batch_size).collect())
    })
}

#[async_trait]
pub trait DurableStore: Send + Sync + 'static {
    /// Every stored entry. Called once, before the replicator serves
    /// requests.
    async fn load_all(&self) -> Result<BTreeMap<KeyId, DataEnvelope>, StoreError>;

    async fn store(&self, key: &str, envelope: &DataEnvelope) -> Result<(), StoreError>;
}

/// In-memory store. Clones share contents, so a test can restart a
/// replicator against the same data.
#[derive(Clone, Debug, Default)]
pub struct MemoryDurableStore {
    entries: Arc<RwLock<BTreeMap<KeyId, DataEnvelope>>>,
    fail_writes: Arc<AtomicBool>,
    fail_load: Arc<AtomicBool>,
}

impl MemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent writes fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_load(&self, fail: bool) {
        self.fail_load.store(fail, Ordering::SeqCst);
    }

    pub fn get(&self, key: &str) -> Option<DataEnvelope> {
        self.entries.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl DurableStore for MemoryDurableStore {
    async fn load_all(&self) -> Result<BTreeMap<KeyId, DataEnvelope>, StoreError> {
        if self.fail_load.load(Ordering::SeqCst) {
            return Err(StoreError::Load("load failure injected".to_string()));
        }
        Ok(self.entries.read().clone())
    }

    async fn store(&self, key: &str, envelope: &DataEnvelope) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Store {
                key: key.to_string(),
                reason: "write failure injected".to_string(),
            });
        }
        self.entries.write().insert(key.to_string(), envelope.clone());
        Ok(())
    }
}
