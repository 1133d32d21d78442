/*!
Persistence of process envelopes.

This module defines the store abstraction (port) and its adapters. The
orchestrator only ever talks to [`ProcessStore`]; where the envelopes end up
is decided when the engine is built.
*/

pub mod local;

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::{AipError, ProcessEnvelope, ProcessId, Result};

pub use local::FileProcessStore;

/// Keyed persistence for process envelopes
///
/// Implementations must serialize writes per id: an `update` never
/// interleaves with another write of the same envelope.
pub trait ProcessStore: Send + Sync {
    /// Smallest id not used by any stored process
    fn next_id(&self) -> Result<ProcessId>;

    /// Store a new envelope
    ///
    /// Fails with [`AipError::AlreadyExists`] if the id is taken, in which
    /// case the caller should pick a new id and retry.
    fn insert(&self, envelope: &ProcessEnvelope) -> Result<()>;

    /// Replace an existing envelope
    fn update(&self, envelope: &ProcessEnvelope) -> Result<()>;

    /// Load an envelope and check its integrity
    fn load(&self, id: ProcessId) -> Result<ProcessEnvelope>;

    /// Check if a process with this id is stored
    fn exists(&self, id: ProcessId) -> bool;

    /// All stored envelopes, ordered by id
    fn list(&self) -> Result<Vec<ProcessEnvelope>>;
}

/// In-memory store, shareable between clones
///
/// Envelopes are kept as serialized JSON so that loading goes through the
/// same encode/decode cycle as the file store.
#[derive(Debug, Clone, Default)]
pub struct MemoryProcessStore {
    data: Arc<RwLock<BTreeMap<ProcessId, Vec<u8>>>>,
}

impl MemoryProcessStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn decode(bytes: &[u8]) -> Result<ProcessEnvelope> {
        let envelope: ProcessEnvelope = serde_json::from_slice(bytes)?;
        envelope.verify_integrity()?;
        Ok(envelope)
    }
}

impl ProcessStore for MemoryProcessStore {
    fn next_id(&self) -> Result<ProcessId> {
        let data = self
            .data
            .read()
            .map_err(|_| AipError::storage("process store lock poisoned"))?;
        let next = data.keys().next_back().map(|id| id.get() + 1).unwrap_or(1);
        ProcessId::new(next).ok_or_else(|| AipError::storage("process ids exhausted"))
    }

    fn insert(&self, envelope: &ProcessEnvelope) -> Result<()> {
        let bytes = serde_json::to_vec(envelope)?;
        let mut data = self
            .data
            .write()
            .map_err(|_| AipError::storage("process store lock poisoned"))?;
        if data.contains_key(&envelope.id) {
            return Err(AipError::AlreadyExists(envelope.id));
        }
        data.insert(envelope.id, bytes);
        Ok(())
    }

    fn update(&self, envelope: &ProcessEnvelope) -> Result<()> {
        let bytes = serde_json::to_vec(envelope)?;
        let mut data = self
            .data
            .write()
            .map_err(|_| AipError::storage("process store lock poisoned"))?;
        match data.get_mut(&envelope.id) {
            Some(slot) => {
                *slot = bytes;
                Ok(())
            }
            None => Err(AipError::NotFound(envelope.id)),
        }
    }

    fn load(&self, id: ProcessId) -> Result<ProcessEnvelope> {
        let data = self
            .data
            .read()
            .map_err(|_| AipError::storage("process store lock poisoned"))?;
        let bytes = data.get(&id).ok_or(AipError::NotFound(id))?;
        Self::decode(bytes)
    }

    fn exists(&self, id: ProcessId) -> bool {
        self.data
            .read()
            .map(|data| data.contains_key(&id))
            .unwrap_or(false)
    }

    fn list(&self) -> Result<Vec<ProcessEnvelope>> {
        let data = self
            .data
            .read()
            .map_err(|_| AipError::storage("process store lock poisoned"))?;
        data.values().map(|bytes| Self::decode(bytes)).collect()
    }
}
