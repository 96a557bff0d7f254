//! External state-store and secret-store interfaces.
//!
//! The relay persists one record per chain plus a separate namespace of
//! secret values addressable only by key id. Both surfaces are consumed as
//! traits; the in-memory implementation backs tests and single-process runs,
//! while production embedders supply their own store.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use zeroize::Zeroizing;

use crate::state::ChainState;

/// Secret-store namespace for blockchain private keys.
pub const KEY_NAMESPACE: &str = "blockchainKeys";

/// Store failure, surfaced to callers as a processing error.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("cannot serialize state record: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("state store backend failure: {0}")]
    Backend(String),
}

/// Persistent state for blockchains and queues.
///
/// Upserts are whole-record: the caller owns read-modify-write. Writes are
/// idempotent, so coalescing repeated updates of the same record is safe.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Reads the state record for a chain, `None` when never persisted.
    async fn blockchain_data(&self, chain: &str) -> Result<Option<ChainState>, StoreError>;

    /// Whole-record upsert of a chain's state.
    async fn update_blockchain_data(
        &self,
        chain: &str,
        state: &ChainState,
    ) -> Result<(), StoreError>;

    /// Opaque queue read-through.
    async fn queue(&self, name: &str) -> Result<Vec<Value>, StoreError>;
}

/// Secret values, write-only from the account manager and read-only from
/// the signing paths. Entries are addressable only by `(namespace, key_id)`.
#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn key(
        &self,
        namespace: &str,
        key_id: &str,
    ) -> Result<Option<Zeroizing<Vec<u8>>>, StoreError>;

    async fn upsert_key(
        &self,
        namespace: &str,
        key_id: &str,
        value: &[u8],
    ) -> Result<(), StoreError>;

    async fn delete_key(&self, namespace: &str, key_id: &str) -> Result<(), StoreError>;
}

/// In-memory store backing tests and single-process runs.
#[derive(Default)]
pub struct MemoryStore {
    records: DashMap<String, Value>,
    secrets: DashMap<String, Zeroizing<Vec<u8>>>,
    queues: DashMap<String, Vec<Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn secret_key(namespace: &str, key_id: &str) -> String {
        format!("{namespace}/{key_id}")
    }

    /// Seeds a queue, test helper for the read-through surface.
    pub fn seed_queue(&self, name: &str, items: Vec<Value>) {
        self.queues.insert(name.to_owned(), items);
    }
}

// Secrets are elided: a Debug rendering must never leak key material.
impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("records", &self.records.len())
            .field("secrets", &self.secrets.len())
            .field("queues", &self.queues.len())
            .finish()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn blockchain_data(&self, chain: &str) -> Result<Option<ChainState>, StoreError> {
        match self.records.get(chain) {
            Some(record) => Ok(Some(serde_json::from_value(record.value().clone())?)),
            None => Ok(None),
        }
    }

    async fn update_blockchain_data(
        &self,
        chain: &str,
        state: &ChainState,
    ) -> Result<(), StoreError> {
        let record = serde_json::to_value(state)?;
        self.records.insert(chain.to_owned(), record);
        Ok(())
    }

    async fn queue(&self, name: &str) -> Result<Vec<Value>, StoreError> {
        Ok(self
            .queues
            .get(name)
            .map(|q| q.value().clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl KeyStore for MemoryStore {
    async fn key(
        &self,
        namespace: &str,
        key_id: &str,
    ) -> Result<Option<Zeroizing<Vec<u8>>>, StoreError> {
        Ok(self
            .secrets
            .get(&Self::secret_key(namespace, key_id))
            .map(|v| v.value().clone()))
    }

    async fn upsert_key(
        &self,
        namespace: &str,
        key_id: &str,
        value: &[u8],
    ) -> Result<(), StoreError> {
        self.secrets.insert(
            Self::secret_key(namespace, key_id),
            Zeroizing::new(value.to_vec()),
        );
        Ok(())
    }

    async fn delete_key(&self, namespace: &str, key_id: &str) -> Result<(), StoreError> {
        self.secrets.remove(&Self::secret_key(namespace, key_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{NodeParameters, NodeStatus};

    #[tokio::test]
    async fn state_record_round_trips() {
        let store = MemoryStore::new();
        assert!(store.blockchain_data("main").await.unwrap().is_none());

        let state = ChainState {
            parameters: NodeParameters {
                chain_id: 1,
                ..NodeParameters::default()
            },
            status: NodeStatus {
                current_block: 42,
                ..NodeStatus::default()
            },
            accounts: vec![],
        };
        store.update_blockchain_data("main", &state).await.unwrap();
        let read = store.blockchain_data("main").await.unwrap().unwrap();
        assert_eq!(read, state);
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let store = MemoryStore::new();
        let state = ChainState::default();
        store.update_blockchain_data("main", &state).await.unwrap();
        store.update_blockchain_data("main", &state).await.unwrap();
        assert_eq!(store.records.len(), 1);
    }

    #[tokio::test]
    async fn secrets_are_scoped_by_namespace_and_id() {
        let store = MemoryStore::new();
        store
            .upsert_key(KEY_NAMESPACE, "aabbcc", &[1, 2, 3])
            .await
            .unwrap();
        assert!(
            store
                .key(KEY_NAMESPACE, "aabbcc")
                .await
                .unwrap()
                .is_some()
        );
        assert!(store.key("other", "aabbcc").await.unwrap().is_none());

        store.delete_key(KEY_NAMESPACE, "aabbcc").await.unwrap();
        assert!(store.key(KEY_NAMESPACE, "aabbcc").await.unwrap().is_none());
    }

    #[test]
    fn debug_rendering_elides_secret_bytes() {
        let store = MemoryStore::new();
        store.secrets.insert(
            "blockchainKeys/aabbcc".to_owned(),
            Zeroizing::new(vec![0xde, 0xad]),
        );
        let rendered = format!("{store:?}");
        assert!(!rendered.contains("de"));
        assert!(rendered.contains("secrets: 1"));
    }
}
