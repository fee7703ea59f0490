use async_trait::async_trait;

use crate::domain::errors::PersistenceError;

/// Durable byte storage for task trees, knowledge and policies.
///
/// Keys are slash-separated (`tasks/<root id>`, `knowledge/entries`, ...).
/// The append log receives one serialized event per call, in call order.
#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    /// Fetch the bytes stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError>;

    /// Store `value` under `key`, replacing what was there.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), PersistenceError>;

    /// Append one entry to the event log.
    async fn append_log(&self, entry: Vec<u8>) -> Result<(), PersistenceError>;
}
