//! Volatile persistence adapter for tests and throwaway cores.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::domain::errors::PersistenceError;
use crate::domain::ports::PersistenceAdapter;

#[derive(Default)]
pub struct InMemoryPersistence {
    values: RwLock<HashMap<String, Vec<u8>>>,
    log: RwLock<Vec<Vec<u8>>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every appended log entry, oldest first.
    pub async fn log_entries(&self) -> Vec<Vec<u8>> {
        self.log.read().await.clone()
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.values.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl PersistenceAdapter for InMemoryPersistence {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        Ok(self.values.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), PersistenceError> {
        self.values.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn append_log(&self, entry: Vec<u8>) -> Result<(), PersistenceError> {
        self.log.write().await.push(entry);
        Ok(())
    }
}
