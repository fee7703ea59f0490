pub mod memory;
pub mod sqlite;

use std::sync::Arc;

pub use memory::InMemoryPersistence;
pub use sqlite::SqlitePersistence;

use crate::domain::errors::PersistenceError;
use crate::domain::models::config::{PersistenceBackend, PersistenceConfig};
use crate::domain::ports::PersistenceAdapter;

/// Open the adapter selected by `config`.
pub async fn open_configured(
    config: &PersistenceConfig,
) -> Result<Arc<dyn PersistenceAdapter>, PersistenceError> {
    match config.backend {
        PersistenceBackend::Memory => Ok(Arc::new(InMemoryPersistence::new())),
        PersistenceBackend::Sqlite => Ok(Arc::new(SqlitePersistence::open(&config.path).await?)),
    }
}
