//! Async history-store facade.
//!
//! SQLite calls are blocking; every operation here runs on the blocking pool
//! so a slow disk never stalls socket I/O.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use relay_core::MessageRecord;

use crate::database::Database;
use crate::error::StoreError;
use crate::messages::{MessageRepo, StoredMessage};

#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Database file. `None` keeps history in memory for the process lifetime.
    pub path: Option<PathBuf>,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_retries: 5,
            retry_delay: Duration::from_secs(5),
        }
    }
}

/// Shared handle to the message history.
#[derive(Clone)]
pub struct HistoryStore {
    db: Database,
    repo: Arc<MessageRepo>,
}

impl HistoryStore {
    pub fn new(db: Database) -> Self {
        Self {
            repo: Arc::new(MessageRepo::new(db.clone())),
            db,
        }
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Ok(Self::new(Database::in_memory()?))
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub async fn append(&self, record: MessageRecord) -> Result<i64, StoreError> {
        let repo = self.repo.clone();
        tokio::task::spawn_blocking(move || repo.append(&record)).await?
    }

    pub async fn history_for(
        &self,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let repo = self.repo.clone();
        let user_id = user_id.to_owned();
        tokio::task::spawn_blocking(move || repo.history_for(&user_id, limit)).await?
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || db.ping()).await?
    }
}

/// Open the store, retrying up to `max_retries` times with a fixed delay.
pub async fn connect_with_retry(config: &StoreConfig) -> Result<HistoryStore, StoreError> {
    let attempts = config.max_retries.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        let path = config.path.clone();
        let opened = tokio::task::spawn_blocking(move || match path {
            Some(path) => Database::open(&path),
            None => Database::in_memory(),
        })
        .await
        .map_err(StoreError::from)
        .and_then(|r| r);

        match opened {
            Ok(db) => {
                let store = HistoryStore::new(db);
                match store.ping().await {
                    Ok(()) => {
                        info!(attempt, path = %store.database().path().display(), "connected to history store");
                        return Ok(store);
                    }
                    Err(e) => last_error = e.to_string(),
                }
            }
            Err(e) => last_error = e.to_string(),
        }

        warn!(attempt, max = attempts, error = %last_error, "history store connection failed");
        if attempt < attempts {
            tokio::time::sleep(config.retry_delay).await;
        }
    }

    Err(StoreError::Unavailable {
        attempts,
        last_error,
    })
}
