pub mod database;
pub mod error;
pub mod history;
pub mod messages;
pub mod schema;

pub use database::Database;
pub use error::StoreError;
pub use history::{connect_with_retry, HistoryStore, StoreConfig};
pub use messages::{MessageRepo, StoredMessage};
