use std::future::Future;
use std::pin::Pin;

pub mod error;
pub mod history;
pub mod kv;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use history::HistoryStore;
pub use kv::{KeyValueStore, MemoryKeyValueStore};
pub use sqlite::{SqliteKeyValueStore, SqliteLocation};
pub use types::{HISTORY_KEY, Role, Turn, decode_turns, encode_turns};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
