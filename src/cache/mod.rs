//! Store Registry: named cache namespaces of network responses.
//!
//! - Namespaces are identified by version-qualified names
//! - Entries are keyed by normalized request identity, last write wins
//! - Backends: in-memory for embedding and tests, SQLite for persistence

mod registry;
mod storage;
mod traits;

pub use registry::StoreRegistry;
pub use storage::{CacheStorage, MemoryStorage, SqliteStorage};
pub use traits::{CachedEntry, NamespaceHandle, NamespaceRole, RequestKey};
