//! Infrastructure adapters for the import watcher: job storage, change feed
//! and query cache.
//!
//! All three are in-memory. Intended for tests/dev.

pub mod change_feed;
pub mod jobs;
pub mod query_cache;

pub use change_feed::{FeedMode, InMemoryChangeFeed};
pub use jobs::{ImportJob, ImportJobError, InMemoryImportJobStore};
pub use query_cache::QueryCache;
