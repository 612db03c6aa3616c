//! Statement-import job records and their in-memory store.

pub mod store;
pub mod types;

pub use store::InMemoryImportJobStore;
pub use types::{ImportJob, ImportJobError};
