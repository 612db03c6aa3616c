//! `pocketledger-core`: shared identifiers and primitives.
//!
//! Nothing in here talks to the backend; it is the vocabulary the import
//! watcher and its adapters agree on.

pub mod credential;
pub mod error;
pub mod id;

pub use credential::{Credential, CredentialProvider};
pub use error::CoreError;
pub use id::{AccountId, JobId};
