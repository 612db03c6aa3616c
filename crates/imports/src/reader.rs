//! Point-in-time status reads.

use std::sync::Arc;

use async_trait::async_trait;
use pocketledger_core::{Credential, CredentialProvider, JobId};
use thiserror::Error;
use tracing::debug;

use crate::status::JobSnapshot;

/// Backend record store holding import job rows.
///
/// Implementations run an authenticated query for a single row. A missing
/// row is `Ok(None)`, not an error.
#[async_trait]
pub trait JobRecordStore: Send + Sync {
    async fn fetch_status(
        &self,
        job_id: JobId,
        credential: &Credential,
    ) -> Result<Option<JobSnapshot>, StoreError>;
}

/// Failure reported by a `JobRecordStore`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The row-level permission layer rejected the query.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// Network, timeout, backend overload, ...
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Failure of a single status read.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReadError {
    #[error("authentication required to read job status")]
    AuthRequired,
    #[error("import job {0} not found")]
    NotFound(JobId),
    #[error("status read rejected by permission layer: {0}")]
    PermissionDenied(String),
    #[error("transient status read failure: {0}")]
    Transient(String),
}

impl ReadError {
    /// Fatal errors abort a watch when they happen on the first read.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ReadError::AuthRequired | ReadError::NotFound(_))
    }

    /// Short label for structured logs.
    pub fn class(&self) -> &'static str {
        match self {
            ReadError::AuthRequired => "auth",
            ReadError::NotFound(_) => "not_found",
            ReadError::PermissionDenied(_) => "permission",
            ReadError::Transient(_) => "transient",
        }
    }
}

/// Reads the current status of an import job.
#[derive(Clone)]
pub struct StatusReader {
    store: Arc<dyn JobRecordStore>,
    credentials: Option<Arc<dyn CredentialProvider>>,
}

impl StatusReader {
    pub fn new(
        store: Arc<dyn JobRecordStore>,
        credentials: Option<Arc<dyn CredentialProvider>>,
    ) -> Self {
        Self { store, credentials }
    }

    pub async fn read(&self, job_id: JobId) -> Result<JobSnapshot, ReadError> {
        let credential = self
            .credentials
            .as_ref()
            .and_then(|provider| provider.credential())
            .ok_or(ReadError::AuthRequired)?;

        match self.store.fetch_status(job_id, &credential).await {
            Ok(Some(snapshot)) => {
                debug!(job_id = %job_id, status = %snapshot.status, "read import job status");
                Ok(snapshot)
            }
            Ok(None) => Err(ReadError::NotFound(job_id)),
            Err(StoreError::PermissionDenied(msg)) => Err(ReadError::PermissionDenied(msg)),
            Err(StoreError::Unavailable(msg)) => Err(ReadError::Transient(msg)),
        }
    }
}

impl core::fmt::Debug for StatusReader {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StatusReader")
            .field("has_credentials", &self.credentials.is_some())
            .finish()
    }
}
