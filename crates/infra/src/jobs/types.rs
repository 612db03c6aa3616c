//! Import job records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use pocketledger_core::{AccountId, JobId};
use pocketledger_imports::{JobSnapshot, JobStatus};

/// A statement-import job as the backend stores it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportJob {
    pub id: JobId,
    /// Account the statement was uploaded for, if known.
    pub account_id: Option<AccountId>,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ImportJob {
    /// A freshly uploaded statement, waiting to be parsed.
    pub fn new(account_id: Option<AccountId>) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            account_id,
            status: JobStatus::Pending,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = status;
        self
    }

    /// The fields a watcher sees.
    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            status: self.status,
            error_message: self.error_message.clone(),
        }
    }

    /// Move to `status`. Terminal jobs never change again.
    pub fn transition(
        &mut self,
        status: JobStatus,
        error_message: Option<String>,
    ) -> Result<(), ImportJobError> {
        if self.status.is_terminal() {
            return Err(ImportJobError::InvalidTransition {
                job_id: self.id,
                from: self.status,
                to: status,
            });
        }
        self.status = status;
        self.error_message = error_message;
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ImportJobError {
    #[error("import job not found: {0}")]
    NotFound(JobId),
    #[error("import job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("import job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("storage error: {0}")]
    Storage(String),
}
