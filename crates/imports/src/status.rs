//! Job status values as reported by the backend.

use core::str::FromStr;

use pocketledger_core::CoreError;
use serde::{Deserialize, Serialize};

/// Lifecycle status of a statement-import job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Uploaded, waiting for a parser
    Pending,
    /// Parser is running
    Processing,
    /// Parsed rows are waiting for the user to confirm them
    Review,
    /// Rows imported
    Completed,
    /// Parser gave up; see the snapshot's error message
    Failed,
    /// Import withdrawn by the user or an operator
    Cancelled,
}

impl JobStatus {
    /// No further transition is expected from a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Review => "review",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "review" => Ok(JobStatus::Review),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(CoreError::validation(format!("unknown job status: {other}"))),
        }
    }
}

/// Point-in-time view of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub status: JobStatus,
    #[serde(rename = "errorMessage", default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl JobSnapshot {
    pub fn new(status: JobStatus) -> Self {
        Self {
            status,
            error_message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            error_message: Some(message.into()),
        }
    }

    /// Placeholder reported when a watch stops checking before the job
    /// reached a terminal status.
    pub fn still_processing() -> Self {
        Self::new(JobStatus::Processing)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
