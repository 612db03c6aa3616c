//! In-memory import job storage.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::{debug, info};

use pocketledger_core::{Credential, JobId};
use pocketledger_imports::{JobRecordStore, JobSnapshot, JobStatus, StoreError};

use super::types::{ImportJob, ImportJobError};
use crate::change_feed::InMemoryChangeFeed;

/// Import jobs held in memory, optionally publishing every change to a feed.
///
/// Intended for tests/dev. Failure switches simulate an overloaded backend
/// and row-level permission checks.
#[derive(Debug, Default)]
pub struct InMemoryImportJobStore {
    jobs: RwLock<HashMap<JobId, ImportJob>>,
    restricted: RwLock<HashSet<JobId>>,
    feed: Option<Arc<InMemoryChangeFeed>>,
    unavailable: AtomicBool,
    reads: AtomicUsize,
}

impl InMemoryImportJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish every status change to `feed`.
    pub fn with_feed(feed: Arc<InMemoryChangeFeed>) -> Self {
        Self {
            feed: Some(feed),
            ..Self::default()
        }
    }

    pub fn create(&self, job: ImportJob) -> Result<JobId, ImportJobError> {
        let mut jobs = self
            .jobs
            .write()
            .map_err(|_| ImportJobError::Storage("lock poisoned".to_string()))?;
        if jobs.contains_key(&job.id) {
            return Err(ImportJobError::AlreadyExists(job.id));
        }
        let id = job.id;
        debug!(job_id = %id, status = %job.status, "import job created");
        jobs.insert(id, job);
        Ok(id)
    }

    pub fn get(&self, job_id: JobId) -> Result<Option<ImportJob>, ImportJobError> {
        let jobs = self
            .jobs
            .read()
            .map_err(|_| ImportJobError::Storage("lock poisoned".to_string()))?;
        Ok(jobs.get(&job_id).cloned())
    }

    /// Move `job_id` to `status` and publish the new snapshot.
    pub fn update_status(
        &self,
        job_id: JobId,
        status: JobStatus,
        error_message: Option<String>,
    ) -> Result<ImportJob, ImportJobError> {
        let updated = {
            let mut jobs = self
                .jobs
                .write()
                .map_err(|_| ImportJobError::Storage("lock poisoned".to_string()))?;
            let job = jobs
                .get_mut(&job_id)
                .ok_or(ImportJobError::NotFound(job_id))?;
            job.transition(status, error_message)?;
            job.clone()
        };

        info!(job_id = %job_id, status = %updated.status, "import job status updated");
        if let Some(feed) = &self.feed {
            feed.publish(job_id, updated.snapshot());
        }
        Ok(updated)
    }

    /// Make every read fail as if the backend were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }

    /// Deny reads of `job_id` to every caller.
    pub fn restrict(&self, job_id: JobId) {
        if let Ok(mut restricted) = self.restricted.write() {
            restricted.insert(job_id);
        }
    }

    /// Status reads served so far, failed ones included.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobRecordStore for InMemoryImportJobStore {
    async fn fetch_status(
        &self,
        job_id: JobId,
        credential: &Credential,
    ) -> Result<Option<JobSnapshot>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);

        if self.unavailable.load(Ordering::Acquire) {
            return Err(StoreError::Unavailable("job store offline".to_string()));
        }
        if credential.token().is_empty() {
            return Err(StoreError::PermissionDenied("empty bearer token".to_string()));
        }
        let restricted = self
            .restricted
            .read()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))?;
        if restricted.contains(&job_id) {
            return Err(StoreError::PermissionDenied(format!(
                "row-level policy denies job {job_id}"
            )));
        }
        drop(restricted);

        let jobs = self
            .jobs
            .read()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))?;
        Ok(jobs.get(&job_id).map(ImportJob::snapshot))
    }
}
