//! Polling fallback for when the change channel cannot be trusted.

use pocketledger_core::JobId;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backoff::BackoffSchedule;
use crate::reader::StatusReader;
use crate::status::JobSnapshot;

/// Event delivered by a running poller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollEvent {
    /// A read succeeded. Delivered whether or not the status changed.
    Snapshot { attempt: u32, snapshot: JobSnapshot },
    /// All attempts used without seeing a terminal status. `snapshot` is
    /// always `processing`.
    Exhausted { attempts: u32, snapshot: JobSnapshot },
}

/// Callback side of a poller.
#[derive(Debug, Clone)]
pub struct PollSink {
    tx: mpsc::UnboundedSender<PollEvent>,
}

impl PollSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PollEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Returns false once nobody is listening any more.
    fn deliver(&self, event: PollEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Handle to a running poller. Dropping it stops the poller.
#[derive(Debug)]
pub struct PollerHandle {
    job_id: JobId,
    task: Option<JoinHandle<()>>,
}

impl PollerHandle {
    /// Cancel any scheduled attempt. Safe to call more than once.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!(job_id = %self.job_id, "status poller stopped");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.task.is_none()
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Re-reads job status on a `BackoffSchedule` until a terminal status is
/// seen or `max_attempts` reads have been scheduled.
///
/// Read errors of any class are logged and the next attempt goes ahead as
/// scheduled.
#[derive(Debug, Clone)]
pub struct BackoffPoller {
    reader: StatusReader,
    schedule: BackoffSchedule,
    max_attempts: u32,
}

impl BackoffPoller {
    pub fn new(reader: StatusReader, schedule: BackoffSchedule, max_attempts: u32) -> Self {
        Self {
            reader,
            schedule,
            max_attempts,
        }
    }

    /// Spawn the poll loop on the current tokio runtime.
    pub fn start(self, job_id: JobId, sink: PollSink) -> PollerHandle {
        info!(
            job_id = %job_id,
            max_attempts = self.max_attempts,
            "starting status poller"
        );
        let task = tokio::spawn(self.run(job_id, sink));
        PollerHandle {
            job_id,
            task: Some(task),
        }
    }

    async fn run(self, job_id: JobId, sink: PollSink) {
        for attempt in 1..=self.max_attempts {
            tokio::time::sleep(self.schedule.interval_for(attempt)).await;

            match self.reader.read(job_id).await {
                Ok(snapshot) => {
                    let terminal = snapshot.is_terminal();
                    if !sink.deliver(PollEvent::Snapshot { attempt, snapshot }) || terminal {
                        return;
                    }
                }
                Err(e) => {
                    warn!(
                        job_id = %job_id,
                        attempt,
                        class = e.class(),
                        error = %e,
                        "status poll failed; retrying on schedule"
                    );
                }
            }
        }

        info!(
            job_id = %job_id,
            attempts = self.max_attempts,
            "status poller exhausted without a terminal status"
        );
        sink.deliver(PollEvent::Exhausted {
            attempts: self.max_attempts,
            snapshot: JobSnapshot::still_processing(),
        });
    }
}
