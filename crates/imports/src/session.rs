//! State owned by a single watch call.

use std::sync::atomic::{AtomicBool, Ordering};

use pocketledger_core::JobId;
use tokio::time::Instant;
use tracing::debug;

use crate::channel::{ChannelHealth, ChannelSubscription};
use crate::poller::PollerHandle;
use crate::status::JobStatus;
use crate::watcher::WatchStats;

/// First-writer-wins resolution flag.
#[derive(Debug, Default)]
pub(crate) struct ResolveOnce {
    resolved: AtomicBool,
}

impl ResolveOnce {
    /// Only the first caller gets `true`.
    pub(crate) fn try_claim(&self) -> bool {
        self.resolved
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::Acquire)
    }
}

/// Mutable state of one watch. Owns both notification sources; dropping the
/// session releases them.
pub(crate) struct WatchSession {
    pub(crate) job_id: JobId,
    pub(crate) resolved: ResolveOnce,
    pub(crate) last_known: JobStatus,
    pub(crate) channel_healthy: bool,
    pub(crate) channel_failed: bool,
    /// Channel became healthy before the poller started; polling is off
    /// unless the channel later fails.
    pub(crate) polling_suppressed: bool,
    pub(crate) poll_attempt: u32,
    pub(crate) grace_at: Option<Instant>,
    pub(crate) channel_only_deadline: Option<Instant>,
    pub(crate) channel: Option<Box<dyn ChannelSubscription>>,
    pub(crate) poller: Option<PollerHandle>,
    pub(crate) stats: WatchStats,
}

impl WatchSession {
    pub(crate) fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            resolved: ResolveOnce::default(),
            last_known: JobStatus::Pending,
            channel_healthy: false,
            channel_failed: false,
            polling_suppressed: false,
            poll_attempt: 0,
            grace_at: None,
            channel_only_deadline: None,
            channel: None,
            poller: None,
            stats: WatchStats::default(),
        }
    }

    /// Channel events are only accepted while the subscription is alive.
    pub(crate) fn channel_live(&self) -> bool {
        self.channel.is_some() && !self.channel_failed
    }

    pub(crate) fn record_health(&mut self, health: ChannelHealth) {
        self.stats.channel_health = Some(health);
        match health {
            ChannelHealth::Connecting => {}
            ChannelHealth::Healthy => self.channel_healthy = true,
            ChannelHealth::Failed => {
                self.channel_healthy = false;
                self.channel_failed = true;
            }
        }
    }

    /// Track a non-terminal status for diagnostics.
    pub(crate) fn note_status(&mut self, status: JobStatus) {
        if status != self.last_known {
            debug!(
                job_id = %self.job_id,
                from = %self.last_known,
                to = %status,
                "import job status changed"
            );
            self.last_known = status;
        }
    }

    pub(crate) fn close_channel(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.close();
            debug!(job_id = %self.job_id, "change channel closed");
        }
    }

    pub(crate) fn stop_poller(&mut self) {
        if let Some(mut poller) = self.poller.take() {
            poller.stop();
        }
    }

    /// Release both sources and every pending timer.
    pub(crate) fn teardown(&mut self) {
        self.close_channel();
        self.stop_poller();
        self.grace_at = None;
        self.channel_only_deadline = None;
    }
}

impl Drop for WatchSession {
    fn drop(&mut self) {
        if !self.resolved.is_resolved() {
            debug!(job_id = %self.job_id, "watch dropped before resolving");
        }
        self.teardown();
    }
}
