//! Push subscription to job row changes.
//!
//! The watcher prefers this over polling: one subscription replaces dozens of
//! status reads. It is also the less reliable of the two sources, so the
//! contract is deliberately small:
//!
//! - `ChannelSink::health` reports `Connecting`, `Healthy` or `Failed`
//! - after `Failed` no further events are delivered for that subscription
//! - the channel never reconnects on its own; the watcher decides what to do
//! - `ChannelSubscription::close` is idempotent and safe before `Healthy`

use async_trait::async_trait;
use pocketledger_core::JobId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::status::JobSnapshot;

/// Connection health of a change subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelHealth {
    Connecting,
    Healthy,
    Failed,
}

/// Everything a subscription can report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelSignal {
    Update(JobSnapshot),
    Health(ChannelHealth),
}

/// Callback side of a subscription, handed to `ChangeChannel::open`.
///
/// Sends never block. Once the watcher is gone they are silently dropped.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ChannelSignal>,
}

impl ChannelSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ChannelSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// The upstream reported a change to the job row.
    pub fn event(&self, snapshot: JobSnapshot) {
        let _ = self.tx.send(ChannelSignal::Update(snapshot));
    }

    pub fn health(&self, health: ChannelHealth) {
        let _ = self.tx.send(ChannelSignal::Health(health));
    }

    /// True once the receiving watcher has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Failure to set up a subscription at all.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("change feed unavailable: {0}")]
    Unavailable(String),
    #[error("change feed rejected subscription: {0}")]
    Rejected(String),
}

/// Live subscription owned by exactly one watch session.
pub trait ChannelSubscription: Send {
    /// Release the upstream subscription. Calling it again is a no-op.
    fn close(&mut self);
}

/// Factory for per-job change subscriptions.
#[async_trait]
pub trait ChangeChannel: Send + Sync {
    async fn open(
        &self,
        job_id: JobId,
        sink: ChannelSink,
    ) -> Result<Box<dyn ChannelSubscription>, ChannelError>;
}
