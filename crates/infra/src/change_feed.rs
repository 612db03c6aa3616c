//! In-process change feed for import job rows.
//!
//! Each job id gets its own broadcast topic. Opening a subscription reports
//! `Connecting`, then `Healthy` once the forwarding task is running. The feed
//! can be switched to an unreachable or stalled mode to exercise the
//! watcher's polling fallback.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use pocketledger_core::JobId;
use pocketledger_imports::{
    ChangeChannel, ChannelError, ChannelHealth, ChannelSink, ChannelSubscription, JobSnapshot,
};

const DEFAULT_CAPACITY: usize = 64;

/// How new subscriptions behave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FeedMode {
    /// Subscriptions become healthy and forward updates.
    Live = 0,
    /// Subscriptions report `Failed` right after connecting.
    Unreachable = 1,
    /// Subscriptions stay `Connecting` and never deliver anything.
    Stalled = 2,
}

impl FeedMode {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => FeedMode::Unreachable,
            2 => FeedMode::Stalled,
            _ => FeedMode::Live,
        }
    }
}

#[derive(Debug)]
struct Topic {
    sender: broadcast::Sender<JobSnapshot>,
    subscribers: usize,
    /// Tells a re-created topic apart from one dropped by `disconnect`.
    epoch: u64,
}

type TopicRegistry = Arc<RwLock<HashMap<JobId, Topic>>>;

/// Broadcast fan-out of job snapshots, keyed by job id.
///
/// A topic exists while at least one subscription to it is open.
#[derive(Debug)]
pub struct InMemoryChangeFeed {
    topics: TopicRegistry,
    next_epoch: AtomicU64,
    capacity: usize,
    mode: AtomicU8,
    opens: AtomicUsize,
    closes: Arc<AtomicUsize>,
}

impl Default for InMemoryChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryChangeFeed {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// `capacity` bounds how far a slow subscriber may lag per topic.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: Arc::new(RwLock::new(HashMap::new())),
            next_epoch: AtomicU64::new(0),
            capacity: capacity.max(1),
            mode: AtomicU8::new(FeedMode::Live as u8),
            opens: AtomicUsize::new(0),
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn mode(&self) -> FeedMode {
        FeedMode::from_u8(self.mode.load(Ordering::Acquire))
    }

    /// Affects subscriptions opened after the call.
    pub fn set_mode(&self, mode: FeedMode) {
        self.mode.store(mode as u8, Ordering::Release);
    }

    /// Shorthand for switching between `Live` and `Unreachable`.
    pub fn set_available(&self, available: bool) {
        self.set_mode(if available {
            FeedMode::Live
        } else {
            FeedMode::Unreachable
        });
    }

    /// Send `snapshot` to every open subscription for `job_id`.
    ///
    /// Returns the number of subscriptions reached.
    pub fn publish(&self, job_id: JobId, snapshot: JobSnapshot) -> usize {
        let sender = match self.topics.read() {
            Ok(topics) => topics.get(&job_id).map(|topic| topic.sender.clone()),
            Err(_) => return 0,
        };
        match sender {
            Some(sender) => sender.send(snapshot).unwrap_or(0),
            None => 0,
        }
    }

    /// Drop the topic for `job_id`. Open subscriptions see the connection
    /// fail.
    pub fn disconnect(&self, job_id: JobId) {
        if let Ok(mut topics) = self.topics.write() {
            topics.remove(&job_id);
        }
    }

    /// Subscriptions opened so far.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Subscriptions closed so far.
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn open_subscriptions(&self) -> usize {
        self.opens().saturating_sub(self.closes())
    }

    /// Jobs with at least one open subscription.
    pub fn topic_count(&self) -> usize {
        self.topics.read().map(|topics| topics.len()).unwrap_or(0)
    }

    fn subscribe(
        &self,
        job_id: JobId,
    ) -> Result<(broadcast::Receiver<JobSnapshot>, u64), ChannelError> {
        let mut topics = self
            .topics
            .write()
            .map_err(|_| ChannelError::Unavailable("topic registry poisoned".to_string()))?;
        let topic = topics.entry(job_id).or_insert_with(|| Topic {
            sender: broadcast::channel(self.capacity).0,
            subscribers: 0,
            epoch: self.next_epoch.fetch_add(1, Ordering::Relaxed),
        });
        topic.subscribers += 1;
        Ok((topic.sender.subscribe(), topic.epoch))
    }
}

/// Drop one subscriber from `job_id`'s topic, removing the topic with its
/// last subscriber.
fn release(topics: &TopicRegistry, job_id: JobId, epoch: u64) {
    let Ok(mut topics) = topics.write() else {
        return;
    };
    if let Some(topic) = topics.get_mut(&job_id) {
        if topic.epoch != epoch {
            return;
        }
        topic.subscribers = topic.subscribers.saturating_sub(1);
        if topic.subscribers == 0 {
            topics.remove(&job_id);
            debug!(job_id = %job_id, "change feed topic released");
        }
    }
}

#[async_trait]
impl ChangeChannel for InMemoryChangeFeed {
    async fn open(
        &self,
        job_id: JobId,
        sink: ChannelSink,
    ) -> Result<Box<dyn ChannelSubscription>, ChannelError> {
        let (rx, epoch) = self.subscribe(job_id)?;
        self.opens.fetch_add(1, Ordering::SeqCst);
        sink.health(ChannelHealth::Connecting);

        let mode = self.mode();
        debug!(job_id = %job_id, ?mode, "change feed subscription opened");
        let task = tokio::spawn(forward(job_id, rx, sink, mode));

        Ok(Box::new(FeedSubscription {
            job_id,
            epoch,
            task: Some(task),
            topics: self.topics.clone(),
            closes: self.closes.clone(),
        }))
    }
}

async fn forward(
    job_id: JobId,
    mut rx: broadcast::Receiver<JobSnapshot>,
    sink: ChannelSink,
    mode: FeedMode,
) {
    match mode {
        FeedMode::Live => sink.health(ChannelHealth::Healthy),
        FeedMode::Unreachable => {
            sink.health(ChannelHealth::Failed);
            return;
        }
        FeedMode::Stalled => return std::future::pending().await,
    }

    loop {
        match rx.recv().await {
            Ok(snapshot) => {
                sink.event(snapshot);
                if sink.is_closed() {
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(job_id = %job_id, skipped, "change feed subscriber lagged");
            }
            Err(broadcast::error::RecvError::Closed) => {
                debug!(job_id = %job_id, "change feed topic dropped");
                sink.health(ChannelHealth::Failed);
                return;
            }
        }
    }
}

/// Live subscription; closing aborts the forwarding task.
struct FeedSubscription {
    job_id: JobId,
    epoch: u64,
    task: Option<JoinHandle<()>>,
    topics: TopicRegistry,
    closes: Arc<AtomicUsize>,
}

impl ChannelSubscription for FeedSubscription {
    fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            release(&self.topics, self.job_id, self.epoch);
            self.closes.fetch_add(1, Ordering::SeqCst);
            debug!(job_id = %self.job_id, "change feed subscription closed");
        }
    }
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        self.close();
    }
}
