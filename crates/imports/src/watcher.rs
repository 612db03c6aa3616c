//! Watch orchestration: race the change channel against the poller.
//!
//! ## Session lifecycle
//!
//! ```text
//! Initializing ──terminal snapshot──────────────────────────────┐
//!      │                                                        ▼
//!      └─non-terminal──► Watching ──first terminal / exhausted──► Resolved
//!                           │
//!                           └─cancelled──► Abandoned
//! ```
//!
//! While watching, the change channel is opened immediately. After the grace
//! delay the poller starts too, unless the channel already reported
//! `Healthy`. A `Failed` channel starts the poller straight away. Whatever
//! source produces the first terminal snapshot wins; both sources are then
//! released and the import's cache keys are invalidated.

use std::sync::Arc;

use pocketledger_core::JobId;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheInvalidator, CacheKeySet};
use crate::channel::{ChangeChannel, ChannelHealth, ChannelSignal, ChannelSink};
use crate::options::WatchOptions;
use crate::poller::{BackoffPoller, PollEvent, PollSink};
use crate::reader::{JobRecordStore, ReadError, StatusReader};
use crate::session::WatchSession;
use crate::status::{JobSnapshot, JobStatus};

/// Which source produced a terminal snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    InitialRead,
    Channel,
    Poller,
    /// One-off read made when the channel alone is trusted: once it turns
    /// healthy, and again before the channel-only deadline gives up.
    Recheck,
}

impl core::fmt::Display for ResolutionSource {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            ResolutionSource::InitialRead => "initial_read",
            ResolutionSource::Channel => "channel",
            ResolutionSource::Poller => "poller",
            ResolutionSource::Recheck => "recheck",
        })
    }
}

/// Diagnostics collected over one watch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WatchStats {
    /// Highest poll attempt that returned a snapshot
    pub poll_attempts: u32,
    /// Update events received from the change channel
    pub channel_events: u32,
    pub poller_started: bool,
    /// Successful one-off reads made while only the channel was trusted
    pub rechecks: u32,
    /// Last health reported by the change channel
    pub channel_health: Option<ChannelHealth>,
}

/// How a watch ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchOutcome {
    /// The job reached a terminal status. Cache keys were invalidated.
    Resolved {
        snapshot: JobSnapshot,
        source: ResolutionSource,
        stats: WatchStats,
    },
    /// Gave up checking. `snapshot` is a synthetic `processing` status: the
    /// job may still finish, so callers should check again later.
    Exhausted {
        snapshot: JobSnapshot,
        stats: WatchStats,
    },
    /// The caller cancelled the watch. Nothing was invalidated.
    Abandoned {
        last_known: JobStatus,
        stats: WatchStats,
    },
}

impl WatchOutcome {
    /// Snapshot the watch resolved with, if it was not abandoned.
    pub fn snapshot(&self) -> Option<&JobSnapshot> {
        match self {
            WatchOutcome::Resolved { snapshot, .. } | WatchOutcome::Exhausted { snapshot, .. } => {
                Some(snapshot)
            }
            WatchOutcome::Abandoned { .. } => None,
        }
    }

    pub fn into_snapshot(self) -> Option<JobSnapshot> {
        match self {
            WatchOutcome::Resolved { snapshot, .. } | WatchOutcome::Exhausted { snapshot, .. } => {
                Some(snapshot)
            }
            WatchOutcome::Abandoned { .. } => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WatchOutcome::Resolved { .. })
    }

    pub fn stats(&self) -> &WatchStats {
        match self {
            WatchOutcome::Resolved { stats, .. }
            | WatchOutcome::Exhausted { stats, .. }
            | WatchOutcome::Abandoned { stats, .. } => stats,
        }
    }
}

/// Errors that abort a watch before it starts.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WatchError {
    #[error("authentication required to watch import job")]
    AuthRequired,
    #[error("import job {0} not found")]
    NotFound(JobId),
    #[error("watch task aborted: {0}")]
    Aborted(String),
}

/// Ways a session can end, before the resolution flag is claimed.
enum Conclusion {
    Terminal(JobSnapshot, ResolutionSource),
    Exhausted(JobSnapshot),
    Abandoned,
}

/// Handle to a spawned watch.
///
/// Dropping the handle abandons the watch unless it was detached first.
#[derive(Debug)]
pub struct WatchHandle {
    job_id: JobId,
    cancel: CancellationToken,
    task: Option<JoinHandle<Result<WatchOutcome, WatchError>>>,
    detached: bool,
}

impl WatchHandle {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Abandon the watch. Both sources are released and no cache keys are
    /// invalidated. No effect once the watch has resolved.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Let the watch run to completion on its own. Its outcome is discarded
    /// but cache invalidation still happens.
    pub fn detach(mut self) {
        self.detached = true;
    }

    /// Wait for the outcome. Dropping the returned future abandons the watch.
    pub async fn join(mut self) -> Result<WatchOutcome, WatchError> {
        let Some(task) = self.task.take() else {
            return Err(WatchError::Aborted("watch task already joined".to_string()));
        };
        match task.await {
            Ok(result) => result,
            Err(e) => Err(WatchError::Aborted(e.to_string())),
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        if !self.detached {
            self.cancel.cancel();
        }
    }
}

/// Watches statement-import jobs until they finish.
///
/// Cheap to clone; every watch gets its own session, channel subscription
/// and poller. Only the invalidator is shared.
#[derive(Clone)]
pub struct JobWatcher {
    store: Arc<dyn JobRecordStore>,
    channel: Arc<dyn ChangeChannel>,
    invalidator: Arc<dyn CacheInvalidator>,
}

impl JobWatcher {
    pub fn new(
        store: Arc<dyn JobRecordStore>,
        channel: Arc<dyn ChangeChannel>,
        invalidator: Arc<dyn CacheInvalidator>,
    ) -> Self {
        Self {
            store,
            channel,
            invalidator,
        }
    }

    /// Run `watch` on the current runtime.
    pub fn spawn(&self, job_id: JobId, options: WatchOptions) -> WatchHandle {
        let cancel = CancellationToken::new();
        let watcher = self.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move { watcher.watch(job_id, options, token).await });

        WatchHandle {
            job_id,
            cancel,
            task: Some(task),
            detached: false,
        }
    }

    /// Watch `job_id` until it reaches a terminal status, the poll budget
    /// runs out, or `cancel` fires.
    ///
    /// Fails only when the first status read says the watch can never
    /// succeed (`AuthRequired`, `NotFound`). Every other read or channel
    /// failure is absorbed.
    pub async fn watch(
        &self,
        job_id: JobId,
        options: WatchOptions,
        cancel: CancellationToken,
    ) -> Result<WatchOutcome, WatchError> {
        let reader = StatusReader::new(self.store.clone(), options.credentials.clone());
        let mut session = WatchSession::new(job_id);

        let initial = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Ok(self.conclude_unresolved(&mut session, &options, Conclusion::Abandoned));
            }
            read = reader.read(job_id) => read,
        };

        match initial {
            Ok(snapshot) if snapshot.is_terminal() => {
                info!(
                    job_id = %job_id,
                    status = %snapshot.status,
                    "import job already finished; skipping watch"
                );
                let conclusion = Conclusion::Terminal(snapshot, ResolutionSource::InitialRead);
                return Ok(self.conclude_unresolved(&mut session, &options, conclusion));
            }
            Ok(snapshot) => session.note_status(snapshot.status),
            Err(ReadError::AuthRequired) => {
                warn!(job_id = %job_id, "cannot watch import job without credentials");
                return Err(WatchError::AuthRequired);
            }
            Err(ReadError::NotFound(id)) => {
                warn!(job_id = %job_id, "cannot watch unknown import job");
                return Err(WatchError::NotFound(id));
            }
            Err(e) => {
                warn!(
                    job_id = %job_id,
                    class = e.class(),
                    error = %e,
                    "initial status read failed; watching anyway"
                );
            }
        }

        self.run(&mut session, reader, &options, &cancel).await
    }

    async fn run(
        &self,
        session: &mut WatchSession,
        reader: StatusReader,
        options: &WatchOptions,
        cancel: &CancellationToken,
    ) -> Result<WatchOutcome, WatchError> {
        let job_id = session.job_id;
        let (channel_sink, mut channel_rx) = ChannelSink::channel();
        let (poll_sink, mut poll_rx) = PollSink::channel();

        info!(job_id = %job_id, status = %session.last_known, "watching import job");
        session.grace_at = Some(Instant::now() + options.grace_delay);

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Ok(self.conclude_unresolved(session, options, Conclusion::Abandoned));
            }
            opened = self.channel.open(job_id, channel_sink) => opened,
        };
        match opened {
            Ok(subscription) => session.channel = Some(subscription),
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "change channel unavailable; polling instead");
                session.record_health(ChannelHealth::Failed);
                self.start_poller(session, &reader, options, &poll_sink);
            }
        }

        loop {
            let conclusion = tokio::select! {
                biased;
                _ = cancel.cancelled() => Some(Conclusion::Abandoned),
                signal = channel_rx.recv(), if session.channel_live() => match signal {
                    Some(ChannelSignal::Update(snapshot)) => {
                        session.stats.channel_events += 1;
                        self.observe(session, snapshot, ResolutionSource::Channel)
                    }
                    Some(ChannelSignal::Health(health)) => {
                        if self.on_channel_health(session, health, &reader, options, &poll_sink) {
                            // Changes made before the subscription existed are never pushed.
                            self.recheck(session, &reader, cancel).await
                        } else {
                            None
                        }
                    }
                    None => {
                        warn!(job_id = %job_id, "change channel dropped without reporting failure");
                        self.on_channel_health(session, ChannelHealth::Failed, &reader, options, &poll_sink);
                        None
                    }
                },
                Some(event) = poll_rx.recv() => match event {
                    PollEvent::Snapshot { attempt, snapshot } => {
                        session.poll_attempt = attempt;
                        self.observe(session, snapshot, ResolutionSource::Poller)
                    }
                    PollEvent::Exhausted { snapshot, .. } => Some(Conclusion::Exhausted(snapshot)),
                },
                () = sleep_until(session.grace_at) => {
                    session.grace_at = None;
                    if !session.channel_healthy && !session.polling_suppressed {
                        debug!(job_id = %job_id, "change channel not healthy after grace delay");
                        self.start_poller(session, &reader, options, &poll_sink);
                    }
                    None
                }
                () = sleep_until(session.channel_only_deadline) => {
                    session.channel_only_deadline = None;
                    info!(job_id = %job_id, "no terminal status from change channel within poll budget");
                    let last = self.recheck(session, &reader, cancel).await;
                    Some(last.unwrap_or_else(|| Conclusion::Exhausted(JobSnapshot::still_processing())))
                }
            };

            if let Some(conclusion) = conclusion {
                if let Some(outcome) = self.conclude(session, options, conclusion) {
                    return Ok(outcome);
                }
            }
        }
    }

    /// Terminal snapshots conclude the session; anything else is noted.
    fn observe(
        &self,
        session: &mut WatchSession,
        snapshot: JobSnapshot,
        source: ResolutionSource,
    ) -> Option<Conclusion> {
        if snapshot.is_terminal() {
            return Some(Conclusion::Terminal(snapshot, source));
        }
        session.note_status(snapshot.status);
        None
    }

    /// Returns true when this signal switched polling off.
    fn on_channel_health(
        &self,
        session: &mut WatchSession,
        health: ChannelHealth,
        reader: &StatusReader,
        options: &WatchOptions,
        poll_sink: &PollSink,
    ) -> bool {
        let job_id = session.job_id;
        session.record_health(health);

        match health {
            ChannelHealth::Connecting => debug!(job_id = %job_id, "change channel connecting"),
            ChannelHealth::Healthy => {
                if session.poller.is_none() && !session.polling_suppressed {
                    info!(job_id = %job_id, "change channel healthy; polling skipped");
                    session.polling_suppressed = true;
                    session.grace_at = None;
                    let budget = options.schedule().total_budget(options.max_attempts);
                    session.channel_only_deadline = Some(Instant::now() + budget);
                    return true;
                }
            }
            ChannelHealth::Failed => {
                warn!(job_id = %job_id, "change channel failed; falling back to polling");
                session.close_channel();
                session.polling_suppressed = false;
                session.channel_only_deadline = None;
                self.start_poller(session, reader, options, poll_sink);
            }
        }
        false
    }

    /// Single status read outside the poll schedule. Read errors are logged
    /// and leave the session as it was.
    async fn recheck(
        &self,
        session: &mut WatchSession,
        reader: &StatusReader,
        cancel: &CancellationToken,
    ) -> Option<Conclusion> {
        let job_id = session.job_id;
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Some(Conclusion::Abandoned),
            read = reader.read(job_id) => read,
        };

        match read {
            Ok(snapshot) => {
                session.stats.rechecks += 1;
                self.observe(session, snapshot, ResolutionSource::Recheck)
            }
            Err(e) => {
                warn!(
                    job_id = %job_id,
                    class = e.class(),
                    error = %e,
                    "status recheck failed"
                );
                None
            }
        }
    }

    fn start_poller(
        &self,
        session: &mut WatchSession,
        reader: &StatusReader,
        options: &WatchOptions,
        poll_sink: &PollSink,
    ) {
        if session.poller.is_some() {
            return;
        }
        let poller = BackoffPoller::new(reader.clone(), options.schedule(), options.max_attempts);
        session.poller = Some(poller.start(session.job_id, poll_sink.clone()));
        session.stats.poller_started = true;
        session.grace_at = None;
    }

    /// Claim the session's single resolution and act on it.
    ///
    /// Returns `None` if the session was already resolved; the call is then
    /// a no-op.
    fn conclude(
        &self,
        session: &mut WatchSession,
        options: &WatchOptions,
        conclusion: Conclusion,
    ) -> Option<WatchOutcome> {
        if !session.resolved.try_claim() {
            debug!(job_id = %session.job_id, "watch already resolved; ignoring");
            return None;
        }

        session.teardown();
        session.stats.poll_attempts = session.poll_attempt;
        let job_id = session.job_id;
        let stats = session.stats.clone();

        let outcome = match conclusion {
            Conclusion::Terminal(snapshot, source) => {
                let keys = CacheKeySet::for_statement_import(options.account_id);
                info!(
                    job_id = %job_id,
                    status = %snapshot.status,
                    source = %source,
                    keys = keys.len(),
                    "import job finished; invalidating cached queries"
                );
                self.invalidator.invalidate(&keys);
                session.last_known = snapshot.status;
                WatchOutcome::Resolved {
                    snapshot,
                    source,
                    stats,
                }
            }
            Conclusion::Exhausted(snapshot) => {
                info!(
                    job_id = %job_id,
                    last_known = %session.last_known,
                    "import watch exhausted; job still not finished"
                );
                WatchOutcome::Exhausted { snapshot, stats }
            }
            Conclusion::Abandoned => {
                info!(job_id = %job_id, "import watch abandoned by caller");
                WatchOutcome::Abandoned {
                    last_known: session.last_known,
                    stats,
                }
            }
        };

        Some(outcome)
    }

    /// Conclude a session that cannot have been resolved yet.
    fn conclude_unresolved(
        &self,
        session: &mut WatchSession,
        options: &WatchOptions,
        conclusion: Conclusion,
    ) -> WatchOutcome {
        let last_known = session.last_known;
        self.conclude(session, options, conclusion)
            .unwrap_or_else(|| WatchOutcome::Abandoned {
                last_known,
                stats: session.stats.clone(),
            })
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use pocketledger_core::{AccountId, Credential};
    use proptest::prelude::*;

    use super::*;
    use crate::cache::CacheKey;
    use crate::channel::{ChannelError, ChannelSubscription};
    use crate::reader::StoreError;

    type StoreResult = Result<Option<JobSnapshot>, StoreError>;

    struct ScriptedStore {
        script: Mutex<VecDeque<StoreResult>>,
        fallback: JobSnapshot,
        reads: Mutex<Vec<Instant>>,
    }

    impl ScriptedStore {
        fn read_count(&self) -> usize {
            self.reads.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl JobRecordStore for ScriptedStore {
        async fn fetch_status(&self, _job_id: JobId, _credential: &Credential) -> StoreResult {
            self.reads.lock().unwrap().push(Instant::now());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Some(self.fallback.clone())))
        }
    }

    #[derive(Default)]
    struct MockChannel {
        fail_open: bool,
        sinks: Mutex<Vec<ChannelSink>>,
        opens: AtomicUsize,
        closes: Arc<AtomicUsize>,
    }

    impl MockChannel {
        fn sink(&self) -> ChannelSink {
            self.sinks
                .lock()
                .unwrap()
                .last()
                .cloned()
                .expect("channel was never opened")
        }

        fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }

        fn closes(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }
    }

    struct MockSubscription {
        closes: Arc<AtomicUsize>,
    }

    impl ChannelSubscription for MockSubscription {
        fn close(&mut self) {
            // Counts every call so a double close shows up in assertions.
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ChangeChannel for MockChannel {
        async fn open(
            &self,
            _job_id: JobId,
            sink: ChannelSink,
        ) -> Result<Box<dyn ChannelSubscription>, ChannelError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self.fail_open {
                return Err(ChannelError::Unavailable("realtime endpoint down".into()));
            }
            self.sinks.lock().unwrap().push(sink);
            Ok(Box::new(MockSubscription {
                closes: self.closes.clone(),
            }))
        }
    }

    #[derive(Default)]
    struct RecordingInvalidator {
        calls: Mutex<Vec<CacheKeySet>>,
    }

    impl RecordingInvalidator {
        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    impl CacheInvalidator for RecordingInvalidator {
        fn invalidate(&self, keys: &CacheKeySet) {
            self.calls.lock().unwrap().push(keys.clone());
        }
    }

    struct Harness {
        store: Arc<ScriptedStore>,
        channel: Arc<MockChannel>,
        invalidator: Arc<RecordingInvalidator>,
        watcher: JobWatcher,
    }

    fn harness_with(script: Vec<StoreResult>, fallback: JobStatus, channel: MockChannel) -> Harness {
        let store = Arc::new(ScriptedStore {
            script: Mutex::new(script.into()),
            fallback: JobSnapshot::new(fallback),
            reads: Mutex::new(Vec::new()),
        });
        let channel = Arc::new(channel);
        let invalidator = Arc::new(RecordingInvalidator::default());
        let watcher = JobWatcher::new(store.clone(), channel.clone(), invalidator.clone());
        Harness {
            store,
            channel,
            invalidator,
            watcher,
        }
    }

    fn harness(script: Vec<StoreResult>, fallback: JobStatus) -> Harness {
        harness_with(script, fallback, MockChannel::default())
    }

    fn snapshot(status: JobStatus) -> StoreResult {
        Ok(Some(JobSnapshot::new(status)))
    }

    fn options() -> WatchOptions {
        WatchOptions::default().with_credentials(Arc::new(|| Some(Credential::bearer("jwt"))))
    }

    /// Let spawned tasks run until they block.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn already_completed_short_circuits() {
        let h = harness(vec![snapshot(JobStatus::Completed)], JobStatus::Completed);

        let outcome = h
            .watcher
            .watch(JobId::new(), options(), CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            WatchOutcome::Resolved {
                source: ResolutionSource::InitialRead,
                ..
            }
        ));
        assert!(!outcome.stats().poller_started);
        assert_eq!(h.channel.opens(), 0);
        assert_eq!(h.invalidator.call_count(), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.store.read_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn already_failed_still_invalidates() {
        let h = harness(
            vec![Ok(Some(JobSnapshot::failed("bad header row")))],
            JobStatus::Failed,
        );

        let outcome = h
            .watcher
            .watch(JobId::new(), options(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.snapshot(), Some(&JobSnapshot::failed("bad header row")));
        assert_eq!(h.channel.opens(), 0);
        assert_eq!(h.invalidator.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_credentials_are_fatal() {
        let h = harness(vec![], JobStatus::Pending);

        let err = h
            .watcher
            .watch(JobId::new(), WatchOptions::default(), CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err, WatchError::AuthRequired);
        assert_eq!(h.store.read_count(), 0);
        assert_eq!(h.channel.opens(), 0);
        assert_eq!(h.invalidator.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_job_is_fatal() {
        let h = harness(vec![Ok(None)], JobStatus::Pending);
        let job_id = JobId::new();

        let err = h
            .watcher
            .watch(job_id, options(), CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err, WatchError::NotFound(job_id));
        assert_eq!(h.channel.opens(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_initial_read_is_absorbed() {
        let h = harness(
            vec![
                Err(StoreError::Unavailable("502".into())),
                snapshot(JobStatus::Completed),
            ],
            JobStatus::Completed,
        );
        let handle = h.watcher.spawn(JobId::new(), options());
        settle().await;
        h.channel.sink().health(ChannelHealth::Connecting);

        let outcome = handle.join().await.unwrap();

        assert!(matches!(
            outcome,
            WatchOutcome::Resolved {
                source: ResolutionSource::Poller,
                ..
            }
        ));
        assert_eq!(h.invalidator.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_before_start_does_nothing() {
        let h = harness(vec![], JobStatus::Pending);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = h.watcher.watch(JobId::new(), options(), cancel).await.unwrap();

        assert!(matches!(outcome, WatchOutcome::Abandoned { .. }));
        assert_eq!(h.store.read_count(), 0);
        assert_eq!(h.channel.opens(), 0);
        assert_eq!(h.invalidator.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_channel_suppresses_polling() {
        let h = harness(vec![snapshot(JobStatus::Pending)], JobStatus::Processing);
        let handle = h.watcher.spawn(JobId::new(), options());
        settle().await;

        let sink = h.channel.sink();
        sink.health(ChannelHealth::Connecting);
        sink.health(ChannelHealth::Healthy);
        tokio::time::sleep(Duration::from_secs(30)).await;
        // initial read + one recheck once healthy, no polling
        assert_eq!(h.store.read_count(), 2);

        sink.event(JobSnapshot::new(JobStatus::Completed));
        let outcome = handle.join().await.unwrap();

        assert!(matches!(
            outcome,
            WatchOutcome::Resolved {
                source: ResolutionSource::Channel,
                ..
            }
        ));
        assert!(!outcome.stats().poller_started);
        assert_eq!(outcome.stats().rechecks, 1);
        assert_eq!(outcome.stats().channel_health, Some(ChannelHealth::Healthy));
        assert_eq!(h.store.read_count(), 2);
        assert_eq!(h.invalidator.call_count(), 1);
        assert_eq!(h.channel.closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_channel_starts_polling_without_grace() {
        let h = harness(vec![snapshot(JobStatus::Pending)], JobStatus::Processing);
        let handle = h.watcher.spawn(JobId::new(), options());
        settle().await;

        h.channel.sink().health(ChannelHealth::Failed);
        // Started at ~1ms the first poll lands at ~3.001s; after the grace
        // delay it would only land at 4s.
        tokio::time::sleep(Duration::from_millis(3_100)).await;
        assert_eq!(h.store.read_count(), 2);
        assert_eq!(h.channel.closes(), 1);

        handle.cancel();
        let outcome = handle.join().await.unwrap();
        assert!(matches!(outcome, WatchOutcome::Abandoned { .. }));
        assert_eq!(h.channel.closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_channel_falls_back_to_polling() {
        let h = harness_with(
            vec![snapshot(JobStatus::Pending), snapshot(JobStatus::Completed)],
            JobStatus::Completed,
            MockChannel {
                fail_open: true,
                ..MockChannel::default()
            },
        );

        let outcome = h
            .watcher
            .watch(JobId::new(), options(), CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            WatchOutcome::Resolved {
                source: ResolutionSource::Poller,
                ..
            }
        ));
        assert_eq!(outcome.stats().channel_health, Some(ChannelHealth::Failed));
        let reads = h.store.reads.lock().unwrap().clone();
        assert_eq!(reads[1] - reads[0], Duration::from_secs(3));
        assert_eq!(h.channel.closes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn channel_wins_while_poller_mid_backoff() {
        let account = AccountId::new();
        let h = harness(vec![snapshot(JobStatus::Pending)], JobStatus::Processing);
        let handle = h.watcher.spawn(JobId::new(), options().with_account(account));
        settle().await;

        let sink = h.channel.sink();
        sink.health(ChannelHealth::Connecting);
        tokio::time::sleep(Duration::from_secs(2)).await;
        sink.event(JobSnapshot::new(JobStatus::Processing));
        sink.event(JobSnapshot::new(JobStatus::Completed));

        let outcome = handle.join().await.unwrap();

        assert_eq!(
            outcome,
            WatchOutcome::Resolved {
                snapshot: JobSnapshot::new(JobStatus::Completed),
                source: ResolutionSource::Channel,
                stats: WatchStats {
                    poll_attempts: 0,
                    channel_events: 2,
                    poller_started: true,
                    rechecks: 0,
                    channel_health: Some(ChannelHealth::Connecting),
                },
            }
        );

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.store.read_count(), 1, "poller kept reading after resolution");
        assert_eq!(h.channel.closes(), 1);

        let calls = h.invalidator.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].contains(&CacheKey::AccountTransactions(account)));
        assert_eq!(calls[0].len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn poller_alone_reports_failure() {
        let h = harness(
            vec![
                snapshot(JobStatus::Pending),
                snapshot(JobStatus::Processing),
                snapshot(JobStatus::Processing),
                snapshot(JobStatus::Processing),
                Ok(Some(JobSnapshot::failed("parse error"))),
            ],
            JobStatus::Failed,
        );
        let handle = h.watcher.spawn(JobId::new(), options());
        settle().await;
        h.channel.sink().health(ChannelHealth::Connecting);

        let outcome = handle.join().await.unwrap();

        match &outcome {
            WatchOutcome::Resolved {
                snapshot,
                source,
                stats,
            } => {
                assert_eq!(snapshot, &JobSnapshot::failed("parse error"));
                assert_eq!(*source, ResolutionSource::Poller);
                assert_eq!(stats.poll_attempts, 4);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(h.invalidator.call_count(), 1);
        assert_eq!(h.invalidator.calls.lock().unwrap()[0].len(), 3);
        assert_eq!(h.channel.closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_poller_resolves_non_terminal() {
        let h = harness(vec![snapshot(JobStatus::Pending)], JobStatus::Processing);
        let handle = h
            .watcher
            .spawn(JobId::new(), options().with_max_attempts(3));
        settle().await;
        h.channel.sink().health(ChannelHealth::Connecting);

        let outcome = handle.join().await.unwrap();

        assert!(matches!(outcome, WatchOutcome::Exhausted { .. }));
        assert_eq!(outcome.snapshot(), Some(&JobSnapshot::still_processing()));
        assert!(!outcome.is_terminal());
        assert_eq!(h.store.read_count(), 4);
        assert_eq!(h.invalidator.call_count(), 0);
        assert_eq!(h.channel.closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn channel_only_watch_has_a_budget() {
        let h = harness(vec![snapshot(JobStatus::Pending)], JobStatus::Processing);
        let options = options()
            .with_max_attempts(2)
            .with_initial_interval(Duration::from_millis(100))
            .with_max_interval(Duration::from_millis(100));
        let handle = h.watcher.spawn(JobId::new(), options);
        settle().await;
        h.channel.sink().health(ChannelHealth::Healthy);

        let started = Instant::now();
        let outcome = handle.join().await.unwrap();

        assert!(matches!(outcome, WatchOutcome::Exhausted { .. }));
        assert!(Instant::now() - started <= Duration::from_millis(200));
        assert!(!outcome.stats().poller_started);
        // initial read, recheck when healthy, recheck at the deadline
        assert_eq!(h.store.read_count(), 3);
        assert_eq!(outcome.stats().rechecks, 2);
        assert_eq!(h.invalidator.call_count(), 0);
        assert_eq!(h.channel.closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn channel_failure_after_healthy_restores_polling() {
        let h = harness(
            vec![
                snapshot(JobStatus::Pending),
                snapshot(JobStatus::Processing),
                snapshot(JobStatus::Completed),
            ],
            JobStatus::Completed,
        );
        let handle = h.watcher.spawn(JobId::new(), options());
        settle().await;

        let sink = h.channel.sink();
        sink.health(ChannelHealth::Healthy);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.store.read_count(), 2);

        sink.health(ChannelHealth::Failed);
        let outcome = handle.join().await.unwrap();

        assert!(matches!(
            outcome,
            WatchOutcome::Resolved {
                source: ResolutionSource::Poller,
                ..
            }
        ));
        assert!(outcome.stats().poller_started);
        assert_eq!(h.channel.closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_skips_invalidation() {
        let h = harness(vec![snapshot(JobStatus::Processing)], JobStatus::Processing);
        let handle = h.watcher.spawn(JobId::new(), options());
        settle().await;

        let sink = h.channel.sink();
        sink.health(ChannelHealth::Connecting);
        tokio::time::sleep(Duration::from_secs(2)).await;

        handle.cancel();
        let outcome = handle.join().await.unwrap();

        assert_eq!(
            outcome,
            WatchOutcome::Abandoned {
                last_known: JobStatus::Processing,
                stats: WatchStats {
                    poller_started: true,
                    channel_health: Some(ChannelHealth::Connecting),
                    ..WatchStats::default()
                },
            }
        );

        sink.event(JobSnapshot::new(JobStatus::Completed));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.invalidator.call_count(), 0);
        assert_eq!(h.store.read_count(), 1);
        assert_eq!(h.channel.closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_watch_releases_sources() {
        let h = harness(vec![snapshot(JobStatus::Pending)], JobStatus::Processing);

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            h.watcher.watch(JobId::new(), options(), CancellationToken::new()),
        )
        .await;
        assert!(result.is_err());
        // initial read + first poll at 4s
        assert_eq!(h.store.read_count(), 2);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.store.read_count(), 2);
        assert_eq!(h.channel.closes(), 1);
        assert_eq!(h.invalidator.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_terminal_events_are_ignored() {
        let h = harness(vec![snapshot(JobStatus::Pending)], JobStatus::Processing);
        let handle = h.watcher.spawn(JobId::new(), options());
        settle().await;

        let sink = h.channel.sink();
        sink.event(JobSnapshot::new(JobStatus::Completed));
        sink.event(JobSnapshot::failed("late duplicate"));
        sink.event(JobSnapshot::new(JobStatus::Completed));

        let outcome = handle.join().await.unwrap();
        assert_eq!(outcome.snapshot(), Some(&JobSnapshot::new(JobStatus::Completed)));

        sink.event(JobSnapshot::new(JobStatus::Cancelled));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.invalidator.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_channel_rechecks_status_once() {
        // The job finished between the initial read and the subscription,
        // so the channel will never push it.
        let h = harness(
            vec![snapshot(JobStatus::Processing), snapshot(JobStatus::Completed)],
            JobStatus::Completed,
        );
        let handle = h.watcher.spawn(JobId::new(), options());
        settle().await;
        let started = Instant::now();

        let sink = h.channel.sink();
        sink.health(ChannelHealth::Connecting);
        sink.health(ChannelHealth::Healthy);
        let outcome = handle.join().await.unwrap();

        assert!(matches!(
            outcome,
            WatchOutcome::Resolved {
                source: ResolutionSource::Recheck,
                ..
            }
        ));
        assert_eq!(Instant::now(), started);
        assert!(!outcome.stats().poller_started);
        assert_eq!(h.store.read_count(), 2);
        assert_eq!(h.invalidator.call_count(), 1);
        assert_eq!(h.channel.closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn channel_only_deadline_rechecks_before_giving_up() {
        let h = harness(
            vec![
                snapshot(JobStatus::Pending),
                snapshot(JobStatus::Processing),
                Ok(Some(JobSnapshot::failed("no rows parsed"))),
            ],
            JobStatus::Failed,
        );
        let options = options()
            .with_max_attempts(2)
            .with_initial_interval(Duration::from_millis(100))
            .with_max_interval(Duration::from_millis(100));
        let handle = h.watcher.spawn(JobId::new(), options);
        settle().await;
        h.channel.sink().health(ChannelHealth::Healthy);

        let outcome = handle.join().await.unwrap();

        assert_eq!(outcome.snapshot(), Some(&JobSnapshot::failed("no rows parsed")));
        assert!(matches!(
            outcome,
            WatchOutcome::Resolved {
                source: ResolutionSource::Recheck,
                ..
            }
        ));
        assert_eq!(h.invalidator.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_recheck_keeps_watching() {
        let h = harness(
            vec![
                snapshot(JobStatus::Pending),
                Err(StoreError::Unavailable("timeout".into())),
            ],
            JobStatus::Processing,
        );
        let handle = h.watcher.spawn(JobId::new(), options());
        settle().await;

        let sink = h.channel.sink();
        sink.health(ChannelHealth::Healthy);
        tokio::time::sleep(Duration::from_secs(5)).await;
        sink.event(JobSnapshot::new(JobStatus::Completed));
        let outcome = handle.join().await.unwrap();

        assert!(matches!(
            outcome,
            WatchOutcome::Resolved {
                source: ResolutionSource::Channel,
                ..
            }
        ));
        assert_eq!(outcome.stats().rechecks, 0);
        assert!(!outcome.stats().poller_started);
        assert_eq!(h.store.read_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_handle_abandons_the_watch() {
        let h = harness(vec![snapshot(JobStatus::Pending)], JobStatus::Processing);
        let handle = h.watcher.spawn(JobId::new(), options());
        settle().await;
        let sink = h.channel.sink();
        sink.health(ChannelHealth::Connecting);

        drop(handle);
        settle().await;

        assert_eq!(h.channel.closes(), 1);
        sink.event(JobSnapshot::new(JobStatus::Completed));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.store.read_count(), 1);
        assert_eq!(h.invalidator.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn detached_watch_runs_to_completion() {
        let h = harness(vec![snapshot(JobStatus::Pending)], JobStatus::Processing);
        let handle = h.watcher.spawn(JobId::new(), options());
        settle().await;
        let sink = h.channel.sink();
        sink.health(ChannelHealth::Connecting);

        handle.detach();
        tokio::time::sleep(Duration::from_secs(2)).await;
        sink.event(JobSnapshot::new(JobStatus::Completed));
        settle().await;

        assert_eq!(h.invalidator.call_count(), 1);
        assert_eq!(h.channel.closes(), 1);
    }

    #[test]
    fn second_conclusion_is_a_no_op() {
        let h = harness(vec![], JobStatus::Pending);
        let mut session = WatchSession::new(JobId::new());
        let options = options();

        let first = h.watcher.conclude(
            &mut session,
            &options,
            Conclusion::Terminal(JobSnapshot::new(JobStatus::Completed), ResolutionSource::Channel),
        );
        let second = h.watcher.conclude(
            &mut session,
            &options,
            Conclusion::Terminal(JobSnapshot::failed("late"), ResolutionSource::Poller),
        );
        let third = h.watcher.conclude(&mut session, &options, Conclusion::Abandoned);

        assert!(first.is_some());
        assert!(second.is_none());
        assert!(third.is_none());
        assert_eq!(h.invalidator.call_count(), 1);
    }

    #[derive(Debug, Clone)]
    enum Step {
        Update(JobStatus),
        Health(ChannelHealth),
        Advance(u64),
    }

    fn any_status() -> impl Strategy<Value = JobStatus> {
        prop_oneof![
            Just(JobStatus::Pending),
            Just(JobStatus::Processing),
            Just(JobStatus::Review),
            Just(JobStatus::Completed),
            Just(JobStatus::Failed),
            Just(JobStatus::Cancelled),
        ]
    }

    fn any_step() -> impl Strategy<Value = Step> {
        prop_oneof![
            any_status().prop_map(Step::Update),
            prop_oneof![
                Just(ChannelHealth::Connecting),
                Just(ChannelHealth::Healthy),
                Just(ChannelHealth::Failed),
            ]
            .prop_map(Step::Health),
            (1u64..5_000).prop_map(Step::Advance),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            ..ProptestConfig::default()
        })]

        /// Property: whatever the interleaving of channel events, poll results
        /// and elapsed time, the invalidator runs at most once, exactly when
        /// the watch resolves terminally, and the subscription is closed at
        /// most once.
        #[test]
        fn resolves_at_most_once(
            steps in prop::collection::vec(any_step(), 0..24),
            polls in prop::collection::vec(any_status(), 0..8),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();

            rt.block_on(async move {
                let mut script = vec![snapshot(JobStatus::Pending)];
                script.extend(polls.into_iter().map(snapshot));
                let h = harness(script, JobStatus::Processing);
                let handle = h.watcher.spawn(JobId::new(), options().with_max_attempts(10));
                settle().await;

                let sink = h.channel.sink();
                for step in steps {
                    match step {
                        Step::Update(status) => sink.event(JobSnapshot::new(status)),
                        Step::Health(health) => sink.health(health),
                        Step::Advance(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
                    }
                }

                let outcome = handle.join().await.unwrap();

                sink.event(JobSnapshot::new(JobStatus::Completed));
                tokio::time::sleep(Duration::from_secs(120)).await;

                let calls = h.invalidator.call_count();
                match &outcome {
                    WatchOutcome::Resolved { snapshot, .. } => {
                        assert!(snapshot.is_terminal());
                        assert_eq!(calls, 1);
                    }
                    WatchOutcome::Exhausted { snapshot, .. } => {
                        assert_eq!(snapshot, &JobSnapshot::still_processing());
                        assert_eq!(calls, 0);
                    }
                    WatchOutcome::Abandoned { .. } => panic!("nothing cancelled this watch"),
                }
                assert!(h.channel.closes() <= 1);
            });
        }
    }
}
