//! Statement-import completion watcher.
//!
//! A statement upload kicks off a parsing job on the backend. The dashboard
//! needs to know when that job is done so it can refresh transactions,
//! balances and the summary cards, exactly once.
//!
//! ## Components
//!
//! - `StatusReader`: point-in-time read of a job's status
//! - `ChangeChannel`: push subscription to job row changes (preferred)
//! - `BackoffPoller`: polling fallback with a growing interval
//! - `JobWatcher`: races the two sources to a single outcome, tears both
//!   down and invalidates the affected cache keys
//!
//! ## Outcomes
//!
//! A watch ends in one of three ways: a terminal snapshot (`completed`,
//! `failed`, `cancelled`), exhaustion of the poll budget (reported as a
//! synthetic `processing` snapshot), or abandonment by the caller. Only the
//! first triggers cache invalidation.

pub mod backoff;
pub mod cache;
pub mod channel;
pub mod options;
pub mod poller;
pub mod reader;
pub mod status;
pub mod watcher;

mod session;

pub use backoff::BackoffSchedule;
pub use cache::{CacheInvalidator, CacheKey, CacheKeySet};
pub use channel::{ChangeChannel, ChannelError, ChannelHealth, ChannelSignal, ChannelSink, ChannelSubscription};
pub use options::WatchOptions;
pub use poller::{BackoffPoller, PollEvent, PollSink, PollerHandle};
pub use reader::{JobRecordStore, ReadError, StatusReader, StoreError};
pub use status::{JobSnapshot, JobStatus};
pub use watcher::{JobWatcher, ResolutionSource, WatchError, WatchHandle, WatchOutcome, WatchStats};
