//! Per-watch configuration.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use pocketledger_core::{AccountId, CredentialProvider};
use tracing::warn;

use crate::backoff::BackoffSchedule;

pub const ENV_MAX_ATTEMPTS: &str = "POCKETLEDGER_WATCH_MAX_ATTEMPTS";
pub const ENV_INITIAL_INTERVAL_MS: &str = "POCKETLEDGER_WATCH_INITIAL_INTERVAL_MS";
pub const ENV_MAX_INTERVAL_MS: &str = "POCKETLEDGER_WATCH_MAX_INTERVAL_MS";
pub const ENV_GRACE_MS: &str = "POCKETLEDGER_WATCH_GRACE_MS";

/// Options for a single `JobWatcher::watch` call.
#[derive(Clone)]
pub struct WatchOptions {
    /// Account the statement was uploaded against, if known. Adds the
    /// account-scoped transactions key to the invalidation set.
    pub account_id: Option<AccountId>,
    /// Token supplier for status reads. Without one the watch fails with
    /// `AuthRequired` before doing anything else.
    pub credentials: Option<Arc<dyn CredentialProvider>>,
    /// Poll attempts before giving up
    pub max_attempts: u32,
    /// Poll interval for the first attempts
    pub initial_interval: Duration,
    /// Poll interval cap
    pub max_interval: Duration,
    /// How long the change channel gets to become healthy before the poller
    /// is started alongside it
    pub grace_delay: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        let schedule = BackoffSchedule::default();
        Self {
            account_id: None,
            credentials: None,
            max_attempts: 60,
            initial_interval: schedule.initial,
            max_interval: schedule.max,
            grace_delay: Duration::from_secs(1),
        }
    }
}

impl WatchOptions {
    /// Defaults overridden by `POCKETLEDGER_WATCH_*` environment variables.
    ///
    /// Unparsable values are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut options = Self::default();

        if let Some(v) = parse_setting(&lookup, ENV_MAX_ATTEMPTS) {
            options.max_attempts = v;
        }
        if let Some(v) = parse_setting(&lookup, ENV_INITIAL_INTERVAL_MS) {
            options.initial_interval = Duration::from_millis(u64::from(v));
        }
        if let Some(v) = parse_setting(&lookup, ENV_MAX_INTERVAL_MS) {
            options.max_interval = Duration::from_millis(u64::from(v));
        }
        if let Some(v) = parse_setting(&lookup, ENV_GRACE_MS) {
            options.grace_delay = Duration::from_millis(u64::from(v));
        }

        options
    }

    pub fn with_account(mut self, account_id: AccountId) -> Self {
        self.account_id = Some(account_id);
        self
    }

    pub fn with_credentials(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(provider);
        self
    }

    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max;
        self
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_grace_delay(mut self, delay: Duration) -> Self {
        self.grace_delay = delay;
        self
    }

    pub fn schedule(&self) -> BackoffSchedule {
        BackoffSchedule::new(self.initial_interval, self.max_interval)
    }
}

impl core::fmt::Debug for WatchOptions {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WatchOptions")
            .field("account_id", &self.account_id)
            .field("has_credentials", &self.credentials.is_some())
            .field("max_attempts", &self.max_attempts)
            .field("initial_interval", &self.initial_interval)
            .field("max_interval", &self.max_interval)
            .field("grace_delay", &self.grace_delay)
            .finish()
    }
}

fn parse_setting(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u32> {
    let raw = lookup(key)?;
    match parse_u32(key, &raw) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(key, value = %raw, error = %format!("{e:#}"), "ignoring watch setting");
            None
        }
    }
}

fn parse_u32(key: &str, raw: &str) -> anyhow::Result<u32> {
    raw.trim()
        .parse::<u32>()
        .with_context(|| format!("{key} must be a non-negative integer"))
}
