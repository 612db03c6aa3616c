//! Logical cache keys touched by a finished statement import.

use pocketledger_core::AccountId;
use serde::{Deserialize, Serialize};

/// A query-cache entry the dashboard may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "scope", content = "account_id")]
pub enum CacheKey {
    /// Transaction list for one account
    AccountTransactions(AccountId),
    /// Transaction lists across all accounts
    Transactions,
    /// Account list and balances
    Accounts,
    /// Dashboard summary cards (net worth, cash flow, budgets)
    DashboardSummary,
}

impl core::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            CacheKey::AccountTransactions(account) => write!(f, "transactions:{account}"),
            CacheKey::Transactions => f.write_str("transactions"),
            CacheKey::Accounts => f.write_str("accounts"),
            CacheKey::DashboardSummary => f.write_str("dashboard_summary"),
        }
    }
}

/// Insertion-ordered set of cache keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKeySet {
    keys: Vec<CacheKey>,
}

impl CacheKeySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys invalidated once a statement import finishes.
    ///
    /// The account-scoped key is only included when the import was started
    /// against a known account.
    pub fn for_statement_import(account_id: Option<AccountId>) -> Self {
        let mut keys = Self::new();
        if let Some(account_id) = account_id {
            keys.insert(CacheKey::AccountTransactions(account_id));
        }
        keys.insert(CacheKey::Transactions);
        keys.insert(CacheKey::Accounts);
        keys.insert(CacheKey::DashboardSummary);
        keys
    }

    /// Returns false if the key was already present.
    pub fn insert(&mut self, key: CacheKey) -> bool {
        if self.keys.contains(&key) {
            return false;
        }
        self.keys.push(key);
        true
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.keys.contains(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CacheKey> {
        self.keys.iter()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl<'a> IntoIterator for &'a CacheKeySet {
    type Item = &'a CacheKey;
    type IntoIter = std::slice::Iter<'a, CacheKey>;

    fn into_iter(self) -> Self::IntoIter {
        self.keys.iter()
    }
}

impl FromIterator<CacheKey> for CacheKeySet {
    fn from_iter<I: IntoIterator<Item = CacheKey>>(iter: I) -> Self {
        let mut keys = Self::new();
        for key in iter {
            keys.insert(key);
        }
        keys
    }
}

/// Query-cache layer of the dashboard.
///
/// Shared across watch sessions and called from whichever task resolves, so
/// implementations must tolerate concurrent calls. Invalidating a key with no
/// cached data is a no-op.
pub trait CacheInvalidator: Send + Sync {
    fn invalidate(&self, keys: &CacheKeySet);
}
