//! Entitlement evaluation.
//!
//! Pure functions over an [`AccountRecord`] plus a point in time. Safe to call
//! on every page load and safe to call with a stale or cached record: no I/O,
//! deterministic given the inputs.

use chrono::{DateTime, Utc};

use crate::account::{AccountRecord, Plan};
use crate::error::{Result, TollgateError};
use crate::storage::AccountStore;

/// True iff the account is free-plan and inside a claimed trial window.
#[must_use]
pub fn is_trial_active(record: &AccountRecord, now: DateTime<Utc>) -> bool {
    record.plan == Plan::Free
        && match record.trial_end_date {
            Some(end) => now < end,
            None => false,
        }
}

/// Whether paid features are accessible right now.
#[must_use]
pub fn is_premium(record: &AccountRecord, now: DateTime<Utc>) -> bool {
    record.plan == Plan::Premium || record.is_lifetime_free || is_trial_active(record, now)
}

/// Whether the UI should block paid features behind an upgrade prompt.
///
/// False for lifetime-free and premium accounts. Also false when no trial was
/// ever claimed: that account is in the distinct "claim trial" state, not
/// blocked. Otherwise true strictly after the trial end; at the exact end
/// instant this still reports false, a deliberate one-instant buffer so clock
/// skew between evaluations cannot flap the answer.
#[must_use]
pub fn requires_upgrade(record: &AccountRecord, now: DateTime<Utc>) -> bool {
    if record.is_lifetime_free || record.plan == Plan::Premium {
        return false;
    }
    match record.trial_end_date {
        None => false,
        Some(end) => now > end,
    }
}

/// Days left in the trial, rounded up. `None` unless the trial is active.
#[must_use]
pub fn trial_days_remaining(record: &AccountRecord, now: DateTime<Utc>) -> Option<i64> {
    if !is_trial_active(record, now) {
        return None;
    }
    let end = record.trial_end_date?;
    let seconds = (end - now).num_seconds();
    Some((seconds + 86_399) / 86_400)
}

/// Snapshot of everything the evaluator knows, computed in one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct Entitlements {
    pub plan: Plan,
    pub premium: bool,
    pub trial_active: bool,
    pub requires_upgrade: bool,
    /// Only set while the trial is active.
    pub trial_days_remaining: Option<i64>,
}

impl Entitlements {
    /// Evaluate a record at a point in time.
    pub fn evaluate(record: &AccountRecord, now: DateTime<Utc>) -> Self {
        Self {
            plan: record.plan,
            premium: is_premium(record, now),
            trial_active: is_trial_active(record, now),
            requires_upgrade: requires_upgrade(record, now),
            trial_days_remaining: trial_days_remaining(record, now),
        }
    }

    /// Entitlements for a user with no account record yet: free plan, trial
    /// still claimable, nothing blocked.
    pub fn none() -> Self {
        Self {
            plan: Plan::Free,
            premium: false,
            trial_active: false,
            requires_upgrade: false,
            trial_days_remaining: None,
        }
    }
}

/// Result of gating a paid feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PremiumAccess {
    /// Paid features are accessible.
    Allowed,
    /// No trial ever claimed; offer the trial, not the paywall.
    TrialAvailable,
    /// Trial expired and no subscription; show the upgrade prompt.
    UpgradeRequired,
}

impl PremiumAccess {
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Gate a paid feature for use in middleware or guards.
///
/// A missing record or a store failure reads as the most restrictive
/// non-blocked state rather than an error; feature gates must not take pages
/// down.
#[must_use = "access check result must be used to enforce gating"]
pub async fn require_premium<S: AccountStore>(store: &S, user_id: &str) -> PremiumAccess {
    let record = match store.get_account(user_id).await {
        Ok(Some(record)) => record,
        Ok(None) => return PremiumAccess::TrialAvailable,
        Err(_) => return PremiumAccess::TrialAvailable,
    };

    let now = Utc::now();
    if is_premium(&record, now) {
        PremiumAccess::Allowed
    } else if requires_upgrade(&record, now) {
        PremiumAccess::UpgradeRequired
    } else {
        PremiumAccess::TrialAvailable
    }
}

/// Reads an account and evaluates it.
pub struct EntitlementsManager<S: AccountStore> {
    store: S,
}

impl<S: AccountStore> EntitlementsManager<S> {
    #[must_use]
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Current entitlements for a user. Missing records evaluate to
    /// [`Entitlements::none`].
    pub async fn get_entitlements(&self, user_id: &str) -> Result<Entitlements> {
        match self.store.get_account(user_id).await? {
            Some(record) => Ok(Entitlements::evaluate(&record, Utc::now())),
            None => Ok(Entitlements::none()),
        }
    }

    pub async fn is_premium(&self, user_id: &str) -> Result<bool> {
        Ok(self.get_entitlements(user_id).await?.premium)
    }

    pub async fn requires_upgrade(&self, user_id: &str) -> Result<bool> {
        Ok(self.get_entitlements(user_id).await?.requires_upgrade)
    }

    /// The record itself, for callers that need the raw fields.
    pub async fn get_account(&self, user_id: &str) -> Result<AccountRecord> {
        self.store
            .get_account(user_id)
            .await?
            .ok_or_else(|| TollgateError::not_found(format!("No account for user '{user_id}'")))
    }
}

/// Default maximum cache entries.
const DEFAULT_MAX_CACHE_ENTRIES: usize = 10_000;

/// Cleanup interval (every N operations).
const CLEANUP_INTERVAL: u64 = 100;

/// TTL cache around [`EntitlementsManager`] for the page-load hot path.
///
/// Entries expire after the TTL and the cache is bounded; expired and
/// least-recently-used entries are swept every [`CLEANUP_INTERVAL`]
/// operations. Writers should call [`invalidate`](Self::invalidate) after
/// mutating an account so the next read sees fresh state instead of waiting
/// out the TTL.
pub struct CachedEntitlementsManager<S: AccountStore> {
    inner: EntitlementsManager<S>,
    cache: std::sync::Arc<std::sync::RwLock<EntitlementsCache>>,
    ttl: std::time::Duration,
    max_entries: usize,
    operation_counter: std::sync::atomic::AtomicU64,
}

struct EntitlementsCache {
    entries: std::collections::HashMap<String, CacheEntry>,
}

struct CacheEntry {
    entitlements: Entitlements,
    expires_at: std::time::Instant,
    last_accessed: std::time::Instant,
}

impl<S: AccountStore> CachedEntitlementsManager<S> {
    #[must_use]
    pub fn new(inner: EntitlementsManager<S>, ttl: std::time::Duration) -> Self {
        Self::with_max_entries(inner, ttl, DEFAULT_MAX_CACHE_ENTRIES)
    }

    #[must_use]
    pub fn with_max_entries(
        inner: EntitlementsManager<S>,
        ttl: std::time::Duration,
        max_entries: usize,
    ) -> Self {
        Self {
            inner,
            cache: std::sync::Arc::new(std::sync::RwLock::new(EntitlementsCache {
                entries: std::collections::HashMap::new(),
            })),
            ttl,
            max_entries,
            operation_counter: std::sync::atomic::AtomicU64::new(0),
        }
    }

    fn maybe_cleanup(&self) {
        let count = self
            .operation_counter
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        if count % CLEANUP_INTERVAL == 0 {
            self.cleanup_expired();
            self.enforce_max_entries();
        }
    }

    /// Drop expired entries.
    pub fn cleanup_expired(&self) {
        if let Ok(mut cache) = self.cache.write() {
            let now = std::time::Instant::now();
            cache.entries.retain(|_, entry| entry.expires_at > now);
        }
    }

    /// Evict least-recently-accessed entries down to the size bound.
    pub fn enforce_max_entries(&self) {
        if let Ok(mut cache) = self.cache.write() {
            if cache.entries.len() <= self.max_entries {
                return;
            }

            let mut entries: Vec<_> = cache
                .entries
                .iter()
                .map(|(k, v)| (k.clone(), v.last_accessed))
                .collect();
            entries.sort_by_key(|(_, accessed)| *accessed);

            let to_remove = cache.entries.len() - self.max_entries;
            for (key, _) in entries.into_iter().take(to_remove) {
                cache.entries.remove(&key);
            }
        }
    }

    /// Drop one user's cached entry, typically right after a write.
    pub fn invalidate(&self, user_id: &str) {
        if let Ok(mut cache) = self.cache.write() {
            cache.entries.remove(user_id);
        }
    }

    /// Get entitlements, serving from cache when fresh.
    pub async fn get_entitlements(&self, user_id: &str) -> Result<Entitlements> {
        self.maybe_cleanup();

        // Poisoned lock reads as a cache miss.
        if let Ok(mut cache) = self.cache.write() {
            if let Some(entry) = cache.entries.get_mut(user_id) {
                if entry.expires_at > std::time::Instant::now() {
                    entry.last_accessed = std::time::Instant::now();
                    return Ok(entry.entitlements.clone());
                }
            }
        }

        let entitlements = self.inner.get_entitlements(user_id).await?;

        let now = std::time::Instant::now();
        if let Ok(mut cache) = self.cache.write() {
            cache.entries.insert(
                user_id.to_string(),
                CacheEntry {
                    entitlements: entitlements.clone(),
                    expires_at: now + self.ttl,
                    last_accessed: now,
                },
            );
        } else {
            tracing::warn!(
                target: "tollgate::entitlements",
                "Entitlements cache lock poisoned, skipping cache update"
            );
        }

        Ok(entitlements)
    }

    pub async fn is_premium(&self, user_id: &str) -> Result<bool> {
        Ok(self.get_entitlements(user_id).await?.premium)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::DEFAULT_TRIAL_DAYS;
    use crate::storage::test::InMemoryAccountStore;

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn trialing_record(start: &str) -> AccountRecord {
        let mut record = AccountRecord::new("user_1", DEFAULT_TRIAL_DAYS);
        let start = ts(start);
        record.has_used_trial = true;
        record.trial_start_date = Some(start);
        record.trial_end_date = Some(record.trial_end_for(start));
        record
    }

    #[test]
    fn trial_window_boundaries() {
        let record = trialing_record("2025-01-01T00:00:00Z");
        assert_eq!(record.trial_end_date, Some(ts("2025-01-08T00:00:00Z")));

        assert!(is_trial_active(&record, ts("2025-01-07T23:59:59Z")));
        assert!(!requires_upgrade(&record, ts("2025-01-07T23:59:59Z")));

        // At the exact end the trial is over but the upgrade prompt is not yet
        // shown, the documented one-instant buffer.
        assert!(!is_trial_active(&record, ts("2025-01-08T00:00:00Z")));
        assert!(!requires_upgrade(&record, ts("2025-01-08T00:00:00Z")));

        assert!(requires_upgrade(&record, ts("2025-01-08T00:00:01Z")));
        assert!(!is_premium(&record, ts("2025-01-08T00:00:01Z")));
    }

    #[test]
    fn unclaimed_trial_is_not_blocked() {
        let record = AccountRecord::new("user_1", DEFAULT_TRIAL_DAYS);
        let now = ts("2025-06-01T00:00:00Z");
        assert!(!is_premium(&record, now));
        assert!(!requires_upgrade(&record, now));
        assert!(trial_days_remaining(&record, now).is_none());
    }

    #[test]
    fn lifetime_free_never_requires_upgrade() {
        let now = ts("2025-06-01T00:00:00Z");

        let mut record = AccountRecord::new("user_1", DEFAULT_TRIAL_DAYS);
        record.is_lifetime_free = true;
        assert!(is_premium(&record, now));
        assert!(!requires_upgrade(&record, now));

        // Even with a long-expired trial.
        let mut record = trialing_record("2020-01-01T00:00:00Z");
        record.is_lifetime_free = true;
        assert!(is_premium(&record, now));
        assert!(!requires_upgrade(&record, now));
    }

    #[test]
    fn premium_and_requires_upgrade_never_both_true() {
        let times = [
            ts("2025-01-01T00:00:00Z"),
            ts("2025-01-05T12:00:00Z"),
            ts("2025-01-08T00:00:00Z"),
            ts("2025-02-01T00:00:00Z"),
            ts("2026-01-01T00:00:00Z"),
        ];

        let mut records = vec![
            AccountRecord::new("user_1", DEFAULT_TRIAL_DAYS),
            trialing_record("2025-01-01T00:00:00Z"),
        ];
        let mut premium = trialing_record("2025-01-01T00:00:00Z");
        premium.plan = Plan::Premium;
        premium.subscription_id = Some("sub_1".to_string());
        records.push(premium);
        let mut lifetime = AccountRecord::new("user_2", DEFAULT_TRIAL_DAYS);
        lifetime.is_lifetime_free = true;
        records.push(lifetime);
        let mut downgraded = trialing_record("2025-01-01T00:00:00Z");
        downgraded.mark_downgraded(ts("2025-03-01T00:00:00Z"));
        records.push(downgraded);

        for record in &records {
            for now in times {
                assert!(
                    !(is_premium(record, now) && requires_upgrade(record, now)),
                    "both true for {:?} at {}",
                    record.user_id,
                    now
                );
            }
        }
    }

    #[test]
    fn days_remaining_rounds_up() {
        let record = trialing_record("2025-01-01T00:00:00Z");

        // 6 days 12 hours left reads as 7 days.
        assert_eq!(
            trial_days_remaining(&record, ts("2025-01-01T12:00:00Z")),
            Some(7)
        );
        // Exactly 2 days.
        assert_eq!(
            trial_days_remaining(&record, ts("2025-01-06T00:00:00Z")),
            Some(2)
        );
        // One second left still reads as a day.
        assert_eq!(
            trial_days_remaining(&record, ts("2025-01-07T23:59:59Z")),
            Some(1)
        );
        // Over.
        assert_eq!(
            trial_days_remaining(&record, ts("2025-01-09T00:00:00Z")),
            None
        );
    }

    #[test]
    fn snapshot_matches_pure_functions() {
        let record = trialing_record("2025-01-01T00:00:00Z");
        let now = ts("2025-01-03T00:00:00Z");
        let snapshot = Entitlements::evaluate(&record, now);
        assert!(snapshot.premium);
        assert!(snapshot.trial_active);
        assert!(!snapshot.requires_upgrade);
        assert_eq!(snapshot.trial_days_remaining, Some(5));
    }

    #[tokio::test]
    async fn manager_returns_none_for_missing_account() {
        let store = InMemoryAccountStore::new();
        let manager = EntitlementsManager::new(store);
        let entitlements = manager.get_entitlements("nobody").await.unwrap();
        assert_eq!(entitlements, Entitlements::none());
        assert!(!entitlements.requires_upgrade);
    }

    #[tokio::test]
    async fn require_premium_distinguishes_claimable_from_blocked() {
        let store = InMemoryAccountStore::new();
        assert_eq!(
            require_premium(&store, "user_1").await,
            PremiumAccess::TrialAvailable
        );

        let expired = trialing_record("2020-01-01T00:00:00Z");
        store.save_account(&expired).await.unwrap();
        assert_eq!(
            require_premium(&store, "user_1").await,
            PremiumAccess::UpgradeRequired
        );

        let mut premium = store.get_account("user_1").await.unwrap().unwrap();
        premium.plan = Plan::Premium;
        premium.subscription_id = Some("sub_1".to_string());
        store.save_account(&premium).await.unwrap();
        assert_eq!(
            require_premium(&store, "user_1").await,
            PremiumAccess::Allowed
        );
    }

    #[tokio::test]
    async fn cached_manager_serves_stale_until_invalidated() {
        let store = InMemoryAccountStore::new();
        let record = trialing_record("2025-01-01T00:00:00Z");
        store.save_account(&record).await.unwrap();

        let cached = CachedEntitlementsManager::new(
            EntitlementsManager::new(store.clone()),
            std::time::Duration::from_secs(300),
        );

        let first = cached.get_entitlements("user_1").await.unwrap();
        assert_eq!(first.plan, Plan::Free);

        let mut upgraded = store.get_account("user_1").await.unwrap().unwrap();
        upgraded.plan = Plan::Premium;
        upgraded.subscription_id = Some("sub_1".to_string());
        store.save_account(&upgraded).await.unwrap();

        // Still the cached answer.
        let second = cached.get_entitlements("user_1").await.unwrap();
        assert_eq!(second.plan, Plan::Free);

        cached.invalidate("user_1");
        let third = cached.get_entitlements("user_1").await.unwrap();
        assert_eq!(third.plan, Plan::Premium);
    }
}
