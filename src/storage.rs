//! Storage trait for account records.
//!
//! Implement [`AccountStore`] to persist entitlement state to your database.
//! An in-memory implementation is provided for testing. All implementations
//! must run [`AccountRecord::validate`] before commit so a buggy handler can
//! never persist a self-contradictory record.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::account::AccountRecord;
use crate::error::Result;

/// Free-text cancellation feedback, recorded for product analytics only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CancellationFeedback {
    pub user_id: String,
    pub reason: String,
    pub additional_feedback: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

/// Trait for persisting account entitlement state.
///
/// The record is the single shared mutable resource in this crate: the
/// user-facing action API and the webhook processor write it concurrently.
/// Writes therefore go through versioned compare-and-save rather than blind
/// replacement.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Get the account record for a user.
    async fn get_account(&self, user_id: &str) -> Result<Option<AccountRecord>>;

    /// Save the record unconditionally.
    ///
    /// Implementations validate the record, bump `version` and refresh
    /// `updated_at` as part of the save.
    async fn save_account(&self, record: &AccountRecord) -> Result<()>;

    /// Save only if the stored record still carries `expected_version`.
    ///
    /// Returns `Ok(true)` on success, `Ok(false)` on a version conflict (the
    /// caller re-reads and retries). A missing record saves unconditionally.
    ///
    /// # Important: production implementations must override this
    ///
    /// The default implementation has a time-of-check to time-of-use race and
    /// is only suitable for single-threaded scenarios. Override it with an
    /// atomic compare-and-swap, e.g. SQL
    /// `UPDATE accounts SET ... WHERE user_id = $1 AND version = $2`.
    async fn compare_and_save_account(
        &self,
        record: &AccountRecord,
        expected_version: u64,
    ) -> Result<bool> {
        #[cfg(debug_assertions)]
        {
            static WARNED: std::sync::atomic::AtomicBool =
                std::sync::atomic::AtomicBool::new(false);
            if !WARNED.swap(true, std::sync::atomic::Ordering::Relaxed) {
                tracing::warn!(
                    target: "tollgate::storage",
                    "Using default non-atomic compare_and_save_account implementation. \
                     This is NOT safe for production use with concurrent requests. \
                     Override this method with an atomic compare-and-swap operation."
                );
            }
        }

        if let Some(current) = self.get_account(&record.user_id).await? {
            if current.version != expected_version {
                return Ok(false);
            }
        }
        self.save_account(record).await?;
        Ok(true)
    }

    /// Get the record, creating the registration-time default if absent.
    async fn get_or_create_account(
        &self,
        user_id: &str,
        trial_duration_days: u32,
    ) -> Result<AccountRecord> {
        if let Some(record) = self.get_account(user_id).await? {
            return Ok(record);
        }
        let record = AccountRecord::new(user_id, trial_duration_days);
        self.save_account(&record).await?;
        // Re-read so the caller holds the stored version.
        Ok(self
            .get_account(user_id)
            .await?
            .unwrap_or(record))
    }

    /// Look up the account linked to a Stripe customer.
    async fn find_by_customer_id(&self, customer_id: &str) -> Result<Option<AccountRecord>>;

    /// Look up the account linked to a Stripe subscription.
    async fn find_by_subscription_id(&self, subscription_id: &str)
        -> Result<Option<AccountRecord>>;

    /// Atomically claim the trial: set the window and `has_used_trial` iff it
    /// was never set. `Ok(false)` when already claimed (or no record exists).
    ///
    /// The trial end is derived from the stored record's own
    /// `trial_duration_days`, keeping the window invariant inside the same
    /// atomic step. The same override requirement as
    /// [`compare_and_save_account`] applies; SQL implementations use
    /// `UPDATE ... WHERE user_id = $1 AND has_used_trial = FALSE`.
    async fn try_claim_trial(&self, user_id: &str, start: DateTime<Utc>) -> Result<bool> {
        let Some(mut record) = self.get_account(user_id).await? else {
            return Ok(false);
        };
        if record.has_used_trial {
            return Ok(false);
        }
        record.trial_start_date = Some(start);
        record.trial_end_date = Some(record.trial_end_for(start));
        record.has_used_trial = true;
        self.save_account(&record).await?;
        Ok(true)
    }

    // Webhook idempotency

    /// Check if a webhook event has already been processed.
    async fn is_event_processed(&self, event_id: &str) -> Result<bool>;

    /// Mark a webhook event as processed.
    async fn mark_event_processed(&self, event_id: &str) -> Result<()>;

    /// Clean up old processed events (default: no-op).
    async fn cleanup_old_events(&self, _older_than_days: u32) -> Result<usize> {
        Ok(0)
    }

    /// Append cancellation feedback. Best-effort at the call sites; failures
    /// there are logged, never propagated into the cancellation itself.
    async fn record_feedback(&self, feedback: &CancellationFeedback) -> Result<()>;
}

/// In-memory account store for testing.
#[cfg(any(test, feature = "test-billing"))]
pub mod test {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, RwLock};

    /// In-memory account store for testing.
    ///
    /// Wraps data in `Arc` for cheap cloning; clones share state.
    #[derive(Default, Clone)]
    pub struct InMemoryAccountStore {
        inner: Arc<InMemoryAccountStoreInner>,
    }

    #[derive(Default)]
    struct InMemoryAccountStoreInner {
        accounts: RwLock<HashMap<String, AccountRecord>>,
        processed_events: RwLock<HashMap<String, DateTime<Utc>>>,
        feedback: RwLock<Vec<CancellationFeedback>>,
        fail_feedback: AtomicBool,
    }

    impl InMemoryAccountStore {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// All records, for test assertions.
        pub fn get_all_accounts(&self) -> HashMap<String, AccountRecord> {
            self.inner.accounts.read().unwrap().clone()
        }

        /// Processed event ids, for test assertions.
        pub fn get_processed_events(&self) -> Vec<String> {
            self.inner
                .processed_events
                .read()
                .unwrap()
                .keys()
                .cloned()
                .collect()
        }

        /// Recorded feedback, for test assertions.
        pub fn get_feedback(&self) -> Vec<CancellationFeedback> {
            self.inner.feedback.read().unwrap().clone()
        }

        /// Make `record_feedback` fail, to exercise the best-effort path.
        pub fn set_fail_feedback(&self, fail: bool) {
            self.inner.fail_feedback.store(fail, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl AccountStore for InMemoryAccountStore {
        async fn get_account(&self, user_id: &str) -> Result<Option<AccountRecord>> {
            Ok(self.inner.accounts.read().unwrap().get(user_id).cloned())
        }

        async fn save_account(&self, record: &AccountRecord) -> Result<()> {
            record.validate()?;
            let mut accounts = self.inner.accounts.write().unwrap();
            let mut stored = record.clone();
            stored.version = accounts
                .get(&record.user_id)
                .map(|current| current.version + 1)
                .unwrap_or(record.version + 1);
            stored.updated_at = Utc::now();
            accounts.insert(record.user_id.clone(), stored);
            Ok(())
        }

        async fn compare_and_save_account(
            &self,
            record: &AccountRecord,
            expected_version: u64,
        ) -> Result<bool> {
            record.validate()?;
            let mut accounts = self.inner.accounts.write().unwrap();

            if let Some(current) = accounts.get(&record.user_id) {
                if current.version != expected_version {
                    return Ok(false);
                }
            }

            let mut stored = record.clone();
            stored.version = expected_version + 1;
            stored.updated_at = Utc::now();
            accounts.insert(record.user_id.clone(), stored);
            Ok(true)
        }

        async fn find_by_customer_id(&self, customer_id: &str) -> Result<Option<AccountRecord>> {
            let accounts = self.inner.accounts.read().unwrap();
            Ok(accounts
                .values()
                .find(|r| r.customer_id.as_deref() == Some(customer_id))
                .cloned())
        }

        async fn find_by_subscription_id(
            &self,
            subscription_id: &str,
        ) -> Result<Option<AccountRecord>> {
            let accounts = self.inner.accounts.read().unwrap();
            Ok(accounts
                .values()
                .find(|r| r.subscription_id.as_deref() == Some(subscription_id))
                .cloned())
        }

        async fn try_claim_trial(&self, user_id: &str, start: DateTime<Utc>) -> Result<bool> {
            // Check and set under one write lock.
            let mut accounts = self.inner.accounts.write().unwrap();
            let Some(record) = accounts.get_mut(user_id) else {
                return Ok(false);
            };
            if record.has_used_trial {
                return Ok(false);
            }
            record.trial_start_date = Some(start);
            record.trial_end_date = Some(record.trial_end_for(start));
            record.has_used_trial = true;
            record.version += 1;
            record.updated_at = Utc::now();
            Ok(true)
        }

        async fn is_event_processed(&self, event_id: &str) -> Result<bool> {
            Ok(self
                .inner
                .processed_events
                .read()
                .unwrap()
                .contains_key(event_id))
        }

        async fn mark_event_processed(&self, event_id: &str) -> Result<()> {
            self.inner
                .processed_events
                .write()
                .unwrap()
                .insert(event_id.to_string(), Utc::now());
            Ok(())
        }

        async fn cleanup_old_events(&self, older_than_days: u32) -> Result<usize> {
            let cutoff = Utc::now() - chrono::Duration::days(i64::from(older_than_days));
            let mut events = self.inner.processed_events.write().unwrap();
            let initial_len = events.len();
            events.retain(|_, processed_at| *processed_at >= cutoff);
            Ok(initial_len - events.len())
        }

        async fn record_feedback(&self, feedback: &CancellationFeedback) -> Result<()> {
            if self.inner.fail_feedback.load(Ordering::SeqCst) {
                return Err(crate::error::TollgateError::internal(
                    "feedback store unavailable",
                ));
            }
            self.inner.feedback.write().unwrap().push(feedback.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test::InMemoryAccountStore;
    use super::*;
    use crate::account::{Plan, DEFAULT_TRIAL_DAYS};

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn save_bumps_version() {
        let store = InMemoryAccountStore::new();
        let record = AccountRecord::new("user_1", DEFAULT_TRIAL_DAYS);
        store.save_account(&record).await.unwrap();

        let stored = store.get_account("user_1").await.unwrap().unwrap();
        assert_eq!(stored.version, 1);

        store.save_account(&stored).await.unwrap();
        let stored = store.get_account("user_1").await.unwrap().unwrap();
        assert_eq!(stored.version, 2);
    }

    #[tokio::test]
    async fn save_rejects_invalid_records() {
        let store = InMemoryAccountStore::new();
        let mut record = AccountRecord::new("user_1", DEFAULT_TRIAL_DAYS);
        record.cancel_at_period_end = true; // no subscription_id

        let err = store.save_account(&record).await.unwrap_err();
        assert!(err.to_string().contains("inconsistent"));
        assert!(store.get_account("user_1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn compare_and_save_detects_conflicts() {
        let store = InMemoryAccountStore::new();
        let record = AccountRecord::new("user_1", DEFAULT_TRIAL_DAYS);
        store.save_account(&record).await.unwrap();

        let stored = store.get_account("user_1").await.unwrap().unwrap();

        let mut update_a = stored.clone();
        update_a.is_lifetime_free = true;
        assert!(store
            .compare_and_save_account(&update_a, stored.version)
            .await
            .unwrap());

        // Second writer still holds the old version.
        let mut update_b = stored.clone();
        update_b.trial_duration_days = 30;
        assert!(!store
            .compare_and_save_account(&update_b, stored.version)
            .await
            .unwrap());

        let current = store.get_account("user_1").await.unwrap().unwrap();
        assert!(current.is_lifetime_free);
        assert_eq!(current.trial_duration_days, DEFAULT_TRIAL_DAYS);
    }

    #[tokio::test]
    async fn claim_trial_is_one_shot() {
        let store = InMemoryAccountStore::new();
        let record = AccountRecord::new("user_1", DEFAULT_TRIAL_DAYS);
        store.save_account(&record).await.unwrap();

        let start = ts("2025-01-01T00:00:00Z");
        let (first, second) = tokio::join!(
            store.try_claim_trial("user_1", start),
            store.try_claim_trial("user_1", start),
        );
        let claims = [first.unwrap(), second.unwrap()];
        assert_eq!(claims.iter().filter(|c| **c).count(), 1);

        let stored = store.get_account("user_1").await.unwrap().unwrap();
        assert!(stored.has_used_trial);
        assert_eq!(stored.trial_start_date, Some(start));
        assert_eq!(stored.trial_end_date, Some(ts("2025-01-08T00:00:00Z")));
        stored.validate().unwrap();
    }

    #[tokio::test]
    async fn claim_trial_without_account_is_false() {
        let store = InMemoryAccountStore::new();
        assert!(!store
            .try_claim_trial("ghost", ts("2025-01-01T00:00:00Z"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn lookup_by_stripe_ids() {
        let store = InMemoryAccountStore::new();
        let mut record = AccountRecord::new("user_1", DEFAULT_TRIAL_DAYS);
        record.plan = Plan::Premium;
        record.customer_id = Some("cus_abc".to_string());
        record.subscription_id = Some("sub_abc".to_string());
        store.save_account(&record).await.unwrap();

        let by_customer = store.find_by_customer_id("cus_abc").await.unwrap().unwrap();
        assert_eq!(by_customer.user_id, "user_1");

        let by_subscription = store
            .find_by_subscription_id("sub_abc")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_subscription.user_id, "user_1");

        assert!(store.find_by_customer_id("cus_zzz").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn get_or_create_seeds_default_record() {
        let store = InMemoryAccountStore::new();
        let record = store.get_or_create_account("user_9", 14).await.unwrap();
        assert_eq!(record.trial_duration_days, 14);
        assert_eq!(record.plan, Plan::Free);
        assert_eq!(record.version, 1);

        // Second call returns the same stored record.
        let again = store.get_or_create_account("user_9", 7).await.unwrap();
        assert_eq!(again.trial_duration_days, 14);
        assert_eq!(again.version, 1);
    }

    #[tokio::test]
    async fn event_ledger_round_trip() {
        let store = InMemoryAccountStore::new();
        assert!(!store.is_event_processed("evt_1").await.unwrap());

        store.mark_event_processed("evt_1").await.unwrap();
        assert!(store.is_event_processed("evt_1").await.unwrap());

        // Fresh events survive cleanup.
        let removed = store.cleanup_old_events(30).await.unwrap();
        assert_eq!(removed, 0);
        assert!(store.is_event_processed("evt_1").await.unwrap());
    }

    #[tokio::test]
    async fn feedback_is_appended() {
        let store = InMemoryAccountStore::new();
        let feedback = CancellationFeedback {
            user_id: "user_1".to_string(),
            reason: "too_expensive".to_string(),
            additional_feedback: Some("loved the calendar though".to_string()),
            submitted_at: Utc::now(),
        };
        store.record_feedback(&feedback).await.unwrap();
        assert_eq!(store.get_feedback(), vec![feedback]);
    }
}
