//! Subscription action API.
//!
//! Cancel, reactivate, interval switch, cancellation feedback, and the live
//! subscription detail read. Every mutating action follows the same protocol:
//! Stripe is updated first, then the local record is normalized from Stripe's
//! response under a versioned compare-and-save. A Stripe failure therefore
//! leaves the record untouched, and a webhook that lands mid-action is
//! detected as a version conflict rather than silently overwritten.

use std::future::Future;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::account::{AccountRecord, BillingInterval, Plan};
use crate::error::{BillingError, Result};
use crate::plans::PlanCatalog;
use crate::storage::{AccountStore, CancellationFeedback};

/// Subscription lifecycle actions for authenticated users.
pub struct SubscriptionManager<S: AccountStore, C: StripeSubscriptionClient> {
    store: S,
    client: C,
    catalog: PlanCatalog,
}

impl<S: AccountStore, C: StripeSubscriptionClient> SubscriptionManager<S, C> {
    /// Create a new subscription manager.
    #[must_use]
    pub fn new(store: S, client: C, catalog: PlanCatalog) -> Self {
        Self {
            store,
            client,
            catalog,
        }
    }

    /// Schedule the subscription to cancel at the end of the paid period.
    ///
    /// Access is not revoked here; the downgrade happens when Stripe sends
    /// the deletion event at period end.
    pub async fn cancel(&self, user_id: &str) -> Result<AccountRecord> {
        let record = self.require_account(user_id).await?;
        let subscription_id = require_subscription(&record)?;

        let data = self
            .client
            .set_cancel_at_period_end(&subscription_id, true)
            .await?;

        let mut updated = record.clone();
        updated.cancel_at_period_end = data.cancel_at_period_end;

        let saved = self
            .commit_after_stripe(updated, record.version, "cancel", |current| {
                current.cancel_at_period_end
            })
            .await?;

        tracing::info!(
            target: "tollgate::subscription",
            user_id = %user_id,
            subscription_id = %subscription_id,
            "Scheduled cancellation at period end"
        );
        Ok(saved)
    }

    /// Clear a pending cancellation.
    ///
    /// When no cancellation is pending this is a no-op that reports success;
    /// the desired end state already holds, so there is nothing to do and no
    /// Stripe call is made.
    pub async fn reactivate(&self, user_id: &str) -> Result<AccountRecord> {
        let record = self.require_account(user_id).await?;

        if !record.cancel_at_period_end {
            return Ok(record);
        }
        let subscription_id = require_subscription(&record)?;

        let data = self
            .client
            .set_cancel_at_period_end(&subscription_id, false)
            .await?;

        let mut updated = record.clone();
        updated.cancel_at_period_end = data.cancel_at_period_end;

        let saved = self
            .commit_after_stripe(updated, record.version, "reactivate", |current| {
                !current.cancel_at_period_end
            })
            .await?;

        tracing::info!(
            target: "tollgate::subscription",
            user_id = %user_id,
            subscription_id = %subscription_id,
            "Reactivated subscription"
        );
        Ok(saved)
    }

    /// Schedule a billing interval switch, effective at the period end.
    ///
    /// Stripe owns the rotation via a subscription schedule with no
    /// proration. Locally only the intent is stored (`pending_interval`);
    /// `billing_interval` flips when the rotation webhook confirms it, so a
    /// read between the request and the period boundary still shows the
    /// interval actually being billed.
    pub async fn switch_interval(
        &self,
        user_id: &str,
        new_interval: BillingInterval,
    ) -> Result<ScheduledSwitch> {
        let record = self.require_account(user_id).await?;
        let subscription_id = require_subscription(&record)?;

        if record.billing_interval == Some(new_interval) && record.pending_interval.is_none() {
            return Err(BillingError::IntervalUnchanged {
                interval: new_interval.as_str().to_string(),
            }
            .into());
        }

        // The record does not store the tier; the current price is the source
        // of truth for what is actually being billed.
        let data = self.client.get_subscription(&subscription_id).await?;
        let (tier, live_interval) =
            self.catalog
                .tier_for_price(&data.price_id)
                .ok_or_else(|| BillingError::UnknownPrice {
                    price_id: data.price_id.clone(),
                })?;

        if live_interval == new_interval {
            return Err(BillingError::IntervalUnchanged {
                interval: new_interval.as_str().to_string(),
            }
            .into());
        }

        let target_price = self.catalog.price_id(tier, new_interval).to_string();
        let change = self
            .client
            .schedule_interval_switch(&subscription_id, &target_price)
            .await?;

        let mut updated = record.clone();
        updated.pending_interval = Some(new_interval);

        self.commit_after_stripe(updated, record.version, "switch_interval", |current| {
            current.pending_interval == Some(new_interval)
                || current.billing_interval == Some(new_interval)
        })
        .await?;

        let effective_date = datetime_from_unix(change.effective_at);
        tracing::info!(
            target: "tollgate::subscription",
            user_id = %user_id,
            subscription_id = %subscription_id,
            new_interval = %new_interval,
            effective_date = %effective_date,
            "Scheduled interval switch"
        );

        Ok(ScheduledSwitch {
            new_interval,
            effective_date,
        })
    }

    /// Record why a user cancelled. Analytics-only and best-effort: a store
    /// failure is logged and swallowed so it can never block the
    /// cancellation flow that triggered it.
    pub async fn submit_feedback(
        &self,
        user_id: &str,
        reason: &str,
        additional_feedback: Option<String>,
    ) -> Result<()> {
        let feedback = CancellationFeedback {
            user_id: user_id.to_string(),
            reason: reason.to_string(),
            additional_feedback,
            submitted_at: Utc::now(),
        };
        if let Err(error) = self.store.record_feedback(&feedback).await {
            tracing::warn!(
                target: "tollgate::subscription",
                user_id = %user_id,
                %error,
                "Failed to record cancellation feedback"
            );
        }
        Ok(())
    }

    /// The subscription detail read: local plan state plus a live-fetched
    /// Stripe subscription object, or `None` when the account has none.
    pub async fn subscription_detail(&self, user_id: &str) -> Result<SubscriptionDetail> {
        let record = match self.store.get_account(user_id).await? {
            Some(record) => record,
            // No record yet reads as the registration-time default.
            None => AccountRecord::new(user_id, crate::account::DEFAULT_TRIAL_DAYS),
        };

        let subscription = match &record.subscription_id {
            Some(subscription_id) => match self.client.get_subscription(subscription_id).await {
                Ok(data) => Some(LiveSubscription::from_stripe(&data)),
                Err(err) if is_stripe_not_found(&err) => {
                    tracing::warn!(
                        target: "tollgate::subscription",
                        user_id = %user_id,
                        subscription_id = %subscription_id,
                        "Locally-known subscription missing in Stripe; deletion webhook pending?"
                    );
                    None
                }
                Err(err) => return Err(err.into()),
            },
            None => None,
        };

        Ok(SubscriptionDetail {
            plan: record.plan,
            billing_interval: record.billing_interval,
            trial_end_date: record.trial_end_date,
            subscription_start_date: record.subscription_start_date,
            subscription,
        })
    }

    /// Reconcile the local record against Stripe's current state.
    ///
    /// Applies the same normalization rules as the subscription-updated
    /// webhook handler. Useful after suspected missed webhooks.
    pub async fn sync_from_stripe(&self, user_id: &str) -> Result<SyncOutcome> {
        let record = self.require_account(user_id).await?;
        let Some(subscription_id) = record.subscription_id.clone() else {
            return Ok(SyncOutcome::NoSubscription);
        };

        let data = match self.client.get_subscription(&subscription_id).await {
            Ok(data) => data,
            Err(err) if is_stripe_not_found(&err) => return Ok(SyncOutcome::NotFoundInStripe),
            Err(err) => return Err(err.into()),
        };

        let mut updated = record.clone();
        let mut changes = Vec::new();

        match data.status.as_str() {
            "active" | "trialing" => {
                if updated.plan != Plan::Premium {
                    changes.push(SyncChange::Plan {
                        from: updated.plan,
                        to: Plan::Premium,
                    });
                    updated.plan = Plan::Premium;
                    updated.clear_deletion_schedule();
                }
            }
            "canceled" | "unpaid" => {
                if !updated.is_downgraded() {
                    changes.push(SyncChange::Plan {
                        from: updated.plan,
                        to: Plan::Free,
                    });
                    updated.mark_downgraded(Utc::now());
                }
            }
            other => {
                tracing::debug!(
                    target: "tollgate::subscription",
                    user_id = %user_id,
                    status = %other,
                    "Leaving plan untouched for intermediate subscription status"
                );
            }
        }

        // mark_downgraded clears the subscription linkage; only sync the
        // subscription-scoped fields while the link still exists.
        if updated.subscription_id.is_some() {
            if updated.cancel_at_period_end != data.cancel_at_period_end {
                changes.push(SyncChange::CancelAtPeriodEnd {
                    from: updated.cancel_at_period_end,
                    to: data.cancel_at_period_end,
                });
                updated.cancel_at_period_end = data.cancel_at_period_end;
            }

            if let Some((_, interval)) = self.catalog.tier_for_price(&data.price_id) {
                if updated.billing_interval != Some(interval) {
                    changes.push(SyncChange::BillingInterval {
                        from: updated.billing_interval,
                        to: interval,
                    });
                    updated.billing_interval = Some(interval);
                }
                if updated.pending_interval == Some(interval) {
                    changes.push(SyncChange::PendingIntervalCleared);
                    updated.pending_interval = None;
                }
            }
        }

        if changes.is_empty() {
            return Ok(SyncOutcome::InSync);
        }

        self.store
            .compare_and_save_account(&updated, record.version)
            .await?;

        tracing::info!(
            target: "tollgate::subscription",
            user_id = %user_id,
            change_count = changes.len(),
            "Reconciled account from Stripe"
        );
        Ok(SyncOutcome::Updated { changes })
    }

    async fn require_account(&self, user_id: &str) -> Result<AccountRecord> {
        self.store
            .get_account(user_id)
            .await?
            .ok_or_else(|| {
                BillingError::AccountNotFound {
                    user_id: user_id.to_string(),
                }
                .into()
            })
    }

    /// Save after a successful Stripe mutation.
    ///
    /// On a version conflict the record is re-read; if the concurrent writer
    /// (the webhook processor) already produced the desired end state the
    /// action still reports success. The Stripe call is never repeated.
    async fn commit_after_stripe(
        &self,
        updated: AccountRecord,
        expected_version: u64,
        operation: &str,
        reached_desired_state: impl Fn(&AccountRecord) -> bool,
    ) -> Result<AccountRecord> {
        if self
            .store
            .compare_and_save_account(&updated, expected_version)
            .await?
        {
            return self
                .store
                .get_account(&updated.user_id)
                .await?
                .ok_or_else(|| {
                    crate::error::TollgateError::internal("Account disappeared after save")
                });
        }

        let current = self.require_account(&updated.user_id).await?;
        if reached_desired_state(&current) {
            // A webhook landed in between and already applied this change.
            return Ok(current);
        }

        tracing::error!(
            target: "tollgate::subscription",
            user_id = %updated.user_id,
            operation = %operation,
            "Version conflict after Stripe update; local state diverged"
        );
        Err(BillingError::ConcurrentModification {
            user_id: updated.user_id.clone(),
        }
        .into())
    }
}

fn require_subscription(record: &AccountRecord) -> Result<String> {
    record.subscription_id.clone().ok_or_else(|| {
        BillingError::NoSubscription {
            user_id: record.user_id.clone(),
        }
        .into()
    })
}

fn is_stripe_not_found(err: &BillingError) -> bool {
    match err {
        BillingError::StripeApiError {
            code, http_status, ..
        } => code.as_deref() == Some("resource_missing") || *http_status == Some(404),
        _ => false,
    }
}

pub(crate) fn datetime_from_unix(secs: u64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs as i64, 0).unwrap_or(DateTime::UNIX_EPOCH)
}

/// A scheduled interval switch, reported back to the caller.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledSwitch {
    pub new_interval: BillingInterval,
    pub effective_date: DateTime<Utc>,
}

/// The subscription detail response shape.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionDetail {
    pub plan: Plan,
    pub billing_interval: Option<BillingInterval>,
    pub trial_end_date: Option<DateTime<Utc>>,
    pub subscription_start_date: Option<DateTime<Utc>>,
    pub subscription: Option<LiveSubscription>,
}

/// Live Stripe subscription state for the detail read.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveSubscription {
    pub id: String,
    pub status: String,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub cancel_at_period_end: bool,
    pub cancel_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub trial_end: Option<DateTime<Utc>>,
    pub amount: Option<i64>,
    pub currency: Option<String>,
    pub interval: Option<BillingInterval>,
}

impl LiveSubscription {
    fn from_stripe(data: &StripeSubscriptionData) -> Self {
        Self {
            id: data.id.clone(),
            status: data.status.clone(),
            current_period_start: datetime_from_unix(data.current_period_start),
            current_period_end: datetime_from_unix(data.current_period_end),
            cancel_at_period_end: data.cancel_at_period_end,
            cancel_at: data.cancel_at.map(datetime_from_unix),
            canceled_at: data.canceled_at.map(datetime_from_unix),
            trial_end: data.trial_end.map(datetime_from_unix),
            amount: data.amount,
            currency: data.currency.clone(),
            interval: data
                .interval
                .as_deref()
                .and_then(BillingInterval::from_stripe),
        }
    }
}

/// Outcome of a reconciliation against Stripe.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum SyncOutcome {
    /// The account has no subscription to reconcile.
    NoSubscription,
    /// The locally-known subscription does not exist in Stripe.
    NotFoundInStripe,
    /// Local state already matches Stripe.
    InSync,
    /// Local state was updated to match Stripe.
    Updated { changes: Vec<SyncChange> },
}

/// A field the reconciliation changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncChange {
    Plan { from: Plan, to: Plan },
    CancelAtPeriodEnd { from: bool, to: bool },
    BillingInterval {
        from: Option<BillingInterval>,
        to: BillingInterval,
    },
    PendingIntervalCleared,
}

/// Raw Stripe subscription state, as the wire reports it (Unix seconds).
#[derive(Debug, Clone)]
pub struct StripeSubscriptionData {
    pub id: String,
    pub customer_id: String,
    pub status: String,
    /// The single subscription item's price.
    pub price_id: String,
    pub current_period_start: u64,
    pub current_period_end: u64,
    pub cancel_at_period_end: bool,
    pub cancel_at: Option<u64>,
    pub canceled_at: Option<u64>,
    pub trial_end: Option<u64>,
    /// Unit amount in the currency's minor unit.
    pub amount: Option<i64>,
    pub currency: Option<String>,
    /// Stripe's recurring interval string ("month"/"year").
    pub interval: Option<String>,
}

/// A confirmed schedule change in Stripe.
#[derive(Debug, Clone)]
pub struct ScheduledChange {
    pub schedule_id: String,
    /// When the new phase starts (Unix seconds).
    pub effective_at: u64,
    pub price_id: String,
}

/// Trait for Stripe subscription operations.
///
/// Methods return `Send` futures so handlers over a generic client stay
/// spawnable. Implementations can still write plain `async fn`. The error is
/// the typed [`BillingError`] so callers can branch on Stripe's error code
/// rather than on rendered text.
pub trait StripeSubscriptionClient: Send + Sync {
    /// Get subscription details from Stripe.
    fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> impl Future<Output = Result<StripeSubscriptionData, BillingError>> + Send;

    /// Set or clear cancel-at-period-end, returning the updated subscription.
    fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel: bool,
    ) -> impl Future<Output = Result<StripeSubscriptionData, BillingError>> + Send;

    /// Schedule a price rotation at the end of the current period, without
    /// proration. Returns the scheduled change.
    fn schedule_interval_switch(
        &self,
        subscription_id: &str,
        new_price_id: &str,
    ) -> impl Future<Output = Result<ScheduledChange, BillingError>> + Send;
}

/// Mock Stripe subscription client for testing.
#[cfg(any(test, feature = "test-billing"))]
pub mod test {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::{Arc, RwLock};

    /// Mock Stripe subscription client.
    #[derive(Default, Clone)]
    pub struct MockStripeSubscriptionClient {
        subscriptions: Arc<RwLock<HashMap<String, StripeSubscriptionData>>>,
        schedules: Arc<RwLock<Vec<(String, String)>>>,
        schedule_counter: Arc<AtomicU64>,
        calls: Arc<AtomicU64>,
        fail_next: Arc<AtomicBool>,
    }

    impl MockStripeSubscriptionClient {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Add a subscription for testing.
        pub fn add_subscription(&self, data: StripeSubscriptionData) {
            self.subscriptions
                .write()
                .unwrap()
                .insert(data.id.clone(), data);
        }

        /// Scheduled (subscription_id, price_id) rotations.
        pub fn scheduled_switches(&self) -> Vec<(String, String)> {
            self.schedules.read().unwrap().clone()
        }

        /// Number of API calls made.
        pub fn call_count(&self) -> u64 {
            self.calls.load(Ordering::SeqCst)
        }

        /// Make the next call fail with a transport-style error.
        pub fn fail_next(&self) {
            self.fail_next.store(true, Ordering::SeqCst);
        }

        fn check_failure(&self, operation: &str) -> Result<(), BillingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(BillingError::StripeUnavailable {
                    operation: operation.to_string(),
                    message: "connection reset".to_string(),
                });
            }
            Ok(())
        }

        fn not_found(subscription_id: &str, operation: &str) -> BillingError {
            BillingError::StripeApiError {
                operation: operation.to_string(),
                message: format!("No such subscription: '{}'", subscription_id),
                code: Some("resource_missing".to_string()),
                http_status: Some(404),
            }
        }
    }

    impl StripeSubscriptionClient for MockStripeSubscriptionClient {
        async fn get_subscription(
            &self,
            subscription_id: &str,
        ) -> Result<StripeSubscriptionData, BillingError> {
            self.check_failure("get_subscription")?;
            self.subscriptions
                .read()
                .unwrap()
                .get(subscription_id)
                .cloned()
                .ok_or_else(|| Self::not_found(subscription_id, "get_subscription"))
        }

        async fn set_cancel_at_period_end(
            &self,
            subscription_id: &str,
            cancel: bool,
        ) -> Result<StripeSubscriptionData, BillingError> {
            self.check_failure("set_cancel_at_period_end")?;
            let mut subs = self.subscriptions.write().unwrap();
            let sub = subs
                .get_mut(subscription_id)
                .ok_or_else(|| Self::not_found(subscription_id, "set_cancel_at_period_end"))?;
            sub.cancel_at_period_end = cancel;
            Ok(sub.clone())
        }

        async fn schedule_interval_switch(
            &self,
            subscription_id: &str,
            new_price_id: &str,
        ) -> Result<ScheduledChange, BillingError> {
            self.check_failure("schedule_interval_switch")?;
            let subs = self.subscriptions.read().unwrap();
            let sub = subs
                .get(subscription_id)
                .ok_or_else(|| Self::not_found(subscription_id, "schedule_interval_switch"))?;
            self.schedules
                .write()
                .unwrap()
                .push((subscription_id.to_string(), new_price_id.to_string()));
            Ok(ScheduledChange {
                schedule_id: format!(
                    "sub_sched_test_{}",
                    self.schedule_counter.fetch_add(1, Ordering::SeqCst)
                ),
                effective_at: sub.current_period_end,
                price_id: new_price_id.to_string(),
            })
        }
    }
}
