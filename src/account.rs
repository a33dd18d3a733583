//! Per-user entitlement records.
//!
//! One [`AccountRecord`] per user, owned exclusively by this crate. UI and
//! feature code read it (through the entitlement evaluator) but never mutate it
//! directly; all writes go through the trial, checkout, webhook and
//! subscription-action paths.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BillingError;
use crate::retention;

/// Default trial length for newly registered accounts, in days.
pub const DEFAULT_TRIAL_DAYS: u32 = 7;

/// Locally persisted plan state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Plan {
    /// No paid access (may still be inside a trial window).
    Free,
    /// Paid access confirmed by Stripe.
    Premium,
}

impl Plan {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Premium => "premium",
        }
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Purchasable tier. Both map to [`Plan::Premium`] locally; the tier selects
/// the Stripe price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    Personal,
    Enterprise,
}

impl PlanTier {
    /// Parse from the wire value used by checkout requests and metadata.
    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "personal" => Some(Self::Personal),
            "enterprise" => Some(Self::Enterprise),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Personal => "personal",
            Self::Enterprise => "enterprise",
        }
    }
}

impl std::fmt::Display for PlanTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Billing interval of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    Monthly,
    Annual,
}

impl BillingInterval {
    /// Parse from the wire value used by requests and metadata.
    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "monthly" => Some(Self::Monthly),
            "annual" => Some(Self::Annual),
            _ => None,
        }
    }

    /// Parse from a Stripe price `recurring.interval` value.
    #[must_use]
    pub fn from_stripe(interval: &str) -> Option<Self> {
        match interval {
            "month" => Some(Self::Monthly),
            "year" => Some(Self::Annual),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Monthly => "monthly",
            Self::Annual => "annual",
        }
    }
}

impl std::fmt::Display for BillingInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Durable subscription and entitlement state for one user.
///
/// Synced from Stripe via webhooks; user-initiated actions write it
/// optimistically and the corresponding webhook later confirms the same fact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccountRecord {
    /// Identity-provider user id. Stable, opaque.
    pub user_id: String,
    /// Current plan.
    pub plan: Plan,
    /// Grandfathered accounts that never require an upgrade.
    pub is_lifetime_free: bool,
    /// Per-account trial length override (founder accounts etc).
    pub trial_duration_days: u32,
    /// Trial window start. Present iff `trial_end_date` is present.
    pub trial_start_date: Option<DateTime<Utc>>,
    /// Trial window end, always `trial_start_date + trial_duration_days`.
    pub trial_end_date: Option<DateTime<Utc>>,
    /// Monotonic: set once a trial is ever claimed (locally or via checkout),
    /// never reset.
    pub has_used_trial: bool,
    /// Stripe subscription id. Present iff a checkout ever completed and Stripe
    /// has not reported the subscription deleted.
    pub subscription_id: Option<String>,
    /// Stripe customer id. Survives subscription deletion.
    pub customer_id: Option<String>,
    /// Interval the subscription is currently billed at.
    pub billing_interval: Option<BillingInterval>,
    /// Requested interval switch, effective at period end. Cleared when the
    /// rotation webhook confirms the new price.
    pub pending_interval: Option<BillingInterval>,
    /// Set on first successful checkout completion.
    pub subscription_start_date: Option<DateTime<Utc>>,
    /// True while a cancellation is pending but access has not lapsed.
    pub cancel_at_period_end: bool,
    /// Set when the plan drops premium -> free on loss of subscription.
    pub last_downgrade_date: Option<DateTime<Utc>>,
    /// Retention deadline, always `last_downgrade_date + 365 days` when set.
    pub deletion_scheduled_date: Option<DateTime<Utc>>,
    /// Whether the retention warning email went out.
    pub deletion_warning_sent: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Optimistic-concurrency token, bumped by the store on every save.
    pub version: u64,
}

impl AccountRecord {
    /// Registration-time record: free plan, no trial claimed, no subscription.
    #[must_use]
    pub fn new(user_id: impl Into<String>, trial_duration_days: u32) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.into(),
            plan: Plan::Free,
            is_lifetime_free: false,
            trial_duration_days,
            trial_start_date: None,
            trial_end_date: None,
            has_used_trial: false,
            subscription_id: None,
            customer_id: None,
            billing_interval: None,
            pending_interval: None,
            subscription_start_date: None,
            cancel_at_period_end: false,
            last_downgrade_date: None,
            deletion_scheduled_date: None,
            deletion_warning_sent: false,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// Trial end for a window opening at `start`.
    #[must_use]
    pub fn trial_end_for(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        start + Duration::days(i64::from(self.trial_duration_days))
    }

    #[must_use]
    pub fn has_subscription(&self) -> bool {
        self.subscription_id.is_some()
    }

    /// True once a subscription-deleted event has downgraded this account and
    /// no upgrade has happened since.
    #[must_use]
    pub fn is_downgraded(&self) -> bool {
        self.plan == Plan::Free
            && self.subscription_id.is_none()
            && self.last_downgrade_date.is_some()
    }

    /// Record a premium -> free downgrade and schedule the retention deadline.
    pub fn mark_downgraded(&mut self, at: DateTime<Utc>) {
        self.plan = Plan::Free;
        self.subscription_id = None;
        self.cancel_at_period_end = false;
        self.pending_interval = None;
        self.last_downgrade_date = Some(at);
        self.deletion_scheduled_date = Some(retention::deletion_deadline(at));
        self.deletion_warning_sent = false;
    }

    /// Clear downgrade bookkeeping on any return to premium.
    pub fn clear_deletion_schedule(&mut self) {
        self.last_downgrade_date = None;
        self.deletion_scheduled_date = None;
        self.deletion_warning_sent = false;
    }

    /// Reject writes that would leave the record self-contradictory.
    ///
    /// Called by stores before commit; a violation means a handler bug, not
    /// bad user input.
    pub fn validate(&self) -> Result<(), BillingError> {
        let violation = |reason: &str| {
            Err(BillingError::InvalidRecord {
                reason: reason.to_string(),
            })
        };

        match (self.trial_start_date, self.trial_end_date) {
            (Some(start), Some(end)) => {
                if end != self.trial_end_for(start) {
                    return violation("trial_end_date does not match trial_start_date + duration");
                }
                if !self.has_used_trial {
                    return violation("trial dates set but has_used_trial is false");
                }
            }
            (None, None) => {}
            _ => return violation("trial_start_date and trial_end_date must be set together"),
        }

        if self.cancel_at_period_end && self.subscription_id.is_none() {
            return violation("cancel_at_period_end set without a subscription_id");
        }
        if self.pending_interval.is_some() && self.subscription_id.is_none() {
            return violation("pending_interval set without a subscription_id");
        }

        match (self.last_downgrade_date, self.deletion_scheduled_date) {
            (Some(downgraded), Some(scheduled)) => {
                if scheduled != retention::deletion_deadline(downgraded) {
                    return violation("deletion_scheduled_date is not downgrade + retention window");
                }
                if self.plan == Plan::Premium {
                    return violation("premium account with a deletion schedule");
                }
            }
            (None, None) => {
                if self.deletion_warning_sent {
                    return violation("deletion_warning_sent without a scheduled deletion");
                }
            }
            _ => {
                return violation(
                    "last_downgrade_date and deletion_scheduled_date must be set together",
                )
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn new_record_is_free_with_nothing_claimed() {
        let record = AccountRecord::new("user_1", DEFAULT_TRIAL_DAYS);
        assert_eq!(record.plan, Plan::Free);
        assert!(!record.has_used_trial);
        assert!(record.trial_start_date.is_none());
        assert!(record.subscription_id.is_none());
        assert_eq!(record.version, 0);
        assert!(record.validate().is_ok());
    }

    #[test]
    fn trial_end_uses_per_account_duration() {
        let mut record = AccountRecord::new("user_1", 14);
        let start = ts("2025-01-01T00:00:00Z");
        assert_eq!(record.trial_end_for(start), ts("2025-01-15T00:00:00Z"));

        record.trial_duration_days = 7;
        assert_eq!(record.trial_end_for(start), ts("2025-01-08T00:00:00Z"));
    }

    #[test]
    fn validate_rejects_half_set_trial_window() {
        let mut record = AccountRecord::new("user_1", 7);
        record.trial_start_date = Some(ts("2025-01-01T00:00:00Z"));
        assert!(record.validate().is_err());
    }

    #[test]
    fn validate_rejects_mismatched_trial_end() {
        let mut record = AccountRecord::new("user_1", 7);
        record.has_used_trial = true;
        record.trial_start_date = Some(ts("2025-01-01T00:00:00Z"));
        record.trial_end_date = Some(ts("2025-01-09T00:00:00Z"));
        assert!(record.validate().is_err());

        record.trial_end_date = Some(ts("2025-01-08T00:00:00Z"));
        assert!(record.validate().is_ok());
    }

    #[test]
    fn validate_rejects_cancel_flag_without_subscription() {
        let mut record = AccountRecord::new("user_1", 7);
        record.cancel_at_period_end = true;
        assert!(record.validate().is_err());

        record.subscription_id = Some("sub_123".to_string());
        assert!(record.validate().is_ok());
    }

    #[test]
    fn validate_rejects_deletion_schedule_drift() {
        let mut record = AccountRecord::new("user_1", 7);
        record.last_downgrade_date = Some(ts("2025-01-01T00:00:00Z"));
        record.deletion_scheduled_date = Some(ts("2025-06-01T00:00:00Z"));
        assert!(record.validate().is_err());

        record.deletion_scheduled_date =
            Some(retention::deletion_deadline(ts("2025-01-01T00:00:00Z")));
        assert!(record.validate().is_ok());
    }

    #[test]
    fn mark_downgraded_sets_schedule_and_clears_subscription() {
        let mut record = AccountRecord::new("user_1", 7);
        record.plan = Plan::Premium;
        record.subscription_id = Some("sub_123".to_string());
        record.customer_id = Some("cus_123".to_string());
        record.cancel_at_period_end = true;

        let at = ts("2025-03-01T12:00:00Z");
        record.mark_downgraded(at);

        assert_eq!(record.plan, Plan::Free);
        assert!(record.subscription_id.is_none());
        assert!(!record.cancel_at_period_end);
        assert_eq!(record.last_downgrade_date, Some(at));
        assert_eq!(
            record.deletion_scheduled_date,
            Some(ts("2026-03-01T12:00:00Z"))
        );
        // The customer persists in Stripe.
        assert_eq!(record.customer_id.as_deref(), Some("cus_123"));
        assert!(record.validate().is_ok());
    }

    #[test]
    fn tier_and_interval_wire_parsing() {
        assert_eq!(PlanTier::from_str("personal"), Some(PlanTier::Personal));
        assert_eq!(PlanTier::from_str("enterprise"), Some(PlanTier::Enterprise));
        assert_eq!(PlanTier::from_str("teams"), None);

        assert_eq!(
            BillingInterval::from_str("monthly"),
            Some(BillingInterval::Monthly)
        );
        assert_eq!(
            BillingInterval::from_str("annual"),
            Some(BillingInterval::Annual)
        );
        assert_eq!(BillingInterval::from_str("weekly"), None);

        assert_eq!(
            BillingInterval::from_stripe("month"),
            Some(BillingInterval::Monthly)
        );
        assert_eq!(
            BillingInterval::from_stripe("year"),
            Some(BillingInterval::Annual)
        );
        assert_eq!(BillingInterval::from_stripe("day"), None);
    }
}
