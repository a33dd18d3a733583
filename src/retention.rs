//! Data-retention deadline policy.
//!
//! This crate only computes and maintains the deadline fields; the actual purge
//! is an external batch job that consumes them. Keeping the policy pure means
//! the job can never delete a currently paying or trialing account as long as
//! upgrades clear the schedule (which the webhook processor guarantees).

use chrono::{DateTime, Duration, Utc};

use crate::account::AccountRecord;

/// Days a downgraded account's data is retained before it becomes purgeable.
pub const RETENTION_DAYS: i64 = 365;

/// Retention deadline for a downgrade at `downgraded_at`.
#[must_use]
pub fn deletion_deadline(downgraded_at: DateTime<Utc>) -> DateTime<Utc> {
    downgraded_at + Duration::days(RETENTION_DAYS)
}

/// Whether the external purge job may delete this account's data.
#[must_use]
pub fn is_due_for_deletion(record: &AccountRecord, now: DateTime<Utc>) -> bool {
    match record.deletion_scheduled_date {
        Some(deadline) => now >= deadline,
        None => false,
    }
}

/// Whether the warning email should go out, `lead_days` before the deadline.
///
/// Returns false once the warning has been sent.
#[must_use]
pub fn is_due_for_warning(record: &AccountRecord, now: DateTime<Utc>, lead_days: i64) -> bool {
    if record.deletion_warning_sent {
        return false;
    }
    match record.deletion_scheduled_date {
        Some(deadline) => now >= deadline - Duration::days(lead_days),
        None => false,
    }
}
