//! Trial claim flow.
//!
//! One free trial per account, ever. The claim is a pure local state change;
//! Stripe is never involved, so an expired trial cannot be laundered into a
//! fresh one through checkout metadata or webhook replays.

use chrono::Utc;

use crate::account::AccountRecord;
use crate::error::{BillingError, Result, TollgateError};
use crate::storage::AccountStore;

/// Claims the one free trial for an account.
pub struct TrialManager<S: AccountStore> {
    store: S,
}

impl<S: AccountStore> TrialManager<S> {
    #[must_use]
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Claim the trial: set the window and burn `has_used_trial`.
    ///
    /// # Errors
    ///
    /// Returns [`BillingError::AccountNotFound`] when the user has no record
    /// and [`BillingError::TrialAlreadyClaimed`] when the trial was ever used,
    /// including a claim that lost the race to a concurrent request.
    pub async fn claim_trial(&self, user_id: &str) -> Result<AccountRecord> {
        let record = self
            .store
            .get_account(user_id)
            .await?
            .ok_or_else(|| BillingError::AccountNotFound {
                user_id: user_id.to_string(),
            })?;

        if record.has_used_trial {
            return Err(BillingError::TrialAlreadyClaimed {
                user_id: user_id.to_string(),
            }
            .into());
        }

        let claimed = self.store.try_claim_trial(user_id, Utc::now()).await?;
        if !claimed {
            // Lost the check-and-set race to a concurrent claim.
            return Err(BillingError::TrialAlreadyClaimed {
                user_id: user_id.to_string(),
            }
            .into());
        }

        self.store
            .get_account(user_id)
            .await?
            .ok_or_else(|| TollgateError::internal("Account disappeared after trial claim"))
    }
}
