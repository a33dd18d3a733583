//! Plan catalog: the purchasable (tier, interval) grid and its Stripe prices.
//!
//! The product sells one paid plan in two tiers and two billing intervals, so
//! the catalog is a fixed four-price grid rather than an open plan list. The
//! reverse lookup ([`PlanCatalog::tier_for_price`]) is what lets webhook
//! payloads and live subscription objects be mapped back to a tier without
//! trusting any client-supplied field.
//!
//! ```rust,ignore
//! use tollgate::plans::PlanCatalog;
//!
//! let catalog = PlanCatalog::builder()
//!     .personal_monthly("price_personal_m")
//!     .personal_annual("price_personal_y")
//!     .enterprise_monthly("price_ent_m")
//!     .enterprise_annual("price_ent_y")
//!     .build()?;
//! ```

use crate::account::{BillingInterval, PlanTier};
use crate::config::StripeConfig;
use crate::error::{Result, TollgateError};

/// The four Stripe prices behind the purchasable plans, plus trial policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanCatalog {
    personal_monthly: String,
    personal_annual: String,
    enterprise_monthly: String,
    enterprise_annual: String,
    enterprise_trial_eligible: bool,
}

impl PlanCatalog {
    /// Create a builder for constructing the catalog.
    #[must_use]
    pub fn builder() -> PlanCatalogBuilder {
        PlanCatalogBuilder::default()
    }

    /// Build the catalog from the Stripe config section.
    pub fn from_config(stripe: &StripeConfig) -> Result<Self> {
        Self::builder()
            .personal_monthly(&stripe.price_personal_monthly)
            .personal_annual(&stripe.price_personal_annual)
            .enterprise_monthly(&stripe.price_enterprise_monthly)
            .enterprise_annual(&stripe.price_enterprise_annual)
            .enterprise_trial(stripe.enterprise_trial_eligible)
            .build()
    }

    /// The Stripe price id for a (tier, interval) pair.
    #[must_use]
    pub fn price_id(&self, tier: PlanTier, interval: BillingInterval) -> &str {
        match (tier, interval) {
            (PlanTier::Personal, BillingInterval::Monthly) => &self.personal_monthly,
            (PlanTier::Personal, BillingInterval::Annual) => &self.personal_annual,
            (PlanTier::Enterprise, BillingInterval::Monthly) => &self.enterprise_monthly,
            (PlanTier::Enterprise, BillingInterval::Annual) => &self.enterprise_annual,
        }
    }

    /// Reverse lookup: which (tier, interval) a Stripe price id sells.
    #[must_use]
    pub fn tier_for_price(&self, price_id: &str) -> Option<(PlanTier, BillingInterval)> {
        self.entries()
            .into_iter()
            .find(|(_, _, id)| *id == price_id)
            .map(|(tier, interval, _)| (tier, interval))
    }

    /// Whether checkout for this tier may carry a trial period.
    #[must_use]
    pub fn trial_eligible(&self, tier: PlanTier) -> bool {
        match tier {
            PlanTier::Personal => true,
            PlanTier::Enterprise => self.enterprise_trial_eligible,
        }
    }

    /// All four price ids, for config validation and diagnostics.
    #[must_use]
    pub fn all_price_ids(&self) -> [&str; 4] {
        [
            &self.personal_monthly,
            &self.personal_annual,
            &self.enterprise_monthly,
            &self.enterprise_annual,
        ]
    }

    fn entries(&self) -> [(PlanTier, BillingInterval, &str); 4] {
        [
            (
                PlanTier::Personal,
                BillingInterval::Monthly,
                self.personal_monthly.as_str(),
            ),
            (
                PlanTier::Personal,
                BillingInterval::Annual,
                self.personal_annual.as_str(),
            ),
            (
                PlanTier::Enterprise,
                BillingInterval::Monthly,
                self.enterprise_monthly.as_str(),
            ),
            (
                PlanTier::Enterprise,
                BillingInterval::Annual,
                self.enterprise_annual.as_str(),
            ),
        ]
    }
}

/// Builder for the plan catalog.
#[must_use = "builder does nothing until you call build()"]
#[derive(Debug, Default)]
pub struct PlanCatalogBuilder {
    personal_monthly: Option<String>,
    personal_annual: Option<String>,
    enterprise_monthly: Option<String>,
    enterprise_annual: Option<String>,
    enterprise_trial_eligible: Option<bool>,
}

impl PlanCatalogBuilder {
    pub fn personal_monthly(mut self, price_id: impl Into<String>) -> Self {
        self.personal_monthly = Some(price_id.into());
        self
    }

    pub fn personal_annual(mut self, price_id: impl Into<String>) -> Self {
        self.personal_annual = Some(price_id.into());
        self
    }

    pub fn enterprise_monthly(mut self, price_id: impl Into<String>) -> Self {
        self.enterprise_monthly = Some(price_id.into());
        self
    }

    pub fn enterprise_annual(mut self, price_id: impl Into<String>) -> Self {
        self.enterprise_annual = Some(price_id.into());
        self
    }

    /// Allow or deny trials on enterprise checkouts (default: allowed).
    pub fn enterprise_trial(mut self, eligible: bool) -> Self {
        self.enterprise_trial_eligible = Some(eligible);
        self
    }

    /// Build the catalog, validating all four prices.
    ///
    /// # Errors
    ///
    /// Returns an error if any price id is missing or empty, or if two grid
    /// slots share the same price id (a misconfiguration that would make the
    /// reverse lookup ambiguous).
    pub fn build(self) -> Result<PlanCatalog> {
        let require = |slot: &str, value: Option<String>| {
            match value {
                Some(id) if !id.trim().is_empty() => Ok(id),
                _ => Err(TollgateError::bad_request(format!(
                    "Plan catalog is missing a price id for {}",
                    slot
                ))),
            }
        };

        let catalog = PlanCatalog {
            personal_monthly: require("personal/monthly", self.personal_monthly)?,
            personal_annual: require("personal/annual", self.personal_annual)?,
            enterprise_monthly: require("enterprise/monthly", self.enterprise_monthly)?,
            enterprise_annual: require("enterprise/annual", self.enterprise_annual)?,
            enterprise_trial_eligible: self.enterprise_trial_eligible.unwrap_or(true),
        };

        let ids = catalog.all_price_ids();
        for (i, id) in ids.iter().enumerate() {
            if ids[i + 1..].contains(id) {
                return Err(TollgateError::bad_request(format!(
                    "Plan catalog price id '{}' is assigned to more than one plan",
                    id
                )));
            }
        }

        Ok(catalog)
    }
}
