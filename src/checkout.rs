//! Stripe Checkout session creation.
//!
//! Builds the hosted-checkout session for a plan purchase. The session is the
//! only artifact produced here: no local billing state changes until the
//! completed-checkout webhook lands, so an abandoned checkout leaves nothing
//! to clean up.
//!
//! The trial decision is made from the stored record's `has_used_trial` flag.
//! Client-supplied trial hints are never consulted, which closes the obvious
//! replay (clear a cookie, check out again, get a second trial).

use std::future::Future;

use url::Url;

use crate::account::{BillingInterval, PlanTier, DEFAULT_TRIAL_DAYS};
use crate::error::{BillingError, Result};
use crate::plans::PlanCatalog;
use crate::storage::AccountStore;

/// Creates Stripe Checkout sessions for plan purchases.
pub struct CheckoutManager<S: AccountStore, C: StripeCheckoutClient> {
    store: S,
    client: C,
    catalog: PlanCatalog,
    config: CheckoutConfig,
}

impl<S: AccountStore, C: StripeCheckoutClient> CheckoutManager<S, C> {
    /// Create a new checkout manager.
    ///
    /// # Errors
    ///
    /// Returns an error when the configured redirect URLs fail validation,
    /// so a bad deployment is caught at startup rather than at the first
    /// checkout.
    pub fn new(store: S, client: C, catalog: PlanCatalog, config: CheckoutConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            client,
            catalog,
            config,
        })
    }

    /// Create a checkout session for the given (tier, interval) purchase.
    pub async fn create_checkout(&self, request: CheckoutRequest) -> Result<CheckoutSession> {
        let price_id = self
            .catalog
            .price_id(request.plan_tier, request.billing_interval)
            .to_string();

        // First touch seeds the registration-time record; nothing else is
        // written before the webhook confirms payment.
        let record = self
            .store
            .get_or_create_account(&request.user_id, DEFAULT_TRIAL_DAYS)
            .await?;

        let with_trial = !record.has_used_trial && self.catalog.trial_eligible(request.plan_tier);
        let trial_period_days = with_trial.then_some(record.trial_duration_days);

        let session = self
            .client
            .create_checkout_session(CreateCheckoutSessionRequest {
                customer_id: record.customer_id.clone(),
                customer_email: record
                    .customer_id
                    .is_none()
                    .then(|| request.user_email.clone()),
                price_id,
                success_url: self.config.success_url.clone(),
                cancel_url: self.config.cancel_url.clone(),
                allow_promotion_codes: self.config.allow_promotion_codes,
                trial_period_days,
                metadata: CheckoutMetadata {
                    user_id: request.user_id.clone(),
                    plan_tier: request.plan_tier,
                    billing_interval: request.billing_interval,
                    trial: with_trial,
                },
            })
            .await?;

        tracing::info!(
            target: "tollgate::checkout",
            user_id = %request.user_id,
            session_id = %session.id,
            trial = with_trial,
            "Created checkout session"
        );

        Ok(session)
    }
}

/// Configuration for checkout sessions.
#[derive(Debug, Clone)]
pub struct CheckoutConfig {
    /// Where Stripe sends the customer after payment.
    pub success_url: String,
    /// Where Stripe sends the customer when they back out.
    pub cancel_url: String,
    /// Allow promotion codes on the hosted page.
    pub allow_promotion_codes: bool,
    /// Allowed domains for redirect URLs (empty = allow any HTTPS URL).
    /// This prevents open redirect vulnerabilities.
    pub allowed_redirect_domains: Vec<String>,
}

impl CheckoutConfig {
    #[must_use]
    pub fn new(success_url: impl Into<String>, cancel_url: impl Into<String>) -> Self {
        Self {
            success_url: success_url.into(),
            cancel_url: cancel_url.into(),
            allow_promotion_codes: true,
            allowed_redirect_domains: Vec::new(),
        }
    }

    /// Enable/disable promotion codes.
    #[must_use]
    pub fn allow_promotion_codes(mut self, allow: bool) -> Self {
        self.allow_promotion_codes = allow;
        self
    }

    /// Set allowed redirect domains.
    ///
    /// Only URLs on these domains (or their subdomains) are accepted for the
    /// success/cancel URLs. If empty, any HTTPS URL is allowed.
    #[must_use]
    pub fn allowed_redirect_domains<I, D>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<String>,
    {
        self.allowed_redirect_domains = domains.into_iter().map(Into::into).collect();
        self
    }

    /// Validate both configured redirect URLs.
    pub fn validate(&self) -> Result<()> {
        self.validate_redirect_url(&self.success_url)?;
        self.validate_redirect_url(&self.cancel_url)?;
        Ok(())
    }

    /// Validate a redirect URL: parseable, HTTPS, and on an allowed domain
    /// when the allowlist is configured.
    pub fn validate_redirect_url(&self, url: &str) -> Result<()> {
        let parsed = Url::parse(url).map_err(|e| BillingError::InvalidRedirectUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        if parsed.scheme() != "https" {
            return Err(BillingError::InvalidRedirectUrl {
                url: url.to_string(),
                reason: "redirect URLs must use HTTPS".to_string(),
            }
            .into());
        }

        if !self.allowed_redirect_domains.is_empty() {
            let host = parsed
                .host_str()
                .ok_or_else(|| BillingError::InvalidRedirectUrl {
                    url: url.to_string(),
                    reason: "redirect URL has no host".to_string(),
                })?;

            let allowed = self.allowed_redirect_domains.iter().any(|domain| {
                // Exact match or subdomain match.
                host == domain || host.ends_with(&format!(".{}", domain))
            });

            if !allowed {
                return Err(BillingError::RedirectDomainNotAllowed {
                    domain: host.to_string(),
                }
                .into());
            }
        }

        Ok(())
    }
}

/// A plan purchase request, post-authentication.
#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    pub user_id: String,
    pub user_email: String,
    pub plan_tier: PlanTier,
    pub billing_interval: BillingInterval,
}

/// Checkout session response.
#[derive(Debug, Clone)]
pub struct CheckoutSession {
    /// Stripe checkout session ID.
    pub id: String,
    /// URL to redirect the customer to.
    pub url: String,
}

/// Metadata embedded on the session, round-tripped to the completed-checkout
/// webhook for correlation. Never matched by email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutMetadata {
    pub user_id: String,
    pub plan_tier: PlanTier,
    pub billing_interval: BillingInterval,
    pub trial: bool,
}

impl CheckoutMetadata {
    /// The metadata as Stripe form-parameter pairs.
    #[must_use]
    pub fn entries(&self) -> [(&'static str, String); 4] {
        [
            ("metadata[user_id]", self.user_id.clone()),
            ("metadata[plan_tier]", self.plan_tier.as_str().to_string()),
            (
                "metadata[billing_interval]",
                self.billing_interval.as_str().to_string(),
            ),
            ("metadata[trial]", self.trial.to_string()),
        ]
    }
}

/// Request to create a Stripe checkout session.
#[derive(Debug, Clone)]
pub struct CreateCheckoutSessionRequest {
    /// Existing Stripe customer, when the account has one.
    pub customer_id: Option<String>,
    /// Email for Stripe to create the customer from, when there is none yet.
    pub customer_email: Option<String>,
    /// The single subscription price being purchased.
    pub price_id: String,
    pub success_url: String,
    pub cancel_url: String,
    pub allow_promotion_codes: bool,
    /// Trial period in days, when the account is still trial-eligible.
    pub trial_period_days: Option<u32>,
    pub metadata: CheckoutMetadata,
}

/// Trait for Stripe checkout operations.
///
/// The method returns a `Send` future so handlers over a generic client stay
/// spawnable. Implementations can still write plain `async fn`; the error is
/// the typed [`BillingError`].
pub trait StripeCheckoutClient: Send + Sync {
    /// Create a Stripe checkout session.
    fn create_checkout_session(
        &self,
        request: CreateCheckoutSessionRequest,
    ) -> impl Future<Output = Result<CheckoutSession, BillingError>> + Send;
}

/// Mock Stripe checkout client for testing.
#[cfg(any(test, feature = "test-billing"))]
pub mod test {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::{Arc, RwLock};

    /// Mock checkout client. Records every request for assertions.
    #[derive(Default, Clone)]
    pub struct MockStripeCheckoutClient {
        session_counter: Arc<AtomicU64>,
        requests: Arc<RwLock<Vec<CreateCheckoutSessionRequest>>>,
        fail_next: Arc<AtomicBool>,
    }

    impl MockStripeCheckoutClient {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// The requests this client has seen.
        pub fn requests(&self) -> Vec<CreateCheckoutSessionRequest> {
            self.requests.read().unwrap().clone()
        }

        /// Make the next call fail with a transport-style error.
        pub fn fail_next(&self) {
            self.fail_next.store(true, Ordering::SeqCst);
        }
    }

    impl StripeCheckoutClient for MockStripeCheckoutClient {
        async fn create_checkout_session(
            &self,
            request: CreateCheckoutSessionRequest,
        ) -> Result<CheckoutSession, BillingError> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(BillingError::StripeUnavailable {
                    operation: "create_checkout_session".to_string(),
                    message: "connection reset".to_string(),
                });
            }
            self.requests.write().unwrap().push(request);
            let id = format!(
                "cs_test_{}",
                self.session_counter.fetch_add(1, Ordering::SeqCst)
            );
            Ok(CheckoutSession {
                id: id.clone(),
                url: format!("https://checkout.stripe.com/c/pay/{}", id),
            })
        }
    }
}
