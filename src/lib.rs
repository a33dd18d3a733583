//! Tollgate - subscription lifecycle and entitlement engine
//!
//! Tollgate owns the billing state of a SaaS product: who is trialing, who
//! has paid, who cancelled, and what each account is entitled to right now.
//! Stripe is the source of truth for money; tollgate keeps a local account
//! record in sync with it through signed webhooks and versioned writes.
//!
//! # Features
//!
//! - **Trials**: one free trial per account, claimed explicitly, never reset
//! - **Checkout**: hosted Stripe Checkout sessions for a four-price plan grid
//! - **Webhooks**: signature-verified, idempotent lifecycle event processing
//! - **Subscription actions**: cancel, reactivate, and interval switching
//!   scheduled at the period boundary
//! - **Entitlements**: a pure evaluator over the account record, with an
//!   optional read-through cache
//! - **Retention**: downgrade timestamps drive a fixed data-deletion deadline
//! - **HTTP**: an embeddable Axum router over all of the above
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tollgate::{
//!     billing_router, BillingContext, CheckoutManager, ConfigBuilder,
//!     LiveStripeClient, LiveStripeConfig, SubscriptionManager, WebhookProcessor,
//! };
//!
//! #[tokio::main]
//! async fn main() -> tollgate::Result<()> {
//!     tollgate::init_tracing();
//!
//!     let config = ConfigBuilder::new().from_env().build()?;
//!     let catalog = config.catalog()?;
//!     let stripe = LiveStripeClient::new(
//!         config.stripe.secret_key.clone(),
//!         LiveStripeConfig::new().api_base(&config.stripe.api_base),
//!     )?;
//!
//!     let store = /* your AccountStore implementation */;
//!     let context = BillingContext::new(
//!         CheckoutManager::new(store.clone(), stripe.clone(), catalog.clone(), config.checkout_config())?,
//!         SubscriptionManager::new(store.clone(), stripe.clone(), catalog.clone()),
//!         WebhookProcessor::new(store, config.stripe.webhook_secret.clone(), catalog),
//!         Arc::new(my_identity_provider),
//!     );
//!
//!     let app = billing_router(context);
//!     let listener = tokio::net::TcpListener::bind(config.server.addr()?).await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```

pub mod account;
pub mod checkout;
pub mod config;
pub mod entitlements;
pub mod error;
pub mod http;
pub mod live_client;
pub mod plans;
pub mod retention;
#[cfg(feature = "seaorm-store")]
pub mod seaorm_store;
pub mod storage;
pub mod subscription;
pub mod trial;
pub mod webhook;

// Account exports
pub use account::{AccountRecord, BillingInterval, Plan, PlanTier, DEFAULT_TRIAL_DAYS};

// Checkout exports
pub use checkout::{
    CheckoutConfig, CheckoutManager, CheckoutRequest, CheckoutSession, StripeCheckoutClient,
};

// Config exports
pub use config::{
    CheckoutUrls, ConfigBuilder, LoggingConfig, ServerConfig, StripeConfig, TollgateConfig,
};

// Entitlement exports
pub use entitlements::{
    is_premium, is_trial_active, requires_upgrade, trial_days_remaining,
    CachedEntitlementsManager, Entitlements, EntitlementsManager, PremiumAccess,
};

// Error exports
pub use error::{BillingError, Result, TollgateError};

// HTTP exports
pub use http::{
    billing_router, ApiResponse, BillingContext, CurrentUser, Identity, IdentityProvider,
};

// Stripe client exports
pub use live_client::{InvalidApiKeyError, LiveStripeClient, LiveStripeConfig};

// Plan catalog exports
pub use plans::PlanCatalog;

// Storage exports
pub use storage::{AccountStore, CancellationFeedback};
#[cfg(feature = "seaorm-store")]
pub use seaorm_store::SeaOrmAccountStore;

// Subscription exports
pub use subscription::{
    LiveSubscription, ScheduledChange, ScheduledSwitch, StripeSubscriptionClient,
    StripeSubscriptionData, SubscriptionDetail, SubscriptionManager, SyncChange, SyncOutcome,
};

// Trial exports
pub use trial::TrialManager;

// Webhook exports
pub use webhook::{EventKind, WebhookEnvelope, WebhookOutcome, WebhookProcessor};

// Test helpers, available to downstream integration tests via `test-billing`.
#[cfg(any(test, feature = "test-billing"))]
pub use checkout::test::MockStripeCheckoutClient;
#[cfg(any(test, feature = "test-billing"))]
pub use http::auth::test::StaticTokenIdentity;
#[cfg(any(test, feature = "test-billing"))]
pub use storage::test::InMemoryAccountStore;
#[cfg(any(test, feature = "test-billing"))]
pub use subscription::test::MockStripeSubscriptionClient;
#[cfg(any(test, feature = "test-billing"))]
pub use webhook::sign_payload;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing/logging with sensible defaults.
///
/// Call early, typically in `main()` before building the router.
///
/// # Environment Variables
///
/// - `RUST_LOG`: log filter (e.g. "info", "debug", "tollgate=debug")
/// - `TOLLGATE_LOG_JSON`: set to "true" for JSON formatted logs
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_logs = std::env::var("TOLLGATE_LOG_JSON")
        .map(|v| v.parse::<bool>().unwrap_or(false))
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Initialize tracing from the logging section of a built configuration.
pub fn init_tracing_with_config(config: &TollgateConfig) {
    let env_filter = EnvFilter::new(&config.logging.level);

    if config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
