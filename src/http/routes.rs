//! Billing and subscription routes.
//!
//! Seven endpoints over the manager layer: the Stripe webhook receiver, hosted
//! checkout creation, and the authenticated subscription actions. Everything
//! except the webhook requires a bearer identity; the webhook authenticates
//! itself with its signature instead.
//!
//! Responses use the [`ApiResponse`] envelope. Domain errors surface through
//! [`TollgateError`]'s `IntoResponse` with a generic body and a correlation id.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::account::{BillingInterval, PlanTier};
use crate::checkout::{CheckoutManager, CheckoutRequest, StripeCheckoutClient};
use crate::error::{Result, TollgateError};
use crate::http::auth::IdentityProvider;
use crate::http::{ApiResponse, CurrentUser};
use crate::storage::AccountStore;
use crate::subscription::{
    ScheduledSwitch, StripeSubscriptionClient, SubscriptionDetail, SubscriptionManager,
};
use crate::webhook::{WebhookOutcome, WebhookProcessor};

/// Shared state behind the billing routes.
///
/// Holds the three managers plus the identity provider used by the
/// [`CurrentUser`] extractor. Cloning is cheap; all fields are `Arc`s.
pub struct BillingContext<S, CC, SC>
where
    S: AccountStore,
    CC: StripeCheckoutClient,
    SC: StripeSubscriptionClient,
{
    checkout: Arc<CheckoutManager<S, CC>>,
    subscriptions: Arc<SubscriptionManager<S, SC>>,
    webhooks: Arc<WebhookProcessor<S>>,
    identity: Arc<dyn IdentityProvider>,
}

impl<S, CC, SC> BillingContext<S, CC, SC>
where
    S: AccountStore,
    CC: StripeCheckoutClient,
    SC: StripeSubscriptionClient,
{
    pub fn new(
        checkout: CheckoutManager<S, CC>,
        subscriptions: SubscriptionManager<S, SC>,
        webhooks: WebhookProcessor<S>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        Self {
            checkout: Arc::new(checkout),
            subscriptions: Arc::new(subscriptions),
            webhooks: Arc::new(webhooks),
            identity,
        }
    }
}

// Derived `Clone` would demand `Clone` on the type parameters; the fields are
// all `Arc`s, so clone those directly.
impl<S, CC, SC> Clone for BillingContext<S, CC, SC>
where
    S: AccountStore,
    CC: StripeCheckoutClient,
    SC: StripeSubscriptionClient,
{
    fn clone(&self) -> Self {
        Self {
            checkout: Arc::clone(&self.checkout),
            subscriptions: Arc::clone(&self.subscriptions),
            webhooks: Arc::clone(&self.webhooks),
            identity: Arc::clone(&self.identity),
        }
    }
}

/// Build the billing router.
///
/// The identity provider is injected as a request extension so the
/// [`CurrentUser`] extractor can reach it without knowing the state type.
pub fn billing_router<S, CC, SC>(context: BillingContext<S, CC, SC>) -> Router
where
    S: AccountStore + 'static,
    CC: StripeCheckoutClient + 'static,
    SC: StripeSubscriptionClient + 'static,
{
    let identity = Arc::clone(&context.identity);
    Router::new()
        .route("/billing/webhook", post(handle_webhook::<S, CC, SC>))
        .route("/billing/checkout", post(create_checkout::<S, CC, SC>))
        .route("/subscription", get(subscription_detail::<S, CC, SC>))
        .route(
            "/subscription/cancel",
            post(cancel_subscription::<S, CC, SC>),
        )
        .route(
            "/subscription/reactivate",
            post(reactivate_subscription::<S, CC, SC>),
        )
        .route("/subscription/switch-plan", post(switch_plan::<S, CC, SC>))
        .route(
            "/subscription/feedback",
            post(submit_feedback::<S, CC, SC>),
        )
        .layer(Extension(identity))
        .layer(TraceLayer::new_for_http())
        .with_state(context)
}

/// Stripe webhook receiver.
///
/// Takes the raw body; the signature covers the exact bytes Stripe sent, so
/// the payload must not pass through a JSON extractor first.
async fn handle_webhook<S, CC, SC>(
    State(context): State<BillingContext<S, CC, SC>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<ApiResponse<()>>
where
    S: AccountStore + 'static,
    CC: StripeCheckoutClient + 'static,
    SC: StripeSubscriptionClient + 'static,
{
    let signature = headers
        .get("Stripe-Signature")
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| TollgateError::bad_request("Missing Stripe-Signature header"))?;

    let outcome = context.webhooks.process(&body, signature).await?;
    let message = match outcome {
        WebhookOutcome::Processed => "Event processed".to_string(),
        WebhookOutcome::AlreadyProcessed => "Event already processed".to_string(),
        WebhookOutcome::Ignored { reason } => format!("Event ignored: {reason}"),
    };
    Ok(ApiResponse::ok_with_message(message))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckoutBody {
    plan_type: String,
    billing_interval: String,
    user_id: String,
    user_email: String,
    /// Accepted for wire compatibility. The stored record decides trial
    /// eligibility; this flag is never trusted.
    #[serde(default)]
    has_used_trial: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CheckoutResponse {
    checkout_url: String,
}

async fn create_checkout<S, CC, SC>(
    State(context): State<BillingContext<S, CC, SC>>,
    CurrentUser(identity): CurrentUser,
    Json(body): Json<CheckoutBody>,
) -> Result<ApiResponse<CheckoutResponse>>
where
    S: AccountStore + 'static,
    CC: StripeCheckoutClient + 'static,
    SC: StripeSubscriptionClient + 'static,
{
    if body.user_id != identity.user_id {
        return Err(TollgateError::forbidden(
            "Checkout user does not match the authenticated user",
        ));
    }
    if body.has_used_trial.is_some() {
        tracing::debug!(
            target: "tollgate::http",
            user_id = %identity.user_id,
            "ignoring client-supplied trial flag"
        );
    }

    let plan_tier = PlanTier::from_str(&body.plan_type)
        .ok_or_else(|| TollgateError::bad_request(format!("Unknown plan type: {}", body.plan_type)))?;
    let billing_interval = BillingInterval::from_str(&body.billing_interval).ok_or_else(|| {
        TollgateError::bad_request(format!("Unknown billing interval: {}", body.billing_interval))
    })?;

    let session = context
        .checkout
        .create_checkout(CheckoutRequest {
            user_id: body.user_id,
            user_email: body.user_email,
            plan_tier,
            billing_interval,
        })
        .await?;

    Ok(ApiResponse::success(CheckoutResponse {
        checkout_url: session.url,
    }))
}

async fn subscription_detail<S, CC, SC>(
    State(context): State<BillingContext<S, CC, SC>>,
    CurrentUser(identity): CurrentUser,
) -> Result<ApiResponse<SubscriptionDetail>>
where
    S: AccountStore + 'static,
    CC: StripeCheckoutClient + 'static,
    SC: StripeSubscriptionClient + 'static,
{
    let detail = context
        .subscriptions
        .subscription_detail(&identity.user_id)
        .await?;
    Ok(ApiResponse::success(detail))
}

async fn cancel_subscription<S, CC, SC>(
    State(context): State<BillingContext<S, CC, SC>>,
    CurrentUser(identity): CurrentUser,
) -> Result<ApiResponse<()>>
where
    S: AccountStore + 'static,
    CC: StripeCheckoutClient + 'static,
    SC: StripeSubscriptionClient + 'static,
{
    context.subscriptions.cancel(&identity.user_id).await?;
    Ok(ApiResponse::ok())
}

async fn reactivate_subscription<S, CC, SC>(
    State(context): State<BillingContext<S, CC, SC>>,
    CurrentUser(identity): CurrentUser,
) -> Result<ApiResponse<()>>
where
    S: AccountStore + 'static,
    CC: StripeCheckoutClient + 'static,
    SC: StripeSubscriptionClient + 'static,
{
    context.subscriptions.reactivate(&identity.user_id).await?;
    Ok(ApiResponse::ok())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SwitchPlanBody {
    new_interval: String,
}

async fn switch_plan<S, CC, SC>(
    State(context): State<BillingContext<S, CC, SC>>,
    CurrentUser(identity): CurrentUser,
    Json(body): Json<SwitchPlanBody>,
) -> Result<ApiResponse<ScheduledSwitch>>
where
    S: AccountStore + 'static,
    CC: StripeCheckoutClient + 'static,
    SC: StripeSubscriptionClient + 'static,
{
    let new_interval = BillingInterval::from_str(&body.new_interval).ok_or_else(|| {
        TollgateError::bad_request(format!("Unknown billing interval: {}", body.new_interval))
    })?;

    let switch = context
        .subscriptions
        .switch_interval(&identity.user_id, new_interval)
        .await?;
    Ok(ApiResponse::success(switch))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeedbackBody {
    reason: String,
    #[serde(default)]
    additional_feedback: Option<String>,
}

/// Records cancellation feedback. Always acknowledges; feedback must never
/// block or fail a cancellation flow.
async fn submit_feedback<S, CC, SC>(
    State(context): State<BillingContext<S, CC, SC>>,
    CurrentUser(identity): CurrentUser,
    Json(body): Json<FeedbackBody>,
) -> Result<ApiResponse<()>>
where
    S: AccountStore + 'static,
    CC: StripeCheckoutClient + 'static,
    SC: StripeSubscriptionClient + 'static,
{
    context
        .subscriptions
        .submit_feedback(&identity.user_id, &body.reason, body.additional_feedback)
        .await?;
    Ok(ApiResponse::ok())
}
