//! Stripe webhook processing.
//!
//! The webhook is the authoritative channel for billing state: checkout
//! completion, subscription rotation, and end-of-period cancellation all
//! land here. Requests are verified (HMAC over the raw body), deduplicated
//! by event id, decoded into a closed set of event kinds, and applied
//! through bounded compare-and-save retries so a user action racing a
//! webhook can never produce a lost update.
//!
//! Unknown event kinds and events for unmapped accounts are acknowledged
//! and ignored rather than rejected; returning an error would only make
//! Stripe redeliver something we will never handle. Delivery order is not
//! guaranteed either: events that predate the account's downgrade or name a
//! subscription the account no longer tracks are recognized as leftovers
//! from a previous subscription lifetime and ignored the same way.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::account::{AccountRecord, BillingInterval, Plan, DEFAULT_TRIAL_DAYS};
use crate::error::{BillingError, Result, TollgateError};
use crate::plans::PlanCatalog;
use crate::storage::AccountStore;
use crate::subscription::datetime_from_unix;

/// Reject signatures older (or newer) than this many seconds.
const SIGNATURE_TOLERANCE_SECONDS: i64 = 300;

/// Attempts before giving up on a version-conflicted save.
const MAX_SAVE_ATTEMPTS: usize = 3;

/// Verifies, deduplicates, and applies Stripe webhook events.
///
/// The webhook secret is stored using [`SecretString`] to prevent accidental
/// exposure in logs or debug output.
pub struct WebhookProcessor<S: AccountStore> {
    store: S,
    webhook_secret: SecretString,
    catalog: PlanCatalog,
}

impl<S: AccountStore> WebhookProcessor<S> {
    /// Create a new webhook processor.
    #[must_use]
    pub fn new(store: S, webhook_secret: impl Into<SecretString>, catalog: PlanCatalog) -> Self {
        Self {
            store,
            webhook_secret: webhook_secret.into(),
            catalog,
        }
    }

    /// Verify the signature and process the event.
    pub async fn process(&self, payload: &[u8], signature: &str) -> Result<WebhookOutcome> {
        let envelope = self.verify_signature(payload, signature)?;
        self.handle_event(envelope).await
    }

    /// [`process`](Self::process) with an explicit clock, for tests.
    pub async fn process_at(
        &self,
        payload: &[u8],
        signature: &str,
        now: i64,
    ) -> Result<WebhookOutcome> {
        let envelope = self.verify_signature_at(payload, signature, now)?;
        self.handle_event(envelope).await
    }

    /// Verify the webhook signature and parse the envelope.
    ///
    /// # Arguments
    /// * `payload` - The raw request body
    /// * `signature` - The `Stripe-Signature` header value
    ///
    /// # Errors
    /// Returns an error if signature verification fails or the payload is
    /// not valid JSON. Nothing is parsed before the signature checks out.
    pub fn verify_signature(&self, payload: &[u8], signature: &str) -> Result<WebhookEnvelope> {
        self.verify_signature_at(payload, signature, Utc::now().timestamp())
    }

    /// [`verify_signature`](Self::verify_signature) with an explicit clock.
    pub fn verify_signature_at(
        &self,
        payload: &[u8],
        signature: &str,
        now: i64,
    ) -> Result<WebhookEnvelope> {
        let sig_parts = parse_signature_header(signature)?;

        let age_seconds = (now - sig_parts.timestamp).abs();
        if age_seconds > SIGNATURE_TOLERANCE_SECONDS {
            return Err(BillingError::WebhookTimestampExpired { age_seconds }.into());
        }

        // The signed payload is "{timestamp}.{raw body}".
        let signed_payload = format!(
            "{}.{}",
            sig_parts.timestamp,
            String::from_utf8_lossy(payload)
        );
        let expected_sig = compute_signature(
            self.webhook_secret.expose_secret(),
            signed_payload.as_bytes(),
        )?;

        let expected_bytes = hex::decode(&expected_sig)
            .map_err(|_| TollgateError::internal("Hex decode error"))?;
        let provided_bytes =
            hex::decode(&sig_parts.signature).map_err(|_| BillingError::InvalidWebhookSignature)?;

        if expected_bytes.ct_eq(&provided_bytes).unwrap_u8() != 1 {
            return Err(BillingError::InvalidWebhookSignature.into());
        }

        // Log the detailed error internally, return a generic message.
        let envelope: WebhookEnvelope = serde_json::from_slice(payload).map_err(|e| {
            tracing::warn!(
                target: "tollgate::webhook",
                error = %e,
                "Failed to parse webhook payload"
            );
            BillingError::InvalidWebhookPayload {
                message: "malformed JSON payload".to_string(),
            }
        })?;

        Ok(envelope)
    }

    /// Process a verified envelope: dedup, decode, dispatch, mark processed.
    pub async fn handle_event(&self, envelope: WebhookEnvelope) -> Result<WebhookOutcome> {
        if self.store.is_event_processed(&envelope.id).await? {
            tracing::debug!(
                target: "tollgate::webhook",
                event_id = %envelope.id,
                "Skipping already-processed event"
            );
            return Ok(WebhookOutcome::AlreadyProcessed);
        }

        let kind = EventKind::from_envelope(&envelope)?;
        let event_time = datetime_from_unix(envelope.created);

        let outcome = match kind {
            EventKind::CheckoutCompleted(session) => {
                self.handle_checkout_completed(event_time, &session).await?
            }
            EventKind::SubscriptionCreated(subscription) => {
                self.handle_subscription_created(event_time, &subscription)
                    .await?
            }
            EventKind::SubscriptionUpdated(subscription) => {
                self.handle_subscription_updated(event_time, &subscription)
                    .await?
            }
            EventKind::SubscriptionDeleted(subscription) => {
                self.handle_subscription_deleted(event_time, &subscription)
                    .await?
            }
            EventKind::InvoicePaymentSucceeded(invoice) => {
                tracing::info!(
                    target: "tollgate::webhook",
                    invoice_id = %invoice.id,
                    subscription_id = invoice.subscription.as_deref().unwrap_or("-"),
                    "Invoice payment succeeded"
                );
                WebhookOutcome::Processed
            }
            EventKind::InvoicePaymentFailed(invoice) => {
                // The subscription.updated event carries the state change;
                // this is the notification hook.
                tracing::warn!(
                    target: "tollgate::webhook",
                    invoice_id = %invoice.id,
                    subscription_id = invoice.subscription.as_deref().unwrap_or("-"),
                    "Invoice payment failed"
                );
                WebhookOutcome::Processed
            }
            EventKind::Unhandled { kind } => {
                tracing::debug!(
                    target: "tollgate::webhook",
                    event_id = %envelope.id,
                    kind = %kind,
                    "Ignoring unhandled event kind"
                );
                WebhookOutcome::Ignored {
                    reason: format!("unhandled event kind '{}'", kind),
                }
            }
        };

        if !matches!(outcome, WebhookOutcome::Ignored { .. }) {
            self.store.mark_event_processed(&envelope.id).await?;
        }

        Ok(outcome)
    }

    /// checkout.session.completed: the account becomes premium.
    async fn handle_checkout_completed(
        &self,
        event_time: DateTime<Utc>,
        session: &CheckoutSessionObject,
    ) -> Result<WebhookOutcome> {
        // Correlation is our own metadata, round-tripped. Never email.
        let Some(user_id) = session.metadata.user_id.clone() else {
            tracing::warn!(
                target: "tollgate::webhook",
                session_id = %session.id,
                "Checkout session has no user_id metadata"
            );
            return Ok(WebhookOutcome::Ignored {
                reason: "checkout session without user_id metadata".to_string(),
            });
        };

        let Some(subscription_id) = session.subscription.clone() else {
            // Not a subscription checkout.
            return Ok(WebhookOutcome::Ignored {
                reason: "checkout session without a subscription".to_string(),
            });
        };

        let interval = session
            .metadata
            .billing_interval
            .as_deref()
            .and_then(BillingInterval::from_str);
        let with_trial = session.metadata.trial.as_deref() == Some("true");
        let customer_id = session.customer.clone();

        let existing = self
            .store
            .get_or_create_account(&user_id, DEFAULT_TRIAL_DAYS)
            .await?;
        if let Some(reason) = stale_reason(&existing, event_time) {
            return Ok(WebhookOutcome::Ignored { reason });
        }
        if let Some(reason) = stale_checkout_reason(&existing, event_time) {
            return Ok(WebhookOutcome::Ignored { reason });
        }

        self.update_account(&user_id, "checkout_completed", |record| {
            if record.plan == Plan::Premium
                && record.subscription_id.as_deref() == Some(subscription_id.as_str())
            {
                // Redelivered with a fresh event id; keep the original
                // subscription_start_date.
                return false;
            }
            record.plan = Plan::Premium;
            record.subscription_id = Some(subscription_id.clone());
            if customer_id.is_some() {
                record.customer_id = customer_id.clone();
            }
            record.subscription_start_date = Some(event_time);
            if let Some(interval) = interval {
                record.billing_interval = Some(interval);
            }
            if with_trial {
                record.has_used_trial = true;
            }
            record.cancel_at_period_end = false;
            record.pending_interval = None;
            record.clear_deletion_schedule();
            true
        })
        .await?;

        tracing::info!(
            target: "tollgate::webhook",
            user_id = %user_id,
            subscription_id = %subscription_id,
            trial = with_trial,
            "Checkout completed, account is premium"
        );
        Ok(WebhookOutcome::Processed)
    }

    /// customer.subscription.created: store the Stripe ids.
    ///
    /// Plan changes are left to the checkout and updated events; creation
    /// can arrive before payment is confirmed.
    async fn handle_subscription_created(
        &self,
        event_time: DateTime<Utc>,
        subscription: &SubscriptionObject,
    ) -> Result<WebhookOutcome> {
        let Some(record) = self.resolve_account(subscription).await? else {
            return Ok(self.unmapped(&subscription.id));
        };
        if let Some(reason) = stale_reason(&record, event_time) {
            return Ok(WebhookOutcome::Ignored { reason });
        }
        if let Some(reason) = superseded_reason(&record, &subscription.id) {
            return Ok(WebhookOutcome::Ignored { reason });
        }

        let subscription_id = subscription.id.clone();
        let customer_id = subscription.customer.clone();
        self.update_account(&record.user_id, "subscription_created", |record| {
            let mut changed = false;
            if record.subscription_id.is_none() {
                record.subscription_id = Some(subscription_id.clone());
                changed = true;
            }
            if record.customer_id.is_none() {
                record.customer_id = Some(customer_id.clone());
                changed = true;
            }
            changed
        })
        .await?;

        Ok(WebhookOutcome::Processed)
    }

    /// customer.subscription.updated: normalize plan, cancellation flag, and
    /// billing interval from the object.
    async fn handle_subscription_updated(
        &self,
        event_time: DateTime<Utc>,
        subscription: &SubscriptionObject,
    ) -> Result<WebhookOutcome> {
        let Some(record) = self.resolve_account(subscription).await? else {
            return Ok(self.unmapped(&subscription.id));
        };
        if let Some(reason) = stale_reason(&record, event_time) {
            return Ok(WebhookOutcome::Ignored { reason });
        }
        if let Some(reason) = superseded_reason(&record, &subscription.id) {
            return Ok(WebhookOutcome::Ignored { reason });
        }

        enum Action {
            Activate,
            Downgrade,
        }
        let action = match subscription.status.as_str() {
            "active" | "trialing" => Action::Activate,
            "canceled" | "unpaid" => Action::Downgrade,
            other => {
                // past_due, incomplete and friends: Stripe is still deciding.
                tracing::debug!(
                    target: "tollgate::webhook",
                    user_id = %record.user_id,
                    status = %other,
                    "Leaving plan untouched for intermediate subscription status"
                );
                return Ok(WebhookOutcome::Processed);
            }
        };

        let subscription_id = subscription.id.clone();
        let customer_id = subscription.customer.clone();
        let derived_interval = subscription
            .price_id()
            .and_then(|price| self.catalog.tier_for_price(price))
            .map(|(_, interval)| interval);
        let cancel_at_period_end = subscription.cancel_at_period_end;

        self.update_account(&record.user_id, "subscription_updated", |record| {
            let before = record.clone();
            match action {
                Action::Activate => {
                    record.plan = Plan::Premium;
                    record.subscription_id = Some(subscription_id.clone());
                    if record.customer_id.is_none() {
                        record.customer_id = Some(customer_id.clone());
                    }
                    record.cancel_at_period_end = cancel_at_period_end;
                    if let Some(interval) = derived_interval {
                        record.billing_interval = Some(interval);
                        if record.pending_interval == Some(interval) {
                            // This is the rotation the user asked for.
                            record.pending_interval = None;
                        }
                    }
                    record.clear_deletion_schedule();
                }
                Action::Downgrade => {
                    if !record.is_downgraded() {
                        record.mark_downgraded(event_time);
                    }
                }
            }
            *record != before
        })
        .await?;

        Ok(WebhookOutcome::Processed)
    }

    /// customer.subscription.deleted: downgrade and start the retention
    /// clock. A deletion for a superseded subscription is ignored; the
    /// customer-id fallback in `resolve_account` would otherwise land it on
    /// the record now carrying the replacement.
    async fn handle_subscription_deleted(
        &self,
        event_time: DateTime<Utc>,
        subscription: &SubscriptionObject,
    ) -> Result<WebhookOutcome> {
        let Some(record) = self.resolve_account(subscription).await? else {
            return Ok(self.unmapped(&subscription.id));
        };
        if let Some(reason) = superseded_reason(&record, &subscription.id) {
            return Ok(WebhookOutcome::Ignored { reason });
        }

        let changed = self
            .update_account(&record.user_id, "subscription_deleted", |record| {
                if record.is_downgraded() {
                    // Redelivery; the deletion date is never recomputed.
                    return false;
                }
                record.mark_downgraded(event_time);
                true
            })
            .await?;

        if changed {
            tracing::info!(
                target: "tollgate::webhook",
                user_id = %record.user_id,
                "Subscription deleted, account downgraded and deletion scheduled"
            );
        }
        Ok(WebhookOutcome::Processed)
    }

    /// Find the account the subscription object belongs to: by subscription
    /// id, then by customer id, then by metadata user id.
    async fn resolve_account(
        &self,
        subscription: &SubscriptionObject,
    ) -> Result<Option<AccountRecord>> {
        if let Some(record) = self.store.find_by_subscription_id(&subscription.id).await? {
            return Ok(Some(record));
        }
        if let Some(record) = self.store.find_by_customer_id(&subscription.customer).await? {
            return Ok(Some(record));
        }
        if let Some(user_id) = &subscription.metadata.user_id {
            return self.store.get_account(user_id).await;
        }
        Ok(None)
    }

    fn unmapped(&self, subscription_id: &str) -> WebhookOutcome {
        tracing::warn!(
            target: "tollgate::webhook",
            subscription_id = %subscription_id,
            "Subscription event for an unmapped account"
        );
        WebhookOutcome::Ignored {
            reason: format!("no account for subscription '{}'", subscription_id),
        }
    }

    /// Apply a mutation under bounded compare-and-save retries.
    ///
    /// The closure sees a fresh copy of the record on every attempt and
    /// returns whether a save is needed; `Ok(false)` means the desired
    /// state already held.
    async fn update_account<F>(&self, user_id: &str, operation: &str, mut apply: F) -> Result<bool>
    where
        F: FnMut(&mut AccountRecord) -> bool,
    {
        for _ in 0..MAX_SAVE_ATTEMPTS {
            let record = self.store.get_account(user_id).await?.ok_or_else(|| {
                BillingError::AccountNotFound {
                    user_id: user_id.to_string(),
                }
            })?;

            let mut updated = record.clone();
            if !apply(&mut updated) {
                return Ok(false);
            }

            if self
                .store
                .compare_and_save_account(&updated, record.version)
                .await?
            {
                return Ok(true);
            }

            tracing::debug!(
                target: "tollgate::webhook",
                user_id = %user_id,
                operation = %operation,
                "Version conflict applying webhook event, reloading"
            );
        }

        Err(BillingError::RetryLimitExceeded {
            operation: operation.to_string(),
        }
        .into())
    }
}

/// Raw webhook event envelope, parsed after signature verification.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEnvelope {
    /// Event ID.
    pub id: String,
    /// Event type (e.g., "checkout.session.completed").
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event data.
    pub data: WebhookEventData,
    /// When Stripe created the event (Unix seconds).
    pub created: u64,
}

/// Webhook event data.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEventData {
    /// The object that triggered the event.
    pub object: serde_json::Value,
}

/// The closed set of event kinds this processor understands.
///
/// Anything else decodes to [`EventKind::Unhandled`]; new Stripe event
/// types can never fail parsing or processing.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    CheckoutCompleted(CheckoutSessionObject),
    SubscriptionCreated(SubscriptionObject),
    SubscriptionUpdated(SubscriptionObject),
    SubscriptionDeleted(SubscriptionObject),
    InvoicePaymentSucceeded(InvoiceObject),
    InvoicePaymentFailed(InvoiceObject),
    Unhandled { kind: String },
}

impl EventKind {
    /// Decode the envelope's object into the matching kind.
    pub fn from_envelope(envelope: &WebhookEnvelope) -> Result<Self> {
        Ok(match envelope.event_type.as_str() {
            "checkout.session.completed" => {
                Self::CheckoutCompleted(decode_object("checkout session", &envelope.data.object)?)
            }
            "customer.subscription.created" => {
                Self::SubscriptionCreated(decode_object("subscription", &envelope.data.object)?)
            }
            "customer.subscription.updated" => {
                Self::SubscriptionUpdated(decode_object("subscription", &envelope.data.object)?)
            }
            "customer.subscription.deleted" => {
                Self::SubscriptionDeleted(decode_object("subscription", &envelope.data.object)?)
            }
            "invoice.payment_succeeded" | "invoice.paid" => {
                Self::InvoicePaymentSucceeded(decode_object("invoice", &envelope.data.object)?)
            }
            "invoice.payment_failed" => {
                Self::InvoicePaymentFailed(decode_object("invoice", &envelope.data.object)?)
            }
            other => Self::Unhandled {
                kind: other.to_string(),
            },
        })
    }
}

fn decode_object<T: serde::de::DeserializeOwned>(
    kind: &str,
    object: &serde_json::Value,
) -> Result<T> {
    serde_json::from_value(object.clone()).map_err(|e| {
        BillingError::InvalidWebhookPayload {
            message: format!("malformed {} object: {}", kind, e),
        }
        .into()
    })
}

/// The checkout session fields this crate reads.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CheckoutSessionObject {
    pub id: String,
    pub customer: Option<String>,
    pub subscription: Option<String>,
    #[serde(default)]
    pub metadata: SessionMetadata,
}

/// Metadata we attached at session creation, round-tripped by Stripe.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct SessionMetadata {
    pub user_id: Option<String>,
    pub plan_tier: Option<String>,
    pub billing_interval: Option<String>,
    pub trial: Option<String>,
}

/// The subscription fields this crate reads.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SubscriptionObject {
    pub id: String,
    pub customer: String,
    pub status: String,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub items: SubscriptionItems,
    #[serde(default)]
    pub metadata: SessionMetadata,
}

impl SubscriptionObject {
    /// The first item's price id; this product sells single-item
    /// subscriptions.
    #[must_use]
    pub fn price_id(&self) -> Option<&str> {
        self.items.data.first().map(|item| item.price.id.as_str())
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct SubscriptionItems {
    #[serde(default)]
    pub data: Vec<SubscriptionItem>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SubscriptionItem {
    pub price: ItemPrice,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ItemPrice {
    pub id: String,
}

/// The invoice fields this crate reads.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct InvoiceObject {
    pub id: String,
    pub customer: Option<String>,
    pub subscription: Option<String>,
}

/// Outcome of webhook processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// Event was processed successfully.
    Processed,
    /// Event was acknowledged but intentionally not applied.
    Ignored { reason: String },
    /// Event was already processed (idempotency).
    AlreadyProcessed,
}

/// An event older than the account's downgrade is from a previous
/// subscription lifetime and must not resurrect its state.
fn stale_reason(record: &AccountRecord, event_time: DateTime<Utc>) -> Option<String> {
    let downgraded_at = record.last_downgrade_date?;
    if event_time < downgraded_at {
        tracing::info!(
            target: "tollgate::webhook",
            user_id = %record.user_id,
            event_time = %event_time,
            downgraded_at = %downgraded_at,
            "Ignoring out-of-order event from before the downgrade"
        );
        Some("event predates the account's downgrade".to_string())
    } else {
        None
    }
}

/// A checkout older than the stored subscription start is from a purchase
/// that has since been replaced and must not overwrite the replacement.
fn stale_checkout_reason(record: &AccountRecord, event_time: DateTime<Utc>) -> Option<String> {
    let started_at = record.subscription_start_date?;
    // Compare at the wire's whole-second resolution; locally-written start
    // dates can carry sub-second precision.
    if event_time.timestamp() < started_at.timestamp() {
        tracing::info!(
            target: "tollgate::webhook",
            user_id = %record.user_id,
            event_time = %event_time,
            started_at = %started_at,
            "Ignoring checkout older than the current subscription"
        );
        Some("checkout predates the current subscription".to_string())
    } else {
        None
    }
}

/// An event naming a subscription other than the one the account currently
/// tracks is from a superseded subscription and must not touch the record
/// carrying its replacement.
fn superseded_reason(record: &AccountRecord, subscription_id: &str) -> Option<String> {
    let current = record.subscription_id.as_deref()?;
    if current == subscription_id {
        return None;
    }
    tracing::info!(
        target: "tollgate::webhook",
        user_id = %record.user_id,
        subscription_id = %subscription_id,
        current_subscription_id = %current,
        "Ignoring event for a superseded subscription"
    );
    Some(format!(
        "subscription '{}' was superseded on this account",
        subscription_id
    ))
}

/// Parsed signature header parts.
struct SignatureParts {
    timestamp: i64,
    signature: String,
}

/// Parse the Stripe-Signature header (`t=<unix>,v1=<hex>`).
fn parse_signature_header(header: &str) -> Result<SignatureParts> {
    let mut timestamp = None;
    let mut signature = None;

    for part in header.split(',') {
        let Some((key, value)) = part.split_once('=') else {
            return Err(BillingError::InvalidWebhookSignature.into());
        };
        match key.trim() {
            "t" => timestamp = value.parse().ok(),
            "v1" => signature = Some(value.to_string()),
            // Ignore other schemes (v0, future versions).
            _ => {}
        }
    }

    match (timestamp, signature) {
        (Some(timestamp), Some(signature)) => Ok(SignatureParts {
            timestamp,
            signature,
        }),
        _ => Err(BillingError::InvalidWebhookSignature.into()),
    }
}

/// Compute HMAC-SHA256 signature, hex-encoded.
fn compute_signature(secret: &str, payload: &[u8]) -> Result<String> {
    type HmacSha256 = Hmac<Sha256>;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| TollgateError::internal("HMAC error"))?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Build a valid `Stripe-Signature` header for a payload.
///
/// Test helper, used by this crate's tests and exported for downstream
/// webhook tests.
#[cfg(any(test, feature = "test-billing"))]
pub fn sign_payload(secret: &str, payload: &[u8], timestamp: i64) -> String {
    let signed_payload = format!("{}.{}", timestamp, String::from_utf8_lossy(payload));
    let sig = compute_signature(secret, signed_payload.as_bytes())
        .unwrap_or_else(|_| String::new());
    format!("t={},v1={}", timestamp, sig)
}
