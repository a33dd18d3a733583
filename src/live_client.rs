//! Live Stripe client implementation.
//!
//! Production Stripe client with retry logic, secure API key handling, and
//! proper error mapping. Talks to the Stripe REST API directly with
//! form-encoded requests so the wire surface stays limited to the handful of
//! endpoints this crate actually uses.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::checkout::{CheckoutSession, CreateCheckoutSessionRequest, StripeCheckoutClient};
use crate::error::{BillingError, Result};
use crate::subscription::{ScheduledChange, StripeSubscriptionClient, StripeSubscriptionData};

/// Default Stripe API base URL. Overridable for tests against a local stub.
const DEFAULT_API_BASE: &str = "https://api.stripe.com";

/// Pinned API version, sent on every request.
const STRIPE_API_VERSION: &str = "2024-06-20";

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the live Stripe client.
#[derive(Debug, Clone)]
pub struct LiveStripeConfig {
    /// Base URL for the Stripe API.
    pub api_base: String,
    /// Maximum number of retry attempts for transient failures.
    pub max_retries: u32,
    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    pub max_delay_ms: u64,
    /// Request timeout in seconds.
    pub timeout_seconds: u64,
}

impl Default for LiveStripeConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            timeout_seconds: 30,
        }
    }
}

impl LiveStripeConfig {
    /// Create a new config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Point the client at a different API base URL.
    #[must_use]
    pub fn api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    /// Set maximum retry attempts.
    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set base delay for exponential backoff.
    #[must_use]
    pub fn base_delay_ms(mut self, ms: u64) -> Self {
        self.base_delay_ms = ms;
        self
    }

    /// Set maximum delay between retries.
    #[must_use]
    pub fn max_delay_ms(mut self, ms: u64) -> Self {
        self.max_delay_ms = ms;
        self
    }

    /// Set request timeout.
    #[must_use]
    pub fn timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }
}

// ============================================================================
// API key validation
// ============================================================================

/// Error returned when API key validation fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidApiKeyError {
    /// Description of why the key is invalid.
    pub reason: String,
}

impl std::fmt::Display for InvalidApiKeyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Invalid Stripe API key: {}", self.reason)
    }
}

impl std::error::Error for InvalidApiKeyError {}

/// Validate a Stripe API key format.
///
/// Valid formats:
/// - `sk_test_*` - Test mode secret key
/// - `sk_live_*` - Live mode secret key
/// - `rk_test_*` - Test mode restricted key
/// - `rk_live_*` - Live mode restricted key
fn validate_api_key(key: &str) -> std::result::Result<(), InvalidApiKeyError> {
    const MIN_KEY_LENGTH: usize = 20;

    if key.is_empty() {
        return Err(InvalidApiKeyError {
            reason: "API key cannot be empty".to_string(),
        });
    }

    if key.len() < MIN_KEY_LENGTH {
        return Err(InvalidApiKeyError {
            reason: format!("API key too short (minimum {} characters)", MIN_KEY_LENGTH),
        });
    }

    let valid_prefixes = ["sk_test_", "sk_live_", "rk_test_", "rk_live_"];
    if !valid_prefixes.iter().any(|prefix| key.starts_with(prefix)) {
        return Err(InvalidApiKeyError {
            reason: "API key must start with sk_test_, sk_live_, rk_test_, or rk_live_"
                .to_string(),
        });
    }

    Ok(())
}

// ============================================================================
// Live Stripe client
// ============================================================================

/// Live Stripe client for production use.
///
/// Implements the checkout and subscription client traits with:
/// - Secure API key handling using `SecretString`
/// - Retry logic with exponential backoff for transient failures
/// - Idempotency keys on mutating operations, held stable across retries
/// - Error mapping to `BillingError` types
///
/// # Example
///
/// ```rust,ignore
/// use tollgate::{LiveStripeClient, LiveStripeConfig};
///
/// let client = LiveStripeClient::new("sk_live_xxx", LiveStripeConfig::default())?;
/// let manager = SubscriptionManager::new(store, client, catalog);
/// ```
#[derive(Clone)]
pub struct LiveStripeClient {
    http: reqwest::Client,
    api_key: SecretString,
    config: LiveStripeConfig,
}

impl LiveStripeClient {
    /// Create a new live Stripe client.
    ///
    /// The API key is validated and stored securely, and won't be exposed in
    /// debug output. Supports test mode (`sk_test_`), live mode (`sk_live_`),
    /// and restricted keys (`rk_*`).
    ///
    /// # Errors
    ///
    /// Returns an error if the API key format is invalid.
    pub fn new(
        api_key: impl Into<SecretString>,
        config: LiveStripeConfig,
    ) -> std::result::Result<Self, InvalidApiKeyError> {
        let api_key: SecretString = api_key.into();
        validate_api_key(api_key.expose_secret())?;

        Ok(Self {
            http: reqwest::Client::new(),
            api_key,
            config,
        })
    }

    /// Create a client with default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the API key format is invalid.
    pub fn with_default_config(
        api_key: impl Into<SecretString>,
    ) -> std::result::Result<Self, InvalidApiKeyError> {
        Self::new(api_key, LiveStripeConfig::default())
    }

    /// Check if the client is using a test mode API key.
    #[must_use]
    pub fn is_test_mode(&self) -> bool {
        let key = self.api_key.expose_secret();
        key.starts_with("sk_test_") || key.starts_with("rk_test_")
    }

    /// Check if the client is using a live mode API key.
    #[must_use]
    pub fn is_live_mode(&self) -> bool {
        let key = self.api_key.expose_secret();
        key.starts_with("sk_live_") || key.starts_with("rk_live_")
    }

    /// Get the configured timeout duration.
    #[inline]
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_seconds)
    }

    /// Generate an idempotency key for retryable operations.
    #[inline]
    fn generate_idempotency_key(operation: &str) -> String {
        format!("{}_{}", operation, uuid::Uuid::new_v4())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base.trim_end_matches('/'), path)
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .get(self.url(path))
            .bearer_auth(self.api_key.expose_secret())
            .header("Stripe-Version", STRIPE_API_VERSION)
    }

    fn post(
        &self,
        path: &str,
        idempotency_key: &str,
        form: &[(String, String)],
    ) -> reqwest::RequestBuilder {
        self.http
            .post(self.url(path))
            .bearer_auth(self.api_key.expose_secret())
            .header("Stripe-Version", STRIPE_API_VERSION)
            .header("Idempotency-Key", idempotency_key)
            .form(form)
    }

    /// Send a request with timeout, retrying 429s, 5xx and transport errors.
    ///
    /// The closure builds a fresh request per attempt; idempotency keys are
    /// generated once by the caller so every attempt carries the same key.
    async fn send_with_retry<F>(
        &self,
        operation: &'static str,
        build: F,
    ) -> Result<reqwest::Response, BillingError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let timeout_duration = Duration::from_secs(self.config.timeout_seconds);
        let mut attempts = 0;

        loop {
            let result = tokio::time::timeout(timeout_duration, build().send()).await;

            match result {
                Ok(Ok(response)) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    let retryable = status.as_u16() == 429 || status.is_server_error();
                    if !retryable || attempts >= self.config.max_retries {
                        return Err(error_from_response(operation, response).await);
                    }
                    tracing::warn!(
                        target: "tollgate::stripe",
                        operation = operation,
                        attempt = attempts + 1,
                        status = status.as_u16(),
                        "Retrying Stripe API call after transient error"
                    );
                }
                Ok(Err(e)) => {
                    // Transport errors never carry a Stripe response.
                    if attempts >= self.config.max_retries {
                        return Err(BillingError::StripeUnavailable {
                            operation: operation.to_string(),
                            message: e.to_string(),
                        });
                    }
                    tracing::warn!(
                        target: "tollgate::stripe",
                        operation = operation,
                        attempt = attempts + 1,
                        error = %e,
                        "Stripe request failed, retrying"
                    );
                }
                Err(_elapsed) => {
                    if attempts >= self.config.max_retries {
                        return Err(BillingError::StripeApiError {
                            operation: operation.to_string(),
                            message: format!(
                                "Request timed out after {} seconds",
                                self.config.timeout_seconds
                            ),
                            code: None,
                            http_status: Some(408),
                        });
                    }
                    tracing::warn!(
                        target: "tollgate::stripe",
                        operation = operation,
                        attempt = attempts + 1,
                        timeout_seconds = self.config.timeout_seconds,
                        "Stripe API request timed out, retrying"
                    );
                }
            }

            sleep_with_backoff(attempts, &self.config).await;
            attempts += 1;
        }
    }
}

// Debug implementation that doesn't expose the API key
impl std::fmt::Debug for LiveStripeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveStripeClient")
            .field("config", &self.config)
            .field("is_test_mode", &self.is_test_mode())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Retry helpers
// ============================================================================

/// Sleep with exponential backoff.
#[inline]
async fn sleep_with_backoff(attempts: u32, config: &LiveStripeConfig) {
    let delay = calculate_backoff_delay(attempts, config.base_delay_ms, config.max_delay_ms);
    tokio::time::sleep(delay).await;
}

/// Calculate backoff delay with exponential backoff and jitter.
#[inline]
fn calculate_backoff_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    // Exponential backoff: base_ms * 2^attempt
    let delay_ms = base_ms.saturating_mul(2_u64.saturating_pow(attempt));
    let delay_ms = delay_ms.min(max_ms);

    // Add jitter (0-25% of delay)
    let jitter = if delay_ms > 0 {
        fastrand::u64(0..=delay_ms / 4)
    } else {
        0
    };
    Duration::from_millis(delay_ms.saturating_add(jitter))
}

// ============================================================================
// Error mapping
// ============================================================================

#[derive(Debug, Deserialize)]
struct StripeErrorResponse {
    error: StripeErrorBody,
}

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    message: Option<String>,
    code: Option<String>,
}

async fn error_from_response(operation: &'static str, response: reqwest::Response) -> BillingError {
    let http_status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    stripe_error_from_body(operation, http_status, &body)
}

/// Map a Stripe error body to a typed error, preserving the error code so
/// callers can distinguish cases like `resource_missing`.
fn stripe_error_from_body(operation: &str, http_status: u16, body: &str) -> BillingError {
    let (message, code) = match serde_json::from_str::<StripeErrorResponse>(body) {
        Ok(parsed) => (
            parsed
                .error
                .message
                .unwrap_or_else(|| "Unknown error".to_string()),
            parsed.error.code,
        ),
        Err(_) => ("Unknown error".to_string(), None),
    };

    BillingError::StripeApiError {
        operation: operation.to_string(),
        message,
        code,
        http_status: Some(http_status),
    }
}

async fn decode<T: serde::de::DeserializeOwned>(
    operation: &'static str,
    response: reqwest::Response,
) -> Result<T, BillingError> {
    response.json::<T>().await.map_err(|e| BillingError::Internal {
        message: format!("Failed to decode Stripe '{}' response: {}", operation, e),
    })
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct CheckoutSessionResponse {
    id: String,
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionResponse {
    id: String,
    customer: String,
    status: String,
    current_period_start: u64,
    current_period_end: u64,
    #[serde(default)]
    cancel_at_period_end: bool,
    cancel_at: Option<u64>,
    canceled_at: Option<u64>,
    trial_end: Option<u64>,
    /// Attached subscription schedule, if any.
    schedule: Option<String>,
    #[serde(default)]
    items: ItemList,
}

impl SubscriptionResponse {
    fn into_data(self) -> Result<StripeSubscriptionData, BillingError> {
        let price = self
            .items
            .data
            .into_iter()
            .next()
            .map(|item| item.price)
            .ok_or_else(|| BillingError::Internal {
                message: format!("Subscription '{}' has no items", self.id),
            })?;

        Ok(StripeSubscriptionData {
            id: self.id,
            customer_id: self.customer,
            status: self.status,
            price_id: price.id,
            current_period_start: self.current_period_start,
            current_period_end: self.current_period_end,
            cancel_at_period_end: self.cancel_at_period_end,
            cancel_at: self.cancel_at,
            canceled_at: self.canceled_at,
            trial_end: self.trial_end,
            amount: price.unit_amount,
            currency: price.currency,
            interval: price.recurring.and_then(|r| r.interval),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct ItemList {
    #[serde(default)]
    data: Vec<ItemResponse>,
}

#[derive(Debug, Deserialize)]
struct ItemResponse {
    price: PriceResponse,
}

#[derive(Debug, Deserialize)]
struct PriceResponse {
    id: String,
    unit_amount: Option<i64>,
    currency: Option<String>,
    recurring: Option<RecurringResponse>,
}

#[derive(Debug, Deserialize)]
struct RecurringResponse {
    interval: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ScheduleResponse {
    id: String,
}

// ============================================================================
// Form encoding
// ============================================================================

fn checkout_session_form(request: &CreateCheckoutSessionRequest) -> Vec<(String, String)> {
    let mut form = vec![
        ("mode".to_string(), "subscription".to_string()),
        ("line_items[0][price]".to_string(), request.price_id.clone()),
        ("line_items[0][quantity]".to_string(), "1".to_string()),
        ("success_url".to_string(), request.success_url.clone()),
        ("cancel_url".to_string(), request.cancel_url.clone()),
        (
            "allow_promotion_codes".to_string(),
            request.allow_promotion_codes.to_string(),
        ),
    ];

    // An existing customer takes precedence; Stripe rejects both at once.
    if let Some(customer_id) = &request.customer_id {
        form.push(("customer".to_string(), customer_id.clone()));
    } else if let Some(email) = &request.customer_email {
        form.push(("customer_email".to_string(), email.clone()));
    }

    if let Some(days) = request.trial_period_days {
        form.push((
            "subscription_data[trial_period_days]".to_string(),
            days.to_string(),
        ));
    }

    for (key, value) in request.metadata.entries() {
        form.push((key.to_string(), value));
    }

    form
}

/// Two-phase schedule: the current price until the period boundary, the new
/// price after it. `end_behavior=release` detaches the schedule once done.
fn schedule_phases_form(
    current: &StripeSubscriptionData,
    new_price_id: &str,
) -> Vec<(String, String)> {
    vec![
        (
            "phases[0][items][0][price]".to_string(),
            current.price_id.clone(),
        ),
        ("phases[0][items][0][quantity]".to_string(), "1".to_string()),
        (
            "phases[0][start_date]".to_string(),
            current.current_period_start.to_string(),
        ),
        (
            "phases[0][end_date]".to_string(),
            current.current_period_end.to_string(),
        ),
        (
            "phases[1][items][0][price]".to_string(),
            new_price_id.to_string(),
        ),
        ("phases[1][items][0][quantity]".to_string(), "1".to_string()),
        ("end_behavior".to_string(), "release".to_string()),
    ]
}

// ============================================================================
// StripeCheckoutClient implementation
// ============================================================================

impl StripeCheckoutClient for LiveStripeClient {
    async fn create_checkout_session(
        &self,
        request: CreateCheckoutSessionRequest,
    ) -> Result<CheckoutSession, BillingError> {
        let idempotency_key = Self::generate_idempotency_key("create_checkout_session");
        let form = checkout_session_form(&request);

        let response = self
            .send_with_retry("create_checkout_session", || {
                self.post("/v1/checkout/sessions", &idempotency_key, &form)
            })
            .await?;
        let session: CheckoutSessionResponse = decode("create_checkout_session", response).await?;

        let url = session.url.ok_or_else(|| BillingError::Internal {
            message: "Checkout session URL missing".to_string(),
        })?;
        Ok(CheckoutSession {
            id: session.id,
            url,
        })
    }
}

// ============================================================================
// StripeSubscriptionClient implementation
// ============================================================================

impl StripeSubscriptionClient for LiveStripeClient {
    async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<StripeSubscriptionData, BillingError> {
        let path = format!("/v1/subscriptions/{}", subscription_id);
        let response = self
            .send_with_retry("get_subscription", || self.get(&path))
            .await?;
        let subscription: SubscriptionResponse = decode("get_subscription", response).await?;
        subscription.into_data()
    }

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel: bool,
    ) -> Result<StripeSubscriptionData, BillingError> {
        let idempotency_key = Self::generate_idempotency_key("set_cancel_at_period_end");
        let path = format!("/v1/subscriptions/{}", subscription_id);
        let form = vec![("cancel_at_period_end".to_string(), cancel.to_string())];

        let response = self
            .send_with_retry("set_cancel_at_period_end", || {
                self.post(&path, &idempotency_key, &form)
            })
            .await?;
        let subscription: SubscriptionResponse =
            decode("set_cancel_at_period_end", response).await?;
        subscription.into_data()
    }

    async fn schedule_interval_switch(
        &self,
        subscription_id: &str,
        new_price_id: &str,
    ) -> Result<ScheduledChange, BillingError> {
        // The phase layout needs the current price and period boundary.
        let path = format!("/v1/subscriptions/{}", subscription_id);
        let response = self
            .send_with_retry("get_subscription", || self.get(&path))
            .await?;
        let current: SubscriptionResponse = decode("get_subscription", response).await?;

        let schedule_id = match current.schedule.clone() {
            Some(id) => id,
            None => {
                let idempotency_key =
                    Self::generate_idempotency_key("create_subscription_schedule");
                let form = vec![("from_subscription".to_string(), subscription_id.to_string())];
                let response = self
                    .send_with_retry("create_subscription_schedule", || {
                        self.post("/v1/subscription_schedules", &idempotency_key, &form)
                    })
                    .await?;
                let schedule: ScheduleResponse =
                    decode("create_subscription_schedule", response).await?;
                schedule.id
            }
        };

        let data = current.into_data()?;
        let form = schedule_phases_form(&data, new_price_id);
        let idempotency_key = Self::generate_idempotency_key("update_subscription_schedule");
        let schedule_path = format!("/v1/subscription_schedules/{}", schedule_id);
        let response = self
            .send_with_retry("update_subscription_schedule", || {
                self.post(&schedule_path, &idempotency_key, &form)
            })
            .await?;
        let _confirmed: ScheduleResponse = decode("update_subscription_schedule", response).await?;

        tracing::info!(
            target: "tollgate::stripe",
            subscription_id = %subscription_id,
            schedule_id = %schedule_id,
            new_price_id = %new_price_id,
            effective_at = data.current_period_end,
            "Scheduled interval switch at period end"
        );

        Ok(ScheduledChange {
            schedule_id,
            effective_at: data.current_period_end,
            price_id: new_price_id.to_string(),
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{BillingInterval, PlanTier};
    use crate::checkout::CheckoutMetadata;
    use crate::error::TollgateError;

    fn form_value<'a>(form: &'a [(String, String)], key: &str) -> Option<&'a str> {
        form.iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn checkout_request() -> CreateCheckoutSessionRequest {
        CreateCheckoutSessionRequest {
            customer_id: None,
            customer_email: Some("user@example.com".to_string()),
            price_id: "price_pm".to_string(),
            success_url: "https://app.example.com/done".to_string(),
            cancel_url: "https://app.example.com/cancel".to_string(),
            allow_promotion_codes: true,
            trial_period_days: Some(7),
            metadata: CheckoutMetadata {
                user_id: "user_1".to_string(),
                plan_tier: PlanTier::Personal,
                billing_interval: BillingInterval::Monthly,
                trial: true,
            },
        }
    }

    #[test]
    fn validate_api_key_accepts_known_prefixes() {
        assert!(validate_api_key("sk_test_1234567890abcdef").is_ok());
        assert!(validate_api_key("sk_live_1234567890abcdef").is_ok());
        assert!(validate_api_key("rk_test_1234567890abcdef").is_ok());
        assert!(validate_api_key("rk_live_1234567890abcdef").is_ok());
    }

    #[test]
    fn validate_api_key_rejects_bad_keys() {
        assert!(validate_api_key("").is_err());
        assert!(validate_api_key("invalid_key").is_err());
        assert!(validate_api_key("sk_test_short").is_err());
        // Publishable keys are not secret keys.
        assert!(validate_api_key("pk_test_1234567890abcdef").is_err());
    }

    #[test]
    fn mode_detection() {
        let client = LiveStripeClient::with_default_config("sk_test_12345678901234567890").unwrap();
        assert!(client.is_test_mode());
        assert!(!client.is_live_mode());

        let client = LiveStripeClient::with_default_config("sk_live_12345678901234567890").unwrap();
        assert!(!client.is_test_mode());
        assert!(client.is_live_mode());
    }

    #[test]
    fn config_builder_chains() {
        let config = LiveStripeConfig::new()
            .api_base("http://localhost:12111")
            .max_retries(5)
            .base_delay_ms(1000)
            .max_delay_ms(60_000)
            .timeout_seconds(60);

        assert_eq!(config.api_base, "http://localhost:12111");
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.base_delay_ms, 1000);
        assert_eq!(config.max_delay_ms, 60_000);
        assert_eq!(config.timeout_seconds, 60);
    }

    #[test]
    fn backoff_grows_exponentially_with_jitter() {
        let base = 500;
        let max = 30_000;

        let delay0 = calculate_backoff_delay(0, base, max);
        assert!(delay0.as_millis() >= 500 && delay0.as_millis() <= 625);

        let delay1 = calculate_backoff_delay(1, base, max);
        assert!(delay1.as_millis() >= 1000 && delay1.as_millis() <= 1250);

        let delay2 = calculate_backoff_delay(2, base, max);
        assert!(delay2.as_millis() >= 2000 && delay2.as_millis() <= 2500);

        let delay_high = calculate_backoff_delay(10, base, max);
        assert!(delay_high.as_millis() <= max as u128 + (max / 4) as u128);
    }

    #[test]
    fn backoff_with_zero_base_does_not_panic() {
        let delay = calculate_backoff_delay(0, 0, 1000);
        assert_eq!(delay.as_millis(), 0);
    }

    #[test]
    fn debug_does_not_expose_api_key() {
        let client =
            LiveStripeClient::with_default_config("sk_test_secret_key_1234567890").unwrap();
        let debug_output = format!("{:?}", client);

        assert!(!debug_output.contains("sk_test_secret_key_1234567890"));
        assert!(debug_output.contains("is_test_mode: true"));
    }

    #[test]
    fn idempotency_keys_are_unique_per_call() {
        let key1 = LiveStripeClient::generate_idempotency_key("create_checkout_session");
        let key2 = LiveStripeClient::generate_idempotency_key("create_checkout_session");

        assert!(key1.starts_with("create_checkout_session_"));
        assert!(key2.starts_with("create_checkout_session_"));
        assert_ne!(key1, key2);
    }

    #[test]
    fn timeout_getter_reflects_config() {
        let config = LiveStripeConfig::new().timeout_seconds(45);
        let client = LiveStripeClient::new("sk_test_12345678901234567890", config).unwrap();
        assert_eq!(client.timeout(), Duration::from_secs(45));
    }

    #[test]
    fn checkout_form_uses_email_when_no_customer() {
        let form = checkout_session_form(&checkout_request());

        assert_eq!(form_value(&form, "mode"), Some("subscription"));
        assert_eq!(form_value(&form, "line_items[0][price]"), Some("price_pm"));
        assert_eq!(form_value(&form, "line_items[0][quantity]"), Some("1"));
        assert_eq!(
            form_value(&form, "customer_email"),
            Some("user@example.com")
        );
        assert_eq!(form_value(&form, "customer"), None);
        assert_eq!(
            form_value(&form, "subscription_data[trial_period_days]"),
            Some("7")
        );
        assert_eq!(form_value(&form, "metadata[user_id]"), Some("user_1"));
        assert_eq!(form_value(&form, "metadata[plan_tier]"), Some("personal"));
        assert_eq!(
            form_value(&form, "metadata[billing_interval]"),
            Some("monthly")
        );
        assert_eq!(form_value(&form, "metadata[trial]"), Some("true"));
    }

    #[test]
    fn checkout_form_prefers_existing_customer() {
        let mut request = checkout_request();
        request.customer_id = Some("cus_1".to_string());
        request.trial_period_days = None;

        let form = checkout_session_form(&request);
        assert_eq!(form_value(&form, "customer"), Some("cus_1"));
        assert_eq!(form_value(&form, "customer_email"), None);
        assert_eq!(form_value(&form, "subscription_data[trial_period_days]"), None);
    }

    #[test]
    fn schedule_form_lays_out_two_phases() {
        let current = StripeSubscriptionData {
            id: "sub_1".to_string(),
            customer_id: "cus_1".to_string(),
            status: "active".to_string(),
            price_id: "price_pm".to_string(),
            current_period_start: 1_735_689_600,
            current_period_end: 1_738_368_000,
            cancel_at_period_end: false,
            cancel_at: None,
            canceled_at: None,
            trial_end: None,
            amount: Some(900),
            currency: Some("usd".to_string()),
            interval: Some("month".to_string()),
        };

        let form = schedule_phases_form(&current, "price_pa");
        assert_eq!(form_value(&form, "phases[0][items][0][price]"), Some("price_pm"));
        assert_eq!(form_value(&form, "phases[0][start_date]"), Some("1735689600"));
        assert_eq!(form_value(&form, "phases[0][end_date]"), Some("1738368000"));
        assert_eq!(form_value(&form, "phases[1][items][0][price]"), Some("price_pa"));
        assert_eq!(form_value(&form, "end_behavior"), Some("release"));
    }

    #[test]
    fn error_body_preserves_stripe_code() {
        let body = r#"{"error":{"message":"No such subscription: 'sub_x'","code":"resource_missing","type":"invalid_request_error"}}"#;
        let err = stripe_error_from_body("get_subscription", 404, body);

        match &err {
            BillingError::StripeApiError {
                operation,
                message,
                code,
                http_status,
            } => {
                assert_eq!(operation, "get_subscription");
                assert_eq!(message, "No such subscription: 'sub_x'");
                assert_eq!(code.as_deref(), Some("resource_missing"));
                assert_eq!(*http_status, Some(404));
            }
            other => panic!("unexpected error: {:?}", other),
        }

        // The code stays visible in the HTTP-layer rendering.
        let mapped: TollgateError = err.into();
        assert!(mapped.to_string().contains("resource_missing"));
    }

    #[test]
    fn unparseable_error_body_falls_back() {
        let err = stripe_error_from_body("get_subscription", 500, "<html>bad gateway</html>");
        match err {
            BillingError::StripeApiError { message, code, .. } => {
                assert_eq!(message, "Unknown error");
                assert_eq!(code, None);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn subscription_response_maps_to_data() {
        let body = r#"{
            "id": "sub_1",
            "customer": "cus_1",
            "status": "active",
            "current_period_start": 1735689600,
            "current_period_end": 1738368000,
            "cancel_at_period_end": true,
            "cancel_at": 1738368000,
            "canceled_at": 1736000000,
            "trial_end": null,
            "schedule": null,
            "items": {
                "data": [
                    {
                        "price": {
                            "id": "price_pm",
                            "unit_amount": 900,
                            "currency": "usd",
                            "recurring": { "interval": "month" }
                        }
                    }
                ]
            }
        }"#;

        let response: SubscriptionResponse = serde_json::from_str(body).unwrap();
        let data = response.into_data().unwrap();

        assert_eq!(data.id, "sub_1");
        assert_eq!(data.customer_id, "cus_1");
        assert_eq!(data.price_id, "price_pm");
        assert!(data.cancel_at_period_end);
        assert_eq!(data.cancel_at, Some(1_738_368_000));
        assert_eq!(data.amount, Some(900));
        assert_eq!(data.interval.as_deref(), Some("month"));
    }

    #[test]
    fn subscription_without_items_is_an_error() {
        let body = r#"{
            "id": "sub_1",
            "customer": "cus_1",
            "status": "active",
            "current_period_start": 1735689600,
            "current_period_end": 1738368000,
            "items": { "data": [] }
        }"#;

        let response: SubscriptionResponse = serde_json::from_str(body).unwrap();
        assert!(response.into_data().is_err());
    }
}
