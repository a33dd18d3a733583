//! Error types.
//!
//! Two layers, converted at the HTTP boundary: [`BillingError`] carries typed
//! domain outcomes (trial already claimed, no subscription, Stripe failure
//! classes) so callers can match on them, and [`TollgateError`] is the
//! HTTP-mapped error every handler returns. Expected domain outcomes are never
//! expressed as panics or stringly-typed internals.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

// =============================================================================
// Domain errors
// =============================================================================

/// Billing and entitlement domain errors.
///
/// Distinguishes precondition violations (client's state does not allow the
/// operation) from infrastructure failures (Stripe unreachable, lost CAS
/// race), so the HTTP layer and retry logic can treat them differently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingError {
    // Account / precondition errors
    /// No account record exists for the user.
    AccountNotFound { user_id: String },
    /// The account has already used its one trial.
    TrialAlreadyClaimed { user_id: String },
    /// The operation needs an active subscription and the account has none.
    NoSubscription { user_id: String },
    /// Requested interval switch to the interval already being billed.
    IntervalUnchanged { interval: String },

    // Catalog errors
    /// A Stripe price id that is not in the configured catalog.
    UnknownPrice { price_id: String },

    // Record integrity
    /// A write would leave the record self-contradictory; rejected before
    /// commit.
    InvalidRecord { reason: String },

    // Checkout errors
    /// Invalid redirect URL provided.
    InvalidRedirectUrl { url: String, reason: String },
    /// Redirect URL domain not in the allowed list.
    RedirectDomainNotAllowed { domain: String },

    // Webhook errors
    /// Webhook signature is invalid.
    InvalidWebhookSignature,
    /// Webhook timestamp is too old (replay protection).
    WebhookTimestampExpired { age_seconds: i64 },
    /// Webhook event data is malformed.
    InvalidWebhookPayload { message: String },

    // Stripe API errors
    /// Stripe answered with an error.
    StripeApiError {
        operation: String,
        message: String,
        code: Option<String>,
        http_status: Option<u16>,
    },
    /// Stripe never answered (timeout, connect failure). Nothing was written
    /// locally; the caller may retry.
    StripeUnavailable { operation: String, message: String },

    // Concurrency
    /// Lost an optimistic-concurrency race; retry the operation.
    ConcurrentModification { user_id: String },
    /// The operation failed after multiple retries.
    RetryLimitExceeded { operation: String },

    /// An unexpected internal error occurred.
    Internal { message: String },
}

impl std::fmt::Display for BillingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AccountNotFound { user_id } => {
                write!(f, "No account record for user '{}'", user_id)
            }
            Self::TrialAlreadyClaimed { user_id } => {
                write!(f, "Trial already claimed for user '{}'", user_id)
            }
            Self::NoSubscription { user_id } => {
                write!(f, "No active subscription for user '{}'", user_id)
            }
            Self::IntervalUnchanged { interval } => {
                write!(f, "Subscription is already billed {}", interval)
            }
            Self::UnknownPrice { price_id } => {
                write!(f, "Stripe price '{}' is not in the plan catalog", price_id)
            }
            Self::InvalidRecord { reason } => {
                write!(f, "Account record would become inconsistent: {}", reason)
            }
            Self::InvalidRedirectUrl { url, reason } => {
                write!(f, "Invalid redirect URL '{}': {}", url, reason)
            }
            Self::RedirectDomainNotAllowed { domain } => {
                write!(f, "Redirect domain '{}' is not allowed", domain)
            }
            Self::InvalidWebhookSignature => {
                write!(f, "Invalid webhook signature")
            }
            Self::WebhookTimestampExpired { age_seconds } => {
                write!(f, "Webhook timestamp expired ({} seconds old)", age_seconds)
            }
            Self::InvalidWebhookPayload { message } => {
                write!(f, "Invalid webhook payload: {}", message)
            }
            Self::StripeApiError {
                operation,
                message,
                code,
                http_status,
            } => {
                write!(f, "Stripe API error during '{}': {}", operation, message)?;
                if let Some(code) = code {
                    write!(f, " (code: {})", code)?;
                }
                if let Some(status) = http_status {
                    write!(f, " [HTTP {}]", status)?;
                }
                Ok(())
            }
            Self::StripeUnavailable { operation, message } => {
                write!(f, "Stripe unreachable during '{}': {}", operation, message)
            }
            Self::ConcurrentModification { user_id } => {
                write!(
                    f,
                    "Concurrent modification detected for user '{}', please retry",
                    user_id
                )
            }
            Self::RetryLimitExceeded { operation } => {
                write!(f, "Operation '{}' failed after multiple retries", operation)
            }
            Self::Internal { message } => {
                write!(f, "Internal billing error: {}", message)
            }
        }
    }
}

impl std::error::Error for BillingError {}

impl BillingError {
    /// Check if this is a client error (4xx).
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        match self {
            Self::AccountNotFound { .. }
            | Self::TrialAlreadyClaimed { .. }
            | Self::NoSubscription { .. }
            | Self::IntervalUnchanged { .. }
            | Self::InvalidRedirectUrl { .. }
            | Self::RedirectDomainNotAllowed { .. }
            | Self::InvalidWebhookSignature
            | Self::WebhookTimestampExpired { .. }
            | Self::InvalidWebhookPayload { .. } => true,
            Self::StripeApiError { http_status, .. } => {
                matches!(http_status, Some(400..=428) | Some(430..=499))
            }
            _ => false,
        }
    }

    /// Check if this is a server-side error (5xx).
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        match self {
            Self::UnknownPrice { .. }
            | Self::InvalidRecord { .. }
            | Self::ConcurrentModification { .. }
            | Self::RetryLimitExceeded { .. }
            | Self::StripeUnavailable { .. }
            | Self::Internal { .. } => true,
            Self::StripeApiError { http_status, .. } => {
                matches!(http_status, Some(429) | Some(500..=599) | None)
            }
            _ => false,
        }
    }

    /// Check if retrying the same call may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConcurrentModification { .. } | Self::StripeUnavailable { .. } => true,
            Self::StripeApiError { http_status, .. } => {
                matches!(http_status, Some(429) | Some(500..=599))
            }
            _ => false,
        }
    }
}

// =============================================================================
// HTTP-facing error
// =============================================================================

/// The error type returned by all handlers and fallible public APIs.
#[derive(Debug, thiserror::Error)]
pub enum TollgateError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Request timeout")]
    RequestTimeout,

    #[error("Too many requests: {0}")]
    TooManyRequests(String),

    /// Catch-all so application handlers can `?` arbitrary errors.
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),

    #[cfg(feature = "seaorm-store")]
    #[error("Database error: {0}")]
    Database(String),
}

/// Result type alias used throughout the crate. The error defaults to
/// [`TollgateError`]; the Stripe client traits narrow it to [`BillingError`].
pub type Result<T, E = TollgateError> = std::result::Result<T, E>;

/// JSON body sent for every error response.
#[derive(Serialize)]
pub struct ErrorResponse {
    error: String,
    error_id: String,
}

impl TollgateError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn service_unavailable(msg: impl Into<String>) -> Self {
        Self::ServiceUnavailable(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Internal(_) | Self::Anyhow(_) => StatusCode::INTERNAL_SERVER_ERROR,
            #[cfg(feature = "seaorm-store")]
            Self::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::RequestTimeout => StatusCode::REQUEST_TIMEOUT,
            Self::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
        }
    }

    /// Message suitable for client responses.
    ///
    /// Client errors (4xx) expose the actual message; server errors (5xx)
    /// return a generic one and keep the details in the server-side log
    /// (CWE-209).
    fn safe_message(&self) -> String {
        match self {
            Self::NotFound(msg) => format!("Not found: {}", msg),
            Self::BadRequest(msg) => format!("Bad request: {}", msg),
            Self::Unauthorized(msg) => format!("Unauthorized: {}", msg),
            Self::Forbidden(msg) => format!("Forbidden: {}", msg),
            Self::TooManyRequests(msg) => format!("Too many requests: {}", msg),
            Self::RequestTimeout => "Request timeout".to_string(),

            Self::Internal(_) | Self::Anyhow(_) => "Internal server error".to_string(),
            Self::ServiceUnavailable(_) => "Service unavailable".to_string(),
            #[cfg(feature = "seaorm-store")]
            Self::Database(_) => "Database error".to_string(),
        }
    }
}

impl IntoResponse for TollgateError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_id = uuid::Uuid::new_v4().to_string();

        // Full details stay server-side.
        tracing::error!(
            status = status.as_u16(),
            error_id = %error_id,
            error = %self,
            "Request failed"
        );

        let body = Json(ErrorResponse {
            error: self.safe_message(),
            error_id,
        });

        (status, body).into_response()
    }
}

impl From<BillingError> for TollgateError {
    fn from(err: BillingError) -> Self {
        match &err {
            BillingError::AccountNotFound { .. } | BillingError::NoSubscription { .. } => {
                TollgateError::NotFound(err.to_string())
            }

            // Precondition violations and malformed inbound data
            BillingError::TrialAlreadyClaimed { .. }
            | BillingError::IntervalUnchanged { .. }
            | BillingError::InvalidRedirectUrl { .. }
            | BillingError::RedirectDomainNotAllowed { .. }
            | BillingError::InvalidWebhookSignature
            | BillingError::WebhookTimestampExpired { .. }
            | BillingError::InvalidWebhookPayload { .. } => {
                TollgateError::BadRequest(err.to_string())
            }

            // Transient Stripe failures surface as retryable to the caller
            BillingError::StripeUnavailable { .. } => {
                TollgateError::ServiceUnavailable(err.to_string())
            }
            BillingError::StripeApiError { http_status, .. } => match http_status {
                Some(429) | Some(500..=599) | None => {
                    TollgateError::ServiceUnavailable(err.to_string())
                }
                Some(_) => TollgateError::BadRequest(err.to_string()),
            },

            BillingError::UnknownPrice { .. }
            | BillingError::InvalidRecord { .. }
            | BillingError::ConcurrentModification { .. }
            | BillingError::RetryLimitExceeded { .. }
            | BillingError::Internal { .. } => TollgateError::Internal(err.to_string()),
        }
    }
}

#[cfg(feature = "seaorm-store")]
impl From<sea_orm::DbErr> for TollgateError {
    fn from(err: sea_orm::DbErr) -> Self {
        match &err {
            sea_orm::DbErr::RecordNotFound(msg) => TollgateError::NotFound(if msg.is_empty() {
                "Record not found".to_string()
            } else {
                msg.clone()
            }),
            _ => TollgateError::Database(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_error_display() {
        let err = BillingError::TrialAlreadyClaimed {
            user_id: "user_42".to_string(),
        };
        assert_eq!(err.to_string(), "Trial already claimed for user 'user_42'");

        let err = BillingError::StripeApiError {
            operation: "cancel_subscription".to_string(),
            message: "No such subscription".to_string(),
            code: Some("resource_missing".to_string()),
            http_status: Some(404),
        };
        assert_eq!(
            err.to_string(),
            "Stripe API error during 'cancel_subscription': No such subscription \
             (code: resource_missing) [HTTP 404]"
        );
    }

    #[test]
    fn classification() {
        let err = BillingError::TrialAlreadyClaimed {
            user_id: "u".to_string(),
        };
        assert!(err.is_client_error());
        assert!(!err.is_server_error());
        assert!(!err.is_retryable());

        let err = BillingError::ConcurrentModification {
            user_id: "u".to_string(),
        };
        assert!(!err.is_client_error());
        assert!(err.is_server_error());
        assert!(err.is_retryable());

        let err = BillingError::StripeApiError {
            operation: "op".to_string(),
            message: "rate limited".to_string(),
            code: None,
            http_status: Some(429),
        };
        assert!(err.is_retryable());
        assert!(err.is_server_error());
    }

    #[test]
    fn conversion_to_http_error() {
        let err: TollgateError = BillingError::NoSubscription {
            user_id: "u".to_string(),
        }
        .into();
        assert!(matches!(err, TollgateError::NotFound(_)));
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);

        let err: TollgateError = BillingError::InvalidWebhookSignature.into();
        assert!(matches!(err, TollgateError::BadRequest(_)));

        let err: TollgateError = BillingError::StripeUnavailable {
            operation: "create_checkout_session".to_string(),
            message: "connect timeout".to_string(),
        }
        .into();
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let err: TollgateError = BillingError::InvalidRecord {
            reason: "anything".to_string(),
        }
        .into();
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn anyhow_errors_convert() {
        let err: TollgateError = anyhow::anyhow!("boom").into();
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn server_errors_hide_details() {
        let err = TollgateError::internal("connection pool exhausted");
        assert_eq!(err.safe_message(), "Internal server error");

        let err = TollgateError::bad_request("unknown planType 'teams'");
        assert_eq!(err.safe_message(), "Bad request: unknown planType 'teams'");
    }
}
