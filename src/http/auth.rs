//! Bearer-token authentication for the billing routes.
//!
//! Identity management lives outside this crate. Routes resolve the caller
//! through an injected [`IdentityProvider`]; the [`CurrentUser`] extractor
//! rejects requests that carry no valid bearer token.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{extract::FromRequestParts, http::request::Parts};

use crate::error::{Result, TollgateError};

/// The resolved caller of an authenticated request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub email: Option<String>,
}

/// Resolves bearer tokens to identities.
///
/// Implementations typically delegate to the application's session or token
/// service.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Verify a bearer token and return the identity it belongs to.
    ///
    /// # Errors
    /// Returns `TollgateError::Unauthorized` for unknown or expired tokens.
    async fn verify_bearer(&self, token: &str) -> Result<Identity>;
}

/// Axum extractor for the authenticated caller.
///
/// The request is rejected with 401 if the Authorization header is missing,
/// malformed, or fails verification.
///
/// # Example
///
/// ```rust,ignore
/// async fn handler(CurrentUser(identity): CurrentUser) -> String {
///     format!("User ID: {}", identity.user_id)
/// }
/// ```
pub struct CurrentUser(pub Identity);

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = TollgateError;

    fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> impl Future<Output = std::result::Result<Self, Self::Rejection>> + Send {
        Box::pin(async move {
            // The identity provider is injected into request extensions by
            // the router assembly.
            let provider = parts
                .extensions
                .get::<Arc<dyn IdentityProvider>>()
                .ok_or_else(|| {
                    TollgateError::internal("Identity provider not found in request extensions")
                })?
                .clone();

            let token = bearer_token(parts)?;
            let identity = provider.verify_bearer(&token).await?;

            Ok(CurrentUser(identity))
        })
    }
}

/// Extract the bearer token from the Authorization header.
fn bearer_token(parts: &Parts) -> Result<String> {
    let header = parts
        .headers
        .get(axum::http::header::AUTHORIZATION)
        .ok_or_else(|| TollgateError::unauthorized("Missing Authorization header"))?;

    let value = header
        .to_str()
        .map_err(|_| TollgateError::unauthorized("Invalid Authorization header"))?;

    let token = value
        .strip_prefix("Bearer ")
        .ok_or_else(|| TollgateError::unauthorized("Expected a Bearer token"))?
        .trim();

    if token.is_empty() {
        return Err(TollgateError::unauthorized("Empty Bearer token"));
    }

    Ok(token.to_string())
}

/// Fixed token-to-identity mapping for tests and local development.
#[cfg(any(test, feature = "test-billing"))]
pub mod test {
    use super::*;
    use std::collections::HashMap;

    /// Identity provider backed by a static token table.
    #[derive(Debug, Default, Clone)]
    pub struct StaticTokenIdentity {
        tokens: HashMap<String, Identity>,
    }

    impl StaticTokenIdentity {
        /// Create an empty provider; every token is rejected.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Register a token for a user.
        #[must_use]
        pub fn with_user(
            mut self,
            token: impl Into<String>,
            user_id: impl Into<String>,
            email: Option<&str>,
        ) -> Self {
            self.tokens.insert(
                token.into(),
                Identity {
                    user_id: user_id.into(),
                    email: email.map(str::to_string),
                },
            );
            self
        }
    }

    #[async_trait]
    impl IdentityProvider for StaticTokenIdentity {
        async fn verify_bearer(&self, token: &str) -> Result<Identity> {
            self.tokens
                .get(token)
                .cloned()
                .ok_or_else(|| TollgateError::unauthorized("Invalid or expired token"))
        }
    }
}
