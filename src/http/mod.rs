//! HTTP surface: bearer-identity extraction, the JSON response envelope, and
//! the billing routes.
//!
//! The routes are a plain [`axum::Router`] so hosts can merge or nest them
//! into an existing application.

pub mod auth;
pub mod response;
pub mod routes;

pub use auth::{CurrentUser, Identity, IdentityProvider};
pub use response::ApiResponse;
pub use routes::{billing_router, BillingContext};
