//! Webhook tests over the full HTTP surface.
//!
//! Events are signed the way Stripe signs them and posted to
//! `/billing/webhook`; assertions read both the HTTP envelope and the state
//! the events leave behind, including what `/subscription` reports afterward.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use chrono::Utc;
use http_body_util::BodyExt;
use serde_json::json;
use tower::ServiceExt;

use tollgate::{
    billing_router, sign_payload, AccountRecord, AccountStore, BillingContext, BillingInterval,
    CheckoutConfig, CheckoutManager, InMemoryAccountStore, MockStripeCheckoutClient,
    MockStripeSubscriptionClient, Plan, PlanCatalog, StaticTokenIdentity, SubscriptionManager,
    WebhookProcessor, DEFAULT_TRIAL_DAYS,
};

const SECRET: &str = "whsec_http_test";
const TOKEN: &str = "token_user_1";

// =============================================================================
// Fixture
// =============================================================================

struct App {
    router: Router,
    store: InMemoryAccountStore,
}

fn app() -> App {
    let store = InMemoryAccountStore::new();
    let catalog = PlanCatalog::builder()
        .personal_monthly("price_pm")
        .personal_annual("price_pa")
        .enterprise_monthly("price_em")
        .enterprise_annual("price_ea")
        .build()
        .unwrap();
    let checkout = CheckoutManager::new(
        store.clone(),
        MockStripeCheckoutClient::new(),
        catalog.clone(),
        CheckoutConfig::new(
            "https://app.example.com/success",
            "https://app.example.com/cancel",
        ),
    )
    .unwrap();
    let subscriptions = SubscriptionManager::new(
        store.clone(),
        MockStripeSubscriptionClient::new(),
        catalog.clone(),
    );
    let webhooks = WebhookProcessor::new(store.clone(), SECRET, catalog);
    let identity =
        Arc::new(StaticTokenIdentity::new().with_user(TOKEN, "user_1", Some("user_1@example.com")));
    let context = BillingContext::new(checkout, subscriptions, webhooks, identity);
    App {
        router: billing_router(context),
        store,
    }
}

async fn read_json(response: axum::response::Response) -> (StatusCode, serde_json::Value) {
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, json)
}

async fn post_raw(
    router: &Router,
    payload: Vec<u8>,
    signature: &str,
) -> (StatusCode, serde_json::Value) {
    let request = Request::builder()
        .method("POST")
        .uri("/billing/webhook")
        .header("Stripe-Signature", signature)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(payload))
        .unwrap();
    read_json(router.clone().oneshot(request).await.unwrap()).await
}

async fn post_signed(router: &Router, event: &serde_json::Value) -> (StatusCode, serde_json::Value) {
    let payload = serde_json::to_vec(event).unwrap();
    let signature = sign_payload(SECRET, &payload, Utc::now().timestamp());
    post_raw(router, payload, &signature).await
}

async fn get_subscription(router: &Router) -> (StatusCode, serde_json::Value) {
    let request = Request::builder()
        .method("GET")
        .uri("/subscription")
        .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
        .body(Body::empty())
        .unwrap();
    read_json(router.clone().oneshot(request).await.unwrap()).await
}

fn checkout_completed_event(event_id: &str) -> serde_json::Value {
    json!({
        "id": event_id,
        "type": "checkout.session.completed",
        "created": Utc::now().timestamp(),
        "data": { "object": {
            "id": "cs_test_1",
            "customer": "cus_1",
            "subscription": "sub_1",
            "metadata": {
                "user_id": "user_1",
                "plan_tier": "personal",
                "billing_interval": "monthly",
                "trial": "false",
            },
        }},
    })
}

fn subscription_deleted_event(event_id: &str, subscription_id: &str) -> serde_json::Value {
    json!({
        "id": event_id,
        "type": "customer.subscription.deleted",
        "created": Utc::now().timestamp(),
        "data": { "object": {
            "id": subscription_id,
            "customer": "cus_1",
            "status": "canceled",
            "metadata": {},
        }},
    })
}

// =============================================================================
// Delivery and verification
// =============================================================================

#[tokio::test]
async fn signed_checkout_event_upgrades_and_is_visible_over_http() {
    let app = app();

    // Webhook delivery carries no bearer token; the signature is the auth.
    let (status, body) = post_signed(&app.router, &checkout_completed_event("evt_1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["message"], "Event processed");

    let (status, body) = get_subscription(&app.router).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["plan"], "premium");
    assert_eq!(body["data"]["billingInterval"], "monthly");
    // The mock Stripe knows no such subscription; the detail read treats
    // that as a pending deletion, not an error.
    assert!(body["data"]["subscription"].is_null());
}

#[tokio::test]
async fn replayed_event_is_acknowledged_without_reapplying() {
    let app = app();
    let event = checkout_completed_event("evt_once");

    let (status, body) = post_signed(&app.router, &event).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Event processed");
    let version_after_first = app
        .store
        .get_account("user_1")
        .await
        .unwrap()
        .unwrap()
        .version;

    let (status, body) = post_signed(&app.router, &event).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Event already processed");
    let version_after_second = app
        .store
        .get_account("user_1")
        .await
        .unwrap()
        .unwrap()
        .version;
    assert_eq!(version_after_first, version_after_second);
}

#[tokio::test]
async fn tampered_payload_is_rejected() {
    let app = app();
    let payload = serde_json::to_vec(&checkout_completed_event("evt_bad")).unwrap();
    let signature = sign_payload(SECRET, &payload, Utc::now().timestamp());

    let mut tampered = payload.clone();
    let last = tampered.len() - 2;
    tampered[last] = b' ';

    let (status, body) = post_raw(&app.router, tampered, &signature).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let error = body["error"].as_str().unwrap();
    assert!(error.starts_with("Bad request"), "unexpected error: {error}");
    assert!(app.store.get_account("user_1").await.unwrap().is_none());
}

#[tokio::test]
async fn stale_signature_is_rejected() {
    let app = app();
    let payload = serde_json::to_vec(&checkout_completed_event("evt_old")).unwrap();
    let signature = sign_payload(SECRET, &payload, Utc::now().timestamp() - 600);

    let (status, body) = post_raw(&app.router, payload, &signature).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]
        .as_str()
        .unwrap()
        .contains("timestamp expired"));
}

#[tokio::test]
async fn unknown_event_kind_is_ignored_every_time() {
    let app = app();
    let event = json!({
        "id": "evt_charge",
        "type": "charge.succeeded",
        "created": Utc::now().timestamp(),
        "data": { "object": { "id": "ch_1" } },
    });

    let (status, body) = post_signed(&app.router, &event).await;
    assert_eq!(status, StatusCode::OK);
    let message = body["message"].as_str().unwrap();
    assert!(message.contains("ignored"), "unexpected message: {message}");

    // Ignored events are never marked processed, so a redelivery reports
    // the same outcome instead of "already processed".
    let (status, body) = post_signed(&app.router, &event).await;
    assert_eq!(status, StatusCode::OK);
    let message = body["message"].as_str().unwrap();
    assert!(message.contains("ignored"), "unexpected message: {message}");
}

// =============================================================================
// State transitions visible over the API
// =============================================================================

#[tokio::test]
async fn deleted_event_downgrades_the_account_over_http() {
    let app = app();
    let mut record = AccountRecord::new("user_1", DEFAULT_TRIAL_DAYS);
    record.plan = Plan::Premium;
    record.subscription_id = Some("sub_1".to_string());
    record.customer_id = Some("cus_1".to_string());
    record.billing_interval = Some(BillingInterval::Monthly);
    app.store.save_account(&record).await.unwrap();

    let (status, body) = post_signed(
        &app.router,
        &subscription_deleted_event("evt_del", "sub_1"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Event processed");

    let (status, body) = get_subscription(&app.router).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["plan"], "free");
    assert!(body["data"]["subscription"].is_null());

    let stored = app.store.get_account("user_1").await.unwrap().unwrap();
    assert!(stored.deletion_scheduled_date.is_some());
}
