//! HTTP surface
//!
//! The webhook endpoint plus the authenticated user-facing API. Every
//! non-2xx response uses the uniform `{"error": "..."}` shape, and internal
//! failures never leak gateway payloads or stack traces to clients. The
//! webhook body is passed to the dispatcher byte for byte; re-serializing it
//! would break signature verification.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::error;

use tokenbill_core::errors::BillingError;
use tokenbill_core::gateway::{CheckoutMode, CheckoutSessionRequest};
use tokenbill_core::ledger::ConsumeMode;
use tokenbill_core::store::StoreError;

use crate::auth::Claims;
use crate::state::AppState;

/// Header carrying the gateway-computed signature of the raw body.
pub const SIGNATURE_HEADER: &str = "pg-signature";

/// Build the service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/webhooks/pg", post(webhook))
        .route("/api/purchases", post(create_purchase))
        .route("/api/subscription/cancel", post(cancel_subscription))
        .route("/api/balance", get(balance))
        .route("/api/tokens/consume", post(consume_tokens))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Uniform error body for every non-2xx response.
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match &err {
            BillingError::BadSignature(_) => Self::bad_request("bad signature"),
            BillingError::MalformedEvent(_) => Self::bad_request("malformed event payload"),
            BillingError::InsufficientTokens {
                requested,
                available,
            } => Self::new(
                StatusCode::CONFLICT,
                format!("insufficient tokens: requested {requested}, available {available}"),
            ),
            BillingError::Storage(StoreError::UserDeleted(_)) => {
                Self::new(StatusCode::FORBIDDEN, "account is closed")
            }
            _ => {
                // Retriable internals: log the detail, return an opaque 500.
                error!(%err, "internal failure surfaced to client");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
        }
    }
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Claims, ApiError> {
    let authorization = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    state
        .auth
        .verify_bearer(authorization)
        .map_err(ApiError::unauthorized)
}

/// Ensure the caller's user row exists (first authenticated interaction
/// creates it) and return the user id.
fn ensure_user(state: &AppState, claims: &Claims) -> Result<String, ApiError> {
    let exists = state
        .store
        .read(|tx| tx.user(&claims.sub).is_some());
    if exists {
        return Ok(claims.sub.clone());
    }
    let Some(email) = claims.email.clone() else {
        return Err(ApiError::bad_request(
            "token carries no email; cannot create account",
        ));
    };
    state
        .store
        .transaction::<_, StoreError>(|tx| {
            tx.upsert_user_by_external_id(&claims.sub, &email)?;
            Ok(())
        })
        .map_err(|e| ApiError::from(BillingError::Storage(e)))?;
    Ok(claims.sub.clone())
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let receipt = state
        .dispatcher
        .handle_webhook(&body, signature, Utc::now())
        .await?;
    Ok(Json(json!({
        "received": true,
        "event_id": receipt.event_id,
    })))
}

#[derive(Debug, Deserialize)]
struct PurchaseRequest {
    plan_type: String,
    plan_option: String,
}

#[derive(Debug, Serialize)]
struct PurchaseResponse {
    url: String,
}

async fn create_purchase(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<PurchaseRequest>,
) -> Result<Json<PurchaseResponse>, ApiError> {
    let claims = authenticate(&state, &headers)?;
    let user_id = ensure_user(&state, &claims)?;

    let (mode, plan_key) = match request.plan_type.as_str() {
        "tokens" => {
            let pack = state
                .catalog
                .token_price_by_tier(&request.plan_option)
                .map_err(|_| {
                    ApiError::bad_request(format!("unknown token pack \"{}\"", request.plan_option))
                })?;
            (CheckoutMode::Payment, pack.plan_key.clone())
        }
        "subscription" => {
            let price = state
                .catalog
                .subscription_price(&request.plan_option)
                .map_err(|_| {
                    ApiError::bad_request(format!("unknown plan \"{}\"", request.plan_option))
                })?;
            (CheckoutMode::Subscription, price.plan_key.clone())
        }
        other => {
            return Err(ApiError::bad_request(format!(
                "unknown plan_type \"{other}\""
            )))
        }
    };

    let session_request = CheckoutSessionRequest {
        mode,
        plan_key,
        user_id: user_id.clone(),
        plan_option: request.plan_option,
        success_url: format!("{}/billing/success", state.config.site_domain),
        cancel_url: format!("{}/billing/cancelled", state.config.site_domain),
        customer_email: claims.email,
    };
    let link = tokio::time::timeout(
        state.config.pg_call_deadline,
        state.gateway.create_checkout_session(&session_request),
    )
    .await
    .map_err(|_| BillingError::DeadlineExceeded("creating checkout session"))?
    .map_err(BillingError::Gateway)?;

    Ok(Json(PurchaseResponse { url: link.url }))
}

async fn cancel_subscription(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let claims = authenticate(&state, &headers)?;
    let user_id = ensure_user(&state, &claims)?;

    let Some(subscription) = state
        .store
        .read(|tx| tx.latest_active_subscription(&user_id).cloned())
    else {
        return Err(ApiError::new(
            StatusCode::NOT_FOUND,
            "no active subscription",
        ));
    };

    tokio::time::timeout(
        state.config.pg_call_deadline,
        state
            .gateway
            .cancel_at_period_end(&subscription.pg_subscription_id),
    )
    .await
    .map_err(|_| BillingError::DeadlineExceeded("cancelling subscription"))?
    .map_err(BillingError::Gateway)?;

    // Local state stays untouched until the deletion event arrives.
    Ok(Json(json!({
        "message": "subscription will end at the close of the current billing period"
    })))
}

async fn balance(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let claims = authenticate(&state, &headers)?;
    let user_id = ensure_user(&state, &claims)?;
    let balance = state.store.balance(&user_id, Utc::now());
    Ok(Json(json!({ "balance": balance })))
}

#[derive(Debug, Deserialize)]
struct ConsumeRequest {
    amount: u64,
    #[serde(default)]
    reason: Option<String>,
}

async fn consume_tokens(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ConsumeRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let claims = authenticate(&state, &headers)?;
    let user_id = ensure_user(&state, &claims)?;
    if request.amount == 0 {
        return Err(ApiError::bad_request("amount must be positive"));
    }

    let now = Utc::now();
    let purpose = request.reason.unwrap_or_else(|| "api_call".into());
    let consumed = state
        .ledger
        .consume(&user_id, request.amount, &purpose, ConsumeMode::AllOrNothing, now)?;

    Ok(Json(json!({
        "consumed": consumed,
        "balance": state.store.balance(&user_id, now),
    })))
}
