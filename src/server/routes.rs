//! HTTP routes for the bridge server.
//!
//! Two surfaces: an unauthenticated negotiation/liveness surface, and the
//! API-key-gated signing surface. Every device-mutating call is enqueued
//! and individually approved; sharing an API key never pre-authorizes the
//! next call.

use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    extract::State,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::trace::TraceLayer;

use crate::approval::{ApprovalQueue, RequestKind, RequestOrigin};
use crate::device::{DeviceOperation, DeviceState, DeviceStateController};
use crate::error::{ApprovalError, DeviceError, PairingError};
use crate::pairing::{PairingRecord, PairingStore, PairingType};
use crate::server::auth::require_pairing;

/// Shared state injected into every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<PairingStore>,
    pub queue: ApprovalQueue,
    pub controller: Arc<DeviceStateController>,
}

/// Build the full route tree.
pub fn router(state: AppState) -> Router {
    let authed = Router::new()
        .route("/sign", post(sign))
        .route("/device", get(device_state))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_pairing,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/pairing", post(negotiate_pairing))
        .merge(authed)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
    device: DeviceState,
}

async fn health(State(state): State<AppState>) -> Json<HealthBody> {
    Json(HealthBody {
        status: "ok",
        device: state.controller.current_state(),
    })
}

async fn device_state(State(state): State<AppState>) -> Json<Value> {
    Json(serde_json::json!({ "state": state.controller.current_state() }))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingRequestBody {
    pub service_name: String,
    pub service_home_page: String,
    #[serde(default)]
    pub service_image_url: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PairingResponseBody {
    api_key: String,
    service_name: String,
}

/// Negotiate (or refresh) a pairing.
///
/// The negotiation itself is consent-gated: the request sits in the
/// approval queue until the device owner accepts the service, and only
/// then is a credential minted or re-issued.
async fn negotiate_pairing(
    State(state): State<AppState>,
    Json(body): Json<PairingRequestBody>,
) -> Result<Json<PairingResponseBody>, ApiError> {
    if let Err(err) = url::Url::parse(&body.service_home_page) {
        return Err(ApiError::from(PairingError::InvalidHomePage {
            url: body.service_home_page.clone(),
            reason: err.to_string(),
        }));
    }

    let submitted = state
        .queue
        .enqueue(
            "bridge_pairing",
            serde_json::to_value(&body).unwrap_or(Value::Null),
            RequestOrigin::Pairing {
                service_name: body.service_name.clone(),
            },
            RequestKind::Consent,
        )
        .await?;
    submitted.wait().await?;

    let record = state
        .store
        .upsert(
            &body.service_name,
            &body.service_home_page,
            body.service_image_url.as_deref(),
            PairingType::Direct,
        )
        .await?;

    Ok(Json(PairingResponseBody {
        api_key: record.api_key,
        service_name: record.service_name,
    }))
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignRequestBody {
    /// Coin or chain type, e.g. `Bitcoin` or `Ethereum`.
    pub coin: String,
    /// Signing operation kind; defaults to a transaction signature.
    #[serde(default = "default_sign_method")]
    pub method: String,
    /// Raw input parameters, passed to the device untouched.
    pub params: Value,
}

fn default_sign_method() -> String {
    "sign_transaction".to_string()
}

#[derive(Debug, Serialize)]
struct SignResponseBody {
    result: Value,
}

/// Submit a signing request. Suspends until the owner decides it and the
/// device (once connected) executes it; a disconnected device queues the
/// request instead of failing it.
async fn sign(
    State(state): State<AppState>,
    Extension(pairing): Extension<PairingRecord>,
    Json(body): Json<SignRequestBody>,
) -> Result<Json<SignResponseBody>, ApiError> {
    tracing::info!(
        service = %pairing.service_name,
        coin = %body.coin,
        method = %body.method,
        "signing request received"
    );

    let operation = DeviceOperation::new(
        Some(body.coin.clone()),
        body.method.clone(),
        body.params.clone(),
    );
    let submitted = state
        .queue
        .enqueue(
            body.method,
            body.params,
            RequestOrigin::ApiKey {
                api_key: pairing.api_key,
            },
            RequestKind::Sign(operation),
        )
        .await?;

    let result = submitted.wait().await?;
    Ok(Json(SignResponseBody { result }))
}

/// Error wrapper mapping the core taxonomy onto HTTP statuses with a
/// structured body.
#[derive(Debug)]
pub struct ApiError {
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
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

impl From<ApprovalError> for ApiError {
    fn from(err: ApprovalError) -> Self {
        let status = match &err {
            ApprovalError::Rejected { .. } => StatusCode::FORBIDDEN,
            ApprovalError::Cancelled { .. } => StatusCode::CONFLICT,
            ApprovalError::DecisionTimeout { .. } => StatusCode::REQUEST_TIMEOUT,
            ApprovalError::ConnectTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ApprovalError::QueueFull { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApprovalError::NotFound { .. } => StatusCode::NOT_FOUND,
            ApprovalError::Closed => StatusCode::INTERNAL_SERVER_ERROR,
            ApprovalError::Device(device) => return ApiError::from_device(device, err.to_string()),
        };
        ApiError::new(status, err.to_string())
    }
}

impl ApiError {
    fn from_device(err: &DeviceError, message: String) -> Self {
        let status = match err {
            DeviceError::Unavailable { .. } | DeviceError::ClaimFailed { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            DeviceError::Disconnected | DeviceError::Operation { .. } => StatusCode::BAD_GATEWAY,
        };
        ApiError::new(status, message)
    }
}

impl From<PairingError> for ApiError {
    fn from(err: PairingError) -> Self {
        let status = match &err {
            PairingError::UnknownApiKey => StatusCode::UNAUTHORIZED,
            PairingError::InvalidHomePage { .. } => StatusCode::BAD_REQUEST,
            PairingError::Io(_) | PairingError::Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        ApiError::new(status, err.to_string())
    }
}
