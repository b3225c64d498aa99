//! Action endpoint handlers.
//!
//! Every response is a JSON envelope: `{"success": true, ...payload}` or
//! `{"success": false, "error": "...", "kind": "..."}`.

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    Json,
};
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::engine::controller::SessionController;
use crate::types::CycleError;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

type TokenDigest = [u8; 32];

/// Bearer tokens accepted by the API, held as SHA-256 digests and matched
/// in constant time.
pub struct TokenAuth {
    users: Vec<(TokenDigest, String)>,
    service: Option<TokenDigest>,
}

fn digest(token: &str) -> TokenDigest {
    Sha256::digest(token.as_bytes()).into()
}

fn digest_eq(a: &TokenDigest, b: &TokenDigest) -> bool {
    bool::from(a[..].ct_eq(&b[..]))
}

/// Who is calling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    User(String),
    Service,
}

impl TokenAuth {
    /// `users` maps token → user id.
    pub fn new(users: HashMap<String, String>, service: Option<SecretString>) -> Self {
        Self {
            users: users.iter().map(|(token, user)| (digest(token), user.clone())).collect(),
            service: service.map(|s| digest(s.expose_secret())),
        }
    }

    /// Parse `user_id=token` pairs separated by commas. Malformed entries
    /// are skipped.
    pub fn parse_user_tokens(raw: &str) -> HashMap<String, String> {
        raw.split(',')
            .filter_map(|pair| {
                let (user, token) = pair.trim().split_once('=')?;
                let (user, token) = (user.trim(), token.trim());
                if user.is_empty() || token.is_empty() {
                    warn!("Skipping malformed user token entry");
                    return None;
                }
                Some((token.to_string(), user.to_string()))
            })
            .collect()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    fn identify(&self, token: &str) -> Option<Caller> {
        let presented = digest(token);
        if self.service.as_ref().is_some_and(|s| digest_eq(s, &presented)) {
            return Some(Caller::Service);
        }
        // Every entry is compared; no early exit on a match.
        let mut found = None;
        for (known, user) in &self.users {
            if digest_eq(known, &presented) {
                found = Some(user);
            }
        }
        found.map(|u| Caller::User(u.clone()))
    }

    /// Resolve the caller from an `Authorization: Bearer` header.
    pub fn authenticate(&self, headers: &HeaderMap) -> Option<Caller> {
        let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
        let token = value.strip_prefix("Bearer ")?.trim();
        if token.is_empty() {
            return None;
        }
        self.identify(token)
    }
}

pub struct ApiState {
    pub controller: Arc<SessionController>,
    pub auth: TokenAuth,
}

pub type AppState = Arc<ApiState>;

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

const ACTIONS: &[&str] = &[
    "set_wallet",
    "create_wallet",
    "status",
    "set_volume",
    "start",
    "stop",
    "run_cycle",
];

#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionRequest {
    SetWallet { private_key: String },
    CreateWallet,
    Status,
    SetVolume { trade_size_sol: Decimal },
    Start,
    Stop,
    RunCycle { target_user_id: String },
}

impl ActionRequest {
    /// Decode a raw request body. Anything that is not a JSON object is an
    /// `invalid_request`.
    fn from_body(body: &[u8]) -> Result<Self, ApiError> {
        let value: Value = serde_json::from_slice(body).map_err(|e| {
            ApiError::new(StatusCode::BAD_REQUEST, format!("Invalid request: {e}"), "invalid_request")
        })?;
        if !value.is_object() {
            return Err(ApiError::new(
                StatusCode::BAD_REQUEST,
                "Invalid request: expected a JSON object",
                "invalid_request",
            ));
        }
        Self::parse(value)
    }

    fn parse(body: Value) -> Result<Self, ApiError> {
        let known = body
            .get("action")
            .and_then(Value::as_str)
            .is_some_and(|a| ACTIONS.contains(&a));
        if !known {
            return Err(ApiError::new(StatusCode::BAD_REQUEST, "Unknown action", "unknown_action"));
        }
        serde_json::from_value(body).map_err(|e| {
            ApiError::new(StatusCode::BAD_REQUEST, format!("Invalid request: {e}"), "invalid_request")
        })
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

type ApiResponse = (StatusCode, Json<Value>);

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    kind: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>, kind: &str) -> Self {
        Self {
            status,
            message: message.into(),
            kind: kind.to_string(),
        }
    }

    fn into_response(self) -> ApiResponse {
        (
            self.status,
            Json(json!({ "success": false, "error": self.message, "kind": self.kind })),
        )
    }
}

impl From<CycleError> for ApiError {
    fn from(e: CycleError) -> Self {
        Self::new(status_for(&e), e.to_string(), e.kind())
    }
}

/// HTTP status for an operation error.
pub fn status_for(e: &CycleError) -> StatusCode {
    match e {
        CycleError::InvalidKey(_)
        | CycleError::InvalidTradeSize { .. }
        | CycleError::InsufficientBalance { .. }
        | CycleError::NoWallet
        | CycleError::AlreadyRunning
        | CycleError::NotRunning => StatusCode::BAD_REQUEST,
        CycleError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        CycleError::VersionConflict(_) => StatusCode::CONFLICT,
        CycleError::NoRoute(_)
        | CycleError::NoSwapTransaction(_)
        | CycleError::SubmissionFailed(_)
        | CycleError::NoTokensAfterBuy
        | CycleError::Upstream { .. } => StatusCode::BAD_GATEWAY,
        CycleError::MalformedTransaction(_) | CycleError::Storage(_) | CycleError::Config(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Merge `success: true` into an object payload.
fn success(payload: Value) -> ApiResponse {
    let mut body = json!({ "success": true });
    if let (Value::Object(target), Value::Object(extra)) = (&mut body, payload) {
        target.extend(extra);
    }
    (StatusCode::OK, Json(body))
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// POST /api/action
pub async fn post_action(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResponse {
    let Some(caller) = state.auth.authenticate(&headers) else {
        return ApiError::new(StatusCode::UNAUTHORIZED, "Unauthorized", "unauthorized").into_response();
    };

    match dispatch(&state.controller, caller, body).await {
        Ok(resp) => resp,
        Err(e) => {
            debug!(kind = %e.kind, error = %e.message, "Action failed");
            e.into_response()
        }
    }
}

async fn dispatch(
    controller: &SessionController,
    caller: Caller,
    body: Bytes,
) -> Result<ApiResponse, ApiError> {
    let request = ActionRequest::from_body(&body)?;

    let user_id = match (&caller, &request) {
        (Caller::Service, ActionRequest::RunCycle { target_user_id }) => {
            let outcome = controller.run_cycle(target_user_id).await?;
            return Ok(success(json!({ "cycle": outcome })));
        }
        (Caller::Service, _) => return Err(forbidden()),
        (Caller::User(user_id), ActionRequest::RunCycle { .. }) => {
            warn!(user_id = %user_id, "User token attempted run_cycle");
            return Err(forbidden());
        }
        (Caller::User(user_id), _) => user_id.as_str(),
    };

    let resp = match request {
        ActionRequest::SetWallet { private_key } => {
            let info = controller.set_wallet(user_id, &private_key).await?;
            success(json!({ "public_key": info.public_key, "balance": info.balance }))
        }
        ActionRequest::CreateWallet => {
            let created = controller.create_wallet(user_id).await?;
            success(json!({
                "public_key": created.public_key,
                "private_key": created.private_key.expose_secret(),
                "balance": created.balance,
            }))
        }
        ActionRequest::Status => {
            let report = controller.status(user_id).await?;
            success(json!({ "session": report.session, "token": report.token }))
        }
        ActionRequest::SetVolume { trade_size_sol } => {
            controller.set_volume(user_id, trade_size_sol).await?;
            success(json!({ "trade_size_sol": trade_size_sol }))
        }
        ActionRequest::Start => {
            let outcome = controller.start(user_id).await?;
            success(json!({ "first_cycle": outcome }))
        }
        ActionRequest::Stop => {
            let summary = controller.stop(user_id).await?;
            success(json!({
                "cycles_completed": summary.cycles_completed,
                "total_volume_usd": summary.total_volume_usd,
            }))
        }
        ActionRequest::RunCycle { .. } => return Err(forbidden()),
    };
    Ok(resp)
}

fn forbidden() -> ApiError {
    ApiError::new(StatusCode::FORBIDDEN, "Forbidden", "forbidden")
}

/// GET /health
pub async fn health() -> StatusCode {
    StatusCode::OK
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
