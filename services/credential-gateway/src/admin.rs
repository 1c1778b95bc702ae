//! Admin API
//!
//! Operational endpoints for breakers, pools, the credential cache and
//! individual instances. When an admin token is configured every route
//! requires `Authorization: Bearer <token>`, compared in constant time.

use axum::Router;
use axum::extract::{Path, Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use oauth_provider::RefreshErrorKind;
use resilience::CircuitState;
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tracing::{info, warn};
use uuid::Uuid;

use crate::app::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/admin/circuit-breakers", get(list_breakers))
        .route("/admin/circuit-breakers/reset", post(reset_all_breakers))
        .route("/admin/circuit-breakers/{name}/reset", post(reset_breaker))
        .route("/admin/circuit-breakers/{name}/state", post(force_breaker_state))
        .route("/admin/pools", get(list_pools))
        .route("/admin/cache", get(cache_statistics))
        .route("/admin/instances/{id}", get(describe_instance))
        .route(
            "/admin/instances/{id}/cache",
            axum::routing::delete(evict_instance),
        )
        .route("/admin/instances/{id}/refresh", post(refresh_instance))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_admin_token,
        ))
        .with_state(state)
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    json_response(status, serde_json::json!({ "error": message.into() }))
}

async fn require_admin_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = &state.admin_token else {
        return next.run(request).await;
    };
    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match presented {
        Some(token) if token_matches(token, expected.expose()) => next.run(request).await,
        _ => {
            warn!(path = %request.uri().path(), "admin request rejected");
            error_response(StatusCode::UNAUTHORIZED, "admin token required")
        }
    }
}

fn token_matches(presented: &str, expected: &str) -> bool {
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}

fn parse_instance_id(raw: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(raw)
        .map_err(|_| error_response(StatusCode::BAD_REQUEST, format!("invalid instance id: {raw}")))
}

fn status_code(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

async fn list_breakers(State(state): State<AppState>) -> Response {
    json_response(
        StatusCode::OK,
        serde_json::json!({ "circuit_breakers": state.breakers.statuses() }),
    )
}

async fn reset_all_breakers(State(state): State<AppState>) -> Response {
    let reset = state.breakers.reset_all();
    json_response(
        StatusCode::OK,
        serde_json::json!({ "reset": reset, "circuit_breakers": state.breakers.statuses() }),
    )
}

async fn reset_breaker(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    let Some(breaker) = state.breakers.get(&name) else {
        return error_response(StatusCode::NOT_FOUND, format!("unknown circuit breaker: {name}"));
    };
    breaker.reset();
    info!(breaker = %name, "circuit breaker reset by admin");
    json_response(StatusCode::OK, serde_json::json!(breaker.status()))
}

#[derive(Debug, Deserialize)]
struct ForceStateRequest {
    state: String,
}

async fn force_breaker_state(
    State(state): State<AppState>,
    Path(name): Path<String>,
    axum::Json(body): axum::Json<ForceStateRequest>,
) -> Response {
    let target: CircuitState = match body.state.parse() {
        Ok(s) => s,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };
    let Some(breaker) = state.breakers.get(&name) else {
        return error_response(StatusCode::NOT_FOUND, format!("unknown circuit breaker: {name}"));
    };
    breaker.force_state(target);
    info!(breaker = %name, state = %target, "circuit breaker state forced by admin");
    json_response(StatusCode::OK, serde_json::json!(breaker.status()))
}

async fn list_pools(State(state): State<AppState>) -> Response {
    json_response(
        StatusCode::OK,
        serde_json::json!({ "connection_pools": state.pools.health() }),
    )
}

async fn cache_statistics(State(state): State<AppState>) -> Response {
    json_response(StatusCode::OK, serde_json::json!(state.cache.statistics()))
}

/// Resolve an instance and describe the credential without exposing it.
async fn describe_instance(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let instance_id = match parse_instance_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.resolver.resolve(instance_id).await {
        Ok(credential) => json_response(
            StatusCode::OK,
            serde_json::json!({
                "instance_id": credential.instance_id,
                "user_id": credential.user_id,
                "expires_at": credential.expires_at,
                "source": credential.source,
            }),
        ),
        Err(e) => error_response(status_code(e.http_status()), e.to_string()),
    }
}

async fn evict_instance(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let instance_id = match parse_instance_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let removed = state.cache.remove(&instance_id).await;
    json_response(StatusCode::OK, serde_json::json!({ "removed": removed }))
}

async fn refresh_instance(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let instance_id = match parse_instance_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.resolver.force_refresh(instance_id).await {
        Ok(result) => {
            let status = match &result.error {
                None => StatusCode::OK,
                Some(failure) if failure.requires_reauth => StatusCode::UNAUTHORIZED,
                Some(failure)
                    if matches!(
                        failure.error_type,
                        RefreshErrorKind::NetworkError | RefreshErrorKind::ServiceUnavailable
                    ) =>
                {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                Some(_) => StatusCode::BAD_GATEWAY,
            };
            json_response(status, serde_json::json!(result))
        }
        Err(e) => error_response(status_code(e.http_status()), e.to_string()),
    }
}
