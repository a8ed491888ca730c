//! # Management API
//!
//! REST endpoints for creating, listing, and deleting tunnel routes, plus
//! the health probe. Listings merge persisted records with live registry
//! state; where a session exists its runtime fields win.

use std::sync::OnceLock;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::auth::AuthUser;
use crate::errors::TunnelError;
use crate::registry::Registry;
use crate::state::AppState;
use crate::store::RouteRecord;

fn route_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{3,64}$").expect("route pattern"))
}

// ─── Request / Response Models ──────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateTunnelRequest {
    pub route: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_public: bool,
}

#[derive(Debug, Serialize)]
pub struct CreateTunnelResponse {
    pub route: String,
    pub token: String,
    pub public_url: String,
    pub ws_url: String,
}

#[derive(Debug, Serialize)]
pub struct TunnelInfo {
    pub route: String,
    pub connected: bool,
    pub created_at: f64,
    pub last_seen: Option<f64>,
    pub description: Option<String>,
    pub is_public: bool,
}

#[derive(Debug, Serialize)]
pub struct ListTunnelsResponse {
    pub tunnels: Vec<TunnelInfo>,
}

#[derive(Debug, Serialize)]
pub struct DeleteTunnelResponse {
    pub route: String,
    pub removed: bool,
}

/// JSON error body with the status the failure maps to.
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "Not found")
    }
}

impl From<TunnelError> for ApiError {
    fn from(err: TunnelError) -> Self {
        let status = match err {
            TunnelError::RouteExists => StatusCode::CONFLICT,
            TunnelError::InvalidRoute => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "detail": self.detail })),
        )
            .into_response()
    }
}

// ─── Handlers ───────────────────────────────────────────────────

/// `GET /health` — liveness probe.
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// `POST /api/tunnels` — reserves a route and mints its token.
///
/// The route name is validated before any state mutates; an existing
/// record or live session means 409.
pub async fn create_tunnel(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(req): Json<CreateTunnelRequest>,
) -> Result<Json<CreateTunnelResponse>, ApiError> {
    if !route_pattern().is_match(&req.route) {
        return Err(TunnelError::InvalidRoute.into());
    }
    if state.store.get_by_route(&req.route).await.is_some() {
        return Err(TunnelError::RouteExists.into());
    }

    let session = state
        .registry
        .create_route(&req.route, req.description.clone())?;
    state
        .store
        .create(RouteRecord::new(
            session.route().to_string(),
            session.token().to_string(),
            req.description,
            user_id,
            req.is_public,
        ))
        .await?;

    info!(route = %req.route, user_id, "tunnel created");
    Ok(Json(CreateTunnelResponse {
        route: session.route().to_string(),
        token: session.token().to_string(),
        public_url: state.settings.public_url(session.route()),
        ws_url: state.settings.ws_url(session.token()),
    }))
}

/// `GET /api/tunnels` — the caller's routes, persisted records merged with
/// live registry state.
pub async fn list_tunnels(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Json<ListTunnelsResponse> {
    let records = state.store.list_for_user(user_id).await;
    let tunnels = records
        .into_iter()
        .map(|record| merge_info(&state.registry, record))
        .collect();
    Json(ListTunnelsResponse { tunnels })
}

/// `GET /api/tunnels/public` — publicly visible routes.
pub async fn list_public_tunnels(State(state): State<AppState>) -> Json<ListTunnelsResponse> {
    let records = state.store.list_public().await;
    let tunnels = records
        .into_iter()
        .map(|record| merge_info(&state.registry, record))
        .collect();
    Json(ListTunnelsResponse { tunnels })
}

/// `DELETE /api/tunnels/{route}` — tears the route down in the registry
/// and removes its record. 404 when neither knew the route.
pub async fn delete_tunnel(
    State(state): State<AppState>,
    AuthUser(_user_id): AuthUser,
    Path(route): Path<String>,
) -> Result<Json<DeleteTunnelResponse>, ApiError> {
    let live = state.registry.delete_route(&route);
    let stored = state.store.delete(&route).await;
    if !live && !stored {
        return Err(ApiError::not_found());
    }
    Ok(Json(DeleteTunnelResponse {
        route,
        removed: true,
    }))
}

fn merge_info(registry: &Registry, record: RouteRecord) -> TunnelInfo {
    match registry.get_session(&record.route) {
        Some(session) => TunnelInfo {
            connected: session.connected(),
            created_at: session.created_at(),
            last_seen: session.last_seen(),
            description: session
                .description()
                .map(str::to_string)
                .or(record.description),
            route: record.route,
            is_public: record.is_public,
        },
        None => TunnelInfo {
            route: record.route,
            connected: false,
            created_at: record.created_at,
            last_seen: record.last_connected_at,
            description: record.description,
            is_public: record.is_public,
        },
    }
}
