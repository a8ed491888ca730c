//! # RouteTunnel
//!
//! A tunnel service that lets a program behind NAT publish a local HTTP
//! server under a public URL. Users create a named **route** and receive a
//! token; a tunnel client attaches over WebSocket with that token; public
//! requests at `/r/{route}/...` are serialized onto the channel, answered
//! by the remote local server, and relayed back.
//!
//! ## Architecture
//!
//! ```text
//! Public caller ──HTTP──► Ingress ──frame──► Session ──WS──► Connector ──HTTP──► Local Server
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — wire frames (JSON text, `"type"`-tagged)
//! - [`pending`]  — per-session correlation table
//! - [`session`]  — route↔connection binding and send discipline
//! - [`registry`] — route/token indices, lifecycle, liveness pings
//! - [`ingress`]  — public `/r/{route}` forwarding
//! - [`api`]      — management REST endpoints
//! - [`handlers`] — tunnel WebSocket endpoint
//! - [`config`], [`errors`], [`store`], [`auth`], [`state`] — settings,
//!   error taxonomy, persistence and auth contracts, shared state

pub mod api;
pub mod auth;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod ingress;
pub mod pending;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod state;
pub mod store;

use axum::routing::{any, delete, get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Builds the application router: management API, tunnel WebSocket, and
/// public ingress.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .route("/api/tunnels", post(api::create_tunnel).get(api::list_tunnels))
        .route("/api/tunnels/public", get(api::list_public_tunnels))
        .route("/api/tunnels/ws/tunnel", get(handlers::tunnel_ws))
        .route("/api/tunnels/{route}", delete(api::delete_tunnel))
        .route("/r/{route}", any(ingress::forward_root))
        .route("/r/{route}/", any(ingress::forward_root))
        .route("/r/{route}/{*rest}", any(ingress::forward_rest))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
