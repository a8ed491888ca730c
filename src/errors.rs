//! # Error Types
//!
//! The error taxonomy shared by the registry, sessions, and the HTTP
//! surfaces. Each variant names one failure condition; the ingress and
//! management layers translate them to status codes at the boundary.

use thiserror::Error;

/// Errors raised by the tunnel core.
///
/// `Clone` because a single failure (detach, delete, supersede) fans out
/// to every pending sink on the session.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TunnelError {
    /// A route with this name already exists.
    #[error("Route already exists")]
    RouteExists,

    /// The presented token is unknown or inactive.
    #[error("Invalid token")]
    InvalidToken,

    /// The token validated but its route no longer exists in the registry.
    #[error("Unknown route")]
    RouteGone,

    /// The route has no attached connection.
    #[error("Tunnel not connected")]
    NotConnected,

    /// The pending sink's deadline elapsed before a response arrived.
    #[error("Tunnel timeout")]
    Timeout,

    /// The pending sink was voided by a detach or route deletion.
    #[error("Tunnel disconnected")]
    Disconnected,

    /// The pending sink was voided by a re-attach on the same route.
    #[error("Connection superseded")]
    Superseded,

    /// Writing a frame to the connection failed.
    #[error("Transport error")]
    TransportError,

    /// The response frame could not be rendered as an HTTP response.
    #[error("Malformed response")]
    Malformed,

    /// A correlation id is already present in the pending table.
    #[error("Duplicate correlation id")]
    DuplicateCorrelation,

    /// The route name does not match the allowed pattern.
    #[error("Invalid route name")]
    InvalidRoute,
}
