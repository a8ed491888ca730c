//! # Tunnel Protocol Messages
//!
//! Defines the frames exchanged between the server and tunnel clients over
//! the WebSocket channel. Frames are JSON text messages using serde's
//! internally-tagged representation (`"type": "..."` field).
//!
//! Four frame types exist: `ping` and `pong` for liveness, `request` and
//! `response` for forwarded HTTP traffic. Bodies travel as standard base64
//! with padding; a missing or `null` `body_b64` means an empty body.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// A forwarded HTTP request, addressed by correlation id.
///
/// Header names are lower-cased on the wire and multi-value headers are
/// joined by `", "` before serialization, so values are single strings.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RequestFrame {
    pub correlation_id: String,
    pub method: String,
    /// Always begins with `/` and never includes the `/r/{route}` prefix.
    pub path: String,
    #[serde(default)]
    pub query: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body_b64: Option<String>,
}

/// The client's reply to a [`RequestFrame`], carrying the same
/// correlation id.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ResponseFrame {
    pub correlation_id: String,
    pub status_code: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body_b64: Option<String>,
}

/// All frames in the tunnel protocol.
///
/// The `#[serde(tag = "type")]` attribute serializes each variant as a JSON
/// object with a `"type"` field holding the snake_case variant name, e.g.
/// `{"type": "ping", "ts": 1700000000.0}`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Server-initiated liveness probe.
    Ping { ts: f64 },

    /// Client's reply to a `ping`.
    Pong { ts: f64 },

    /// Forwarded public HTTP request, server to client.
    Request(RequestFrame),

    /// The client's HTTP response, client to server.
    Response(ResponseFrame),
}

impl Frame {
    /// Decodes a text frame.
    ///
    /// Returns `None` for non-JSON input, for objects without a string
    /// `type` field, for unknown frame types, and for known types whose
    /// fields do not parse. Callers drop `None` frames and keep reading;
    /// a bad frame never tears down the connection.
    pub fn decode(text: &str) -> Option<Frame> {
        let value: serde_json::Value = serde_json::from_str(text).ok()?;
        value.get("type")?.as_str()?;
        serde_json::from_value(value).ok()
    }

    /// Encodes the frame as a JSON text payload.
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// The translated parts of an inbound public request, before a correlation
/// id is assigned.
#[derive(Debug, Clone, Default)]
pub struct RequestPayload {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, Vec<String>>,
    pub headers: HashMap<String, String>,
    pub body_b64: Option<String>,
}

impl RequestPayload {
    /// Stamps the payload with its server-assigned correlation id.
    pub fn into_frame(self, correlation_id: String) -> RequestFrame {
        RequestFrame {
            correlation_id,
            method: self.method,
            path: self.path,
            query: self.query,
            headers: self.headers,
            body_b64: self.body_b64,
        }
    }
}

/// Current wall time as Unix seconds, the timestamp format used in `ping`
/// frames and session metadata.
pub fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Mints a 128-bit random identifier as 32 lowercase hex characters.
/// Used for tunnel tokens and correlation ids.
pub fn mint_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
