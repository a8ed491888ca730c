//! # Public Ingress
//!
//! Handlers for `ANY /r/{route}[/{path...}]`. An inbound public request is
//! translated to a wire `request` frame, forwarded through the route's
//! session, and the correlated `response` frame is rendered back as the
//! HTTP response. Forwarded requests are never retried; they may be
//! non-idempotent.

use std::collections::HashMap;

use axum::body::{Body, Bytes};
use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::debug;

use crate::errors::TunnelError;
use crate::protocol::{RequestPayload, ResponseFrame};
use crate::state::AppState;

/// Hop-by-hop headers stripped in both directions. They describe the edge
/// hop, not the origin request.
const HOP_BY_HOP: [&str; 7] = [
    "transfer-encoding",
    "upgrade",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
];

/// Additionally stripped from forwarded requests.
const EDGE_ONLY: [&str; 2] = ["host", "connection"];

/// `ANY /r/{route}` — forwards to the tunnel root path.
pub async fn forward_root(
    State(state): State<AppState>,
    Path(route): Path<String>,
    method: Method,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    forward(state, route, String::new(), method, raw_query, headers, body).await
}

/// `ANY /r/{route}/{*rest}` — forwards to a sub-path.
pub async fn forward_rest(
    State(state): State<AppState>,
    Path((route, rest)): Path<(String, String)>,
    method: Method,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    forward(state, route, rest, method, raw_query, headers, body).await
}

async fn forward(
    state: AppState,
    route: String,
    rest: String,
    method: Method,
    raw_query: Option<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let payload = build_payload(&method, &rest, raw_query.as_deref(), &headers, &body);
    let timeout = state.settings.tunnel_timeout();
    match state.registry.send_ingress(&route, payload, timeout).await {
        Ok(frame) => render_response(frame).unwrap_or_else(error_response),
        Err(err) => {
            debug!(route = %route, error = %err, "ingress failed");
            error_response(err)
        }
    }
}

/// Translates the inbound request parts into a wire payload.
fn build_payload(
    method: &Method,
    rest: &str,
    raw_query: Option<&str>,
    headers: &HeaderMap,
    body: &Bytes,
) -> RequestPayload {
    let path = if rest.is_empty() {
        "/".to_string()
    } else {
        format!("/{rest}")
    };

    let mut query: HashMap<String, Vec<String>> = HashMap::new();
    if let Some(raw) = raw_query {
        for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
            query
                .entry(key.into_owned())
                .or_default()
                .push(value.into_owned());
        }
    }

    let mut wire_headers: HashMap<String, String> = HashMap::new();
    for (name, value) in headers.iter() {
        let name = name.as_str();
        if EDGE_ONLY.contains(&name) || HOP_BY_HOP.contains(&name) {
            continue;
        }
        let Ok(value) = value.to_str() else { continue };
        wire_headers
            .entry(name.to_string())
            .and_modify(|joined| {
                joined.push_str(", ");
                joined.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }

    RequestPayload {
        method: method.as_str().to_string(),
        path,
        query,
        headers: wire_headers,
        body_b64: if body.is_empty() {
            None
        } else {
            Some(BASE64.encode(body))
        },
    }
}

/// Renders a wire `response` frame as an HTTP response. Fails with
/// `Malformed` when the status code is invalid, the body is not valid
/// base64, or a header does not fit the HTTP model.
fn render_response(frame: ResponseFrame) -> Result<Response, TunnelError> {
    let status = StatusCode::from_u16(frame.status_code).map_err(|_| TunnelError::Malformed)?;
    let body = match frame.body_b64 {
        Some(b64) => BASE64.decode(b64).map_err(|_| TunnelError::Malformed)?,
        None => Vec::new(),
    };

    let mut builder = Response::builder().status(status);
    for (name, value) in frame.headers {
        let lowered = name.to_ascii_lowercase();
        // The edge frames the body itself, so the client's framing headers
        // must not leak through.
        if HOP_BY_HOP.contains(&lowered.as_str())
            || lowered == "connection"
            || lowered == "content-length"
        {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from(body))
        .map_err(|_| TunnelError::Malformed)
}

fn error_response(err: TunnelError) -> Response {
    let status = match err {
        TunnelError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::BAD_GATEWAY,
    };
    (status, err.to_string()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::{HeaderName, HeaderValue};

    #[test]
    fn path_never_includes_route_prefix() {
        let payload = build_payload(&Method::GET, "", None, &HeaderMap::new(), &Bytes::new());
        assert_eq!(payload.path, "/");

        let payload = build_payload(
            &Method::GET,
            "api/v1/items",
            None,
            &HeaderMap::new(),
            &Bytes::new(),
        );
        assert_eq!(payload.path, "/api/v1/items");
    }

    #[test]
    fn query_preserves_order_and_duplicates() {
        let payload = build_payload(
            &Method::GET,
            "",
            Some("a=1&a=2&b=3"),
            &HeaderMap::new(),
            &Bytes::new(),
        );
        assert_eq!(payload.query["a"], vec!["1", "2"]);
        assert_eq!(payload.query["b"], vec!["3"]);
    }

    #[test]
    fn headers_are_lowered_joined_and_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert("Accept", HeaderValue::from_static("text/plain"));
        headers.append("X-Tag", HeaderValue::from_static("one"));
        headers.append("X-Tag", HeaderValue::from_static("two"));
        headers.insert("Host", HeaderValue::from_static("edge.example.com"));
        headers.insert("Connection", HeaderValue::from_static("keep-alive"));
        headers.insert(
            HeaderName::from_static("transfer-encoding"),
            HeaderValue::from_static("chunked"),
        );

        let payload = build_payload(&Method::GET, "", None, &headers, &Bytes::new());
        assert_eq!(payload.headers["accept"], "text/plain");
        assert_eq!(payload.headers["x-tag"], "one, two");
        assert!(!payload.headers.contains_key("host"));
        assert!(!payload.headers.contains_key("connection"));
        assert!(!payload.headers.contains_key("transfer-encoding"));
    }

    #[test]
    fn empty_body_is_absent() {
        let payload = build_payload(&Method::POST, "", None, &HeaderMap::new(), &Bytes::new());
        assert_eq!(payload.body_b64, None);

        let payload = build_payload(
            &Method::POST,
            "",
            None,
            &HeaderMap::new(),
            &Bytes::from_static(b"hi"),
        );
        assert_eq!(payload.body_b64.as_deref(), Some("aGk="));
    }

    #[test]
    fn response_renders_verbatim_minus_framing() {
        let frame = ResponseFrame {
            correlation_id: "c1".into(),
            status_code: 201,
            headers: HashMap::from([
                ("Content-Type".to_string(), "text/plain".to_string()),
                ("Transfer-Encoding".to_string(), "chunked".to_string()),
            ]),
            body_b64: Some(BASE64.encode(b"hi")),
        };
        let response = render_response(frame).unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/plain"
        );
        assert!(response.headers().get("transfer-encoding").is_none());
    }

    #[test]
    fn invalid_status_is_malformed() {
        let frame = ResponseFrame {
            correlation_id: "c1".into(),
            status_code: 42,
            headers: HashMap::new(),
            body_b64: None,
        };
        assert_eq!(render_response(frame).unwrap_err(), TunnelError::Malformed);
    }

    #[test]
    fn bad_base64_is_malformed() {
        let frame = ResponseFrame {
            correlation_id: "c1".into(),
            status_code: 200,
            headers: HashMap::new(),
            body_b64: Some("not base64!!".into()),
        };
        assert_eq!(render_response(frame).unwrap_err(), TunnelError::Malformed);
    }

    #[test]
    fn binary_bodies_round_trip() {
        let bytes: Vec<u8> = (0..=255u8).collect();
        let frame = ResponseFrame {
            correlation_id: "c1".into(),
            status_code: 200,
            headers: HashMap::new(),
            body_b64: Some(BASE64.encode(&bytes)),
        };
        assert!(render_response(frame).is_ok());

        let payload = build_payload(
            &Method::POST,
            "",
            None,
            &HeaderMap::new(),
            &Bytes::from(bytes.clone()),
        );
        assert_eq!(
            BASE64.decode(payload.body_b64.unwrap()).unwrap(),
            bytes
        );
    }

    #[test]
    fn failures_map_to_gateway_statuses() {
        assert_eq!(
            error_response(TunnelError::NotConnected).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            error_response(TunnelError::Timeout).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            error_response(TunnelError::Superseded).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            error_response(TunnelError::Malformed).status(),
            StatusCode::BAD_GATEWAY
        );
    }
}
