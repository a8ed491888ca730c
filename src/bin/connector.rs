//! # Tunnel Connector
//!
//! Client-side counterpart of the tunnel server. Attaches to the tunnel
//! WebSocket with a route token, replies to liveness pings, and forwards
//! each incoming `request` frame to a local HTTP server, sending the
//! result back as a `response` frame.
//!
//! ## Connection Lifecycle
//! 1. Connect to the tunnel endpoint via WebSocket
//! 2. Spawn the outbound writer task
//! 3. Dispatch incoming frames (each request handled in its own task)
//! 4. On disconnect, wait with doubling backoff and reconnect

use std::collections::HashMap;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use clap::Parser;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::connect_async;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use routetunnel::protocol::{now_ts, Frame, RequestFrame, ResponseFrame};

/// Longest wait between reconnect attempts.
const MAX_RECONNECT_SECS: u64 = 30;

/// Headers never forwarded to the local server; the local HTTP client
/// frames its own request.
const LOCAL_DROP: [&str; 3] = ["host", "connection", "content-length"];

#[derive(Parser, Debug, Clone)]
#[command(name = "connector", about = "Connects a local HTTP server to a tunnel route")]
struct Args {
    /// Full tunnel WebSocket URL, as returned by route creation.
    #[arg(long, env = "TUNNEL_WS_URL")]
    ws_url: Option<String>,

    /// Tunnel token; combined with --ws-base when --ws-url is not given.
    #[arg(long, env = "TUNNEL_TOKEN")]
    token: Option<String>,

    /// WebSocket base URL of the tunnel server.
    #[arg(long, env = "WS_BASE_URL", default_value = "ws://localhost:8000")]
    ws_base: String,

    /// Base URL of the local server requests are forwarded to.
    #[arg(long, env = "LOCAL_BASE_URL", default_value = "http://127.0.0.1:3000")]
    local_base: String,

    /// Seconds to wait for the local server's response.
    #[arg(long, env = "LOCAL_TIMEOUT", default_value_t = 30.0)]
    local_timeout_secs: f64,
}

impl Args {
    fn endpoint(&self) -> anyhow::Result<String> {
        if let Some(url) = &self.ws_url {
            return Ok(url.clone());
        }
        match &self.token {
            Some(token) => Ok(format!(
                "{}/api/tunnels/ws/tunnel?token={}",
                self.ws_base.trim_end_matches('/'),
                token
            )),
            None => anyhow::bail!("either --ws-url or --token is required"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("connector=info")),
        )
        .init();

    let args = Args::parse();
    let endpoint = args.endpoint()?;
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs_f64(args.local_timeout_secs.max(0.1)))
        .build()?;

    let mut backoff = 1u64;
    loop {
        info!("connecting to {endpoint}");
        match connect_async(&endpoint).await {
            Ok((stream, _)) => {
                info!("connected, forwarding to {}", args.local_base);
                backoff = 1;
                run_connection(stream, &client, &args.local_base).await;
                warn!("tunnel connection closed");
            }
            Err(err) => {
                warn!("connect failed: {err}");
            }
        }
        tokio::time::sleep(Duration::from_secs(backoff)).await;
        backoff = (backoff * 2).min(MAX_RECONNECT_SECS);
    }
}

/// Runs one attached connection until the socket closes.
async fn run_connection(
    stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    client: &reqwest::Client,
    local_base: &str,
) {
    let (mut ws_sink, mut ws_stream) = stream.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = match frame.encode() {
                Ok(text) => text,
                Err(err) => {
                    error!("frame encode failed: {err}");
                    continue;
                }
            };
            if ws_sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = ws_stream.next().await {
        match msg {
            Message::Text(text) => {
                let Some(frame) = Frame::decode(&text) else {
                    continue;
                };
                match frame {
                    Frame::Ping { .. } => {
                        let _ = tx.send(Frame::Pong { ts: now_ts() });
                    }
                    Frame::Request(request) => {
                        // Requests are independent; answer each from its
                        // own task so a slow one does not block the rest.
                        let client = client.clone();
                        let local_base = local_base.to_string();
                        let tx = tx.clone();
                        tokio::spawn(async move {
                            let response = forward_to_local(&client, &local_base, request).await;
                            let _ = tx.send(Frame::Response(response));
                        });
                    }
                    Frame::Pong { .. } | Frame::Response(_) => {}
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    writer.abort();
}

/// Forwards one request frame to the local server. Every failure becomes a
/// synthesized 502 response frame so the public caller always gets an
/// answer.
async fn forward_to_local(
    client: &reqwest::Client,
    local_base: &str,
    request: RequestFrame,
) -> ResponseFrame {
    let correlation_id = request.correlation_id.clone();
    match try_forward(client, local_base, request).await {
        Ok(mut response) => {
            response.correlation_id = correlation_id;
            response
        }
        Err(err) => bad_gateway(correlation_id, &err.to_string()),
    }
}

async fn try_forward(
    client: &reqwest::Client,
    local_base: &str,
    request: RequestFrame,
) -> anyhow::Result<ResponseFrame> {
    let mut target = url::Url::parse(&format!(
        "{}{}",
        local_base.trim_end_matches('/'),
        request.path
    ))?;
    if !request.query.is_empty() {
        let mut pairs = target.query_pairs_mut();
        for (key, values) in &request.query {
            for value in values {
                pairs.append_pair(key, value);
            }
        }
    }

    let method = reqwest::Method::from_bytes(request.method.as_bytes())?;
    let body = match &request.body_b64 {
        Some(b64) => BASE64.decode(b64)?,
        None => Vec::new(),
    };

    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in &request.headers {
        if LOCAL_DROP.contains(&name.as_str()) {
            continue;
        }
        let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::try_from(name.as_str()),
            reqwest::header::HeaderValue::try_from(value.as_str()),
        ) else {
            continue;
        };
        headers.insert(name, value);
    }

    let response = client
        .request(method, target)
        .headers(headers)
        .body(body)
        .send()
        .await?;

    let status_code = response.status().as_u16();
    let mut wire_headers: HashMap<String, String> = HashMap::new();
    for (name, value) in response.headers() {
        let Ok(value) = value.to_str() else { continue };
        wire_headers
            .entry(name.as_str().to_string())
            .and_modify(|joined| {
                joined.push_str(", ");
                joined.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }

    let bytes = response.bytes().await?;
    Ok(ResponseFrame {
        correlation_id: String::new(),
        status_code,
        headers: wire_headers,
        body_b64: if bytes.is_empty() {
            None
        } else {
            Some(BASE64.encode(&bytes))
        },
    })
}

fn bad_gateway(correlation_id: String, detail: &str) -> ResponseFrame {
    ResponseFrame {
        correlation_id,
        status_code: 502,
        headers: HashMap::from([("content-type".to_string(), "text/plain".to_string())]),
        body_b64: Some(BASE64.encode(detail.as_bytes())),
    }
}
