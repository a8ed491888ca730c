//! # Configuration
//!
//! Environment-driven settings, parsed with clap so every value is also
//! available as a command-line flag. Durations are given as float seconds
//! to match the original deployment's environment files.

use std::time::Duration;

use clap::Parser;

/// Runtime settings for the tunnel server.
#[derive(Parser, Debug, Clone)]
#[command(name = "routetunnel", about = "HTTP tunnel service")]
pub struct Settings {
    /// Interface to bind.
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to bind.
    #[arg(long, env = "PORT", default_value_t = 8000)]
    pub port: u16,

    /// Base URL of the management API, used as the public fallback.
    #[arg(long, env = "API_BASE_URL", default_value = "http://localhost:8000")]
    pub api_base_url: String,

    /// Base URL handed to tunnel clients for the WebSocket endpoint.
    #[arg(long, env = "WS_BASE_URL", default_value = "ws://localhost:8000")]
    pub ws_base_url: String,

    /// Base URL for public ingress links. Falls back to the API base URL
    /// when empty.
    #[arg(long, env = "PUBLIC_BASE_URL", default_value = "")]
    pub public_base_url: String,

    /// Seconds an ingress request may wait for its tunnel response.
    #[arg(long, env = "TUNNEL_TIMEOUT", default_value_t = 30.0)]
    pub tunnel_timeout_secs: f64,

    /// Seconds between liveness pings to attached tunnels.
    #[arg(long, env = "PING_INTERVAL", default_value_t = 10.0)]
    pub ping_interval_secs: f64,

    /// Default log level when RUST_LOG is unset.
    #[arg(long, env = "LOG_LEVEL", default_value = "INFO")]
    pub log_level: String,

    /// Bearer token required by the management API. Unset means open
    /// single-user access.
    #[arg(long, env = "AUTH_TOKEN")]
    pub auth_token: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8000,
            api_base_url: "http://localhost:8000".into(),
            ws_base_url: "ws://localhost:8000".into(),
            public_base_url: String::new(),
            tunnel_timeout_secs: 30.0,
            ping_interval_secs: 10.0,
            log_level: "INFO".into(),
            auth_token: None,
        }
    }
}

impl Settings {
    pub fn tunnel_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.tunnel_timeout_secs.max(0.0))
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs_f64(self.ping_interval_secs.max(0.1))
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Base for public ingress links: `PUBLIC_BASE_URL`, or the API base
    /// when unset. The WebSocket base never substitutes here.
    fn public_base(&self) -> &str {
        if self.public_base_url.is_empty() {
            &self.api_base_url
        } else {
            &self.public_base_url
        }
    }

    /// Public ingress URL for a route.
    pub fn public_url(&self, route: &str) -> String {
        format!("{}/r/{}", self.public_base().trim_end_matches('/'), route)
    }

    /// WebSocket attach URL for a token, always built from `WS_BASE_URL`.
    pub fn ws_url(&self, token: &str) -> String {
        format!(
            "{}/api/tunnels/ws/tunnel?token={}",
            self.ws_base_url.trim_end_matches('/'),
            token
        )
    }

    /// Default tracing directive derived from `LOG_LEVEL`.
    pub fn env_filter(&self) -> String {
        format!("routetunnel={}", self.log_level.to_lowercase())
    }
}
