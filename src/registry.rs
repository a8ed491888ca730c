//! # Tunnel Registry
//!
//! Holds the route and token indices and drives session lifecycle:
//! create, attach, detach, delete, ingress dispatch, and the liveness
//! ping ticker. Both indices use [`DashMap`] for concurrent access from
//! the WebSocket handler tasks and ingress callers.
//!
//! The registry never holds a map guard across I/O. `send_ingress`
//! snapshots the session handle first and awaits outside the index;
//! pings iterate a snapshot taken up front.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::TunnelError;
use crate::protocol::{mint_id, now_ts, Frame, RequestPayload, ResponseFrame};
use crate::session::{ConnHandle, Session};
use crate::store::RouteStore;

/// Route and token indices over live tunnel sessions.
pub struct Registry {
    routes: DashMap<String, Arc<Session>>,
    tokens: DashMap<String, String>,
    store: Option<Arc<dyn RouteStore>>,
}

impl Registry {
    /// Creates a registry. When `store` is present, `attach` validates
    /// tokens against it and records connection times on it.
    pub fn new(store: Option<Arc<dyn RouteStore>>) -> Self {
        Self {
            routes: DashMap::new(),
            tokens: DashMap::new(),
            store,
        }
    }

    /// Reserves `route` and mints its token. Atomic against concurrent
    /// creators of the same route name: exactly one wins.
    pub fn create_route(
        &self,
        route: &str,
        description: Option<String>,
    ) -> Result<Arc<Session>, TunnelError> {
        let session = match self.routes.entry(route.to_string()) {
            Entry::Occupied(_) => return Err(TunnelError::RouteExists),
            Entry::Vacant(vacant) => {
                let session = Arc::new(Session::new(
                    route.to_string(),
                    mint_id(),
                    description,
                ));
                vacant.insert(session.clone());
                session
            }
        };
        self.tokens
            .insert(session.token().to_string(), route.to_string());
        info!(route = %route, "route created");
        Ok(session)
    }

    pub fn get_session(&self, route: &str) -> Option<Arc<Session>> {
        self.routes.get(route).map(|entry| entry.value().clone())
    }

    /// Snapshot of all sessions.
    pub fn list_sessions(&self) -> Vec<Arc<Session>> {
        self.routes
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Deletes `route`: closes any attached connection, fails its pending
    /// requests with `Disconnected`, then removes it from both indices.
    /// Returns whether the route was present.
    pub fn delete_route(&self, route: &str) -> bool {
        let Some(session) = self.get_session(route) else {
            return false;
        };
        session.close(TunnelError::Disconnected);
        let removed = self.routes.remove(route).is_some();
        self.tokens.remove(session.token());
        if removed {
            info!(route = %route, "route deleted");
        }
        removed
    }

    /// Binds a connection to the session owning `token`.
    ///
    /// With a store configured the token must exist there and be active;
    /// on success the store's `last_connected_at` is refreshed. A token
    /// the store accepts but the registry no longer indexes means the
    /// route was deleted in between, which is `RouteGone`.
    pub async fn attach(
        &self,
        token: &str,
        conn: ConnHandle,
    ) -> Result<Arc<Session>, TunnelError> {
        let store_route = match &self.store {
            Some(store) => {
                let record = store
                    .get_active_by_token(token)
                    .await
                    .ok_or(TunnelError::InvalidToken)?;
                store.update_last_connected(&record.route, now_ts()).await;
                Some(record.route)
            }
            None => None,
        };

        let route = match self.tokens.get(token).map(|entry| entry.value().clone()) {
            Some(route) => route,
            None if store_route.is_some() => return Err(TunnelError::RouteGone),
            None => return Err(TunnelError::InvalidToken),
        };
        let session = self.get_session(&route).ok_or(TunnelError::RouteGone)?;

        session.attach(conn);
        info!(route = %route, "tunnel attached");
        Ok(session)
    }

    /// Detaches `conn_id` from whichever session currently holds it.
    /// Idempotent; stale connection ids are ignored.
    pub fn detach(&self, conn_id: Uuid) {
        for entry in self.routes.iter() {
            let session = entry.value().clone();
            if session.detach(conn_id) {
                info!(route = %session.route(), "tunnel detached");
                return;
            }
        }
    }

    /// Forwards an ingress request to the session bound to `route` and
    /// awaits the correlated response. The session handle is snapshotted
    /// up front; the await holds no registry state.
    pub async fn send_ingress(
        &self,
        route: &str,
        payload: RequestPayload,
        timeout: Duration,
    ) -> Result<ResponseFrame, TunnelError> {
        let session = self.get_session(route).ok_or(TunnelError::NotConnected)?;
        if !session.connected() {
            return Err(TunnelError::NotConnected);
        }
        session.send_request(payload, timeout).await
    }

    /// Routes a decoded frame from a client connection to its session.
    /// Frames from a connection that is no longer current are dropped.
    pub fn dispatch_client_frame(&self, conn_id: Uuid, frame: Frame) {
        for entry in self.routes.iter() {
            let session = entry.value();
            if session.is_current(conn_id) {
                session.on_frame(frame);
                return;
            }
        }
    }

    /// Sends a `ping` to every attached session and sweeps overdue pending
    /// entries. A failed ping write counts as a dead connection: the
    /// session is closed and detached with `TransportError`.
    pub fn ping_connected(&self) {
        let sessions = self.list_sessions();
        let ts = now_ts();
        let now = Instant::now();
        for session in sessions {
            session.expire_due(now);
            if !session.connected() {
                continue;
            }
            if session.send_frame(Frame::Ping { ts }).is_err() {
                warn!(route = %session.route(), "ping failed, detaching");
                session.close(TunnelError::TransportError);
            }
        }
    }

    /// Spawns the background ping ticker.
    pub fn spawn_ping_task(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so pings start one
            // interval after boot.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                registry.ping_connected();
            }
        })
    }

    /// Closes every connection and drains every pending table. The ping
    /// task is aborted by whoever holds its join handle.
    pub fn shutdown(&self) {
        for session in self.list_sessions() {
            session.close(TunnelError::Disconnected);
        }
        info!("registry shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Outbound;
    use crate::store::{MemoryStore, RouteRecord};
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    fn conn() -> (ConnHandle, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnHandle::new(Uuid::new_v4(), tx), rx)
    }

    fn payload() -> RequestPayload {
        RequestPayload {
            method: "GET".into(),
            path: "/".into(),
            ..Default::default()
        }
    }

    fn record(route: &str, token: &str, active: bool) -> RouteRecord {
        RouteRecord {
            route: route.into(),
            token: token.into(),
            description: None,
            user_id: 1,
            is_public: false,
            is_active: active,
            created_at: now_ts(),
            updated_at: now_ts(),
            last_connected_at: None,
        }
    }

    #[tokio::test]
    async fn create_route_is_unique() {
        let registry = Registry::new(None);
        registry.create_route("svc", None).unwrap();
        assert_eq!(
            registry.create_route("svc", None).unwrap_err(),
            TunnelError::RouteExists
        );
        assert_eq!(registry.list_sessions().len(), 1);
    }

    #[tokio::test]
    async fn attach_by_token_binds_session() {
        let registry = Registry::new(None);
        let session = registry.create_route("svc", None).unwrap();
        let token = session.token().to_string();

        let (handle, _rx) = conn();
        let attached = registry.attach(&token, handle).await.unwrap();
        assert_eq!(attached.route(), "svc");
        assert!(attached.connected());
    }

    #[tokio::test]
    async fn attach_with_unknown_token_fails() {
        let registry = Registry::new(None);
        registry.create_route("svc", None).unwrap();
        let (handle, _rx) = conn();
        assert_eq!(
            registry.attach("deadbeef", handle).await.unwrap_err(),
            TunnelError::InvalidToken
        );
    }

    #[tokio::test]
    async fn attach_consults_store_when_configured() {
        let store = Arc::new(MemoryStore::new());
        let registry = Registry::new(Some(store.clone()));
        let session = registry.create_route("svc", None).unwrap();
        let token = session.token().to_string();

        // Token unknown to the store: rejected even though the registry
        // indexes it.
        let (handle, _rx) = conn();
        assert_eq!(
            registry.attach(&token, handle).await.unwrap_err(),
            TunnelError::InvalidToken
        );

        store.create(record("svc", &token, true)).await.unwrap();
        let (handle, _rx) = conn();
        registry.attach(&token, handle).await.unwrap();
        let persisted = store.get_by_route("svc").await.unwrap();
        assert!(persisted.last_connected_at.is_some());
    }

    #[tokio::test]
    async fn inactive_store_token_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let registry = Registry::new(Some(store.clone()));
        let session = registry.create_route("svc", None).unwrap();
        let token = session.token().to_string();
        store.create(record("svc", &token, false)).await.unwrap();

        let (handle, _rx) = conn();
        assert_eq!(
            registry.attach(&token, handle).await.unwrap_err(),
            TunnelError::InvalidToken
        );
    }

    #[tokio::test]
    async fn store_token_without_live_route_is_gone() {
        let store = Arc::new(MemoryStore::new());
        let registry = Registry::new(Some(store.clone()));
        store
            .create(record("svc", "cafebabe", true))
            .await
            .unwrap();

        let (handle, _rx) = conn();
        assert_eq!(
            registry.attach("cafebabe", handle).await.unwrap_err(),
            TunnelError::RouteGone
        );
    }

    #[tokio::test]
    async fn send_ingress_round_trip() {
        let registry = Arc::new(Registry::new(None));
        let session = registry.create_route("svc", None).unwrap();
        let token = session.token().to_string();

        let (handle, mut rx) = conn();
        let conn_id = handle.id();
        registry.attach(&token, handle).await.unwrap();

        // Echo client: answer every request frame through the dispatch
        // path a real receive loop would use.
        let echo_registry = registry.clone();
        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                if let Outbound::Frame(Frame::Request(req)) = cmd {
                    echo_registry.dispatch_client_frame(
                        conn_id,
                        Frame::Response(crate::protocol::ResponseFrame {
                            correlation_id: req.correlation_id,
                            status_code: 200,
                            headers: HashMap::new(),
                            body_b64: req.body_b64,
                        }),
                    );
                }
            }
        });

        let resp = registry
            .send_ingress("svc", payload(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(resp.status_code, 200);
    }

    #[tokio::test]
    async fn send_ingress_without_session_or_connection() {
        let registry = Registry::new(None);
        assert_eq!(
            registry
                .send_ingress("ghost", payload(), Duration::from_secs(1))
                .await
                .unwrap_err(),
            TunnelError::NotConnected
        );

        registry.create_route("svc", None).unwrap();
        assert_eq!(
            registry
                .send_ingress("svc", payload(), Duration::from_secs(1))
                .await
                .unwrap_err(),
            TunnelError::NotConnected
        );
    }

    #[tokio::test]
    async fn delete_route_drains_and_unindexes() {
        let registry = Arc::new(Registry::new(None));
        let session = registry.create_route("svc", None).unwrap();
        let token = session.token().to_string();
        let (handle, mut rx) = conn();
        registry.attach(&token, handle).await.unwrap();

        let in_flight = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .send_ingress("svc", payload(), Duration::from_secs(5))
                    .await
            })
        };
        // Wait for the request frame to be handed off before deleting.
        rx.recv().await.unwrap();

        assert!(registry.delete_route("svc"));
        assert_eq!(
            in_flight.await.unwrap().unwrap_err(),
            TunnelError::Disconnected
        );
        assert!(registry.get_session("svc").is_none());
        assert_eq!(
            registry
                .send_ingress("svc", payload(), Duration::from_secs(1))
                .await
                .unwrap_err(),
            TunnelError::NotConnected
        );

        // The token is free only in the sense that the route can be
        // recreated; a fresh token is minted for the new session.
        let recreated = registry.create_route("svc", None).unwrap();
        assert_ne!(recreated.token(), token);
    }

    #[tokio::test]
    async fn delete_of_unknown_route_is_false() {
        let registry = Registry::new(None);
        assert!(!registry.delete_route("ghost"));
    }

    #[tokio::test]
    async fn detach_is_idempotent_and_ignores_stale_ids() {
        let registry = Registry::new(None);
        let session = registry.create_route("svc", None).unwrap();
        let token = session.token().to_string();
        let (handle, _rx) = conn();
        let conn_id = handle.id();
        registry.attach(&token, handle).await.unwrap();

        registry.detach(conn_id);
        assert!(!session.connected());
        registry.detach(conn_id);
        registry.detach(Uuid::new_v4());
    }

    #[tokio::test]
    async fn ping_reaches_attached_sessions() {
        let registry = Registry::new(None);
        let session = registry.create_route("svc", None).unwrap();
        let token = session.token().to_string();
        let (handle, mut rx) = conn();
        registry.attach(&token, handle).await.unwrap();

        registry.ping_connected();
        match rx.recv().await.unwrap() {
            Outbound::Frame(Frame::Ping { ts }) => assert!(ts > 0.0),
            other => panic!("expected ping, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_ping_detaches_session() {
        let registry = Registry::new(None);
        let session = registry.create_route("svc", None).unwrap();
        let token = session.token().to_string();
        let (handle, rx) = conn();
        registry.attach(&token, handle).await.unwrap();
        drop(rx);

        registry.ping_connected();
        assert!(!session.connected());
    }

    #[tokio::test]
    async fn stale_connection_frames_are_dropped() {
        let registry = Arc::new(Registry::new(None));
        let session = registry.create_route("svc", None).unwrap();
        let token = session.token().to_string();

        let (old, mut old_rx) = conn();
        let old_id = old.id();
        registry.attach(&token, old).await.unwrap();

        let in_flight = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .send_ingress("svc", payload(), Duration::from_secs(5))
                    .await
            })
        };
        let written = old_rx.recv().await.unwrap();
        let cid = match written {
            Outbound::Frame(Frame::Request(req)) => req.correlation_id,
            other => panic!("expected request, got {other:?}"),
        };

        let (new, _new_rx) = conn();
        registry.attach(&token, new).await.unwrap();
        assert_eq!(
            in_flight.await.unwrap().unwrap_err(),
            TunnelError::Superseded
        );

        // A response arriving on the superseded connection goes nowhere.
        registry.dispatch_client_frame(
            old_id,
            Frame::Response(crate::protocol::ResponseFrame {
                correlation_id: cid,
                status_code: 200,
                headers: HashMap::new(),
                body_b64: None,
            }),
        );
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_drains_all_sessions() {
        let registry = Arc::new(Registry::new(None));
        let mut receivers = Vec::new();
        for name in ["one", "two"] {
            let session = registry.create_route(name, None).unwrap();
            let (handle, rx) = conn();
            registry.attach(session.token(), handle).await.unwrap();
            receivers.push(rx);
        }

        registry.shutdown();
        for session in registry.list_sessions() {
            assert!(!session.connected());
            assert_eq!(session.pending_count(), 0);
        }
    }
}
