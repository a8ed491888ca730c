//! # Route Record Store
//!
//! Persistence contract for route ownership. The core only needs a handful
//! of operations: idempotent create, lookup by route, active-only lookup by
//! token, connection-time updates, delete, and the two listing queries the
//! management surface serves. Backends implement [`RouteStore`]; the
//! in-memory [`MemoryStore`] backs single-process deployments and tests.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::errors::TunnelError;
use crate::protocol::now_ts;

/// Persisted per-route record. The registry treats this as opaque apart
/// from `route`, `token`, and `is_active`.
#[derive(Debug, Clone)]
pub struct RouteRecord {
    pub route: String,
    pub token: String,
    pub description: Option<String>,
    pub user_id: i64,
    pub is_public: bool,
    pub is_active: bool,
    pub created_at: f64,
    pub updated_at: f64,
    pub last_connected_at: Option<f64>,
}

impl RouteRecord {
    pub fn new(
        route: String,
        token: String,
        description: Option<String>,
        user_id: i64,
        is_public: bool,
    ) -> Self {
        let now = now_ts();
        Self {
            route,
            token,
            description,
            user_id,
            is_public,
            is_active: true,
            created_at: now,
            updated_at: now,
            last_connected_at: None,
        }
    }
}

/// Storage backend for route records. Tokens are unique across records.
#[async_trait]
pub trait RouteStore: Send + Sync {
    /// Inserts or replaces the record for `record.route`.
    async fn create(&self, record: RouteRecord) -> Result<(), TunnelError>;

    async fn get_by_route(&self, route: &str) -> Option<RouteRecord>;

    /// Looks a record up by token, returning it only when active.
    async fn get_active_by_token(&self, token: &str) -> Option<RouteRecord>;

    async fn update_last_connected(&self, route: &str, ts: f64);

    /// Removes the record. Returns whether it existed.
    async fn delete(&self, route: &str) -> bool;

    async fn list_for_user(&self, user_id: i64) -> Vec<RouteRecord>;

    async fn list_public(&self) -> Vec<RouteRecord>;
}

/// In-memory [`RouteStore`] keyed by route, with a token index.
#[derive(Default)]
pub struct MemoryStore {
    records: DashMap<String, RouteRecord>,
    token_index: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RouteStore for MemoryStore {
    async fn create(&self, record: RouteRecord) -> Result<(), TunnelError> {
        if let Some(previous) = self.records.get(&record.route) {
            self.token_index.remove(&previous.token);
        }
        self.token_index
            .insert(record.token.clone(), record.route.clone());
        self.records.insert(record.route.clone(), record);
        Ok(())
    }

    async fn get_by_route(&self, route: &str) -> Option<RouteRecord> {
        self.records.get(route).map(|entry| entry.value().clone())
    }

    async fn get_active_by_token(&self, token: &str) -> Option<RouteRecord> {
        let route = self.token_index.get(token)?.value().clone();
        self.records
            .get(&route)
            .map(|entry| entry.value().clone())
            .filter(|record| record.is_active)
    }

    async fn update_last_connected(&self, route: &str, ts: f64) {
        if let Some(mut entry) = self.records.get_mut(route) {
            entry.last_connected_at = Some(ts);
            entry.updated_at = ts;
        }
    }

    async fn delete(&self, route: &str) -> bool {
        match self.records.remove(route) {
            Some((_, record)) => {
                self.token_index.remove(&record.token);
                true
            }
            None => false,
        }
    }

    async fn list_for_user(&self, user_id: i64) -> Vec<RouteRecord> {
        self.records
            .iter()
            .filter(|entry| entry.user_id == user_id && entry.is_active)
            .map(|entry| entry.value().clone())
            .collect()
    }

    async fn list_public(&self) -> Vec<RouteRecord> {
        self.records
            .iter()
            .filter(|entry| entry.is_public && entry.is_active)
            .map(|entry| entry.value().clone())
            .collect()
    }
}
