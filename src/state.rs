//! # Server State
//!
//! Shared application state, cloned and passed to each request handler:
//! the tunnel registry, the route record store, the management auth
//! provider, and the parsed settings.

use std::sync::Arc;

use crate::auth::{AuthProvider, StaticTokenAuth};
use crate::config::Settings;
use crate::registry::Registry;
use crate::store::{MemoryStore, RouteStore};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub store: Arc<dyn RouteStore>,
    pub auth: Arc<dyn AuthProvider>,
    pub settings: Arc<Settings>,
}

impl AppState {
    /// Builds the default wiring: in-memory store, static-token auth, and
    /// a registry that validates attach tokens against the store.
    pub fn new(settings: Settings) -> Self {
        let store: Arc<dyn RouteStore> = Arc::new(MemoryStore::new());
        let auth: Arc<dyn AuthProvider> =
            Arc::new(StaticTokenAuth::new(settings.auth_token.clone()));
        let registry = Arc::new(Registry::new(Some(store.clone())));
        Self {
            registry,
            store,
            auth,
            settings: Arc::new(settings),
        }
    }
}
