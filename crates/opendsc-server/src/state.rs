//! Shared application state

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use uuid::Uuid;

use opendsc_storage::{ContentStore, Repositories};

use crate::config::ServerConfig;

/// Cached authorization claims for one user
#[derive(Debug, Clone)]
pub struct UserClaims {
    pub user_id: Uuid,
    pub username: String,
    /// Role-derived global permission set (direct and group-derived)
    pub permissions: HashSet<String>,
    /// Groups the user belongs to
    pub groups: Vec<Uuid>,
}

/// Application state shared by all handlers
#[derive(Clone)]
pub struct AppState {
    pub repos: Repositories,
    pub content: ContentStore,
    pub config: Arc<ServerConfig>,
    /// Claims cache with a short TTL; entries are rebuilt from the database
    /// when they expire
    pub claims: Cache<Uuid, Arc<UserClaims>>,
}

impl AppState {
    pub fn new(repos: Repositories, content: ContentStore, config: ServerConfig) -> Self {
        let claims = Cache::builder()
            .time_to_live(Duration::from_secs(config.security.claims_cache_ttl_seconds))
            .max_capacity(10_000)
            .build();
        Self {
            repos,
            content,
            config: Arc::new(config),
            claims,
        }
    }
}
