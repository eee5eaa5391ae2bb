//! PostgreSQL repositories
//!
//! One repository per aggregate, each a thin wrapper over a shared
//! connection pool. Queries are issued at runtime; multi-step writes that
//! must be atomic (activation, key consumption, precedence reorder,
//! fingerprint rotation) run inside explicit transactions.

pub mod auth;
pub mod composites;
pub mod configurations;
pub mod nodes;
pub mod parameters;
pub mod registration;
pub mod reports;
pub mod scopes;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

use opendsc_core::Result;

use crate::error::map_sqlx;

pub use auth::AuthRepo;
pub use composites::CompositeRepo;
pub use configurations::ConfigurationRepo;
pub use nodes::NodeRepo;
pub use parameters::ParameterRepo;
pub use registration::RegistrationKeyRepo;
pub use reports::ReportRepo;
pub use scopes::ScopeRepo;

/// All repositories over one shared pool
#[derive(Clone)]
pub struct Repositories {
    pool: PgPool,
    pub configurations: ConfigurationRepo,
    pub composites: CompositeRepo,
    pub scopes: ScopeRepo,
    pub nodes: NodeRepo,
    pub parameters: ParameterRepo,
    pub registration_keys: RegistrationKeyRepo,
    pub reports: ReportRepo,
    pub auth: AuthRepo,
}

impl Repositories {
    /// Connect to the database and run pending migrations
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx("connect", e))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| opendsc_core::Error::TransientIo(format!("migrate: {}", e)))?;

        Ok(Self::from_pool(pool))
    }

    /// Build repositories over an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            configurations: ConfigurationRepo::new(pool.clone()),
            composites: CompositeRepo::new(pool.clone()),
            scopes: ScopeRepo::new(pool.clone()),
            nodes: NodeRepo::new(pool.clone()),
            parameters: ParameterRepo::new(pool.clone()),
            registration_keys: RegistrationKeyRepo::new(pool.clone()),
            reports: ReportRepo::new(pool.clone()),
            auth: AuthRepo::new(pool.clone()),
            pool,
        }
    }

    /// The underlying pool, for health checks
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
