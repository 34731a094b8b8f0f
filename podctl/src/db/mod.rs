//! Entity store: transactional persistence for pods, volumes, snapshots, and
//! passwords, scoped by `(site, tenant)`.
//!
//! Each tenant gets its own PostgreSQL schema; all SQL is built against one
//! schema at a time, so cross-tenant access is structurally impossible rather
//! than merely filtered.

pub mod errors;
pub mod handlers;
pub mod models;
pub mod schema;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;
use tracing::{info, warn};

/// Bounded-retry pool connection for process startup.
///
/// A control-plane process that cannot reach its store must fail startup
/// loudly rather than loop forever; mid-operation outages are handled per
/// operation instead.
pub async fn connect_with_retries(database_url: &str, max_connections: u32, attempts: u32, delay: Duration) -> anyhow::Result<PgPool> {
    let mut last_error = None;

    for attempt in 1..=attempts {
        match PgPoolOptions::new().max_connections(max_connections).connect(database_url).await {
            Ok(pool) => {
                info!("Connected to database on attempt {attempt}");
                return Ok(pool);
            }
            Err(e) => {
                warn!("Database connection attempt {attempt}/{attempts} failed: {e}");
                last_error = Some(e);
                tokio::time::sleep(delay).await;
            }
        }
    }

    Err(anyhow::anyhow!(
        "could not connect to database after {attempts} attempts: {}",
        last_error.map(|e| e.to_string()).unwrap_or_default()
    ))
}
