//! Durable, at-least-once command queue carrying provisioning commands keyed
//! by site.
//!
//! Built on PostgreSQL: `enqueue` inserts into `podctl.commands` and fires a
//! NOTIFY on the per-site channel; `dequeue` claims-and-deletes one row under
//! `FOR UPDATE SKIP LOCKED`, blocking on LISTEN with a periodic poll fallback
//! so missed notifications only add latency, never lose messages.
//!
//! Acknowledgment happens at claim time, before any business logic runs: once
//! a command is handed to a worker it will not be redelivered. Processing
//! failures are deliberately not retried through the queue - the entity is
//! left in an observable state for the health reconciler to correct.

use crate::db::errors::{DbError, Result};
use crate::db::schema::{CONTROL_SCHEMA, sanitize_identifier};
use crate::types::{PodId, SiteId, TenantId};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Current command wire-format version. Consumers skip (and log) commands
/// carrying a version they do not understand.
pub const COMMAND_VERSION: u32 = 1;

/// Poll fallback when no NOTIFY arrives.
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// A queued instruction to reconcile one pod toward its requested state.
///
/// Ephemeral: not persisted beyond the queue, idempotent to redelivery because
/// the handler re-validates entity state before acting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub version: u32,
    pub pod_id: PodId,
    pub tenant_id: TenantId,
    pub site_id: SiteId,
}

impl Command {
    pub fn new(pod_id: impl Into<PodId>, tenant_id: impl Into<TenantId>, site_id: impl Into<SiteId>) -> Self {
        Self {
            version: COMMAND_VERSION,
            pod_id: pod_id.into(),
            tenant_id: tenant_id.into(),
            site_id: site_id.into(),
        }
    }
}

/// Per-site notification channel name.
fn site_channel(site_id: &SiteId) -> String {
    format!("podctl_commands_{}", sanitize_identifier(site_id))
}

/// Producer/consumer handle over the durable command table.
#[derive(Clone)]
pub struct CommandQueue {
    pool: PgPool,
}

impl CommandQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Publish a command durably to the site's queue.
    #[instrument(skip(self, command), fields(pod_id = %command.pod_id, site_id = %command.site_id), err)]
    pub async fn enqueue(&self, command: &Command) -> Result<()> {
        let payload = serde_json::to_value(command).map_err(|e| DbError::Other(e.into()))?;
        sqlx::query(&format!(
            "INSERT INTO {CONTROL_SCHEMA}.commands (site_id, payload) VALUES ($1, $2)"
        ))
        .bind(&command.site_id)
        .bind(payload)
        .execute(&self.pool)
        .await?;

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(site_channel(&command.site_id))
            .bind(&command.pod_id)
            .execute(&self.pool)
            .await?;

        debug!("Enqueued command");
        Ok(())
    }

    /// Open a blocking consumer for one site's queue.
    ///
    /// Establishing the LISTEN connection retries within the pool's own
    /// connection handling; startup-level bounded retries live in
    /// [`crate::db::connect_with_retries`].
    pub async fn subscribe(&self, site_id: &SiteId) -> Result<CommandSubscriber> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(&site_channel(site_id)).await?;
        Ok(CommandSubscriber {
            pool: self.pool.clone(),
            listener,
            site_id: site_id.clone(),
        })
    }

    /// Atomically claim-and-delete the oldest command for a site, if any.
    async fn try_claim(pool: &PgPool, site_id: &SiteId) -> Result<Option<Command>> {
        let row: Option<(serde_json::Value,)> = sqlx::query_as(&format!(
            r#"
            DELETE FROM {CONTROL_SCHEMA}.commands
            WHERE id = (
                SELECT id FROM {CONTROL_SCHEMA}.commands
                WHERE site_id = $1
                ORDER BY id
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING payload
            "#
        ))
        .bind(site_id)
        .fetch_optional(pool)
        .await?;

        let Some((payload,)) = row else { return Ok(None) };
        match serde_json::from_value::<Command>(payload) {
            Ok(command) if command.version == COMMAND_VERSION => Ok(Some(command)),
            Ok(command) => {
                warn!(
                    "Dropping command for pod '{}' with unsupported version {}",
                    command.pod_id, command.version
                );
                Ok(None)
            }
            Err(e) => {
                warn!("Dropping undecodable command payload: {e}");
                Ok(None)
            }
        }
    }
}

/// Blocking consumer over one site's command channel.
pub struct CommandSubscriber {
    pool: PgPool,
    listener: PgListener,
    site_id: SiteId,
}

impl CommandSubscriber {
    /// Block until a command is available and return it, already acknowledged.
    pub async fn next(&mut self) -> Result<Command> {
        loop {
            if let Some(command) = CommandQueue::try_claim(&self.pool, &self.site_id).await? {
                return Ok(command);
            }

            // Wait for a NOTIFY, or fall back to polling: a notification can
            // be consumed by a sibling worker whose claim races ours.
            match tokio::time::timeout(POLL_INTERVAL, self.listener.recv()).await {
                Ok(Ok(_notification)) => {}
                Ok(Err(e)) => {
                    // PgListener reconnects internally; log and fall back to
                    // the poll path.
                    warn!("Command listener error on site '{}': {e}", self.site_id);
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                Err(_elapsed) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_wire_format_is_versioned() {
        let command = Command::new("graph1", "acme", "eu1");
        let value = serde_json::to_value(&command).unwrap();
        assert_eq!(value["version"], 1);
        assert_eq!(value["pod_id"], "graph1");
        assert_eq!(value["tenant_id"], "acme");
        assert_eq!(value["site_id"], "eu1");

        let decoded: Command = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, command);
    }

    #[test]
    fn site_channels_are_isolated_and_sanitised() {
        assert_eq!(site_channel(&"eu1".to_string()), "podctl_commands_eu1");
        assert_ne!(site_channel(&"eu1".to_string()), site_channel(&"us1".to_string()));
        assert_eq!(site_channel(&"eu-1; --".to_string()), "podctl_commands_eu_1____");
    }
}
