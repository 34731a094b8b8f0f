//! Per-tenant schema management and the shared control schema.
//!
//! The `(site, tenant)` compound scope maps to a dedicated PostgreSQL schema
//! (`tenant_{site}_{tenant}`) holding that tenant's pods, volumes, snapshots,
//! and passwords. The `podctl` schema is shared across tenants and holds the
//! command queue and the tenant registry the reconcilers enumerate.

use crate::db::errors::Result;
use crate::types::{SiteId, TenantId};
use sqlx::PgPool;
use tracing::{debug, instrument};

/// Shared control schema name.
pub const CONTROL_SCHEMA: &str = "podctl";

/// Map a `(site, tenant)` scope to its schema name.
///
/// Site and tenant ids are validated lowercase alphanumerics, so the result is
/// a safe SQL identifier; [`sanitize_identifier`] guards the invariant anyway
/// since schema names end up interpolated into DDL and queries.
pub fn tenant_schema(site_id: &SiteId, tenant_id: &TenantId) -> String {
    format!("tenant_{}_{}", sanitize_identifier(site_id), sanitize_identifier(tenant_id))
}

/// Keep only characters that are safe inside an unquoted SQL identifier.
/// Uppercase is folded rather than replaced so mixed-case inputs stay legible.
pub fn sanitize_identifier(raw: &str) -> String {
    raw.chars()
        .map(|c| c.to_ascii_lowercase())
        .map(|c| if c.is_ascii_lowercase() || c.is_ascii_digit() { c } else { '_' })
        .collect()
}

/// Create the shared control schema (command queue + tenant registry) if it
/// does not exist. Idempotent; called once at process startup.
#[instrument(skip(pool), err)]
pub async fn ensure_control_schema(pool: &PgPool) -> Result<()> {
    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {CONTROL_SCHEMA}"))
        .execute(pool)
        .await?;

    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {CONTROL_SCHEMA}.commands (
            id          BIGSERIAL PRIMARY KEY,
            site_id     TEXT NOT NULL,
            payload     JSONB NOT NULL,
            enqueued_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#
    ))
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS commands_site_id_idx ON {CONTROL_SCHEMA}.commands (site_id, id)"
    ))
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {CONTROL_SCHEMA}.tenants (
            site_id    TEXT NOT NULL,
            tenant_id  TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            PRIMARY KEY (site_id, tenant_id)
        )
        "#
    ))
    .execute(pool)
    .await?;

    Ok(())
}

/// Create a tenant's schema and tables if absent, and register the tenant in
/// the shared registry. Idempotent; invoked on every entity-creation path.
#[instrument(skip(pool), err)]
pub async fn ensure_tenant_schema(pool: &PgPool, site_id: &SiteId, tenant_id: &TenantId) -> Result<()> {
    let schema = tenant_schema(site_id, tenant_id);
    debug!("Ensuring schema {schema}");

    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {schema}")).execute(pool).await?;

    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {schema}.pods (
            id                    TEXT PRIMARY KEY,
            pod_template          TEXT NOT NULL,
            status                TEXT NOT NULL,
            status_requested      TEXT NOT NULL,
            status_container      TEXT,
            k8_name               TEXT NOT NULL,
            networking            JSONB NOT NULL DEFAULT '{{}}',
            resources             JSONB NOT NULL,
            volume_mounts         JSONB NOT NULL DEFAULT '{{}}',
            permissions           TEXT[] NOT NULL,
            environment_variables JSONB NOT NULL DEFAULT '{{}}',
            command               TEXT[] NOT NULL DEFAULT '{{}}',
            logs                  TEXT,
            action_logs           TEXT[] NOT NULL DEFAULT '{{}}',
            ttl_seconds           BIGINT NOT NULL DEFAULT -1,
            revision              BIGINT NOT NULL DEFAULT 0,
            created_at            TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at            TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#
    ))
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {schema}.volumes (
            id          TEXT PRIMARY KEY,
            size_mb     BIGINT NOT NULL,
            status      TEXT NOT NULL,
            permissions TEXT[] NOT NULL,
            revision    BIGINT NOT NULL DEFAULT 0,
            created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#
    ))
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {schema}.snapshots (
            id                 TEXT PRIMARY KEY,
            source_volume_id   TEXT NOT NULL,
            source_volume_path TEXT NOT NULL,
            destination_path   TEXT,
            status             TEXT NOT NULL,
            permissions        TEXT[] NOT NULL,
            revision           BIGINT NOT NULL DEFAULT 0,
            created_at         TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at         TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#
    ))
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {schema}.passwords (
            pod_id         TEXT PRIMARY KEY,
            admin_username TEXT NOT NULL,
            admin_password TEXT NOT NULL,
            user_username  TEXT NOT NULL,
            user_password  TEXT NOT NULL,
            created_at     TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#
    ))
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        "INSERT INTO {CONTROL_SCHEMA}.tenants (site_id, tenant_id) VALUES ($1, $2) ON CONFLICT DO NOTHING"
    ))
    .bind(site_id)
    .bind(tenant_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// List tenants registered at a site, for the reconcilers' sweeps.
#[instrument(skip(pool), err)]
pub async fn list_tenants(pool: &PgPool, site_id: &SiteId) -> Result<Vec<TenantId>> {
    let rows: Vec<(String,)> = sqlx::query_as(&format!(
        "SELECT tenant_id FROM {CONTROL_SCHEMA}.tenants WHERE site_id = $1 ORDER BY tenant_id"
    ))
    .bind(site_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|(tenant,)| tenant).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_names_are_deterministic() {
        assert_eq!(tenant_schema(&"eu1".to_string(), &"acme".to_string()), "tenant_eu1_acme");
    }

    #[test]
    fn hostile_identifiers_are_neutralised() {
        assert_eq!(sanitize_identifier("acme; DROP TABLE pods"), "acme__drop_table_pods");
        assert_eq!(sanitize_identifier("Tenant-1"), "tenant_1");
    }
}
