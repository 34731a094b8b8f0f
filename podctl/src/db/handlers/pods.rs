//! Repository for Pod entities.

use crate::db::{
    errors::{DbError, Result},
    handlers::repository::Repository,
    models::pods::{MountDescriptor, NetworkEntry, Pod, ResourceSpec},
    schema::tenant_schema,
};
use crate::types::{PodId, PodStatus, SiteId, StatusRequested, TenantId};
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection};
use std::collections::BTreeMap;
use tracing::instrument;

/// Raw database row; statuses are stored as their wire strings.
#[derive(Debug, FromRow)]
struct PodRow {
    id: String,
    pod_template: String,
    status: String,
    status_requested: String,
    status_container: Option<String>,
    k8_name: String,
    networking: Json<BTreeMap<String, NetworkEntry>>,
    resources: Json<ResourceSpec>,
    volume_mounts: Json<BTreeMap<String, MountDescriptor>>,
    permissions: Vec<String>,
    environment_variables: Json<BTreeMap<String, String>>,
    command: Vec<String>,
    logs: Option<String>,
    action_logs: Vec<String>,
    ttl_seconds: i64,
    revision: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PodRow> for Pod {
    type Error = DbError;

    fn try_from(row: PodRow) -> Result<Self> {
        let status = row
            .status
            .parse::<PodStatus>()
            .map_err(|e| DbError::Other(anyhow::anyhow!("pod '{}': {e}", row.id)))?;
        let status_requested = row
            .status_requested
            .parse::<StatusRequested>()
            .map_err(|e| DbError::Other(anyhow::anyhow!("pod '{}': {e}", row.id)))?;
        Ok(Pod {
            id: row.id,
            pod_template: row.pod_template,
            status,
            status_requested,
            status_container: row.status_container,
            k8_name: row.k8_name,
            networking: row.networking.0,
            resources: row.resources.0,
            volume_mounts: row.volume_mounts.0,
            permissions: row.permissions,
            environment_variables: row.environment_variables.0,
            command: row.command,
            logs: row.logs,
            action_logs: row.action_logs,
            ttl_seconds: row.ttl_seconds,
            revision: row.revision,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

pub struct Pods<'c> {
    db: &'c mut PgConnection,
    schema: String,
}

impl<'c> Pods<'c> {
    pub fn new(db: &'c mut PgConnection, site_id: &SiteId, tenant_id: &TenantId) -> Self {
        Self {
            db,
            schema: tenant_schema(site_id, tenant_id),
        }
    }

    /// Full-row replace with optimistic locking on `revision`.
    ///
    /// The caller passes the pod as read (carrying the revision it saw) with
    /// the desired field values applied. A concurrent writer bumps the
    /// revision and this update then fails with `RevisionConflict` instead of
    /// silently losing the other write. `audit` is appended to `action_logs`
    /// with a timestamp unless an identical line is already present.
    #[instrument(skip(self, pod, audit), fields(pod_id = %pod.id), err)]
    pub async fn update(&mut self, pod: &Pod, audit: Option<&str>) -> Result<Pod> {
        let mut action_logs = pod.action_logs.clone();
        if let Some(line) = audit {
            if !action_logs.iter().any(|existing| existing.ends_with(line)) {
                action_logs.push(format!("{} {line}", Utc::now()));
            }
        }

        let sql = format!(
            r#"
            UPDATE {schema}.pods SET
                pod_template = $2,
                status = $3,
                status_requested = $4,
                status_container = $5,
                networking = $6,
                resources = $7,
                volume_mounts = $8,
                permissions = $9,
                environment_variables = $10,
                command = $11,
                logs = $12,
                action_logs = $13,
                ttl_seconds = $14,
                revision = revision + 1,
                updated_at = NOW()
            WHERE id = $1 AND revision = $15
            RETURNING *
            "#,
            schema = self.schema
        );

        let row: Option<PodRow> = sqlx::query_as(&sql)
            .bind(&pod.id)
            .bind(&pod.pod_template)
            .bind(pod.status.as_str())
            .bind(pod.status_requested.as_str())
            .bind(&pod.status_container)
            .bind(Json(&pod.networking))
            .bind(Json(&pod.resources))
            .bind(Json(&pod.volume_mounts))
            .bind(&pod.permissions)
            .bind(Json(&pod.environment_variables))
            .bind(&pod.command)
            .bind(&pod.logs)
            .bind(&action_logs)
            .bind(pod.ttl_seconds)
            .bind(pod.revision)
            .fetch_optional(&mut *self.db)
            .await?;

        match row {
            Some(row) => Pod::try_from(row),
            None => self.stale_or_missing(&pod.id).await,
        }
    }

    /// Targeted compare-and-swap status transition, the hot path of the
    /// spawner and the reconciler.
    #[instrument(skip(self, audit), fields(pod_id = %id, status = %status), err)]
    pub async fn transition(
        &mut self,
        id: &PodId,
        expected_revision: i64,
        status: PodStatus,
        status_requested: Option<StatusRequested>,
        audit: &str,
    ) -> Result<Pod> {
        let sql = format!(
            r#"
            UPDATE {schema}.pods SET
                status = $2,
                status_requested = COALESCE($3, status_requested),
                action_logs = array_append(action_logs, $4),
                revision = revision + 1,
                updated_at = NOW()
            WHERE id = $1 AND revision = $5
            RETURNING *
            "#,
            schema = self.schema
        );

        let row: Option<PodRow> = sqlx::query_as(&sql)
            .bind(id)
            .bind(status.as_str())
            .bind(status_requested.map(|s| s.as_str()))
            .bind(format!("{} {audit}", Utc::now()))
            .bind(expected_revision)
            .fetch_optional(&mut *self.db)
            .await?;

        match row {
            Some(row) => Pod::try_from(row),
            None => self.stale_or_missing(id).await,
        }
    }

    /// Record the container state and log tail observed by the reconciler
    /// without bumping into concurrent intent changes (no CAS: these fields
    /// are owned solely by the reconciler).
    #[instrument(skip(self, logs), fields(pod_id = %id), err)]
    pub async fn record_observation(&mut self, id: &PodId, status_container: Option<&str>, logs: Option<&str>) -> Result<()> {
        let sql = format!(
            "UPDATE {schema}.pods SET status_container = $2, logs = COALESCE($3, logs) WHERE id = $1",
            schema = self.schema
        );
        sqlx::query(&sql)
            .bind(id)
            .bind(status_container)
            .bind(logs)
            .execute(&mut *self.db)
            .await?;
        Ok(())
    }

    /// List pods the given user holds any permission on.
    #[instrument(skip(self), err)]
    pub async fn list_permitted(&mut self, username: &str) -> Result<Vec<Pod>> {
        let sql = format!(
            r#"
            SELECT * FROM {schema}.pods
            WHERE EXISTS (
                SELECT 1 FROM unnest(permissions) AS entry
                WHERE split_part(entry, ':', 1) = $1
            )
            ORDER BY id
            "#,
            schema = self.schema
        );
        let rows: Vec<PodRow> = sqlx::query_as(&sql).bind(username).fetch_all(&mut *self.db).await?;
        rows.into_iter().map(Pod::try_from).collect()
    }

    /// Distinguish a lost CAS race from a deleted row.
    async fn stale_or_missing(&mut self, id: &PodId) -> Result<Pod> {
        let sql = format!("SELECT 1 AS one FROM {schema}.pods WHERE id = $1", schema = self.schema);
        let exists: Option<(i32,)> = sqlx::query_as(&sql).bind(id).fetch_optional(&mut *self.db).await?;
        if exists.is_some() {
            Err(DbError::RevisionConflict {
                entity: "pod".to_string(),
                id: id.clone(),
            })
        } else {
            Err(DbError::NotFound)
        }
    }
}

#[async_trait::async_trait]
impl<'c> Repository for Pods<'c> {
    type Entity = Pod;
    type Id = PodId;

    #[instrument(skip(self, pod), fields(pod_id = %pod.id), err)]
    async fn create(&mut self, pod: &Pod) -> Result<()> {
        let sql = format!(
            r#"
            INSERT INTO {schema}.pods (
                id, pod_template, status, status_requested, status_container,
                k8_name, networking, resources, volume_mounts, permissions,
                environment_variables, command, logs, action_logs, ttl_seconds,
                revision, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
            schema = self.schema
        );

        sqlx::query(&sql)
            .bind(&pod.id)
            .bind(&pod.pod_template)
            .bind(pod.status.as_str())
            .bind(pod.status_requested.as_str())
            .bind(&pod.status_container)
            .bind(&pod.k8_name)
            .bind(Json(&pod.networking))
            .bind(Json(&pod.resources))
            .bind(Json(&pod.volume_mounts))
            .bind(&pod.permissions)
            .bind(Json(&pod.environment_variables))
            .bind(&pod.command)
            .bind(&pod.logs)
            .bind(&pod.action_logs)
            .bind(pod.ttl_seconds)
            .bind(pod.revision)
            .bind(pod.created_at)
            .bind(pod.updated_at)
            .execute(&mut *self.db)
            .await?;

        Ok(())
    }

    #[instrument(skip(self), fields(pod_id = %id), err)]
    async fn get(&mut self, id: &PodId) -> Result<Option<Pod>> {
        let sql = format!("SELECT * FROM {schema}.pods WHERE id = $1", schema = self.schema);
        let row: Option<PodRow> = sqlx::query_as(&sql).bind(id).fetch_optional(&mut *self.db).await?;
        row.map(Pod::try_from).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list(&mut self) -> Result<Vec<Pod>> {
        let sql = format!("SELECT * FROM {schema}.pods ORDER BY id", schema = self.schema);
        let rows: Vec<PodRow> = sqlx::query_as(&sql).fetch_all(&mut *self.db).await?;
        rows.into_iter().map(Pod::try_from).collect()
    }

    #[instrument(skip(self), fields(pod_id = %id), err)]
    async fn delete(&mut self, id: &PodId) -> Result<bool> {
        let sql = format!("DELETE FROM {schema}.pods WHERE id = $1", schema = self.schema);
        let result = sqlx::query(&sql).bind(id).execute(&mut *self.db).await?;
        Ok(result.rows_affected() > 0)
    }
}
