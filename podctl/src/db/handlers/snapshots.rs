//! Repository for Snapshot entities.

use crate::db::{
    errors::{DbError, Result},
    handlers::repository::Repository,
    models::snapshots::Snapshot,
    schema::tenant_schema,
};
use crate::types::{PodStatus, SiteId, SnapshotId, TenantId};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgConnection};
use tracing::instrument;

#[derive(Debug, FromRow)]
struct SnapshotRow {
    id: String,
    source_volume_id: String,
    source_volume_path: String,
    destination_path: Option<String>,
    status: String,
    permissions: Vec<String>,
    revision: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SnapshotRow> for Snapshot {
    type Error = DbError;

    fn try_from(row: SnapshotRow) -> Result<Self> {
        let status = row
            .status
            .parse::<PodStatus>()
            .map_err(|e| DbError::Other(anyhow::anyhow!("snapshot '{}': {e}", row.id)))?;
        Ok(Snapshot {
            id: row.id,
            source_volume_id: row.source_volume_id,
            source_volume_path: row.source_volume_path,
            destination_path: row.destination_path,
            status,
            permissions: row.permissions,
            revision: row.revision,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

pub struct Snapshots<'c> {
    db: &'c mut PgConnection,
    schema: String,
}

impl<'c> Snapshots<'c> {
    pub fn new(db: &'c mut PgConnection, site_id: &SiteId, tenant_id: &TenantId) -> Self {
        Self {
            db,
            schema: tenant_schema(site_id, tenant_id),
        }
    }

    /// Compare-and-swap status update, driving REQUESTED -> CREATING_VOLUME ->
    /// AVAILABLE while the copy runs.
    #[instrument(skip(self), fields(snapshot_id = %id, status = %status), err)]
    pub async fn set_status(&mut self, id: &SnapshotId, expected_revision: i64, status: PodStatus) -> Result<Snapshot> {
        let sql = format!(
            r#"
            UPDATE {schema}.snapshots
            SET status = $2, revision = revision + 1, updated_at = NOW()
            WHERE id = $1 AND revision = $3
            RETURNING *
            "#,
            schema = self.schema
        );
        let row: Option<SnapshotRow> = sqlx::query_as(&sql)
            .bind(id)
            .bind(status.as_str())
            .bind(expected_revision)
            .fetch_optional(&mut *self.db)
            .await?;

        match row {
            Some(row) => Snapshot::try_from(row),
            None => {
                let sql = format!("SELECT 1 AS one FROM {schema}.snapshots WHERE id = $1", schema = self.schema);
                let exists: Option<(i32,)> = sqlx::query_as(&sql).bind(id).fetch_optional(&mut *self.db).await?;
                if exists.is_some() {
                    Err(DbError::RevisionConflict {
                        entity: "snapshot".to_string(),
                        id: id.clone(),
                    })
                } else {
                    Err(DbError::NotFound)
                }
            }
        }
    }

    /// Compare-and-swap replacement of the permission list.
    #[instrument(skip(self, permissions), fields(snapshot_id = %id), err)]
    pub async fn set_permissions(&mut self, id: &SnapshotId, expected_revision: i64, permissions: &[String]) -> Result<Snapshot> {
        let sql = format!(
            r#"
            UPDATE {schema}.snapshots
            SET permissions = $2, revision = revision + 1, updated_at = NOW()
            WHERE id = $1 AND revision = $3
            RETURNING *
            "#,
            schema = self.schema
        );
        let row: Option<SnapshotRow> = sqlx::query_as(&sql)
            .bind(id)
            .bind(permissions)
            .bind(expected_revision)
            .fetch_optional(&mut *self.db)
            .await?;

        match row {
            Some(row) => Snapshot::try_from(row),
            None => {
                let sql = format!("SELECT 1 AS one FROM {schema}.snapshots WHERE id = $1", schema = self.schema);
                let exists: Option<(i32,)> = sqlx::query_as(&sql).bind(id).fetch_optional(&mut *self.db).await?;
                if exists.is_some() {
                    Err(DbError::RevisionConflict {
                        entity: "snapshot".to_string(),
                        id: id.clone(),
                    })
                } else {
                    Err(DbError::NotFound)
                }
            }
        }
    }

    /// Ids only, for the reconciler's filesystem diff.
    #[instrument(skip(self), err)]
    pub async fn list_ids(&mut self) -> Result<Vec<SnapshotId>> {
        let sql = format!("SELECT id FROM {schema}.snapshots ORDER BY id", schema = self.schema);
        let rows: Vec<(String,)> = sqlx::query_as(&sql).fetch_all(&mut *self.db).await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

#[async_trait::async_trait]
impl<'c> Repository for Snapshots<'c> {
    type Entity = Snapshot;
    type Id = SnapshotId;

    #[instrument(skip(self, snapshot), fields(snapshot_id = %snapshot.id), err)]
    async fn create(&mut self, snapshot: &Snapshot) -> Result<()> {
        let sql = format!(
            r#"
            INSERT INTO {schema}.snapshots (
                id, source_volume_id, source_volume_path, destination_path,
                status, permissions, revision, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
            schema = self.schema
        );
        sqlx::query(&sql)
            .bind(&snapshot.id)
            .bind(&snapshot.source_volume_id)
            .bind(&snapshot.source_volume_path)
            .bind(&snapshot.destination_path)
            .bind(snapshot.status.as_str())
            .bind(&snapshot.permissions)
            .bind(snapshot.revision)
            .bind(snapshot.created_at)
            .bind(snapshot.updated_at)
            .execute(&mut *self.db)
            .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(snapshot_id = %id), err)]
    async fn get(&mut self, id: &SnapshotId) -> Result<Option<Snapshot>> {
        let sql = format!("SELECT * FROM {schema}.snapshots WHERE id = $1", schema = self.schema);
        let row: Option<SnapshotRow> = sqlx::query_as(&sql).bind(id).fetch_optional(&mut *self.db).await?;
        row.map(Snapshot::try_from).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list(&mut self) -> Result<Vec<Snapshot>> {
        let sql = format!("SELECT * FROM {schema}.snapshots ORDER BY id", schema = self.schema);
        let rows: Vec<SnapshotRow> = sqlx::query_as(&sql).fetch_all(&mut *self.db).await?;
        rows.into_iter().map(Snapshot::try_from).collect()
    }

    #[instrument(skip(self), fields(snapshot_id = %id), err)]
    async fn delete(&mut self, id: &SnapshotId) -> Result<bool> {
        let sql = format!("DELETE FROM {schema}.snapshots WHERE id = $1", schema = self.schema);
        let result = sqlx::query(&sql).bind(id).execute(&mut *self.db).await?;
        Ok(result.rows_affected() > 0)
    }
}
