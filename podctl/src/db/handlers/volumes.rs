//! Repository for Volume entities.

use crate::db::{
    errors::{DbError, Result},
    handlers::repository::Repository,
    models::volumes::Volume,
    schema::tenant_schema,
};
use crate::types::{PodStatus, SiteId, TenantId, VolumeId};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgConnection};
use tracing::instrument;

#[derive(Debug, FromRow)]
struct VolumeRow {
    id: String,
    size_mb: i64,
    status: String,
    permissions: Vec<String>,
    revision: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<VolumeRow> for Volume {
    type Error = DbError;

    fn try_from(row: VolumeRow) -> Result<Self> {
        let status = row
            .status
            .parse::<PodStatus>()
            .map_err(|e| DbError::Other(anyhow::anyhow!("volume '{}': {e}", row.id)))?;
        Ok(Volume {
            id: row.id,
            size_mb: row.size_mb,
            status,
            permissions: row.permissions,
            revision: row.revision,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

pub struct Volumes<'c> {
    db: &'c mut PgConnection,
    schema: String,
}

impl<'c> Volumes<'c> {
    pub fn new(db: &'c mut PgConnection, site_id: &SiteId, tenant_id: &TenantId) -> Self {
        Self {
            db,
            schema: tenant_schema(site_id, tenant_id),
        }
    }

    /// Compare-and-swap status update.
    #[instrument(skip(self), fields(volume_id = %id, status = %status), err)]
    pub async fn set_status(&mut self, id: &VolumeId, expected_revision: i64, status: PodStatus) -> Result<Volume> {
        let sql = format!(
            r#"
            UPDATE {schema}.volumes
            SET status = $2, revision = revision + 1, updated_at = NOW()
            WHERE id = $1 AND revision = $3
            RETURNING *
            "#,
            schema = self.schema
        );
        let row: Option<VolumeRow> = sqlx::query_as(&sql)
            .bind(id)
            .bind(status.as_str())
            .bind(expected_revision)
            .fetch_optional(&mut *self.db)
            .await?;

        match row {
            Some(row) => Volume::try_from(row),
            None => {
                let sql = format!("SELECT 1 AS one FROM {schema}.volumes WHERE id = $1", schema = self.schema);
                let exists: Option<(i32,)> = sqlx::query_as(&sql).bind(id).fetch_optional(&mut *self.db).await?;
                if exists.is_some() {
                    Err(DbError::RevisionConflict {
                        entity: "volume".to_string(),
                        id: id.clone(),
                    })
                } else {
                    Err(DbError::NotFound)
                }
            }
        }
    }

    /// Compare-and-swap replacement of the permission list.
    #[instrument(skip(self, permissions), fields(volume_id = %id), err)]
    pub async fn set_permissions(&mut self, id: &VolumeId, expected_revision: i64, permissions: &[String]) -> Result<Volume> {
        let sql = format!(
            r#"
            UPDATE {schema}.volumes
            SET permissions = $2, revision = revision + 1, updated_at = NOW()
            WHERE id = $1 AND revision = $3
            RETURNING *
            "#,
            schema = self.schema
        );
        let row: Option<VolumeRow> = sqlx::query_as(&sql)
            .bind(id)
            .bind(permissions)
            .bind(expected_revision)
            .fetch_optional(&mut *self.db)
            .await?;

        match row {
            Some(row) => Volume::try_from(row),
            None => {
                let sql = format!("SELECT 1 AS one FROM {schema}.volumes WHERE id = $1", schema = self.schema);
                let exists: Option<(i32,)> = sqlx::query_as(&sql).bind(id).fetch_optional(&mut *self.db).await?;
                if exists.is_some() {
                    Err(DbError::RevisionConflict {
                        entity: "volume".to_string(),
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
    pub async fn list_ids(&mut self) -> Result<Vec<VolumeId>> {
        let sql = format!("SELECT id FROM {schema}.volumes ORDER BY id", schema = self.schema);
        let rows: Vec<(String,)> = sqlx::query_as(&sql).fetch_all(&mut *self.db).await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

#[async_trait::async_trait]
impl<'c> Repository for Volumes<'c> {
    type Entity = Volume;
    type Id = VolumeId;

    #[instrument(skip(self, volume), fields(volume_id = %volume.id), err)]
    async fn create(&mut self, volume: &Volume) -> Result<()> {
        let sql = format!(
            r#"
            INSERT INTO {schema}.volumes (id, size_mb, status, permissions, revision, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
            schema = self.schema
        );
        sqlx::query(&sql)
            .bind(&volume.id)
            .bind(volume.size_mb)
            .bind(volume.status.as_str())
            .bind(&volume.permissions)
            .bind(volume.revision)
            .bind(volume.created_at)
            .bind(volume.updated_at)
            .execute(&mut *self.db)
            .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(volume_id = %id), err)]
    async fn get(&mut self, id: &VolumeId) -> Result<Option<Volume>> {
        let sql = format!("SELECT * FROM {schema}.volumes WHERE id = $1", schema = self.schema);
        let row: Option<VolumeRow> = sqlx::query_as(&sql).bind(id).fetch_optional(&mut *self.db).await?;
        row.map(Volume::try_from).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list(&mut self) -> Result<Vec<Volume>> {
        let sql = format!("SELECT * FROM {schema}.volumes ORDER BY id", schema = self.schema);
        let rows: Vec<VolumeRow> = sqlx::query_as(&sql).fetch_all(&mut *self.db).await?;
        rows.into_iter().map(Volume::try_from).collect()
    }

    #[instrument(skip(self), fields(volume_id = %id), err)]
    async fn delete(&mut self, id: &VolumeId) -> Result<bool> {
        let sql = format!("DELETE FROM {schema}.volumes WHERE id = $1", schema = self.schema);
        let result = sqlx::query(&sql).bind(id).execute(&mut *self.db).await?;
        Ok(result.rows_affected() > 0)
    }
}
