//! Repository for per-pod credentials.
//!
//! Passwords are owned exclusively by their pod: they are inserted in the same
//! transaction as pod creation and removed with the pod. There is no update
//! path - credentials are write-once.

use crate::db::{
    errors::Result,
    handlers::repository::Repository,
    models::passwords::Password,
    schema::tenant_schema,
};
use crate::types::{PodId, SiteId, TenantId};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgConnection};
use tracing::instrument;

#[derive(Debug, FromRow)]
struct PasswordRow {
    pod_id: String,
    admin_username: String,
    admin_password: String,
    user_username: String,
    user_password: String,
    created_at: DateTime<Utc>,
}

impl From<PasswordRow> for Password {
    fn from(row: PasswordRow) -> Self {
        Password {
            pod_id: row.pod_id,
            admin_username: row.admin_username,
            admin_password: row.admin_password,
            user_username: row.user_username,
            user_password: row.user_password,
            created_at: row.created_at,
        }
    }
}

pub struct Passwords<'c> {
    db: &'c mut PgConnection,
    schema: String,
}

impl<'c> Passwords<'c> {
    pub fn new(db: &'c mut PgConnection, site_id: &SiteId, tenant_id: &TenantId) -> Self {
        Self {
            db,
            schema: tenant_schema(site_id, tenant_id),
        }
    }
}

#[async_trait::async_trait]
impl<'c> Repository for Passwords<'c> {
    type Entity = Password;
    type Id = PodId;

    #[instrument(skip(self, password), fields(pod_id = %password.pod_id), err)]
    async fn create(&mut self, password: &Password) -> Result<()> {
        let sql = format!(
            r#"
            INSERT INTO {schema}.passwords (
                pod_id, admin_username, admin_password, user_username, user_password, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
            schema = self.schema
        );
        sqlx::query(&sql)
            .bind(&password.pod_id)
            .bind(&password.admin_username)
            .bind(&password.admin_password)
            .bind(&password.user_username)
            .bind(&password.user_password)
            .bind(password.created_at)
            .execute(&mut *self.db)
            .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(pod_id = %id))]
    async fn get(&mut self, id: &PodId) -> Result<Option<Password>> {
        let sql = format!("SELECT * FROM {schema}.passwords WHERE pod_id = $1", schema = self.schema);
        let row: Option<PasswordRow> = sqlx::query_as(&sql).bind(id).fetch_optional(&mut *self.db).await?;
        Ok(row.map(Password::from))
    }

    #[instrument(skip(self), err)]
    async fn list(&mut self) -> Result<Vec<Password>> {
        let sql = format!("SELECT * FROM {schema}.passwords ORDER BY pod_id", schema = self.schema);
        let rows: Vec<PasswordRow> = sqlx::query_as(&sql).fetch_all(&mut *self.db).await?;
        Ok(rows.into_iter().map(Password::from).collect())
    }

    #[instrument(skip(self), fields(pod_id = %id), err)]
    async fn delete(&mut self, id: &PodId) -> Result<bool> {
        let sql = format!("DELETE FROM {schema}.passwords WHERE pod_id = $1", schema = self.schema);
        let result = sqlx::query(&sql).bind(id).execute(&mut *self.db).await?;
        Ok(result.rows_affected() > 0)
    }
}
