//! User-facing operations over the entity store.
//!
//! Every operation takes an explicit [`RequestContext`] and enforces the
//! permission model before touching anything. Mutations validate fully before
//! any persistence, so rejected requests leave no trace and retrying them is
//! harmless.

use crate::config::Config;
use crate::db::errors::DbError;
use crate::db::handlers::{Passwords, Pods, Repository, Snapshots, Volumes};
use crate::db::models::{
    passwords::Password,
    pods::{MountKind, NewPod, Pod},
    snapshots::Snapshot,
    validate_entity_id,
    volumes::Volume,
};
use crate::db::schema::ensure_tenant_schema;
use crate::errors::{Error, Result};
use crate::provisioner::{
    Provisioner,
    naming::{WorkloadName, WorkloadPrefix},
};
use crate::queue::{Command, CommandQueue};
use crate::spawner::templates::Template;
use crate::types::{AccessLevel, PermissionSet, PodId, PodStatus, RequestContext, SnapshotId, StatusRequested, VolumeId};
use sqlx::PgPool;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Shared handle exposing the entity operations. Cheap to clone.
#[derive(Clone)]
pub struct Ops {
    pool: PgPool,
    queue: CommandQueue,
    provisioner: Arc<dyn Provisioner>,
    config: Arc<Config>,
}

fn require(permissions: &PermissionSet, username: &str, level: AccessLevel, what: &str) -> Result<()> {
    if permissions.allows(username, level) {
        Ok(())
    } else {
        Err(Error::forbidden(format!("{level} access required to {what}")))
    }
}

/// Map a duplicate-key insert to a user-facing conflict.
fn conflict_on_duplicate(e: DbError, resource: &str, id: &str) -> Error {
    match e {
        DbError::UniqueViolation { .. } => Error::conflict(format!("{resource} '{id}' already exists")),
        other => other.into(),
    }
}

/// Resolve a client-supplied absolute path into a relative path that cannot
/// step outside the directory it is joined onto. Parent and root components
/// are rejected outright.
fn scoped_relative(raw: &str) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for component in Path::new(raw.trim_start_matches('/')).components() {
        match component {
            std::path::Component::Normal(part) => out.push(part),
            std::path::Component::CurDir => {}
            _ => {
                return Err(Error::validation(format!(
                    "path '{raw}' must not contain parent or root components"
                )));
            }
        }
    }
    Ok(out)
}

/// Parse a replacement permission list. Dropping the last ADMIN is a conflict
/// (the current state forbids the change), anything else is plain validation.
fn parse_permission_update(tokens: &[String]) -> Result<PermissionSet> {
    PermissionSet::parse(tokens).map_err(|messages| {
        if messages.iter().any(|m| m.contains("at least one ADMIN")) {
            Error::conflict("permissions must retain at least one ADMIN entry")
        } else {
            Error::Validation { messages }
        }
    })
}

impl Ops {
    pub fn new(pool: PgPool, queue: CommandQueue, provisioner: Arc<dyn Provisioner>, config: Arc<Config>) -> Self {
        Self {
            pool,
            queue,
            provisioner,
            config,
        }
    }

    fn volume_dir(&self, ctx: &RequestContext, volume_id: &VolumeId) -> PathBuf {
        self.config.site_sweep.nfs_root.join(&ctx.tenant_id).join("volumes").join(volume_id)
    }

    fn snapshot_dir(&self, ctx: &RequestContext, snapshot_id: &SnapshotId) -> PathBuf {
        self.config.site_sweep.nfs_root.join(&ctx.tenant_id).join("snapshots").join(snapshot_id)
    }

    // ---- pods ----

    /// Create a pod and its credentials in one transaction, then enqueue the
    /// provisioning command. The command is sent only after commit, so a
    /// worker can never observe a half-created pod.
    #[instrument(skip(self, ctx, new), fields(tenant_id = %ctx.tenant_id, pod_id = %new.id), err)]
    pub async fn create_pod(&self, ctx: &RequestContext, mut new: NewPod) -> Result<Pod> {
        ensure_tenant_schema(&self.pool, &ctx.site_id, &ctx.tenant_id).await?;

        // The creating user always ends up with ADMIN on their own pod.
        new.permissions.grant(&ctx.username, AccessLevel::Admin);

        let mut errors = Vec::new();
        // The template (and any custom image) is checked here so an invalid
        // one never reaches the spawner.
        if let Err(e) = Template::resolve(&new.pod_template, &ctx.tenant_id, &self.config.custom_image_allowlist) {
            errors.push(e);
        }

        // Mounted volumes and snapshots must exist before the pod does.
        {
            let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
            for (name, mount) in &new.volume_mounts {
                let exists = match mount.kind {
                    MountKind::Volume => {
                        Volumes::new(&mut conn, &ctx.site_id, &ctx.tenant_id).get(&mount.source_id).await?.is_some()
                    }
                    MountKind::Snapshot => {
                        Snapshots::new(&mut conn, &ctx.site_id, &ctx.tenant_id).get(&mount.source_id).await?.is_some()
                    }
                };
                if !exists {
                    errors.push(format!("mount '{name}' references unknown source '{}'", mount.source_id));
                }
            }
        }

        let pod = match Pod::build(ctx, new, &self.config.proxy_domain) {
            Ok(pod) if errors.is_empty() => pod,
            Ok(_) => return Err(Error::Validation { messages: errors }),
            Err(mut build_errors) => {
                build_errors.append(&mut errors);
                return Err(Error::Validation { messages: build_errors });
            }
        };
        let password = Password::generate(&pod.id);

        let mut tx = self.pool.begin().await.map_err(DbError::from)?;
        Pods::new(&mut tx, &ctx.site_id, &ctx.tenant_id)
            .create(&pod)
            .await
            .map_err(|e| conflict_on_duplicate(e, "pod", &pod.id))?;
        Passwords::new(&mut tx, &ctx.site_id, &ctx.tenant_id).create(&password).await?;
        tx.commit().await.map_err(DbError::from)?;

        self.queue
            .enqueue(&Command::new(pod.id.clone(), ctx.tenant_id.clone(), ctx.site_id.clone()))
            .await?;

        info!("Created pod '{}' for tenant '{}'", pod.id, ctx.tenant_id);
        Ok(pod)
    }

    /// Fetch one pod, requiring READ.
    pub async fn get_pod(&self, ctx: &RequestContext, pod_id: &PodId) -> Result<Pod> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let pod = Pods::new(&mut conn, &ctx.site_id, &ctx.tenant_id)
            .get(pod_id)
            .await?
            .ok_or(Error::NotFound {
                resource: "pod",
                id: pod_id.clone(),
            })?;
        require(&pod.permission_set(), &ctx.username, AccessLevel::Read, "read this pod")?;
        Ok(pod)
    }

    /// List the pods the calling user holds any permission on.
    pub async fn list_pods(&self, ctx: &RequestContext) -> Result<Vec<Pod>> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        Ok(Pods::new(&mut conn, &ctx.site_id, &ctx.tenant_id).list_permitted(&ctx.username).await?)
    }

    /// Delete a pod: best-effort teardown of cluster objects, then removal of
    /// the record and its credentials. Requires ADMIN.
    #[instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id, pod_id = %pod_id), err)]
    pub async fn delete_pod(&self, ctx: &RequestContext, pod_id: &PodId) -> Result<()> {
        let pod = self.get_pod(ctx, pod_id).await?;
        require(&pod.permission_set(), &ctx.username, AccessLevel::Admin, "delete this pod")?;

        if let Ok(name) = pod.k8_name.parse::<WorkloadName>() {
            if let Err(e) = self.provisioner.delete_service(&name).await {
                warn!("Teardown of service '{name}' failed, reconciler will retry: {e}");
            }
            if let Err(e) = self.provisioner.delete_workload(&name).await {
                warn!("Teardown of workload '{name}' failed, reconciler will retry: {e}");
            }
        }

        let mut tx = self.pool.begin().await.map_err(DbError::from)?;
        Pods::new(&mut tx, &ctx.site_id, &ctx.tenant_id).delete(pod_id).await?;
        Passwords::new(&mut tx, &ctx.site_id, &ctx.tenant_id).delete(pod_id).await?;
        tx.commit().await.map_err(DbError::from)?;

        info!("Deleted pod '{pod_id}'");
        Ok(())
    }

    /// Change a pod's requested state. Requires USER.
    ///
    /// `ON` re-enters the provisioning pipeline immediately; `OFF` and
    /// `RESTART` record intent that the reconciler acts on.
    #[instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id, pod_id = %pod_id, requested = %requested), err)]
    pub async fn set_status_requested(&self, ctx: &RequestContext, pod_id: &PodId, requested: StatusRequested) -> Result<Pod> {
        let pod = self.get_pod(ctx, pod_id).await?;
        require(&pod.permission_set(), &ctx.username, AccessLevel::User, "change this pod's state")?;

        if pod.status_requested == requested {
            return Ok(pod);
        }

        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let mut pods = Pods::new(&mut conn, &ctx.site_id, &ctx.tenant_id);

        let updated = match requested {
            StatusRequested::On => {
                if pod.status.is_active() {
                    return Err(Error::conflict(format!("pod '{pod_id}' is already {}", pod.status)));
                }
                let pod = pods
                    .transition(
                        pod_id,
                        pod.revision,
                        PodStatus::Requested,
                        Some(StatusRequested::On),
                        &format!("start requested by {}", ctx.username),
                    )
                    .await?;
                self.queue
                    .enqueue(&Command::new(pod_id.clone(), ctx.tenant_id.clone(), ctx.site_id.clone()))
                    .await?;
                pod
            }
            StatusRequested::Off => {
                pods.transition(
                    pod_id,
                    pod.revision,
                    pod.status,
                    Some(StatusRequested::Off),
                    &format!("shutdown requested by {}", ctx.username),
                )
                .await?
            }
            StatusRequested::Restart => {
                if !pod.status.is_active() {
                    return Err(Error::conflict(format!("pod '{pod_id}' is {} and cannot be restarted", pod.status)));
                }
                pods.transition(
                    pod_id,
                    pod.revision,
                    pod.status,
                    Some(StatusRequested::Restart),
                    &format!("restart requested by {}", ctx.username),
                )
                .await?
            }
        };
        Ok(updated)
    }

    /// Replace a pod's permission list. Requires ADMIN; the new list must
    /// itself keep at least one ADMIN, so admin access can never be orphaned.
    #[instrument(skip(self, ctx, tokens), fields(tenant_id = %ctx.tenant_id, pod_id = %pod_id), err)]
    pub async fn update_pod_permissions(&self, ctx: &RequestContext, pod_id: &PodId, tokens: &[String]) -> Result<Pod> {
        let mut pod = self.get_pod(ctx, pod_id).await?;
        require(&pod.permission_set(), &ctx.username, AccessLevel::Admin, "change this pod's permissions")?;

        let permissions = parse_permission_update(tokens)?;
        pod.permissions = permissions.to_tokens();

        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let updated = Pods::new(&mut conn, &ctx.site_id, &ctx.tenant_id)
            .update(&pod, Some(&format!("permissions updated by {}", ctx.username)))
            .await?;
        Ok(updated)
    }

    /// Read a pod's generated credentials. Requires ADMIN.
    pub async fn read_password(&self, ctx: &RequestContext, pod_id: &PodId) -> Result<Password> {
        let pod = self.get_pod(ctx, pod_id).await?;
        require(&pod.permission_set(), &ctx.username, AccessLevel::Admin, "read this pod's credentials")?;

        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        Passwords::new(&mut conn, &ctx.site_id, &ctx.tenant_id)
            .get(pod_id)
            .await?
            .ok_or(Error::NotFound {
                resource: "password",
                id: pod_id.clone(),
            })
    }

    /// Current log tail of a pod. Prefers live logs; falls back to the last
    /// tail the reconciler captured. Requires READ.
    pub async fn get_pod_logs(&self, ctx: &RequestContext, pod_id: &PodId) -> Result<String> {
        let pod = self.get_pod(ctx, pod_id).await?;

        if let Ok(name) = pod.k8_name.parse::<WorkloadName>() {
            match self.provisioner.fetch_logs(&name).await {
                Ok(logs) => return Ok(logs),
                Err(e) => warn!("Live log fetch for '{pod_id}' failed, serving stored tail: {e}"),
            }
        }
        Ok(pod.logs.unwrap_or_default())
    }

    // ---- volumes ----

    /// Create a volume: record, backing claim, and its directory on the shared
    /// filesystem.
    #[instrument(skip(self, ctx, permissions), fields(tenant_id = %ctx.tenant_id, volume_id = %id), err)]
    pub async fn create_volume(&self, ctx: &RequestContext, id: VolumeId, size_mb: i64, permissions: PermissionSet) -> Result<Volume> {
        validate_entity_id(&id).map_err(Error::validation)?;
        if size_mb <= 0 {
            return Err(Error::validation("volume size must be positive"));
        }
        ensure_tenant_schema(&self.pool, &ctx.site_id, &ctx.tenant_id).await?;

        let volume = Volume::build(ctx, id, size_mb, permissions);
        {
            let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
            Volumes::new(&mut conn, &ctx.site_id, &ctx.tenant_id)
                .create(&volume)
                .await
                .map_err(|e| conflict_on_duplicate(e, "volume", &volume.id))?;
        }

        let claim = WorkloadName::new(WorkloadPrefix::Podvol, &ctx.site_id, &ctx.tenant_id, &volume.id);
        self.provisioner.create_pvc(&claim, size_mb, None).await?;
        let dir = self.volume_dir(ctx, &volume.id);
        tokio::task::spawn_blocking(move || std::fs::create_dir_all(dir))
            .await
            .map_err(anyhow::Error::from)?
            .map_err(anyhow::Error::from)?;

        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let volume = Volumes::new(&mut conn, &ctx.site_id, &ctx.tenant_id)
            .set_status(&volume.id, volume.revision, PodStatus::Available)
            .await?;

        info!("Created volume '{}' ({size_mb}Mi)", volume.id);
        Ok(volume)
    }

    pub async fn get_volume(&self, ctx: &RequestContext, id: &VolumeId) -> Result<Volume> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let volume = Volumes::new(&mut conn, &ctx.site_id, &ctx.tenant_id)
            .get(id)
            .await?
            .ok_or(Error::NotFound {
                resource: "volume",
                id: id.clone(),
            })?;
        require(&volume.permission_set(), &ctx.username, AccessLevel::Read, "read this volume")?;
        Ok(volume)
    }

    /// Delete a volume. Refused while any pod still mounts it; snapshot files
    /// are untouched. Requires ADMIN. The directory itself is removed by the
    /// site sweep once the record is gone.
    #[instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id, volume_id = %id), err)]
    pub async fn delete_volume(&self, ctx: &RequestContext, id: &VolumeId) -> Result<()> {
        let volume = self.get_volume(ctx, id).await?;
        require(&volume.permission_set(), &ctx.username, AccessLevel::Admin, "delete this volume")?;

        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let pods = Pods::new(&mut conn, &ctx.site_id, &ctx.tenant_id).list().await?;
        let mounted_by: Vec<&str> = pods
            .iter()
            .filter(|pod| {
                pod.volume_mounts
                    .values()
                    .any(|m| m.kind == MountKind::Volume && m.source_id == *id)
            })
            .map(|pod| pod.id.as_str())
            .collect();
        if !mounted_by.is_empty() {
            return Err(Error::conflict(format!(
                "volume '{id}' is mounted by pod(s): {}",
                mounted_by.join(", ")
            )));
        }

        let claim = WorkloadName::new(WorkloadPrefix::Podvol, &ctx.site_id, &ctx.tenant_id, id);
        if let Err(e) = self.provisioner.delete_pvc(&claim).await {
            warn!("Deleting claim '{claim}' failed: {e}");
        }
        Volumes::new(&mut conn, &ctx.site_id, &ctx.tenant_id).delete(id).await?;

        info!("Deleted volume '{id}'");
        Ok(())
    }

    /// Replace a volume's permission list. Requires ADMIN.
    pub async fn update_volume_permissions(&self, ctx: &RequestContext, id: &VolumeId, tokens: &[String]) -> Result<Volume> {
        let volume = self.get_volume(ctx, id).await?;
        require(&volume.permission_set(), &ctx.username, AccessLevel::Admin, "change this volume's permissions")?;

        let permissions = parse_permission_update(tokens)?;
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        Ok(Volumes::new(&mut conn, &ctx.site_id, &ctx.tenant_id)
            .set_permissions(id, volume.revision, &permissions.to_tokens())
            .await?)
    }

    // ---- snapshots ----

    /// Snapshot (part of) a volume by copying its files on the shared
    /// filesystem. Requires USER on the source volume.
    ///
    /// When the source path is a single file, `destination_path` names where
    /// the file lands inside the snapshot and is mandatory; for directories it
    /// must be absent.
    #[instrument(skip(self, ctx, permissions), fields(tenant_id = %ctx.tenant_id, snapshot_id = %id), err)]
    pub async fn create_snapshot(
        &self,
        ctx: &RequestContext,
        id: SnapshotId,
        source_volume_id: VolumeId,
        source_volume_path: String,
        destination_path: Option<String>,
        permissions: PermissionSet,
    ) -> Result<Snapshot> {
        validate_entity_id(&id).map_err(Error::validation)?;
        if !source_volume_path.starts_with('/') {
            return Err(Error::validation("source_volume_path must be absolute within the volume"));
        }

        let volume = self.get_volume(ctx, &source_volume_id).await?;
        require(&volume.permission_set(), &ctx.username, AccessLevel::User, "snapshot this volume")?;

        let volume_root = self.volume_dir(ctx, &source_volume_id);
        let source = volume_root.join(scoped_relative(&source_volume_path)?);
        if let Some(path) = &destination_path {
            scoped_relative(path)?;
        }
        let source_is_file = source.is_file();
        if !source_is_file && !source.is_dir() {
            return Err(Error::validation(format!(
                "path '{source_volume_path}' does not exist in volume '{source_volume_id}'"
            )));
        }
        // Symlinks inside the volume could still point anywhere; resolve and
        // re-check containment.
        let canonical_root = volume_root.canonicalize().map_err(anyhow::Error::from)?;
        let source = source.canonicalize().map_err(anyhow::Error::from)?;
        if !source.starts_with(&canonical_root) {
            return Err(Error::validation(format!(
                "path '{source_volume_path}' resolves outside volume '{source_volume_id}'"
            )));
        }
        if source_is_file && destination_path.is_none() {
            return Err(Error::validation("destination_path is required when snapshotting a single file"));
        }
        if !source_is_file && destination_path.is_some() {
            return Err(Error::validation("destination_path is only valid when snapshotting a single file"));
        }

        let snapshot = Snapshot::build(ctx, id, source_volume_id, source_volume_path, destination_path, permissions);
        {
            let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
            Snapshots::new(&mut conn, &ctx.site_id, &ctx.tenant_id)
                .create(&snapshot)
                .await
                .map_err(|e| conflict_on_duplicate(e, "snapshot", &snapshot.id))?;
        }

        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let snapshot = Snapshots::new(&mut conn, &ctx.site_id, &ctx.tenant_id)
            .set_status(&snapshot.id, snapshot.revision, PodStatus::CreatingVolume)
            .await?;

        let destination = match &snapshot.destination_path {
            Some(path) => self.snapshot_dir(ctx, &snapshot.id).join(scoped_relative(path)?),
            None => self.snapshot_dir(ctx, &snapshot.id),
        };
        let copy_result = tokio::task::spawn_blocking(move || copy_recursive(&source, &destination))
            .await
            .map_err(anyhow::Error::from)?;
        if let Err(e) = copy_result {
            // Leave the record in CREATING_VOLUME; the partial copy directory
            // is swept once the record is removed.
            return Err(Error::Other(anyhow::anyhow!("snapshot copy failed: {e}")));
        }

        let snapshot = Snapshots::new(&mut conn, &ctx.site_id, &ctx.tenant_id)
            .set_status(&snapshot.id, snapshot.revision, PodStatus::Available)
            .await?;

        info!("Created snapshot '{}' from volume '{}'", snapshot.id, snapshot.source_volume_id);
        Ok(snapshot)
    }

    pub async fn get_snapshot(&self, ctx: &RequestContext, id: &SnapshotId) -> Result<Snapshot> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let snapshot = Snapshots::new(&mut conn, &ctx.site_id, &ctx.tenant_id)
            .get(id)
            .await?
            .ok_or(Error::NotFound {
                resource: "snapshot",
                id: id.clone(),
            })?;
        require(&snapshot.permission_set(), &ctx.username, AccessLevel::Read, "read this snapshot")?;
        Ok(snapshot)
    }

    /// Replace a snapshot's permission list. Requires ADMIN.
    pub async fn update_snapshot_permissions(&self, ctx: &RequestContext, id: &SnapshotId, tokens: &[String]) -> Result<Snapshot> {
        let snapshot = self.get_snapshot(ctx, id).await?;
        require(&snapshot.permission_set(), &ctx.username, AccessLevel::Admin, "change this snapshot's permissions")?;

        let permissions = parse_permission_update(tokens)?;
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        Ok(Snapshots::new(&mut conn, &ctx.site_id, &ctx.tenant_id)
            .set_permissions(id, snapshot.revision, &permissions.to_tokens())
            .await?)
    }

    /// Delete a snapshot record. Refused while mounted; files are swept
    /// afterwards. Requires ADMIN.
    #[instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id, snapshot_id = %id), err)]
    pub async fn delete_snapshot(&self, ctx: &RequestContext, id: &SnapshotId) -> Result<()> {
        let snapshot = self.get_snapshot(ctx, id).await?;
        require(&snapshot.permission_set(), &ctx.username, AccessLevel::Admin, "delete this snapshot")?;

        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let pods = Pods::new(&mut conn, &ctx.site_id, &ctx.tenant_id).list().await?;
        let mounted_by: Vec<&str> = pods
            .iter()
            .filter(|pod| {
                pod.volume_mounts
                    .values()
                    .any(|m| m.kind == MountKind::Snapshot && m.source_id == *id)
            })
            .map(|pod| pod.id.as_str())
            .collect();
        if !mounted_by.is_empty() {
            return Err(Error::conflict(format!(
                "snapshot '{id}' is mounted by pod(s): {}",
                mounted_by.join(", ")
            )));
        }

        Snapshots::new(&mut conn, &ctx.site_id, &ctx.tenant_id).delete(id).await?;
        info!("Deleted snapshot '{id}'");
        Ok(())
    }
}

/// Copy a file or directory tree. Follows no symlinks; the shared filesystem
/// holds plain files and directories only.
fn copy_recursive(source: &Path, destination: &Path) -> std::io::Result<()> {
    if source.is_file() {
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(source, destination)?;
        return Ok(());
    }

    std::fs::create_dir_all(destination)?;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let target = destination.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_recursive(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn require_enforces_the_lattice() {
        let set = PermissionSet::parse(&["alice:ADMIN".to_string(), "bob:READ".to_string()]).unwrap();
        assert!(require(&set, "alice", AccessLevel::Admin, "x").is_ok());
        assert!(require(&set, "bob", AccessLevel::Read, "x").is_ok());
        assert!(matches!(
            require(&set, "bob", AccessLevel::User, "x"),
            Err(Error::Forbidden { .. })
        ));
        assert!(matches!(
            require(&set, "mallory", AccessLevel::Read, "x"),
            Err(Error::Forbidden { .. })
        ));
    }

    #[test]
    fn snapshot_path_inputs_cannot_escape_their_scope() {
        assert_eq!(scoped_relative("/data/dump.rdb").unwrap(), PathBuf::from("data/dump.rdb"));
        assert_eq!(scoped_relative("/./data/dump.rdb").unwrap(), PathBuf::from("data/dump.rdb"));
        assert!(scoped_relative("/../../../other/volumes/priv/secret.txt").is_err());
        assert!(scoped_relative("/data/../../stolen.txt").is_err());
    }

    #[test]
    fn dropping_the_last_admin_is_a_conflict() {
        let err = parse_permission_update(&["bob:USER".to_string()]).unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));

        let err = parse_permission_update(&["not a token".to_string(), "alice:ADMIN".to_string()]).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn copy_recursive_preserves_tree_shape() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir(src.path().join("nested")).unwrap();
        std::fs::write(src.path().join("a.txt"), b"top").unwrap();
        std::fs::write(src.path().join("nested/b.txt"), b"deep").unwrap();

        let dst = tempfile::tempdir().unwrap();
        let target = dst.path().join("copy");
        copy_recursive(src.path(), &target).unwrap();

        assert_eq!(std::fs::read(target.join("a.txt")).unwrap(), b"top");
        assert_eq!(std::fs::read(target.join("nested/b.txt")).unwrap(), b"deep");
    }

    #[test]
    fn copy_recursive_places_single_files_at_destination() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("dump.rdb"), b"payload").unwrap();

        let dst = tempfile::tempdir().unwrap();
        let target = dst.path().join("snap/data/dump.rdb");
        copy_recursive(&src.path().join("dump.rdb"), &target).unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"payload");
    }
}
