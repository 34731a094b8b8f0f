//! Site reconciler: shared-filesystem hygiene and proxy config regeneration.
//!
//! One instance runs per site. Each pass makes sure every registered tenant
//! has its directory skeleton on the shared filesystem, removes volume and
//! snapshot directories that no longer have a database record, and regenerates
//! the reverse-proxy routing table from the current pod set.
//!
//! The shared filesystem is discovered at startup with bounded polling; a
//! site where it never appears cannot serve volumes at all, so discovery
//! failure is fatal rather than degraded.

use crate::config::SiteSweepConfig;
use crate::db::handlers::{Pods, Repository, Snapshots, Volumes};
use crate::db::models::pods::Pod;
use crate::db::schema::list_tenants;
use crate::reconciler::proxy::ProxyRoutes;
use crate::types::TenantId;
use sqlx::PgPool;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Directory names present under no-longer-known ids are orphans. Pure diff,
/// so idempotence is structural: a second pass over the result is empty.
pub(crate) fn orphaned(on_disk: &[String], known: &[String]) -> Vec<String> {
    let known: BTreeSet<&str> = known.iter().map(String::as_str).collect();
    on_disk.iter().filter(|name| !known.contains(name.as_str())).cloned().collect()
}

fn subdirectories(path: &Path) -> std::io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

pub struct SiteReconciler {
    pool: PgPool,
    site_id: String,
    settings: SiteSweepConfig,
}

impl SiteReconciler {
    pub fn new(pool: PgPool, site_id: String, settings: SiteSweepConfig) -> Self {
        Self { pool, site_id, settings }
    }

    /// Tenant's directory skeleton on the shared filesystem.
    fn tenant_root(&self, tenant_id: &TenantId) -> PathBuf {
        self.settings.nfs_root.join(tenant_id)
    }

    /// Block until the shared filesystem is mounted, with bounded attempts.
    pub async fn discover_filesystem(&self) -> anyhow::Result<()> {
        for attempt in 1..=self.settings.discovery_attempts {
            if self.settings.nfs_root.is_dir() {
                info!("Shared filesystem found at {}", self.settings.nfs_root.display());
                return Ok(());
            }
            debug!(
                "Shared filesystem not present at {} (attempt {attempt}/{})",
                self.settings.nfs_root.display(),
                self.settings.discovery_attempts
            );
            tokio::time::sleep(self.settings.discovery_delay).await;
        }
        anyhow::bail!(
            "shared filesystem never appeared at {} after {} attempts",
            self.settings.nfs_root.display(),
            self.settings.discovery_attempts
        )
    }

    /// Run discovery then sweep on a fixed interval until cancellation.
    /// Returns an error only for the fatal discovery case.
    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            discovered = self.discover_filesystem() => discovered?,
        }

        info!("Starting site reconciler, interval {:?}", self.settings.interval);
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("Site reconciler stopped");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!("Site sweep failed: {e:#}");
                    }
                }
            }
        }
    }

    #[instrument(skip(self), fields(site_id = %self.site_id))]
    pub async fn sweep(&self) -> anyhow::Result<()> {
        let mut all_pods: Vec<Pod> = Vec::new();

        for tenant_id in list_tenants(&self.pool, &self.site_id).await? {
            match self.sweep_tenant(&tenant_id).await {
                Ok(mut pods) => all_pods.append(&mut pods),
                Err(e) => error!("Site sweep of tenant '{tenant_id}' failed: {e:#}"),
            }
        }

        let routes = ProxyRoutes::build(all_pods.iter());
        routes.write_if_changed(&self.settings.proxy_config_path)?;
        Ok(())
    }

    /// Ensure the tenant's directories exist and remove orphaned storage.
    /// Returns the tenant's pods for proxy-table assembly.
    async fn sweep_tenant(&self, tenant_id: &TenantId) -> anyhow::Result<Vec<Pod>> {
        let mut conn = self.pool.acquire().await?;

        let volume_ids = Volumes::new(&mut conn, &self.site_id, tenant_id).list_ids().await?;
        let snapshot_ids = Snapshots::new(&mut conn, &self.site_id, tenant_id).list_ids().await?;
        let pods = Pods::new(&mut conn, &self.site_id, tenant_id).list().await?;

        // Directory scans and removals block; keep them off the runtime.
        let root = self.tenant_root(tenant_id);
        tokio::task::spawn_blocking(move || {
            fs::create_dir_all(root.join("volumes"))?;
            fs::create_dir_all(root.join("snapshots"))?;
            remove_orphans(&root.join("volumes"), &volume_ids, "volume")?;
            remove_orphans(&root.join("snapshots"), &snapshot_ids, "snapshot")
        })
        .await??;

        Ok(pods)
    }
}

fn remove_orphans(dir: &Path, known: &[String], kind: &str) -> std::io::Result<()> {
    let on_disk = subdirectories(dir)?;
    for name in orphaned(&on_disk, known) {
        let path = dir.join(&name);
        warn!("Removing orphaned {kind} directory {}", path.display());
        if let Err(e) = fs::remove_dir_all(&path) {
            // Leave it for the next pass; the diff will find it again.
            warn!("Failed to remove {}: {e}", path.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orphan_diff_is_exact() {
        let on_disk = vec!["vol1".to_string(), "vol2".to_string(), "stray".to_string()];
        let known = vec!["vol1".to_string(), "vol2".to_string()];
        assert_eq!(orphaned(&on_disk, &known), vec!["stray".to_string()]);
        assert!(orphaned(&known, &known).is_empty());
        // Records without directories are not the diff's concern.
        assert!(orphaned(&[], &known).is_empty());
    }

    #[test]
    fn orphan_removal_is_idempotent_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["vol1", "vol2", "stray"] {
            fs::create_dir(dir.path().join(name)).unwrap();
        }
        let known = vec!["vol1".to_string(), "vol2".to_string()];

        let first = orphaned(&subdirectories(dir.path()).unwrap(), &known);
        assert_eq!(first, vec!["stray".to_string()]);
        for name in &first {
            fs::remove_dir_all(dir.path().join(name)).unwrap();
        }

        let second = orphaned(&subdirectories(dir.path()).unwrap(), &known);
        assert!(second.is_empty());
        assert!(dir.path().join("vol1").is_dir());
        assert!(dir.path().join("vol2").is_dir());
    }
}
