//! Spawner worker pool: consumes pod commands and drives provisioning.
//!
//! A fixed pool of workers (bounding global provisioning concurrency) blocks
//! on the site's command queue. Commands are acknowledged at claim time, so
//! every handler starts by re-reading the pod row and re-validating that it
//! still wants to be spawned; stale or duplicate deliveries fall out as no-ops.
//!
//! Status transitions go through compare-and-swap updates. A lost race means
//! another actor (a sibling worker, the reconciler) already moved the pod on,
//! and the command is dropped rather than retried.

pub mod templates;

use crate::config::{Config, SpawnerConfig};
use crate::db::errors::DbError;
use crate::db::handlers::{Passwords, Pods, Repository};
use crate::errors::Result;
use crate::provisioner::{ProvisionError, Provisioner, WorkloadSpec};
use crate::queue::{Command, CommandQueue};
use crate::types::{PodStatus, StatusRequested};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Whether a pod row still calls for a spawn attempt. Commands can outlive the
/// state they were enqueued for.
fn should_spawn(status: PodStatus, requested: StatusRequested) -> bool {
    status == PodStatus::Requested && requested == StatusRequested::On
}

#[derive(Clone)]
pub struct Spawner {
    pool: PgPool,
    queue: CommandQueue,
    provisioner: Arc<dyn Provisioner>,
    site_id: String,
    settings: SpawnerConfig,
    custom_image_allowlist: HashMap<String, Vec<String>>,
}

impl Spawner {
    pub fn new(pool: PgPool, queue: CommandQueue, provisioner: Arc<dyn Provisioner>, config: &Config) -> Self {
        Self {
            pool,
            queue,
            provisioner,
            site_id: config.site_id.clone(),
            settings: config.spawner.clone(),
            custom_image_allowlist: config.custom_image_allowlist.clone(),
        }
    }

    /// Run the worker pool until cancellation. Each worker holds its own
    /// queue subscription; claims are serialized by the queue itself.
    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        info!("Starting spawner pool with {} workers", self.settings.workers);

        let mut workers = Vec::with_capacity(self.settings.workers);
        for worker_id in 0..self.settings.workers {
            let spawner = self.clone();
            let cancel = cancel.clone();
            workers.push(tokio::spawn(async move {
                if let Err(e) = spawner.worker_loop(worker_id, cancel).await {
                    error!("Spawner worker {worker_id} exited with error: {e:#}");
                }
            }));
        }

        for worker in workers {
            let _ = worker.await;
        }
        info!("Spawner pool stopped");
        Ok(())
    }

    async fn worker_loop(&self, worker_id: usize, cancel: CancellationToken) -> anyhow::Result<()> {
        let mut subscriber = self.queue.subscribe(&self.site_id).await?;
        debug!("Spawner worker {worker_id} subscribed to site '{}'", self.site_id);

        loop {
            let command = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                claimed = subscriber.next() => claimed?,
            };

            if let Err(e) = self.handle_command(&command).await {
                // The command is already acknowledged; the pod is left in a
                // state the reconciler can observe and correct.
                error!("Failed to handle command for pod '{}': {e:#}", command.pod_id);
            }
        }
    }

    /// Process one claimed command end to end.
    #[instrument(skip(self, command), fields(pod_id = %command.pod_id, tenant_id = %command.tenant_id), err)]
    async fn handle_command(&self, command: &Command) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let mut pods = Pods::new(&mut conn, &self.site_id, &command.tenant_id);

        let Some(pod) = pods.get(&command.pod_id).await? else {
            debug!("Pod no longer exists, dropping command");
            return Ok(());
        };
        if !should_spawn(pod.status, pod.status_requested) {
            debug!(
                "Pod is {}/{}, nothing to spawn",
                pod.status, pod.status_requested
            );
            return Ok(());
        }

        // Claim the pod. Losing this race means a sibling already owns it.
        let pod = match pods
            .transition(&pod.id, pod.revision, PodStatus::SpawnerSetup, None, "spawner claimed pod")
            .await
        {
            Ok(pod) => pod,
            Err(DbError::RevisionConflict { .. }) => {
                debug!("Lost claim race, dropping command");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let mut passwords = Passwords::new(&mut conn, &self.site_id, &command.tenant_id);
        let Some(password) = passwords.get(&pod.id).await? else {
            // Credentials are written in the pod's creation transaction, so a
            // missing row is corruption, not a race.
            let mut pods = Pods::new(&mut conn, &self.site_id, &command.tenant_id);
            pods.transition(&pod.id, pod.revision, PodStatus::Error, None, "credentials missing")
                .await?;
            return Ok(());
        };

        let spec = match templates::workload_spec(
            &pod,
            &self.site_id,
            &command.tenant_id,
            &password,
            &self.custom_image_allowlist,
        ) {
            Ok(spec) => spec,
            Err(reason) => {
                warn!("Pod '{}' failed template resolution: {reason}", pod.id);
                let mut pods = Pods::new(&mut conn, &self.site_id, &command.tenant_id);
                pods.transition(&pod.id, pod.revision, PodStatus::Error, None, &format!("template rejected: {reason}"))
                    .await?;
                return Ok(());
            }
        };

        // Provisioning runs while the row sits in SPAWNER_SETUP; the row only
        // advances once the cluster has accepted the workload.
        match self.provision(&spec).await {
            Ok(()) => {
                let mut pods = Pods::new(&mut conn, &self.site_id, &command.tenant_id);
                pods.transition(&pod.id, pod.revision, PodStatus::CreatingContainer, None, "workload submitted")
                    .await?;
                info!("Pod '{}' submitted as '{}'", pod.id, pod.k8_name);
                Ok(())
            }
            Err(e) => {
                // Clean up partial resources and leave the row where it was;
                // the reconciler escalates a stuck SPAWNER_SETUP to ERROR, or
                // adopts the workload if it turns out to be running.
                warn!("Provisioning pod '{}' failed after retries: {e}", pod.id);
                self.teardown_on_failure(&spec).await;
                Ok(())
            }
        }
    }

    /// Submit workload and service with bounded exponential-backoff retries.
    async fn provision(&self, spec: &WorkloadSpec) -> std::result::Result<(), ProvisionError> {
        let attempts = self.settings.provision_attempts;
        let backoff = self.settings.provision_backoff;
        with_retries(attempts, backoff, || self.provisioner.create_workload(spec)).await?;
        if !spec.ports.is_empty() {
            with_retries(attempts, backoff, || self.provisioner.create_service(&spec.name, &spec.ports)).await?;
        }
        Ok(())
    }

    /// Best-effort removal of whatever a failed spawn left behind, so a
    /// failed attempt does not strand half-created cluster objects.
    async fn teardown_on_failure(&self, spec: &WorkloadSpec) {
        if let Err(e) = self.provisioner.delete_service(&spec.name).await {
            warn!("Cleanup of service '{}' failed: {e}", spec.name);
        }
        if let Err(e) = self.provisioner.delete_workload(&spec.name).await {
            warn!("Cleanup of workload '{}' failed: {e}", spec.name);
        }
    }

}

/// Bounded exponential-backoff retry around one provisioning call.
async fn with_retries<F, Fut>(attempts: u32, initial_backoff: Duration, mut call: F) -> std::result::Result<(), ProvisionError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<(), ProvisionError>>,
{
    let mut backoff = initial_backoff;
    let mut last_error = None;
    for attempt in 1..=attempts {
        match call().await {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!("Provisioning attempt {attempt}/{attempts} failed: {e}");
                last_error = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
            }
        }
    }
    Err(last_error.unwrap_or(ProvisionError::InvalidSpec {
        message: "no provisioning attempts configured".to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn spawn_predicate_requires_requested_and_on() {
        assert!(should_spawn(PodStatus::Requested, StatusRequested::On));
        assert!(!should_spawn(PodStatus::Requested, StatusRequested::Off));
        assert!(!should_spawn(PodStatus::Requested, StatusRequested::Restart));
        assert!(!should_spawn(PodStatus::Running, StatusRequested::On));
        assert!(!should_spawn(PodStatus::SpawnerSetup, StatusRequested::On));
        assert!(!should_spawn(PodStatus::Error, StatusRequested::On));
    }

    #[test]
    fn backoff_doubles_without_overflow() {
        let mut backoff = Duration::from_millis(500);
        for _ in 0..80 {
            backoff = backoff.saturating_mul(2);
        }
        assert_eq!(backoff, Duration::MAX);
    }

    #[tokio::test]
    async fn retries_stop_at_first_success() {
        let calls = AtomicU32::new(0);
        let result = with_retries(5, Duration::from_millis(1), || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if attempt < 3 {
                    Err(ProvisionError::InvalidSpec {
                        message: "transient".to_string(),
                    })
                } else {
                    Ok(())
                }
            }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_surface_the_last_error_on_exhaustion() {
        let calls = AtomicU32::new(0);
        let result = with_retries(3, Duration::from_millis(1), || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                Err::<(), _>(ProvisionError::InvalidSpec {
                    message: format!("attempt {attempt}"),
                })
            }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(ProvisionError::InvalidSpec { message }) => assert_eq!(message, "attempt 3"),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
