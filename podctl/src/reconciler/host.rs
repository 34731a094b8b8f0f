//! Host reconciler: the periodic sweep that converges pod records and running
//! workloads.
//!
//! Every pass lists the site's running workloads once, then walks every pod of
//! every tenant and decides a single corrective action from the pair of
//! (stored state, observed workload). The decision is a pure function so the
//! state machine is testable without a cluster; the sweep applies it with
//! compare-and-swap transitions and treats lost races as "someone else already
//! fixed it".

use crate::config::HostReconcilerConfig;
use crate::db::errors::DbError;
use crate::db::handlers::{Passwords, Pods, Repository};
use crate::db::models::pods::{Pod, Protocol};
use crate::db::schema::list_tenants;
use crate::provisioner::{Provisioner, RunningWorkload, naming::WorkloadName};
use crate::queue::{Command, CommandQueue};
use crate::types::{PodStatus, StatusRequested, TenantId};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// The single corrective action a sweep pass takes for one pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Action {
    None,
    /// Workload observed for a SUBMITTED pod.
    MarkRunning,
    /// RUNNING pod's workload is up; promote to AVAILABLE.
    MarkAvailable,
    /// Intent is OFF/RESTART but the workload still runs: remove it.
    Teardown,
    /// SHUTTING_DOWN with the workload gone: settle to STOPPED.
    Stop,
    /// SHUTTING_DOWN (restart) with the workload gone: settle and resubmit.
    FinishRestart,
    /// SHUTTING_DOWN too long with the workload still present.
    ForceDelete,
    /// Setup states exceeded their grace window (covers commands lost after
    /// acknowledgment): park in ERROR.
    EscalateStuck,
    /// REQUESTED/ON never claimed by a worker (command lost at or after
    /// enqueue): enqueue it again.
    Resubmit,
    /// A pod that expects a workload has had none for too long: remove the
    /// record entirely.
    HardDelete,
    /// TTL expired on an idle pod: request shutdown.
    IdleShutdown,
}

/// Pick the corrective action for one pod. `age_in_state` is time since the
/// row's last update, which doubles as the idle measure for TTL.
pub(crate) fn decide(
    status: PodStatus,
    requested: StatusRequested,
    workload_running: bool,
    age_in_state: Duration,
    ttl_seconds: i64,
    cfg: &HostReconcilerConfig,
) -> Action {
    // Intent to stop wins over everything except an already-progressing
    // shutdown.
    if workload_running
        && status != PodStatus::ShuttingDown
        && matches!(requested, StatusRequested::Off | StatusRequested::Restart)
    {
        return Action::Teardown;
    }

    if status == PodStatus::ShuttingDown {
        return if workload_running {
            if age_in_state > cfg.shutdown_grace {
                Action::ForceDelete
            } else {
                Action::None
            }
        } else if requested == StatusRequested::Restart {
            Action::FinishRestart
        } else {
            Action::Stop
        };
    }

    match status {
        // A workload appearing while the row still says a setup state means
        // the spawner died between the API call and its transition; adopt the
        // workload instead of escalating.
        PodStatus::SpawnerSetup | PodStatus::CreatingContainer if workload_running => Action::MarkRunning,
        PodStatus::Requested if requested == StatusRequested::On => {
            // A pod nobody claims had its command lost somewhere between
            // enqueue and the worker pool.
            if age_in_state > cfg.stuck_grace {
                Action::Resubmit
            } else {
                Action::None
            }
        }
        PodStatus::SpawnerSetup | PodStatus::CreatingContainer => {
            if age_in_state > cfg.stuck_grace {
                Action::EscalateStuck
            } else {
                Action::None
            }
        }
        PodStatus::Submitted if workload_running => Action::MarkRunning,
        PodStatus::Running if workload_running => Action::MarkAvailable,
        PodStatus::Available if workload_running => {
            if ttl_seconds >= 0 && age_in_state > Duration::from_secs(ttl_seconds as u64) {
                Action::IdleShutdown
            } else {
                Action::None
            }
        }
        status if status.expects_workload() && !workload_running => {
            if age_in_state > cfg.missing_grace {
                Action::HardDelete
            } else {
                Action::None
            }
        }
        _ => Action::None,
    }
}

pub struct HostReconciler {
    pool: PgPool,
    queue: CommandQueue,
    provisioner: Arc<dyn Provisioner>,
    site_id: String,
    namespace: String,
    settings: HostReconcilerConfig,
    http: reqwest::Client,
}

impl HostReconciler {
    pub fn new(
        pool: PgPool,
        queue: CommandQueue,
        provisioner: Arc<dyn Provisioner>,
        site_id: String,
        namespace: String,
        settings: HostReconcilerConfig,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(settings.probe_timeout)
            .build()
            .expect("reqwest client builds with static config");
        Self {
            pool,
            queue,
            provisioner,
            site_id,
            namespace,
            settings,
            http,
        }
    }

    /// Run sweeps on a fixed interval until cancellation.
    pub async fn run(self, cancel: CancellationToken) {
        info!("Starting host reconciler, interval {:?}", self.settings.interval);
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("Host reconciler stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        // Failed sweeps are dropped, not retried early; the
                        // next tick starts from fresh observations.
                        error!("Host sweep failed: {e:#}");
                    }
                }
            }
        }
    }

    /// One full pass over every tenant's pods.
    #[instrument(skip(self), fields(site_id = %self.site_id))]
    pub async fn sweep(&self) -> anyhow::Result<()> {
        let running: HashMap<String, RunningWorkload> = self
            .provisioner
            .list_running(&self.site_id)
            .await?
            .into_iter()
            .map(|w| (w.raw_name.clone(), w))
            .collect();

        for tenant_id in list_tenants(&self.pool, &self.site_id).await? {
            if let Err(e) = self.sweep_tenant(&tenant_id, &running).await {
                error!("Sweep of tenant '{tenant_id}' failed: {e:#}");
            }
        }
        Ok(())
    }

    async fn sweep_tenant(&self, tenant_id: &TenantId, running: &HashMap<String, RunningWorkload>) -> anyhow::Result<()> {
        let mut conn = self.pool.acquire().await?;
        let pods = Pods::new(&mut conn, &self.site_id, tenant_id).list().await?;

        for pod in pods {
            let workload = running.get(&pod.k8_name);
            // Every tracked workload is probed every pass, regardless of the
            // action taken below.
            if workload.is_some() {
                self.probe(&pod).await;
            }
            let age = (chrono::Utc::now() - pod.updated_at).to_std().unwrap_or_default();
            let action = decide(
                pod.status,
                pod.status_requested,
                workload.is_some(),
                age,
                pod.ttl_seconds,
                &self.settings,
            );
            if action != Action::None {
                debug!("Pod '{}' ({}) -> {action:?}", pod.id, pod.status);
            }
            match self.apply(tenant_id, &pod, workload, action).await {
                Ok(()) => {}
                Err(e) if matches!(e.downcast_ref::<DbError>(), Some(DbError::RevisionConflict { .. })) => {
                    debug!("Pod '{}' changed underneath the sweep, skipping", pod.id);
                }
                Err(e) => error!("Applying {action:?} to pod '{}' failed: {e:#}", pod.id),
            }
        }
        Ok(())
    }

    async fn apply(
        &self,
        tenant_id: &TenantId,
        pod: &Pod,
        workload: Option<&RunningWorkload>,
        action: Action,
    ) -> anyhow::Result<()> {
        let name = pod.k8_name.parse::<WorkloadName>().map_err(anyhow::Error::msg)?;
        let mut conn = self.pool.acquire().await?;
        let mut pods = Pods::new(&mut conn, &self.site_id, tenant_id);

        match action {
            Action::None => {
                // Keep the observed container phase fresh for active pods.
                if let Some(workload) = workload {
                    pods.record_observation(&pod.id, workload.phase.as_deref(), None).await?;
                }
            }
            Action::MarkRunning => {
                pods.transition(&pod.id, pod.revision, PodStatus::Running, None, "workload observed running")
                    .await?;
                self.record_logs(tenant_id, pod, workload).await;
            }
            Action::MarkAvailable => {
                pods.transition(&pod.id, pod.revision, PodStatus::Available, None, "workload available")
                    .await?;
                self.record_logs(tenant_id, pod, workload).await;
            }
            Action::Teardown => {
                self.provisioner.delete_service(&name).await?;
                self.provisioner.delete_workload(&name).await?;
                pods.transition(&pod.id, pod.revision, PodStatus::ShuttingDown, None, "shutdown requested")
                    .await?;
            }
            Action::Stop => {
                pods.transition(&pod.id, pod.revision, PodStatus::Stopped, None, "workload stopped")
                    .await?;
            }
            Action::FinishRestart => {
                let pod = pods
                    .transition(&pod.id, pod.revision, PodStatus::Stopped, Some(StatusRequested::On), "restart: workload stopped")
                    .await?;
                pods.transition(&pod.id, pod.revision, PodStatus::Requested, None, "restart: resubmitting")
                    .await?;
                self.queue
                    .enqueue(&Command::new(pod.id.clone(), tenant_id.clone(), self.site_id.clone()))
                    .await?;
            }
            Action::ForceDelete => {
                warn!("Pod '{}' stuck in SHUTTING_DOWN, force-deleting workload", pod.id);
                self.provisioner.delete_service(&name).await?;
                self.provisioner.delete_workload(&name).await?;
            }
            Action::EscalateStuck => {
                warn!("Pod '{}' stuck in {} beyond grace, parking in ERROR", pod.id, pod.status);
                pods.transition(&pod.id, pod.revision, PodStatus::Error, None, "setup never completed")
                    .await?;
            }
            Action::Resubmit => {
                warn!("Pod '{}' sat unclaimed in REQUESTED beyond grace, re-enqueueing", pod.id);
                // The transition bumps updated_at, so the next resubmission
                // waits out a full grace window again.
                pods.transition(&pod.id, pod.revision, PodStatus::Requested, None, "resubmitting provisioning command")
                    .await?;
                self.queue
                    .enqueue(&Command::new(pod.id.clone(), tenant_id.clone(), self.site_id.clone()))
                    .await?;
            }
            Action::HardDelete => {
                warn!("Pod '{}' has had no workload for {:?}, deleting record", pod.id, self.settings.missing_grace);
                // The workload is already gone; clear any leftover service.
                if let Err(e) = self.provisioner.delete_service(&name).await {
                    warn!("Cleanup of service '{name}' failed: {e}");
                }
                pods.delete(&pod.id).await?;
                let mut passwords = Passwords::new(&mut conn, &self.site_id, tenant_id);
                passwords.delete(&pod.id).await?;
            }
            Action::IdleShutdown => {
                info!("Pod '{}' idle past its {}s TTL, requesting shutdown", pod.id, pod.ttl_seconds);
                pods.transition(
                    &pod.id,
                    pod.revision,
                    pod.status,
                    Some(StatusRequested::Off),
                    "idle TTL exceeded",
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Liveness probe on the pod's http endpoints. Observational only: a
    /// failing probe is logged and the lifecycle state is left alone.
    async fn probe(&self, pod: &Pod) {
        for (entry_name, url) in probe_targets(pod, &self.namespace) {
            match self.http.get(&url).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!("Probe of '{}' endpoint '{entry_name}' ok", pod.id);
                }
                Ok(response) => {
                    warn!("Probe of '{}' endpoint '{entry_name}' returned {}", pod.id, response.status());
                }
                Err(e) => {
                    warn!("Probe of '{}' endpoint '{entry_name}' failed: {e}", pod.id);
                }
            }
        }
    }

    /// Capture the current log tail and container phase. Best-effort.
    async fn record_logs(&self, tenant_id: &TenantId, pod: &Pod, workload: Option<&RunningWorkload>) {
        let Ok(name) = pod.k8_name.parse::<WorkloadName>() else { return };
        let logs = match self.provisioner.fetch_logs(&name).await {
            Ok(logs) => Some(logs),
            Err(e) => {
                debug!("Fetching logs for '{}' failed: {e}", pod.id);
                None
            }
        };
        let Ok(mut conn) = self.pool.acquire().await else { return };
        let mut pods = Pods::new(&mut conn, &self.site_id, tenant_id);
        if let Err(e) = pods
            .record_observation(&pod.id, workload.and_then(|w| w.phase.as_deref()), logs.as_deref())
            .await
        {
            warn!("Recording observation for '{}' failed: {e}", pod.id);
        }
    }
}

/// In-cluster probe URLs for a pod's http endpoints. Non-http protocols are
/// not probed.
fn probe_targets(pod: &Pod, namespace: &str) -> Vec<(String, String)> {
    pod.networking
        .iter()
        .filter(|(_, entry)| entry.protocol == Protocol::Http)
        .map(|(name, entry)| {
            let url = format!("http://{}.{}.svc.cluster.local:{}/", pod.k8_name, namespace, entry.port);
            (name.clone(), url)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> HostReconcilerConfig {
        HostReconcilerConfig::default()
    }

    const FRESH: Duration = Duration::from_secs(1);
    const OLD: Duration = Duration::from_secs(100_000);

    #[test]
    fn happy_path_promotions() {
        assert_eq!(
            decide(PodStatus::Submitted, StatusRequested::On, true, FRESH, -1, &cfg()),
            Action::MarkRunning
        );
        assert_eq!(
            decide(PodStatus::Running, StatusRequested::On, true, FRESH, -1, &cfg()),
            Action::MarkAvailable
        );
        assert_eq!(
            decide(PodStatus::Available, StatusRequested::On, true, FRESH, -1, &cfg()),
            Action::None
        );
    }

    #[test]
    fn off_intent_tears_down_then_settles() {
        assert_eq!(
            decide(PodStatus::Available, StatusRequested::Off, true, FRESH, -1, &cfg()),
            Action::Teardown
        );
        assert_eq!(
            decide(PodStatus::ShuttingDown, StatusRequested::Off, false, FRESH, -1, &cfg()),
            Action::Stop
        );
    }

    #[test]
    fn restart_cycles_through_stop_and_resubmit() {
        assert_eq!(
            decide(PodStatus::Running, StatusRequested::Restart, true, FRESH, -1, &cfg()),
            Action::Teardown
        );
        assert_eq!(
            decide(PodStatus::ShuttingDown, StatusRequested::Restart, false, FRESH, -1, &cfg()),
            Action::FinishRestart
        );
    }

    #[test]
    fn stuck_setup_escalates_only_after_grace() {
        assert_eq!(
            decide(PodStatus::SpawnerSetup, StatusRequested::On, false, FRESH, -1, &cfg()),
            Action::None
        );
        assert_eq!(
            decide(PodStatus::SpawnerSetup, StatusRequested::On, false, OLD, -1, &cfg()),
            Action::EscalateStuck
        );
        assert_eq!(
            decide(PodStatus::CreatingContainer, StatusRequested::On, false, OLD, -1, &cfg()),
            Action::EscalateStuck
        );
        // A late-appearing workload is adopted, not escalated.
        assert_eq!(
            decide(PodStatus::CreatingContainer, StatusRequested::On, true, OLD, -1, &cfg()),
            Action::MarkRunning
        );
        assert_eq!(
            decide(PodStatus::SpawnerSetup, StatusRequested::On, true, OLD, -1, &cfg()),
            Action::MarkRunning
        );
    }

    #[test]
    fn unclaimed_requested_pods_are_resubmitted_after_grace() {
        assert_eq!(
            decide(PodStatus::Requested, StatusRequested::On, false, FRESH, -1, &cfg()),
            Action::None
        );
        assert_eq!(
            decide(PodStatus::Requested, StatusRequested::On, false, OLD, -1, &cfg()),
            Action::Resubmit
        );
        // Only ON intent resubmits.
        assert_eq!(
            decide(PodStatus::Requested, StatusRequested::Off, false, OLD, -1, &cfg()),
            Action::None
        );
    }

    #[test]
    fn missing_workload_is_graced_then_hard_deleted() {
        assert_eq!(
            decide(PodStatus::Available, StatusRequested::On, false, FRESH, -1, &cfg()),
            Action::None
        );
        assert_eq!(
            decide(PodStatus::Available, StatusRequested::On, false, OLD, -1, &cfg()),
            Action::HardDelete
        );
    }

    #[test]
    fn shutdown_is_force_deleted_after_grace() {
        assert_eq!(
            decide(PodStatus::ShuttingDown, StatusRequested::Off, true, FRESH, -1, &cfg()),
            Action::None
        );
        assert_eq!(
            decide(PodStatus::ShuttingDown, StatusRequested::Off, true, OLD, -1, &cfg()),
            Action::ForceDelete
        );
    }

    #[test]
    fn ttl_requests_idle_shutdown() {
        assert_eq!(
            decide(PodStatus::Available, StatusRequested::On, true, Duration::from_secs(40), 30, &cfg()),
            Action::IdleShutdown
        );
        // -1 disables the TTL.
        assert_eq!(
            decide(PodStatus::Available, StatusRequested::On, true, OLD, -1, &cfg()),
            Action::None
        );
    }

    #[test]
    fn only_http_endpoints_are_probed() {
        use crate::db::models::pods::{NetworkEntryRequest, NewPod, ResourceSpec};
        use crate::types::{PermissionSet, RequestContext};
        use std::collections::BTreeMap;

        let ctx = RequestContext::new("eu1", "acme", "alice");
        let mut networking = BTreeMap::new();
        networking.insert(
            "bolt".to_string(),
            NetworkEntryRequest {
                port: 7687,
                protocol: Protocol::Tcp,
            },
        );
        networking.insert(
            "browser".to_string(),
            NetworkEntryRequest {
                port: 7474,
                protocol: Protocol::Http,
            },
        );
        let pod = Pod::build(
            &ctx,
            NewPod {
                id: "graph1".to_string(),
                pod_template: "neo4j".to_string(),
                networking,
                resources: ResourceSpec {
                    cpu_request_millis: 500,
                    cpu_limit_millis: 1000,
                    memory_request_mb: 512,
                    memory_limit_mb: 1024,
                },
                volume_mounts: BTreeMap::new(),
                permissions: PermissionSet::parse(&["alice:ADMIN".to_string()]).unwrap(),
                environment_variables: BTreeMap::new(),
                command: Vec::new(),
                ttl_seconds: -1,
            },
            "pods.example.com",
        )
        .unwrap();

        let targets = probe_targets(&pod, "podctl");
        assert_eq!(
            targets,
            vec![(
                "browser".to_string(),
                "http://pods-eu1-acme-graph1.podctl.svc.cluster.local:7474/".to_string()
            )]
        );
    }

    #[test]
    fn terminal_states_are_left_alone() {
        assert_eq!(
            decide(PodStatus::Stopped, StatusRequested::Off, false, OLD, -1, &cfg()),
            Action::None
        );
        assert_eq!(
            decide(PodStatus::Error, StatusRequested::On, false, OLD, -1, &cfg()),
            Action::None
        );
    }
}
