//! podctl: a multi-tenant pod provisioning control plane.
//!
//! One process serves one site (a deployment region backed by one cluster and
//! one shared filesystem). The moving parts:
//!
//! - **Entity store** ([`db`]): pods, volumes, snapshots, and credentials in
//!   PostgreSQL, one schema per `(site, tenant)` scope, with optimistic
//!   revision locking on every mutation.
//! - **Command queue** ([`queue`]): durable per-site provisioning commands on
//!   LISTEN/NOTIFY with a polling fallback.
//! - **Spawner** ([`spawner`]): a bounded worker pool that consumes commands
//!   and drives pods from REQUESTED to CREATING_CONTAINER against the cluster.
//! - **Provisioner** ([`provisioner`]): the stateless Kubernetes adapter.
//! - **Reconcilers** ([`reconciler`]): periodic sweeps converging pod records
//!   with running workloads, cleaning the shared filesystem, and regenerating
//!   the reverse-proxy routing table.
//! - **Operations** ([`ops`]): the permission-checked entity API an HTTP or
//!   CLI front end calls into.

pub mod config;
pub mod db;
pub mod errors;
pub mod ops;
pub mod provisioner;
pub mod queue;
pub mod reconciler;
pub mod spawner;
pub mod telemetry;
pub mod types;

pub use config::Config;
pub use errors::{Error, Result};
pub use ops::Ops;

use crate::provisioner::{KubeProvisioner, Provisioner};
use crate::queue::CommandQueue;
use crate::reconciler::{HostReconciler, SiteReconciler};
use crate::spawner::Spawner;
use sqlx::PgPool;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// The assembled control plane for one site.
pub struct Application {
    config: Arc<Config>,
    pool: PgPool,
    queue: CommandQueue,
    provisioner: Arc<dyn Provisioner>,
    ops: Ops,
}

impl Application {
    /// Connect to the database and the cluster and prepare all services.
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let pool = db::connect_with_retries(
            &config.database.url,
            config.database.max_connections,
            config.database.connect_attempts,
            config.database.connect_delay,
        )
        .await?;
        db::schema::ensure_control_schema(&pool).await?;

        let provisioner: Arc<dyn Provisioner> = Arc::new(KubeProvisioner::connect(&config.namespace).await?);
        let queue = CommandQueue::new(pool.clone());
        let config = Arc::new(config);
        let ops = Ops::new(pool.clone(), queue.clone(), provisioner.clone(), config.clone());

        Ok(Self {
            config,
            pool,
            queue,
            provisioner,
            ops,
        })
    }

    /// The entity operations handle, for embedding front ends.
    pub fn ops(&self) -> &Ops {
        &self.ops
    }

    /// Run all enabled background services until the shutdown future
    /// completes, then stop them gracefully.
    pub async fn serve(self, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        if self.config.spawner.enabled {
            let spawner = Spawner::new(self.pool.clone(), self.queue.clone(), self.provisioner.clone(), &self.config);
            let token = cancel.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = spawner.run(token).await {
                    error!("Spawner pool failed: {e:#}");
                }
            }));
        }

        if self.config.host_reconciler.enabled {
            let reconciler = HostReconciler::new(
                self.pool.clone(),
                self.queue.clone(),
                self.provisioner.clone(),
                self.config.site_id.clone(),
                self.config.namespace.clone(),
                self.config.host_reconciler.clone(),
            );
            let token = cancel.clone();
            tasks.push(tokio::spawn(reconciler.run(token)));
        }

        // The site reconciler's filesystem discovery is the one startup
        // failure that must take the process down.
        let (fatal_tx, mut fatal_rx) = tokio::sync::oneshot::channel::<anyhow::Error>();
        let mut fatal_tx = Some(fatal_tx);
        if self.config.site_sweep.enabled {
            let reconciler = SiteReconciler::new(self.pool.clone(), self.config.site_id.clone(), self.config.site_sweep.clone());
            let token = cancel.clone();
            let tx = fatal_tx.take().expect("fatal channel handed out once");
            tasks.push(tokio::spawn(async move {
                if let Err(e) = reconciler.run(token).await {
                    let _ = tx.send(e);
                }
            }));
        }

        info!("Control plane running for site '{}'", self.config.site_id);

        let fatal = tokio::select! {
            () = shutdown => None,
            received = &mut fatal_rx => received.ok(),
        };
        drop(fatal_tx);

        cancel.cancel();
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                error!("Background task panicked during shutdown: {e}");
            }
        }
        self.pool.close().await;

        match fatal {
            Some(e) => Err(e.context("site reconciler terminated fatally")),
            None => {
                info!("Shutdown complete");
                Ok(())
            }
        }
    }
}
