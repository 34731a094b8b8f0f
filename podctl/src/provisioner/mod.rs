//! Workload provisioner: a stateless adapter turning declarative pod/volume
//! specs into calls against the container-orchestration API.
//!
//! The provisioner never retries internally. A failed call surfaces as a typed
//! [`ProvisionError`] and retry/backoff is the caller's (the spawner's)
//! responsibility, so a single provisioning attempt maps to at most one API
//! mutation.

pub mod kubernetes;
pub mod naming;

use crate::db::models::pods::Protocol;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use naming::WorkloadName;
use std::collections::BTreeMap;
use thiserror::Error;

pub use kubernetes::KubeProvisioner;

/// Errors surfaced by provisioning calls.
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// The orchestration API rejected or failed the call.
    #[error("orchestration API error: {0}")]
    Api(#[from] kube::Error),

    /// The referenced workload does not exist.
    #[error("workload '{name}' not found")]
    NotFound { name: String },

    /// The spec cannot be expressed against the backend.
    #[error("invalid workload spec: {message}")]
    InvalidSpec { message: String },
}

/// One exposed port of a workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSpec {
    pub name: String,
    pub port: u16,
    pub protocol: Protocol,
}

/// A claim mounted into the workload's filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    /// Name of the persistent volume claim (a `podvol-...` workload name).
    pub claim: String,
    pub mount_path: String,
    pub sub_path: Option<String>,
    pub read_only: bool,
}

/// Resource requests and limits, already rendered as orchestrator quantities
/// (`"500m"`, `"1024Mi"`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceQuantities {
    pub cpu_request: String,
    pub cpu_limit: String,
    pub memory_request: String,
    pub memory_limit: String,
}

/// Security context applied to the container.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SecuritySpec {
    pub run_as_user: Option<i64>,
    pub run_as_group: Option<i64>,
    pub fs_group: Option<i64>,
}

/// A fully-resolved workload spec: everything the backend needs, nothing left
/// to compute. Expected to be submitted at most once per desired revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadSpec {
    pub name: WorkloadName,
    pub image: String,
    pub command: Vec<String>,
    pub ports: Vec<PortSpec>,
    pub env: BTreeMap<String, String>,
    pub resources: ResourceQuantities,
    pub mounts: Vec<MountSpec>,
    pub security: SecuritySpec,
}

/// A running workload as observed in the cluster, recovered from the naming
/// convention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningWorkload {
    pub name: WorkloadName,
    /// The raw name as reported by the orchestrator.
    pub raw_name: String,
    pub phase: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

/// Capability set of a workload backend.
///
/// Only the orchestration-API variant ships here; the trait is the seam a
/// container-engine-direct variant (or a test double) would plug into.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Create a container-group from a fully-resolved spec.
    async fn create_workload(&self, spec: &WorkloadSpec) -> Result<(), ProvisionError>;

    /// Delete a container-group. Deleting an absent workload is a no-op so
    /// teardown paths stay idempotent.
    async fn delete_workload(&self, name: &WorkloadName) -> Result<(), ProvisionError>;

    /// Create the network service exposing a workload's ports.
    async fn create_service(&self, name: &WorkloadName, ports: &[PortSpec]) -> Result<(), ProvisionError>;

    /// Delete a workload's network service. Absent services are a no-op.
    async fn delete_service(&self, name: &WorkloadName) -> Result<(), ProvisionError>;

    /// Create a persistent volume claim backing a volume.
    async fn create_pvc(&self, name: &WorkloadName, size_mb: i64, storage_class: Option<&str>) -> Result<(), ProvisionError>;

    /// Delete a volume's claim. Absent claims are a no-op.
    async fn delete_pvc(&self, name: &WorkloadName) -> Result<(), ProvisionError>;

    /// List running container-groups whose names parse under the naming
    /// convention and match `site_id`. Malformed names are skipped, not fatal.
    /// The sequence is finite and the call is restartable.
    async fn list_running(&self, site_id: &str) -> Result<Vec<RunningWorkload>, ProvisionError>;

    /// Fetch the current log tail of a workload's container.
    async fn fetch_logs(&self, name: &WorkloadName) -> Result<String, ProvisionError>;

    /// Whether the workload currently exists and reports a running phase.
    async fn is_running(&self, name: &WorkloadName) -> Result<bool, ProvisionError>;
}
