//! The Pod entity and its nested value types.

use crate::db::models::validate_entity_id;
use crate::provisioner::naming::{WorkloadName, WorkloadPrefix};
use crate::types::{PermissionSet, PodId, PodStatus, RequestContext, StatusRequested};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Maximum number of named network endpoints a pod may expose.
pub const MAX_NETWORKING_ENTRIES: usize = 3;

/// Protocol of an exposed endpoint; partitions the generated proxy config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Http,
    Postgres,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Http => write!(f, "http"),
            Protocol::Postgres => write!(f, "postgres"),
        }
    }
}

/// A named port/protocol/url triple. The url is derived, never client-supplied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkEntry {
    pub port: u16,
    pub protocol: Protocol,
    pub url: String,
}

/// Client-side shape of a networking entry: the url is computed during
/// construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkEntryRequest {
    pub port: u16,
    pub protocol: Protocol,
}

/// CPU and memory requests/limits. Requests must not exceed limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub cpu_request_millis: i64,
    pub cpu_limit_millis: i64,
    pub memory_request_mb: i64,
    pub memory_limit_mb: i64,
}

impl ResourceSpec {
    pub fn validate(&self) -> Result<(), String> {
        if self.cpu_request_millis <= 0 || self.memory_request_mb <= 0 {
            return Err("resource requests must be positive".to_string());
        }
        if self.cpu_request_millis > self.cpu_limit_millis {
            return Err(format!(
                "cpu request ({}m) exceeds limit ({}m)",
                self.cpu_request_millis, self.cpu_limit_millis
            ));
        }
        if self.memory_request_mb > self.memory_limit_mb {
            return Err(format!(
                "memory request ({}Mi) exceeds limit ({}Mi)",
                self.memory_request_mb, self.memory_limit_mb
            ));
        }
        Ok(())
    }
}

/// What a mount points at: a volume or a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountKind {
    Volume,
    Snapshot,
}

/// One entry of a pod's `volume_mounts` map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountDescriptor {
    pub kind: MountKind,
    /// The volume or snapshot id being mounted.
    pub source_id: String,
    pub mount_path: String,
    #[serde(default)]
    pub sub_path: Option<String>,
    #[serde(default)]
    pub read_only: bool,
}

/// A user-requested long-lived containerized workload.
///
/// Exactly one Pod exists per `(site, tenant, pod_id)`. The read path never
/// includes credentials; those live in the companion Password entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Pod {
    pub id: PodId,
    pub pod_template: String,
    pub status: PodStatus,
    pub status_requested: StatusRequested,
    /// Container-level state last observed by the reconciler, if any.
    pub status_container: Option<String>,
    /// Deterministic workload name: `pods-{site}-{tenant}-{pod_id}`.
    pub k8_name: String,
    pub networking: BTreeMap<String, NetworkEntry>,
    pub resources: ResourceSpec,
    pub volume_mounts: BTreeMap<String, MountDescriptor>,
    pub permissions: Vec<String>,
    pub environment_variables: BTreeMap<String, String>,
    pub command: Vec<String>,
    /// Tail of container logs captured by the reconciler.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs: Option<String>,
    /// Timestamped human-readable audit trail, appended on every update.
    pub action_logs: Vec<String>,
    /// Idle shutdown after this many seconds; `-1` means unlimited.
    pub ttl_seconds: i64,
    /// Monotonic revision for compare-and-swap updates.
    pub revision: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Validated inputs for constructing a new pod.
#[derive(Debug, Clone)]
pub struct NewPod {
    pub id: PodId,
    pub pod_template: String,
    pub networking: BTreeMap<String, NetworkEntryRequest>,
    pub resources: ResourceSpec,
    pub volume_mounts: BTreeMap<String, MountDescriptor>,
    pub permissions: PermissionSet,
    pub environment_variables: BTreeMap<String, String>,
    pub command: Vec<String>,
    pub ttl_seconds: i64,
}

impl Pod {
    /// Single-pass construction of a fresh pod in REQUESTED/ON state.
    ///
    /// All derived fields (`k8_name`, endpoint urls) are computed here from
    /// inputs that are fully known up front; no partially-constructed state is
    /// ever observable.
    pub fn build(ctx: &RequestContext, new: NewPod, proxy_domain: &str) -> Result<Self, Vec<String>> {
        let mut errors = Vec::new();

        if let Err(e) = validate_entity_id(&new.id) {
            errors.push(e);
        }
        if new.networking.len() > MAX_NETWORKING_ENTRIES {
            errors.push(format!(
                "networking has {} entries, at most {MAX_NETWORKING_ENTRIES} are allowed",
                new.networking.len()
            ));
        }
        if let Err(e) = new.resources.validate() {
            errors.push(e);
        }
        for (name, mount) in &new.volume_mounts {
            if !mount.mount_path.starts_with('/') {
                errors.push(format!("mount '{name}' path '{}' must be absolute", mount.mount_path));
            }
        }
        if !errors.is_empty() {
            return Err(errors);
        }

        let k8_name = WorkloadName::new(WorkloadPrefix::Pods, &ctx.site_id, &ctx.tenant_id, &new.id).to_string();

        let networking = new
            .networking
            .into_iter()
            .map(|(name, entry)| {
                let url = format!("{}://{}-{}.{}:{}", entry.protocol, k8_name, name, proxy_domain, entry.port);
                (
                    name,
                    NetworkEntry {
                        port: entry.port,
                        protocol: entry.protocol,
                        url,
                    },
                )
            })
            .collect();

        let now = Utc::now();
        Ok(Self {
            id: new.id,
            pod_template: new.pod_template,
            status: PodStatus::Requested,
            status_requested: StatusRequested::On,
            status_container: None,
            k8_name,
            networking,
            resources: new.resources,
            volume_mounts: new.volume_mounts,
            permissions: new.permissions.to_tokens(),
            environment_variables: new.environment_variables,
            command: new.command,
            logs: None,
            action_logs: vec![format!("{now} requested by {}", ctx.username)],
            ttl_seconds: new.ttl_seconds,
            revision: 0,
            created_at: now,
            updated_at: now,
        })
    }

    /// Parse the stored permission tokens. Rows are only ever written through
    /// [`PermissionSet`], so stored tokens are well-formed.
    pub fn permission_set(&self) -> PermissionSet {
        PermissionSet::parse(&self.permissions).unwrap_or_else(|errors| {
            // A malformed stored set means the row predates validation or was
            // edited out-of-band; treat it as empty rather than panic.
            tracing::error!("Pod '{}' has malformed stored permissions: {errors:?}", self.id);
            PermissionSet::parse(std::slice::from_ref(&"__invalid__:ADMIN".to_string())).expect("fallback set is valid")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RequestContext {
        RequestContext::new("eu1", "acme", "alice")
    }

    fn resources() -> ResourceSpec {
        ResourceSpec {
            cpu_request_millis: 500,
            cpu_limit_millis: 1000,
            memory_request_mb: 512,
            memory_limit_mb: 1024,
        }
    }

    fn new_pod(id: &str) -> NewPod {
        NewPod {
            id: id.to_string(),
            pod_template: "neo4j".to_string(),
            networking: BTreeMap::new(),
            resources: resources(),
            volume_mounts: BTreeMap::new(),
            permissions: PermissionSet::parse(&["alice:ADMIN".to_string()]).unwrap(),
            environment_variables: BTreeMap::new(),
            command: Vec::new(),
            ttl_seconds: -1,
        }
    }

    #[test]
    fn k8_name_is_derived_deterministically() {
        let pod = Pod::build(&ctx(), new_pod("graph1"), "pods.example.com").unwrap();
        assert_eq!(pod.k8_name, "pods-eu1-acme-graph1");
        assert_eq!(pod.status, PodStatus::Requested);
        assert_eq!(pod.status_requested, StatusRequested::On);
        assert_eq!(pod.revision, 0);

        let again = Pod::build(&ctx(), new_pod("graph1"), "pods.example.com").unwrap();
        assert_eq!(pod.k8_name, again.k8_name);
    }

    #[test]
    fn endpoint_urls_are_computed_from_the_workload_name() {
        let mut new = new_pod("graph1");
        new.networking.insert(
            "bolt".to_string(),
            NetworkEntryRequest {
                port: 7687,
                protocol: Protocol::Tcp,
            },
        );
        let pod = Pod::build(&ctx(), new, "pods.example.com").unwrap();
        let entry = &pod.networking["bolt"];
        assert_eq!(entry.url, "tcp://pods-eu1-acme-graph1-bolt.pods.example.com:7687");
    }

    #[test]
    fn networking_is_capped_at_three_entries() {
        let mut new = new_pod("graph1");
        for (i, name) in ["a", "b", "c", "d"].iter().enumerate() {
            new.networking.insert(
                name.to_string(),
                NetworkEntryRequest {
                    port: 7000 + i as u16,
                    protocol: Protocol::Tcp,
                },
            );
        }
        let errors = Pod::build(&ctx(), new, "pods.example.com").unwrap_err();
        assert!(errors.iter().any(|e| e.contains("at most 3")));
    }

    #[test]
    fn resource_requests_must_not_exceed_limits() {
        let mut new = new_pod("graph1");
        new.resources.cpu_request_millis = 2000;
        let errors = Pod::build(&ctx(), new, "pods.example.com").unwrap_err();
        assert!(errors.iter().any(|e| e.contains("cpu request")));
    }

    #[test]
    fn invalid_ids_are_rejected() {
        let errors = Pod::build(&ctx(), new_pod("Bad-Name"), "pods.example.com").unwrap_err();
        assert!(!errors.is_empty());
    }

    #[test]
    fn mount_paths_must_be_absolute() {
        let mut new = new_pod("graph1");
        new.volume_mounts.insert(
            "data".to_string(),
            MountDescriptor {
                kind: MountKind::Volume,
                source_id: "vol1".to_string(),
                mount_path: "relative/path".to_string(),
                sub_path: None,
                read_only: false,
            },
        );
        let errors = Pod::build(&ctx(), new, "pods.example.com").unwrap_err();
        assert!(errors.iter().any(|e| e.contains("must be absolute")));
    }
}
