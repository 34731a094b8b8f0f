//! Kubernetes-backed provisioner (the orchestration-API variant).
//!
//! Every podctl-managed object carries a `managed-by` label plus the site it
//! belongs to, so [`KubeProvisioner::list_running`] only ever sees objects this
//! control plane created.

use crate::provisioner::{MountSpec, PortSpec, ProvisionError, Provisioner, RunningWorkload, WorkloadName, WorkloadSpec};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, Pod,
    PodSecurityContext, PodSpec, ResourceRequirements, SecurityContext, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, DeleteParams, ListParams, LogParams, ObjectMeta, PostParams};
use kube::Client;
use std::collections::BTreeMap;
use tracing::{debug, instrument, warn};

/// Label attached to every object this control plane creates.
const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
const MANAGED_BY_VALUE: &str = "podctl";
const SITE_LABEL: &str = "podctl.io/site";
const NAME_LABEL: &str = "podctl.io/name";

/// Provisioner backed by the Kubernetes API, namespaced per deployment.
#[derive(Clone)]
pub struct KubeProvisioner {
    pods: Api<Pod>,
    services: Api<Service>,
    pvcs: Api<PersistentVolumeClaim>,
}

impl KubeProvisioner {
    /// Connect using the ambient kubeconfig/in-cluster environment.
    pub async fn connect(namespace: &str) -> Result<Self, ProvisionError> {
        let client = Client::try_default().await?;
        Ok(Self::new(client, namespace))
    }

    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            pods: Api::namespaced(client.clone(), namespace),
            services: Api::namespaced(client.clone(), namespace),
            pvcs: Api::namespaced(client, namespace),
        }
    }

    /// The name label pins each object to exactly one workload; selecting on
    /// the managed-by/site pair alone would match every workload at the site.
    fn labels(name: &WorkloadName) -> BTreeMap<String, String> {
        BTreeMap::from([
            (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
            (SITE_LABEL.to_string(), name.site_id.clone()),
            (NAME_LABEL.to_string(), name.to_string()),
        ])
    }

    /// Selector matching exactly one workload's pod.
    fn selector(name: &WorkloadName) -> BTreeMap<String, String> {
        BTreeMap::from([(NAME_LABEL.to_string(), name.to_string())])
    }

    fn metadata(name: &WorkloadName) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(Self::labels(name)),
            ..Default::default()
        }
    }
}

/// Teardown paths treat "already gone" as success.
fn ignore_not_found(result: Result<(), kube::Error>) -> Result<(), ProvisionError> {
    match result {
        Ok(()) => Ok(()),
        Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
        Err(e) => Err(ProvisionError::Api(e)),
    }
}

#[async_trait]
impl Provisioner for KubeProvisioner {
    #[instrument(skip(self, spec), fields(workload = %spec.name), err)]
    async fn create_workload(&self, spec: &WorkloadSpec) -> Result<(), ProvisionError> {
        if spec.image.is_empty() {
            return Err(ProvisionError::InvalidSpec {
                message: "workload image must not be empty".to_string(),
            });
        }

        let volumes: Vec<Volume> = spec
            .mounts
            .iter()
            .map(|mount| Volume {
                name: mount.claim.clone(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: mount.claim.clone(),
                    read_only: Some(mount.read_only),
                }),
                ..Default::default()
            })
            .collect();

        let volume_mounts: Vec<VolumeMount> = spec
            .mounts
            .iter()
            .map(|mount: &MountSpec| VolumeMount {
                name: mount.claim.clone(),
                mount_path: mount.mount_path.clone(),
                sub_path: mount.sub_path.clone(),
                read_only: Some(mount.read_only),
                ..Default::default()
            })
            .collect();

        let container = Container {
            name: spec.name.name.clone(),
            image: Some(spec.image.clone()),
            command: if spec.command.is_empty() { None } else { Some(spec.command.clone()) },
            ports: Some(
                spec.ports
                    .iter()
                    .map(|p| ContainerPort {
                        name: Some(p.name.clone()),
                        container_port: i32::from(p.port),
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            env: Some(
                spec.env
                    .iter()
                    .map(|(name, value)| EnvVar {
                        name: name.clone(),
                        value: Some(value.clone()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            resources: Some(ResourceRequirements {
                requests: Some(BTreeMap::from([
                    ("cpu".to_string(), Quantity(spec.resources.cpu_request.clone())),
                    ("memory".to_string(), Quantity(spec.resources.memory_request.clone())),
                ])),
                limits: Some(BTreeMap::from([
                    ("cpu".to_string(), Quantity(spec.resources.cpu_limit.clone())),
                    ("memory".to_string(), Quantity(spec.resources.memory_limit.clone())),
                ])),
                ..Default::default()
            }),
            security_context: Some(SecurityContext {
                run_as_user: spec.security.run_as_user,
                run_as_group: spec.security.run_as_group,
                ..Default::default()
            }),
            volume_mounts: if volume_mounts.is_empty() { None } else { Some(volume_mounts) },
            ..Default::default()
        };

        let pod = Pod {
            metadata: Self::metadata(&spec.name),
            spec: Some(PodSpec {
                containers: vec![container],
                volumes: if volumes.is_empty() { None } else { Some(volumes) },
                security_context: spec.security.fs_group.map(|fs_group| PodSecurityContext {
                    fs_group: Some(fs_group),
                    ..Default::default()
                }),
                restart_policy: Some("Always".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        self.pods.create(&PostParams::default(), &pod).await?;
        debug!("Created workload");
        Ok(())
    }

    #[instrument(skip(self), fields(workload = %name), err)]
    async fn delete_workload(&self, name: &WorkloadName) -> Result<(), ProvisionError> {
        ignore_not_found(self.pods.delete(&name.to_string(), &DeleteParams::default()).await.map(|_| ()))
    }

    #[instrument(skip(self, ports), fields(workload = %name), err)]
    async fn create_service(&self, name: &WorkloadName, ports: &[PortSpec]) -> Result<(), ProvisionError> {
        if ports.is_empty() {
            return Err(ProvisionError::InvalidSpec {
                message: "a service needs at least one port".to_string(),
            });
        }

        let service = Service {
            metadata: Self::metadata(name),
            spec: Some(ServiceSpec {
                selector: Some(Self::selector(name)),
                ports: Some(
                    ports
                        .iter()
                        .map(|p| ServicePort {
                            name: Some(p.name.clone()),
                            port: i32::from(p.port),
                            target_port: Some(IntOrString::Int(i32::from(p.port))),
                            protocol: Some("TCP".to_string()),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        };

        self.services.create(&PostParams::default(), &service).await?;
        debug!("Created service");
        Ok(())
    }

    #[instrument(skip(self), fields(workload = %name), err)]
    async fn delete_service(&self, name: &WorkloadName) -> Result<(), ProvisionError> {
        ignore_not_found(self.services.delete(&name.to_string(), &DeleteParams::default()).await.map(|_| ()))
    }

    #[instrument(skip(self), fields(claim = %name), err)]
    async fn create_pvc(&self, name: &WorkloadName, size_mb: i64, storage_class: Option<&str>) -> Result<(), ProvisionError> {
        let pvc = PersistentVolumeClaim {
            metadata: Self::metadata(name),
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteMany".to_string()]),
                storage_class_name: storage_class.map(|s| s.to_string()),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([("storage".to_string(), Quantity(format!("{size_mb}Mi")))])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        self.pvcs.create(&PostParams::default(), &pvc).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(claim = %name), err)]
    async fn delete_pvc(&self, name: &WorkloadName) -> Result<(), ProvisionError> {
        ignore_not_found(self.pvcs.delete(&name.to_string(), &DeleteParams::default()).await.map(|_| ()))
    }

    #[instrument(skip(self), err)]
    async fn list_running(&self, site_id: &str) -> Result<Vec<RunningWorkload>, ProvisionError> {
        let selector = format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE},{SITE_LABEL}={site_id}");
        let pods = self.pods.list(&ListParams::default().labels(&selector)).await?;

        let mut running = Vec::with_capacity(pods.items.len());
        for pod in pods {
            let Some(raw_name) = pod.metadata.name.clone() else { continue };
            let name = match raw_name.parse::<WorkloadName>() {
                Ok(name) => name,
                Err(e) => {
                    // Not ours to manage; names outside the convention are
                    // skipped rather than treated as fatal.
                    warn!("Skipping workload with unparseable name '{raw_name}': {e}");
                    continue;
                }
            };
            let status = pod.status.as_ref();
            running.push(RunningWorkload {
                name,
                raw_name,
                phase: status.and_then(|s| s.phase.clone()),
                started_at: status.and_then(|s| s.start_time.as_ref()).map(|t| t.0),
            });
        }

        Ok(running)
    }

    #[instrument(skip(self), fields(workload = %name), err)]
    async fn fetch_logs(&self, name: &WorkloadName) -> Result<String, ProvisionError> {
        let params = LogParams {
            tail_lines: Some(500),
            ..Default::default()
        };
        match self.pods.logs(&name.to_string(), &params).await {
            Ok(logs) => Ok(logs),
            Err(kube::Error::Api(response)) if response.code == 404 => Err(ProvisionError::NotFound { name: name.to_string() }),
            Err(e) => Err(ProvisionError::Api(e)),
        }
    }

    #[instrument(skip(self), fields(workload = %name), err)]
    async fn is_running(&self, name: &WorkloadName) -> Result<bool, ProvisionError> {
        match self.pods.get_opt(&name.to_string()).await? {
            Some(pod) => Ok(pod.status.and_then(|s| s.phase).as_deref() == Some("Running")),
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provisioner::naming::WorkloadPrefix;

    #[test]
    fn service_selectors_are_unique_per_workload() {
        let a = WorkloadName::new(WorkloadPrefix::Pods, "eu1", "acme", "graph1");
        let b = WorkloadName::new(WorkloadPrefix::Pods, "eu1", "acme", "graph2");

        assert_ne!(KubeProvisioner::selector(&a), KubeProvisioner::selector(&b));
        assert_eq!(KubeProvisioner::selector(&a)[NAME_LABEL], "pods-eu1-acme-graph1");
    }

    #[test]
    fn workload_labels_carry_site_and_name() {
        let name = WorkloadName::new(WorkloadPrefix::Pods, "eu1", "acme", "graph1");
        let labels = KubeProvisioner::labels(&name);

        assert_eq!(labels[MANAGED_BY_LABEL], MANAGED_BY_VALUE);
        assert_eq!(labels[SITE_LABEL], "eu1");
        // The selector's key set must be a subset of the pod labels, or the
        // service would never match its own workload.
        for (key, value) in KubeProvisioner::selector(&name) {
            assert_eq!(labels[&key], value);
        }
    }
}
