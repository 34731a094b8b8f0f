//! Pod templates: the catalogue of workload shapes a pod may request.
//!
//! A template turns a stored [`Pod`] row plus its generated credentials into
//! the fully-resolved [`WorkloadSpec`] the provisioner submits. Built-in
//! templates bake in image, credential wiring, and security context; the
//! `custom-` escape hatch runs an arbitrary image, gated by a per-tenant
//! allowlist of image prefixes.

use crate::db::models::{passwords::Password, pods::Pod};
use crate::provisioner::{
    MountSpec, PortSpec, ResourceQuantities, SecuritySpec, WorkloadSpec,
    naming::{WorkloadName, WorkloadPrefix},
};
use crate::types::TenantId;
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

const NEO4J_IMAGE: &str = "neo4j:5-community";
const POSTGRES_IMAGE: &str = "postgres:16";

/// A recognised pod template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Template {
    Neo4j,
    Postgres,
    /// An arbitrary image, allowed only when it matches one of the tenant's
    /// configured image prefixes.
    Custom { image: String },
}

impl FromStr for Template {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "neo4j" => Ok(Template::Neo4j),
            "postgres" => Ok(Template::Postgres),
            other => match other.strip_prefix("custom-") {
                Some(image) if !image.is_empty() => Ok(Template::Custom { image: image.to_string() }),
                _ => Err(format!("unknown pod template '{other}'")),
            },
        }
    }
}

impl Template {
    /// Parse a stored template string and enforce the tenant's custom-image
    /// policy. Built-in templates are always allowed.
    pub fn resolve(
        raw: &str,
        tenant_id: &TenantId,
        allowlist: &HashMap<String, Vec<String>>,
    ) -> Result<Self, String> {
        let template = raw.parse::<Template>()?;
        if let Template::Custom { image } = &template {
            let prefixes = allowlist
                .get(tenant_id)
                .ok_or_else(|| format!("tenant '{tenant_id}' is not allowed to run custom images"))?;
            if !prefixes.iter().any(|prefix| image.starts_with(prefix)) {
                return Err(format!(
                    "image '{image}' does not match any allowed prefix for tenant '{tenant_id}'"
                ));
            }
        }
        Ok(template)
    }

    pub fn image(&self) -> &str {
        match self {
            Template::Neo4j => NEO4J_IMAGE,
            Template::Postgres => POSTGRES_IMAGE,
            Template::Custom { image } => image,
        }
    }

    /// Credential environment injected by the template. User-supplied
    /// variables never override these.
    fn credential_env(&self, password: &Password) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        match self {
            Template::Neo4j => {
                env.insert(
                    "NEO4J_AUTH".to_string(),
                    format!("{}/{}", password.admin_username, password.admin_password),
                );
            }
            Template::Postgres => {
                env.insert("POSTGRES_USER".to_string(), password.admin_username.clone());
                env.insert("POSTGRES_PASSWORD".to_string(), password.admin_password.clone());
            }
            Template::Custom { .. } => {
                // Custom images get the credentials handed over verbatim and
                // decide themselves what to do with them.
                env.insert("PODCTL_ADMIN_USERNAME".to_string(), password.admin_username.clone());
                env.insert("PODCTL_ADMIN_PASSWORD".to_string(), password.admin_password.clone());
                env.insert("PODCTL_USER_USERNAME".to_string(), password.user_username.clone());
                env.insert("PODCTL_USER_PASSWORD".to_string(), password.user_password.clone());
            }
        }
        env
    }

    fn security(&self) -> SecuritySpec {
        match self {
            // Official images run as a dedicated uid; the fs_group makes the
            // shared-filesystem mounts writable for them.
            Template::Neo4j => SecuritySpec {
                run_as_user: Some(7474),
                run_as_group: Some(7474),
                fs_group: Some(7474),
            },
            Template::Postgres => SecuritySpec {
                run_as_user: Some(999),
                run_as_group: Some(999),
                fs_group: Some(999),
            },
            Template::Custom { .. } => SecuritySpec::default(),
        }
    }
}

/// Resolve a pod row into the spec the provisioner submits.
///
/// This is pure: every input is already persisted, so a crashed-and-retried
/// spawn resolves to the identical spec.
pub fn workload_spec(
    pod: &Pod,
    site_id: &str,
    tenant_id: &TenantId,
    password: &Password,
    allowlist: &HashMap<String, Vec<String>>,
) -> Result<WorkloadSpec, String> {
    let template = Template::resolve(&pod.pod_template, tenant_id, allowlist)?;

    let name = pod
        .k8_name
        .parse::<WorkloadName>()
        .map_err(|e| format!("pod '{}' has unparseable workload name: {e}", pod.id))?;

    let ports = pod
        .networking
        .iter()
        .map(|(entry_name, entry)| PortSpec {
            name: entry_name.clone(),
            port: entry.port,
            protocol: entry.protocol,
        })
        .collect();

    let mut env = pod.environment_variables.clone();
    // Template credentials win over user-supplied variables.
    env.extend(template.credential_env(password));

    let mounts = pod
        .volume_mounts
        .values()
        .map(|mount| MountSpec {
            claim: WorkloadName::new(WorkloadPrefix::Podvol, site_id, tenant_id, &mount.source_id).to_string(),
            mount_path: mount.mount_path.clone(),
            sub_path: mount.sub_path.clone(),
            read_only: mount.read_only,
        })
        .collect();

    Ok(WorkloadSpec {
        name,
        image: template.image().to_string(),
        command: pod.command.clone(),
        ports,
        env,
        resources: ResourceQuantities {
            cpu_request: format!("{}m", pod.resources.cpu_request_millis),
            cpu_limit: format!("{}m", pod.resources.cpu_limit_millis),
            memory_request: format!("{}Mi", pod.resources.memory_request_mb),
            memory_limit: format!("{}Mi", pod.resources.memory_limit_mb),
        },
        mounts,
        security: template.security(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::pods::{MountDescriptor, MountKind, NetworkEntryRequest, NewPod, Protocol, ResourceSpec};
    use crate::types::{PermissionSet, RequestContext};

    fn allowlist() -> HashMap<String, Vec<String>> {
        HashMap::from([("acme".to_string(), vec!["ghcr.io/acme/".to_string()])])
    }

    fn build_pod(template: &str) -> Pod {
        let ctx = RequestContext::new("eu1", "acme", "alice");
        let mut networking = BTreeMap::new();
        networking.insert(
            "bolt".to_string(),
            NetworkEntryRequest {
                port: 7687,
                protocol: Protocol::Tcp,
            },
        );
        let mut volume_mounts = BTreeMap::new();
        volume_mounts.insert(
            "data".to_string(),
            MountDescriptor {
                kind: MountKind::Volume,
                source_id: "vol1".to_string(),
                mount_path: "/data".to_string(),
                sub_path: None,
                read_only: false,
            },
        );
        Pod::build(
            &ctx,
            NewPod {
                id: "graph1".to_string(),
                pod_template: template.to_string(),
                networking,
                resources: ResourceSpec {
                    cpu_request_millis: 500,
                    cpu_limit_millis: 1000,
                    memory_request_mb: 512,
                    memory_limit_mb: 1024,
                },
                volume_mounts,
                permissions: PermissionSet::parse(&["alice:ADMIN".to_string()]).unwrap(),
                environment_variables: BTreeMap::from([("NEO4J_AUTH".to_string(), "spoofed".to_string())]),
                command: Vec::new(),
                ttl_seconds: -1,
            },
            "pods.example.com",
        )
        .unwrap()
    }

    #[test]
    fn builtin_templates_parse() {
        assert_eq!("neo4j".parse::<Template>().unwrap(), Template::Neo4j);
        assert_eq!("postgres".parse::<Template>().unwrap(), Template::Postgres);
        assert!("mysql".parse::<Template>().is_err());
        assert!("custom-".parse::<Template>().is_err());
    }

    #[test]
    fn custom_images_are_gated_by_tenant_allowlist() {
        let allow = allowlist();
        assert!(Template::resolve("custom-ghcr.io/acme/app:1.2", &"acme".to_string(), &allow).is_ok());
        assert!(Template::resolve("custom-docker.io/evil:latest", &"acme".to_string(), &allow).is_err());
        // Tenant with no allowlist entry cannot run custom images at all.
        assert!(Template::resolve("custom-ghcr.io/acme/app:1.2", &"other".to_string(), &allow).is_err());
        // Built-ins are unaffected by the allowlist.
        assert!(Template::resolve("neo4j", &"other".to_string(), &allow).is_ok());
    }

    #[test]
    fn spec_resolution_is_deterministic_and_injects_credentials() {
        let pod = build_pod("neo4j");
        let password = Password::generate(&pod.id);

        let spec = workload_spec(&pod, "eu1", &"acme".to_string(), &password, &allowlist()).unwrap();
        let again = workload_spec(&pod, "eu1", &"acme".to_string(), &password, &allowlist()).unwrap();
        assert_eq!(spec, again);

        assert_eq!(spec.name.to_string(), "pods-eu1-acme-graph1");
        assert_eq!(spec.image, NEO4J_IMAGE);
        assert_eq!(spec.resources.cpu_request, "500m");
        assert_eq!(spec.resources.memory_limit, "1024Mi");
        assert_eq!(spec.mounts[0].claim, "podvol-eu1-acme-vol1");
        assert_eq!(spec.ports[0].port, 7687);

        // The user-supplied NEO4J_AUTH must be overridden by the template.
        assert_eq!(
            spec.env["NEO4J_AUTH"],
            format!("{}/{}", password.admin_username, password.admin_password)
        );
    }

    #[test]
    fn disallowed_template_fails_resolution() {
        let pod = build_pod("custom-docker.io/evil:latest");
        let password = Password::generate(&pod.id);
        assert!(workload_spec(&pod, "eu1", &"acme".to_string(), &password, &allowlist()).is_err());
    }
}
