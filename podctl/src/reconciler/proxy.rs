//! Reverse-proxy routing config generation.
//!
//! The site sweep regenerates the full routing table from the entity store on
//! every pass and rewrites the config file only when its bytes actually
//! change, so an external proxy watching the file never reloads spuriously.
//! Generation is deterministic: maps are `BTreeMap`s and serialization is
//! stable, so the same set of pods always produces identical bytes.

use crate::db::models::pods::{Pod, Protocol};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;
use tracing::{debug, info};

/// One routing entry, keyed by workload name in the table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteTarget {
    /// Port the proxy forwards to on the workload's service.
    pub routing_port: u16,
    /// External URL clients reach the endpoint at.
    pub url: String,
}

/// The full routing table, partitioned by protocol so the proxy can apply
/// protocol-specific handling (TLS termination for http, passthrough for tcp
/// and postgres).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProxyRoutes {
    pub tcp: BTreeMap<String, RouteTarget>,
    pub http: BTreeMap<String, RouteTarget>,
    pub postgres: BTreeMap<String, RouteTarget>,
}

impl ProxyRoutes {
    /// Build the table from all pods of the site. Only pods whose lifecycle
    /// state implies a live workload are routable. Entries are keyed by the
    /// workload name within each protocol's map.
    pub fn build<'a>(pods: impl IntoIterator<Item = &'a Pod>) -> Self {
        let mut routes = Self::default();
        for pod in pods {
            if !pod.status.expects_workload() {
                continue;
            }
            for entry in pod.networking.values() {
                let target = RouteTarget {
                    routing_port: entry.port,
                    url: entry.url.clone(),
                };
                let map = match entry.protocol {
                    Protocol::Tcp => &mut routes.tcp,
                    Protocol::Http => &mut routes.http,
                    Protocol::Postgres => &mut routes.postgres,
                };
                map.insert(pod.k8_name.clone(), target);
            }
        }
        routes
    }

    /// Stable byte rendering of the table.
    pub fn render(&self) -> Vec<u8> {
        let mut bytes = serde_json::to_vec_pretty(self).expect("routing table serializes");
        bytes.push(b'\n');
        bytes
    }

    /// Write the rendered table to `path` unless the file already holds
    /// identical bytes. Returns whether a write happened.
    pub fn write_if_changed(&self, path: &Path) -> io::Result<bool> {
        let rendered = self.render();
        match fs::read(path) {
            Ok(existing) if existing == rendered => {
                debug!("Proxy config unchanged, skipping write");
                return Ok(false);
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        // Write-then-rename so the proxy never reads a half-written file.
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &rendered)?;
        fs::rename(&tmp, path)?;
        info!("Proxy config rewritten at {}", path.display());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::pods::{NetworkEntryRequest, NewPod, ResourceSpec};
    use crate::types::{PermissionSet, PodStatus, RequestContext};
    use std::collections::BTreeMap as Map;

    fn pod_with_endpoints(id: &str, entries: &[(&str, u16, Protocol)]) -> Pod {
        let ctx = RequestContext::new("eu1", "acme", "alice");
        let networking = entries
            .iter()
            .map(|(name, port, protocol)| {
                (
                    name.to_string(),
                    NetworkEntryRequest {
                        port: *port,
                        protocol: *protocol,
                    },
                )
            })
            .collect();
        let mut pod = Pod::build(
            &ctx,
            NewPod {
                id: id.to_string(),
                pod_template: "neo4j".to_string(),
                networking,
                resources: ResourceSpec {
                    cpu_request_millis: 500,
                    cpu_limit_millis: 1000,
                    memory_request_mb: 512,
                    memory_limit_mb: 1024,
                },
                volume_mounts: Map::new(),
                permissions: PermissionSet::parse(&["alice:ADMIN".to_string()]).unwrap(),
                environment_variables: Map::new(),
                command: Vec::new(),
                ttl_seconds: -1,
            },
            "pods.example.com",
        )
        .unwrap();
        pod.status = PodStatus::Running;
        pod
    }

    #[test]
    fn routes_are_keyed_by_workload_and_partitioned_by_protocol() {
        let pod = pod_with_endpoints("graph1", &[("bolt", 7687, Protocol::Tcp), ("browser", 7474, Protocol::Http)]);
        let routes = ProxyRoutes::build([&pod]);

        assert_eq!(routes.tcp["pods-eu1-acme-graph1"].routing_port, 7687);
        assert_eq!(
            routes.tcp["pods-eu1-acme-graph1"].url,
            "tcp://pods-eu1-acme-graph1-bolt.pods.example.com:7687"
        );
        assert_eq!(routes.http["pods-eu1-acme-graph1"].routing_port, 7474);
        assert_eq!(
            routes.http["pods-eu1-acme-graph1"].url,
            "http://pods-eu1-acme-graph1-browser.pods.example.com:7474"
        );
        assert!(routes.postgres.is_empty());
    }

    #[test]
    fn stopped_pods_are_not_routed() {
        let mut pod = pod_with_endpoints("graph1", &[("bolt", 7687, Protocol::Tcp)]);
        pod.status = PodStatus::Stopped;
        let routes = ProxyRoutes::build([&pod]);
        assert!(routes.tcp.is_empty());
    }

    #[test]
    fn rendering_is_byte_stable() {
        let a = pod_with_endpoints("graph1", &[("bolt", 7687, Protocol::Tcp)]);
        let b = pod_with_endpoints("pg1", &[("db", 5432, Protocol::Postgres)]);

        let first = ProxyRoutes::build([&a, &b]).render();
        let second = ProxyRoutes::build([&b, &a]).render();
        assert_eq!(first, second);
    }

    #[test]
    fn write_if_changed_skips_identical_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routes.json");

        let pod = pod_with_endpoints("graph1", &[("bolt", 7687, Protocol::Tcp)]);
        let routes = ProxyRoutes::build([&pod]);

        assert!(routes.write_if_changed(&path).unwrap());
        assert!(!routes.write_if_changed(&path).unwrap());

        let changed = ProxyRoutes::build(std::iter::empty::<&Pod>());
        assert!(changed.write_if_changed(&path).unwrap());
    }
}
