//! Workload naming convention shared between the provisioner and the
//! reconciler's parsing.
//!
//! Pod workloads and services are named `pods-{site}-{tenant}-{name}`,
//! volume-backed resources `podvol-{site}-{tenant}-{name}`. The format must be
//! preserved bit-exact: the reconciler recovers ownership of running workloads
//! purely from their names.

use std::fmt;
use std::str::FromStr;

/// Resource family encoded in a workload name's prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkloadPrefix {
    /// Pod workloads and their network services.
    Pods,
    /// Volume-backed resources (persistent volume claims).
    Podvol,
}

impl WorkloadPrefix {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadPrefix::Pods => "pods",
            WorkloadPrefix::Podvol => "podvol",
        }
    }
}

impl fmt::Display for WorkloadPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed `{prefix}-{site}-{tenant}-{name}` workload name.
///
/// Site, tenant, and entity ids contain no `-` (validated lowercase
/// alphanumerics), so splitting on dashes is unambiguous.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkloadName {
    pub prefix: WorkloadPrefix,
    pub site_id: String,
    pub tenant_id: String,
    pub name: String,
}

impl WorkloadName {
    pub fn new(prefix: WorkloadPrefix, site_id: &str, tenant_id: &str, name: &str) -> Self {
        Self {
            prefix,
            site_id: site_id.to_string(),
            tenant_id: tenant_id.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for WorkloadName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}-{}", self.prefix, self.site_id, self.tenant_id, self.name)
    }
}

impl FromStr for WorkloadName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('-');
        let prefix = match parts.next() {
            Some("pods") => WorkloadPrefix::Pods,
            Some("podvol") => WorkloadPrefix::Podvol,
            _ => return Err(format!("workload name '{s}' has an unknown prefix")),
        };
        let (site_id, tenant_id, name) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(site), Some(tenant), Some(name), None) if !site.is_empty() && !tenant.is_empty() && !name.is_empty() => {
                (site.to_string(), tenant.to_string(), name.to_string())
            }
            _ => return Err(format!("workload name '{s}' is not of the form prefix-site-tenant-name")),
        };
        Ok(Self {
            prefix,
            site_id,
            tenant_id,
            name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_names_round_trip() {
        let name = WorkloadName::new(WorkloadPrefix::Pods, "eu1", "acme", "graph1");
        assert_eq!(name.to_string(), "pods-eu1-acme-graph1");
        assert_eq!("pods-eu1-acme-graph1".parse::<WorkloadName>().unwrap(), name);
    }

    #[test]
    fn volume_names_round_trip() {
        let name = WorkloadName::new(WorkloadPrefix::Podvol, "eu1", "acme", "vol1");
        assert_eq!(name.to_string(), "podvol-eu1-acme-vol1");
        assert_eq!("podvol-eu1-acme-vol1".parse::<WorkloadName>().unwrap(), name);
    }

    #[test]
    fn malformed_names_are_rejected_not_fatal() {
        for bad in [
            "",
            "pods",
            "pods-eu1",
            "pods-eu1-acme",
            "pods-eu1-acme-graph1-extra",
            "pods--acme-graph1",
            "deployment-eu1-acme-graph1",
        ] {
            assert!(bad.parse::<WorkloadName>().is_err(), "expected '{bad}' to be rejected");
        }
    }
}
