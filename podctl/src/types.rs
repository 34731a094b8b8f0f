//! Common type definitions: entity identifiers, the request context, the pod
//! lifecycle vocabulary, and the permission lattice.
//!
//! # ID Types
//!
//! Entity identifiers are tenant-scoped strings rather than UUIDs: a pod named
//! `analytics` by tenant `acme` at site `eu1` is globally addressed by the
//! `(site, tenant, pod_id)` triple, and by the derived workload name
//! `pods-eu1-acme-analytics` inside the cluster.
//!
//! # Permission System
//!
//! Every entity carries a list of `"username:LEVEL"` tokens. Levels form a
//! total order `READ < USER < ADMIN`, and every entity must keep at least one
//! ADMIN entry at all times - [`PermissionSet::validate`] enforces this.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

// Type aliases for IDs. These are plain strings (validated at entity creation)
// rather than newtypes: they cross the queue, the database, and workload names
// as text, and the compound scope is always carried alongside them in a
// RequestContext.
pub type SiteId = String;
pub type TenantId = String;
pub type PodId = String;
pub type VolumeId = String;
pub type SnapshotId = String;

/// Explicit per-request context, threaded through every operation.
///
/// The tenant/site/user scope is never ambient state: each call receives the
/// context of the request being served, which keeps operations testable and
/// safe under concurrent request handling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub site_id: SiteId,
    pub tenant_id: TenantId,
    pub username: String,
    pub roles: Vec<String>,
}

impl RequestContext {
    pub fn new(site_id: impl Into<SiteId>, tenant_id: impl Into<TenantId>, username: impl Into<String>) -> Self {
        Self {
            site_id: site_id.into(),
            tenant_id: tenant_id.into(),
            username: username.into(),
            roles: Vec::new(),
        }
    }
}

/// Lifecycle state of a pod. This is a closed vocabulary shared with the
/// reconciler's parsing and external consumers; the wire strings must not
/// change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PodStatus {
    #[serde(rename = "STOPPED")]
    Stopped,
    #[serde(rename = "REQUESTED")]
    Requested,
    #[serde(rename = "SPAWNER_SETUP")]
    SpawnerSetup,
    #[serde(rename = "CREATING_CONTAINER")]
    CreatingContainer,
    #[serde(rename = "CREATING_VOLUME")]
    CreatingVolume,
    #[serde(rename = "SUBMITTED")]
    Submitted,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "AVAILABLE")]
    Available,
    #[serde(rename = "SHUTTING_DOWN")]
    ShuttingDown,
    #[serde(rename = "ERROR")]
    Error,
    #[serde(rename = "COMPLETE")]
    Complete,
}

impl PodStatus {
    /// States in which a workload is expected to exist in the cluster.
    pub fn expects_workload(&self) -> bool {
        matches!(
            self,
            PodStatus::CreatingContainer | PodStatus::Submitted | PodStatus::Running | PodStatus::Available
        )
    }

    /// States the spawner or reconciler is actively driving forward.
    pub fn is_active(&self) -> bool {
        !matches!(self, PodStatus::Stopped | PodStatus::Error | PodStatus::Complete)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PodStatus::Stopped => "STOPPED",
            PodStatus::Requested => "REQUESTED",
            PodStatus::SpawnerSetup => "SPAWNER_SETUP",
            PodStatus::CreatingContainer => "CREATING_CONTAINER",
            PodStatus::CreatingVolume => "CREATING_VOLUME",
            PodStatus::Submitted => "SUBMITTED",
            PodStatus::Running => "RUNNING",
            PodStatus::Available => "AVAILABLE",
            PodStatus::ShuttingDown => "SHUTTING_DOWN",
            PodStatus::Error => "ERROR",
            PodStatus::Complete => "COMPLETE",
        }
    }
}

impl fmt::Display for PodStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PodStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STOPPED" => Ok(PodStatus::Stopped),
            "REQUESTED" => Ok(PodStatus::Requested),
            "SPAWNER_SETUP" => Ok(PodStatus::SpawnerSetup),
            "CREATING_CONTAINER" => Ok(PodStatus::CreatingContainer),
            "CREATING_VOLUME" => Ok(PodStatus::CreatingVolume),
            "SUBMITTED" => Ok(PodStatus::Submitted),
            "RUNNING" => Ok(PodStatus::Running),
            "AVAILABLE" => Ok(PodStatus::Available),
            "SHUTTING_DOWN" => Ok(PodStatus::ShuttingDown),
            "ERROR" => Ok(PodStatus::Error),
            "COMPLETE" => Ok(PodStatus::Complete),
            other => Err(format!("unknown pod status '{other}'")),
        }
    }
}

/// The user's intent for a pod, independent of its actual lifecycle state.
///
/// `RESTART` is a pseudo-request: the health loop drives the pod to STOPPED
/// and then flips the intent back to ON, re-entering REQUESTED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusRequested {
    #[serde(rename = "ON")]
    On,
    #[serde(rename = "OFF")]
    Off,
    #[serde(rename = "RESTART")]
    Restart,
}

impl StatusRequested {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusRequested::On => "ON",
            StatusRequested::Off => "OFF",
            StatusRequested::Restart => "RESTART",
        }
    }
}

impl fmt::Display for StatusRequested {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StatusRequested {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ON" => Ok(StatusRequested::On),
            "OFF" => Ok(StatusRequested::Off),
            "RESTART" => Ok(StatusRequested::Restart),
            other => Err(format!("unknown requested status '{other}'")),
        }
    }
}

/// Access level attached to a permission entry. Ordering matters: a level
/// grants everything below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AccessLevel {
    #[serde(rename = "READ")]
    Read,
    #[serde(rename = "USER")]
    User,
    #[serde(rename = "ADMIN")]
    Admin,
}

impl AccessLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessLevel::Read => "READ",
            AccessLevel::User => "USER",
            AccessLevel::Admin => "ADMIN",
        }
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccessLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "READ" => Ok(AccessLevel::Read),
            "USER" => Ok(AccessLevel::User),
            "ADMIN" => Ok(AccessLevel::Admin),
            other => Err(format!("unknown access level '{other}'")),
        }
    }
}

/// One `"username:LEVEL"` permission token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionEntry {
    pub username: String,
    pub level: AccessLevel,
}

impl PermissionEntry {
    pub fn new(username: impl Into<String>, level: AccessLevel) -> Self {
        Self {
            username: username.into(),
            level,
        }
    }

    pub fn to_token(&self) -> String {
        format!("{}:{}", self.username, self.level)
    }
}

impl FromStr for PermissionEntry {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (username, level) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("permission token '{s}' is not of the form 'username:LEVEL'"))?;
        if username.is_empty() {
            return Err(format!("permission token '{s}' has an empty username"));
        }
        let level = level.parse::<AccessLevel>().map_err(|e| format!("permission token '{s}': {e}"))?;
        Ok(Self {
            username: username.to_string(),
            level,
        })
    }
}

/// A parsed permission list with the invariants of the permission model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionSet {
    entries: Vec<PermissionEntry>,
}

impl PermissionSet {
    /// Parse and validate a list of `"username:LEVEL"` tokens.
    ///
    /// Rejects malformed tokens, duplicate usernames, and sets without at
    /// least one ADMIN entry. Rejection applies no state anywhere, so retrying
    /// the same invalid input yields the same rejection.
    pub fn parse(tokens: &[String]) -> Result<Self, Vec<String>> {
        let mut errors = Vec::new();
        let mut entries = Vec::new();
        let mut seen = BTreeSet::new();

        for token in tokens {
            match token.parse::<PermissionEntry>() {
                Ok(entry) => {
                    if !seen.insert(entry.username.clone()) {
                        errors.push(format!("duplicate permission entry for user '{}'", entry.username));
                    } else {
                        entries.push(entry);
                    }
                }
                Err(e) => errors.push(e),
            }
        }

        if !entries.iter().any(|e| e.level == AccessLevel::Admin) {
            errors.push("permissions must contain at least one ADMIN entry".to_string());
        }

        if errors.is_empty() { Ok(Self { entries }) } else { Err(errors) }
    }

    /// Validate an already-parsed set (used on mutation paths).
    pub fn validate(&self) -> Result<(), String> {
        if self.entries.iter().any(|e| e.level == AccessLevel::Admin) {
            Ok(())
        } else {
            Err("permissions must contain at least one ADMIN entry".to_string())
        }
    }

    /// The level granted to `username`, if any.
    pub fn level_for(&self, username: &str) -> Option<AccessLevel> {
        self.entries.iter().find(|e| e.username == username).map(|e| e.level)
    }

    /// Whether `username` holds at least `required`.
    pub fn allows(&self, username: &str, required: AccessLevel) -> bool {
        self.level_for(username).is_some_and(|level| level >= required)
    }

    /// Grant `level` to `username`, upgrading an existing lower entry in place.
    pub fn grant(&mut self, username: &str, level: AccessLevel) {
        match self.entries.iter_mut().find(|e| e.username == username) {
            Some(entry) => entry.level = entry.level.max(level),
            None => self.entries.push(PermissionEntry::new(username, level)),
        }
    }

    pub fn entries(&self) -> &[PermissionEntry] {
        &self.entries
    }

    /// Serialize back to `"username:LEVEL"` tokens for storage.
    pub fn to_tokens(&self) -> Vec<String> {
        self.entries.iter().map(PermissionEntry::to_token).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_wire_strings() {
        for status in [
            PodStatus::Stopped,
            PodStatus::Requested,
            PodStatus::SpawnerSetup,
            PodStatus::CreatingContainer,
            PodStatus::CreatingVolume,
            PodStatus::Submitted,
            PodStatus::Running,
            PodStatus::Available,
            PodStatus::ShuttingDown,
            PodStatus::Error,
            PodStatus::Complete,
        ] {
            assert_eq!(status.as_str().parse::<PodStatus>().unwrap(), status);
        }
        assert!("SLEEPING".parse::<PodStatus>().is_err());
    }

    #[test]
    fn access_levels_are_ordered() {
        assert!(AccessLevel::Read < AccessLevel::User);
        assert!(AccessLevel::User < AccessLevel::Admin);
    }

    #[test]
    fn permission_tokens_parse_and_serialize() {
        let entry: PermissionEntry = "alice:ADMIN".parse().unwrap();
        assert_eq!(entry.username, "alice");
        assert_eq!(entry.level, AccessLevel::Admin);
        assert_eq!(entry.to_token(), "alice:ADMIN");

        assert!("alice".parse::<PermissionEntry>().is_err());
        assert!(":ADMIN".parse::<PermissionEntry>().is_err());
        assert!("alice:OWNER".parse::<PermissionEntry>().is_err());
    }

    #[test]
    fn permission_set_requires_an_admin() {
        let err = PermissionSet::parse(&["bob:READ".to_string(), "carol:USER".to_string()]).unwrap_err();
        assert!(err.iter().any(|e| e.contains("at least one ADMIN")));

        let set = PermissionSet::parse(&["alice:ADMIN".to_string(), "bob:READ".to_string()]).unwrap();
        assert!(set.allows("alice", AccessLevel::Admin));
        assert!(set.allows("bob", AccessLevel::Read));
        assert!(!set.allows("bob", AccessLevel::User));
        assert!(!set.allows("mallory", AccessLevel::Read));
    }

    #[test]
    fn rejection_is_idempotent() {
        let tokens = vec!["bob:READ".to_string()];
        let first = PermissionSet::parse(&tokens).unwrap_err();
        let second = PermissionSet::parse(&tokens).unwrap_err();
        assert_eq!(first, second);
    }

    #[test]
    fn duplicate_usernames_are_rejected() {
        let err = PermissionSet::parse(&["alice:ADMIN".to_string(), "alice:READ".to_string()]).unwrap_err();
        assert!(err.iter().any(|e| e.contains("duplicate")));
    }

    #[test]
    fn grant_upgrades_but_never_downgrades() {
        let mut set = PermissionSet::parse(&["alice:ADMIN".to_string()]).unwrap();
        set.grant("alice", AccessLevel::Read);
        assert_eq!(set.level_for("alice"), Some(AccessLevel::Admin));
        set.grant("bob", AccessLevel::User);
        assert_eq!(set.level_for("bob"), Some(AccessLevel::User));
    }
}
