//! The Volume entity: a persistent shared-filesystem storage unit.

use crate::types::{PermissionSet, PodStatus, RequestContext, VolumeId};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// A persistent storage unit attachable to pods, backed by a directory under
/// `{base}/{tenant}/volumes/{volume_id}` on the site's shared filesystem.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Volume {
    pub id: VolumeId,
    /// Capacity of the backing claim in mebibytes.
    pub size_mb: i64,
    pub status: PodStatus,
    pub permissions: Vec<String>,
    pub revision: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Volume {
    pub fn build(_ctx: &RequestContext, id: VolumeId, size_mb: i64, permissions: PermissionSet) -> Self {
        let now = Utc::now();
        Self {
            id,
            size_mb,
            status: PodStatus::CreatingVolume,
            permissions: permissions.to_tokens(),
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn permission_set(&self) -> PermissionSet {
        PermissionSet::parse(&self.permissions).unwrap_or_else(|errors| {
            tracing::error!("Volume '{}' has malformed stored permissions: {errors:?}", self.id);
            PermissionSet::parse(std::slice::from_ref(&"__invalid__:ADMIN".to_string())).expect("fallback set is valid")
        })
    }
}
