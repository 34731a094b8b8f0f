//! The Snapshot entity: a point-in-time copy of (part of) a volume.

use crate::types::{PermissionSet, PodStatus, RequestContext, SnapshotId, VolumeId};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// A point-in-time copy of a volume subtree, with a lifecycle independent of
/// its source: deleting the source volume never touches snapshot files.
///
/// Status progresses REQUESTED -> CREATING_VOLUME -> AVAILABLE while the copy
/// runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    /// The volume this snapshot was taken from. Must exist at validation time;
    /// the reference is informational afterwards.
    pub source_volume_id: VolumeId,
    /// Path within the source volume that was copied (`/` for the whole volume).
    pub source_volume_path: String,
    /// Required when the source path is a single file: where the file lands
    /// inside the snapshot.
    pub destination_path: Option<String>,
    pub status: PodStatus,
    pub permissions: Vec<String>,
    pub revision: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn build(
        _ctx: &RequestContext,
        id: SnapshotId,
        source_volume_id: VolumeId,
        source_volume_path: String,
        destination_path: Option<String>,
        permissions: PermissionSet,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            source_volume_id,
            source_volume_path,
            destination_path,
            status: PodStatus::Requested,
            permissions: permissions.to_tokens(),
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn permission_set(&self) -> PermissionSet {
        PermissionSet::parse(&self.permissions).unwrap_or_else(|errors| {
            tracing::error!("Snapshot '{}' has malformed stored permissions: {errors:?}", self.id);
            PermissionSet::parse(std::slice::from_ref(&"__invalid__:ADMIN".to_string())).expect("fallback set is valid")
        })
    }
}
