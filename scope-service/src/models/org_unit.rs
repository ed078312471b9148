//! Org unit model - hierarchical organization structure (materialized path).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::{TenantId, UnitId};

pub const STATUS_ENABLED: i16 = 1;

/// Org unit entity.
///
/// `path` lists the ancestor chain including the unit itself, slash-delimited
/// on both ends (`/1/2/5/`). A unit's path is a strict prefix of the path of
/// every descendant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct OrgUnit {
    pub unit_id: UnitId,
    pub tenant_id: TenantId,
    /// `0` for root units.
    pub parent_id: UnitId,
    pub path: String,
    pub depth: i32,
    pub display_order: i32,
    pub member_count: i32,
    pub status_code: i16,
    pub created_utc: DateTime<Utc>,
}

impl OrgUnit {
    /// Check if this is a root unit.
    pub fn is_root(&self) -> bool {
        self.parent_id == 0
    }

    /// Ancestor ids from the root down, excluding the unit itself.
    pub fn ancestor_ids(&self) -> Vec<UnitId> {
        let mut ids = path_ids(&self.path);
        ids.pop();
        ids
    }

    /// Whether `path` lies in this unit's subtree (the unit itself included).
    pub fn contains(&self, path: &str) -> bool {
        path.starts_with(&self.path)
    }
}

/// Request to create an org unit.
#[derive(Debug, Clone, Deserialize)]
pub struct NewOrgUnit {
    pub tenant_id: TenantId,
    /// `0` creates a root unit.
    #[serde(default)]
    pub parent_id: UnitId,
    #[serde(default)]
    pub display_order: i32,
}

impl NewOrgUnit {
    pub fn root(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            parent_id: 0,
            display_order: 0,
        }
    }

    pub fn child_of(tenant_id: TenantId, parent_id: UnitId) -> Self {
        Self {
            tenant_id,
            parent_id,
            display_order: 0,
        }
    }
}

/// Path of a root unit.
pub fn root_path(unit_id: UnitId) -> String {
    format!("/{}/", unit_id)
}

/// Path of a unit placed directly below `parent_path`.
pub fn child_path(parent_path: &str, unit_id: UnitId) -> String {
    format!("{}{}/", parent_path, unit_id)
}

/// Depth implied by a path: `/1/` is 1, `/1/2/` is 2.
pub fn path_depth(path: &str) -> i32 {
    path_ids(path).len() as i32
}

/// Unit ids encoded in a path, root first. Malformed segments are skipped.
pub fn path_ids(path: &str) -> Vec<UnitId> {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .filter_map(|segment| segment.parse().ok())
        .collect()
}

/// Replace the `old_prefix` of `path` with `new_prefix`. Paths outside the
/// old prefix are returned unchanged.
pub fn rebase_path(path: &str, old_prefix: &str, new_prefix: &str) -> String {
    match path.strip_prefix(old_prefix) {
        Some(rest) => format!("{}{}", new_prefix, rest),
        None => path.to_string(),
    }
}
