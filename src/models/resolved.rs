//! Resolved permission sets: what a principal may currently do, per level.
//!
//! A resolved set is a list of statements. Each statement pairs the permissions
//! of one resource level with the resource id patterns they apply to. Patterns
//! are id based (`org`, `org/*`, `org/project`, `org/project/*`,
//! `org/project/target`, `org/project/target/service/<name>`) so they survive
//! slug renames inside the cache; they are rendered by slug only for display.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::permission::{Level, Permission, PermissionSet};
use super::resource::{pattern_matches, ResourcePath, ResourceScope};

/// A set of permissions applying to a resource scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub permissions: PermissionSet,
    pub resources: ResourceScope,
}

impl Grant {
    pub fn new(permissions: PermissionSet, resources: ResourceScope) -> Self {
        Self {
            permissions,
            resources,
        }
    }

    /// Permissions held by both sides, on the resources both sides cover.
    pub fn intersect(&self, other: &Grant) -> Grant {
        Grant {
            permissions: self
                .permissions
                .intersection(&other.permissions)
                .copied()
                .collect(),
            resources: self.resources.intersect(&other.resources),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedStatement {
    pub level: Level,
    pub permissions: PermissionSet,
    pub resolved_resource_ids: Vec<String>,
}

impl ResolvedStatement {
    fn covers(&self, permission: Permission, resource_id: &str) -> bool {
        self.permissions.contains(&permission)
            && self
                .resolved_resource_ids
                .iter()
                .any(|pattern| pattern_matches(pattern, resource_id))
    }
}

/// Cached outcome of grant resolution for one principal in one organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedPermissionSet {
    pub organization_id: Uuid,
    pub statements: Vec<ResolvedStatement>,
}

impl ResolvedPermissionSet {
    pub fn empty(organization_id: Uuid) -> Self {
        Self {
            organization_id,
            statements: vec![],
        }
    }

    /// Flatten grants into per-level statements. Grants are kept apart so a
    /// permission from one grant never applies to another grant's resources;
    /// statements on the same level with identical resource ids are merged.
    pub fn from_grants(organization_id: Uuid, grants: &[Grant]) -> Self {
        let mut statements: Vec<ResolvedStatement> = Vec::new();

        for grant in grants {
            for level in Level::ALL {
                let permissions: PermissionSet = grant
                    .permissions
                    .iter()
                    .copied()
                    .filter(|permission| permission.level() == level)
                    .collect();
                if permissions.is_empty() {
                    continue;
                }
                let resource_ids = grant.resources.resource_patterns(organization_id, level);
                if resource_ids.is_empty() {
                    continue;
                }

                match statements
                    .iter_mut()
                    .find(|s| s.level == level && s.resolved_resource_ids == resource_ids)
                {
                    Some(existing) => existing.permissions.extend(permissions),
                    None => statements.push(ResolvedStatement {
                        level,
                        permissions,
                        resolved_resource_ids: resource_ids,
                    }),
                }
            }
        }

        statements.sort_by_key(|s| s.level);
        Self {
            organization_id,
            statements,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// True if `permission` is granted on `resource`. Fails closed for paths in
    /// another organization or paths too shallow for the permission's level.
    pub fn allows(&self, permission: Permission, resource: &ResourcePath) -> bool {
        if resource.organization_id != self.organization_id {
            return false;
        }
        let Some(resource_id) = resource.at_level(permission.level()) else {
            return false;
        };
        self.statements
            .iter()
            .filter(|s| s.level == permission.level())
            .any(|s| s.covers(permission, &resource_id))
    }

    /// Every permission granted anywhere, regardless of resource.
    pub fn permissions(&self) -> PermissionSet {
        self.statements
            .iter()
            .flat_map(|s| s.permissions.iter().copied())
            .collect()
    }

    pub fn statements_at(&self, level: Level) -> impl Iterator<Item = &ResolvedStatement> {
        self.statements.iter().filter(move |s| s.level == level)
    }

    /// Project and target ids referenced by the resource patterns.
    pub fn referenced_resource_ids(&self) -> BTreeSet<Uuid> {
        self.statements
            .iter()
            .flat_map(|s| s.resolved_resource_ids.iter())
            .flat_map(|pattern| pattern.split('/').skip(1))
            .filter_map(|segment| Uuid::parse_str(segment).ok())
            .collect()
    }

    /// Display form, with every id segment replaced by its slug when known.
    pub fn render(&self, slugs: &HashMap<Uuid, String>) -> Vec<ResolvedPermissionView> {
        let rename = |segment: &str| -> String {
            Uuid::parse_str(segment)
                .ok()
                .and_then(|id| slugs.get(&id).cloned())
                .unwrap_or_else(|| segment.to_string())
        };

        self.statements
            .iter()
            .map(|statement| ResolvedPermissionView {
                level: statement.level,
                resolved_permission_groups: group_permissions(&statement.permissions),
                resolved_resource_ids: statement
                    .resolved_resource_ids
                    .iter()
                    .map(|pattern| pattern.split('/').map(&rename).collect::<Vec<_>>().join("/"))
                    .collect(),
            })
            .collect()
    }
}

// ── Display ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedPermissionView {
    pub level: Level,
    pub resolved_permission_groups: Vec<PermissionGroupView>,
    pub resolved_resource_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionGroupView {
    pub title: &'static str,
    pub permissions: Vec<PermissionView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionView {
    pub id: &'static str,
    pub title: &'static str,
}

/// Group permissions by display group, groups in order of first appearance.
fn group_permissions(permissions: &PermissionSet) -> Vec<PermissionGroupView> {
    let mut groups: Vec<PermissionGroupView> = Vec::new();
    for permission in permissions {
        let view = PermissionView {
            id: permission.id(),
            title: permission.title(),
        };
        match groups.iter_mut().find(|g| g.title == permission.group()) {
            Some(group) => group.permissions.push(view),
            None => groups.push(PermissionGroupView {
                title: permission.group(),
                permissions: vec![view],
            }),
        }
    }
    groups
}

// ── Tests ───────────────────────────────────────────────────────
