//! Member roles and role assignments.
//!
//! A member's live grant is the union over their role assignments, each role's
//! permissions restricted to that assignment's resources.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::permission::Permission;
use super::resource::ResourceScope;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberRole {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub description: String,
    pub permissions: Vec<Permission>,
}

/// A role bound to the resources it applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleAssignment {
    pub role: MemberRole,
    pub resources: ResourceScope,
}

/// Current membership of a user in an organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    pub organization_id: Uuid,
    pub user_id: Uuid,
    pub is_owner: bool,
    pub assignments: Vec<RoleAssignment>,
}
