//! Grant resolution: the effective permissions of a principal.
//!
//! A token never grants more than it was created with, nor more than its
//! owning principal holds right now. Both sides are expanded through the
//! catalog closure, then every live grant is intersected with the stored one.
//! Live grants are kept apart, so a permission held through one role
//! assignment is never applied to another assignment's resources.

use std::sync::Arc;

use uuid::Uuid;

use crate::errors::AppError;
use crate::models::permission::{Level, Permission, PermissionCatalog, PermissionSet};
use crate::models::resolved::{Grant, ResolvedPermissionSet};
use crate::models::resource::ResourceScope;
use crate::models::role::Membership;
use crate::models::token::{AccessToken, TokenKind, TokenOwner};
use crate::store::{MembershipStore, ResourceDirectory};

#[derive(Clone)]
pub struct GrantResolver {
    memberships: Arc<dyn MembershipStore>,
    directory: Arc<dyn ResourceDirectory>,
}

impl GrantResolver {
    pub fn new(memberships: Arc<dyn MembershipStore>, directory: Arc<dyn ResourceDirectory>) -> Self {
        Self {
            memberships,
            directory,
        }
    }

    /// Live grants of a user in an organization, `None` if the user is not a
    /// member. Fails `NotFound` if the organization does not exist.
    pub async fn member_grants(
        &self,
        organization_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<Vec<Grant>>, AppError> {
        self.directory
            .get_organization(organization_id)
            .await?
            .ok_or(AppError::NotFound)?;

        let membership = self
            .memberships
            .get_membership(organization_id, user_id)
            .await?;
        Ok(membership.as_ref().map(membership_grants))
    }

    /// Live grants of the principal owning `token`: the ceiling the token's
    /// stored grant is clipped to.
    pub async fn owner_grants(&self, token: &AccessToken) -> Result<Vec<Grant>, AppError> {
        self.directory
            .get_organization(token.organization_id)
            .await?
            .ok_or(AppError::NotFound)?;

        match token.owner {
            TokenOwner::Organization => Ok(vec![Grant::new(
                PermissionCatalog::global().all(),
                ResourceScope::All,
            )]),
            TokenOwner::Project { project_id } => {
                let project = self
                    .directory
                    .get_project(project_id)
                    .await?
                    .filter(|p| p.organization_id == token.organization_id)
                    .ok_or(AppError::NotFound)?;
                Ok(vec![Grant::new(
                    below_organization_level(),
                    ResourceScope::project(project.id),
                )])
            }
            TokenOwner::User { user_id } => {
                let membership = self
                    .memberships
                    .get_membership(token.organization_id, user_id)
                    .await?
                    .ok_or(AppError::NotFound)?;
                let grants = membership_grants(&membership);

                // Personal tokens stop working while the owner cannot manage them.
                let gate = TokenKind::Personal.modify_permission();
                if grants.iter().any(|g| g.permissions.contains(&gate)) {
                    Ok(grants)
                } else {
                    tracing::debug!(
                        token_id = %token.id,
                        user_id = %user_id,
                        "personal token owner lacks {}", gate
                    );
                    Ok(vec![])
                }
            }
        }
    }

    /// Effective grants of a token, empty ones dropped.
    pub async fn effective_grants(&self, token: &AccessToken) -> Result<Vec<Grant>, AppError> {
        let stored = stored_grant(token);
        let live = self.owner_grants(token).await?;
        Ok(live
            .iter()
            .map(|grant| grant.intersect(&stored))
            .filter(|grant| !grant.permissions.is_empty())
            .collect())
    }

    pub async fn resolve_token(&self, token: &AccessToken) -> Result<ResolvedPermissionSet, AppError> {
        let grants = self.effective_grants(token).await?;
        let resolved = ResolvedPermissionSet::from_grants(token.organization_id, &grants);
        tracing::debug!(
            token_id = %token.id,
            statements = resolved.statements.len(),
            "resolved token permissions"
        );
        Ok(resolved)
    }

    /// Resolved permissions of a session user. Non-members resolve to the
    /// empty set.
    pub async fn resolve_user(
        &self,
        organization_id: Uuid,
        user_id: Uuid,
    ) -> Result<ResolvedPermissionSet, AppError> {
        let grants = self
            .member_grants(organization_id, user_id)
            .await?
            .unwrap_or_default();
        Ok(ResolvedPermissionSet::from_grants(organization_id, &grants))
    }
}

/// The grant recorded on a token, expanded through the catalog closure.
pub fn stored_grant(token: &AccessToken) -> Grant {
    Grant::new(
        PermissionCatalog::global().expand(&token.permissions),
        token.resources.clone(),
    )
}

fn membership_grants(membership: &Membership) -> Vec<Grant> {
    if membership.is_owner {
        return vec![Grant::new(PermissionCatalog::global().all(), ResourceScope::All)];
    }
    let catalog = PermissionCatalog::global();
    membership
        .assignments
        .iter()
        .map(|assignment| {
            Grant::new(
                catalog.expand(&assignment.role.permissions),
                assignment.resources.clone(),
            )
        })
        .collect()
}

fn below_organization_level() -> PermissionSet {
    PermissionCatalog::global()
        .all()
        .into_iter()
        .filter(|p: &Permission| p.level() != Level::Organization)
        .collect()
}

// ── Tests ───────────────────────────────────────────────────────
