//! Authorization guard: the check every protected operation makes first.

use uuid::Uuid;

use super::auth::Principal;
use super::metrics::AuthzMetrics;
use super::resolver::GrantResolver;
use crate::errors::AppError;
use crate::models::permission::Permission;
use crate::models::resolved::{Grant, ResolvedPermissionSet};
use crate::models::resource::ResourcePath;

#[derive(Clone)]
pub struct Guard {
    resolver: GrantResolver,
}

impl Guard {
    pub fn new(resolver: GrantResolver) -> Self {
        Self { resolver }
    }

    /// What the principal may currently do in an organization. Tokens are
    /// bound to their own organization and resolve to nothing elsewhere.
    pub async fn resolved_permissions(
        &self,
        principal: &Principal,
        organization_id: Uuid,
    ) -> Result<ResolvedPermissionSet, AppError> {
        match principal {
            Principal::User(user) => self.resolver.resolve_user(organization_id, user.id).await,
            Principal::AccessToken(auth) if auth.token.organization_id == organization_id => {
                Ok(auth.resolved.clone())
            }
            Principal::AccessToken(_) => Ok(ResolvedPermissionSet::empty(organization_id)),
        }
    }

    /// Grants the principal holds, used to bound what it may delegate.
    pub async fn grants(
        &self,
        principal: &Principal,
        organization_id: Uuid,
    ) -> Result<Vec<Grant>, AppError> {
        match principal {
            Principal::User(user) => Ok(self
                .resolver
                .member_grants(organization_id, user.id)
                .await?
                .unwrap_or_default()),
            Principal::AccessToken(auth) if auth.token.organization_id == organization_id => {
                self.resolver.effective_grants(&auth.token).await
            }
            Principal::AccessToken(_) => Ok(vec![]),
        }
    }

    /// Non-failing form of `require`, for queries that hide what the caller
    /// cannot see.
    pub async fn can(
        &self,
        principal: &Principal,
        permission: Permission,
        resource: &ResourcePath,
    ) -> Result<bool, AppError> {
        let resolved = self
            .resolved_permissions(principal, resource.organization_id)
            .await?;
        let allowed = resolved.allows(permission, resource);
        AuthzMetrics::global().record_decision(permission, allowed);
        Ok(allowed)
    }

    /// Fails `Unauthorized` naming `permission` unless it is granted on `resource`.
    pub async fn require(
        &self,
        principal: &Principal,
        permission: Permission,
        resource: &ResourcePath,
    ) -> Result<(), AppError> {
        if self.can(principal, permission, resource).await? {
            return Ok(());
        }
        tracing::warn!(
            permission = %permission,
            organization_id = %resource.organization_id,
            project_id = ?resource.project_id,
            target_id = ?resource.target_id,
            child = ?resource.child,
            "permission denied"
        );
        Err(AppError::unauthorized(permission))
    }
}

// ── Tests ───────────────────────────────────────────────────────
