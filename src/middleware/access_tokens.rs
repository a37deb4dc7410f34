//! Access token lifecycle: creation, bearer lookup, cache purge and deletion.
//!
//! The record is read from the store on every lookup; only the resolved
//! permission set is cached. A deleted token therefore fails the next lookup
//! even while a cache entry for it is still warm.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use super::auth::{AuthenticatedToken, Principal};
use super::guard::Guard;
use super::metrics::AuthzMetrics;
use super::resolver::GrantResolver;
use crate::cache::TieredCache;
use crate::errors::{AppError, InputErrors};
use crate::models::permission::{Level, Permission, PermissionCatalog};
use crate::models::resolved::{Grant, ResolvedPermissionSet};
use crate::models::resource::{is_valid_name, ResourcePath, ResourceScope, TargetScope};
use crate::models::token::{
    hash_secret, is_well_formed_secret, validate_description, validate_title, AccessKey,
    AccessToken, TokenKind, TokenOwner,
};
use crate::store::{
    ResourceDirectory, Stores, TokenCursor, TokenFilter, TokenPage, TokenStore, MAX_PAGE_SIZE,
};

/// What a new token is created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenTarget {
    Organization(Uuid),
    Project(Uuid),
    /// A personal token of the calling user in this organization.
    Personal(Uuid),
}

impl TokenTarget {
    pub fn kind(self) -> TokenKind {
        match self {
            TokenTarget::Organization(_) => TokenKind::Organization,
            TokenTarget::Project(_) => TokenKind::Project,
            TokenTarget::Personal(_) => TokenKind::Personal,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateAccessToken {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub permissions: Vec<String>,
    /// Defaults to no resources at all.
    #[serde(default = "ResourceScope::none")]
    pub resources: ResourceScope,
}

/// A new token and its secret. The secret is not retrievable afterwards.
#[derive(Debug, Clone)]
pub struct CreatedAccessToken {
    pub token: AccessToken,
    pub private_access_key: String,
}

/// Requested page of a token listing. A missing or non-positive `first`
/// means the largest page.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageRequest {
    #[serde(default)]
    pub first: Option<i64>,
    #[serde(default)]
    pub after: Option<String>,
}

impl PageRequest {
    pub fn limit(&self) -> usize {
        match self.first {
            Some(first) if first > 0 => (first as usize).min(MAX_PAGE_SIZE),
            _ => MAX_PAGE_SIZE,
        }
    }

    pub fn cursor(&self) -> Result<Option<TokenCursor>, AppError> {
        match self.after.as_deref() {
            None => Ok(None),
            Some(after) => TokenCursor::decode(after).map(Some).ok_or_else(|| {
                AppError::InvalidInput(InputErrors {
                    after: Some("Invalid cursor.".to_string()),
                    ..InputErrors::default()
                })
            }),
        }
    }
}

pub fn cache_key(token_id: Uuid) -> String {
    format!("authz:resolved:{}", token_id)
}

pub struct AccessTokens {
    tokens: Arc<dyn TokenStore>,
    directory: Arc<dyn ResourceDirectory>,
    resolver: GrantResolver,
    guard: Guard,
    cache: TieredCache,
    ttl: Duration,
}

impl AccessTokens {
    pub fn new(
        stores: &Stores,
        resolver: GrantResolver,
        guard: Guard,
        cache: TieredCache,
        ttl: Duration,
    ) -> Self {
        Self {
            tokens: stores.tokens.clone(),
            directory: stores.directory.clone(),
            resolver,
            guard,
            cache,
            ttl,
        }
    }

    pub fn cache(&self) -> &TieredCache {
        &self.cache
    }

    // -- Creation --

    pub async fn create(
        &self,
        principal: &Principal,
        target: TokenTarget,
        input: CreateAccessToken,
    ) -> Result<CreatedAccessToken, AppError> {
        let kind = target.kind();
        let modify = kind.modify_permission();

        let (title, description) = validate_text(&input)?;

        // Unknown resources look exactly like missing permission.
        let (organization_id, path) = match target {
            TokenTarget::Organization(id) | TokenTarget::Personal(id) => {
                let org = self
                    .directory
                    .get_organization(id)
                    .await?
                    .ok_or_else(|| AppError::unauthorized(modify))?;
                (org.id, ResourcePath::organization(org.id))
            }
            TokenTarget::Project(id) => {
                let project = self
                    .directory
                    .get_project(id)
                    .await?
                    .ok_or_else(|| AppError::unauthorized(modify))?;
                (
                    project.organization_id,
                    ResourcePath::project(project.organization_id, project.id),
                )
            }
        };

        self.guard.require(principal, modify, &path).await?;

        let owner = match target {
            TokenTarget::Organization(_) => TokenOwner::Organization,
            TokenTarget::Project(project_id) => TokenOwner::Project { project_id },
            TokenTarget::Personal(_) => match principal.session_user() {
                Some(user) => TokenOwner::User { user_id: user.id },
                None => return Err(AppError::unauthorized(modify)),
            },
        };

        let permissions = PermissionCatalog::global()
            .parse_all(&input.permissions)
            .map_err(|unknown| {
                AppError::InvalidInput(InputErrors::permissions(format!(
                    "Unknown permissions: {}.",
                    unknown.join(", ")
                )))
            })?;

        if let TokenOwner::Project { .. } = owner {
            if let Some(p) = permissions.iter().find(|p| p.level() == Level::Organization) {
                return Err(AppError::InvalidInput(InputErrors::permissions(format!(
                    "Permission '{}' cannot be assigned to a project access token.",
                    p
                ))));
            }
        }

        let resources = match owner {
            TokenOwner::Project { project_id } => {
                input.resources.intersect(&ResourceScope::project(project_id))
            }
            _ => input.resources.normalized(),
        };
        self.check_resources_exist(organization_id, &resources).await?;

        let held = self.guard.grants(principal, organization_id).await?;
        if let Some(p) = first_escalation(&permissions, &resources, &held) {
            tracing::warn!(permission = %p, "token creation exceeds the creator's access");
            return Err(AppError::InvalidInput(InputErrors::permissions(format!(
                "Cannot grant '{}' on resources beyond your own access.",
                p
            ))));
        }

        let key = AccessKey::generate(kind);
        let token = AccessToken {
            id: Uuid::new_v4(),
            organization_id,
            owner,
            title,
            description,
            permissions,
            resources,
            first_characters: key.first_characters,
            secret_hash: key.hash,
            created_at: Utc::now(),
            created_by: principal.user_id(),
        };
        self.tokens.insert_token(&token).await?;

        tracing::info!(
            token_id = %token.id,
            kind = token.kind().as_str(),
            organization_id = %organization_id,
            first_characters = %token.first_characters,
            "access token created"
        );

        Ok(CreatedAccessToken {
            token,
            private_access_key: key.secret,
        })
    }

    async fn check_resources_exist(
        &self,
        organization_id: Uuid,
        resources: &ResourceScope,
    ) -> Result<(), AppError> {
        if let Some(name) = resources.names().find(|n| !is_valid_name(n)) {
            return Err(AppError::InvalidInput(InputErrors::resources(format!(
                "Invalid service or app deployment name '{}'.",
                name
            ))));
        }
        let ResourceScope::Granular { projects } = resources else {
            return Ok(());
        };
        for scope in projects {
            let exists = self
                .directory
                .get_project(scope.project_id)
                .await?
                .is_some_and(|p| p.organization_id == organization_id);
            if !exists {
                return Err(AppError::InvalidInput(InputErrors::resources(format!(
                    "Project '{}' does not exist.",
                    scope.project_id
                ))));
            }
            if let TargetScope::Granular { targets } = &scope.targets {
                for target in targets {
                    let exists = self
                        .directory
                        .get_target(target.target_id)
                        .await?
                        .is_some_and(|t| t.project_id == scope.project_id);
                    if !exists {
                        return Err(AppError::InvalidInput(InputErrors::resources(format!(
                            "Target '{}' does not exist.",
                            target.target_id
                        ))));
                    }
                }
            }
        }
        Ok(())
    }

    // -- Lookup --

    /// Authenticate a bearer secret. Every failure is `InvalidToken`.
    pub async fn lookup(&self, secret: &str) -> Result<AuthenticatedToken, AppError> {
        let result = self.lookup_secret(secret).await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(AppError::InvalidToken) => "invalid",
            Err(_) => "error",
        };
        AuthzMetrics::global().record_authentication(outcome);
        result
    }

    async fn lookup_secret(&self, secret: &str) -> Result<AuthenticatedToken, AppError> {
        if !is_well_formed_secret(secret) {
            tracing::warn!("rejected malformed access token");
            return Err(AppError::InvalidToken);
        }
        let kind = TokenKind::from_secret(secret).ok_or(AppError::InvalidToken)?;

        let token = self
            .tokens
            .get_token_by_hash(&hash_secret(secret))
            .await?
            .filter(|token| token.kind() == kind)
            .ok_or_else(|| {
                tracing::warn!(kind = kind.as_str(), "rejected unknown access token");
                AppError::InvalidToken
            })?;

        let resolved = match self.resolved(&token).await {
            Ok(resolved) => resolved,
            Err(AppError::NotFound) => {
                tracing::warn!(token_id = %token.id, "access token owner no longer exists");
                return Err(AppError::InvalidToken);
            }
            Err(e) => return Err(e),
        };

        Ok(AuthenticatedToken { token, resolved })
    }

    /// Resolved permissions of a token, from cache when warm.
    pub async fn resolved(&self, token: &AccessToken) -> Result<ResolvedPermissionSet, AppError> {
        let key = cache_key(token.id);
        if let Some(resolved) = self.cache.get::<ResolvedPermissionSet>(&key).await {
            tracing::debug!(token_id = %token.id, "permission cache hit");
            AuthzMetrics::global().record_cache(true);
            return Ok(resolved);
        }

        tracing::debug!(token_id = %token.id, "permission cache miss");
        AuthzMetrics::global().record_cache(false);
        // A purge landing while we resolve must win over this result.
        let generation = self.cache.generation(&key);
        let resolved = self.resolver.resolve_token(token).await?;
        match self
            .cache
            .set_if_current(&key, generation, &resolved, self.ttl)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(token_id = %token.id, "purged during resolution, not cached");
            }
            Err(e) => {
                tracing::warn!(token_id = %token.id, error = %e, "failed to cache resolved permissions");
            }
        }
        Ok(resolved)
    }

    /// Drop the cached resolution of a token; the next lookup recomputes it.
    pub async fn purge(&self, token_id: Uuid) {
        self.cache.invalidate(&cache_key(token_id)).await;
        tracing::info!(token_id = %token_id, "access token cache purged");
    }

    // -- Deletion --

    pub async fn delete(&self, principal: &Principal, token_id: Uuid) -> Result<Uuid, AppError> {
        let token = self
            .tokens
            .get_token(token_id)
            .await?
            .ok_or_else(|| AppError::unauthorized(TokenKind::Organization.modify_permission()))?;

        let modify = token.kind().modify_permission();
        let path = match token.owner {
            TokenOwner::Organization => ResourcePath::organization(token.organization_id),
            TokenOwner::Project { project_id } => {
                ResourcePath::project(token.organization_id, project_id)
            }
            TokenOwner::User { user_id } => {
                if principal.user_id() != Some(user_id) {
                    return Err(AppError::unauthorized(modify));
                }
                ResourcePath::organization(token.organization_id)
            }
        };
        self.guard.require(principal, modify, &path).await?;

        self.delete_unchecked(token_id).await?;
        Ok(token_id)
    }

    /// Delete without a permission check. Used by the operator CLI.
    pub async fn delete_unchecked(&self, token_id: Uuid) -> Result<bool, AppError> {
        let deleted = self.tokens.delete_token(token_id).await?;
        self.cache.invalidate(&cache_key(token_id)).await;
        if deleted {
            tracing::info!(token_id = %token_id, "access token deleted");
        }
        Ok(deleted)
    }

    // -- Listing --

    pub async fn list_organization_tokens(
        &self,
        principal: &Principal,
        organization_id: Uuid,
        page: &PageRequest,
    ) -> Result<TokenPage, AppError> {
        let modify = TokenKind::Organization.modify_permission();
        self.require_on_organization(principal, organization_id, modify)
            .await?;
        Ok(self
            .tokens
            .list_tokens(&TokenFilter {
                organization_id,
                kind: TokenKind::Organization,
                project_id: None,
                user_id: None,
                first: page.limit(),
                after: page.cursor()?,
            })
            .await?)
    }

    pub async fn list_project_tokens(
        &self,
        principal: &Principal,
        project_id: Uuid,
        page: &PageRequest,
    ) -> Result<TokenPage, AppError> {
        let modify = TokenKind::Project.modify_permission();
        let project = self
            .directory
            .get_project(project_id)
            .await?
            .ok_or_else(|| AppError::unauthorized(modify))?;
        self.guard
            .require(
                principal,
                modify,
                &ResourcePath::project(project.organization_id, project.id),
            )
            .await?;
        Ok(self
            .tokens
            .list_tokens(&TokenFilter {
                organization_id: project.organization_id,
                kind: TokenKind::Project,
                project_id: Some(project.id),
                user_id: None,
                first: page.limit(),
                after: page.cursor()?,
            })
            .await?)
    }

    /// The caller's own personal tokens.
    pub async fn list_personal_tokens(
        &self,
        principal: &Principal,
        organization_id: Uuid,
        page: &PageRequest,
    ) -> Result<TokenPage, AppError> {
        let modify = TokenKind::Personal.modify_permission();
        self.require_on_organization(principal, organization_id, modify)
            .await?;
        let user_id = principal
            .user_id()
            .ok_or_else(|| AppError::unauthorized(modify))?;
        Ok(self
            .tokens
            .list_tokens(&TokenFilter {
                organization_id,
                kind: TokenKind::Personal,
                project_id: None,
                user_id: Some(user_id),
                first: page.limit(),
                after: page.cursor()?,
            })
            .await?)
    }

    async fn require_on_organization(
        &self,
        principal: &Principal,
        organization_id: Uuid,
        permission: Permission,
    ) -> Result<(), AppError> {
        if self.directory.get_organization(organization_id).await?.is_none() {
            return Err(AppError::unauthorized(permission));
        }
        self.guard
            .require(principal, permission, &ResourcePath::organization(organization_id))
            .await
    }
}

fn validate_text(input: &CreateAccessToken) -> Result<(String, String), AppError> {
    let title = validate_title(&input.title);
    let description = validate_description(input.description.as_deref());
    match (title, description) {
        (Ok(title), Ok(description)) => Ok((title, description)),
        (title, description) => Err(AppError::InvalidInput(InputErrors {
            title: title.err(),
            description: description.err(),
            ..InputErrors::default()
        })),
    }
}

/// First requested permission the creator could not delegate on `resources`.
/// Organization-level permissions only need to be held; the others must be
/// held on every requested resource.
fn first_escalation(
    requested: &[Permission],
    resources: &ResourceScope,
    held: &[Grant],
) -> Option<Permission> {
    requested.iter().copied().find(|permission| {
        let holding: Vec<&Grant> = held
            .iter()
            .filter(|g| g.permissions.contains(permission))
            .collect();
        if holding.is_empty() {
            return true;
        }
        if permission.level() == Level::Organization {
            return false;
        }
        let reach = holding
            .iter()
            .fold(ResourceScope::none(), |acc, g| acc.union(&g.resources));
        !resources.is_subset_of(&reach)
    })
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn grant(ids: &[&str], resources: ResourceScope) -> Grant {
        Grant::new(ids.iter().map(|id| Permission::known(id)).collect(), resources)
    }

    #[test]
    fn test_escalation_requires_holding_the_permission() {
        let held = vec![grant(&["project:describe"], ResourceScope::All)];
        let requested = [Permission::known("project:delete")];
        assert_eq!(
            first_escalation(&requested, &ResourceScope::All, &held),
            Some(Permission::known("project:delete"))
        );
    }

    #[test]
    fn test_escalation_checks_resources_per_permission() {
        let (p1, p2) = (Uuid::new_v4(), Uuid::new_v4());
        let held = vec![
            grant(&["project:describe"], ResourceScope::project(p1)),
            grant(&["project:delete"], ResourceScope::project(p2)),
        ];
        let describe = [Permission::known("project:describe")];
        assert_eq!(first_escalation(&describe, &ResourceScope::project(p1), &held), None);
        assert_eq!(
            first_escalation(&describe, &ResourceScope::project(p2), &held),
            Some(describe[0])
        );
        assert!(first_escalation(&describe, &ResourceScope::All, &held).is_some());
    }

    #[test]
    fn test_organization_permission_ignores_resources() {
        let held = vec![grant(&["member:describe"], ResourceScope::none())];
        let requested = [Permission::known("member:describe")];
        assert_eq!(first_escalation(&requested, &ResourceScope::All, &held), None);
    }

    #[test]
    fn test_text_validation_reports_both_fields() {
        let input = CreateAccessToken {
            title: "x".into(),
            description: Some("d".repeat(249)),
            permissions: vec![],
            resources: ResourceScope::none(),
        };
        match validate_text(&input) {
            Err(AppError::InvalidInput(details)) => {
                assert_eq!(details.title.as_deref(), Some("Minimum length is 2 characters."));
                assert_eq!(
                    details.description.as_deref(),
                    Some("Maximum length is 248 characters.")
                );
                assert!(details.permissions.is_none());
            }
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_page_size_is_capped() {
        let page = |first| PageRequest { first, after: None };
        assert_eq!(page(None).limit(), MAX_PAGE_SIZE);
        assert_eq!(page(Some(0)).limit(), MAX_PAGE_SIZE);
        assert_eq!(page(Some(-3)).limit(), MAX_PAGE_SIZE);
        assert_eq!(page(Some(5)).limit(), 5);
        assert_eq!(page(Some(500)).limit(), MAX_PAGE_SIZE);
    }

    #[test]
    fn test_bad_cursor_is_invalid_input() {
        let page = PageRequest {
            first: None,
            after: Some("%%%".into()),
        };
        match page.cursor() {
            Err(AppError::InvalidInput(details)) => {
                assert_eq!(details.after.as_deref(), Some("Invalid cursor."))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_create_input_defaults_to_no_resources() {
        let input: CreateAccessToken =
            serde_json::from_str(r#"{"title":"ci","permissions":["project:describe"]}"#).unwrap();
        assert!(input.resources.is_empty());
        assert!(input.description.is_none());
    }
}
