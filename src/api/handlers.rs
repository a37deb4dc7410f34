use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::errors::AppError;
use crate::middleware::access_tokens::{
    CreateAccessToken, CreatedAccessToken, PageRequest, TokenTarget,
};
use crate::middleware::auth::Principal;
use crate::models::organization::Project;
use crate::models::permission::Permission;
use crate::models::resolved::{ResolvedPermissionSet, ResolvedPermissionView};
use crate::models::resource::{ProjectScope, ResourcePath, ResourceScope, TargetScope};
use crate::models::token::AccessToken;
use crate::store::{ResourceDirectory, TokenCursor, TokenPage};
use crate::AppState;

// ── Request / Response DTOs ──────────────────────────────────

/// Project token input: the resources are targets of the project itself.
#[derive(Deserialize)]
pub struct CreateProjectAccessTokenRequest {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub permissions: Vec<String>,
    #[serde(default = "TargetScope::none")]
    pub resources: TargetScope,
}

impl CreateProjectAccessTokenRequest {
    fn into_input(self, project_id: Uuid) -> CreateAccessToken {
        CreateAccessToken {
            title: self.title,
            description: self.description,
            permissions: self.permissions,
            resources: ResourceScope::Granular {
                projects: vec![ProjectScope {
                    project_id,
                    targets: self.resources,
                }],
            },
        }
    }
}

/// Public view of a token. Never carries the secret or its hash.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessTokenView {
    pub id: Uuid,
    pub kind: &'static str,
    pub title: String,
    pub description: String,
    pub permissions: Vec<Permission>,
    pub resources: ResourceScope,
    pub first_characters: String,
    pub created_at: DateTime<Utc>,
}

impl From<AccessToken> for AccessTokenView {
    fn from(token: AccessToken) -> Self {
        Self {
            id: token.id,
            kind: token.kind().as_str(),
            title: token.title,
            description: token.description,
            permissions: token.permissions,
            resources: token.resources,
            first_characters: token.first_characters,
            created_at: token.created_at,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAccessTokenResponse {
    pub private_access_key: String,
    pub created_access_token: AccessTokenView,
}

impl From<CreatedAccessToken> for CreateAccessTokenResponse {
    fn from(created: CreatedAccessToken) -> Self {
        Self {
            private_access_key: created.private_access_key,
            created_access_token: created.token.into(),
        }
    }
}

/// A page of tokens, newest first.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessTokenConnection {
    pub edges: Vec<AccessTokenEdge>,
    pub page_info: PageInfo,
}

#[derive(Serialize)]
pub struct AccessTokenEdge {
    pub node: AccessTokenView,
    pub cursor: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub has_next_page: bool,
    pub end_cursor: Option<String>,
}

impl From<TokenPage> for AccessTokenConnection {
    fn from(page: TokenPage) -> Self {
        let end_cursor = page.end_cursor().map(|c| c.encode());
        Self {
            edges: page
                .tokens
                .into_iter()
                .map(|token| AccessTokenEdge {
                    cursor: TokenCursor::of(&token).encode(),
                    node: token.into(),
                })
                .collect(),
            page_info: PageInfo {
                has_next_page: page.has_next_page,
                end_cursor,
            },
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteAccessTokenResponse {
    pub deleted_access_token_id: Uuid,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhoAmIParams {
    pub organization_id: Option<Uuid>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WhoAmIResponse {
    pub principal: Value,
    pub resolved_permissions: Vec<ResolvedPermissionView>,
}

type Created<T> = (StatusCode, Json<T>);

// ── Access tokens ────────────────────────────────────────────

/// POST /api/v1/organizations/:id/access-tokens
pub async fn create_organization_token(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(organization_id): Path<Uuid>,
    Json(input): Json<CreateAccessToken>,
) -> Result<Created<CreateAccessTokenResponse>, AppError> {
    let created = state
        .tokens
        .create(&principal, TokenTarget::Organization(organization_id), input)
        .await?;
    Ok((StatusCode::CREATED, Json(created.into())))
}

/// POST /api/v1/projects/:id/access-tokens
pub async fn create_project_token(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(project_id): Path<Uuid>,
    Json(payload): Json<CreateProjectAccessTokenRequest>,
) -> Result<Created<CreateAccessTokenResponse>, AppError> {
    let created = state
        .tokens
        .create(
            &principal,
            TokenTarget::Project(project_id),
            payload.into_input(project_id),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(created.into())))
}

/// POST /api/v1/organizations/:id/personal-access-tokens
pub async fn create_personal_token(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(organization_id): Path<Uuid>,
    Json(input): Json<CreateAccessToken>,
) -> Result<Created<CreateAccessTokenResponse>, AppError> {
    let created = state
        .tokens
        .create(&principal, TokenTarget::Personal(organization_id), input)
        .await?;
    Ok((StatusCode::CREATED, Json(created.into())))
}

/// GET /api/v1/organizations/:id/access-tokens
pub async fn list_organization_tokens(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(organization_id): Path<Uuid>,
    Query(page): Query<PageRequest>,
) -> Result<Json<AccessTokenConnection>, AppError> {
    let page = state
        .tokens
        .list_organization_tokens(&principal, organization_id, &page)
        .await?;
    Ok(Json(page.into()))
}

/// GET /api/v1/projects/:id/access-tokens
pub async fn list_project_tokens(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(project_id): Path<Uuid>,
    Query(page): Query<PageRequest>,
) -> Result<Json<AccessTokenConnection>, AppError> {
    let page = state
        .tokens
        .list_project_tokens(&principal, project_id, &page)
        .await?;
    Ok(Json(page.into()))
}

/// GET /api/v1/organizations/:id/personal-access-tokens
pub async fn list_personal_tokens(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(organization_id): Path<Uuid>,
    Query(page): Query<PageRequest>,
) -> Result<Json<AccessTokenConnection>, AppError> {
    let page = state
        .tokens
        .list_personal_tokens(&principal, organization_id, &page)
        .await?;
    Ok(Json(page.into()))
}

/// DELETE /api/v1/access-tokens/:id
pub async fn delete_token(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(token_id): Path<Uuid>,
) -> Result<Json<DeleteAccessTokenResponse>, AppError> {
    let deleted_access_token_id = state.tokens.delete(&principal, token_id).await?;
    Ok(Json(DeleteAccessTokenResponse {
        deleted_access_token_id,
    }))
}

/// POST /api/v1/access-tokens/:id/purge
#[cfg(feature = "test-hooks")]
pub async fn purge_token(
    State(state): State<Arc<AppState>>,
    Path(token_id): Path<Uuid>,
) -> StatusCode {
    state.tokens.purge(token_id).await;
    StatusCode::NO_CONTENT
}

// ── Introspection ────────────────────────────────────────────

/// GET /api/v1/whoami
pub async fn whoami(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Query(params): Query<WhoAmIParams>,
) -> Result<Json<WhoAmIResponse>, AppError> {
    let organization_id = params.organization_id.or(match &principal {
        Principal::AccessToken(auth) => Some(auth.token.organization_id),
        Principal::User(_) => None,
    });

    let resolved_permissions = match organization_id {
        Some(organization_id) => {
            let resolved = state
                .guard
                .resolved_permissions(&principal, organization_id)
                .await?;
            let slugs = slugs_for(state.directory.as_ref(), &resolved).await?;
            resolved.render(&slugs)
        }
        None => vec![],
    };

    Ok(Json(WhoAmIResponse {
        principal: principal_view(&principal),
        resolved_permissions,
    }))
}

fn principal_view(principal: &Principal) -> Value {
    match principal {
        Principal::User(user) => json!({
            "type": "user",
            "id": user.id,
            "email": user.email,
            "displayName": user.display_name,
        }),
        Principal::AccessToken(auth) => json!({
            "type": "accessToken",
            "id": auth.token.id,
            "kind": auth.token.kind().as_str(),
            "title": auth.token.title,
            "organizationId": auth.token.organization_id,
            "firstCharacters": auth.token.first_characters,
        }),
    }
}

/// Slugs of the organization and every project or target a resolved set refers to.
async fn slugs_for(
    directory: &dyn ResourceDirectory,
    resolved: &ResolvedPermissionSet,
) -> Result<HashMap<Uuid, String>, AppError> {
    let mut slugs = HashMap::new();
    if let Some(org) = directory.get_organization(resolved.organization_id).await? {
        slugs.insert(org.id, org.slug);
    }

    let lookups = resolved.referenced_resource_ids().into_iter().map(|id| async move {
        if let Some(project) = directory.get_project(id).await? {
            return anyhow::Ok(Some((id, project.slug)));
        }
        Ok(directory.get_target(id).await?.map(|target| (id, target.slug)))
    });
    slugs.extend(
        futures::future::try_join_all(lookups)
            .await?
            .into_iter()
            .flatten(),
    );
    Ok(slugs)
}

// ── Resources ────────────────────────────────────────────────

/// GET /api/v1/projects/:id
pub async fn get_project(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(project_id): Path<Uuid>,
) -> Result<Json<Project>, AppError> {
    let project = state
        .directory
        .get_project(project_id)
        .await?
        .ok_or(AppError::NotFound)?;
    state
        .guard
        .require(
            &principal,
            Permission::builtin("project:describe"),
            &ResourcePath::project(project.organization_id, project.id),
        )
        .await?;
    Ok(Json(project))
}

/// GET /api/v1/resources/:org/:project/:target
///
/// Each level the caller may not describe, or that does not exist, is `null`.
/// The organization is shown to callers that can describe it or the project.
pub async fn describe_resources(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path((org_slug, project_slug, target_slug)): Path<(String, String, String)>,
) -> Result<Json<Value>, AppError> {
    let directory = state.directory.as_ref();
    let hidden = Json(json!({ "organization": null }));

    let Some(org) = directory.get_organization_by_slug(&org_slug).await? else {
        return Ok(hidden);
    };

    let mut project_view = Value::Null;
    if let Some(project) = directory.get_project_by_slug(org.id, &project_slug).await? {
        let visible = state
            .guard
            .can(
                &principal,
                Permission::builtin("project:describe"),
                &ResourcePath::project(org.id, project.id),
            )
            .await?;
        if visible {
            let target_view = directory
                .get_target_by_slug(project.id, &target_slug)
                .await?
                .map(|t| json!({ "id": t.id, "slug": t.slug }))
                .unwrap_or(Value::Null);
            project_view = json!({
                "id": project.id,
                "slug": project.slug,
                "target": target_view,
            });
        }
    }

    if project_view.is_null()
        && !state
            .guard
            .can(
                &principal,
                Permission::builtin("organization:describe"),
                &ResourcePath::organization(org.id),
            )
            .await?
    {
        return Ok(hidden);
    }

    Ok(Json(json!({
        "organization": {
            "id": org.id,
            "slug": org.slug,
            "project": project_view,
        }
    })))
}

// ── Tests ───────────────────────────────────────────────────────
