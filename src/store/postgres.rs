use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use super::{MembershipStore, ResourceDirectory, TokenFilter, TokenPage, TokenStore};
use crate::models::organization::{Organization, Project, Target};
use crate::models::permission::{Permission, PermissionCatalog};
use crate::models::resource::ResourceScope;
use crate::models::role::{MemberRole, Membership, RoleAssignment};
use crate::models::token::{AccessToken, TokenKind, TokenOwner};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    /// Run pending migrations from the migrations/ directory.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

/// Permission ids read back from storage. Ids dropped from the catalog since
/// the row was written are skipped; they can no longer grant anything.
fn known_permissions(ids: &[String], row_id: Uuid) -> Vec<Permission> {
    let catalog = PermissionCatalog::global();
    ids.iter()
        .filter_map(|id| {
            let permission = catalog.lookup(id);
            if permission.is_none() {
                tracing::warn!(row_id = %row_id, permission = %id, "ignoring unknown stored permission");
            }
            permission
        })
        .collect()
}

// -- Token Operations --

const TOKEN_COLUMNS: &str = "id, organization_id, kind, project_id, user_id, title, description, \
     permissions, resources, first_characters, secret_hash, created_at, created_by";

#[derive(Debug, sqlx::FromRow)]
struct TokenRow {
    id: Uuid,
    organization_id: Uuid,
    kind: String,
    project_id: Option<Uuid>,
    user_id: Option<Uuid>,
    title: String,
    description: String,
    permissions: Vec<String>,
    resources: Json<ResourceScope>,
    first_characters: String,
    secret_hash: String,
    created_at: DateTime<Utc>,
    created_by: Option<Uuid>,
}

impl TryFrom<TokenRow> for AccessToken {
    type Error = anyhow::Error;

    fn try_from(row: TokenRow) -> anyhow::Result<Self> {
        let kind = TokenKind::parse(&row.kind)
            .with_context(|| format!("token {} has unknown kind '{}'", row.id, row.kind))?;
        let owner = match kind {
            TokenKind::Organization => TokenOwner::Organization,
            TokenKind::Project => TokenOwner::Project {
                project_id: row
                    .project_id
                    .with_context(|| format!("project token {} has no project", row.id))?,
            },
            TokenKind::Personal => TokenOwner::User {
                user_id: row
                    .user_id
                    .with_context(|| format!("personal token {} has no user", row.id))?,
            },
        };
        Ok(AccessToken {
            permissions: known_permissions(&row.permissions, row.id),
            id: row.id,
            organization_id: row.organization_id,
            owner,
            title: row.title,
            description: row.description,
            resources: row.resources.0,
            first_characters: row.first_characters,
            secret_hash: row.secret_hash,
            created_at: row.created_at,
            created_by: row.created_by,
        })
    }
}

#[async_trait]
impl TokenStore for PgStore {
    async fn insert_token(&self, token: &AccessToken) -> anyhow::Result<()> {
        let (project_id, user_id) = match token.owner {
            TokenOwner::Organization => (None, None),
            TokenOwner::Project { project_id } => (Some(project_id), None),
            TokenOwner::User { user_id } => (None, Some(user_id)),
        };
        let permissions: Vec<String> = token.permissions.iter().map(|p| p.id().to_string()).collect();

        sqlx::query(
            r#"INSERT INTO access_tokens (id, organization_id, kind, project_id, user_id, title, description,
                                          permissions, resources, first_characters, secret_hash, created_at, created_by)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"#,
        )
        .bind(token.id)
        .bind(token.organization_id)
        .bind(token.kind().as_str())
        .bind(project_id)
        .bind(user_id)
        .bind(&token.title)
        .bind(&token.description)
        .bind(&permissions)
        .bind(Json(&token.resources))
        .bind(&token.first_characters)
        .bind(&token.secret_hash)
        .bind(token.created_at)
        .bind(token.created_by)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_token(&self, id: Uuid) -> anyhow::Result<Option<AccessToken>> {
        let row = sqlx::query_as::<_, TokenRow>(&format!(
            "SELECT {} FROM access_tokens WHERE id = $1",
            TOKEN_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(AccessToken::try_from).transpose()
    }

    async fn get_token_by_hash(&self, secret_hash: &str) -> anyhow::Result<Option<AccessToken>> {
        let row = sqlx::query_as::<_, TokenRow>(&format!(
            "SELECT {} FROM access_tokens WHERE secret_hash = $1",
            TOKEN_COLUMNS
        ))
        .bind(secret_hash)
        .fetch_optional(&self.pool)
        .await?;

        row.map(AccessToken::try_from).transpose()
    }

    async fn delete_token(&self, id: Uuid) -> anyhow::Result<bool> {
        let result = sqlx::query("DELETE FROM access_tokens WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_tokens(&self, filter: &TokenFilter) -> anyhow::Result<TokenPage> {
        let rows = sqlx::query_as::<_, TokenRow>(&format!(
            r#"SELECT {} FROM access_tokens
               WHERE organization_id = $1 AND kind = $2
                 AND ($3::uuid IS NULL OR project_id = $3)
                 AND ($4::uuid IS NULL OR user_id = $4)
                 AND ($5::timestamptz IS NULL OR (created_at, id) < ($5::timestamptz, $6::uuid))
               ORDER BY created_at DESC, id DESC
               LIMIT $7"#,
            TOKEN_COLUMNS
        ))
        .bind(filter.organization_id)
        .bind(filter.kind.as_str())
        .bind(filter.project_id)
        .bind(filter.user_id)
        .bind(filter.after.map(|c| c.created_at))
        .bind(filter.after.map(|c| c.id))
        .bind(filter.first as i64 + 1)
        .fetch_all(&self.pool)
        .await?;

        let tokens = rows
            .into_iter()
            .map(AccessToken::try_from)
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(TokenPage::from_rows(tokens, filter.first))
    }
}

// -- Membership Operations --

#[derive(Debug, sqlx::FromRow)]
struct AssignmentRow {
    role_id: Uuid,
    name: String,
    description: String,
    permissions: Vec<String>,
    resources: Json<ResourceScope>,
}

#[async_trait]
impl MembershipStore for PgStore {
    async fn get_membership(
        &self,
        organization_id: Uuid,
        user_id: Uuid,
    ) -> anyhow::Result<Option<Membership>> {
        let is_owner = sqlx::query_scalar::<_, bool>(
            r#"SELECT o.owner_id = m.user_id
               FROM organization_members m
               JOIN organizations o ON o.id = m.organization_id
               WHERE m.organization_id = $1 AND m.user_id = $2"#,
        )
        .bind(organization_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(is_owner) = is_owner else {
            return Ok(None);
        };

        let rows = sqlx::query_as::<_, AssignmentRow>(
            r#"SELECT r.id AS role_id, r.name, r.description, r.permissions, a.resources
               FROM member_role_assignments a
               JOIN member_roles r ON r.id = a.role_id
               WHERE a.organization_id = $1 AND a.user_id = $2
               ORDER BY a.id"#,
        )
        .bind(organization_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let assignments = rows
            .into_iter()
            .map(|row| RoleAssignment {
                role: MemberRole {
                    permissions: known_permissions(&row.permissions, row.role_id),
                    id: row.role_id,
                    organization_id,
                    name: row.name,
                    description: row.description,
                },
                resources: row.resources.0,
            })
            .collect();

        Ok(Some(Membership {
            organization_id,
            user_id,
            is_owner,
            assignments,
        }))
    }
}

// -- Directory Operations --

#[derive(Debug, sqlx::FromRow)]
struct OrganizationRow {
    id: Uuid,
    slug: String,
    owner_id: Uuid,
}

impl From<OrganizationRow> for Organization {
    fn from(row: OrganizationRow) -> Self {
        Organization {
            id: row.id,
            slug: row.slug,
            owner_id: row.owner_id,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ProjectRow {
    id: Uuid,
    organization_id: Uuid,
    slug: String,
}

impl From<ProjectRow> for Project {
    fn from(row: ProjectRow) -> Self {
        Project {
            id: row.id,
            organization_id: row.organization_id,
            slug: row.slug,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TargetRow {
    id: Uuid,
    project_id: Uuid,
    slug: String,
}

impl From<TargetRow> for Target {
    fn from(row: TargetRow) -> Self {
        Target {
            id: row.id,
            project_id: row.project_id,
            slug: row.slug,
        }
    }
}

#[async_trait]
impl ResourceDirectory for PgStore {
    async fn get_organization(&self, id: Uuid) -> anyhow::Result<Option<Organization>> {
        let row = sqlx::query_as::<_, OrganizationRow>(
            "SELECT id, slug, owner_id FROM organizations WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn get_organization_by_slug(&self, slug: &str) -> anyhow::Result<Option<Organization>> {
        let row = sqlx::query_as::<_, OrganizationRow>(
            "SELECT id, slug, owner_id FROM organizations WHERE slug = $1",
        )
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn get_project(&self, id: Uuid) -> anyhow::Result<Option<Project>> {
        let row = sqlx::query_as::<_, ProjectRow>(
            "SELECT id, organization_id, slug FROM projects WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn get_project_by_slug(
        &self,
        organization_id: Uuid,
        slug: &str,
    ) -> anyhow::Result<Option<Project>> {
        let row = sqlx::query_as::<_, ProjectRow>(
            "SELECT id, organization_id, slug FROM projects WHERE organization_id = $1 AND slug = $2",
        )
        .bind(organization_id)
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn get_target(&self, id: Uuid) -> anyhow::Result<Option<Target>> {
        let row = sqlx::query_as::<_, TargetRow>(
            "SELECT id, project_id, slug FROM targets WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn get_target_by_slug(
        &self,
        project_id: Uuid,
        slug: &str,
    ) -> anyhow::Result<Option<Target>> {
        let row = sqlx::query_as::<_, TargetRow>(
            "SELECT id, project_id, slug FROM targets WHERE project_id = $1 AND slug = $2",
        )
        .bind(project_id)
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }
}
