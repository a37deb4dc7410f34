//! In-memory backend for tests and local development.
//!
//! Role assignments reference roles by id, so editing a role is visible to
//! every member holding it on the next read.

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use super::{MembershipStore, ResourceDirectory, TokenFilter, TokenPage, TokenStore};
use crate::models::organization::{Organization, Project, Target};
use crate::models::permission::{Permission, PermissionCatalog};
use crate::models::resource::ResourceScope;
use crate::models::role::{MemberRole, Membership, RoleAssignment};
use crate::models::token::{AccessToken, TokenOwner};

#[derive(Clone)]
struct MemberRecord {
    assignments: Vec<(Uuid, ResourceScope)>,
}

#[derive(Default)]
pub struct MemoryStore {
    organizations: DashMap<Uuid, Organization>,
    projects: DashMap<Uuid, Project>,
    targets: DashMap<Uuid, Target>,
    roles: DashMap<Uuid, MemberRole>,
    members: DashMap<(Uuid, Uuid), MemberRecord>,
    tokens: DashMap<Uuid, AccessToken>,
    token_hashes: DashMap<String, Uuid>,
}

fn parse_permissions(ids: &[&str]) -> anyhow::Result<Vec<Permission>> {
    PermissionCatalog::global()
        .parse_all(ids)
        .map_err(|unknown| anyhow!("unknown permissions: {}", unknown.join(", ")))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // -- Directory --

    /// Create an organization; the owner becomes a member with no roles.
    pub fn create_organization(&self, slug: &str, owner_id: Uuid) -> Organization {
        let org = Organization {
            id: Uuid::new_v4(),
            slug: slug.to_string(),
            owner_id,
        };
        self.organizations.insert(org.id, org.clone());
        self.members.insert(
            (org.id, owner_id),
            MemberRecord {
                assignments: vec![],
            },
        );
        org
    }

    pub fn create_project(&self, organization_id: Uuid, slug: &str) -> anyhow::Result<Project> {
        if !self.organizations.contains_key(&organization_id) {
            bail!("organization {} does not exist", organization_id);
        }
        let project = Project {
            id: Uuid::new_v4(),
            organization_id,
            slug: slug.to_string(),
        };
        self.projects.insert(project.id, project.clone());
        Ok(project)
    }

    pub fn create_target(&self, project_id: Uuid, slug: &str) -> anyhow::Result<Target> {
        if !self.projects.contains_key(&project_id) {
            bail!("project {} does not exist", project_id);
        }
        let target = Target {
            id: Uuid::new_v4(),
            project_id,
            slug: slug.to_string(),
        };
        self.targets.insert(target.id, target.clone());
        Ok(target)
    }

    /// Delete a project, its targets and every project token bound to it.
    pub fn delete_project(&self, project_id: Uuid) -> bool {
        let removed = self.projects.remove(&project_id).is_some();
        self.targets.retain(|_, t| t.project_id != project_id);
        let orphaned: Vec<Uuid> = self
            .tokens
            .iter()
            .filter(|t| {
                matches!(t.owner, TokenOwner::Project { project_id: p } if p == project_id)
            })
            .map(|t| t.id)
            .collect();
        for id in orphaned {
            self.remove_token(id);
        }
        removed
    }

    // -- Roles & memberships --

    pub fn create_role(
        &self,
        organization_id: Uuid,
        name: &str,
        permissions: &[&str],
    ) -> anyhow::Result<MemberRole> {
        let role = MemberRole {
            id: Uuid::new_v4(),
            organization_id,
            name: name.to_string(),
            description: String::new(),
            permissions: parse_permissions(permissions)?,
        };
        self.roles.insert(role.id, role.clone());
        Ok(role)
    }

    pub fn update_role_permissions(&self, role_id: Uuid, permissions: &[&str]) -> anyhow::Result<()> {
        let permissions = parse_permissions(permissions)?;
        let mut role = self
            .roles
            .get_mut(&role_id)
            .ok_or_else(|| anyhow!("role {} does not exist", role_id))?;
        role.permissions = permissions;
        Ok(())
    }

    /// Add a member with one role assignment, or append the assignment if
    /// the user is already a member.
    pub fn assign_role(
        &self,
        organization_id: Uuid,
        user_id: Uuid,
        role_id: Uuid,
        resources: ResourceScope,
    ) -> anyhow::Result<()> {
        if !self.roles.contains_key(&role_id) {
            bail!("role {} does not exist", role_id);
        }
        self.members
            .entry((organization_id, user_id))
            .or_insert_with(|| MemberRecord {
                assignments: vec![],
            })
            .assignments
            .push((role_id, resources));
        Ok(())
    }

    /// Replace the resources of every assignment of `role_id` held by the user.
    pub fn set_assignment_resources(
        &self,
        organization_id: Uuid,
        user_id: Uuid,
        role_id: Uuid,
        resources: ResourceScope,
    ) -> anyhow::Result<()> {
        let mut member = self
            .members
            .get_mut(&(organization_id, user_id))
            .ok_or_else(|| anyhow!("user {} is not a member", user_id))?;
        for (assigned, scope) in member.assignments.iter_mut() {
            if *assigned == role_id {
                *scope = resources.clone();
            }
        }
        Ok(())
    }

    pub fn remove_member(&self, organization_id: Uuid, user_id: Uuid) -> bool {
        self.members.remove(&(organization_id, user_id)).is_some()
    }

    fn remove_token(&self, id: Uuid) -> bool {
        // Drop the record first so a concurrent hash lookup can never reach it.
        match self.tokens.remove(&id) {
            Some((_, token)) => {
                self.token_hashes.remove(&token.secret_hash);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn insert_token(&self, token: &AccessToken) -> anyhow::Result<()> {
        if self.tokens.contains_key(&token.id) {
            bail!("token {} already exists", token.id);
        }
        match self.token_hashes.entry(token.secret_hash.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => bail!("secret hash collision"),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                self.tokens.insert(token.id, token.clone());
                slot.insert(token.id);
            }
        }
        Ok(())
    }

    async fn get_token(&self, id: Uuid) -> anyhow::Result<Option<AccessToken>> {
        Ok(self.tokens.get(&id).map(|t| t.clone()))
    }

    async fn get_token_by_hash(&self, secret_hash: &str) -> anyhow::Result<Option<AccessToken>> {
        let Some(id) = self.token_hashes.get(secret_hash).map(|id| *id) else {
            return Ok(None);
        };
        Ok(self.tokens.get(&id).map(|t| t.clone()))
    }

    async fn delete_token(&self, id: Uuid) -> anyhow::Result<bool> {
        Ok(self.remove_token(id))
    }

    async fn list_tokens(&self, filter: &TokenFilter) -> anyhow::Result<TokenPage> {
        let mut tokens: Vec<AccessToken> = self
            .tokens
            .iter()
            .filter(|t| t.organization_id == filter.organization_id && t.kind() == filter.kind)
            .filter(|t| match (t.owner, filter.project_id, filter.user_id) {
                (TokenOwner::Project { project_id }, Some(wanted), _) => project_id == wanted,
                (TokenOwner::User { user_id }, _, Some(wanted)) => user_id == wanted,
                (_, None, None) => true,
                _ => false,
            })
            .filter(|t| filter.after.map_or(true, |cursor| cursor.is_before(t)))
            .map(|t| t.clone())
            .collect();
        tokens.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        tokens.truncate(filter.first + 1);
        Ok(TokenPage::from_rows(tokens, filter.first))
    }
}

#[async_trait]
impl MembershipStore for MemoryStore {
    async fn get_membership(
        &self,
        organization_id: Uuid,
        user_id: Uuid,
    ) -> anyhow::Result<Option<Membership>> {
        let Some(org) = self.organizations.get(&organization_id).map(|o| o.clone()) else {
            return Ok(None);
        };
        let Some(record) = self
            .members
            .get(&(organization_id, user_id))
            .map(|m| m.clone())
        else {
            return Ok(None);
        };

        let assignments = record
            .assignments
            .into_iter()
            .filter_map(|(role_id, resources)| {
                self.roles
                    .get(&role_id)
                    .map(|role| RoleAssignment {
                        role: role.clone(),
                        resources,
                    })
            })
            .collect();

        Ok(Some(Membership {
            organization_id,
            user_id,
            is_owner: org.owner_id == user_id,
            assignments,
        }))
    }
}

#[async_trait]
impl ResourceDirectory for MemoryStore {
    async fn get_organization(&self, id: Uuid) -> anyhow::Result<Option<Organization>> {
        Ok(self.organizations.get(&id).map(|o| o.clone()))
    }

    async fn get_organization_by_slug(&self, slug: &str) -> anyhow::Result<Option<Organization>> {
        Ok(self
            .organizations
            .iter()
            .find(|o| o.slug == slug)
            .map(|o| o.clone()))
    }

    async fn get_project(&self, id: Uuid) -> anyhow::Result<Option<Project>> {
        Ok(self.projects.get(&id).map(|p| p.clone()))
    }

    async fn get_project_by_slug(
        &self,
        organization_id: Uuid,
        slug: &str,
    ) -> anyhow::Result<Option<Project>> {
        Ok(self
            .projects
            .iter()
            .find(|p| p.organization_id == organization_id && p.slug == slug)
            .map(|p| p.clone()))
    }

    async fn get_target(&self, id: Uuid) -> anyhow::Result<Option<Target>> {
        Ok(self.targets.get(&id).map(|t| t.clone()))
    }

    async fn get_target_by_slug(
        &self,
        project_id: Uuid,
        slug: &str,
    ) -> anyhow::Result<Option<Target>> {
        Ok(self
            .targets
            .iter()
            .find(|t| t.project_id == project_id && t.slug == slug)
            .map(|t| t.clone()))
    }
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::token::{AccessKey, TokenKind};
    use crate::store::MAX_PAGE_SIZE;
    use chrono::Utc;

    fn token(org: Uuid, owner: TokenOwner) -> AccessToken {
        let key = AccessKey::generate(owner.kind());
        AccessToken {
            id: Uuid::new_v4(),
            organization_id: org,
            owner,
            title: "test".into(),
            description: String::new(),
            permissions: vec![],
            resources: ResourceScope::All,
            first_characters: key.first_characters,
            secret_hash: key.hash,
            created_at: Utc::now(),
            created_by: None,
        }
    }

    #[tokio::test]
    async fn test_role_edits_are_live() {
        let store = MemoryStore::new();
        let owner = Uuid::new_v4();
        let org = store.create_organization("acme", owner);
        let member = Uuid::new_v4();
        let role = store.create_role(org.id, "viewer", &["project:describe"]).unwrap();
        store
            .assign_role(org.id, member, role.id, ResourceScope::All)
            .unwrap();

        store
            .update_role_permissions(role.id, &["organization:describe"])
            .unwrap();
        let membership = store.get_membership(org.id, member).await.unwrap().unwrap();
        assert!(!membership.is_owner);
        assert_eq!(
            membership.assignments[0].role.permissions,
            vec![Permission::known("organization:describe")]
        );

        let owner_membership = store.get_membership(org.id, owner).await.unwrap().unwrap();
        assert!(owner_membership.is_owner);
    }

    #[tokio::test]
    async fn test_unknown_role_permission_rejected() {
        let store = MemoryStore::new();
        let org = store.create_organization("acme", Uuid::new_v4());
        assert!(store.create_role(org.id, "bad", &["nope:nope"]).is_err());
    }

    #[tokio::test]
    async fn test_delete_token_removes_hash_index() {
        let store = MemoryStore::new();
        let org = store.create_organization("acme", Uuid::new_v4());
        let t = token(org.id, TokenOwner::Organization);
        store.insert_token(&t).await.unwrap();
        assert!(store.get_token_by_hash(&t.secret_hash).await.unwrap().is_some());

        assert!(store.delete_token(t.id).await.unwrap());
        assert!(store.get_token_by_hash(&t.secret_hash).await.unwrap().is_none());
        assert!(!store.delete_token(t.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_filters_by_owner() {
        let store = MemoryStore::new();
        let org = store.create_organization("acme", Uuid::new_v4());
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        store
            .insert_token(&token(org.id, TokenOwner::User { user_id: alice }))
            .await
            .unwrap();
        store
            .insert_token(&token(org.id, TokenOwner::User { user_id: bob }))
            .await
            .unwrap();
        store
            .insert_token(&token(org.id, TokenOwner::Organization))
            .await
            .unwrap();

        let filter = TokenFilter {
            organization_id: org.id,
            kind: TokenKind::Personal,
            project_id: None,
            user_id: Some(alice),
            first: MAX_PAGE_SIZE,
            after: None,
        };
        let listed = store.list_tokens(&filter).await.unwrap().tokens;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].owner, TokenOwner::User { user_id: alice });
    }

    #[tokio::test]
    async fn test_list_pages_across_equal_timestamps() {
        let store = MemoryStore::new();
        let org = store.create_organization("acme", Uuid::new_v4());
        let created_at = Utc::now();
        for _ in 0..3 {
            let mut t = token(org.id, TokenOwner::Organization);
            t.created_at = created_at;
            store.insert_token(&t).await.unwrap();
        }
        let mut filter = TokenFilter {
            organization_id: org.id,
            kind: TokenKind::Organization,
            project_id: None,
            user_id: None,
            first: 2,
            after: None,
        };

        let first = store.list_tokens(&filter).await.unwrap();
        assert_eq!(first.tokens.len(), 2);
        assert!(first.has_next_page);
        assert!(first.tokens[0].id > first.tokens[1].id);

        filter.after = first.end_cursor();
        let second = store.list_tokens(&filter).await.unwrap();
        assert_eq!(second.tokens.len(), 1);
        assert!(!second.has_next_page);
        assert!(second.tokens[0].id < first.tokens[1].id);
    }

    #[tokio::test]
    async fn test_delete_project_cascades_to_project_tokens() {
        let store = MemoryStore::new();
        let org = store.create_organization("acme", Uuid::new_v4());
        let project = store.create_project(org.id, "web").unwrap();
        store.create_target(project.id, "prod").unwrap();
        let t = token(org.id, TokenOwner::Project { project_id: project.id });
        store.insert_token(&t).await.unwrap();

        assert!(store.delete_project(project.id));
        assert!(store.get_token(t.id).await.unwrap().is_none());
        assert!(store
            .get_target_by_slug(project.id, "prod")
            .await
            .unwrap()
            .is_none());
    }
}
