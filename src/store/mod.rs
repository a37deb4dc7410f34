pub mod memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

use crate::models::organization::{Organization, Project, Target};
use crate::models::role::Membership;
use crate::models::token::{AccessToken, TokenKind};

/// Largest page a token listing returns.
pub const MAX_PAGE_SIZE: usize = 20;

/// Which tokens to list, and which page of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenFilter {
    pub organization_id: Uuid,
    pub kind: TokenKind,
    pub project_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    /// Page size, already clamped to `1..=MAX_PAGE_SIZE`.
    pub first: usize,
    pub after: Option<TokenCursor>,
}

/// Keyset position in a newest-first listing: the last token of a page.
/// Ties on `created_at` are broken by id, descending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenCursor {
    pub created_at: DateTime<Utc>,
    pub id: Uuid,
}

impl TokenCursor {
    pub fn of(token: &AccessToken) -> Self {
        Self {
            created_at: token.created_at,
            id: token.id,
        }
    }

    /// Opaque form handed to clients.
    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(format!(
            "{}|{}",
            self.created_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
            self.id
        ))
    }

    pub fn decode(encoded: &str) -> Option<Self> {
        let raw = String::from_utf8(URL_SAFE_NO_PAD.decode(encoded).ok()?).ok()?;
        let (created_at, id) = raw.split_once('|')?;
        Some(Self {
            created_at: DateTime::parse_from_rfc3339(created_at).ok()?.with_timezone(&Utc),
            id: Uuid::parse_str(id).ok()?,
        })
    }

    /// True if `token` comes after this position in newest-first order.
    pub fn is_before(&self, token: &AccessToken) -> bool {
        (token.created_at, token.id) < (self.created_at, self.id)
    }
}

/// One page of a token listing.
#[derive(Debug, Clone)]
pub struct TokenPage {
    pub tokens: Vec<AccessToken>,
    pub has_next_page: bool,
}

impl TokenPage {
    /// Build a page from up to `first + 1` rows in listing order.
    pub fn from_rows(mut rows: Vec<AccessToken>, first: usize) -> Self {
        let has_next_page = rows.len() > first;
        rows.truncate(first);
        Self {
            tokens: rows,
            has_next_page,
        }
    }

    pub fn end_cursor(&self) -> Option<TokenCursor> {
        self.tokens.last().map(TokenCursor::of)
    }
}

/// Persistence for access token records, keyed by id and by secret hash.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Insert a new token. Fails if the id or secret hash is already taken.
    async fn insert_token(&self, token: &AccessToken) -> anyhow::Result<()>;

    async fn get_token(&self, id: Uuid) -> anyhow::Result<Option<AccessToken>>;

    async fn get_token_by_hash(&self, secret_hash: &str) -> anyhow::Result<Option<AccessToken>>;

    /// Returns false if no such token existed.
    async fn delete_token(&self, id: Uuid) -> anyhow::Result<bool>;

    /// One page of matching tokens, newest first, starting after `filter.after`.
    async fn list_tokens(&self, filter: &TokenFilter) -> anyhow::Result<TokenPage>;
}

/// Live membership and role state. Reads must reflect writes immediately.
#[async_trait]
pub trait MembershipStore: Send + Sync {
    /// The user's membership in the organization, with role assignments
    /// resolved to the roles' current permissions. `None` if not a member.
    async fn get_membership(
        &self,
        organization_id: Uuid,
        user_id: Uuid,
    ) -> anyhow::Result<Option<Membership>>;
}

/// Resource existence and slug/id resolution.
#[async_trait]
pub trait ResourceDirectory: Send + Sync {
    async fn get_organization(&self, id: Uuid) -> anyhow::Result<Option<Organization>>;

    async fn get_organization_by_slug(&self, slug: &str) -> anyhow::Result<Option<Organization>>;

    async fn get_project(&self, id: Uuid) -> anyhow::Result<Option<Project>>;

    async fn get_project_by_slug(
        &self,
        organization_id: Uuid,
        slug: &str,
    ) -> anyhow::Result<Option<Project>>;

    async fn get_target(&self, id: Uuid) -> anyhow::Result<Option<Target>>;

    async fn get_target_by_slug(&self, project_id: Uuid, slug: &str)
        -> anyhow::Result<Option<Target>>;
}

/// The three collaborators the engine is built on.
#[derive(Clone)]
pub struct Stores {
    pub tokens: Arc<dyn TokenStore>,
    pub memberships: Arc<dyn MembershipStore>,
    pub directory: Arc<dyn ResourceDirectory>,
}

impl Stores {
    /// Use one backend for all three roles.
    pub fn from_backend<S>(backend: Arc<S>) -> Self
    where
        S: TokenStore + MembershipStore + ResourceDirectory + 'static,
    {
        Self {
            tokens: backend.clone(),
            memberships: backend.clone(),
            directory: backend,
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_survives_encoding() {
        let cursor = TokenCursor {
            created_at: DateTime::parse_from_rfc3339("2024-05-01T10:00:00.123456Z")
                .unwrap()
                .with_timezone(&Utc),
            id: Uuid::new_v4(),
        };
        assert_eq!(TokenCursor::decode(&cursor.encode()), Some(cursor));
    }

    #[test]
    fn test_garbage_cursor_is_rejected() {
        assert_eq!(TokenCursor::decode("not a cursor"), None);
        assert_eq!(TokenCursor::decode(&URL_SAFE_NO_PAD.encode("2024|nope")), None);
    }
}
