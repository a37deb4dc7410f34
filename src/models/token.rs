//! Access token model: organization, project and personal tokens.
//!
//! Tokens are immutable once created. The bearer secret is returned exactly
//! once at creation; only its SHA-256 digest is stored.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use rand::RngCore;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::permission::Permission;
use super::resource::ResourceScope;

/// Random bytes behind every secret.
const SECRET_BYTES: usize = 32;
/// Length of the base64 body of a secret (32 bytes, unpadded).
const SECRET_BODY_LEN: usize = 43;
/// Characters of the body kept in `first_characters` for display.
const VISIBLE_BODY_CHARS: usize = 7;

pub const TITLE_MIN_LEN: usize = 2;
pub const TITLE_MAX_LEN: usize = 100;
pub const DESCRIPTION_MAX_LEN: usize = 248;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenKind {
    Organization,
    Project,
    Personal,
}

impl TokenKind {
    pub fn secret_prefix(self) -> &'static str {
        match self {
            TokenKind::Organization => "hvo1/",
            TokenKind::Project => "hvp1/",
            TokenKind::Personal => "hvu1/",
        }
    }

    /// Permission required to create, list or delete tokens of this kind.
    pub fn modify_permission(self) -> Permission {
        let id = match self {
            TokenKind::Organization => "accessToken:modify",
            TokenKind::Project => "projectAccessToken:modify",
            TokenKind::Personal => "personalAccessToken:modify",
        };
        Permission::builtin(id)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TokenKind::Organization => "organization",
            TokenKind::Project => "project",
            TokenKind::Personal => "personal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "organization" => Some(TokenKind::Organization),
            "project" => Some(TokenKind::Project),
            "personal" => Some(TokenKind::Personal),
            _ => None,
        }
    }

    /// Kind of a bearer secret, if it has the shape of one.
    pub fn from_secret(secret: &str) -> Option<Self> {
        [TokenKind::Organization, TokenKind::Project, TokenKind::Personal]
            .into_iter()
            .find(|kind| secret.starts_with(kind.secret_prefix()))
    }

    /// True if the credential claims to be an access token (has a known prefix),
    /// whether or not the rest of it is well formed.
    pub fn looks_like_secret(credential: &str) -> bool {
        Self::from_secret(credential).is_some()
    }
}

/// Who a token belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TokenOwner {
    Organization,
    Project {
        #[serde(rename = "projectId")]
        project_id: Uuid,
    },
    User {
        #[serde(rename = "userId")]
        user_id: Uuid,
    },
}

impl TokenOwner {
    pub fn kind(&self) -> TokenKind {
        match self {
            TokenOwner::Organization => TokenKind::Organization,
            TokenOwner::Project { .. } => TokenKind::Project,
            TokenOwner::User { .. } => TokenKind::Personal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessToken {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub owner: TokenOwner,
    pub title: String,
    pub description: String,
    /// Stored grant, in the order it was requested.
    pub permissions: Vec<Permission>,
    pub resources: ResourceScope,
    pub first_characters: String,
    #[serde(skip_serializing)]
    pub secret_hash: String,
    pub created_at: DateTime<Utc>,
    pub created_by: Option<Uuid>,
}

impl AccessToken {
    pub fn kind(&self) -> TokenKind {
        self.owner.kind()
    }
}

/// A freshly generated bearer secret.
pub struct AccessKey {
    pub secret: String,
    pub hash: String,
    pub first_characters: String,
}

impl AccessKey {
    pub fn generate(kind: TokenKind) -> Self {
        let mut bytes = [0u8; SECRET_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        let prefix = kind.secret_prefix();
        let body = URL_SAFE_NO_PAD.encode(bytes);
        let secret = format!("{}{}", prefix, body);
        Self {
            hash: hash_secret(&secret),
            first_characters: secret[..prefix.len() + VISIBLE_BODY_CHARS].to_string(),
            secret,
        }
    }
}

/// Hex SHA-256 of the full secret, prefix included.
pub fn hash_secret(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// True if `secret` has exactly the shape `AccessKey::generate` produces.
pub fn is_well_formed_secret(secret: &str) -> bool {
    let Some(kind) = TokenKind::from_secret(secret) else {
        return false;
    };
    let body = &secret[kind.secret_prefix().len()..];
    body.len() == SECRET_BODY_LEN
        && URL_SAFE_NO_PAD
            .decode(body)
            .map(|decoded| decoded.len() == SECRET_BYTES)
            .unwrap_or(false)
}

// ── Input validation ─────────────────────────────────────────

static TITLE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[ a-zA-Z0-9_-]+$").unwrap_or_else(|e| unreachable!("static regex: {}", e))
});

/// Validate and normalize a token title. Returns the first failing rule.
pub fn validate_title(title: &str) -> Result<String, String> {
    let title = title.trim();
    if !TITLE_PATTERN.is_match(title) {
        return Err(r#"Can only contain letters, numbers, " ", "_", and "-"."#.to_string());
    }
    let len = title.chars().count();
    if len < TITLE_MIN_LEN {
        return Err(format!("Minimum length is {} characters.", TITLE_MIN_LEN));
    }
    if len > TITLE_MAX_LEN {
        return Err(format!("Maximum length is {} characters.", TITLE_MAX_LEN));
    }
    Ok(title.to_string())
}

/// Validate and normalize an optional description.
pub fn validate_description(description: Option<&str>) -> Result<String, String> {
    let description = description.map(str::trim).unwrap_or_default();
    if description.chars().count() > DESCRIPTION_MAX_LEN {
        return Err(format!(
            "Maximum length is {} characters.",
            DESCRIPTION_MAX_LEN
        ));
    }
    Ok(description.to_string())
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_secret_shape() {
        for kind in [TokenKind::Organization, TokenKind::Project, TokenKind::Personal] {
            let key = AccessKey::generate(kind);
            assert!(key.secret.starts_with(kind.secret_prefix()));
            assert!(is_well_formed_secret(&key.secret), "{}", key.secret);
            assert_eq!(TokenKind::from_secret(&key.secret), Some(kind));
            assert_eq!(key.first_characters.len(), 5 + VISIBLE_BODY_CHARS);
            assert!(key.secret.starts_with(&key.first_characters));
            assert_eq!(key.hash, hash_secret(&key.secret));
            assert!(!key.hash.contains(&key.secret));
        }
    }

    #[test]
    fn test_personal_secret_prefix() {
        let key = AccessKey::generate(TokenKind::Personal);
        assert!(key.secret.starts_with("hvu1/"));
    }

    #[test]
    fn test_secrets_are_unique() {
        let a = AccessKey::generate(TokenKind::Organization);
        let b = AccessKey::generate(TokenKind::Organization);
        assert_ne!(a.secret, b.secret);
        assert_ne!(a.hash, b.hash);
    }

    #[test]
    fn test_malformed_secrets_rejected() {
        assert!(!is_well_formed_secret(""));
        assert!(!is_well_formed_secret("hvo1/"));
        assert!(!is_well_formed_secret("hvo1/short"));
        assert!(!is_well_formed_secret("cdn_0123456789abcdef0123456789abcdef"));
        let key = AccessKey::generate(TokenKind::Project);
        let truncated = &key.secret[..key.secret.len() - 1];
        assert!(!is_well_formed_secret(truncated));
        let mangled = format!("{}!", truncated);
        assert!(!is_well_formed_secret(&mangled));
    }

    #[test]
    fn test_modify_permissions() {
        assert_eq!(TokenKind::Organization.modify_permission().id(), "accessToken:modify");
        assert_eq!(TokenKind::Project.modify_permission().id(), "projectAccessToken:modify");
        assert_eq!(TokenKind::Personal.modify_permission().id(), "personalAccessToken:modify");
    }

    #[test]
    fn test_blank_title_fails_pattern_first() {
        let err = validate_title("   ").unwrap_err();
        assert_eq!(err, r#"Can only contain letters, numbers, " ", "_", and "-"."#);
    }

    #[test]
    fn test_title_rules() {
        assert_eq!(validate_title("  an access token ").unwrap(), "an access token");
        assert_eq!(validate_title("a").unwrap_err(), "Minimum length is 2 characters.");
        assert_eq!(
            validate_title(&"A".repeat(101)).unwrap_err(),
            "Maximum length is 100 characters."
        );
        assert!(validate_title("no/slashes").is_err());
        assert!(validate_title("under_score-dash 01").is_ok());
    }

    #[test]
    fn test_description_rules() {
        assert_eq!(validate_description(None).unwrap(), "");
        assert_eq!(validate_description(Some(" hi ")).unwrap(), "hi");
        assert!(validate_description(Some(&"A".repeat(248))).is_ok());
        assert_eq!(
            validate_description(Some(&"A".repeat(300))).unwrap_err(),
            "Maximum length is 248 characters."
        );
    }

    #[test]
    fn test_owner_serde_shape() {
        let project_id = Uuid::new_v4();
        let json = serde_json::to_value(TokenOwner::Project { project_id }).unwrap();
        assert_eq!(json["type"], "project");
        assert_eq!(json["projectId"], project_id.to_string());
    }
}
