//! Authentication: turn a bearer credential into a `Principal`.
//!
//! Credentials carrying an access token prefix (`hvo1/`, `hvp1/`, `hvu1/`) go
//! through the token store; anything else is treated as a session JWT.
//! A missing credential and an invalid one are reported differently
//! (`MissingCredential` vs `InvalidToken`), but an invalid one never says why.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::access_tokens::AccessTokens;
use crate::errors::AppError;
use crate::models::organization::User;
use crate::models::resolved::ResolvedPermissionSet;
use crate::models::token::{AccessToken, TokenKind, TokenOwner};

/// An access token together with its resolved permissions at lookup time.
#[derive(Debug, Clone)]
pub struct AuthenticatedToken {
    pub token: AccessToken,
    pub resolved: ResolvedPermissionSet,
}

/// The authenticated actor of a request. Passed explicitly to every
/// authorization entry point.
#[derive(Debug, Clone)]
pub enum Principal {
    User(User),
    AccessToken(Arc<AuthenticatedToken>),
}

impl Principal {
    /// The user behind the principal: the session user, or the owner of a
    /// personal token.
    pub fn user_id(&self) -> Option<Uuid> {
        match self {
            Principal::User(user) => Some(user.id),
            Principal::AccessToken(auth) => match auth.token.owner {
                TokenOwner::User { user_id } => Some(user_id),
                _ => None,
            },
        }
    }

    pub fn session_user(&self) -> Option<&User> {
        match self {
            Principal::User(user) => Some(user),
            Principal::AccessToken(_) => None,
        }
    }
}

// ── Sessions ─────────────────────────────────────────────────

/// Identity provider for session credentials.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// The user a credential identifies, or `None` if it is not a valid session.
    async fn verify(&self, credential: &str) -> Option<User>;
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionClaims {
    sub: Uuid,
    email: String,
    name: String,
    iat: i64,
    exp: i64,
}

/// HS256 session tokens.
pub struct JwtSessions {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl JwtSessions {
    pub fn new(secret: &str, ttl: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl,
        }
    }

    pub fn issue(&self, user: &User) -> anyhow::Result<String> {
        let now = chrono::Utc::now().timestamp();
        let claims = SessionClaims {
            sub: user.id,
            email: user.email.clone(),
            name: user.display_name.clone(),
            iat: now,
            exp: now + self.ttl.as_secs() as i64,
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?)
    }
}

#[async_trait]
impl SessionProvider for JwtSessions {
    async fn verify(&self, credential: &str) -> Option<User> {
        let data = decode::<SessionClaims>(
            credential,
            &self.decoding,
            &Validation::new(Algorithm::HS256),
        )
        .map_err(|e| tracing::debug!("session rejected: {}", e))
        .ok()?;

        Some(User {
            id: data.claims.sub,
            email: data.claims.email,
            display_name: data.claims.name,
        })
    }
}

// ── Authenticator ────────────────────────────────────────────

#[derive(Clone)]
pub struct Authenticator {
    sessions: Arc<dyn SessionProvider>,
    tokens: Arc<AccessTokens>,
}

impl Authenticator {
    pub fn new(sessions: Arc<dyn SessionProvider>, tokens: Arc<AccessTokens>) -> Self {
        Self { sessions, tokens }
    }

    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<Principal, AppError> {
        let credential = bearer_credential(headers).ok_or(AppError::MissingCredential)?;
        self.authenticate_credential(credential).await
    }

    pub async fn authenticate_credential(&self, credential: &str) -> Result<Principal, AppError> {
        if TokenKind::looks_like_secret(credential) {
            let auth = self.tokens.lookup(credential).await?;
            return Ok(Principal::AccessToken(Arc::new(auth)));
        }

        match self.sessions.verify(credential).await {
            Some(user) => Ok(Principal::User(user)),
            None => {
                tracing::warn!("rejected credential: not an access token or valid session");
                Err(AppError::InvalidToken)
            }
        }
    }
}

/// The credential of an `Authorization: Bearer <credential>` header.
fn bearer_credential(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, credential) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let credential = credential.trim();
    (!credential.is_empty()).then_some(credential)
}

// ── Tests ───────────────────────────────────────────────────────
