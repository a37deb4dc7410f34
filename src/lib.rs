//! registry-authz: resource-scoped permissions and access tokens.
//!
//! Library crate shared by the server binary and the integration tests in `tests/`.

pub mod api;
pub mod cache;
pub mod cli;
pub mod config;
pub mod errors;
pub mod jobs;
pub mod middleware;
pub mod models;
pub mod store;

use std::sync::Arc;

use cache::TieredCache;
use middleware::access_tokens::AccessTokens;
use middleware::auth::{Authenticator, SessionProvider};
use middleware::guard::Guard;
use middleware::resolver::GrantResolver;
use store::{ResourceDirectory, Stores};

/// Shared application state passed to handlers and middleware.
pub struct AppState {
    pub config: config::Config,
    pub directory: Arc<dyn ResourceDirectory>,
    pub guard: Guard,
    pub tokens: Arc<AccessTokens>,
    pub auth: Authenticator,
}

impl AppState {
    pub fn new(
        config: config::Config,
        stores: Stores,
        cache: TieredCache,
        sessions: Arc<dyn SessionProvider>,
    ) -> Self {
        let resolver = GrantResolver::new(stores.memberships.clone(), stores.directory.clone());
        let guard = Guard::new(resolver.clone());
        let tokens = Arc::new(AccessTokens::new(
            &stores,
            resolver,
            guard.clone(),
            cache,
            config.permission_cache_ttl,
        ));
        let auth = Authenticator::new(sessions, tokens.clone());

        Self {
            config,
            directory: stores.directory,
            guard,
            tokens,
            auth,
        }
    }
}
