pub mod access_tokens;
pub mod auth;
pub mod guard;
pub mod metrics;
pub mod resolver;
