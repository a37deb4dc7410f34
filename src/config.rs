use std::time::Duration;

const PLACEHOLDER_SECRET: &str = "CHANGE_ME_SESSION_SECRET";

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// PostgreSQL store. The in-memory store is used when unset.
    pub database_url: Option<String>,
    /// Optional second cache tier.
    pub redis_url: Option<String>,
    /// HS256 secret for session tokens.
    pub session_secret: String,
    pub session_ttl: Duration,
    /// How long a resolved permission set may be served from cache.
    /// Set via AUTHZ_PERMISSION_CACHE_TTL_SECS. Default: 300.
    pub permission_cache_ttl: Duration,
    pub cache_sweep_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8082,
            database_url: None,
            redis_url: None,
            session_secret: PLACEHOLDER_SECRET.into(),
            session_ttl: Duration::from_secs(86_400),
            permission_cache_ttl: Duration::from_secs(300),
            cache_sweep_interval: Duration::from_secs(60),
        }
    }
}

fn env_secs(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();
    let defaults = Config::default();

    let session_secret =
        std::env::var("AUTHZ_SESSION_SECRET").unwrap_or_else(|_| PLACEHOLDER_SECRET.into());

    if session_secret == PLACEHOLDER_SECRET {
        let env_mode = std::env::var("AUTHZ_ENV")
            .or_else(|_| std::env::var("RUST_ENV"))
            .unwrap_or_default();
        if env_mode == "production" {
            anyhow::bail!(
                "AUTHZ_SESSION_SECRET is still the insecure placeholder. \
                 Set a proper secret before running in production."
            );
        }
        tracing::warn!("AUTHZ_SESSION_SECRET is not set, using insecure placeholder");
    }

    Ok(Config {
        port: std::env::var("AUTHZ_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.port),
        database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
        redis_url: std::env::var("REDIS_URL").ok().filter(|v| !v.is_empty()),
        session_secret,
        session_ttl: env_secs("AUTHZ_SESSION_TTL_SECS", defaults.session_ttl),
        permission_cache_ttl: env_secs(
            "AUTHZ_PERMISSION_CACHE_TTL_SECS",
            defaults.permission_cache_ttl,
        ),
        cache_sweep_interval: env_secs(
            "AUTHZ_CACHE_SWEEP_INTERVAL_SECS",
            defaults.cache_sweep_interval,
        ),
    })
}
