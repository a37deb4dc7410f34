//! Prometheus metrics for authorization decisions.
//!
//! Exposes a standard `/metrics` endpoint that Prometheus can scrape.
//! Label values are bounded: permission ids come from the fixed catalog.

use once_cell::sync::Lazy;
use prometheus::{opts, register_counter_vec, CounterVec, Encoder, TextEncoder};

use crate::models::permission::Permission;

/// All metrics are registered once in the global default registry.
pub struct AuthzMetrics {
    decisions_total: CounterVec,
    permission_cache_total: CounterVec,
    token_authentications_total: CounterVec,
}

static METRICS: Lazy<AuthzMetrics> = Lazy::new(AuthzMetrics::register);

impl AuthzMetrics {
    fn register() -> Self {
        let decisions_total = register_counter_vec!(
            opts!("authz_decisions_total", "Permission checks by outcome"),
            &["permission", "outcome"]
        )
        .expect("failed to register authz_decisions_total");

        let permission_cache_total = register_counter_vec!(
            opts!(
                "authz_permission_cache_total",
                "Resolved permission cache lookups"
            ),
            &["result"]
        )
        .expect("failed to register authz_permission_cache_total");

        let token_authentications_total = register_counter_vec!(
            opts!(
                "authz_token_authentications_total",
                "Access token authentications by outcome"
            ),
            &["outcome"]
        )
        .expect("failed to register authz_token_authentications_total");

        Self {
            decisions_total,
            permission_cache_total,
            token_authentications_total,
        }
    }

    pub fn global() -> &'static AuthzMetrics {
        &METRICS
    }

    pub fn record_decision(&self, permission: Permission, allowed: bool) {
        let outcome = if allowed { "allowed" } else { "denied" };
        self.decisions_total
            .with_label_values(&[permission.id(), outcome])
            .inc();
    }

    pub fn record_cache(&self, hit: bool) {
        let result = if hit { "hit" } else { "miss" };
        self.permission_cache_total.with_label_values(&[result]).inc();
    }

    /// `outcome` is one of `ok`, `invalid`, `error`.
    pub fn record_authentication(&self, outcome: &str) {
        self.token_authentications_total
            .with_label_values(&[outcome])
            .inc();
    }
}

/// Encode all registered metrics as Prometheus text format.
/// Called by the `/metrics` HTTP handler.
pub fn encode_metrics() -> String {
    Lazy::force(&METRICS);
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap_or_default();
    String::from_utf8(buffer).unwrap_or_default()
}

// ── Tests ─────────────────────────────────────────────────────
