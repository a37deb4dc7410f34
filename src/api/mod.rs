use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::Response,
    routing::{delete, get},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::errors::AppError;
use crate::AppState;

pub mod handlers;

/// Build the authorization API router.
/// All routes are relative; the caller mounts this under `/api/v1`.
pub fn api_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    let router = Router::new()
        .route(
            "/organizations/:id/access-tokens",
            get(handlers::list_organization_tokens).post(handlers::create_organization_token),
        )
        .route(
            "/organizations/:id/personal-access-tokens",
            get(handlers::list_personal_tokens).post(handlers::create_personal_token),
        )
        .route(
            "/projects/:id/access-tokens",
            get(handlers::list_project_tokens).post(handlers::create_project_token),
        )
        .route("/projects/:id", get(handlers::get_project))
        .route("/access-tokens/:id", delete(handlers::delete_token))
        .route("/whoami", get(handlers::whoami))
        .route(
            "/resources/:org/:project/:target",
            get(handlers::describe_resources),
        );

    with_test_hooks(router)
        .layer(middleware::from_fn_with_state(state, authenticate))
        .layer(TraceLayer::new_for_http())
        .fallback(fallback_404)
}

#[cfg(feature = "test-hooks")]
fn with_test_hooks(router: Router<Arc<AppState>>) -> Router<Arc<AppState>> {
    router.route(
        "/access-tokens/:id/purge",
        axum::routing::post(handlers::purge_token),
    )
}

#[cfg(not(feature = "test-hooks"))]
fn with_test_hooks(router: Router<Arc<AppState>>) -> Router<Arc<AppState>> {
    router
}

async fn fallback_404() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Middleware: authenticate the bearer credential and attach the `Principal`.
async fn authenticate(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let principal = state.auth.authenticate(req.headers()).await?;
    req.extensions_mut().insert(principal);
    Ok(next.run(req).await)
}
