//! HTTP surface tests: the `/api/v1` router driven with `oneshot` over the
//! in-memory store.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use registry_authz::api::api_router;
use registry_authz::cache::TieredCache;
use registry_authz::config::Config;
use registry_authz::middleware::auth::JwtSessions;
use registry_authz::models::organization::{Organization, Project, User};
use registry_authz::models::resource::ResourceScope;
use registry_authz::store::memory::MemoryStore;
use registry_authz::store::Stores;
use registry_authz::AppState;

const SECRET: &str = "api-test-secret";

struct TestApp {
    router: Router,
    store: Arc<MemoryStore>,
    sessions: JwtSessions,
    org: Organization,
    project: Project,
    other_project: Project,
    owner: User,
}

fn user(name: &str) -> User {
    User {
        id: Uuid::new_v4(),
        email: format!("{}@example.com", name),
        display_name: name.to_string(),
    }
}

fn app() -> TestApp {
    let store = Arc::new(MemoryStore::new());
    let owner = user("owner");
    let org = store.create_organization("acme", owner.id);
    let project = store.create_project(org.id, "web").unwrap();
    let other_project = store.create_project(org.id, "api").unwrap();
    store.create_target(project.id, "production").unwrap();

    let ttl = Duration::from_secs(3600);
    let state = Arc::new(AppState::new(
        Config::default(),
        Stores::from_backend(store.clone()),
        TieredCache::in_memory(),
        Arc::new(JwtSessions::new(SECRET, ttl)),
    ));
    let router = Router::new()
        .nest("/api/v1", api_router(state.clone()))
        .with_state(state);

    TestApp {
        router,
        store,
        sessions: JwtSessions::new(SECRET, ttl),
        org,
        project,
        other_project,
        owner,
    }
}

impl TestApp {
    fn session(&self, user: &User) -> String {
        self.sessions.issue(user).unwrap()
    }

    async fn call(
        &self,
        method: Method,
        uri: &str,
        credential: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(credential) = credential {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", credential));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    /// Create a token through the API and return its secret and id.
    async fn create_token(&self, uri: &str, credential: &str, body: Value) -> (String, String) {
        let (status, json) = self.call(Method::POST, uri, Some(credential), Some(body)).await;
        assert_eq!(status, StatusCode::CREATED, "{}", json);
        (
            json["privateAccessKey"].as_str().unwrap().to_string(),
            json["createdAccessToken"]["id"].as_str().unwrap().to_string(),
        )
    }
}

mod auth_tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_credential_is_bad_request() {
        let app = app();
        let (status, json) = app.call(Method::GET, "/api/v1/whoami", None, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["code"], "MISSING_AUTH_KEY");
    }

    #[tokio::test]
    async fn test_invalid_credential_is_forbidden() {
        let app = app();
        let (status, json) = app
            .call(Method::GET, "/api/v1/whoami", Some("hvo1/nope"), None)
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(json["error"]["code"], "INVALID_AUTH_KEY");
        assert_eq!(json["error"]["message"], "Invalid token provided");
    }

    #[tokio::test]
    async fn test_unknown_route_is_not_found() {
        let app = app();
        let session = app.session(&app.owner);
        let (status, _) = app
            .call(Method::GET, "/api/v1/nothing-here", Some(&session), None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[cfg(feature = "test-hooks")]
    #[tokio::test]
    async fn test_purge_hook_requires_credential() {
        let app = app();
        let uri = format!("/api/v1/access-tokens/{}/purge", Uuid::new_v4());
        let (status, json) = app.call(Method::POST, &uri, None, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["code"], "MISSING_AUTH_KEY");

        let session = app.session(&app.owner);
        let (status, _) = app.call(Method::POST, &uri, Some(&session), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }
}

mod token_tests {
    use super::*;

    /// Create an organization token and inspect it through whoami.
    #[tokio::test]
    async fn test_create_and_introspect_organization_token() {
        let app = app();
        let session = app.session(&app.owner);
        let uri = format!("/api/v1/organizations/{}/access-tokens", app.org.id);
        let (status, json) = app
            .call(
                Method::POST,
                &uri,
                Some(&session),
                Some(json!({
                    "title": "ci token",
                    "permissions": ["organization:describe"],
                    "resources": { "mode": "all" },
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        let created = &json["createdAccessToken"];
        assert_eq!(created["kind"], "organization");
        assert_eq!(created["permissions"], json!(["organization:describe"]));
        assert!(created.get("secretHash").is_none());
        let secret = json["privateAccessKey"].as_str().unwrap();
        assert!(created["firstCharacters"]
            .as_str()
            .is_some_and(|first| secret.starts_with(first)));

        let (status, whoami) = app
            .call(Method::GET, "/api/v1/whoami", Some(secret), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(whoami["principal"]["type"], "accessToken");
        assert_eq!(
            whoami["resolvedPermissions"],
            json!([{
                "level": "ORGANIZATION",
                "resolvedPermissionGroups": [{
                    "title": "Organization",
                    "permissions": [{ "id": "organization:describe", "title": "Describe organization" }],
                }],
                "resolvedResourceIds": ["acme"],
            }])
        );

        let (status, listed) = app.call(Method::GET, &uri, Some(&session), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed["edges"].as_array().map(Vec::len), Some(1));
        assert_eq!(listed["pageInfo"]["hasNextPage"], false);
    }

    /// Project tokens see their own project and nothing else.
    #[tokio::test]
    async fn test_project_token_hides_other_projects() {
        let app = app();
        let session = app.session(&app.owner);
        let (secret, _) = app
            .create_token(
                &format!("/api/v1/projects/{}/access-tokens", app.project.id),
                &session,
                json!({ "title": "deploy", "permissions": ["project:describe"] }),
            )
            .await;

        let (status, json) = app
            .call(Method::GET, "/api/v1/resources/acme/web/production", Some(&secret), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["organization"]["project"]["slug"], "web");
        assert_eq!(json["organization"]["project"]["target"]["slug"], "production");

        let (status, json) = app
            .call(Method::GET, "/api/v1/resources/acme/api/production", Some(&secret), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["organization"], Value::Null);

        let (status, json) = app
            .call(
                Method::GET,
                &format!("/api/v1/projects/{}", app.other_project.id),
                Some(&secret),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(json["error"]["code"], "UNAUTHORISED");
        assert_eq!(
            json["error"]["message"],
            "No access (reason: \"Missing permission for performing 'project:describe' on resource\")"
        );

        let (status, json) = app
            .call(
                Method::GET,
                &format!("/api/v1/projects/{}", app.project.id),
                Some(&secret),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["slug"], "web");
    }

    #[tokio::test]
    async fn test_deleted_token_stops_working() {
        let app = app();
        let session = app.session(&app.owner);
        let (secret, id) = app
            .create_token(
                &format!("/api/v1/organizations/{}/access-tokens", app.org.id),
                &session,
                json!({ "title": "ci", "permissions": ["organization:describe"], "resources": { "mode": "all" } }),
            )
            .await;
        let (status, _) = app.call(Method::GET, "/api/v1/whoami", Some(&secret), None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, json) = app
            .call(
                Method::DELETE,
                &format!("/api/v1/access-tokens/{}", id),
                Some(&session),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["deletedAccessTokenId"], id.as_str());

        let (status, json) = app.call(Method::GET, "/api/v1/whoami", Some(&secret), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(json["error"]["code"], "INVALID_AUTH_KEY");
    }

    #[tokio::test]
    async fn test_listing_pages_with_cursor() {
        let app = app();
        let session = app.session(&app.owner);
        let uri = format!("/api/v1/organizations/{}/access-tokens", app.org.id);
        for title in ["first", "second"] {
            app.create_token(
                &uri,
                &session,
                json!({ "title": title, "permissions": ["organization:describe"], "resources": { "mode": "all" } }),
            )
            .await;
        }

        let (status, page) = app
            .call(Method::GET, &format!("{}?first=1", uri), Some(&session), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["edges"].as_array().map(Vec::len), Some(1));
        assert_eq!(page["pageInfo"]["hasNextPage"], true);
        let end = page["pageInfo"]["endCursor"].as_str().unwrap();
        assert_eq!(page["edges"][0]["cursor"], end);

        let (status, next) = app
            .call(Method::GET, &format!("{}?first=1&after={}", uri, end), Some(&session), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(next["edges"].as_array().map(Vec::len), Some(1));
        assert_eq!(next["pageInfo"]["hasNextPage"], false);
        assert_ne!(next["edges"][0]["node"]["id"], page["edges"][0]["node"]["id"]);

        let (status, json) = app
            .call(Method::GET, &format!("{}?after=garbage", uri), Some(&session), None)
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["details"]["after"], "Invalid cursor.");
    }

    #[tokio::test]
    async fn test_invalid_input_reports_fields() {
        let app = app();
        let session = app.session(&app.owner);
        let (status, json) = app
            .call(
                Method::POST,
                &format!("/api/v1/organizations/{}/access-tokens", app.org.id),
                Some(&session),
                Some(json!({ "title": "x", "permissions": ["nope:nope"] })),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["code"], "INVALID_INPUT");
        assert_eq!(json["error"]["message"], "Invalid input provided.");
        assert_eq!(
            json["error"]["details"]["title"],
            "Minimum length is 2 characters."
        );
    }

    /// Service names travel through the API and show up as service-level ids.
    #[tokio::test]
    async fn test_service_scoped_token_whoami() {
        let app = app();
        let target = app.store.create_target(app.project.id, "staging").unwrap();
        let session = app.session(&app.owner);
        let uri = format!("/api/v1/organizations/{}/access-tokens", app.org.id);
        let resources = |name: &str| {
            json!({
                "mode": "granular",
                "projects": [{
                    "projectId": app.project.id,
                    "targets": {
                        "mode": "granular",
                        "targets": [{
                            "targetId": target.id,
                            "services": { "mode": "granular", "names": [name] },
                        }],
                    },
                }],
            })
        };

        let (status, json) = app
            .call(
                Method::POST,
                &uri,
                Some(&session),
                Some(json!({
                    "title": "publisher",
                    "permissions": ["schemaVersion:publish"],
                    "resources": resources("users/admin"),
                })),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"]["details"]["resources"].is_string());

        let (secret, _) = app
            .create_token(
                &uri,
                &session,
                json!({
                    "title": "publisher",
                    "permissions": ["schemaVersion:publish"],
                    "resources": resources("users"),
                }),
            )
            .await;
        let (status, whoami) = app
            .call(Method::GET, "/api/v1/whoami", Some(&secret), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        let statements = whoami["resolvedPermissions"].as_array().unwrap();
        assert_eq!(statements.len(), 1);
        assert_eq!(statements[0]["level"], "SERVICE");
        let ids = statements[0]["resolvedResourceIds"].as_array().unwrap();
        assert_eq!(ids.len(), 1);
        assert!(ids[0].as_str().unwrap().ends_with("/service/users"));
    }

    /// Personal tokens of a downgraded member lose project access.
    #[tokio::test]
    async fn test_personal_token_whoami_for_member() {
        let app = app();
        let member = user("dev");
        let role = app
            .store
            .create_role(app.org.id, "dev", &["personalAccessToken:modify", "project:describe"])
            .unwrap();
        app.store
            .assign_role(app.org.id, member.id, role.id, ResourceScope::project(app.project.id))
            .unwrap();
        let session = app.session(&member);

        let (secret, _) = app
            .create_token(
                &format!("/api/v1/organizations/{}/personal-access-tokens", app.org.id),
                &session,
                json!({
                    "title": "laptop",
                    "permissions": ["project:describe"],
                    "resources": {
                        "mode": "granular",
                        "projects": [{ "projectId": app.project.id, "targets": { "mode": "all" } }],
                    },
                }),
            )
            .await;

        let (status, whoami) = app
            .call(
                Method::GET,
                &format!("/api/v1/whoami?organizationId={}", app.org.id),
                Some(&secret),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(whoami["resolvedPermissions"][0]["level"], "PROJECT");
        assert_eq!(
            whoami["resolvedPermissions"][0]["resolvedResourceIds"],
            json!(["acme/web"])
        );

        let (status, listed) = app
            .call(
                Method::GET,
                &format!("/api/v1/organizations/{}/personal-access-tokens", app.org.id),
                Some(&session),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed["edges"][0]["node"]["kind"], "personal");
    }
}
