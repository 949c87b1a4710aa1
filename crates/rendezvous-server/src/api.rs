use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tokio::sync::Notify;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::account::AccountSummary;
use crate::actor::RegistryHandle;
use crate::config::ServerConfig;
use crate::error::ServerError;

#[derive(Clone)]
pub struct AppState {
    pub registry: RegistryHandle,
    pub config: Arc<ServerConfig>,
    /// Wakes the broadcaster for an immediate presence cycle.
    pub broadcast_trigger: Arc<Notify>,
    pub started_at: Instant,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .route("/admin/users", get(admin_list_users))
        .route("/admin/users/:username", delete(admin_delete_user))
        .route("/admin/users/batch-delete", post(admin_batch_delete))
        .route("/admin/broadcast", post(admin_broadcast))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize, Deserialize)]
struct ServerInfoResponse {
    version: String,
    registration_open: bool,
    online_users: usize,
    total_users: usize,
    uptime_secs: u64,
}

#[derive(Serialize, Deserialize)]
struct BatchDeleteRequest {
    usernames: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct BatchDeleteResponse {
    deleted: Vec<String>,
    missing: Vec<String>,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn server_info(
    State(state): State<AppState>,
) -> Result<Json<ServerInfoResponse>, ServerError> {
    let stats = state.registry.stats().await?;
    Ok(Json(ServerInfoResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        registration_open: state.config.registration_open,
        online_users: stats.online_users,
        total_users: stats.total_users,
        uptime_secs: state.started_at.elapsed().as_secs(),
    }))
}

fn verify_admin_token(headers: &HeaderMap, config: &ServerConfig) -> Result<(), ServerError> {
    let Some(ref expected) = config.admin_token else {
        return Err(ServerError::Forbidden(
            "Admin API is disabled (no ADMIN_TOKEN configured)".into(),
        ));
    };

    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let token = auth.strip_prefix("Bearer ").unwrap_or(auth);

    let token_bytes = token.as_bytes();
    let expected_bytes = expected.as_bytes();
    if token_bytes.len() != expected_bytes.len()
        || token_bytes.ct_eq(expected_bytes).unwrap_u8() != 1
    {
        return Err(ServerError::Forbidden("Invalid admin token".into()));
    }

    Ok(())
}

async fn admin_list_users(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<Vec<AccountSummary>>, ServerError> {
    verify_admin_token(&headers, &state.config)?;
    Ok(Json(state.registry.list_accounts().await?))
}

async fn admin_delete_user(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    verify_admin_token(&headers, &state.config)?;
    state.registry.delete_account(&username).await?;
    info!(username = %username, "Account deleted by admin");
    Ok(Json(serde_json::json!({ "deleted": true })))
}

async fn admin_batch_delete(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(request): Json<BatchDeleteRequest>,
) -> Result<Json<BatchDeleteResponse>, ServerError> {
    verify_admin_token(&headers, &state.config)?;

    let mut response = BatchDeleteResponse {
        deleted: Vec::new(),
        missing: Vec::new(),
    };
    for username in request.usernames {
        match state.registry.delete_account(&username).await {
            Ok(()) => response.deleted.push(username),
            Err(ServerError::TargetUnknown(_)) => response.missing.push(username),
            Err(e) => return Err(e),
        }
    }
    info!(
        deleted = response.deleted.len(),
        missing = response.missing.len(),
        "Batch delete by admin"
    );
    Ok(Json(response))
}

async fn admin_broadcast(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ServerError> {
    verify_admin_token(&headers, &state.config)?;
    state.broadcast_trigger.notify_one();
    Ok(Json(serde_json::json!({ "triggered": true })))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::spawn_registry;
    use crate::registry::Registry;
    use crate::store::{AccountStore, AccountTable};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use rendezvous_shared::Credentials;
    use tower::ServiceExt;

    async fn test_state(dir: &std::path::Path, token: Option<&str>) -> AppState {
        let store = AccountStore::new(dir.join("users.json"));
        let (registry, _task) = spawn_registry(Registry::new(AccountTable::new(), true), store);
        for name in ["alice", "bob"] {
            registry
                .register(Credentials::new(name, "pw"))
                .await
                .unwrap();
        }
        AppState {
            registry,
            config: Arc::new(ServerConfig {
                admin_token: token.map(str::to_string),
                ..ServerConfig::default()
            }),
            broadcast_trigger: Arc::new(Notify::new()),
            started_at: Instant::now(),
        }
    }

    async fn body_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn admin_request(method: &str, uri: &str, body: Body) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", "Bearer s3cret")
            .header("content-type", "application/json")
            .body(body)
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_and_info() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_state(dir.path(), None).await);

        let response = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::get("/info").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let info: ServerInfoResponse = body_json(response).await;
        assert_eq!(info.total_users, 2);
        assert_eq!(info.online_users, 0);
        assert!(info.registration_open);
    }

    #[tokio::test]
    async fn test_admin_disabled_without_token() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_state(dir.path(), None).await);
        let response = app
            .oneshot(admin_request("GET", "/admin/users", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_admin_rejects_wrong_token() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_state(dir.path(), Some("other")).await);
        let response = app
            .oneshot(admin_request("GET", "/admin/users", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_admin_list_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), Some("s3cret")).await;
        let registry = state.registry.clone();
        let app = build_router(state);

        let response = app
            .clone()
            .oneshot(admin_request("GET", "/admin/users", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let users: Vec<AccountSummary> = body_json(response).await;
        assert_eq!(users.len(), 2);
        assert!(users.iter().all(|u| !u.online));

        let response = app
            .clone()
            .oneshot(admin_request("DELETE", "/admin/users/alice", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(admin_request("DELETE", "/admin/users/alice", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        assert_eq!(registry.stats().await.unwrap().total_users, 1);
    }

    #[tokio::test]
    async fn test_admin_batch_delete() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_state(dir.path(), Some("s3cret")).await);

        let body = serde_json::to_vec(&BatchDeleteRequest {
            usernames: vec!["alice".into(), "ghost".into()],
        })
        .unwrap();
        let response = app
            .oneshot(admin_request(
                "POST",
                "/admin/users/batch-delete",
                Body::from(body),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let result: BatchDeleteResponse = body_json(response).await;
        assert_eq!(result.deleted, vec!["alice".to_string()]);
        assert_eq!(result.missing, vec!["ghost".to_string()]);
    }
}
