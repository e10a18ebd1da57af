//! HTTP surface for the panel frontend.
//!
//! Thin JSON wrapper over [`SessionManager`]; every handler maps straight to
//! one lifecycle operation.

use std::net::SocketAddr;
use std::path::PathBuf;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::HttpConfig;
use crate::error::InstanceError;
use crate::instance::{Instance, SessionManager};

#[derive(Clone)]
pub struct ApiState {
    pub manager: SessionManager,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/instances", get(list_instances))
        .route("/instances/{agent_id}", get(get_instance))
        .route("/instances/{agent_id}/start", post(start_instance))
        .route("/instances/{agent_id}/stop", post(stop_instance))
        .route("/instances/{agent_id}/logout", post(logout_instance))
        .route("/instances/{agent_id}/messages", post(send_message))
        .route("/instances/{agent_id}/media", post(send_media))
        .route("/assignments/{contact_id}", post(reassign_contact))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    state: ApiState,
    config: &HttpConfig,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("HTTP API listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(ErrorBody { error: self.1 })).into_response()
    }
}

impl From<InstanceError> for ApiError {
    fn from(e: InstanceError) -> Self {
        let status = match &e {
            InstanceError::NotFound { .. } => StatusCode::NOT_FOUND,
            InstanceError::NotConnected { .. } => StatusCode::CONFLICT,
            InstanceError::ContactAssignedElsewhere { .. } => StatusCode::CONFLICT,
            InstanceError::Media { .. } => StatusCode::BAD_REQUEST,
            InstanceError::Client(_) => StatusCode::BAD_GATEWAY,
            InstanceError::CredentialsNotCleared { .. } | InstanceError::Database(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        ApiError(status, e.to_string())
    }
}

async fn health_check() -> &'static str {
    "ok"
}

async fn list_instances(State(state): State<ApiState>) -> Json<Vec<Instance>> {
    Json(state.manager.list_instances().await)
}

async fn get_instance(
    State(state): State<ApiState>,
    Path(agent_id): Path<String>,
) -> Result<Json<Instance>, StatusCode> {
    state
        .manager
        .get_instance(&agent_id)
        .await
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

#[derive(Debug, Default, Deserialize)]
struct StartRequest {
    #[serde(default)]
    display_name: Option<String>,
}

async fn start_instance(
    State(state): State<ApiState>,
    Path(agent_id): Path<String>,
    body: Option<Json<StartRequest>>,
) -> Result<Json<Instance>, ApiError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let display_name = request.display_name.unwrap_or_else(|| agent_id.clone());

    match state.manager.start_instance(&agent_id, &display_name).await? {
        Some(instance) => Ok(Json(instance)),
        None => Err(ApiError(
            StatusCode::TOO_MANY_REQUESTS,
            "instance start rate limit reached, retry shortly".to_string(),
        )),
    }
}

async fn stop_instance(
    State(state): State<ApiState>,
    Path(agent_id): Path<String>,
) -> StatusCode {
    if state.manager.stop_instance(&agent_id).await {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn logout_instance(
    State(state): State<ApiState>,
    Path(agent_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.manager.logout_instance(&agent_id).await?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
struct SendMessageRequest {
    to: String,
    text: String,
}

#[derive(Debug, Serialize)]
struct SentResponse {
    message_id: String,
}

async fn send_message(
    State(state): State<ApiState>,
    Path(agent_id): Path<String>,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<SentResponse>, ApiError> {
    if req.text.trim().is_empty() {
        return Err(ApiError(
            StatusCode::BAD_REQUEST,
            "message text is empty".to_string(),
        ));
    }
    let message_id = state
        .manager
        .send_message(&agent_id, &req.to, &req.text)
        .await?;
    Ok(Json(SentResponse { message_id }))
}

#[derive(Debug, Deserialize)]
struct SendMediaRequest {
    to: String,
    path: PathBuf,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    mime_type: Option<String>,
}

async fn send_media(
    State(state): State<ApiState>,
    Path(agent_id): Path<String>,
    Json(req): Json<SendMediaRequest>,
) -> Result<Json<SentResponse>, ApiError> {
    let message_id = state
        .manager
        .send_media(
            &agent_id,
            &req.to,
            &req.path,
            req.caption.as_deref(),
            req.mime_type.as_deref(),
        )
        .await?;
    Ok(Json(SentResponse { message_id }))
}

#[derive(Debug, Deserialize)]
struct ReassignRequest {
    agent_id: String,
}

#[derive(Debug, Serialize)]
struct ReassignResponse {
    previous_agent_id: Option<String>,
}

async fn reassign_contact(
    State(state): State<ApiState>,
    Path(contact_id): Path<String>,
    Json(req): Json<ReassignRequest>,
) -> Result<Json<ReassignResponse>, ApiError> {
    let previous_agent_id = state
        .manager
        .router()
        .reassign(&contact_id, &req.agent_id)
        .await
        .map_err(|e| ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(ReassignResponse { previous_agent_id }))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::config::ManagerConfig;
    use crate::store::PersistenceGateway;
    use crate::testing::harness;

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let h = harness(ManagerConfig::default());
        let app = router(ApiState { manager: h.manager });

        let resp = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_start_then_get() {
        let h = harness(ManagerConfig::default());
        let app = router(ApiState {
            manager: h.manager.clone(),
        });

        let resp = app
            .clone()
            .oneshot(post_json(
                "/instances/a1/start",
                serde_json::json!({ "display_name": "Ana" }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["agent_id"], "a1");
        assert_eq!(body["status"], "disconnected");
        assert!(body.get("generation").is_none());

        let resp = app
            .oneshot(Request::get("/instances/a1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["display_name"], "Ana");
    }

    #[tokio::test]
    async fn test_start_without_body_uses_agent_id() {
        let h = harness(ManagerConfig::default());
        let app = router(ApiState { manager: h.manager });

        let resp = app
            .oneshot(
                Request::post("/instances/a1/start")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["display_name"], "a1");
    }

    #[tokio::test]
    async fn test_rate_limited_start() {
        let config = ManagerConfig {
            max_starts_per_window: 1,
            ..ManagerConfig::default()
        };
        let h = harness(config);
        h.manager.start_instance("a1", "Ana").await.unwrap();
        let app = router(ApiState { manager: h.manager });

        let resp = app
            .oneshot(post_json("/instances/b1/start", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_unknown_instance() {
        let h = harness(ManagerConfig::default());
        let app = router(ApiState { manager: h.manager });

        let resp = app
            .clone()
            .oneshot(Request::get("/instances/ghost").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = app
            .oneshot(post_json(
                "/instances/ghost/messages",
                serde_json::json!({ "to": "5551", "text": "hi" }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_send_on_disconnected_instance_conflicts() {
        let h = harness(ManagerConfig::default());
        h.manager.start_instance("a1", "Ana").await.unwrap();
        let app = router(ApiState { manager: h.manager });

        let resp = app
            .oneshot(post_json(
                "/instances/a1/messages",
                serde_json::json!({ "to": "5551", "text": "hi" }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert!(
            body_json(resp).await["error"]
                .as_str()
                .unwrap()
                .contains("not connected")
        );
    }

    #[tokio::test]
    async fn test_reassign_contact() {
        let h = harness(ManagerConfig::default());
        h.manager
            .router()
            .claim_for_outbound("a1", "5551", false)
            .await
            .unwrap();
        let app = router(ApiState { manager: h.manager });

        let resp = app
            .oneshot(post_json(
                "/assignments/5551",
                serde_json::json!({ "agent_id": "b1" }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["previous_agent_id"], "a1");
        let assignment = h.store.get_assignment("5551").await.unwrap().unwrap();
        assert_eq!(assignment.agent_id, "b1");
    }

    #[tokio::test]
    async fn test_stop_unknown_is_not_found() {
        let h = harness(ManagerConfig::default());
        let app = router(ApiState { manager: h.manager });

        let resp = app
            .oneshot(post_json("/instances/ghost/stop", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
