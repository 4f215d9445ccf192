//! Administrative endpoints: server CRUD, liveness, metrics exposition, and
//! the machine-readable API description.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};

use super::llm::StopParams;
use super::{ApiResult, AppState};
use crate::config::ServerConfig;
use crate::error::GatewayError;

/// `GET /api/servers`.
pub async fn list_servers(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    Ok(Json(json!({ "servers": state.supervisor.list() })))
}

/// `POST /api/servers` — register and start a new server record.
pub async fn create_server(
    State(state): State<AppState>,
    Json(config): Json<ServerConfig>,
) -> ApiResult<Response> {
    if config.id.is_empty() || config.command.is_empty() {
        return Err(GatewayError::InvalidConfig(
            config.id.clone(),
            "server requires non-empty 'id' and 'command' fields".to_string(),
        )
        .into());
    }
    let id = config.id.clone();
    state.supervisor.insert(config)?;
    state.supervisor.start(&id).await?;
    let snapshot = state.supervisor.status(&id)?;
    Ok((StatusCode::CREATED, Json(json!(snapshot))).into_response())
}

/// `GET /api/servers/{id}`.
pub async fn get_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    Ok(Json(json!(state.supervisor.status(&id)?)))
}

/// `DELETE /api/servers/{id}` — stop and remove.
pub async fn delete_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let record = state.supervisor.get(&id)?;
    let _guard = record.admin_lock.lock().await;
    state.supervisor.remove(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /api/servers/{id}/start`.
pub async fn start_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let record = state.supervisor.get(&id)?;
    let _guard = record.admin_lock.lock().await;
    state.supervisor.start(&id).await?;
    Ok(Json(json!(state.supervisor.status(&id)?)))
}

/// `POST /api/servers/{id}/stop?force=`.
pub async fn stop_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<StopParams>,
) -> ApiResult<Json<Value>> {
    let record = state.supervisor.get(&id)?;
    let _guard = record.admin_lock.lock().await;
    state.supervisor.stop(&id, params.force).await?;
    Ok(Json(json!(state.supervisor.status(&id)?)))
}

/// `POST /api/servers/{id}/restart` — manual restart, always permitted.
pub async fn restart_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let record = state.supervisor.get(&id)?;
    let _guard = record.admin_lock.lock().await;
    state.supervisor.restart(&id, "manual").await?;
    Ok(Json(json!(state.supervisor.status(&id)?)))
}

/// `GET /health` — liveness and persistence status.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "persistence": "disabled",
        "servers": state.supervisor.records().len(),
        "models": state.llm.models.records().len(),
    }))
}

/// `GET /metrics` — textual telemetry exposition.
pub async fn metrics(State(state): State<AppState>) -> Response {
    (
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.telemetry.render(),
    )
        .into_response()
}

/// `GET /docs` — machine-readable route description.
pub async fn docs() -> Json<Value> {
    Json(json!({
        "name": "fluidmcp",
        "version": env!("CARGO_PKG_VERSION"),
        "routes": [
            { "method": "POST", "path": "/{serverId}/mcp", "description": "Synchronous JSON-RPC request to a managed MCP server" },
            { "method": "POST", "path": "/{serverId}/sse", "description": "Streaming JSON-RPC session over server-sent events" },
            { "method": "GET", "path": "/{serverId}/mcp/tools/list", "description": "Shortcut for tools/list" },
            { "method": "POST", "path": "/{serverId}/mcp/tools/call", "description": "Shortcut for tools/call" },
            { "method": "POST", "path": "/api/llm/{model}/v1/chat/completions", "description": "OpenAI-shaped chat completions" },
            { "method": "POST", "path": "/api/llm/{model}/v1/generate/{image|video}", "description": "Create a generation prediction" },
            { "method": "POST", "path": "/api/llm/{model}/v1/animate", "description": "Create an image-to-video prediction" },
            { "method": "GET", "path": "/api/llm/predictions/{id}", "description": "Latest known prediction state" },
            { "method": "GET", "path": "/api/llm/models", "description": "All model statuses" },
            { "method": "GET", "path": "/api/llm/models/{id}", "description": "One model or server status" },
            { "method": "POST", "path": "/api/llm/models/{id}/restart", "description": "Restart a supervised engine" },
            { "method": "POST", "path": "/api/llm/models/{id}/stop", "description": "Stop a supervised engine" },
            { "method": "POST", "path": "/api/llm/models/{id}/health-check", "description": "Immediate health probe" },
            { "method": "GET", "path": "/api/llm/models/{id}/logs", "description": "Tail of the stderr ring buffer" },
            { "method": "GET", "path": "/api/llm/cache/stats", "description": "Response cache statistics" },
            { "method": "GET", "path": "/api/servers", "description": "List server records (admin)" },
            { "method": "POST", "path": "/api/servers", "description": "Create and start a server record (admin)" },
            { "method": "GET", "path": "/api/servers/{id}", "description": "Server status (admin)" },
            { "method": "DELETE", "path": "/api/servers/{id}", "description": "Stop and remove a server record (admin)" },
            { "method": "POST", "path": "/api/servers/{id}/start", "description": "Start a server (admin)" },
            { "method": "POST", "path": "/api/servers/{id}/stop", "description": "Stop a server (admin)" },
            { "method": "POST", "path": "/api/servers/{id}/restart", "description": "Restart a server (admin)" },
            { "method": "GET", "path": "/health", "description": "Gateway liveness and persistence status" },
            { "method": "GET", "path": "/metrics", "description": "Telemetry exposition" },
            { "method": "GET", "path": "/docs", "description": "This document" }
        ]
    }))
}

#[cfg(test)]
mod tests {
    use super::super::build_router;
    use super::super::tests::{body_json, empty_state};
    use axum::body::Body;
    use axum::http::{Request as HttpRequest, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_server_crud_roundtrip() {
        let state = empty_state(None);
        let app = build_router(state.clone());

        // Create a cat-backed server.
        let response = app
            .clone()
            .oneshot(
                HttpRequest::post("/api/servers")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"id": "crud", "command": "cat"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        assert_eq!(body["id"], "crud");
        assert_eq!(body["state"], "running");

        // Read it back.
        let response = app
            .clone()
            .oneshot(
                HttpRequest::get("/api/servers/crud")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Delete stops and removes it.
        let response = app
            .clone()
            .oneshot(
                HttpRequest::delete("/api/servers/crud")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .oneshot(
                HttpRequest::get("/api/servers/crud")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_create_duplicate_is_rejected() {
        let state = empty_state(None);
        let app = build_router(state.clone());
        let body = r#"{"id": "dup", "command": "cat"}"#;

        let first = app
            .clone()
            .oneshot(
                HttpRequest::post("/api/servers")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::CREATED);

        let second = app
            .clone()
            .oneshot(
                HttpRequest::post("/api/servers")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::BAD_REQUEST);

        state.supervisor.stop("dup", true).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_with_missing_command_rejected() {
        let app = build_router(empty_state(None));
        let response = app
            .oneshot(
                HttpRequest::post("/api/servers")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"id": "bad", "command": ""}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_stop_and_restart_server() {
        let state = empty_state(None);
        let app = build_router(state.clone());

        let response = app
            .clone()
            .oneshot(
                HttpRequest::post("/api/servers")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"id": "life", "command": "cat", "grace_period_secs": 0}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .clone()
            .oneshot(
                HttpRequest::post("/api/servers/life/restart")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["restart_count"], 1);

        let response = app
            .clone()
            .oneshot(
                HttpRequest::post("/api/servers/life/stop?force=true")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["state"], "stopped");
    }
}
