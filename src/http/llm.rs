//! OpenAI-compatible LLM routes and model lifecycle administration.

use axum::Json;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::{Value, json};

use super::{ApiError, ApiResult, AppState};
use crate::error::GatewayError;
use crate::llm::adapter::{self, GenerationKind};
use crate::llm::local::ChatOutcome;
use crate::server::monitor::probe_record;

/// `POST /api/llm/{model}/v1/chat/completions`.
///
/// Non-streaming responses are returned as JSON; streaming responses relay
/// the provider's SSE bytes unmodified.
pub async fn chat_completions(
    State(state): State<AppState>,
    Path(model): Path<String>,
    Json(body): Json<Value>,
) -> ApiResult<Response> {
    match adapter::chat(&state.llm, &model, body).await? {
        ChatOutcome::Completed(value) => Ok(Json(value).into_response()),
        ChatOutcome::Stream(upstream) => {
            let content_type = upstream
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("text/event-stream")
                .to_string();
            let body = Body::from_stream(upstream.bytes_stream());
            Ok(([(header::CONTENT_TYPE, content_type)], body).into_response())
        }
    }
}

/// `POST /api/llm/{model}/v1/generate/{image|video}`.
pub async fn generate(
    State(state): State<AppState>,
    Path((model, kind)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let kind = match kind.as_str() {
        "image" => GenerationKind::Image,
        "video" => GenerationKind::Video,
        other => {
            return Err(ApiError(GatewayError::NotFound(format!(
                "generation kind '{}'",
                other
            ))));
        }
    };
    Ok(Json(
        adapter::create_generation(&state.llm, &model, kind, body).await?,
    ))
}

/// `POST /api/llm/{model}/v1/animate` — image→video prediction.
pub async fn animate(
    State(state): State<AppState>,
    Path(model): Path<String>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    Ok(Json(
        adapter::create_generation(&state.llm, &model, GenerationKind::Animate, body).await?,
    ))
}

/// `GET /api/llm/predictions/{id}` — latest known state, no re-poll.
pub async fn get_prediction(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let snapshot = state.llm.predictions.get(&id)?;
    Ok(Json(serde_json::to_value(snapshot).unwrap_or_default()))
}

/// Merge a model's rolling stats with its engine lifecycle snapshot.
fn merged_model_status(state: &AppState, record: &crate::llm::ModelRecord) -> Value {
    let mut status = serde_json::to_value(record.status()).unwrap_or_default();
    match state.supervisor.status(&record.config.id) {
        Ok(engine) => {
            status["is_running"] = json!(engine.is_running);
            status["restart_count"] = json!(engine.restart_count);
            status["engine"] = serde_json::to_value(engine).unwrap_or_default();
        }
        Err(_) => {
            // No supervised process: the model is as available as its
            // endpoint; lifecycle counters do not apply.
            status["is_running"] = json!(true);
            status["restart_count"] = json!(0);
        }
    }
    status
}

/// `GET /api/llm/models`.
pub async fn list_models(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let models: Vec<Value> = state
        .llm
        .models
        .records()
        .iter()
        .map(|r| merged_model_status(&state, r))
        .collect();
    Ok(Json(json!({ "models": models })))
}

/// `GET /api/llm/models/{id}`.
///
/// Ids that name a supervised MCP server rather than a model resolve to the
/// server's lifecycle snapshot, so the whole fleet reads from one namespace.
pub async fn model_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    if let Ok(record) = state.llm.models.get(&id) {
        return Ok(Json(merged_model_status(&state, &record)));
    }
    let snapshot = state.supervisor.status(&id)?;
    Ok(Json(serde_json::to_value(snapshot).unwrap_or_default()))
}

/// Resolve a lifecycle target: any supervised record under this id.
fn lifecycle_target(state: &AppState, id: &str) -> crate::Result<()> {
    if state.supervisor.get(id).is_ok() {
        return Ok(());
    }
    if state.llm.models.get(id).is_ok() {
        // Known model, but nothing supervised to act on.
        return Err(GatewayError::InvalidState(
            id.to_string(),
            "model has no supervised engine process".to_string(),
        ));
    }
    Err(GatewayError::NotFound(id.to_string()))
}

/// `POST /api/llm/models/{id}/restart`.
pub async fn restart_model(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    lifecycle_target(&state, &id)?;
    let record = state.supervisor.get(&id)?;
    let _guard = record.admin_lock.lock().await;
    state.supervisor.restart(&id, "manual").await?;
    Ok(Json(
        serde_json::to_value(state.supervisor.status(&id)?).unwrap_or_default(),
    ))
}

#[derive(Debug, Deserialize)]
pub struct StopParams {
    #[serde(default)]
    pub force: bool,
}

/// `POST /api/llm/models/{id}/stop?force=`.
pub async fn stop_model(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<StopParams>,
) -> ApiResult<Json<Value>> {
    lifecycle_target(&state, &id)?;
    let record = state.supervisor.get(&id)?;
    let _guard = record.admin_lock.lock().await;
    state.supervisor.stop(&id, params.force).await?;
    Ok(Json(
        serde_json::to_value(state.supervisor.status(&id)?).unwrap_or_default(),
    ))
}

/// `POST /api/llm/models/{id}/health-check` — immediate probe, bypassing the
/// monitor interval.
pub async fn health_check_model(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    if let Ok(record) = state.supervisor.get(&id) {
        let verdict = probe_record(&state.llm.http, &record).await;
        let (healthy, message) = match verdict {
            Ok(()) => {
                record.mark_healthy();
                (true, "ok".to_string())
            }
            Err(reason) => {
                record.mark_unhealthy(&reason);
                (false, reason)
            }
        };
        return Ok(Json(json!({ "id": id, "healthy": healthy, "message": message })));
    }

    // Endpoint-only model: probe its HTTP surface directly.
    let model = state.llm.models.get(&id)?;
    let endpoint = model.config.endpoint.trim_end_matches('/');
    let verdict = probe_endpoint(&state.llm.http, endpoint).await;
    let (healthy, message) = match verdict {
        Ok(()) => (true, "ok".to_string()),
        Err(reason) => (false, reason),
    };
    Ok(Json(json!({ "id": id, "healthy": healthy, "message": message })))
}

/// GET `/health` on the endpoint, falling back to `/v1/models`; the last
/// failure reason is reported.
async fn probe_endpoint(client: &reqwest::Client, endpoint: &str) -> Result<(), String> {
    let mut last_err = "probe failed".to_string();
    for path in ["/health", "/v1/models"] {
        match client
            .get(format!("{endpoint}{path}"))
            .timeout(std::time::Duration::from_secs(3))
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => return Ok(()),
            Ok(resp) => last_err = format!("probe returned {}", resp.status()),
            Err(e) if e.is_timeout() => last_err = "probe timed out".to_string(),
            Err(e) => last_err = format!("probe failed: {e}"),
        }
    }
    Err(last_err)
}

#[derive(Debug, Deserialize)]
pub struct LogParams {
    #[serde(default = "default_log_lines")]
    pub lines: usize,
}

fn default_log_lines() -> usize {
    100
}

/// `GET /api/llm/models/{id}/logs?lines=` — tail of the stderr ring buffer.
pub async fn model_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<LogParams>,
) -> ApiResult<Json<Value>> {
    lifecycle_target(&state, &id)?;
    let record = state.supervisor.get(&id)?;
    let lines = record.tail_stderr(params.lines);
    Ok(Json(json!({ "id": id, "lines": lines })))
}

/// `GET /api/llm/cache/stats`.
pub async fn cache_stats(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    Ok(Json(
        serde_json::to_value(state.llm.cache.stats()).unwrap_or_default(),
    ))
}

#[cfg(test)]
mod tests {
    use super::super::build_router;
    use super::super::tests::{body_json, empty_state};
    use crate::config::{Capability, ProviderKind};
    use crate::llm::tests::model_config;
    use axum::body::Body;
    use axum::http::{Request as HttpRequest, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_unknown_model_chat_404() {
        let app = build_router(empty_state(None));
        let response = app
            .oneshot(
                HttpRequest::post("/api/llm/ghost/v1/chat/completions")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"messages":[]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_replicate_stream_maps_to_501() {
        let state = empty_state(None);
        let mut config = model_config("pred", ProviderKind::Replicate);
        config.api_token = Some("${FMCP_LLM_HTTP_TEST_TOKEN}".to_string());
        state.llm.models.insert(config).unwrap();
        let app = build_router(state);

        let response = app
            .oneshot(
                HttpRequest::post("/api/llm/pred/v1/chat/completions")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"messages":[],"stream":true}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
        let body = body_json(response).await;
        assert_eq!(body["error"]["kind"], "not_implemented");
    }

    #[tokio::test]
    async fn test_generation_kind_validation() {
        let state = empty_state(None);
        let mut config = model_config("sdxl", ProviderKind::Replicate);
        config.api_token = Some("${FMCP_LLM_HTTP_GEN_TOKEN}".to_string());
        config.capabilities = vec![Capability::TextToImage];
        state.llm.models.insert(config).unwrap();
        let app = build_router(state);

        let response = app
            .oneshot(
                HttpRequest::post("/api/llm/sdxl/v1/generate/audio")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"prompt":"x"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_capability_mismatch_maps_to_400() {
        let state = empty_state(None);
        let mut config = model_config("textonly", ProviderKind::Replicate);
        config.api_token = Some("${FMCP_LLM_HTTP_CAP_TOKEN}".to_string());
        state.llm.models.insert(config).unwrap();
        let app = build_router(state);

        let response = app
            .oneshot(
                HttpRequest::post("/api/llm/textonly/v1/generate/image")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"prompt":"x"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"]["kind"], "capability_mismatch");
    }

    #[tokio::test]
    async fn test_model_listing_includes_stats() {
        let state = empty_state(None);
        state
            .llm
            .models
            .insert(model_config("llama", ProviderKind::LocalEngine))
            .unwrap();
        let app = build_router(state);

        let response = app
            .oneshot(
                HttpRequest::get("/api/llm/models")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let models = body["models"].as_array().unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0]["id"], "llama");
        assert_eq!(models[0]["is_running"], true);
        assert_eq!(models[0]["restart_count"], 0);
    }

    #[tokio::test]
    async fn test_logs_for_model_without_engine_conflicts() {
        let state = empty_state(None);
        state
            .llm
            .models
            .insert(model_config("remote", ProviderKind::LocalEngine))
            .unwrap();
        let app = build_router(state);

        let response = app
            .oneshot(
                HttpRequest::get("/api/llm/models/remote/logs?lines=10")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_unknown_prediction_404() {
        let app = build_router(empty_state(None));
        let response = app
            .oneshot(
                HttpRequest::get("/api/llm/predictions/p-ghost")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cache_stats_endpoint() {
        let app = build_router(empty_state(None));
        let response = app
            .oneshot(
                HttpRequest::get("/api/llm/cache/stats")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["hits"], 0);
        assert_eq!(body["size"], 0);
    }
}
