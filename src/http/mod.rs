//! HTTP surface: routing, shared state, admin authentication, CORS, and the
//! single translation from classified error kinds to status codes.

pub mod admin;
pub mod llm;
pub mod mcp;

use std::sync::Arc;

use axum::Router;
use axum::extract::{Request, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::GatewaySettings;
use crate::error::GatewayError;
use crate::llm::LlmContext;
use crate::server::supervisor::Supervisor;
use crate::telemetry::{GatewayMetrics, TelemetryRegistry};

/// Root context handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
    pub llm: LlmContext,
    pub telemetry: Arc<TelemetryRegistry>,
    pub metrics: GatewayMetrics,
    pub settings: GatewaySettings,
    /// Resolved bearer token guarding admin routes, when configured.
    pub bearer_token: Option<String>,
}

/// Error wrapper performing the kind → HTTP status translation. Components
/// below the surface never construct HTTP errors themselves.
pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::CapabilityMismatch(_, _) => StatusCode::BAD_REQUEST,
            GatewayError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            GatewayError::Auth(_) => StatusCode::UNAUTHORIZED,
            GatewayError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            // 4xx from a provider is echoed as-is.
            GatewayError::Client { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_REQUEST)
            }
            GatewayError::Server { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::Io(_, _) => StatusCode::BAD_GATEWAY,
            GatewayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::InvalidState(_, _) => StatusCode::CONFLICT,
            GatewayError::DuplicateId(_) | GatewayError::InvalidConfig(_, _) => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::Protocol(_, _) => StatusCode::BAD_GATEWAY,
        };
        let body = axum::Json(serde_json::json!({
            "error": {
                "kind": self.0.kind(),
                "message": self.0.to_string(),
            }
        }));
        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Bearer-token guard applied to the admin subtree when a token is
/// configured; open otherwise.
async fn require_bearer(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if let Some(expected) = &state.bearer_token {
        let presented = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if presented != Some(expected.as_str()) {
            return ApiError(GatewayError::Auth(
                "missing or invalid bearer token".to_string(),
            ))
            .into_response();
        }
    }
    next.run(req).await
}

fn cors_layer(settings: &GatewaySettings) -> CorsLayer {
    if settings.cors_origins.iter().any(|o| o == "*") {
        return CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);
    }
    let origins: Vec<HeaderValue> = settings
        .cors_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    CorsLayer::new().allow_origin(origins)
}

/// Assemble the full route table over the shared state.
pub fn build_router(state: AppState) -> Router {
    let admin_routes = Router::new()
        .route(
            "/api/servers",
            get(admin::list_servers).post(admin::create_server),
        )
        .route(
            "/api/servers/:id",
            get(admin::get_server).delete(admin::delete_server),
        )
        .route("/api/servers/:id/start", post(admin::start_server))
        .route("/api/servers/:id/stop", post(admin::stop_server))
        .route("/api/servers/:id/restart", post(admin::restart_server))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_bearer,
        ));

    let llm_routes = Router::new()
        .route(
            "/api/llm/:model/v1/chat/completions",
            post(llm::chat_completions),
        )
        .route("/api/llm/:model/v1/generate/:kind", post(llm::generate))
        .route("/api/llm/:model/v1/animate", post(llm::animate))
        .route("/api/llm/predictions/:id", get(llm::get_prediction))
        .route("/api/llm/models", get(llm::list_models))
        .route("/api/llm/models/:id", get(llm::model_status))
        .route("/api/llm/models/:id/restart", post(llm::restart_model))
        .route("/api/llm/models/:id/stop", post(llm::stop_model))
        .route(
            "/api/llm/models/:id/health-check",
            post(llm::health_check_model),
        )
        .route("/api/llm/models/:id/logs", get(llm::model_logs))
        .route("/api/llm/cache/stats", get(llm::cache_stats));

    Router::new()
        .route("/health", get(admin::health))
        .route("/metrics", get(admin::metrics))
        .route("/docs", get(admin::docs))
        .merge(llm_routes)
        .merge(admin_routes)
        .route("/:server_id/mcp", post(mcp::post_rpc))
        .route("/:server_id/sse", post(mcp::post_sse))
        .route("/:server_id/mcp/tools/list", get(mcp::get_tools_list))
        .route("/:server_id/mcp/tools/call", post(mcp::post_tools_call))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&state.settings))
        .with_state(state)
}
