//! FluidMCP — gateway hosting a fleet of MCP stdio servers and proxying LLM
//! inference providers behind a single HTTP surface.
//!
//! The core pieces: a child-process supervisor with a JSON-RPC multiplexer
//! over each child's stdio, an SSE bridge for streaming sessions, a health
//! monitor enforcing restart policy, an LLM adapter layer (local engines and
//! prediction providers) with response cache, token-bucket limiting and
//! retry, and a telemetry registry feeding `/metrics`.

pub mod cache;
pub mod config;
pub mod error;
pub mod http;
pub mod install;
pub mod limiter;
pub mod llm;
pub mod retry;
pub mod server;
pub mod telemetry;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

pub use cache::ResponseCache;
pub use config::{
    Capability, GatewayConfig, GatewaySettings, ModelConfig, ProviderKind, RestartPolicy,
    ServerConfig, parse_env_ref, resolve_env_vars,
};
pub use error::{GatewayError, Result};
pub use http::{AppState, build_router};
pub use llm::{LlmContext, ModelRegistry};
pub use server::ServerState;
pub use server::monitor::HealthMonitor;
pub use server::supervisor::Supervisor;
pub use telemetry::{GatewayMetrics, TelemetryRegistry};

use llm::poller::PredictionStore;

/// Synthesize a supervised-process record for a model's local engine.
fn engine_server_config(model: &ModelConfig) -> ServerConfig {
    ServerConfig {
        id: model.id.clone(),
        enabled: true,
        command: model.command.clone().unwrap_or_default(),
        args: model.args.clone(),
        env: model.env.clone(),
        install_path: model.install_path.clone(),
        port: None,
        probe_url: Some(format!(
            "{}/health",
            model.endpoint.trim_end_matches('/')
        )),
        restart: model.restart.clone(),
        stderr_markers: model.stderr_markers.clone(),
        grace_period_secs: 5,
        call_timeout_secs: 30,
        stream_timeout_secs: 300,
        stderr_capacity: 10_000,
    }
}

/// Build the shared application state from a validated config: registers
/// every enabled server and model, wires the response cache to the first
/// caching model, and spawns nothing yet.
pub fn build_state(config: &GatewayConfig, cancel: CancellationToken) -> Result<AppState> {
    config.validate()?;

    let telemetry = Arc::new(TelemetryRegistry::new());
    let metrics = GatewayMetrics::new(&telemetry);
    let supervisor = Supervisor::new(metrics.clone());
    let models = Arc::new(ModelRegistry::new());
    let cache = Arc::new(ResponseCache::new());
    let predictions = Arc::new(PredictionStore::new());

    for server in config.servers.values() {
        if server.enabled {
            supervisor.insert(server.clone())?;
        }
    }

    // Deterministic order so the same model fixes the cache every run.
    let mut model_configs: Vec<&ModelConfig> =
        config.models.values().filter(|m| m.enabled).collect();
    model_configs.sort_by(|a, b| a.id.cmp(&b.id));
    for model in model_configs {
        if let Some(cache_cfg) = model.cache.as_ref().filter(|c| c.enabled) {
            cache.ensure_configured(
                Duration::from_secs(cache_cfg.ttl_secs),
                cache_cfg.capacity,
            );
        }
        let record = models.insert(model.clone())?;
        if record.has_engine() {
            supervisor.insert(engine_server_config(model))?;
        }
    }

    let mut settings = config.gateway.clone();
    settings.apply_env();
    let bearer_token = settings.resolved_bearer_token();
    let llm = LlmContext::new(models, cache, predictions, metrics.clone(), cancel);

    Ok(AppState {
        supervisor,
        llm,
        telemetry,
        metrics,
        settings,
        bearer_token,
    })
}

/// Start every registered record that has a command to run.
async fn start_fleet(state: &AppState) {
    for record in state.supervisor.records() {
        let id = record.config.id.clone();
        if let Err(e) = state.supervisor.start(&id).await {
            // The record stays in Error; the monitor and admin surface can
            // pick it up from there.
            tracing::warn!(server = %id, error = %e, "failed to start server");
        }
    }
}

/// Run the gateway until the cancellation token fires: spawn the fleet,
/// start the health monitor, bind the HTTP listener, and serve.
pub async fn run_gateway(config: GatewayConfig, cancel: CancellationToken) -> Result<()> {
    let state = build_state(&config, cancel.clone())?;
    start_fleet(&state).await;

    let monitor = HealthMonitor::new(
        state.supervisor.clone(),
        Duration::from_secs(state.settings.probe_interval_secs),
        cancel.clone(),
    );
    tokio::spawn(monitor.run());

    let addr = format!("{}:{}", state.settings.host, state.settings.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| GatewayError::Io("gateway".to_string(), format!("bind {addr}: {e}")))?;
    tracing::info!(addr = %addr, "gateway listening");

    let supervisor = state.supervisor.clone();
    let app = build_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .map_err(|e| GatewayError::Io("gateway".to_string(), e.to_string()))?;

    tracing::info!("gateway shutting down");
    supervisor.shutdown_all().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_state_registers_fleet() {
        let config = GatewayConfig::from_toml(
            r#"
            [servers.demo]
            id = "demo"
            command = "cat"

            [models.llama]
            id = "llama"
            provider = "local-engine"
            endpoint = "http://127.0.0.1:8000"
            command = "llama-server"

            [models.sdxl]
            id = "sdxl"
            provider = "replicate"
            endpoint = "https://api.replicate.com"
            api_token = "${REPLICATE_API_TOKEN}"
            provider_model = "stability-ai/sdxl:39ed52f2"
            capabilities = ["text-to-image"]

            [models.sdxl.cache]
            enabled = true
            ttl_secs = 60
            capacity = 16
            "#,
        )
        .unwrap();
        let state = build_state(&config, CancellationToken::new()).unwrap();

        // The MCP server and the supervised engine are both records.
        assert!(state.supervisor.get("demo").is_ok());
        assert!(state.supervisor.get("llama").is_ok());
        // The remote prediction model is not supervised.
        assert!(state.supervisor.get("sdxl").is_err());
        assert!(state.llm.models.get("sdxl").is_ok());

        // The caching model fixed the global cache parameters.
        let stats = state.llm.cache.stats();
        assert_eq!(stats.ttl_secs, 60);
        assert_eq!(stats.max_size, 16);

        // The engine probe targets the model endpoint.
        let engine = state.supervisor.get("llama").unwrap();
        assert_eq!(
            engine.config.probe_url.as_deref(),
            Some("http://127.0.0.1:8000/health")
        );
    }

    #[test]
    fn test_build_state_rejects_invalid_config() {
        let config = GatewayConfig::from_toml(
            r#"
            [servers.bad]
            id = "bad"
            command = ""
            "#,
        )
        .unwrap();
        assert!(build_state(&config, CancellationToken::new()).is_err());
    }
}
