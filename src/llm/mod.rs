//! LLM provider layer: model records, the provider-agnostic adapter, and the
//! prediction poller.

pub mod adapter;
pub mod local;
pub mod poller;
pub mod replicate;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::Serialize;

use crate::cache::ResponseCache;
use crate::config::{Capability, ModelConfig, ProviderKind};
use crate::error::GatewayError;
use crate::limiter::TokenBucket;
use crate::telemetry::GatewayMetrics;
use poller::PredictionStore;

/// Rolling request counters and latency extremes for one model.
#[derive(Debug, Default, Clone)]
struct RequestStats {
    requests: u64,
    successes: u64,
    failures: u64,
    latency_min: Option<f64>,
    latency_max: f64,
    latency_sum: f64,
}

/// One configured model: static config plus limiter and rolling stats.
pub struct ModelRecord {
    pub config: ModelConfig,
    pub limiter: Option<TokenBucket>,
    stats: Mutex<RequestStats>,
}

impl ModelRecord {
    pub fn new(config: ModelConfig) -> Self {
        let limiter = config.rate_limit.as_ref().map(TokenBucket::new);
        ModelRecord {
            config,
            limiter,
            stats: Mutex::new(RequestStats::default()),
        }
    }

    /// Whether the gateway supervises an engine process for this model.
    pub fn has_engine(&self) -> bool {
        self.config.provider == ProviderKind::LocalEngine && self.config.command.is_some()
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.config.capabilities.contains(&capability)
    }

    /// Record one finished request; updates the rolling counters and the
    /// min/avg/max latency gauges.
    pub fn observe(&self, latency: Duration, success: bool, metrics: &GatewayMetrics) {
        let secs = latency.as_secs_f64();
        let id = self.config.id.as_str();
        let provider = self.config.provider.label();
        let mut stats = self.stats.lock().expect("stats lock poisoned");
        stats.requests += 1;
        if success {
            stats.successes += 1;
        } else {
            stats.failures += 1;
        }
        stats.latency_min = Some(stats.latency_min.map_or(secs, |m| m.min(secs)));
        stats.latency_max = stats.latency_max.max(secs);
        stats.latency_sum += secs;
        let avg = stats.latency_sum / stats.requests as f64;

        metrics
            .llm_latency_seconds
            .set(&[id, provider, "min"], stats.latency_min.unwrap_or(0.0));
        metrics.llm_latency_seconds.set(&[id, provider, "avg"], avg);
        metrics
            .llm_latency_seconds
            .set(&[id, provider, "max"], stats.latency_max);
        metrics
            .llm_request_duration_seconds
            .observe(&[id, provider], secs);
    }

    pub fn status(&self) -> ModelStatus {
        let stats = self.stats.lock().expect("stats lock poisoned").clone();
        let avg = if stats.requests == 0 {
            0.0
        } else {
            stats.latency_sum / stats.requests as f64
        };
        ModelStatus {
            id: self.config.id.clone(),
            provider: self.config.provider.label().to_string(),
            capabilities: self
                .config
                .capabilities
                .iter()
                .map(|c| c.as_str().to_string())
                .collect(),
            requests: stats.requests,
            successes: stats.successes,
            failures: stats.failures,
            latency_min_seconds: stats.latency_min.unwrap_or(0.0),
            latency_avg_seconds: avg,
            latency_max_seconds: stats.latency_max,
            limiter: self.limiter.as_ref().map(|l| LimiterStatus {
                available_tokens: l.available_tokens(),
                capacity: l.capacity(),
                rate: l.rate(),
                utilisation: l.utilisation(),
            }),
            has_engine: self.has_engine(),
        }
    }
}

/// Limiter view inside a model status.
#[derive(Debug, Clone, Serialize)]
pub struct LimiterStatus {
    pub available_tokens: f64,
    pub capacity: f64,
    pub rate: f64,
    pub utilisation: f64,
}

/// Model status exposed by the admin endpoints. Engine lifecycle fields are
/// merged in by the HTTP surface from the supervisor snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ModelStatus {
    pub id: String,
    pub provider: String,
    pub capabilities: Vec<String>,
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub latency_min_seconds: f64,
    pub latency_avg_seconds: f64,
    pub latency_max_seconds: f64,
    pub limiter: Option<LimiterStatus>,
    pub has_engine: bool,
}

/// Registry of configured models.
#[derive(Default)]
pub struct ModelRegistry {
    models: RwLock<HashMap<String, Arc<ModelRecord>>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, config: ModelConfig) -> crate::Result<Arc<ModelRecord>> {
        let mut models = self.models.write().expect("models lock poisoned");
        if models.contains_key(&config.id) {
            return Err(GatewayError::DuplicateId(config.id));
        }
        let record = Arc::new(ModelRecord::new(config));
        models.insert(record.config.id.clone(), record.clone());
        Ok(record)
    }

    pub fn get(&self, id: &str) -> crate::Result<Arc<ModelRecord>> {
        self.models
            .read()
            .expect("models lock poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(id.to_string()))
    }

    pub fn records(&self) -> Vec<Arc<ModelRecord>> {
        let mut records: Vec<Arc<ModelRecord>> = self
            .models
            .read()
            .expect("models lock poisoned")
            .values()
            .cloned()
            .collect();
        records.sort_by(|a, b| a.config.id.cmp(&b.config.id));
        records
    }

    pub fn remove(&self, id: &str) -> crate::Result<()> {
        self.models
            .write()
            .expect("models lock poisoned")
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| GatewayError::NotFound(id.to_string()))
    }
}

/// Shared handles the adapter needs; constructed once at startup and owned by
/// the HTTP state.
#[derive(Clone)]
pub struct LlmContext {
    pub models: Arc<ModelRegistry>,
    pub cache: Arc<ResponseCache>,
    pub predictions: Arc<PredictionStore>,
    pub metrics: GatewayMetrics,
    pub http: reqwest::Client,
    /// Root cancellation: stops spawned prediction pollers on shutdown.
    pub cancel: tokio_util::sync::CancellationToken,
}

impl LlmContext {
    pub fn new(
        models: Arc<ModelRegistry>,
        cache: Arc<ResponseCache>,
        predictions: Arc<PredictionStore>,
        metrics: GatewayMetrics,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Self {
        LlmContext {
            models,
            cache,
            predictions,
            metrics,
            http: reqwest::Client::new(),
            cancel,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::telemetry::TelemetryRegistry;
    use std::collections::HashMap as StdHashMap;

    pub(crate) fn model_config(id: &str, provider: ProviderKind) -> ModelConfig {
        ModelConfig {
            id: id.to_string(),
            enabled: true,
            provider,
            endpoint: "http://127.0.0.1:8000".to_string(),
            api_token: None,
            provider_model: Some("owner/name:version".to_string()),
            command: None,
            args: vec![],
            env: StdHashMap::new(),
            install_path: None,
            capabilities: vec![Capability::Text],
            temperature: None,
            max_tokens: None,
            cache: None,
            rate_limit: None,
            retry: RetryConfig::default(),
            request_timeout_secs: 5,
            prediction_deadline_secs: 30,
            restart: Default::default(),
            stderr_markers: vec![],
        }
    }

    #[test]
    fn test_registry_insert_get_remove() {
        let registry = ModelRegistry::new();
        registry
            .insert(model_config("llama", ProviderKind::LocalEngine))
            .unwrap();
        assert!(registry.get("llama").is_ok());
        assert!(matches!(
            registry.insert(model_config("llama", ProviderKind::LocalEngine)),
            Err(GatewayError::DuplicateId(_))
        ));
        registry.remove("llama").unwrap();
        assert!(matches!(
            registry.get("llama"),
            Err(GatewayError::NotFound(_))
        ));
    }

    #[test]
    fn test_capability_check() {
        let mut config = model_config("sdxl", ProviderKind::Replicate);
        config.capabilities = vec![Capability::TextToImage];
        let record = ModelRecord::new(config);
        assert!(record.has_capability(Capability::TextToImage));
        assert!(!record.has_capability(Capability::Text));
    }

    #[test]
    fn test_observe_updates_stats_and_gauges() {
        let registry = TelemetryRegistry::new();
        let metrics = GatewayMetrics::new(&registry);
        let record = ModelRecord::new(model_config("llama", ProviderKind::LocalEngine));

        record.observe(Duration::from_millis(100), true, &metrics);
        record.observe(Duration::from_millis(300), false, &metrics);

        let status = record.status();
        assert_eq!(status.requests, 2);
        assert_eq!(status.successes, 1);
        assert_eq!(status.failures, 1);
        assert!((status.latency_min_seconds - 0.1).abs() < 0.01);
        assert!((status.latency_max_seconds - 0.3).abs() < 0.01);
        assert!((status.latency_avg_seconds - 0.2).abs() < 0.01);

        assert!(
            (metrics
                .llm_latency_seconds
                .value(&["llama", "local_engine", "max"])
                - 0.3)
                .abs()
                < 0.01
        );
        assert_eq!(
            metrics
                .llm_request_duration_seconds
                .count(&["llama", "local_engine"]),
            2
        );
    }

    #[test]
    fn test_has_engine() {
        let mut config = model_config("vllm", ProviderKind::LocalEngine);
        config.command = Some("vllm-serve".to_string());
        assert!(ModelRecord::new(config).has_engine());

        let config = model_config("remote", ProviderKind::LocalEngine);
        assert!(!ModelRecord::new(config).has_engine());
    }
}
