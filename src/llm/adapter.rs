//! Provider-agnostic LLM pipeline: fingerprint/cache lookup, rate limiting,
//! capability validation, provider dispatch, OpenAI envelope shaping, cache
//! insertion, and telemetry.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde_json::{Value, json};
use tracing::Instrument as _;
use uuid::Uuid;

use super::local::{ChatOutcome, LocalEngineClient};
use super::poller;
use super::replicate::{self, PredictionStatus, ReplicateClient};
use super::{LlmContext, ModelRecord};
use crate::cache::fingerprint;
use crate::config::{Capability, ProviderKind};
use crate::error::GatewayError;
use crate::retry::with_backoff;

/// Prediction-creating request kinds under the generation routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationKind {
    Image,
    Video,
    Animate,
}

impl GenerationKind {
    pub fn required_capability(&self) -> Capability {
        match self {
            GenerationKind::Image => Capability::TextToImage,
            GenerationKind::Video => Capability::TextToVideo,
            GenerationKind::Animate => Capability::ImageToVideo,
        }
    }
}

/// Uniform chat-completions entry point for all provider kinds.
pub async fn chat(ctx: &LlmContext, model_id: &str, mut body: Value) -> crate::Result<ChatOutcome> {
    let record = ctx.models.get(model_id)?;
    let provider = record.config.provider.label();
    ctx.metrics
        .llm_requests_total
        .inc(&[model_id, provider], 1.0);
    let span = tracing::info_span!("llm_chat", model = %model_id, provider);

    apply_default_params(&mut body, &record);
    let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);

    // Cache lookup before any provider work. Streaming responses and
    // webhook-bearing requests are never cached.
    let cache_key = cacheable_key(ctx, &record, &body, stream);
    if let Some(key) = &cache_key {
        if let Some(hit) = ctx.cache.get(key) {
            ctx.metrics
                .replicate_cache_hits_total
                .inc(&[model_id], 1.0);
            tracing::debug!(model = %model_id, "cache hit");
            return Ok(ChatOutcome::Completed(hit));
        }
        ctx.metrics
            .replicate_cache_misses_total
            .inc(&[model_id], 1.0);
    }

    let started = Instant::now();
    let result = chat_inner(ctx, &record, &body, stream).instrument(span).await;
    let latency = started.elapsed();

    match &result {
        Ok(ChatOutcome::Completed(response)) => {
            record.observe(latency, true, &ctx.metrics);
            ctx.metrics
                .llm_requests_success_total
                .inc(&[model_id, provider], 1.0);
            record_token_usage(ctx, model_id, provider, response);
            if let Some(key) = cache_key {
                ctx.cache.put(key, response.clone());
            }
        }
        Ok(ChatOutcome::Stream(_)) => {
            record.observe(latency, true, &ctx.metrics);
            ctx.metrics
                .llm_requests_success_total
                .inc(&[model_id, provider], 1.0);
        }
        Err(e) => {
            record.observe(latency, false, &ctx.metrics);
            ctx.metrics
                .llm_requests_failed_total
                .inc(&[model_id, provider], 1.0);
            ctx.metrics
                .llm_errors_by_status
                .inc(&[model_id, provider, status_class(e)], 1.0);
        }
    }
    result
}

async fn chat_inner(
    ctx: &LlmContext,
    record: &ModelRecord,
    body: &Value,
    stream: bool,
) -> crate::Result<ChatOutcome> {
    let model_id = &record.config.id;

    if let Some(limiter) = &record.limiter {
        limiter.acquire(model_id).await?;
    }
    if !record.has_capability(Capability::Text) {
        return Err(GatewayError::CapabilityMismatch(
            model_id.clone(),
            "text".to_string(),
        ));
    }

    match record.config.provider {
        ProviderKind::LocalEngine => {
            let client = LocalEngineClient::new(&ctx.http, &record.config);
            with_backoff(model_id, &record.config.retry, |_| {
                client.chat(body, stream)
            })
            .await
        }
        ProviderKind::Replicate => {
            if stream {
                return Err(GatewayError::NotImplemented(format!(
                    "streaming is not supported for prediction provider of model '{}'",
                    model_id
                )));
            }
            let client = ReplicateClient::new(&ctx.http, &record.config)?;
            let input = replicate::chat_to_input(body, &record.config);
            let created = with_backoff(model_id, &record.config.retry, |_| {
                client.create_prediction(input.clone())
            })
            .await?;
            ctx.predictions
                .insert(&created.id, model_id, created.status.as_str());

            let deadline = Duration::from_secs(record.config.prediction_deadline_secs);
            let state = poller::poll_until_terminal(
                &client,
                &ctx.predictions,
                &ctx.metrics,
                model_id,
                &created.id,
                deadline,
                ctx.cancel.child_token(),
            )
            .await?;

            match state.status {
                PredictionStatus::Succeeded => {
                    let content = state
                        .output
                        .as_ref()
                        .map(replicate::output_to_content)
                        .unwrap_or_default();
                    Ok(ChatOutcome::Completed(openai_envelope(model_id, &content)))
                }
                status => Err(GatewayError::Server {
                    status: 502,
                    message: format!(
                        "prediction {} ended {}: {}",
                        created.id,
                        status.as_str(),
                        state.error.unwrap_or_default()
                    ),
                }),
            }
        }
    }
}

/// Create a generation prediction (image, video, or image→video) and start a
/// background poller. Returns `{id, status}` immediately.
pub async fn create_generation(
    ctx: &LlmContext,
    model_id: &str,
    kind: GenerationKind,
    body: Value,
) -> crate::Result<Value> {
    let record = ctx.models.get(model_id)?;
    let provider = record.config.provider.label();
    ctx.metrics
        .llm_requests_total
        .inc(&[model_id, provider], 1.0);
    tracing::debug!(model = %model_id, ?kind, "generation request");

    if record.config.provider != ProviderKind::Replicate {
        return Err(GatewayError::NotImplemented(format!(
            "generation requires a prediction provider; model '{}' is {}",
            model_id, provider
        )));
    }
    let capability = kind.required_capability();
    if !record.has_capability(capability) {
        ctx.metrics
            .llm_requests_failed_total
            .inc(&[model_id, provider], 1.0);
        return Err(GatewayError::CapabilityMismatch(
            model_id.to_string(),
            capability.as_str().to_string(),
        ));
    }
    if let Some(limiter) = &record.limiter {
        limiter.acquire(model_id).await?;
    }

    let client = ReplicateClient::new(&ctx.http, &record.config)?;
    // Callers may pass provider input directly or nested under "input".
    let input = body.get("input").cloned().unwrap_or(body);
    let created = with_backoff(model_id, &record.config.retry, |_| {
        client.create_prediction(input.clone())
    })
    .await?;
    ctx.predictions
        .insert(&created.id, model_id, created.status.as_str());
    ctx.metrics
        .llm_requests_success_total
        .inc(&[model_id, provider], 1.0);

    // The poller outlives this request; the client re-reads status through
    // the prediction store.
    let deadline = Duration::from_secs(record.config.prediction_deadline_secs);
    let poll_ctx = ctx.clone();
    let poll_model = model_id.to_string();
    let poll_id = created.id.clone();
    let poll_config = record.config.clone();
    tokio::spawn(async move {
        let Ok(client) = ReplicateClient::new(&poll_ctx.http, &poll_config) else {
            return;
        };
        let _ = poller::poll_until_terminal(
            &client,
            &poll_ctx.predictions,
            &poll_ctx.metrics,
            &poll_model,
            &poll_id,
            deadline,
            poll_ctx.cancel.child_token(),
        )
        .await;
    });

    Ok(json!({ "id": created.id, "status": created.status.as_str() }))
}

/// Fill sampling defaults from the model record when the caller omits them.
fn apply_default_params(body: &mut Value, record: &ModelRecord) {
    let Some(map) = body.as_object_mut() else {
        return;
    };
    if !map.contains_key("temperature") {
        if let Some(t) = record.config.temperature {
            map.insert("temperature".to_string(), json!(t));
        }
    }
    if !map.contains_key("max_tokens") {
        if let Some(m) = record.config.max_tokens {
            map.insert("max_tokens".to_string(), json!(m));
        }
    }
}

/// Fingerprint when the request is cacheable: caching enabled on the model,
/// non-streaming, and no webhook.
fn cacheable_key(
    ctx: &LlmContext,
    record: &ModelRecord,
    body: &Value,
    stream: bool,
) -> Option<String> {
    let cache = record.config.cache.as_ref()?;
    if !cache.enabled || stream || body.get("webhook").is_some() {
        return None;
    }
    ctx.cache
        .ensure_configured(Duration::from_secs(cache.ttl_secs), cache.capacity);
    Some(fingerprint(&record.config.id, body))
}

/// Wrap provider output in the OpenAI chat-completion envelope. Token counts
/// are unknown for prediction providers, so usage reads zero.
fn openai_envelope(model_id: &str, content: &str) -> Value {
    json!({
        "id": format!("chatcmpl-{}", Uuid::new_v4().simple()),
        "object": "chat.completion",
        "created": unix_now(),
        "model": model_id,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": content },
            "finish_reason": "stop"
        }],
        "usage": { "prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0 }
    })
}

/// Feed provider-reported usage into the token counters when present.
fn record_token_usage(ctx: &LlmContext, model_id: &str, provider: &str, response: &Value) {
    let Some(usage) = response.get("usage") else {
        return;
    };
    if let Some(prompt) = usage.get("prompt_tokens").and_then(Value::as_u64) {
        ctx.metrics
            .llm_tokens_total
            .inc(&[model_id, provider, "prompt"], prompt as f64);
    }
    if let Some(completion) = usage.get("completion_tokens").and_then(Value::as_u64) {
        ctx.metrics
            .llm_tokens_total
            .inc(&[model_id, provider, "completion"], completion as f64);
    }
}

/// HTTP status class label for the error counter.
fn status_class(err: &GatewayError) -> &'static str {
    match err {
        GatewayError::Client { .. }
        | GatewayError::Auth(_)
        | GatewayError::RateLimited(_)
        | GatewayError::CapabilityMismatch(_, _)
        | GatewayError::NotImplemented(_)
        | GatewayError::NotFound(_) => "4xx",
        GatewayError::Server { .. } | GatewayError::Io(_, _) => "5xx",
        GatewayError::Timeout(_) => "timeout",
        _ => "other",
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ResponseCache;
    use crate::config::{CacheConfig, RateLimitConfig};
    use crate::llm::poller::PredictionStore;
    use crate::llm::tests::model_config;
    use crate::llm::ModelRegistry;
    use crate::telemetry::{GatewayMetrics, TelemetryRegistry};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn test_ctx() -> LlmContext {
        LlmContext::new(
            Arc::new(ModelRegistry::new()),
            Arc::new(ResponseCache::new()),
            Arc::new(PredictionStore::new()),
            GatewayMetrics::new(&TelemetryRegistry::new()),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_unknown_model_not_found() {
        let ctx = test_ctx();
        let err = chat(&ctx, "ghost", json!({"messages": []}))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_capability_mismatch_for_chat() {
        let ctx = test_ctx();
        let mut config = model_config("imgonly", ProviderKind::Replicate);
        config.api_token = Some("${FMCP_ADAPTER_TEST_TOKEN}".to_string());
        config.capabilities = vec![Capability::TextToImage];
        ctx.models.insert(config).unwrap();
        // SAFETY: test-only env var.
        unsafe { std::env::set_var("FMCP_ADAPTER_TEST_TOKEN", "tok") };

        let err = chat(&ctx, "imgonly", json!({"messages": []}))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::CapabilityMismatch(_, _)));
        assert_eq!(
            ctx.metrics
                .llm_errors_by_status
                .value(&["imgonly", "replicate", "4xx"]),
            1.0
        );
        // SAFETY: test-only cleanup.
        unsafe { std::env::remove_var("FMCP_ADAPTER_TEST_TOKEN") };
    }

    #[tokio::test]
    async fn test_replicate_stream_not_implemented() {
        let ctx = test_ctx();
        let mut config = model_config("pred", ProviderKind::Replicate);
        config.api_token = Some("${FMCP_ADAPTER_STREAM_TOKEN}".to_string());
        ctx.models.insert(config).unwrap();
        // SAFETY: test-only env var.
        unsafe { std::env::set_var("FMCP_ADAPTER_STREAM_TOKEN", "tok") };

        let err = chat(
            &ctx,
            "pred",
            json!({"messages": [], "stream": true}),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, GatewayError::NotImplemented(_)));
        // SAFETY: test-only cleanup.
        unsafe { std::env::remove_var("FMCP_ADAPTER_STREAM_TOKEN") };
    }

    #[tokio::test]
    async fn test_cache_hit_short_circuits_provider() {
        let ctx = test_ctx();
        let mut config = model_config("cached", ProviderKind::LocalEngine);
        // Endpoint is unreachable: a cache hit must never touch it.
        config.endpoint = "http://127.0.0.1:9".to_string();
        config.cache = Some(CacheConfig {
            enabled: true,
            ttl_secs: 60,
            capacity: 10,
        });
        ctx.models.insert(config).unwrap();

        let body = json!({"messages": [{"role": "user", "content": "hi"}]});
        let key = fingerprint("cached", &body);
        ctx.cache
            .ensure_configured(Duration::from_secs(60), 10);
        let canned = json!({"object": "chat.completion", "choices": []});
        ctx.cache.put(key, canned.clone());

        let outcome = chat(&ctx, "cached", body).await.unwrap();
        match outcome {
            ChatOutcome::Completed(v) => assert_eq!(v, canned),
            ChatOutcome::Stream(_) => panic!("expected cached body"),
        }
        assert_eq!(
            ctx.metrics.replicate_cache_hits_total.value(&["cached"]),
            1.0
        );
    }

    #[tokio::test]
    async fn test_cache_miss_counts_and_failure_classified() {
        let ctx = test_ctx();
        let mut config = model_config("misser", ProviderKind::LocalEngine);
        config.endpoint = "http://127.0.0.1:9".to_string();
        config.retry.max_retries = 0;
        config.retry.base_delay_ms = 1;
        config.cache = Some(CacheConfig {
            enabled: true,
            ttl_secs: 60,
            capacity: 10,
        });
        ctx.models.insert(config).unwrap();

        let err = chat(&ctx, "misser", json!({"messages": []}))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Io(_, _)));
        assert_eq!(
            ctx.metrics.replicate_cache_misses_total.value(&["misser"]),
            1.0
        );
        assert_eq!(
            ctx.metrics
                .llm_requests_failed_total
                .value(&["misser", "local_engine"]),
            1.0
        );
        assert_eq!(
            ctx.metrics
                .llm_errors_by_status
                .value(&["misser", "local_engine", "5xx"]),
            1.0
        );
    }

    #[tokio::test]
    async fn test_limiter_fail_fast() {
        let ctx = test_ctx();
        let mut config = model_config("limited", ProviderKind::LocalEngine);
        config.endpoint = "http://127.0.0.1:9".to_string();
        config.retry.max_retries = 0;
        config.retry.base_delay_ms = 1;
        config.rate_limit = Some(RateLimitConfig {
            rate: 0.01,
            capacity: 1.0,
            wait: false,
            wait_timeout_secs: 1,
        });
        ctx.models.insert(config).unwrap();

        // First call consumes the only token (and fails at the transport).
        let _ = chat(&ctx, "limited", json!({"messages": []})).await;
        // Second call is refused by the limiter.
        let err = chat(&ctx, "limited", json!({"messages": []}))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::RateLimited(_)));

        let record = ctx.models.get("limited").unwrap();
        assert!(record.limiter.as_ref().unwrap().available_tokens() < 1.0);
    }

    #[tokio::test]
    async fn test_generation_requires_prediction_provider() {
        let ctx = test_ctx();
        ctx.models
            .insert(model_config("local", ProviderKind::LocalEngine))
            .unwrap();
        let err = create_generation(
            &ctx,
            "local",
            GenerationKind::Image,
            json!({"prompt": "a cat"}),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, GatewayError::NotImplemented(_)));
    }

    #[tokio::test]
    async fn test_generation_capability_mismatch() {
        let ctx = test_ctx();
        let mut config = model_config("textpred", ProviderKind::Replicate);
        config.api_token = Some("${FMCP_ADAPTER_GEN_TOKEN}".to_string());
        config.capabilities = vec![Capability::Text];
        ctx.models.insert(config).unwrap();
        // SAFETY: test-only env var.
        unsafe { std::env::set_var("FMCP_ADAPTER_GEN_TOKEN", "tok") };

        let err = create_generation(
            &ctx,
            "textpred",
            GenerationKind::Video,
            json!({"prompt": "waves"}),
        )
        .await
        .unwrap_err();
        assert!(
            matches!(err, GatewayError::CapabilityMismatch(_, cap) if cap == "text-to-video")
        );
        // SAFETY: test-only cleanup.
        unsafe { std::env::remove_var("FMCP_ADAPTER_GEN_TOKEN") };
    }

    #[test]
    fn test_generation_kind_capabilities() {
        assert_eq!(
            GenerationKind::Image.required_capability(),
            Capability::TextToImage
        );
        assert_eq!(
            GenerationKind::Video.required_capability(),
            Capability::TextToVideo
        );
        assert_eq!(
            GenerationKind::Animate.required_capability(),
            Capability::ImageToVideo
        );
    }

    #[test]
    fn test_openai_envelope_shape() {
        let envelope = openai_envelope("sdxl", "hello");
        assert_eq!(envelope["object"], "chat.completion");
        assert_eq!(envelope["model"], "sdxl");
        assert_eq!(envelope["choices"][0]["message"]["content"], "hello");
        assert_eq!(envelope["choices"][0]["finish_reason"], "stop");
        assert_eq!(envelope["usage"]["total_tokens"], 0);
        assert!(
            envelope["id"]
                .as_str()
                .unwrap()
                .starts_with("chatcmpl-")
        );
    }

    #[test]
    fn test_apply_default_params_respects_caller() {
        let mut config = model_config("m", ProviderKind::LocalEngine);
        config.temperature = Some(0.5);
        config.max_tokens = Some(128);
        let record = ModelRecord::new(config);

        let mut body = json!({"messages": [], "temperature": 0.9});
        apply_default_params(&mut body, &record);
        assert_eq!(body["temperature"], json!(0.9));
        assert_eq!(body["max_tokens"], json!(128));
    }

    #[test]
    fn test_status_class_mapping() {
        assert_eq!(status_class(&GatewayError::Auth("x".into())), "4xx");
        assert_eq!(
            status_class(&GatewayError::Server {
                status: 503,
                message: "x".into()
            }),
            "5xx"
        );
        assert_eq!(status_class(&GatewayError::Timeout("x".into())), "timeout");
        assert_eq!(
            status_class(&GatewayError::Io("x".into(), "y".into())),
            "5xx"
        );
    }
}
