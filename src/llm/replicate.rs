//! Replicate-style asynchronous prediction provider: create a prediction,
//! then poll it to a terminal state.

use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;

use crate::config::ModelConfig;
use crate::config::resolve_env_ref;
use crate::error::GatewayError;
use crate::retry::{classify_status, classify_transport};

/// Prediction lifecycle states reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictionStatus {
    Starting,
    Processing,
    Succeeded,
    Failed,
    Canceled,
}

impl PredictionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PredictionStatus::Succeeded | PredictionStatus::Failed | PredictionStatus::Canceled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PredictionStatus::Starting => "starting",
            PredictionStatus::Processing => "processing",
            PredictionStatus::Succeeded => "succeeded",
            PredictionStatus::Failed => "failed",
            PredictionStatus::Canceled => "canceled",
        }
    }
}

/// Provider view of one prediction.
#[derive(Debug, Clone, Deserialize)]
pub struct PredictionState {
    pub id: String,
    pub status: PredictionStatus,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Client for one Replicate-style model.
pub struct ReplicateClient {
    http: reqwest::Client,
    endpoint: String,
    token: String,
    version: String,
    timeout: Duration,
}

impl ReplicateClient {
    pub fn new(http: &reqwest::Client, config: &ModelConfig) -> crate::Result<Self> {
        let token = config
            .api_token
            .as_deref()
            .map(resolve_env_ref)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                GatewayError::Auth(format!(
                    "model '{}' has no resolvable api token",
                    config.id
                ))
            })?;
        let version = config.provider_model.clone().ok_or_else(|| {
            GatewayError::InvalidConfig(config.id.clone(), "missing provider_model".into())
        })?;
        Ok(ReplicateClient {
            http: http.clone(),
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            token,
            version,
            timeout: Duration::from_secs(config.request_timeout_secs),
        })
    }

    /// Create a prediction from an input payload; returns the provider state
    /// (normally `starting`).
    pub async fn create_prediction(&self, input: Value) -> crate::Result<PredictionState> {
        let url = format!("{}/v1/predictions", self.endpoint);
        let body = json!({ "version": self.version, "input": input });
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| classify_transport(&self.endpoint, &e))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), message));
        }
        response
            .json()
            .await
            .map_err(|e| classify_transport(&self.endpoint, &e))
    }

    /// Fetch the current state of a prediction.
    pub async fn get_prediction(&self, id: &str) -> crate::Result<PredictionState> {
        let url = format!("{}/v1/predictions/{}", self.endpoint, id);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| classify_transport(&self.endpoint, &e))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), message));
        }
        response
            .json()
            .await
            .map_err(|e| classify_transport(&self.endpoint, &e))
    }
}

/// Map an OpenAI-shaped chat body onto a prediction input: messages collapse
/// into a single prompt, sampling parameters carry over.
pub fn chat_to_input(body: &Value, config: &ModelConfig) -> Value {
    let mut prompt = String::new();
    if let Some(messages) = body.get("messages").and_then(Value::as_array) {
        for message in messages {
            let role = message.get("role").and_then(Value::as_str).unwrap_or("user");
            let content = message
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if !prompt.is_empty() {
                prompt.push_str("\n\n");
            }
            prompt.push_str(role);
            prompt.push_str(": ");
            prompt.push_str(content);
        }
    }
    let mut input = json!({ "prompt": prompt });
    if let Some(t) = body
        .get("temperature")
        .and_then(Value::as_f64)
        .or(config.temperature.map(f64::from))
    {
        input["temperature"] = json!(t);
    }
    if let Some(m) = body
        .get("max_tokens")
        .and_then(Value::as_u64)
        .or(config.max_tokens.map(u64::from))
    {
        input["max_tokens"] = json!(m);
    }
    input
}

/// Collapse a prediction output payload into chat message content.
pub fn output_to_content(output: &Value) -> String {
    match output {
        Value::Array(parts) => parts
            .iter()
            .map(|p| p.as_str().map(str::to_string).unwrap_or_else(|| p.to_string()))
            .collect::<Vec<_>>()
            .join(""),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderKind;
    use crate::llm::tests::model_config;

    #[test]
    fn test_status_terminality() {
        assert!(!PredictionStatus::Starting.is_terminal());
        assert!(!PredictionStatus::Processing.is_terminal());
        assert!(PredictionStatus::Succeeded.is_terminal());
        assert!(PredictionStatus::Failed.is_terminal());
        assert!(PredictionStatus::Canceled.is_terminal());
    }

    #[test]
    fn test_state_deserialization() {
        let state: PredictionState = serde_json::from_str(
            r#"{"id": "p-1", "status": "processing", "output": null}"#,
        )
        .unwrap();
        assert_eq!(state.status, PredictionStatus::Processing);
        assert!(state.output.is_none());

        let done: PredictionState = serde_json::from_str(
            r#"{"id": "p-1", "status": "succeeded", "output": ["https://img/1.png"]}"#,
        )
        .unwrap();
        assert!(done.status.is_terminal());
        assert_eq!(done.output.unwrap()[0], "https://img/1.png");
    }

    #[test]
    fn test_chat_to_input_prompt_mapping() {
        let config = model_config("r", ProviderKind::Replicate);
        let body = json!({
            "messages": [
                {"role": "system", "content": "be terse"},
                {"role": "user", "content": "hello"}
            ],
            "temperature": 0.2,
            "max_tokens": 64
        });
        let input = chat_to_input(&body, &config);
        assert_eq!(input["prompt"], "system: be terse\n\nuser: hello");
        assert_eq!(input["temperature"], json!(0.2));
        assert_eq!(input["max_tokens"], json!(64));
    }

    #[test]
    fn test_chat_to_input_uses_config_defaults() {
        let mut config = model_config("r", ProviderKind::Replicate);
        config.temperature = Some(0.7);
        let body = json!({"messages": [{"role": "user", "content": "hi"}]});
        let input = chat_to_input(&body, &config);
        // f32→f64 widening: compare within epsilon rather than exactly.
        assert!((input["temperature"].as_f64().unwrap() - 0.7).abs() < 1e-6);
        assert!(input.get("max_tokens").is_none());
    }

    #[test]
    fn test_output_to_content_shapes() {
        assert_eq!(output_to_content(&json!(["a", "b", "c"])), "abc");
        assert_eq!(output_to_content(&json!("plain")), "plain");
        assert_eq!(output_to_content(&json!({"k": 1})), r#"{"k":1}"#);
    }

    #[test]
    fn test_client_requires_token() {
        let http = reqwest::Client::new();
        let mut config = model_config("r", ProviderKind::Replicate);
        config.api_token = None;
        assert!(matches!(
            ReplicateClient::new(&http, &config),
            Err(GatewayError::Auth(_))
        ));
    }
}
