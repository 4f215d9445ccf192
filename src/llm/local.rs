//! Local inference engine provider: OpenAI-compatible HTTP endpoints reached
//! with verbatim body passthrough (tools, tool_choice, and tool-result
//! messages included).

use serde_json::Value;
use std::time::Duration;

use crate::config::ModelConfig;
use crate::config::resolve_env_ref;
use crate::retry::{classify_status, classify_transport};

/// Outcome of a chat dispatch: a complete JSON body, or the provider's SSE
/// response relayed byte-for-byte.
#[derive(Debug)]
pub enum ChatOutcome {
    Completed(Value),
    Stream(reqwest::Response),
}

/// Thin client over one local engine endpoint.
pub struct LocalEngineClient<'a> {
    http: &'a reqwest::Client,
    endpoint: String,
    api_token: Option<String>,
    timeout: Duration,
}

impl<'a> LocalEngineClient<'a> {
    pub fn new(http: &'a reqwest::Client, config: &ModelConfig) -> Self {
        LocalEngineClient {
            http,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_token: config.api_token.as_deref().map(resolve_env_ref),
            timeout: Duration::from_secs(config.request_timeout_secs),
        }
    }

    /// Forward the request body verbatim to the engine's chat-completions
    /// endpoint. With `stream=true` the provider's event stream is returned
    /// for byte-for-byte relay.
    pub async fn chat(&self, body: &Value, stream: bool) -> crate::Result<ChatOutcome> {
        let url = format!("{}/v1/chat/completions", self.endpoint);
        let mut request = self.http.post(&url).json(body).timeout(self.timeout);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| classify_transport(&self.endpoint, &e))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), message));
        }
        if stream {
            return Ok(ChatOutcome::Stream(response));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| classify_transport(&self.endpoint, &e))?;
        Ok(ChatOutcome::Completed(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderKind;
    use crate::error::GatewayError;
    use crate::llm::tests::model_config;

    #[tokio::test]
    async fn test_connection_refused_classified_as_io() {
        let http = reqwest::Client::new();
        let mut config = model_config("local", ProviderKind::LocalEngine);
        // Nothing listens on the discard port.
        config.endpoint = "http://127.0.0.1:9".to_string();
        let client = LocalEngineClient::new(&http, &config);

        let err = client
            .chat(&serde_json::json!({"messages": []}), false)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Io(_, _)));
        assert!(err.is_retriable());
    }

    #[test]
    fn test_endpoint_trailing_slash_trimmed() {
        let http = reqwest::Client::new();
        let mut config = model_config("local", ProviderKind::LocalEngine);
        config.endpoint = "http://127.0.0.1:8000/".to_string();
        let client = LocalEngineClient::new(&http, &config);
        assert_eq!(client.endpoint, "http://127.0.0.1:8000");
    }
}
