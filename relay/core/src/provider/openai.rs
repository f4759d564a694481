//! OpenAI-compatible Provider
//!
//! Streams `/chat/completions` as Server-Sent Events with bearer auth. The
//! model list is static (taken from configuration) rather than fetched.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{self, HeaderMap, HeaderValue};
use serde::Serialize;

use super::http::{byte_stream, send_error, status_error};
use super::stream::SseChatStream;
use super::traits::{
    BoxChatStream, ChatMessage, ChatStreamParams, Model, Provider, ProviderMetadata,
    PROVIDER_ID_OPENAI,
};
use crate::config::{ConfiguredModel, OpenAiConfig};
use crate::error::ProviderError;

/// Default API base URL
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

/// OpenAI-compatible provider
#[derive(Clone)]
pub struct OpenAiProvider {
    base_url: String,
    headers: HeaderMap,
    models: Vec<ConfiguredModel>,
    http_client: reqwest::Client,
}

impl OpenAiProvider {
    /// Create a provider for an API key and base URL
    ///
    /// Fails when the key cannot be used as a header value.
    pub fn new(
        api_key: &str,
        base_url: impl Into<String>,
        models: Vec<ConfiguredModel>,
    ) -> Result<Self, ProviderError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        headers.insert(header::ACCEPT, HeaderValue::from_static("text/event-stream"));
        let auth = HeaderValue::from_str(&format!("Bearer {api_key}")).map_err(|e| {
            ProviderError::Api {
                provider: PROVIDER_ID_OPENAI.to_string(),
                message: format!("invalid api key: {e}"),
            }
        })?;
        headers.insert(header::AUTHORIZATION, auth);

        let http_client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_default();

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            headers,
            models,
            http_client,
        })
    }

    /// Create from the `[openai]` config section
    ///
    /// Returns `Ok(None)` when no API key is configured.
    pub fn from_config(config: &OpenAiConfig) -> Result<Option<Self>, ProviderError> {
        let Some(api_key) = config.api_key.as_deref().filter(|k| !k.is_empty()) else {
            return Ok(None);
        };
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self::new(api_key, base_url, config.models.clone()).map(Some)
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn metadata(&self) -> ProviderMetadata {
        ProviderMetadata {
            id: PROVIDER_ID_OPENAI.to_string(),
            name: "Open AI".to_string(),
        }
    }

    async fn list_models(&self) -> Result<Vec<Model>, ProviderError> {
        Ok(self
            .models
            .iter()
            .map(|m| Model {
                provider_id: PROVIDER_ID_OPENAI.to_string(),
                model_id: m.id.clone(),
                model_name: m.name.clone().unwrap_or_else(|| m.id.clone()),
            })
            .collect())
    }

    async fn new_chat_stream(
        &self,
        params: &ChatStreamParams,
    ) -> Result<BoxChatStream, ProviderError> {
        let body = ChatRequest {
            model: &params.model_id,
            messages: &params.messages,
            stream: true,
        };

        let response = self
            .http_client
            .post(self.completions_url())
            .headers(self.headers.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| send_error(PROVIDER_ID_OPENAI, &e))?;

        if !response.status().is_success() {
            return Err(status_error(PROVIDER_ID_OPENAI, response).await);
        }

        Ok(Box::new(SseChatStream::new(
            PROVIDER_ID_OPENAI,
            byte_stream(PROVIDER_ID_OPENAI, response),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn models() -> Vec<ConfiguredModel> {
        vec![
            ConfiguredModel {
                id: "gpt-4o".to_string(),
                name: Some("GPT-4o".to_string()),
            },
            ConfiguredModel {
                id: "gpt-4o-mini".to_string(),
                name: None,
            },
        ]
    }

    #[tokio::test]
    async fn test_static_model_list() {
        let provider = OpenAiProvider::new("sk-test", DEFAULT_BASE_URL, models()).unwrap();
        let listed = provider.list_models().await.unwrap();

        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].model_name, "GPT-4o");
        assert_eq!(listed[1].model_name, "gpt-4o-mini");
        assert!(listed.iter().all(|m| m.provider_id == "open_ai"));
    }

    #[test]
    fn test_from_config_without_key() {
        let config = OpenAiConfig::default();
        assert!(OpenAiProvider::from_config(&config).unwrap().is_none());
    }

    #[test]
    fn test_completions_url() {
        let provider = OpenAiProvider::new("sk-test", "http://proxy:8080/v1/", Vec::new()).unwrap();
        assert_eq!(
            provider.completions_url(),
            "http://proxy:8080/v1/chat/completions"
        );
        assert_eq!(provider.metadata().name, "Open AI");
    }
}
