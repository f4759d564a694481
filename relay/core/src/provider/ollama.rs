//! Ollama Provider
//!
//! Provider for Ollama (local LLM server).
//!
//! # Ollama API
//!
//! - `/api/chat` - Chat completions with message history (NDJSON when streaming)
//! - `/api/tags` - List available models
//!
//! Streaming requests open the body lazily; the first line is only read when
//! the caller pulls the first event.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::http::{byte_stream, send_error, status_error};
use super::stream::NdjsonChatStream;
use super::traits::{
    BoxChatStream, ChatCompletion, ChatMessage, ChatStreamParams, Model, Provider,
    ProviderMetadata, PROVIDER_ID_OLLAMA,
};
use crate::config::OllamaConfig;
use crate::error::ProviderError;

/// Default Ollama host
pub const DEFAULT_HOST: &str = "localhost";

/// Default Ollama port
pub const DEFAULT_PORT: u16 = 11434;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const LIST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    message: Option<ResponseMessage>,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Deserialize)]
struct TagEntry {
    name: String,
}

/// Ollama provider
#[derive(Clone)]
pub struct OllamaProvider {
    /// Host address
    host: String,
    /// Port number
    port: u16,
    /// HTTP client
    http_client: reqwest::Client,
}

impl OllamaProvider {
    /// Create a new Ollama provider
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        // No total timeout: a stream lives as long as the model keeps talking.
        let http_client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self::with_client(host, port, http_client)
    }

    /// Create with a preconfigured HTTP client
    pub fn with_client(host: impl Into<String>, port: u16, http_client: reqwest::Client) -> Self {
        Self {
            host: host.into(),
            port,
            http_client,
        }
    }

    /// Create from the `[ollama]` config section
    #[must_use]
    pub fn from_config(config: &OllamaConfig) -> Self {
        Self::new(
            config.host.clone().unwrap_or_else(|| DEFAULT_HOST.to_string()),
            config.port.unwrap_or(DEFAULT_PORT),
        )
    }

    /// Create from environment variables
    #[must_use]
    pub fn from_env() -> Self {
        let host = std::env::var("OLLAMA_HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string());
        let port: u16 = std::env::var("OLLAMA_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        Self::new(host, port)
    }

    /// Get the base URL
    fn base_url(&self) -> String {
        if self.host.starts_with("http://") || self.host.starts_with("https://") {
            format!("{}:{}", self.host.trim_end_matches('/'), self.port)
        } else {
            format!("http://{}:{}", self.host, self.port)
        }
    }

    /// Get chat endpoint URL
    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url())
    }

    /// Get tags endpoint URL
    fn tags_url(&self) -> String {
        format!("{}/api/tags", self.base_url())
    }

    async fn post_chat(
        &self,
        params: &ChatStreamParams,
        stream: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let body = ChatRequest {
            model: &params.model_id,
            messages: &params.messages,
            stream,
        };

        let response = self
            .http_client
            .post(self.chat_url())
            .json(&body)
            .send()
            .await
            .map_err(|e| send_error(PROVIDER_ID_OLLAMA, &e))?;

        if !response.status().is_success() {
            return Err(status_error(PROVIDER_ID_OLLAMA, response).await);
        }
        Ok(response)
    }
}

impl Default for OllamaProvider {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT)
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    fn metadata(&self) -> ProviderMetadata {
        ProviderMetadata {
            id: PROVIDER_ID_OLLAMA.to_string(),
            name: "Ollama".to_string(),
        }
    }

    async fn list_models(&self) -> Result<Vec<Model>, ProviderError> {
        let response = self
            .http_client
            .get(self.tags_url())
            .timeout(LIST_TIMEOUT)
            .send()
            .await
            .map_err(|e| send_error(PROVIDER_ID_OLLAMA, &e))?;

        if !response.status().is_success() {
            return Err(status_error(PROVIDER_ID_OLLAMA, response).await);
        }

        let tags: TagsResponse = response.json().await.map_err(|e| ProviderError::Decode {
            provider: PROVIDER_ID_OLLAMA.to_string(),
            message: e.to_string(),
        })?;

        Ok(tags
            .models
            .into_iter()
            .map(|entry| Model {
                provider_id: PROVIDER_ID_OLLAMA.to_string(),
                model_id: entry.name.clone(),
                model_name: entry.name,
            })
            .collect())
    }

    async fn new_chat_stream(
        &self,
        params: &ChatStreamParams,
    ) -> Result<BoxChatStream, ProviderError> {
        let response = self.post_chat(params, true).await?;
        Ok(Box::new(NdjsonChatStream::new(
            PROVIDER_ID_OLLAMA,
            byte_stream(PROVIDER_ID_OLLAMA, response),
        )))
    }

    async fn complete(&self, params: &ChatStreamParams) -> Result<ChatCompletion, ProviderError> {
        let response = self.post_chat(params, false).await?;
        let data: ChatResponse = response.json().await.map_err(|e| ProviderError::Decode {
            provider: PROVIDER_ID_OLLAMA.to_string(),
            message: e.to_string(),
        })?;

        Ok(ChatCompletion {
            content: data.message.map(|m| m.content).unwrap_or_default(),
            model_id: params.model_id.clone(),
        })
    }
}
