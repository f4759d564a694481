//! Provider Traits
//!
//! Trait definitions for model providers. This abstraction allows the pipeline
//! to work with different backends (Ollama, OpenAI-compatible APIs, ...)
//! without changing core logic.
//!
//! # Design Philosophy
//!
//! The `Provider` trait provides a common interface for:
//! - Opening a chat stream for a model and an ordered message history
//! - Producing a whole reply when streaming is not wanted
//! - Listing the models the backend offers
//!
//! Every stream is consumed through the same pull contract ([`ChatStream`]),
//! whatever the wire format underneath. Implementations handle
//! provider-specific details (API formats, auth, framing).

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

/// Provider id of the local Ollama backend
pub const PROVIDER_ID_OLLAMA: &str = "ollama";

/// Provider id of the OpenAI-compatible backend
pub const PROVIDER_ID_OPENAI: &str = "open_ai";

/// Raw body chunks of a streaming HTTP response
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ProviderError>> + Send>>;

/// Boxed chat stream as returned by providers
pub type BoxChatStream = Box<dyn ChatStream>;

/// Author role of a prompt message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Instructions for the model
    System,
    /// The human side
    User,
    /// The model side
    Assistant,
}

impl Role {
    /// Wire name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One message of a prompt
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Author role
    pub role: Role,
    /// Text content
    pub content: String,
}

impl ChatMessage {
    /// System message
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    /// User message
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// Assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Parameters for opening a chat stream
#[derive(Clone, Debug, Default)]
pub struct ChatStreamParams {
    /// Conversation the call belongs to (trace thread)
    pub thread_id: String,
    /// Owner of the conversation
    pub thread_owner_id: String,
    /// Interaction the reply is generated for
    pub message_id: String,
    /// Backend model id
    pub model_id: String,
    /// Ordered prompt
    pub messages: Vec<ChatMessage>,
}

impl ChatStreamParams {
    /// Create parameters for a model and prompt
    pub fn new(model_id: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model_id: model_id.into(),
            messages,
            ..Default::default()
        }
    }

    /// Set the trace identifiers
    #[must_use]
    pub fn with_trace_ids(
        mut self,
        thread_id: impl Into<String>,
        thread_owner_id: impl Into<String>,
        message_id: impl Into<String>,
    ) -> Self {
        self.thread_id = thread_id.into();
        self.thread_owner_id = thread_owner_id.into();
        self.message_id = message_id.into();
        self
    }
}

/// One step of a chat stream
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatStreamEvent {
    /// Text fragment produced by this step
    pub content: String,
    /// Whether the backend flagged this as the last step
    pub done: bool,
}

/// A whole (non-streamed) reply
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatCompletion {
    /// Reply text
    pub content: String,
    /// Model that produced it
    pub model_id: String,
}

/// A model offered by a provider
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    /// Owning provider
    pub provider_id: String,
    /// Backend model id
    pub model_id: String,
    /// Human-readable name
    pub model_name: String,
}

/// Identity of a provider
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderMetadata {
    /// Registry key
    pub id: String,
    /// Display name
    pub name: String,
}

/// Pull-based stream of chat events
///
/// `next` advances one event and returns `false` forever once the stream
/// ended or failed. `current` is only meaningful after `next` returned `true`.
/// `content` is the text assembled so far and only ever grows. `err` holds
/// the terminal error once iteration stopped.
#[async_trait]
pub trait ChatStream: Send {
    /// Advance to the next event
    async fn next(&mut self) -> bool;

    /// The event produced by the last successful `next`
    fn current(&self) -> Option<&ChatStreamEvent>;

    /// Text assembled so far
    fn content(&self) -> &str;

    /// Terminal error, if iteration stopped because of one
    fn err(&self) -> Option<&ProviderError>;
}

/// Model provider trait
///
/// Implement this trait to add support for a backend.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Identity of this provider
    fn metadata(&self) -> ProviderMetadata;

    /// List the models this provider offers
    async fn list_models(&self) -> Result<Vec<Model>, ProviderError>;

    /// Open a chat stream
    ///
    /// Fails without returning a stream when the request cannot be dispatched
    /// (backend unreachable, rejected with a non-success status).
    async fn new_chat_stream(
        &self,
        params: &ChatStreamParams,
    ) -> Result<BoxChatStream, ProviderError>;

    /// Produce a whole reply without streaming
    ///
    /// The default drains [`Provider::new_chat_stream`].
    async fn complete(&self, params: &ChatStreamParams) -> Result<ChatCompletion, ProviderError> {
        let mut stream = self.new_chat_stream(params).await?;
        while stream.next().await {}
        if let Some(err) = stream.err() {
            return Err(err.clone());
        }
        Ok(ChatCompletion {
            content: stream.content().to_string(),
            model_id: params.model_id.clone(),
        })
    }
}
