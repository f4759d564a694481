//! Relay Core - Streaming Reply Relay with Fan-out
//!
//! This crate turns a user message into an assistant reply produced by a
//! pluggable model provider, streamed to every connected client while it is
//! generated and persisted once it is done.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                    Clients (WebSocket, tests)                    │
//! │        commands (up)                 StreamMessage (down)        │
//! └──────────────┬─────────────────────────────────▲─────────────────┘
//!                │                                 │
//! ┌──────────────┼─────────────────────────────────┼─────────────────┐
//! │              ▼           RELAY CORE            │                 │
//! │  ┌──────────────────────┐              ┌───────┴──────────┐      │
//! │  │ InteractionPipeline  │─── publish ─▶│   Broadcaster    │      │
//! │  └──┬──────────┬────────┘              └──────────────────┘      │
//! │     │ fork     │ persist                                         │
//! │  ┌──▼───────┐ ┌▼─────────┐  ┌─────────────────────────────────┐  │
//! │  │TaskRunner│ │  Stores  │  │ RelayClient                     │  │
//! │  └──────────┘ └──────────┘  │  └ TracingProvider              │  │
//! │                             │     └ Ollama / OpenAI / ...     │  │
//! │                             └─────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`InteractionPipeline`]: Accepts messages and forks reply generation
//! - [`RelayClient`]: Provider registry; unknown ids resolve to a stub
//! - [`ChatStream`]: Pull iterator over a provider's reply
//! - [`Broadcaster`]: Delivers every [`StreamMessage`] to every connection
//! - [`TaskRunner`]: Runs detached, supervised background jobs
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use relay_core::{
//!     Broadcaster, InteractionPipeline, MemoryStore, OllamaProvider, RelayClient,
//!     RelayConfig, RequestContext, Stores, TaskRunner,
//! };
//!
//! let config = RelayConfig::default();
//! let relay = RelayClient::default().with_provider(Arc::new(OllamaProvider::from_env()));
//! let store = MemoryStore::new();
//! let pipeline = InteractionPipeline::new(
//!     relay,
//!     Broadcaster::new(config.broadcast),
//!     TaskRunner::new(),
//!     Stores::memory(&store),
//!     config.generation,
//! );
//!
//! // Register connections with pipeline.broadcaster(), then:
//! let response = pipeline
//!     .create_conversation_message(&RequestContext::default(), request)
//!     .await?;
//! println!("reply streams on {}", response.stream_channel_id);
//! ```
//!
//! # Module Overview
//!
//! - [`provider`]: Provider capability set and chat stream realizations
//! - [`relay`]: Provider registry and tracing decorator
//! - [`pipeline`]: Conversation message orchestration
//! - [`broadcast`]: Fan-out to registered connections
//! - [`messages`]: Stream payloads and channel ids
//! - [`tasks`]: Detached task runner
//! - [`store`]: Persistence contracts and the in-memory store
//! - [`models`]: Conversation and interaction records
//! - [`error`]: Error types and structured error codes
//! - [`config`]: TOML, environment and CLI configuration

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod broadcast;
pub mod config;
pub mod error;
pub mod messages;
pub mod models;
pub mod pipeline;
pub mod provider;
pub mod relay;
pub mod store;
pub mod tasks;

pub use broadcast::{
    BroadcastResult, Broadcaster, BroadcasterConfig, Connection, ConnectionError, ConnectionId,
};
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, GenerationConfig, RelayConfig,
};
pub use error::{codes, ProviderError, RelayError, StoreError, StructuredError};
pub use messages::{ChannelId, StreamMessage, StreamMessageType};
pub use models::{Actor, ActorType, AiRelayOptions, Conversation, Interaction, InteractionState};
pub use pipeline::{
    ConversationWithInteractions, CreateConversationMessageRequest,
    CreateConversationMessageResponse, CreateConversationRequest, InteractionPipeline,
    InteractionWithChannel, MessageOptions, Stores, SupportedModel,
};
pub use provider::{
    ChatMessage, ChatStream, ChatStreamEvent, ChatStreamParams, OllamaProvider, OpenAiProvider,
    Provider, ProviderMetadata,
};
pub use relay::{LogTracer, NoopTracer, RelayClient, TracingProvider};
pub use store::MemoryStore;
pub use tasks::{JobError, JobStatus, RequestContext, ServiceInfo, TaskRunner};
