//! Model Providers
//!
//! Abstraction over LLM backends and their chat streams.
//!
//! Currently supported:
//! - Ollama (NDJSON streaming)
//! - OpenAI-compatible APIs (SSE streaming)
//! - Scripted replies (tests, offline runs)

mod http;
pub mod ollama;
pub mod openai;
pub mod scripted;
pub mod stream;
pub mod traits;

pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;
pub use scripted::{ScriptedProvider, ScriptedReply};
pub use stream::{NdjsonChatStream, SseChatStream};
pub use traits::{
    BoxChatStream, ByteStream, ChatCompletion, ChatMessage, ChatStream, ChatStreamEvent,
    ChatStreamParams, Model, Provider, ProviderMetadata, Role, PROVIDER_ID_OLLAMA,
    PROVIDER_ID_OPENAI,
};
