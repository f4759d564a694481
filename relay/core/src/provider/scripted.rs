//! Scripted Provider
//!
//! A provider that replays canned replies instead of calling a backend.
//! Useful for tests and for running the relay without a model server.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::traits::{
    BoxChatStream, ChatStream, ChatStreamEvent, ChatStreamParams, Model, Provider,
    ProviderMetadata,
};
use crate::error::ProviderError;

/// One canned reply
#[derive(Clone, Debug)]
pub enum ScriptedReply {
    /// Yield these fragments, then end cleanly
    Fragments(Vec<String>),
    /// Yield these fragments, then fail
    FailAfter(Vec<String>, ProviderError),
    /// Fail to open the stream
    Reject(ProviderError),
    /// Never produce an event
    Stall,
}

impl ScriptedReply {
    /// Clean reply from string slices
    #[must_use]
    pub fn fragments(fragments: &[&str]) -> Self {
        Self::Fragments(fragments.iter().map(ToString::to_string).collect())
    }
}

/// Provider replaying [`ScriptedReply`] values
///
/// Replies queued with [`ScriptedProvider::push_reply`] are used in order;
/// once the queue is empty every call gets the default reply.
pub struct ScriptedProvider {
    metadata: ProviderMetadata,
    models: Vec<Model>,
    list_error: Option<ProviderError>,
    default_reply: ScriptedReply,
    queued: Mutex<VecDeque<ScriptedReply>>,
    calls: Arc<Mutex<Vec<ChatStreamParams>>>,
}

impl ScriptedProvider {
    /// Provider answering every call with `default_reply`
    pub fn new(id: impl Into<String>, default_reply: ScriptedReply) -> Self {
        let id = id.into();
        Self {
            metadata: ProviderMetadata {
                name: id.clone(),
                id,
            },
            models: Vec::new(),
            list_error: None,
            default_reply,
            queued: Mutex::new(VecDeque::new()),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Set the display name
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.metadata.name = name.into();
        self
    }

    /// Offer a model
    #[must_use]
    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        let model_id = model_id.into();
        self.models.push(Model {
            provider_id: self.metadata.id.clone(),
            model_name: model_id.clone(),
            model_id,
        });
        self
    }

    /// Make `list_models` fail
    #[must_use]
    pub fn with_list_error(mut self, error: ProviderError) -> Self {
        self.list_error = Some(error);
        self
    }

    /// Queue a reply for the next call
    pub fn push_reply(&self, reply: ScriptedReply) {
        self.queued.lock().push_back(reply);
    }

    /// Parameters of every call so far
    #[must_use]
    pub fn calls(&self) -> Vec<ChatStreamParams> {
        self.calls.lock().clone()
    }

    fn next_reply(&self) -> ScriptedReply {
        self.queued
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.default_reply.clone())
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn metadata(&self) -> ProviderMetadata {
        self.metadata.clone()
    }

    async fn list_models(&self) -> Result<Vec<Model>, ProviderError> {
        match &self.list_error {
            Some(err) => Err(err.clone()),
            None => Ok(self.models.clone()),
        }
    }

    async fn new_chat_stream(
        &self,
        params: &ChatStreamParams,
    ) -> Result<BoxChatStream, ProviderError> {
        self.calls.lock().push(params.clone());
        let stream = match self.next_reply() {
            ScriptedReply::Fragments(fragments) => ScriptedChatStream::new(fragments, None, false),
            ScriptedReply::FailAfter(fragments, err) => {
                ScriptedChatStream::new(fragments, Some(err), false)
            }
            ScriptedReply::Reject(err) => return Err(err),
            ScriptedReply::Stall => ScriptedChatStream::new(Vec::new(), None, true),
        };
        Ok(Box::new(stream))
    }
}

/// Chat stream over canned fragments
pub struct ScriptedChatStream {
    pending: VecDeque<String>,
    final_error: Option<ProviderError>,
    stall: bool,
    current: Option<ChatStreamEvent>,
    content: String,
    error: Option<ProviderError>,
    finished: bool,
}

impl ScriptedChatStream {
    fn new(fragments: Vec<String>, final_error: Option<ProviderError>, stall: bool) -> Self {
        Self {
            pending: fragments.into(),
            final_error,
            stall,
            current: None,
            content: String::new(),
            error: None,
            finished: false,
        }
    }
}

#[async_trait]
impl ChatStream for ScriptedChatStream {
    async fn next(&mut self) -> bool {
        if self.stall {
            futures::future::pending::<()>().await;
        }
        if self.finished {
            return false;
        }
        if let Some(fragment) = self.pending.pop_front() {
            self.content.push_str(&fragment);
            self.current = Some(ChatStreamEvent {
                content: fragment,
                done: self.pending.is_empty() && self.final_error.is_none(),
            });
            return true;
        }
        self.finished = true;
        self.current = None;
        self.error = self.final_error.take();
        false
    }

    fn current(&self) -> Option<&ChatStreamEvent> {
        self.current.as_ref()
    }

    fn content(&self) -> &str {
        &self.content
    }

    fn err(&self) -> Option<&ProviderError> {
        self.error.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::traits::ChatMessage;

    #[tokio::test]
    async fn test_queued_replies_then_default() {
        let provider = ScriptedProvider::new("demo", ScriptedReply::fragments(&["ok"]));
        provider.push_reply(ScriptedReply::fragments(&["he", "llo"]));
        let params = ChatStreamParams::new("m1", vec![ChatMessage::user("hi")]);

        let first = provider.complete(&params).await.unwrap();
        let second = provider.complete(&params).await.unwrap();

        assert_eq!(first.content, "hello");
        assert_eq!(second.content, "ok");
        assert_eq!(provider.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_fail_after_keeps_partial_content() {
        let err = ProviderError::Api {
            provider: "demo".to_string(),
            message: "overloaded".to_string(),
        };
        let provider = ScriptedProvider::new(
            "demo",
            ScriptedReply::FailAfter(vec!["par".to_string()], err.clone()),
        );

        let mut stream = provider
            .new_chat_stream(&ChatStreamParams::default())
            .await
            .unwrap();
        assert!(stream.next().await);
        assert!(!stream.next().await);
        assert!(!stream.next().await);
        assert_eq!(stream.content(), "par");
        assert_eq!(stream.err(), Some(&err));
    }
}
