//! Tracing Decorator
//!
//! [`TracingProvider`] wraps any provider behind the same capability set and
//! records one trace per model call. For streams, the trace is finished when
//! the stream ends (completed or failed) or, if the caller stops pulling
//! early, when it is dropped (abandoned). Either way it is finished exactly
//! once.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::error::ProviderError;
use crate::provider::{
    BoxChatStream, ChatCompletion, ChatStream, ChatStreamEvent, ChatStreamParams, Model, Provider,
    ProviderMetadata,
};

/// What a trace is tagged with
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TraceAttributes {
    /// Provider id
    pub provider_id: String,
    /// Model id
    pub model_id: String,
    /// Conversation id
    pub thread_id: String,
    /// Conversation owner
    pub thread_owner_id: String,
    /// Response interaction id
    pub message_id: String,
    /// Number of prompt messages
    pub input_messages: usize,
}

impl TraceAttributes {
    fn from_params(provider_id: &str, params: &ChatStreamParams) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            model_id: params.model_id.clone(),
            thread_id: params.thread_id.clone(),
            thread_owner_id: params.thread_owner_id.clone(),
            message_id: params.message_id.clone(),
            input_messages: params.messages.len(),
        }
    }
}

/// How a traced call ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TraceOutcome {
    /// The model produced a whole reply
    Completed {
        /// Reply text
        output: String,
    },
    /// The call or stream failed
    Failed {
        /// The error
        error: ProviderError,
    },
    /// The stream was dropped before it ended
    Abandoned {
        /// Text produced until then
        partial_output: String,
    },
}

/// One open trace
pub trait Trace: Send {
    /// Close the trace
    fn finish(self: Box<Self>, outcome: TraceOutcome);
}

/// Observability backend
pub trait Tracer: Send + Sync {
    /// Open a trace for a model call
    fn start(&self, attributes: &TraceAttributes) -> Box<dyn Trace>;
}

/// Tracer that reports model calls through `tracing`
#[derive(Clone, Copy, Debug, Default)]
pub struct LogTracer;

struct LogTrace {
    span: tracing::Span,
    started: Instant,
}

impl Tracer for LogTracer {
    fn start(&self, attributes: &TraceAttributes) -> Box<dyn Trace> {
        let span = tracing::info_span!(
            "llm_call",
            provider_id = %attributes.provider_id,
            model_id = %attributes.model_id,
            thread_id = %attributes.thread_id,
            thread_owner_id = %attributes.thread_owner_id,
            message_id = %attributes.message_id,
        );
        span.in_scope(|| {
            tracing::debug!(input_messages = attributes.input_messages, "LLM call started");
        });
        Box::new(LogTrace {
            span,
            started: Instant::now(),
        })
    }
}

impl Trace for LogTrace {
    fn finish(self: Box<Self>, outcome: TraceOutcome) {
        let duration_ms = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let _entered = self.span.enter();
        match outcome {
            TraceOutcome::Completed { output } => {
                tracing::info!(duration_ms, output_chars = output.len(), "LLM call completed");
            }
            TraceOutcome::Failed { error } => {
                tracing::warn!(duration_ms, error = %error, "LLM call failed");
            }
            TraceOutcome::Abandoned { partial_output } => {
                tracing::info!(
                    duration_ms,
                    output_chars = partial_output.len(),
                    "LLM call abandoned"
                );
            }
        }
    }
}

/// Tracer that records nothing
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopTracer;

struct NoopTrace;

impl Tracer for NoopTracer {
    fn start(&self, _attributes: &TraceAttributes) -> Box<dyn Trace> {
        Box::new(NoopTrace)
    }
}

impl Trace for NoopTrace {
    fn finish(self: Box<Self>, _outcome: TraceOutcome) {}
}

/// Provider decorator that traces every model call
pub struct TracingProvider {
    inner: Arc<dyn Provider>,
    tracer: Arc<dyn Tracer>,
}

impl TracingProvider {
    /// Wrap a provider
    pub fn new(inner: Arc<dyn Provider>, tracer: Arc<dyn Tracer>) -> Self {
        Self { inner, tracer }
    }

    fn start(&self, params: &ChatStreamParams) -> Box<dyn Trace> {
        let attributes = TraceAttributes::from_params(&self.inner.metadata().id, params);
        self.tracer.start(&attributes)
    }
}

#[async_trait]
impl Provider for TracingProvider {
    fn metadata(&self) -> ProviderMetadata {
        self.inner.metadata()
    }

    async fn list_models(&self) -> Result<Vec<Model>, ProviderError> {
        self.inner.list_models().await
    }

    async fn new_chat_stream(
        &self,
        params: &ChatStreamParams,
    ) -> Result<BoxChatStream, ProviderError> {
        let trace = self.start(params);
        match self.inner.new_chat_stream(params).await {
            Ok(inner) => Ok(Box::new(TracedChatStream {
                inner,
                trace: Some(trace),
            })),
            Err(error) => {
                trace.finish(TraceOutcome::Failed {
                    error: error.clone(),
                });
                Err(error)
            }
        }
    }

    async fn complete(&self, params: &ChatStreamParams) -> Result<ChatCompletion, ProviderError> {
        let trace = self.start(params);
        let result = self.inner.complete(params).await;
        trace.finish(match &result {
            Ok(completion) => TraceOutcome::Completed {
                output: completion.content.clone(),
            },
            Err(error) => TraceOutcome::Failed {
                error: error.clone(),
            },
        });
        result
    }
}

/// Stream wrapper closing its trace when iteration stops
struct TracedChatStream {
    inner: BoxChatStream,
    trace: Option<Box<dyn Trace>>,
}

#[async_trait]
impl ChatStream for TracedChatStream {
    async fn next(&mut self) -> bool {
        if self.inner.next().await {
            return true;
        }
        if let Some(trace) = self.trace.take() {
            let outcome = match self.inner.err() {
                Some(error) => TraceOutcome::Failed {
                    error: error.clone(),
                },
                None => TraceOutcome::Completed {
                    output: self.inner.content().to_string(),
                },
            };
            trace.finish(outcome);
        }
        false
    }

    fn current(&self) -> Option<&ChatStreamEvent> {
        self.inner.current()
    }

    fn content(&self) -> &str {
        self.inner.content()
    }

    fn err(&self) -> Option<&ProviderError> {
        self.inner.err()
    }
}

impl Drop for TracedChatStream {
    fn drop(&mut self) {
        if let Some(trace) = self.trace.take() {
            trace.finish(TraceOutcome::Abandoned {
                partial_output: self.inner.content().to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ChatMessage, ScriptedProvider, ScriptedReply};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    /// Tracer keeping every finished trace
    #[derive(Clone, Default)]
    struct RecordingTracer {
        finished: Arc<Mutex<Vec<(TraceAttributes, TraceOutcome)>>>,
    }

    struct RecordingTrace {
        attributes: TraceAttributes,
        finished: Arc<Mutex<Vec<(TraceAttributes, TraceOutcome)>>>,
    }

    impl Tracer for RecordingTracer {
        fn start(&self, attributes: &TraceAttributes) -> Box<dyn Trace> {
            Box::new(RecordingTrace {
                attributes: attributes.clone(),
                finished: Arc::clone(&self.finished),
            })
        }
    }

    impl Trace for RecordingTrace {
        fn finish(self: Box<Self>, outcome: TraceOutcome) {
            self.finished.lock().push((self.attributes, outcome));
        }
    }

    fn traced(reply: ScriptedReply) -> (TracingProvider, RecordingTracer) {
        let tracer = RecordingTracer::default();
        let provider = TracingProvider::new(
            Arc::new(ScriptedProvider::new("demo", reply)),
            Arc::new(tracer.clone()),
        );
        (provider, tracer)
    }

    fn params() -> ChatStreamParams {
        ChatStreamParams::new("m1", vec![ChatMessage::user("hi")]).with_trace_ids("c1", "u1", "i2")
    }

    #[tokio::test]
    async fn test_trace_finished_once_on_completion() {
        let (provider, tracer) = traced(ScriptedReply::fragments(&["he", "llo"]));

        let mut stream = provider.new_chat_stream(&params()).await.unwrap();
        while stream.next().await {}
        assert!(!stream.next().await);
        drop(stream);

        let finished = tracer.finished.lock();
        assert_eq!(finished.len(), 1);
        let (attributes, outcome) = &finished[0];
        assert_eq!(attributes.provider_id, "demo");
        assert_eq!(attributes.thread_id, "c1");
        assert_eq!(attributes.message_id, "i2");
        assert_eq!(
            outcome,
            &TraceOutcome::Completed {
                output: "hello".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_trace_failed_on_stream_error() {
        let err = ProviderError::Api {
            provider: "demo".to_string(),
            message: "boom".to_string(),
        };
        let (provider, tracer) = traced(ScriptedReply::FailAfter(vec!["x".into()], err.clone()));

        let mut stream = provider.new_chat_stream(&params()).await.unwrap();
        while stream.next().await {}
        drop(stream);

        let finished = tracer.finished.lock();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].1, TraceOutcome::Failed { error: err });
    }

    #[tokio::test]
    async fn test_trace_failed_on_dispatch_error() {
        let err = ProviderError::Status {
            provider: "demo".to_string(),
            status: 404,
            message: "no such model".to_string(),
        };
        let (provider, tracer) = traced(ScriptedReply::Reject(err.clone()));

        assert!(provider.new_chat_stream(&params()).await.is_err());
        assert_eq!(tracer.finished.lock()[0].1, TraceOutcome::Failed { error: err });
    }

    #[tokio::test]
    async fn test_trace_abandoned_on_drop() {
        let (provider, tracer) = traced(ScriptedReply::fragments(&["a", "b", "c"]));

        let mut stream = provider.new_chat_stream(&params()).await.unwrap();
        assert!(stream.next().await);
        drop(stream);

        assert_eq!(
            tracer.finished.lock()[0].1,
            TraceOutcome::Abandoned {
                partial_output: "a".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_complete_is_traced() {
        let (provider, tracer) = traced(ScriptedReply::fragments(&["whole"]));

        let completion = provider.complete(&params()).await.unwrap();
        assert_eq!(completion.content, "whole");
        assert_eq!(tracer.finished.lock().len(), 1);
    }
}
