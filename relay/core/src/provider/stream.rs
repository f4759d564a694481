//! Chat Stream Realizations
//!
//! Two framings sit behind the [`ChatStream`] pull contract:
//!
//! - [`NdjsonChatStream`]: one JSON object per line (Ollama `/api/chat`).
//!   A line with `"done": true` ends the stream; an `"error"` field fails it.
//! - [`SseChatStream`]: Server-Sent Events (OpenAI-compatible
//!   `/chat/completions`). `data:` lines accumulate until a blank line, the
//!   `[DONE]` sentinel ends the stream.
//!
//! Both are built from a raw [`ByteStream`] so they can be driven from canned
//! bytes in tests. Chunk boundaries never need to line up with lines.

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;

use super::traits::{ByteStream, ChatStream, ChatStreamEvent};
use crate::error::ProviderError;

// ============================================================================
// Line framing
// ============================================================================

/// Splits a byte stream into lines
#[derive(Debug, Default)]
struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete line without its terminator (`\n` or `\r\n`)
    fn next_line(&mut self) -> Option<String> {
        let pos = self.buf.iter().position(|b| *b == b'\n')?;
        let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// Whatever is left after the source ended
    fn take_rest(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        Some(String::from_utf8_lossy(&rest).trim_end().to_string())
    }
}

/// What a decoded frame means for iteration
enum Step {
    /// A new event is current
    Yield,
    /// Nothing to report, keep reading
    Skip,
    /// Stream ended (cleanly or with `error` set)
    End,
}

/// State shared by both realizations
struct StreamState {
    provider: String,
    source: ByteStream,
    lines: LineBuffer,
    current: Option<ChatStreamEvent>,
    content: String,
    error: Option<ProviderError>,
    source_done: bool,
    finished: bool,
    /// The last event carried the done flag; the next call ends the stream
    end_pending: bool,
}

impl StreamState {
    fn new(provider: &str, source: ByteStream) -> Self {
        Self {
            provider: provider.to_string(),
            source,
            lines: LineBuffer::default(),
            current: None,
            content: String::new(),
            error: None,
            source_done: false,
            finished: false,
            end_pending: false,
        }
    }

    fn emit(&mut self, fragment: String, done: bool) -> Step {
        self.content.push_str(&fragment);
        self.current = Some(ChatStreamEvent {
            content: fragment,
            done,
        });
        if done {
            self.end_pending = true;
        }
        Step::Yield
    }

    fn fail(&mut self, error: ProviderError) -> Step {
        self.error = Some(error);
        Step::End
    }

    fn decode_error(&self, err: &serde_json::Error) -> ProviderError {
        ProviderError::Decode {
            provider: self.provider.clone(),
            message: err.to_string(),
        }
    }

    fn api_error(&self, message: String) -> ProviderError {
        ProviderError::Api {
            provider: self.provider.clone(),
            message,
        }
    }

    /// Pull the next raw line, reading from the source as needed.
    ///
    /// Returns `None` once the source is exhausted (or failed, with `error`
    /// set).
    async fn read_line(&mut self) -> Option<String> {
        loop {
            if let Some(line) = self.lines.next_line() {
                return Some(line);
            }
            if self.source_done {
                return self.lines.take_rest();
            }
            match self.source.next().await {
                Some(Ok(bytes)) => self.lines.push(&bytes),
                Some(Err(e)) => {
                    self.error = Some(e);
                    return None;
                }
                None => self.source_done = true,
            }
        }
    }

    fn finish(&mut self) -> bool {
        self.finished = true;
        self.current = None;
        false
    }
}

// ============================================================================
// NDJSON
// ============================================================================

#[derive(Deserialize)]
struct NdjsonChunk {
    #[serde(default)]
    message: Option<NdjsonMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct NdjsonMessage {
    #[serde(default)]
    content: String,
}

/// Newline-delimited JSON chat stream (Ollama)
pub struct NdjsonChatStream {
    state: StreamState,
}

impl NdjsonChatStream {
    /// Wrap a response body
    #[must_use]
    pub fn new(provider: &str, source: ByteStream) -> Self {
        Self {
            state: StreamState::new(provider, source),
        }
    }

    fn handle_line(&mut self, line: &str) -> Step {
        let line = line.trim();
        if line.is_empty() {
            return Step::Skip;
        }
        let chunk: NdjsonChunk = match serde_json::from_str(line) {
            Ok(chunk) => chunk,
            Err(e) => {
                let err = self.state.decode_error(&e);
                return self.state.fail(err);
            }
        };
        if let Some(message) = chunk.error {
            let err = self.state.api_error(message);
            return self.state.fail(err);
        }

        let fragment = chunk.message.map(|m| m.content).unwrap_or_default();
        if chunk.done {
            if fragment.is_empty() {
                return Step::End;
            }
            return self.state.emit(fragment, true);
        }
        if fragment.is_empty() {
            return Step::Skip;
        }
        self.state.emit(fragment, false)
    }
}

#[async_trait]
impl ChatStream for NdjsonChatStream {
    async fn next(&mut self) -> bool {
        if self.state.finished || self.state.end_pending {
            return self.state.finish();
        }
        while let Some(line) = self.state.read_line().await {
            match self.handle_line(&line) {
                Step::Yield => return true,
                Step::Skip => {}
                Step::End => break,
            }
        }
        self.state.finish()
    }

    fn current(&self) -> Option<&ChatStreamEvent> {
        self.state.current.as_ref()
    }

    fn content(&self) -> &str {
        &self.state.content
    }

    fn err(&self) -> Option<&ProviderError> {
        self.state.error.as_ref()
    }
}

// ============================================================================
// SSE
// ============================================================================

const SSE_DONE: &str = "[DONE]";

#[derive(Deserialize)]
struct SseChunk {
    #[serde(default)]
    choices: Vec<SseChoice>,
    #[serde(default)]
    error: Option<SseError>,
}

#[derive(Deserialize)]
struct SseChoice {
    #[serde(default)]
    delta: SseDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Default, Deserialize)]
struct SseDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct SseError {
    message: String,
}

/// Server-Sent Events chat stream (OpenAI-compatible)
pub struct SseChatStream {
    state: StreamState,
    /// `data:` lines of the event being assembled
    data: Vec<String>,
}

impl SseChatStream {
    /// Wrap a response body
    #[must_use]
    pub fn new(provider: &str, source: ByteStream) -> Self {
        Self {
            state: StreamState::new(provider, source),
            data: Vec::new(),
        }
    }

    fn handle_line(&mut self, line: &str) -> Step {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return Step::Skip;
        }
        if let Some(value) = line.strip_prefix("data:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            self.data.push(value.to_string());
        }
        // event:, id:, retry: carry nothing we use
        Step::Skip
    }

    /// Decode the event assembled so far
    fn dispatch(&mut self) -> Step {
        if self.data.is_empty() {
            return Step::Skip;
        }
        let payload = self.data.join("\n");
        self.data.clear();

        if payload.trim() == SSE_DONE {
            return Step::End;
        }
        let chunk: SseChunk = match serde_json::from_str(&payload) {
            Ok(chunk) => chunk,
            Err(e) => {
                let err = self.state.decode_error(&e);
                return self.state.fail(err);
            }
        };
        if let Some(error) = chunk.error {
            let err = self.state.api_error(error.message);
            return self.state.fail(err);
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return Step::Skip;
        };
        match choice.delta.content {
            Some(fragment) if !fragment.is_empty() => {
                self.state.emit(fragment, choice.finish_reason.is_some())
            }
            _ => Step::Skip,
        }
    }
}

#[async_trait]
impl ChatStream for SseChatStream {
    async fn next(&mut self) -> bool {
        if self.state.finished || self.state.end_pending {
            return self.state.finish();
        }
        while let Some(line) = self.state.read_line().await {
            match self.handle_line(&line) {
                Step::Yield => return true,
                Step::Skip => {}
                Step::End => return self.state.finish(),
            }
        }
        // Source ended without a trailing blank line
        if self.state.error.is_none() && matches!(self.dispatch(), Step::Yield) {
            self.state.end_pending = true;
            return true;
        }
        self.state.finish()
    }

    fn current(&self) -> Option<&ChatStreamEvent> {
        self.state.current.as_ref()
    }

    fn content(&self) -> &str {
        &self.state.content
    }

    fn err(&self) -> Option<&ProviderError> {
        self.state.error.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use pretty_assertions::assert_eq;

    fn source(chunks: &[&str]) -> ByteStream {
        let items: Vec<Result<Bytes, ProviderError>> = chunks
            .iter()
            .map(|c| Ok(Bytes::copy_from_slice(c.as_bytes())))
            .collect();
        Box::pin(futures::stream::iter(items))
    }

    async fn drain(stream: &mut dyn ChatStream) -> Vec<ChatStreamEvent> {
        let mut events = Vec::new();
        while stream.next().await {
            events.push(stream.current().cloned().unwrap());
        }
        events
    }

    #[tokio::test]
    async fn test_ndjson_split_across_chunks() {
        let mut stream = NdjsonChatStream::new(
            "ollama",
            source(&[
                r#"{"message":{"role":"assistant","content":"Hel"},"done":false}"#,
                "\n{\"message\":{\"content\":\"lo\"},",
                "\"done\":false}\n",
                r#"{"message":{"content":""},"done":true}"#,
                "\n",
            ]),
        );

        let events = drain(&mut stream).await;
        let fragments: Vec<&str> = events.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(fragments, vec!["Hel", "lo"]);
        assert_eq!(stream.content(), "Hello");
        assert!(stream.err().is_none());
        assert!(!stream.next().await);
    }

    #[tokio::test]
    async fn test_ndjson_done_with_content_is_yielded() {
        let mut stream = NdjsonChatStream::new(
            "ollama",
            source(&["{\"message\":{\"content\":\"A\"},\"done\":false}\n{\"message\":{\"content\":\"B\"},\"done\":true}\n"]),
        );

        let events = drain(&mut stream).await;
        assert_eq!(events.len(), 2);
        assert!(events[1].done);
        assert_eq!(stream.content(), "AB");
    }

    #[tokio::test]
    async fn test_ndjson_error_line() {
        let mut stream = NdjsonChatStream::new(
            "ollama",
            source(&["{\"message\":{\"content\":\"A\"},\"done\":false}\n{\"error\":\"model crashed\"}\n"]),
        );

        let events = drain(&mut stream).await;
        assert_eq!(events.len(), 1);
        assert_eq!(stream.content(), "A");
        assert_eq!(
            stream.err(),
            Some(&ProviderError::Api {
                provider: "ollama".to_string(),
                message: "model crashed".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_ndjson_transport_error_ends_stream() {
        let items: Vec<Result<Bytes, ProviderError>> = vec![
            Ok(Bytes::from_static(b"{\"message\":{\"content\":\"A\"},\"done\":false}\n")),
            Err(ProviderError::Transport {
                provider: "ollama".to_string(),
                message: "reset".to_string(),
            }),
        ];
        let mut stream = NdjsonChatStream::new("ollama", Box::pin(futures::stream::iter(items)));

        assert!(stream.next().await);
        assert!(!stream.next().await);
        assert!(matches!(stream.err(), Some(ProviderError::Transport { .. })));
        assert!(!stream.next().await);
    }

    #[tokio::test]
    async fn test_sse_stream() {
        let mut stream = SseChatStream::new(
            "open_ai",
            source(&[
                ": keep-alive\n\n",
                "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n",
                "\ndata: {\"choices\":[{\"delta\":{\"content\":\" there\"}}]}\r\n\r\n",
                "data: [DONE]\n\n",
            ]),
        );

        let events = drain(&mut stream).await;
        let fragments: Vec<&str> = events.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(fragments, vec!["Hi", " there"]);
        assert_eq!(stream.content(), "Hi there");
        assert!(stream.err().is_none());
    }

    #[tokio::test]
    async fn test_sse_multi_line_data_is_joined() {
        let mut stream = SseChatStream::new(
            "open_ai",
            source(&[
                "data: {\"choices\":[{\"delta\":\n",
                "data: {\"content\":\"joined\"}}]}\n\n",
                "data: [DONE]\n\n",
            ]),
        );

        let events = drain(&mut stream).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].content, "joined");
        assert_eq!(stream.content(), "joined");
        assert!(stream.err().is_none());
    }

    #[tokio::test]
    async fn test_sse_error_event() {
        let mut stream = SseChatStream::new(
            "open_ai",
            source(&["data: {\"error\":{\"message\":\"rate limited\"}}\n\n"]),
        );

        assert!(!stream.next().await);
        assert_eq!(stream.content(), "");
        assert_eq!(
            stream.err().map(ToString::to_string),
            Some("open_ai reported an error: rate limited".to_string())
        );
    }

    #[tokio::test]
    async fn test_sse_without_trailing_blank_line() {
        let mut stream = SseChatStream::new(
            "open_ai",
            source(&["data: {\"choices\":[{\"delta\":{\"content\":\"end\"}}]}"]),
        );

        assert!(stream.next().await);
        assert_eq!(stream.content(), "end");
        assert!(!stream.next().await);
    }

    #[test]
    fn test_line_buffer() {
        let mut lines = LineBuffer::default();
        lines.push(b"one\r\ntw");
        assert_eq!(lines.next_line().as_deref(), Some("one"));
        assert_eq!(lines.next_line(), None);
        lines.push(b"o\n");
        assert_eq!(lines.next_line().as_deref(), Some("two"));
        lines.push(b"rest");
        assert_eq!(lines.take_rest().as_deref(), Some("rest"));
        assert_eq!(lines.take_rest(), None);
    }
}
