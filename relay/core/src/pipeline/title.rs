//! Conversation Title Unit
//!
//! Asks the model for a short title based on the first message. Fragments
//! go to the conversation's title channel. A failure only shows up there and
//! in the logs; the conversation simply stays untitled.

use crate::error::RelayError;
use crate::messages::ChannelId;
use crate::models::AiRelayOptions;
use crate::provider::{ChatMessage, ChatStreamParams};

use super::generate::{coerce_provider_error, generate, Generation};
use super::PipelineInner;

/// Instruction preceding the first message
const TITLE_PROMPT: &str = "Generate a conversation title for the following text. It should be concise but descriptive. It should be a single sentence, no more than 100 characters. Return nothing but the title. Do not wrap the output in quotes or use any markdown formatting.\n\n";

/// Longest title kept
pub const MAX_TITLE_CHARS: usize = 100;

pub(super) struct TitleJob {
    pub conversation_id: String,
    pub owner_id: String,
    pub first_message: String,
    pub options: AiRelayOptions,
    pub use_streaming: bool,
}

/// Strip what models wrap titles in and cap the length
#[must_use]
pub fn clean_title(raw: &str) -> String {
    const WRAPPERS: &[char] = &['"', '\'', '`', '\u{201c}', '\u{201d}', '*', '#'];
    raw.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default()
        .trim_matches(|c: char| WRAPPERS.contains(&c) || c.is_whitespace())
        .chars()
        .take(MAX_TITLE_CHARS)
        .collect::<String>()
        .trim_end()
        .to_string()
}

pub(super) async fn run(inner: &PipelineInner, job: TitleJob) -> Result<(), RelayError> {
    let channel_id = ChannelId::title(&job.conversation_id);
    let params = ChatStreamParams::new(
        &job.options.model_id,
        vec![ChatMessage::user(format!("{TITLE_PROMPT}{}", job.first_message))],
    )
    .with_trace_ids(&job.conversation_id, &job.owner_id, channel_id.as_str());
    let provider = inner.relay.with(&job.options.provider_id);

    let generation = generate(
        &inner.broadcaster,
        provider.as_ref(),
        &params,
        &channel_id,
        job.use_streaming,
    )
    .await?;

    match generation {
        Generation::Completed(raw) => {
            let title = clean_title(&raw);
            if title.is_empty() {
                tracing::warn!(
                    conversation_id = %job.conversation_id,
                    "Model returned an empty title"
                );
                return Ok(());
            }
            inner
                .stores
                .conversations
                .update_title(&job.conversation_id, &title)
                .await?;
            inner
                .broadcaster
                .send_message_full(&channel_id, &title)
                .await?;
            tracing::info!(
                conversation_id = %job.conversation_id,
                title = %title,
                "Conversation titled"
            );
            Ok(())
        }
        Generation::Failed(err) => {
            let error = coerce_provider_error(&err, &job.options.model_id);
            inner
                .broadcaster
                .send_error_message(&channel_id, error.clone())
                .await?;
            Err(RelayError::Structured(error))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_clean_title() {
        assert_eq!(clean_title("  \"Rust lifetimes\"\n"), "Rust lifetimes");
        assert_eq!(clean_title("**Bread baking**"), "Bread baking");
        assert_eq!(clean_title("\n\nFirst line\nsecond line"), "First line");
        assert_eq!(clean_title("   "), "");
    }

    #[test]
    fn test_clean_title_caps_length() {
        let long = "word ".repeat(40);
        let title = clean_title(&long);
        assert!(title.chars().count() <= MAX_TITLE_CHARS);
        assert!(!title.ends_with(' '));
    }
}
