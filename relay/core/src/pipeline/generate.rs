//! Provider invocation shared by the reply and title units

use crate::broadcast::Broadcaster;
use crate::error::{codes, ProviderError, RelayError, StructuredError};
use crate::messages::ChannelId;
use crate::provider::{ChatStreamParams, Provider};

/// How a provider call ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Generation {
    /// Whole reply text
    Completed(String),
    /// The provider failed before or during generation
    Failed(ProviderError),
}

/// Run one provider call
///
/// When streaming, every non-empty fragment is broadcast on `channel_id` in
/// the order the provider produced it. Nothing is broadcast for a
/// non-streaming call; the caller publishes the outcome.
///
/// # Errors
///
/// Only broadcast failures are errors here. Provider failures are returned as
/// [`Generation::Failed`].
pub async fn generate(
    broadcaster: &Broadcaster,
    provider: &dyn Provider,
    params: &ChatStreamParams,
    channel_id: &ChannelId,
    use_streaming: bool,
) -> Result<Generation, RelayError> {
    if !use_streaming {
        return Ok(match provider.complete(params).await {
            Ok(completion) => Generation::Completed(completion.content),
            Err(err) => Generation::Failed(err),
        });
    }

    let mut stream = match provider.new_chat_stream(params).await {
        Ok(stream) => stream,
        Err(err) => return Ok(Generation::Failed(err)),
    };

    while stream.next().await {
        let fragment = stream
            .current()
            .map(|event| event.content.clone())
            .unwrap_or_default();
        if !fragment.is_empty() {
            broadcaster
                .send_message_fragment(channel_id, &fragment)
                .await?;
        }
    }

    if let Some(err) = stream.err() {
        return Ok(Generation::Failed(err.clone()));
    }
    Ok(Generation::Completed(stream.content().to_string()))
}

/// Structured form of a provider failure
///
/// A backend 404 means the model does not exist there.
#[must_use]
pub fn coerce_provider_error(err: &ProviderError, model_id: &str) -> StructuredError {
    if err.is_not_found() {
        StructuredError::new(codes::AI_MODEL_NOT_FOUND).with_meta("model_id", model_id)
    } else {
        StructuredError::from(err)
    }
}
