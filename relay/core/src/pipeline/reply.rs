//! Reply Generation Unit
//!
//! Runs detached from the request that created the response interaction.
//! Exactly one terminal transition is attempted per run:
//!
//! - success: the assembled content is persisted with
//!   `mark_active_as_complete`, then published as `message_full`
//! - provider failure: the coerced error is appended to the interaction's
//!   error log and published as `error`
//! - fault (panic, timeout, store failure): [`record_fault`] does the same
//!   with a `generation_fault` or `generation_timed_out` error, unless the
//!   interaction already reached its outcome

use crate::error::{codes, RelayError, StoreError, StructuredError};
use crate::messages::ChannelId;
use crate::models::{AiRelayOptions, Conversation, Interaction};
use crate::provider::ChatStreamParams;
use crate::tasks::JobError;

use super::generate::{coerce_provider_error, generate, Generation};
use super::history;
use super::PipelineInner;

/// Everything a reply unit needs, captured at fork time
pub(super) struct ReplyJob {
    pub conversation: Conversation,
    pub input: Interaction,
    pub response: Interaction,
    pub options: AiRelayOptions,
    pub channel_id: ChannelId,
    pub use_streaming: bool,
}

pub(super) async fn run(inner: &PipelineInner, job: ReplyJob) -> Result<(), RelayError> {
    let messages = history::load_prompt(
        &inner.stores,
        inner.config.system_prompt.as_deref(),
        &job.conversation,
        &job.input,
    )
    .await?;

    let params = ChatStreamParams::new(&job.options.model_id, messages).with_trace_ids(
        &job.conversation.id,
        &job.conversation.owner.identifier,
        &job.response.id,
    );
    let provider = inner.relay.with(&job.options.provider_id);

    tracing::debug!(
        interaction_id = %job.response.id,
        provider_id = %job.options.provider_id,
        model_id = %job.options.model_id,
        messages = params.messages.len(),
        streaming = job.use_streaming,
        "Generating reply"
    );

    let generation = generate(
        &inner.broadcaster,
        provider.as_ref(),
        &params,
        &job.channel_id,
        job.use_streaming,
    )
    .await?;

    match generation {
        Generation::Completed(content) => {
            inner
                .stores
                .interactions
                .mark_active_as_complete(&job.response.id, &content)
                .await?;
            inner
                .broadcaster
                .send_message_full(&job.channel_id, &content)
                .await?;
            tracing::info!(
                interaction_id = %job.response.id,
                output_chars = content.len(),
                "Reply completed"
            );
            Ok(())
        }
        Generation::Failed(err) => {
            let error = coerce_provider_error(&err, &job.options.model_id);
            inner
                .stores
                .interactions
                .add_error(&job.response.id, error.clone())
                .await?;
            inner
                .broadcaster
                .send_error_message(&job.channel_id, error.clone())
                .await?;
            // Already recorded; returned so the runner logs it
            Err(RelayError::Structured(error))
        }
    }
}

/// Error recorded for a job failure, or `None` when the unit already
/// recorded it
pub(super) fn fault_error(err: &JobError) -> Option<StructuredError> {
    match err {
        JobError::Relay(RelayError::Structured(_)) => None,
        JobError::Relay(e) => {
            Some(StructuredError::new(codes::GENERATION_FAULT).with_reason(e.to_structured()))
        }
        JobError::Panicked(_) | JobError::TimedOut(_) => Some(err.to_structured()),
    }
}

/// Give a faulted reply its terminal error
pub(super) async fn record_fault(
    inner: &PipelineInner,
    interaction_id: &str,
    channel_id: &ChannelId,
    err: &JobError,
) {
    let Some(error) = fault_error(err) else {
        return;
    };

    // The unit may have reached its outcome before the fault hit
    match inner.stores.interactions.get_interaction(interaction_id).await {
        Ok(interaction) if interaction.is_terminal() => {
            tracing::debug!(
                interaction_id = %interaction_id,
                state = ?interaction.state(),
                fault = %error.code,
                "Reply already finished, fault not recorded"
            );
            return;
        }
        Ok(_) => {}
        Err(e) => {
            tracing::warn!(
                interaction_id = %interaction_id,
                error = %e,
                "Failed to load faulted reply"
            );
        }
    }

    match inner
        .stores
        .interactions
        .add_error(interaction_id, error.clone())
        .await
    {
        Ok(_) => {}
        Err(StoreError::AlreadyTerminal { .. }) => {
            tracing::debug!(
                interaction_id = %interaction_id,
                "Reply finished concurrently, fault not recorded"
            );
            return;
        }
        Err(e) => {
            tracing::warn!(
                interaction_id = %interaction_id,
                error = %e,
                "Failed to record reply fault"
            );
            return;
        }
    }

    if let Err(e) = inner.broadcaster.send_error_message(channel_id, error).await {
        tracing::warn!(
            channel_id = %channel_id,
            error = %e,
            "Failed to publish reply fault"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_fault_error_classification() {
        let handled = JobError::Relay(RelayError::Structured(StructuredError::new(
            codes::AI_MODEL_NOT_FOUND,
        )));
        assert_eq!(fault_error(&handled), None);

        let store = JobError::Relay(RelayError::Store(StoreError::Backend("disk".into())));
        let error = fault_error(&store).unwrap();
        assert_eq!(error.code, codes::GENERATION_FAULT);
        assert_eq!(error.reasons[0].code, codes::UNKNOWN);

        let timed_out = fault_error(&JobError::TimedOut(Duration::from_millis(50))).unwrap();
        assert_eq!(timed_out.code, codes::GENERATION_TIMED_OUT);

        let panicked = fault_error(&JobError::Panicked("kaboom".into())).unwrap();
        assert_eq!(panicked.code, codes::GENERATION_FAULT);
        assert_eq!(panicked.meta_str("message"), Some("kaboom"));
    }
}
