//! Interaction Pipeline - Conversation Message Orchestration
//!
//! Turns a user message into a persisted, streamed assistant reply.
//!
//! # Lifecycle
//!
//! ```text
//! Created -> Pending -> Streaming -> Completed
//!                                 \-> Failed
//! ```
//!
//! [`InteractionPipeline::create_conversation_message`] does only the short
//! synchronous part: validation and the two idempotent creates (the user's
//! input interaction and the pending response interaction). It then forks the
//! reply unit on the [`TaskRunner`] and returns the response's channel id
//! before any text exists.
//!
//! Validation failures are the only errors a caller sees directly. Everything
//! that goes wrong during generation is persisted on the response
//! interaction and published on its channel.
//!
//! The first message of an untitled conversation also forks a title unit on
//! `<conversation_id>/title`.
//!
//! Deletion is soft and owner-checked. A reply still running for a deleted
//! conversation finishes normally, but nothing returns it afterwards.

mod generate;
mod history;
mod reply;
mod title;

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashSet;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};

pub use generate::{coerce_provider_error, Generation};
pub use history::{build_messages, is_prompt_visible, skill_set_message, SKILL_SET_PREAMBLE};
pub use title::{clean_title, MAX_TITLE_CHARS};

use crate::broadcast::Broadcaster;
use crate::config::GenerationConfig;
use crate::error::{codes, ProviderError, RelayError, StoreError, StructuredError};
use crate::messages::ChannelId;
use crate::models::{Actor, AiRelayOptions, Conversation, Interaction};
use crate::relay::RelayClient;
use crate::store::{
    ConversationStore, CreateConversation, CreateInteraction, FileStore, InteractionStore,
    MemoryStore, SkillSetStore,
};
use crate::tasks::{JobError, JobHandle, JobOptions, RequestContext, TaskRunner};

use reply::ReplyJob;
use title::TitleJob;

/// Suffix turning an input idempotency key into its response key
pub const RESPONSE_KEY_SUFFIX: &str = "-response";

// =============================================================================
// Requests and Responses
// =============================================================================

/// Input of [`InteractionPipeline::create_conversation`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateConversationRequest {
    /// Caller-supplied idempotency key
    pub idempotency_key: String,
    /// Owner of the new conversation
    pub owner: Actor,
    /// Default provider/model for replies
    pub ai_relay_options: AiRelayOptions,
}

/// Per-message options
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageOptions {
    /// Stream fragments as they are generated
    #[serde(default = "default_use_streaming")]
    pub use_streaming: bool,
}

fn default_use_streaming() -> bool {
    true
}

impl Default for MessageOptions {
    fn default() -> Self {
        Self {
            use_streaming: default_use_streaming(),
        }
    }
}

/// Input of [`InteractionPipeline::create_conversation_message`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateConversationMessageRequest {
    /// Target conversation
    pub conversation_id: String,
    /// Idempotency key of the input interaction
    pub idempotency_key: String,
    /// The user's message
    pub message_content: String,
    /// Attached files
    #[serde(default)]
    pub file_ids: Vec<String>,
    /// Skill sets to inject into the prompt
    #[serde(default)]
    pub skill_set_ids: Vec<String>,
    /// Requesting actor; must own the conversation
    pub owner: Actor,
    /// Provider/model override; defaults to the conversation's
    #[serde(default)]
    pub ai_relay_options: Option<AiRelayOptions>,
    /// Delivery options
    #[serde(default)]
    pub options: MessageOptions,
}

impl CreateConversationMessageRequest {
    /// Streaming request without attachments, skill sets or model override
    pub fn new(
        conversation_id: impl Into<String>,
        idempotency_key: impl Into<String>,
        message_content: impl Into<String>,
        owner: Actor,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            idempotency_key: idempotency_key.into(),
            message_content: message_content.into(),
            file_ids: Vec::new(),
            skill_set_ids: Vec::new(),
            owner,
            ai_relay_options: None,
            options: MessageOptions::default(),
        }
    }

    /// Override provider and model
    #[must_use]
    pub fn with_ai_relay_options(mut self, options: AiRelayOptions) -> Self {
        self.ai_relay_options = Some(options);
        self
    }

    /// Request skill sets
    #[must_use]
    pub fn with_skill_sets(mut self, ids: Vec<String>) -> Self {
        self.skill_set_ids = ids;
        self
    }

    /// Attach files
    #[must_use]
    pub fn with_files(mut self, ids: Vec<String>) -> Self {
        self.file_ids = ids;
        self
    }

    /// Choose between streamed fragments and a single whole message
    #[must_use]
    pub fn with_streaming(mut self, use_streaming: bool) -> Self {
        self.options.use_streaming = use_streaming;
        self
    }
}

/// Output of [`InteractionPipeline::create_conversation_message`]
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CreateConversationMessageResponse {
    /// Conversation id
    pub conversation_id: String,
    /// The user's message, already completed
    pub input_interaction: Interaction,
    /// The assistant reply placeholder
    pub response_interaction: Interaction,
    /// Channel of the response interaction (`<conversation_id>/<interaction_id>`)
    pub stream_channel_id: ChannelId,
}

/// A model offered by a registered provider
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupportedModel {
    /// Provider id
    pub provider_id: String,
    /// Provider display name
    pub provider_name: String,
    /// Model id
    pub model_id: String,
    /// Model display name
    pub model_name: String,
}

/// A conversation together with its interactions
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationWithInteractions {
    /// The conversation
    pub conversation: Conversation,
    /// Channel the generated title is published on
    pub title_channel_id: ChannelId,
    /// Interactions in creation order
    pub interactions: Vec<InteractionWithChannel>,
}

/// An interaction and the channel its text streams on
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InteractionWithChannel {
    /// The interaction, flattened into this record on the wire
    #[serde(flatten)]
    pub interaction: Interaction,
    /// `<conversation_id>/<interaction_id>`
    pub stream_channel_id: ChannelId,
}

// =============================================================================
// Collaborators
// =============================================================================

/// The persistence collaborators of the pipeline
#[derive(Clone)]
pub struct Stores {
    /// Conversations
    pub conversations: Arc<dyn ConversationStore>,
    /// Interactions
    pub interactions: Arc<dyn InteractionStore>,
    /// Skill sets
    pub skill_sets: Arc<dyn SkillSetStore>,
    /// File attachments
    pub files: Arc<dyn FileStore>,
}

impl Stores {
    /// Every contract served by one in-memory store
    #[must_use]
    pub fn memory(store: &MemoryStore) -> Self {
        Self {
            conversations: Arc::new(store.clone()),
            interactions: Arc::new(store.clone()),
            skill_sets: Arc::new(store.clone()),
            files: Arc::new(store.clone()),
        }
    }
}

pub(crate) struct PipelineInner {
    relay: RelayClient,
    broadcaster: Broadcaster,
    runner: TaskRunner,
    stores: Stores,
    config: GenerationConfig,
    in_flight: Arc<DashSet<String>>,
}

/// Marks a response interaction as having a reply unit running
///
/// Released when dropped.
struct InFlightClaim {
    set: Arc<DashSet<String>>,
    interaction_id: String,
}

impl InFlightClaim {
    fn acquire(set: &Arc<DashSet<String>>, interaction_id: &str) -> Option<Self> {
        set.insert(interaction_id.to_string()).then(|| Self {
            set: Arc::clone(set),
            interaction_id: interaction_id.to_string(),
        })
    }
}

impl Drop for InFlightClaim {
    fn drop(&mut self) {
        self.set.remove(&self.interaction_id);
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// Orchestrates conversations, interactions and reply generation
#[derive(Clone)]
pub struct InteractionPipeline {
    inner: Arc<PipelineInner>,
}

impl InteractionPipeline {
    /// Assemble a pipeline from its collaborators
    #[must_use]
    pub fn new(
        relay: RelayClient,
        broadcaster: Broadcaster,
        runner: TaskRunner,
        stores: Stores,
        config: GenerationConfig,
    ) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                relay,
                broadcaster,
                runner,
                stores,
                config,
                in_flight: Arc::new(DashSet::new()),
            }),
        }
    }

    /// The broadcaster replies are published on
    #[must_use]
    pub fn broadcaster(&self) -> &Broadcaster {
        &self.inner.broadcaster
    }

    /// The runner background units are forked on
    #[must_use]
    pub fn runner(&self) -> &TaskRunner {
        &self.inner.runner
    }

    /// The provider registry
    #[must_use]
    pub fn relay(&self) -> &RelayClient {
        &self.inner.relay
    }

    /// Create a conversation, idempotently by key and owner
    ///
    /// # Errors
    ///
    /// `required_provider_missing` for an unregistered provider, or a store
    /// error.
    pub async fn create_conversation(
        &self,
        req: CreateConversationRequest,
    ) -> Result<Conversation, RelayError> {
        self.ensure_provider(&req.ai_relay_options.provider_id)?;

        let conversation = self
            .inner
            .stores
            .conversations
            .create_conversation(CreateConversation {
                idempotency_key: req.idempotency_key,
                owner: req.owner,
                ai_relay_options: req.ai_relay_options,
            })
            .await?;

        tracing::debug!(conversation_id = %conversation.id, "Conversation created");
        Ok(conversation)
    }

    /// Accept a user message and start generating the reply
    ///
    /// Returns as soon as the input and response interactions exist. The
    /// reply arrives on the returned channel.
    ///
    /// Re-submitting the same idempotency key returns the same records and
    /// starts no second reply while one is running or once the reply has
    /// completed or failed.
    ///
    /// # Errors
    ///
    /// - `invalid_owner` when `req.owner` does not own the conversation
    /// - `required_provider_missing` for an unregistered provider
    /// - store errors from the synchronous creates
    pub async fn create_conversation_message(
        &self,
        ctx: &RequestContext,
        req: CreateConversationMessageRequest,
    ) -> Result<CreateConversationMessageResponse, RelayError> {
        let stores = &self.inner.stores;

        let conversation = stores
            .conversations
            .get_conversation(&req.conversation_id)
            .await?;
        ensure_owner(&conversation, &req.owner)?;

        let options = req
            .ai_relay_options
            .clone()
            .unwrap_or_else(|| conversation.ai_relay_options.clone());
        self.ensure_provider(&options.provider_id)?;

        let first_message = !stores
            .interactions
            .conversation_has_interactions(&conversation.id)
            .await?;

        let input = stores
            .interactions
            .create_interaction(CreateInteraction {
                idempotency_key: req.idempotency_key.clone(),
                conversation_id: conversation.id.clone(),
                message_content: req.message_content,
                file_ids: req.file_ids,
                skill_set_ids: req.skill_set_ids,
                owner: req.owner,
                ai_relay_options: req.ai_relay_options,
            })
            .await?;

        if first_message && conversation.title.is_none() && self.inner.config.generate_titles {
            self.fork_title(ctx, &conversation, &input, &options, req.options.use_streaming);
        }

        let response = stores
            .interactions
            .create_active_interaction(CreateInteraction {
                idempotency_key: format!("{}{RESPONSE_KEY_SUFFIX}", req.idempotency_key),
                conversation_id: conversation.id.clone(),
                message_content: String::new(),
                file_ids: Vec::new(),
                skill_set_ids: Vec::new(),
                owner: Actor::bot(&options.provider_id),
                ai_relay_options: Some(options.clone()),
            })
            .await?;

        let channel_id = ChannelId::for_interaction(&conversation.id, &response.id);
        tracing::info!(
            conversation_id = %conversation.id,
            interaction_id = %input.id,
            response_interaction_id = %response.id,
            provider_id = %options.provider_id,
            model_id = %options.model_id,
            "Conversation message accepted"
        );

        self.fork_reply(
            ctx,
            ReplyJob {
                conversation: conversation.clone(),
                input: input.clone(),
                response: response.clone(),
                options,
                channel_id: channel_id.clone(),
                use_streaming: req.options.use_streaming,
            },
        );

        Ok(CreateConversationMessageResponse {
            conversation_id: conversation.id,
            input_interaction: input,
            response_interaction: response,
            stream_channel_id: channel_id,
        })
    }

    /// Every model of every registered provider
    ///
    /// # Errors
    ///
    /// Fails entirely when any provider cannot list its models.
    pub async fn list_supported_models(&self) -> Result<Vec<SupportedModel>, RelayError> {
        let names: HashMap<String, String> = self
            .inner
            .relay
            .providers()
            .into_iter()
            .map(|p| (p.id, p.name))
            .collect();

        let models = self.inner.relay.list_all_models().await?;
        Ok(models
            .into_iter()
            .map(|m| SupportedModel {
                provider_name: names.get(&m.provider_id).cloned().unwrap_or_default(),
                provider_id: m.provider_id,
                model_id: m.model_id,
                model_name: m.model_name,
            })
            .collect())
    }

    /// Exclude an interaction from future prompts, or include it again
    ///
    /// # Errors
    ///
    /// `invalid_owner` when `owner` does not own the conversation, or a store
    /// error.
    pub async fn update_interaction_excluded_state(
        &self,
        owner: &Actor,
        interaction_id: &str,
        excluded: bool,
    ) -> Result<Interaction, RelayError> {
        let stores = &self.inner.stores;
        let interaction = stores.interactions.get_interaction(interaction_id).await?;
        let conversation = stores
            .conversations
            .get_conversation(&interaction.conversation_id)
            .await?;
        ensure_owner(&conversation, owner)?;

        Ok(stores
            .interactions
            .update_excluded_state(interaction_id, excluded)
            .await?)
    }

    /// Load an interaction
    ///
    /// # Errors
    ///
    /// `interaction_not_found` for an unknown id.
    pub async fn get_interaction(&self, interaction_id: &str) -> Result<Interaction, RelayError> {
        Ok(self
            .inner
            .stores
            .interactions
            .get_interaction(interaction_id)
            .await?)
    }

    /// Load a conversation with its interactions
    ///
    /// # Errors
    ///
    /// `conversation_not_found` for an unknown or deleted conversation,
    /// `invalid_owner` when `owner` does not own it.
    pub async fn get_conversation_with_interactions(
        &self,
        owner: &Actor,
        conversation_id: &str,
    ) -> Result<ConversationWithInteractions, RelayError> {
        let conversation = self
            .inner
            .stores
            .conversations
            .get_conversation(conversation_id)
            .await?;
        ensure_owner(&conversation, owner)?;
        self.with_interactions(conversation).await
    }

    /// Every conversation of `owner` with its interactions, oldest first
    ///
    /// # Errors
    ///
    /// Any store error.
    pub async fn list_conversations_with_interactions(
        &self,
        owner: &Actor,
    ) -> Result<Vec<ConversationWithInteractions>, RelayError> {
        let conversations = self.inner.stores.conversations.list_by_owner(owner).await?;
        try_join_all(conversations.into_iter().map(|c| self.with_interactions(c))).await
    }

    /// Delete conversations and all of their interactions
    ///
    /// Unknown and already deleted ids are skipped. Nothing is deleted when
    /// any of the remaining conversations belongs to someone else. Returns how
    /// many conversations were deleted.
    ///
    /// # Errors
    ///
    /// `invalid_owner`, or a store error.
    pub async fn delete_conversations(
        &self,
        owner: &Actor,
        conversation_ids: &[String],
    ) -> Result<usize, RelayError> {
        let stores = &self.inner.stores;
        let mut owned = Vec::with_capacity(conversation_ids.len());
        for id in conversation_ids {
            match stores.conversations.get_conversation(id).await {
                Ok(conversation) => {
                    ensure_owner(&conversation, owner)?;
                    owned.push(conversation.id);
                }
                Err(StoreError::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let deleted = stores.conversations.delete_conversations(&owned).await?;
        let interactions: usize = try_join_all(
            owned
                .iter()
                .map(|id| stores.interactions.delete_interactions_by_conversation_id(id)),
        )
        .await?
        .into_iter()
        .sum();

        tracing::info!(
            owner = %owner.identifier,
            conversations = deleted,
            interactions,
            "Conversations deleted"
        );
        Ok(deleted)
    }

    /// Delete interactions of conversations owned by `owner`
    ///
    /// Unknown and already deleted ids are skipped. Nothing is deleted when
    /// any of the remaining interactions belongs to someone else's
    /// conversation. Returns how many interactions were deleted.
    ///
    /// # Errors
    ///
    /// `invalid_owner`, or a store error.
    pub async fn delete_interactions(
        &self,
        owner: &Actor,
        interaction_ids: &[String],
    ) -> Result<usize, RelayError> {
        let stores = &self.inner.stores;
        let mut owned = Vec::with_capacity(interaction_ids.len());
        for id in interaction_ids {
            let interaction = match stores.interactions.get_interaction(id).await {
                Ok(interaction) => interaction,
                Err(StoreError::NotFound { .. }) => continue,
                Err(e) => return Err(e.into()),
            };
            match stores
                .conversations
                .get_conversation(&interaction.conversation_id)
                .await
            {
                Ok(conversation) => ensure_owner(&conversation, owner)?,
                Err(StoreError::NotFound { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
            owned.push(interaction.id);
        }

        let deleted = stores.interactions.delete_interactions(&owned).await?;
        tracing::info!(owner = %owner.identifier, interactions = deleted, "Interactions deleted");
        Ok(deleted)
    }

    async fn with_interactions(
        &self,
        conversation: Conversation,
    ) -> Result<ConversationWithInteractions, RelayError> {
        let interactions = self
            .inner
            .stores
            .interactions
            .get_all_by_conversation_id(&conversation.id)
            .await?
            .into_iter()
            .map(|interaction| InteractionWithChannel {
                stream_channel_id: ChannelId::for_interaction(&conversation.id, &interaction.id),
                interaction,
            })
            .collect();

        Ok(ConversationWithInteractions {
            title_channel_id: ChannelId::title(&conversation.id),
            interactions,
            conversation,
        })
    }

    fn ensure_provider(&self, provider_id: &str) -> Result<(), RelayError> {
        if self.inner.relay.has_provider(provider_id) {
            Ok(())
        } else {
            Err(ProviderError::MissingProvider {
                provider_id: provider_id.to_string(),
            }
            .into())
        }
    }

    fn fork_reply(&self, ctx: &RequestContext, job: ReplyJob) -> Option<JobHandle> {
        if job.response.is_terminal() {
            tracing::debug!(
                interaction_id = %job.response.id,
                state = ?job.response.state(),
                "Reply already finished, not regenerating"
            );
            return None;
        }
        let Some(claim) = InFlightClaim::acquire(&self.inner.in_flight, &job.response.id) else {
            tracing::debug!(interaction_id = %job.response.id, "Reply already in flight");
            return None;
        };
        // Held by both the body and the fault hook, released after both
        let claim = Arc::new(claim);

        let hook_inner = Arc::clone(&self.inner);
        let hook_claim = Arc::clone(&claim);
        let interaction_id = job.response.id.clone();
        let channel_id = job.channel_id.clone();
        let options = JobOptions::new("conversation_reply")
            .with_timeout(self.inner.config.timeout)
            .on_fault(move |_ctx, err| async move {
                let _claim = hook_claim;
                reply::record_fault(&hook_inner, &interaction_id, &channel_id, &err).await;
            });

        let inner = Arc::clone(&self.inner);
        Some(self.inner.runner.spawn(ctx, options, move |_ctx| async move {
            let _claim = claim;
            reply::run(&inner, job).await.map_err(JobError::from)
        }))
    }

    fn fork_title(
        &self,
        ctx: &RequestContext,
        conversation: &Conversation,
        input: &Interaction,
        options: &AiRelayOptions,
        use_streaming: bool,
    ) -> JobHandle {
        let model_id = self
            .inner
            .config
            .title_model
            .clone()
            .unwrap_or_else(|| options.model_id.clone());
        let job = TitleJob {
            conversation_id: conversation.id.clone(),
            owner_id: conversation.owner.identifier.clone(),
            first_message: input.message_content.clone(),
            options: AiRelayOptions::new(options.provider_id.clone(), model_id),
            use_streaming,
        };

        let inner = Arc::clone(&self.inner);
        self.inner.runner.fork_with_timeout(
            ctx,
            "conversation_title",
            self.inner.config.title_timeout,
            move |_ctx| async move { title::run(&inner, job).await.map_err(JobError::from) },
        )
    }
}

fn ensure_owner(conversation: &Conversation, actor: &Actor) -> Result<(), RelayError> {
    if conversation.owner == *actor {
        return Ok(());
    }
    Err(StructuredError::new(codes::INVALID_OWNER)
        .with_meta("type", actor.actor_type.as_str())
        .with_meta("identifier", actor.identifier.clone())
        .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{Connection, ConnectionError};
    use crate::provider::{ScriptedProvider, ScriptedReply};
    use crate::relay::NoopTracer;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct ChannelConnection(mpsc::UnboundedSender<String>);

    #[async_trait]
    impl Connection for ChannelConnection {
        async fn write_text(&mut self, text: &str) -> Result<(), ConnectionError> {
            self.0
                .send(text.to_string())
                .map_err(|_| ConnectionError::Closed)
        }
    }

    fn pipeline(provider: ScriptedProvider) -> (InteractionPipeline, MemoryStore) {
        let store = MemoryStore::new();
        let pipeline = InteractionPipeline::new(
            RelayClient::new(Arc::new(NoopTracer)).with_provider(Arc::new(provider)),
            Broadcaster::default(),
            TaskRunner::new(),
            Stores::memory(&store),
            GenerationConfig {
                generate_titles: false,
                ..GenerationConfig::default()
            },
        );
        (pipeline, store)
    }

    async fn conversation(pipeline: &InteractionPipeline) -> Conversation {
        pipeline
            .create_conversation(CreateConversationRequest {
                idempotency_key: "conv-key".to_string(),
                owner: Actor::user("u1"),
                ai_relay_options: AiRelayOptions::new("demo", "m1"),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_wrong_owner_is_rejected_synchronously() {
        let (pipeline, store) = pipeline(ScriptedProvider::new("demo", ScriptedReply::Stall));
        let conversation = conversation(&pipeline).await;

        let err = pipeline
            .create_conversation_message(
                &RequestContext::default(),
                CreateConversationMessageRequest::new(
                    &conversation.id,
                    "k1",
                    "hi",
                    Actor::user("intruder"),
                ),
            )
            .await
            .unwrap_err();

        let structured = err.to_structured();
        assert_eq!(structured.code, codes::INVALID_OWNER);
        assert_eq!(structured.meta_str("identifier"), Some("intruder"));
        assert_eq!(store.interaction_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_provider_is_rejected_synchronously() {
        let (pipeline, store) = pipeline(ScriptedProvider::new("demo", ScriptedReply::Stall));
        let conversation = conversation(&pipeline).await;

        let err = pipeline
            .create_conversation_message(
                &RequestContext::default(),
                CreateConversationMessageRequest::new(
                    &conversation.id,
                    "k1",
                    "hi",
                    Actor::user("u1"),
                )
                .with_ai_relay_options(AiRelayOptions::new("nope", "m1")),
            )
            .await
            .unwrap_err();

        assert_eq!(err.to_structured().code, codes::REQUIRED_PROVIDER_MISSING);
        assert_eq!(store.interaction_count(), 0);

        let err = pipeline
            .create_conversation(CreateConversationRequest {
                idempotency_key: "other".to_string(),
                owner: Actor::user("u1"),
                ai_relay_options: AiRelayOptions::new("nope", "m1"),
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_structured().code, codes::REQUIRED_PROVIDER_MISSING);
    }

    #[tokio::test]
    async fn test_retry_does_not_fork_a_second_reply() {
        let (pipeline, store) = pipeline(ScriptedProvider::new("demo", ScriptedReply::Stall));
        let conversation = conversation(&pipeline).await;
        let request =
            CreateConversationMessageRequest::new(&conversation.id, "k1", "hi", Actor::user("u1"));

        let first = pipeline
            .create_conversation_message(&RequestContext::default(), request.clone())
            .await
            .unwrap();
        let second = pipeline
            .create_conversation_message(&RequestContext::default(), request)
            .await
            .unwrap();

        assert_eq!(first.response_interaction.id, second.response_interaction.id);
        assert_eq!(first.stream_channel_id, second.stream_channel_id);
        assert_eq!(pipeline.runner().active_count(), 1);
        assert_eq!(store.interaction_count(), 2);
    }

    #[tokio::test]
    async fn test_response_key_and_owner() {
        let (pipeline, _store) = pipeline(ScriptedProvider::new("demo", ScriptedReply::Stall));
        let conversation = conversation(&pipeline).await;

        let response = pipeline
            .create_conversation_message(
                &RequestContext::default(),
                CreateConversationMessageRequest::new(
                    &conversation.id,
                    "k1",
                    "hi",
                    Actor::user("u1"),
                ),
            )
            .await
            .unwrap();

        let reply = &response.response_interaction;
        assert_eq!(reply.idempotency_key, "k1-response");
        assert_eq!(reply.owner, Actor::bot("demo"));
        assert_eq!(reply.ai_relay_options, Some(AiRelayOptions::new("demo", "m1")));
        assert!(!reply.is_terminal());
        assert_eq!(
            response.stream_channel_id.as_str(),
            format!("{}/{}", conversation.id, reply.id)
        );
    }

    #[tokio::test]
    async fn test_fault_is_recorded_once() {
        let (pipeline, store) = pipeline(ScriptedProvider::new("demo", ScriptedReply::Stall));
        let conversation = conversation(&pipeline).await;
        let (tx, mut frames) = mpsc::unbounded_channel();
        pipeline.broadcaster().register(ChannelConnection(tx));

        let response = store
            .create_active_interaction(CreateInteraction {
                idempotency_key: "k1-response".to_string(),
                conversation_id: conversation.id.clone(),
                message_content: String::new(),
                file_ids: Vec::new(),
                skill_set_ids: Vec::new(),
                owner: Actor::bot("demo"),
                ai_relay_options: Some(AiRelayOptions::new("demo", "m1")),
            })
            .await
            .unwrap();
        let channel = ChannelId::for_interaction(&conversation.id, &response.id);
        let timed_out = JobError::TimedOut(Duration::from_millis(50));

        reply::record_fault(&pipeline.inner, &response.id, &channel, &timed_out).await;
        let stored = store.get_interaction(&response.id).await.unwrap();
        assert_eq!(stored.errors.len(), 1);
        assert_eq!(stored.errors[0].code, codes::GENERATION_TIMED_OUT);
        assert!(frames.try_recv().unwrap().contains(codes::GENERATION_TIMED_OUT));

        // Already failed: neither stored nor published again
        let panicked = JobError::Panicked("boom".to_string());
        reply::record_fault(&pipeline.inner, &response.id, &channel, &panicked).await;
        let stored = store.get_interaction(&response.id).await.unwrap();
        assert_eq!(stored.errors.len(), 1);
        assert!(frames.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_deletion_by_another_owner_deletes_nothing() {
        let (pipeline, store) = pipeline(ScriptedProvider::new("demo", ScriptedReply::Stall));
        let conversation = conversation(&pipeline).await;
        let response = pipeline
            .create_conversation_message(
                &RequestContext::default(),
                CreateConversationMessageRequest::new(
                    &conversation.id,
                    "k1",
                    "hi",
                    Actor::user("u1"),
                ),
            )
            .await
            .unwrap();
        let intruder = Actor::user("intruder");

        let ids = vec![conversation.id.clone(), "unknown".to_string()];
        let err = pipeline
            .delete_conversations(&intruder, &ids)
            .await
            .unwrap_err();
        assert_eq!(err.to_structured().code, codes::INVALID_OWNER);

        let ids = vec![response.input_interaction.id.clone()];
        let err = pipeline
            .delete_interactions(&intruder, &ids)
            .await
            .unwrap_err();
        assert_eq!(err.to_structured().code, codes::INVALID_OWNER);

        let err = pipeline
            .get_conversation_with_interactions(&intruder, &conversation.id)
            .await
            .unwrap_err();
        assert_eq!(err.to_structured().code, codes::INVALID_OWNER);

        let full = pipeline
            .get_conversation_with_interactions(&Actor::user("u1"), &conversation.id)
            .await
            .unwrap();
        assert_eq!(full.interactions.len(), 2);
        assert!(store.get_conversation(&conversation.id).await.is_ok());
    }

    #[test]
    fn test_request_defaults_to_streaming() {
        let req: CreateConversationMessageRequest = serde_json::from_value(serde_json::json!({
            "conversation_id": "c1",
            "idempotency_key": "k1",
            "message_content": "hello",
            "owner": {"type": "user", "identifier": "u1"}
        }))
        .unwrap();

        assert!(req.options.use_streaming);
        assert!(req.ai_relay_options.is_none());
        assert!(req.file_ids.is_empty());
    }
}
