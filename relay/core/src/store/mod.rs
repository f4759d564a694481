//! Persistence Contracts
//!
//! The pipeline never owns conversation or interaction state. It talks to
//! these collaborators, which are expected to provide:
//!
//! - idempotent creation, keyed by idempotency key, conversation and owner
//! - a single terminal transition per response interaction: either
//!   [`InteractionStore::mark_active_as_complete`] or
//!   [`InteractionStore::add_error`] wins, the other then fails with
//!   [`StoreError::AlreadyTerminal`]
//! - soft deletion: deleted records keep their data but are no longer
//!   returned by lookups and listings
//!
//! [`MemoryStore`] implements all of them in process.

mod memory;

use async_trait::async_trait;

pub use memory::MemoryStore;

use crate::error::{StoreError, StructuredError};
use crate::models::{Actor, AiRelayOptions, Conversation, FileAttachment, Interaction, SkillSet};

/// Input of [`ConversationStore::create_conversation`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateConversation {
    /// Caller-supplied idempotency key
    pub idempotency_key: String,
    /// Owner
    pub owner: Actor,
    /// Default provider/model
    pub ai_relay_options: AiRelayOptions,
}

/// Input of the interaction create operations
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateInteraction {
    /// Idempotency key, scoped by conversation and owner
    pub idempotency_key: String,
    /// Parent conversation
    pub conversation_id: String,
    /// Text content (ignored for active interactions)
    pub message_content: String,
    /// Attached file ids
    pub file_ids: Vec<String>,
    /// Requested skill sets
    pub skill_set_ids: Vec<String>,
    /// Author
    pub owner: Actor,
    /// Provider/model selection
    pub ai_relay_options: Option<AiRelayOptions>,
}

/// Conversation persistence
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Create a conversation, or return the one already created with the same
    /// key and owner
    async fn create_conversation(
        &self,
        cmd: CreateConversation,
    ) -> Result<Conversation, StoreError>;

    /// Load a conversation
    async fn get_conversation(&self, id: &str) -> Result<Conversation, StoreError>;

    /// Set the generated title
    async fn update_title(&self, id: &str, title: &str) -> Result<Conversation, StoreError>;

    /// Every non-deleted conversation of `owner`, oldest first
    async fn list_by_owner(&self, owner: &Actor) -> Result<Vec<Conversation>, StoreError>;

    /// Soft-delete conversations
    ///
    /// Unknown and already deleted ids are skipped. Returns how many were
    /// deleted by this call.
    async fn delete_conversations(&self, ids: &[String]) -> Result<usize, StoreError>;
}

/// Interaction persistence
#[async_trait]
pub trait InteractionStore: Send + Sync {
    /// Create a completed interaction (user input), idempotently
    async fn create_interaction(&self, cmd: CreateInteraction) -> Result<Interaction, StoreError>;

    /// Create an empty pending interaction (assistant reply), idempotently
    async fn create_active_interaction(
        &self,
        cmd: CreateInteraction,
    ) -> Result<Interaction, StoreError>;

    /// Set the final content of a pending interaction (single use)
    async fn mark_active_as_complete(
        &self,
        id: &str,
        content: &str,
    ) -> Result<Interaction, StoreError>;

    /// Record the error outcome of a pending interaction (single use)
    async fn add_error(&self, id: &str, error: StructuredError) -> Result<Interaction, StoreError>;

    /// Load an interaction
    async fn get_interaction(&self, id: &str) -> Result<Interaction, StoreError>;

    /// Every non-deleted interaction of a conversation, in creation order
    async fn get_all_by_conversation_id(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<Interaction>, StoreError>;

    /// Whether a conversation has any interaction
    async fn conversation_has_interactions(&self, conversation_id: &str)
        -> Result<bool, StoreError>;

    /// Exclude an interaction from (or include it back into) future prompts
    async fn update_excluded_state(
        &self,
        id: &str,
        excluded: bool,
    ) -> Result<Interaction, StoreError>;

    /// Soft-delete interactions; unknown and already deleted ids are skipped
    async fn delete_interactions(&self, ids: &[String]) -> Result<usize, StoreError>;

    /// Soft-delete every interaction of a conversation
    async fn delete_interactions_by_conversation_id(
        &self,
        conversation_id: &str,
    ) -> Result<usize, StoreError>;
}

/// Skill-set lookup
#[async_trait]
pub trait SkillSetStore: Send + Sync {
    /// Skill sets with the given ids visible to `owner`; unknown ids are skipped
    async fn get_many_skill_sets(
        &self,
        ids: &[String],
        owner: &Actor,
    ) -> Result<Vec<SkillSet>, StoreError>;
}

/// File attachment lookup
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Files with the given ids owned by `owner`; unknown ids are skipped
    async fn get_many_files(
        &self,
        ids: &[String],
        owner: &Actor,
    ) -> Result<Vec<FileAttachment>, StoreError>;
}
