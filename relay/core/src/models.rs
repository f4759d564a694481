//! Domain Records
//!
//! Records owned by the persistence collaborators: conversations, the
//! interactions (turns) inside them, skill sets and file attachments.
//! The pipeline only reads these and asks the stores to mutate them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StructuredError;

/// Kind of actor that owns a record
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    /// A human user
    User,
    /// The assistant (a provider)
    Bot,
}

impl ActorType {
    /// Wire name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Bot => "bot",
        }
    }
}

/// Owner of a conversation, interaction or skill set
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
    /// Actor kind
    #[serde(rename = "type")]
    pub actor_type: ActorType,
    /// User id, or provider id for bots
    pub identifier: String,
}

impl Actor {
    /// A human user
    pub fn user(identifier: impl Into<String>) -> Self {
        Self {
            actor_type: ActorType::User,
            identifier: identifier.into(),
        }
    }

    /// The assistant, identified by its provider
    pub fn bot(identifier: impl Into<String>) -> Self {
        Self {
            actor_type: ActorType::Bot,
            identifier: identifier.into(),
        }
    }
}

/// Provider and model selection
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AiRelayOptions {
    /// Registered provider id (e.g. `ollama`)
    pub provider_id: String,
    /// Backend model id
    pub model_id: String,
}

impl AiRelayOptions {
    /// Create options for a provider/model pair
    pub fn new(provider_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            model_id: model_id.into(),
        }
    }
}

/// A conversation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// Unique id
    pub id: String,
    /// Caller-supplied idempotency key
    pub idempotency_key: String,
    /// Owner
    pub owner: Actor,
    /// Default provider/model for replies
    pub ai_relay_options: AiRelayOptions,
    /// Generated title, once known
    pub title: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
    /// Soft deletion time
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Lifecycle of an interaction as seen by a caller
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionState {
    /// Placeholder, generation not finished
    Pending,
    /// Content set
    Completed,
    /// Error recorded
    Failed,
}

/// One turn inside a conversation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    /// Unique id
    pub id: String,
    /// Idempotency key, scoped by conversation and owner
    pub idempotency_key: String,
    /// Parent conversation
    pub conversation_id: String,
    /// Text content (empty while pending)
    pub message_content: String,
    /// Attached file ids
    pub file_ids: Vec<String>,
    /// Skill sets requested with this message
    pub skill_set_ids: Vec<String>,
    /// Author
    pub owner: Actor,
    /// Provider/model selection
    pub ai_relay_options: Option<AiRelayOptions>,
    /// When the owner excluded this turn from future prompts
    pub marked_as_excluded_at: Option<DateTime<Utc>>,
    /// Error log
    pub errors: Vec<StructuredError>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
    /// Completion time; `None` while pending
    pub completed_at: Option<DateTime<Utc>>,
    /// Soft deletion time
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Interaction {
    /// Whether the content is final
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }

    /// Whether the turn must be left out of provider prompts
    #[must_use]
    pub fn is_excluded(&self) -> bool {
        self.marked_as_excluded_at.is_some()
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> InteractionState {
        if self.is_completed() {
            InteractionState::Completed
        } else if self.errors.is_empty() {
            InteractionState::Pending
        } else {
            InteractionState::Failed
        }
    }

    /// Whether a terminal transition already happened
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state() != InteractionState::Pending
    }
}

/// A reusable prompt fragment
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillSet {
    /// Unique id
    pub id: String,
    /// Display name
    pub name: String,
    /// Instructions injected into the prompt
    pub prompt: String,
    /// Owner
    pub owner: Actor,
}

/// A file whose content has been resolved for prompting
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttachment {
    /// Unique id
    pub id: String,
    /// Original file name
    pub name: String,
    /// MIME type
    pub mime_type: String,
    /// Text content
    pub content: String,
}

/// Generate a prefixed record id (`interaction_4f1c...`)
#[must_use]
pub fn generate_id(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_actor_wire_shape() {
        let json = serde_json::to_value(Actor::user("u1")).unwrap();
        assert_eq!(json, serde_json::json!({"type": "user", "identifier": "u1"}));
    }

    #[test]
    fn test_generate_id_prefix() {
        let a = generate_id("interaction");
        let b = generate_id("interaction");
        assert!(a.starts_with("interaction_"));
        assert_ne!(a, b);
    }
}
