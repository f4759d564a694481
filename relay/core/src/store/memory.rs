//! In-memory store
//!
//! All four persistence contracts over a single lock, so every operation is
//! atomic with respect to the others.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use super::{
    ConversationStore, CreateConversation, CreateInteraction, FileStore, InteractionStore,
    SkillSetStore,
};
use crate::error::{StoreError, StructuredError};
use crate::models::{generate_id, Actor, Conversation, FileAttachment, Interaction, SkillSet};

#[derive(Default)]
struct State {
    conversations: HashMap<String, Conversation>,
    /// Conversation ids in creation order
    conversation_order: Vec<String>,
    /// (idempotency key, owner) -> conversation id
    conversation_keys: HashMap<(String, Actor), String>,
    /// Creation sequence -> interaction
    interactions: BTreeMap<u64, Interaction>,
    /// Interaction id -> creation sequence
    interaction_ids: HashMap<String, u64>,
    /// (conversation id, idempotency key, owner) -> creation sequence
    interaction_keys: HashMap<(String, String, Actor), u64>,
    next_seq: u64,
    skill_sets: HashMap<String, SkillSet>,
    files: HashMap<String, (Actor, FileAttachment)>,
}

impl State {
    fn interaction(&self, id: &str) -> Result<&Interaction, StoreError> {
        self.interaction_ids
            .get(id)
            .and_then(|seq| self.interactions.get(seq))
            .filter(|i| i.deleted_at.is_none())
            .ok_or_else(|| StoreError::NotFound {
                entity: "interaction",
                id: id.to_string(),
            })
    }

    fn interaction_mut(&mut self, id: &str) -> Result<&mut Interaction, StoreError> {
        let seq = self.interaction_ids.get(id).copied();
        seq.and_then(|seq| self.interactions.get_mut(&seq))
            .ok_or_else(|| StoreError::NotFound {
                entity: "interaction",
                id: id.to_string(),
            })
    }

    fn soft_delete(&mut self, seqs: &[u64]) -> usize {
        let now = Utc::now();
        let mut deleted = 0;
        for seq in seqs {
            if let Some(interaction) = self.interactions.get_mut(seq) {
                if interaction.deleted_at.is_none() {
                    interaction.deleted_at = Some(now);
                    interaction.updated_at = now;
                    deleted += 1;
                }
            }
        }
        deleted
    }

    fn insert_interaction(&mut self, cmd: CreateInteraction, active: bool) -> Interaction {
        let key = (
            cmd.conversation_id.clone(),
            cmd.idempotency_key.clone(),
            cmd.owner.clone(),
        );
        if let Some(existing) = self
            .interaction_keys
            .get(&key)
            .and_then(|seq| self.interactions.get(seq))
        {
            return existing.clone();
        }

        let now = Utc::now();
        let interaction = Interaction {
            id: generate_id("interaction"),
            idempotency_key: cmd.idempotency_key,
            conversation_id: cmd.conversation_id,
            message_content: if active {
                String::new()
            } else {
                cmd.message_content
            },
            file_ids: cmd.file_ids,
            skill_set_ids: cmd.skill_set_ids,
            owner: cmd.owner,
            ai_relay_options: cmd.ai_relay_options,
            marked_as_excluded_at: None,
            errors: Vec::new(),
            created_at: now,
            updated_at: now,
            completed_at: if active { None } else { Some(now) },
            deleted_at: None,
        };

        let seq = self.next_seq;
        self.next_seq += 1;
        self.interaction_ids.insert(interaction.id.clone(), seq);
        self.interaction_keys.insert(key, seq);
        self.interactions.insert(seq, interaction.clone());
        interaction
    }
}

/// In-process implementation of every store contract
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<State>>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a skill set
    pub fn insert_skill_set(&self, skill_set: SkillSet) {
        self.state
            .write()
            .skill_sets
            .insert(skill_set.id.clone(), skill_set);
    }

    /// Add or replace a file owned by `owner`
    pub fn insert_file(&self, owner: Actor, file: FileAttachment) {
        self.state
            .write()
            .files
            .insert(file.id.clone(), (owner, file));
    }

    /// Number of stored interactions, deleted ones included
    #[must_use]
    pub fn interaction_count(&self) -> usize {
        self.state.read().interactions.len()
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn create_conversation(
        &self,
        cmd: CreateConversation,
    ) -> Result<Conversation, StoreError> {
        let mut state = self.state.write();
        let key = (cmd.idempotency_key.clone(), cmd.owner.clone());
        if let Some(existing) = state
            .conversation_keys
            .get(&key)
            .and_then(|id| state.conversations.get(id))
        {
            return Ok(existing.clone());
        }

        let now = Utc::now();
        let conversation = Conversation {
            id: generate_id("conversation"),
            idempotency_key: cmd.idempotency_key,
            owner: cmd.owner,
            ai_relay_options: cmd.ai_relay_options,
            title: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        state
            .conversation_keys
            .insert(key, conversation.id.clone());
        state.conversation_order.push(conversation.id.clone());
        state
            .conversations
            .insert(conversation.id.clone(), conversation.clone());
        Ok(conversation)
    }

    async fn get_conversation(&self, id: &str) -> Result<Conversation, StoreError> {
        self.state
            .read()
            .conversations
            .get(id)
            .filter(|c| c.deleted_at.is_none())
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                entity: "conversation",
                id: id.to_string(),
            })
    }

    async fn update_title(&self, id: &str, title: &str) -> Result<Conversation, StoreError> {
        let mut state = self.state.write();
        let conversation = state
            .conversations
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "conversation",
                id: id.to_string(),
            })?;
        conversation.title = Some(title.to_string());
        conversation.updated_at = Utc::now();
        Ok(conversation.clone())
    }

    async fn list_by_owner(&self, owner: &Actor) -> Result<Vec<Conversation>, StoreError> {
        let state = self.state.read();
        Ok(state
            .conversation_order
            .iter()
            .filter_map(|id| state.conversations.get(id))
            .filter(|c| &c.owner == owner && c.deleted_at.is_none())
            .cloned()
            .collect())
    }

    async fn delete_conversations(&self, ids: &[String]) -> Result<usize, StoreError> {
        let mut state = self.state.write();
        let now = Utc::now();
        let mut deleted = 0;
        for id in ids {
            if let Some(conversation) = state.conversations.get_mut(id) {
                if conversation.deleted_at.is_none() {
                    conversation.deleted_at = Some(now);
                    conversation.updated_at = now;
                    deleted += 1;
                }
            }
        }
        Ok(deleted)
    }
}

#[async_trait]
impl InteractionStore for MemoryStore {
    async fn create_interaction(&self, cmd: CreateInteraction) -> Result<Interaction, StoreError> {
        Ok(self.state.write().insert_interaction(cmd, false))
    }

    async fn create_active_interaction(
        &self,
        cmd: CreateInteraction,
    ) -> Result<Interaction, StoreError> {
        Ok(self.state.write().insert_interaction(cmd, true))
    }

    async fn mark_active_as_complete(
        &self,
        id: &str,
        content: &str,
    ) -> Result<Interaction, StoreError> {
        let mut state = self.state.write();
        let interaction = state.interaction_mut(id)?;
        if interaction.is_terminal() {
            return Err(StoreError::AlreadyTerminal { id: id.to_string() });
        }
        let now = Utc::now();
        interaction.message_content = content.to_string();
        interaction.completed_at = Some(now);
        interaction.updated_at = now;
        Ok(interaction.clone())
    }

    async fn add_error(&self, id: &str, error: StructuredError) -> Result<Interaction, StoreError> {
        let mut state = self.state.write();
        let interaction = state.interaction_mut(id)?;
        if interaction.is_terminal() {
            return Err(StoreError::AlreadyTerminal { id: id.to_string() });
        }
        interaction.errors.push(error);
        interaction.updated_at = Utc::now();
        Ok(interaction.clone())
    }

    async fn get_interaction(&self, id: &str) -> Result<Interaction, StoreError> {
        self.state.read().interaction(id).cloned()
    }

    async fn get_all_by_conversation_id(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<Interaction>, StoreError> {
        Ok(self
            .state
            .read()
            .interactions
            .values()
            .filter(|i| i.conversation_id == conversation_id && i.deleted_at.is_none())
            .cloned()
            .collect())
    }

    async fn conversation_has_interactions(
        &self,
        conversation_id: &str,
    ) -> Result<bool, StoreError> {
        Ok(self
            .state
            .read()
            .interactions
            .values()
            .any(|i| i.conversation_id == conversation_id && i.deleted_at.is_none()))
    }

    async fn update_excluded_state(
        &self,
        id: &str,
        excluded: bool,
    ) -> Result<Interaction, StoreError> {
        let mut state = self.state.write();
        let interaction = state.interaction_mut(id)?;
        if interaction.deleted_at.is_some() {
            return Err(StoreError::NotFound {
                entity: "interaction",
                id: id.to_string(),
            });
        }
        let now = Utc::now();
        interaction.marked_as_excluded_at = excluded.then_some(now);
        interaction.updated_at = now;
        Ok(interaction.clone())
    }

    async fn delete_interactions(&self, ids: &[String]) -> Result<usize, StoreError> {
        let mut state = self.state.write();
        let seqs: Vec<u64> = ids
            .iter()
            .filter_map(|id| state.interaction_ids.get(id).copied())
            .collect();
        Ok(state.soft_delete(&seqs))
    }

    async fn delete_interactions_by_conversation_id(
        &self,
        conversation_id: &str,
    ) -> Result<usize, StoreError> {
        let mut state = self.state.write();
        let seqs: Vec<u64> = state
            .interactions
            .iter()
            .filter(|(_, i)| i.conversation_id == conversation_id)
            .map(|(seq, _)| *seq)
            .collect();
        Ok(state.soft_delete(&seqs))
    }
}

#[async_trait]
impl SkillSetStore for MemoryStore {
    async fn get_many_skill_sets(
        &self,
        ids: &[String],
        owner: &Actor,
    ) -> Result<Vec<SkillSet>, StoreError> {
        let state = self.state.read();
        Ok(ids
            .iter()
            .filter_map(|id| state.skill_sets.get(id))
            .filter(|s| &s.owner == owner)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl FileStore for MemoryStore {
    async fn get_many_files(
        &self,
        ids: &[String],
        owner: &Actor,
    ) -> Result<Vec<FileAttachment>, StoreError> {
        let state = self.state.read();
        Ok(ids
            .iter()
            .filter_map(|id| state.files.get(id))
            .filter(|(file_owner, _)| file_owner == owner)
            .map(|(_, file)| file.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::codes;
    use crate::models::{AiRelayOptions, InteractionState};
    use pretty_assertions::assert_eq;
    use tokio_test::assert_ok;

    fn input(conversation_id: &str, key: &str, text: &str) -> CreateInteraction {
        CreateInteraction {
            idempotency_key: key.to_string(),
            conversation_id: conversation_id.to_string(),
            message_content: text.to_string(),
            file_ids: Vec::new(),
            skill_set_ids: Vec::new(),
            owner: Actor::user("u1"),
            ai_relay_options: None,
        }
    }

    #[tokio::test]
    async fn test_conversation_create_is_idempotent() {
        let store = MemoryStore::new();
        let cmd = CreateConversation {
            idempotency_key: "k1".to_string(),
            owner: Actor::user("u1"),
            ai_relay_options: AiRelayOptions::new("demo", "m1"),
        };

        let a = store.create_conversation(cmd.clone()).await.unwrap();
        let b = store.create_conversation(cmd.clone()).await.unwrap();
        assert_eq!(a.id, b.id);

        let other_owner = CreateConversation {
            owner: Actor::user("u2"),
            ..cmd
        };
        let c = store.create_conversation(other_owner).await.unwrap();
        assert_ne!(a.id, c.id);

        let titled = store.update_title(&a.id, "Greetings").await.unwrap();
        assert_eq!(titled.title.as_deref(), Some("Greetings"));
    }

    #[tokio::test]
    async fn test_interaction_create_is_idempotent() {
        let store = MemoryStore::new();

        let a = store.create_interaction(input("c1", "k1", "hello")).await.unwrap();
        let b = store.create_interaction(input("c1", "k1", "hello")).await.unwrap();

        assert_eq!(a.id, b.id);
        assert_eq!(store.interaction_count(), 1);
        assert_eq!(a.state(), InteractionState::Completed);
        assert!(assert_ok!(store.conversation_has_interactions("c1").await));
        assert!(!assert_ok!(store.conversation_has_interactions("c2").await));
    }

    #[tokio::test]
    async fn test_single_terminal_transition() {
        let store = MemoryStore::new();

        let done = store
            .create_active_interaction(input("c1", "k1-response", "ignored"))
            .await
            .unwrap();
        assert_eq!(done.message_content, "");
        assert_eq!(done.state(), InteractionState::Pending);

        let completed = store.mark_active_as_complete(&done.id, "hello").await.unwrap();
        assert_eq!(completed.message_content, "hello");
        assert_eq!(
            store.mark_active_as_complete(&done.id, "again").await,
            Err(StoreError::AlreadyTerminal { id: done.id.clone() })
        );
        assert!(store
            .add_error(&done.id, StructuredError::unknown("late"))
            .await
            .is_err());

        let failed = store
            .create_active_interaction(input("c1", "k2-response", ""))
            .await
            .unwrap();
        let failed = store
            .add_error(&failed.id, StructuredError::new(codes::AI_MODEL_NOT_FOUND))
            .await
            .unwrap();
        assert_eq!(failed.state(), InteractionState::Failed);
        assert!(store.mark_active_as_complete(&failed.id, "x").await.is_err());
        assert_eq!(
            store
                .add_error(&failed.id, StructuredError::new(codes::GENERATION_TIMED_OUT))
                .await,
            Err(StoreError::AlreadyTerminal { id: failed.id.clone() })
        );
        assert_eq!(store.get_interaction(&failed.id).await.unwrap().errors.len(), 1);
    }

    #[tokio::test]
    async fn test_interactions_in_creation_order() {
        let store = MemoryStore::new();
        for (key, text) in [("k1", "one"), ("k2", "two"), ("k3", "three")] {
            store.create_interaction(input("c1", key, text)).await.unwrap();
        }
        store.create_interaction(input("c2", "k1", "elsewhere")).await.unwrap();

        let all = store.get_all_by_conversation_id("c1").await.unwrap();
        let texts: Vec<&str> = all.iter().map(|i| i.message_content.as_str()).collect();
        assert_eq!(texts, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_excluded_state_toggles() {
        let store = MemoryStore::new();
        let i = store.create_interaction(input("c1", "k1", "x")).await.unwrap();

        assert!(store.update_excluded_state(&i.id, true).await.unwrap().is_excluded());
        assert!(!store.update_excluded_state(&i.id, false).await.unwrap().is_excluded());
        assert!(matches!(
            store.update_excluded_state("missing", true).await,
            Err(StoreError::NotFound { entity: "interaction", .. })
        ));
    }

    #[tokio::test]
    async fn test_conversations_listed_by_owner_in_creation_order() {
        let store = MemoryStore::new();
        for (key, owner) in [("a", "u1"), ("b", "u2"), ("c", "u1")] {
            store
                .create_conversation(CreateConversation {
                    idempotency_key: key.to_string(),
                    owner: Actor::user(owner),
                    ai_relay_options: AiRelayOptions::new("demo", "m1"),
                })
                .await
                .unwrap();
        }

        let keys: Vec<String> = store
            .list_by_owner(&Actor::user("u1"))
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.idempotency_key)
            .collect();
        assert_eq!(keys, vec!["a".to_string(), "c".to_string()]);
        assert!(store.list_by_owner(&Actor::user("u3")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deletes_are_soft() {
        let store = MemoryStore::new();
        let conversation = store
            .create_conversation(CreateConversation {
                idempotency_key: "k".to_string(),
                owner: Actor::user("u1"),
                ai_relay_options: AiRelayOptions::new("demo", "m1"),
            })
            .await
            .unwrap();
        let first = store
            .create_interaction(input(&conversation.id, "k1", "one"))
            .await
            .unwrap();
        store
            .create_interaction(input(&conversation.id, "k2", "two"))
            .await
            .unwrap();

        let ids = vec![first.id.clone(), "unknown".to_string()];
        assert_eq!(store.delete_interactions(&ids).await.unwrap(), 1);
        assert_eq!(store.delete_interactions(&ids).await.unwrap(), 0);
        assert!(matches!(
            store.get_interaction(&first.id).await,
            Err(StoreError::NotFound { entity: "interaction", .. })
        ));
        assert!(store.update_excluded_state(&first.id, true).await.is_err());
        let texts: Vec<String> = store
            .get_all_by_conversation_id(&conversation.id)
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.message_content)
            .collect();
        assert_eq!(texts, vec!["two".to_string()]);

        let ids = vec![conversation.id.clone()];
        assert_eq!(store.delete_conversations(&ids).await.unwrap(), 1);
        assert_eq!(store.delete_conversations(&ids).await.unwrap(), 0);
        assert_eq!(
            store
                .delete_interactions_by_conversation_id(&conversation.id)
                .await
                .unwrap(),
            1
        );
        assert!(store.get_conversation(&conversation.id).await.is_err());
        assert!(store.list_by_owner(&Actor::user("u1")).await.unwrap().is_empty());
        assert!(!store
            .conversation_has_interactions(&conversation.id)
            .await
            .unwrap());

        // Records are kept
        assert_eq!(store.interaction_count(), 2);
    }

    #[tokio::test]
    async fn test_lookups_are_owner_scoped() {
        let store = MemoryStore::new();
        store.insert_skill_set(SkillSet {
            id: "s1".to_string(),
            name: "Rust".to_string(),
            prompt: "Answer in Rust".to_string(),
            owner: Actor::user("u1"),
        });
        store.insert_file(
            Actor::user("u1"),
            FileAttachment {
                id: "f1".to_string(),
                name: "notes.txt".to_string(),
                mime_type: "text/plain".to_string(),
                content: "notes".to_string(),
            },
        );
        let ids = vec!["s1".to_string(), "f1".to_string(), "unknown".to_string()];

        assert_eq!(store.get_many_skill_sets(&ids, &Actor::user("u1")).await.unwrap().len(), 1);
        assert!(store.get_many_skill_sets(&ids, &Actor::user("u2")).await.unwrap().is_empty());
        assert_eq!(store.get_many_files(&ids, &Actor::user("u1")).await.unwrap().len(), 1);
        assert!(store.get_many_files(&ids, &Actor::user("u2")).await.unwrap().is_empty());
    }
}
