//! Prompt Assembly
//!
//! Builds the message list for a reply, in this order:
//!
//! 1. the configured system prompt, if any
//! 2. one instruction message per requested skill set
//! 3. every completed, non-excluded interaction of the conversation in
//!    creation order, with attached file contents appended to its text

use std::collections::HashMap;

use crate::error::RelayError;
use crate::models::{ActorType, Conversation, FileAttachment, Interaction, SkillSet};
use crate::provider::ChatMessage;

use super::Stores;

/// Prefix of the message carrying a skill-set prompt
pub const SKILL_SET_PREAMBLE: &str =
    "Use the following instructions to guide your responses or to learn more context about the subject: ";

/// Message injected for a skill set
#[must_use]
pub fn skill_set_message(skill_set: &SkillSet) -> ChatMessage {
    ChatMessage::user(format!("{SKILL_SET_PREAMBLE}{}", skill_set.prompt))
}

/// Whether an interaction belongs in a prompt
#[must_use]
pub fn is_prompt_visible(interaction: &Interaction) -> bool {
    interaction.is_completed() && !interaction.is_excluded()
}

/// Assemble a prompt from already loaded records
///
/// `files` maps file ids to their resolved content; ids missing from the map
/// are skipped.
#[must_use]
pub fn build_messages(
    system_prompt: Option<&str>,
    skill_sets: &[SkillSet],
    interactions: &[Interaction],
    files: &HashMap<String, FileAttachment>,
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(1 + skill_sets.len() + interactions.len());

    if let Some(prompt) = system_prompt.filter(|p| !p.trim().is_empty()) {
        messages.push(ChatMessage::system(prompt));
    }

    messages.extend(skill_sets.iter().map(skill_set_message));

    for interaction in interactions.iter().filter(|i| is_prompt_visible(i)) {
        let content = with_attachments(interaction, files);
        messages.push(match interaction.owner.actor_type {
            ActorType::User => ChatMessage::user(content),
            ActorType::Bot => ChatMessage::assistant(content),
        });
    }

    messages
}

fn with_attachments(interaction: &Interaction, files: &HashMap<String, FileAttachment>) -> String {
    let mut content = interaction.message_content.clone();
    for file in interaction.file_ids.iter().filter_map(|id| files.get(id)) {
        content.push_str("\n\n--- ");
        content.push_str(&file.name);
        content.push_str(" ---\n");
        content.push_str(&file.content);
    }
    content
}

/// Load everything a reply prompt needs and assemble it
///
/// Skill sets are resolved for the input interaction's owner, attachments for
/// the conversation owner.
///
/// # Errors
///
/// Returns the first store error.
pub async fn load_prompt(
    stores: &Stores,
    system_prompt: Option<&str>,
    conversation: &Conversation,
    input: &Interaction,
) -> Result<Vec<ChatMessage>, RelayError> {
    let interactions = stores
        .interactions
        .get_all_by_conversation_id(&conversation.id)
        .await?;

    let skill_sets = if input.skill_set_ids.is_empty() {
        Vec::new()
    } else {
        stores
            .skill_sets
            .get_many_skill_sets(&input.skill_set_ids, &input.owner)
            .await?
    };

    let file_ids: Vec<String> = interactions
        .iter()
        .filter(|i| is_prompt_visible(i))
        .flat_map(|i| i.file_ids.iter().cloned())
        .collect();
    let files = if file_ids.is_empty() {
        HashMap::new()
    } else {
        stores
            .files
            .get_many_files(&file_ids, &conversation.owner)
            .await?
            .into_iter()
            .map(|f| (f.id.clone(), f))
            .collect()
    };

    Ok(build_messages(
        system_prompt,
        &skill_sets,
        &interactions,
        &files,
    ))
}
