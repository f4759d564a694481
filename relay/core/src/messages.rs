//! Stream Messages
//!
//! Messages pushed to subscribers over the broadcaster. Every message carries
//! the channel it belongs to; subscribers filter on `channel_id` themselves.
//!
//! # Channels
//!
//! - `<conversation_id>/<interaction_id>`: reply to one interaction
//! - `<conversation_id>/title`: title generation for a conversation
//!
//! # Wire shape
//!
//! ```json
//! {"channel_id": "c1/i2", "type": "message_fragment",
//!  "message_full": null, "message_fragment": "Hel", "error": null}
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::StructuredError;

/// Suffix of the title channel
const TITLE_CHANNEL: &str = "title";

/// Identifier subscribers use to pick their messages out of the broadcast
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    /// Channel carrying the reply to an interaction
    #[must_use]
    pub fn for_interaction(conversation_id: &str, interaction_id: &str) -> Self {
        Self(format!("{conversation_id}/{interaction_id}"))
    }

    /// Channel carrying the generated title of a conversation
    #[must_use]
    pub fn title(conversation_id: &str) -> Self {
        Self(format!("{conversation_id}/{TITLE_CHANNEL}"))
    }

    /// Borrow as string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of a stream message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamMessageType {
    /// The whole text at once (non-streaming replies, titles on request)
    MessageFull,
    /// One fragment of a streamed reply
    MessageFragment,
    /// Generation failed
    Error,
}

/// A message published to every subscriber
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamMessage {
    /// Channel this message belongs to
    pub channel_id: ChannelId,
    /// Message kind; decides which payload field is set
    #[serde(rename = "type")]
    pub message_type: StreamMessageType,
    /// Whole text (`message_full` only)
    pub message_full: Option<String>,
    /// Fragment (`message_fragment` only)
    pub message_fragment: Option<String>,
    /// Error (`error` only)
    pub error: Option<StructuredError>,
}

impl StreamMessage {
    /// Whole-text message
    pub fn full(channel_id: ChannelId, content: impl Into<String>) -> Self {
        Self {
            channel_id,
            message_type: StreamMessageType::MessageFull,
            message_full: Some(content.into()),
            message_fragment: None,
            error: None,
        }
    }

    /// Fragment message
    pub fn fragment(channel_id: ChannelId, fragment: impl Into<String>) -> Self {
        Self {
            channel_id,
            message_type: StreamMessageType::MessageFragment,
            message_full: None,
            message_fragment: Some(fragment.into()),
            error: None,
        }
    }

    /// Error message
    #[must_use]
    pub fn error(channel_id: ChannelId, error: StructuredError) -> Self {
        Self {
            channel_id,
            message_type: StreamMessageType::Error,
            message_full: None,
            message_fragment: None,
            error: Some(error),
        }
    }
}
