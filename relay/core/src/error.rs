//! Error Types
//!
//! Errors fall into three groups:
//!
//! - **Validation** errors raised synchronously by the pipeline entry points
//!   (ownership mismatch, unknown provider). They carry a [`StructuredError`].
//! - **Generation** errors raised by providers while a reply is produced in the
//!   background. They are coerced into a [`StructuredError`], persisted on the
//!   response interaction and broadcast on its channel.
//! - **Faults** inside background jobs (panics, timeouts), see
//!   [`crate::tasks::JobError`].
//!
//! [`StructuredError`] is the only error shape that leaves the process: it is
//! what subscribers receive in `error` stream events and what the error log of
//! an interaction contains.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Well-known structured error codes
pub mod codes {
    /// The requesting actor does not own the conversation
    pub const INVALID_OWNER: &str = "invalid_owner";
    /// The backend does not know the requested model
    pub const AI_MODEL_NOT_FOUND: &str = "ai_model_not_found";
    /// The backend could not be reached
    pub const AI_PROVIDER_UNREACHABLE: &str = "ai_provider_unreachable";
    /// No provider is registered under the requested id
    pub const REQUIRED_PROVIDER_MISSING: &str = "required_provider_missing";
    /// A background generation unit faulted (panic or persistence failure)
    pub const GENERATION_FAULT: &str = "generation_fault";
    /// A background generation unit exceeded its time bound
    pub const GENERATION_TIMED_OUT: &str = "generation_timed_out";
    /// The work was cancelled
    pub const CONTEXT_CANCELED: &str = "context_canceled";
    /// Anything that could not be classified
    pub const UNKNOWN: &str = "unknown";
}

/// Serializable error with a machine-readable code
///
/// Wire shape: `{"code": "...", "meta": {...}, "reasons": [...]}` where `meta`
/// and `reasons` are omitted when empty.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{code}")]
pub struct StructuredError {
    /// Machine-readable error code (snake_case)
    pub code: String,
    /// Additional context (e.g. `model_id`)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, Value>,
    /// Underlying causes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<StructuredError>,
}

impl StructuredError {
    /// Create an error with a code and no metadata
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            meta: BTreeMap::new(),
            reasons: Vec::new(),
        }
    }

    /// Attach a metadata entry
    #[must_use]
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    /// Attach an underlying cause
    #[must_use]
    pub fn with_reason(mut self, reason: StructuredError) -> Self {
        self.reasons.push(reason);
        self
    }

    /// Error for anything that has no dedicated code
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(codes::UNKNOWN).with_meta("message", message.into())
    }

    /// Read a string metadata entry
    #[must_use]
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.meta.get(key).and_then(Value::as_str)
    }

    /// Whether the error originates on our side rather than the caller's
    ///
    /// Mirrors a 5xx status: these are logged at error level.
    #[must_use]
    pub fn is_server_side(&self) -> bool {
        matches!(
            self.code.as_str(),
            codes::UNKNOWN
                | codes::GENERATION_FAULT
                | codes::GENERATION_TIMED_OUT
                | codes::AI_PROVIDER_UNREACHABLE
        )
    }
}

/// Errors produced by model providers
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// No provider is registered under the requested id
    #[error("required provider is missing: {provider_id}")]
    MissingProvider {
        /// The id that was requested
        provider_id: String,
    },

    /// The backend could not be reached at all
    #[error("{provider} is unreachable: {message}")]
    Unreachable {
        /// Provider id
        provider: String,
        /// Transport error description
        message: String,
    },

    /// The backend answered with a non-success status
    #[error("{provider} returned {status}: {message}")]
    Status {
        /// Provider id
        provider: String,
        /// HTTP status code
        status: u16,
        /// Error message extracted from the body
        message: String,
    },

    /// The backend reported an error inside the stream
    #[error("{provider} reported an error: {message}")]
    Api {
        /// Provider id
        provider: String,
        /// Error message
        message: String,
    },

    /// The byte stream broke after the request was accepted
    #[error("{provider} stream interrupted: {message}")]
    Transport {
        /// Provider id
        provider: String,
        /// Transport error description
        message: String,
    },

    /// A payload could not be decoded
    #[error("failed to decode {provider} payload: {message}")]
    Decode {
        /// Provider id
        provider: String,
        /// Decoder error description
        message: String,
    },
}

impl ProviderError {
    /// Whether this is the stub provider's "required provider missing" error
    #[must_use]
    pub fn is_missing_provider(&self) -> bool {
        matches!(self, Self::MissingProvider { .. })
    }

    /// Whether the backend answered 404 (unknown model)
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Status { status: 404, .. })
    }
}

/// Errors produced by persistence collaborators
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum StoreError {
    /// No record with this id
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Record kind (`conversation`, `interaction`, ...)
        entity: &'static str,
        /// Requested id
        id: String,
    },

    /// The interaction already completed or failed
    #[error("interaction {id} already reached a terminal state")]
    AlreadyTerminal {
        /// Interaction id
        id: String,
    },

    /// Backend-specific failure
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Top-level error of the relay pipeline
#[derive(Debug, Error)]
pub enum RelayError {
    /// Validation or already-coerced error
    #[error(transparent)]
    Structured(#[from] StructuredError),

    /// Provider failure
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Persistence failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Stream payload could not be encoded
    #[error("failed to encode stream message: {0}")]
    Encode(#[from] serde_json::Error),
}

impl RelayError {
    /// Coerce into the structured shape sent to subscribers
    #[must_use]
    pub fn to_structured(&self) -> StructuredError {
        match self {
            Self::Structured(e) => e.clone(),
            Self::Provider(e) => StructuredError::from(e),
            Self::Store(StoreError::NotFound { entity, id }) => {
                StructuredError::new(format!("{entity}_not_found"))
                    .with_meta(format!("{entity}_id"), id.clone())
            }
            Self::Store(e) => StructuredError::unknown(e.to_string()),
            Self::Encode(e) => StructuredError::unknown(e.to_string()),
        }
    }
}

impl From<&ProviderError> for StructuredError {
    fn from(err: &ProviderError) -> Self {
        match err {
            ProviderError::MissingProvider { provider_id } => {
                StructuredError::new(codes::REQUIRED_PROVIDER_MISSING)
                    .with_meta("provider_id", provider_id.clone())
            }
            ProviderError::Unreachable { provider, message } => {
                StructuredError::new(codes::AI_PROVIDER_UNREACHABLE)
                    .with_meta("provider_id", provider.clone())
                    .with_reason(StructuredError::unknown(message.clone()))
            }
            other => StructuredError::unknown(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structured_error_wire_shape() {
        let err = StructuredError::new(codes::AI_MODEL_NOT_FOUND).with_meta("model_id", "m1");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"code": "ai_model_not_found", "meta": {"model_id": "m1"}})
        );

        let bare = serde_json::to_value(StructuredError::new("invalid_owner")).unwrap();
        assert_eq!(bare, serde_json::json!({"code": "invalid_owner"}));
    }

    #[test]
    fn test_missing_provider_is_distinguishable() {
        let missing = ProviderError::MissingProvider {
            provider_id: "nope".to_string(),
        };
        let status = ProviderError::Status {
            provider: "ollama".to_string(),
            status: 404,
            message: "model not found".to_string(),
        };

        assert!(missing.is_missing_provider());
        assert!(!status.is_missing_provider());
        assert!(status.is_not_found());
        assert_eq!(
            StructuredError::from(&missing).code,
            codes::REQUIRED_PROVIDER_MISSING
        );
    }

    #[test]
    fn test_store_not_found_coercion() {
        let err = RelayError::from(StoreError::NotFound {
            entity: "conversation",
            id: "c1".to_string(),
        });
        let structured = err.to_structured();
        assert_eq!(structured.code, "conversation_not_found");
        assert_eq!(structured.meta_str("conversation_id"), Some("c1"));
    }
}
