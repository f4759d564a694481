//! Shared HTTP plumbing for providers.

use futures::StreamExt;
use serde::Deserialize;

use super::traits::ByteStream;
use crate::error::ProviderError;

/// Error bodies as returned by Ollama (`{"error": "..."}`) and OpenAI
/// (`{"error": {"message": "..."}}`)
#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ErrorDetail {
    Text(String),
    Object { message: String },
}

/// Map a dispatch failure onto a provider error
pub(crate) fn send_error(provider: &str, err: &reqwest::Error) -> ProviderError {
    if err.is_connect() || err.is_timeout() || err.is_request() {
        ProviderError::Unreachable {
            provider: provider.to_string(),
            message: err.to_string(),
        }
    } else {
        ProviderError::Transport {
            provider: provider.to_string(),
            message: err.to_string(),
        }
    }
}

/// Turn a non-success response into a status error, keeping the code
pub(crate) async fn status_error(provider: &str, response: reqwest::Response) -> ProviderError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    ProviderError::Status {
        provider: provider.to_string(),
        status,
        message: error_message(&body),
    }
}

/// Extract the human-readable message from an error body
pub(crate) fn error_message(body: &str) -> String {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody {
            error: ErrorDetail::Text(message) | ErrorDetail::Object { message },
        }) => message,
        Err(_) => body.trim().to_string(),
    }
}

/// Body of a streaming response as a [`ByteStream`]
pub(crate) fn byte_stream(provider: &str, response: reqwest::Response) -> ByteStream {
    let provider = provider.to_string();
    Box::pin(response.bytes_stream().map(move |chunk| {
        chunk.map_err(|e| ProviderError::Transport {
            provider: provider.clone(),
            message: e.to_string(),
        })
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_message_shapes() {
        assert_eq!(error_message(r#"{"error":"model 'x' not found"}"#), "model 'x' not found");
        assert_eq!(
            error_message(r#"{"error":{"message":"bad key","type":"auth"}}"#),
            "bad key"
        );
        assert_eq!(error_message("  gateway down\n"), "gateway down");
    }
}
