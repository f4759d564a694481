//! Relay - Provider Registry
//!
//! Maps provider ids to providers. Lookups never fail: an unknown id yields a
//! stand-in whose every operation returns [`ProviderError::MissingProvider`],
//! so call sites never deal with an absent provider.
//!
//! Every registered provider is wrapped in a [`TracingProvider`] on the way
//! in; callers always talk to the traced version.

mod trace;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;

pub use trace::{
    LogTracer, NoopTracer, Trace, TraceAttributes, TraceOutcome, Tracer, TracingProvider,
};

use crate::error::ProviderError;
use crate::provider::{BoxChatStream, ChatStreamParams, Model, Provider, ProviderMetadata};

/// Model listing that tolerates failing providers
#[derive(Debug, Default)]
pub struct ModelListing {
    /// Models of the providers that answered
    pub models: Vec<Model>,
    /// Providers that failed, with their error
    pub failures: Vec<(String, ProviderError)>,
}

/// Registry of model providers
#[derive(Clone)]
pub struct RelayClient {
    providers: BTreeMap<String, Arc<dyn Provider>>,
    tracer: Arc<dyn Tracer>,
}

impl Default for RelayClient {
    fn default() -> Self {
        Self::new(Arc::new(LogTracer))
    }
}

impl RelayClient {
    /// Create an empty registry tracing through `tracer`
    #[must_use]
    pub fn new(tracer: Arc<dyn Tracer>) -> Self {
        Self {
            providers: BTreeMap::new(),
            tracer,
        }
    }

    /// Register a provider under its metadata id
    ///
    /// A provider registered under an existing id replaces it.
    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        let id = provider.metadata().id;
        let traced: Arc<dyn Provider> =
            Arc::new(TracingProvider::new(provider, Arc::clone(&self.tracer)));
        if self.providers.insert(id.clone(), traced).is_some() {
            tracing::warn!(provider_id = %id, "Provider replaced");
        } else {
            tracing::info!(provider_id = %id, "Provider registered");
        }
    }

    /// Builder-style [`RelayClient::register`]
    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.register(provider);
        self
    }

    /// Provider registered under `provider_id`, or a stand-in that fails
    /// every call with [`ProviderError::MissingProvider`]
    #[must_use]
    pub fn with(&self, provider_id: &str) -> Arc<dyn Provider> {
        match self.providers.get(provider_id) {
            Some(provider) => Arc::clone(provider),
            None => Arc::new(MissingProvider {
                provider_id: provider_id.to_string(),
            }),
        }
    }

    /// Whether a provider is registered under `provider_id`
    #[must_use]
    pub fn has_provider(&self, provider_id: &str) -> bool {
        self.providers.contains_key(provider_id)
    }

    /// Metadata of every registered provider, ordered by id
    #[must_use]
    pub fn providers(&self) -> Vec<ProviderMetadata> {
        self.providers.values().map(|p| p.metadata()).collect()
    }

    /// Models of every provider
    ///
    /// # Errors
    ///
    /// Fails entirely with the first provider error; no partial result.
    pub async fn list_all_models(&self) -> Result<Vec<Model>, ProviderError> {
        let listings = join_all(self.providers.values().map(|p| p.list_models())).await;
        let mut models = Vec::new();
        for listing in listings {
            models.extend(listing?);
        }
        Ok(models)
    }

    /// Models of every provider that answered
    pub async fn list_all_models_best_effort(&self) -> ModelListing {
        let listings = join_all(
            self.providers
                .iter()
                .map(|(id, p)| async move { (id.clone(), p.list_models().await) }),
        )
        .await;

        let mut result = ModelListing::default();
        for (id, listing) in listings {
            match listing {
                Ok(models) => result.models.extend(models),
                Err(err) => {
                    tracing::warn!(provider_id = %id, error = %err, "Model listing failed");
                    result.failures.push((id, err));
                }
            }
        }
        result
    }
}

/// Stand-in for an unregistered provider id
struct MissingProvider {
    provider_id: String,
}

impl MissingProvider {
    fn error(&self) -> ProviderError {
        ProviderError::MissingProvider {
            provider_id: self.provider_id.clone(),
        }
    }
}

#[async_trait]
impl Provider for MissingProvider {
    fn metadata(&self) -> ProviderMetadata {
        ProviderMetadata {
            id: self.provider_id.clone(),
            name: String::new(),
        }
    }

    async fn list_models(&self) -> Result<Vec<Model>, ProviderError> {
        Err(self.error())
    }

    async fn new_chat_stream(
        &self,
        _params: &ChatStreamParams,
    ) -> Result<BoxChatStream, ProviderError> {
        Err(self.error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ScriptedProvider, ScriptedReply};
    use pretty_assertions::assert_eq;

    fn relay() -> RelayClient {
        RelayClient::new(Arc::new(NoopTracer))
            .with_provider(Arc::new(
                ScriptedProvider::new("demo", ScriptedReply::fragments(&["hi"]))
                    .with_name("Demo")
                    .with_model("m1")
                    .with_model("m2"),
            ))
            .with_provider(Arc::new(
                ScriptedProvider::new("other", ScriptedReply::fragments(&["hi"])).with_model("x"),
            ))
    }

    fn unreachable(provider: &str) -> ProviderError {
        ProviderError::Unreachable {
            provider: provider.to_string(),
            message: "connection refused".to_string(),
        }
    }

    #[tokio::test]
    async fn test_unknown_provider_is_missing() {
        let relay = relay();
        let provider = relay.with("nope");

        assert!(!relay.has_provider("nope"));
        let err = provider
            .new_chat_stream(&ChatStreamParams::default())
            .await
            .err()
            .unwrap();
        assert!(err.is_missing_provider());
        assert!(provider.list_models().await.unwrap_err().is_missing_provider());
        assert!(provider
            .complete(&ChatStreamParams::default())
            .await
            .unwrap_err()
            .is_missing_provider());
    }

    #[tokio::test]
    async fn test_registered_provider_is_resolved() {
        let relay = relay();
        assert!(relay.has_provider("demo"));
        assert_eq!(relay.with("demo").metadata().name, "Demo");

        let names: Vec<String> = relay.providers().into_iter().map(|p| p.id).collect();
        assert_eq!(names, vec!["demo".to_string(), "other".to_string()]);
    }

    #[tokio::test]
    async fn test_list_all_models() {
        let models = relay().list_all_models().await.unwrap();
        let ids: Vec<&str> = models.iter().map(|m| m.model_id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2", "x"]);
    }

    #[tokio::test]
    async fn test_list_all_models_fails_entirely() {
        let relay = relay().with_provider(Arc::new(
            ScriptedProvider::new("down", ScriptedReply::Stall)
                .with_list_error(unreachable("down")),
        ));

        assert_eq!(relay.list_all_models().await, Err(unreachable("down")));

        let listing = relay.list_all_models_best_effort().await;
        assert_eq!(listing.models.len(), 3);
        assert_eq!(listing.failures, vec![("down".to_string(), unreachable("down"))]);
    }
}
