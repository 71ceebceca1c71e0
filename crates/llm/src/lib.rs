pub mod model;
pub mod provider;
pub mod rig_adapter;
pub mod wire;

use std::sync::Arc;

use snafu::ensure;

pub use model::{
    DEFAULT_OPENROUTER_MODEL, DEFAULT_TEMPERATURE, Model, ModelCache, ModelCatalog,
    ModelCatalogSource, default_openrouter_models,
};
pub use provider::{
    BoxFuture, Completion, CompletionRequest, FailureKind, LlmProvider, ProviderConfig,
    ProviderError, ProviderEventStream, ProviderFailure, ProviderResult, ProviderStreamHandle,
    ProviderWorker, StreamEventMapped, StreamEventPayload, StreamTarget, make_event_stream,
};
pub use rig_adapter::{
    OPENAI_PROVIDER_ID, OPENROUTER_ENDPOINT, OPENROUTER_PROVIDER_ID, RigProviderAdapter,
};
pub use wire::{WireMessage, WireRole};

/// Builds the provider variant named by `config.provider_id`.
/// A blank endpoint on the `openrouter` variant resolves to the public OpenRouter URL.
pub fn create_provider(mut config: ProviderConfig) -> ProviderResult<Arc<dyn LlmProvider>> {
    ensure!(
        matches!(
            config.provider_id.as_str(),
            OPENROUTER_PROVIDER_ID | OPENAI_PROVIDER_ID
        ),
        provider::UnsupportedProviderSnafu {
            stage: "create-provider",
            provider_id: config.provider_id.clone(),
        }
    );

    if config.provider_id == OPENROUTER_PROVIDER_ID && config.endpoint.is_empty() {
        config.endpoint = OPENROUTER_ENDPOINT.to_string();
    }

    tracing::debug!(
        provider_id = %config.provider_id,
        endpoint = %config.endpoint,
        "creating llm provider"
    );
    Ok(Arc::new(RigProviderAdapter::new(config)?))
}

/// Sends one tiny completion with the provider defaults; any failure reads as disconnected.
pub async fn test_connection(provider: &dyn LlmProvider) -> bool {
    let (model, temperature) = provider.resolve_parameters(None, None);
    let request = CompletionRequest::new(
        StreamTarget(0),
        model,
        temperature,
        vec![WireMessage::user("Hello")],
    )
    .with_max_tokens(8);

    match provider.complete(request).await {
        Ok(_) => true,
        Err(error) => {
            tracing::warn!(
                provider_id = %provider.id(),
                error = %error,
                "connection probe failed"
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_provider_ids_are_rejected() {
        let result = create_provider(ProviderConfig::new("bedrock", "key", ""));
        assert!(matches!(
            result,
            Err(ProviderError::UnsupportedProvider { .. })
        ));
    }

    #[test]
    fn openrouter_gets_its_default_endpoint_and_model() {
        let provider = create_provider(
            ProviderConfig::new("openrouter", "key", "").with_default_temperature(0.2),
        )
        .expect("provider");
        assert_eq!(provider.id(), "openrouter");
        assert_eq!(provider.name(), "OpenRouter");
        assert_eq!(provider.default_model(), DEFAULT_OPENROUTER_MODEL);
        assert_eq!(provider.default_temperature(), 0.2);
    }

    #[test]
    fn missing_key_surfaces_before_any_request() {
        let result = create_provider(ProviderConfig::new("openai", "", ""));
        assert!(matches!(result, Err(ProviderError::MissingApiKey { .. })));
    }
}
