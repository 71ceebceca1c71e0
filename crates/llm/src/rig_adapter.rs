use std::collections::HashSet;
use std::sync::Arc;

use futures::StreamExt;
use rig::completion::{
    AssistantContent, CompletionError, CompletionModel, CompletionRequestBuilder,
    Message as RigMessage,
};
use rig::http_client::{self, HttpClientExt, NoBody};
use rig::prelude::CompletionClient;
use rig::providers::openai;
use rig::streaming::StreamedAssistantContent;
use serde::Deserialize;
use snafu::{ResultExt, ensure};
use tokio::sync::{mpsc, oneshot};

use super::model::{
    DEFAULT_OPENROUTER_MODEL, DEFAULT_TEMPERATURE, Model, ModelCache, ModelCatalog,
    default_openrouter_models,
};
use super::provider::{
    BoxFuture, Completion, CompletionRequest, EmptyMessageSetSnafu, FailureKind, HttpClientSnafu,
    LlmProvider, MissingApiKeySnafu, ModelFetchStatusSnafu, ModelPayloadParseSnafu,
    ProviderConfig, ProviderError, ProviderFailure, ProviderResult, ProviderStreamHandle,
    ProviderWorker, StreamEventMapped, StreamEventPayload, StreamTarget, make_event_stream,
};
use super::wire::{WireMessage, WireRole};

pub const OPENROUTER_PROVIDER_ID: &str = "openrouter";
pub const OPENAI_PROVIDER_ID: &str = "openai";
pub const OPENROUTER_ENDPOINT: &str = "https://openrouter.ai/api/v1";

type RigStreamingResponse = rig::streaming::StreamingCompletionResponse<
    rig::providers::openai::responses_api::streaming::StreamingCompletionResponse,
>;

/// OpenAI-compatible chat provider (OpenRouter by default) backed by rig.
pub struct RigProviderAdapter {
    config: ProviderConfig,
    display_name: String,
    fallback_models: Vec<Model>,
    model_cache: Arc<ModelCache>,
}

impl RigProviderAdapter {
    pub fn new(config: ProviderConfig) -> ProviderResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "rig-adapter-new",
                provider_id: config.provider_id.clone(),
            }
        );

        let display_name = match config.provider_id.as_str() {
            OPENROUTER_PROVIDER_ID => "OpenRouter",
            _ => "OpenAI compatible",
        }
        .to_string();

        Ok(Self {
            config,
            display_name,
            fallback_models: default_openrouter_models(),
            model_cache: Arc::new(ModelCache::with_default_ttl()),
        })
    }

    fn build_client(config: &ProviderConfig) -> ProviderResult<openai::Client> {
        let mut builder = openai::Client::builder().api_key(config.api_key.as_str());
        if !config.endpoint.is_empty() {
            builder = builder.base_url(config.endpoint.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })
    }

    async fn fetch_models_from_provider(&self) -> ProviderResult<Vec<Model>> {
        let client = Self::build_client(&self.config)?;
        let request = client
            .get("/models")
            .context(HttpClientSnafu {
                stage: "build-model-request",
            })?
            .body(NoBody)
            .map_err(|source| ProviderError::BuildHttpRequestBody {
                stage: "build-model-request-body",
                message: source.to_string(),
            })?;

        let response = client.send(request).await.context(HttpClientSnafu {
            stage: "send-model-request",
        })?;
        let status = response.status();
        let payload = http_client::text(response).await.context(HttpClientSnafu {
            stage: "read-model-response",
        })?;

        if !status.is_success() {
            return ModelFetchStatusSnafu {
                stage: "model-http-status",
                status: status.as_u16(),
                body: payload,
            }
            .fail();
        }

        let models = parse_model_list(&payload)?;
        if models.is_empty() {
            return ModelPayloadParseSnafu {
                stage: "parse-model-response",
                details: "no model identifiers found in provider response".to_string(),
            }
            .fail();
        }
        Ok(models)
    }

    /// Folds system messages into the preamble and pops the final message as the prompt.
    fn prepare_request<M: CompletionModel>(
        model: &M,
        request: &CompletionRequest,
    ) -> ProviderResult<CompletionRequestBuilder<M>> {
        let preamble = request
            .messages
            .iter()
            .filter(|message| message.is_system())
            .map(|message| message.content.as_str())
            .collect::<Vec<_>>();
        let mut messages = request
            .messages
            .iter()
            .filter_map(to_rig_message)
            .collect::<Vec<_>>();

        let Some(prompt) = messages.pop() else {
            tracing::warn!(
                target = ?request.target,
                model_id = %request.model_id,
                total_message_count = request.messages.len(),
                system_message_count = preamble.len(),
                "no user/assistant messages remain after filtering"
            );
            return EmptyMessageSetSnafu {
                stage: "prepare-request-pop-prompt",
                target: request.target,
            }
            .fail();
        };

        let mut builder = model
            .completion_request(prompt)
            .messages(messages)
            .temperature(request.temperature);
        if !preamble.is_empty() {
            builder = builder.preamble(preamble.join("\n\n"));
        }
        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(max_tokens);
        }
        Ok(builder)
    }

    async fn open_stream(
        config: &ProviderConfig,
        request: &CompletionRequest,
    ) -> ProviderResult<RigStreamingResponse> {
        let client = Self::build_client(config)?;
        let model = client.completion_model(request.model_id.clone());
        Self::prepare_request(&model, request)?
            .stream()
            .await
            .map_err(|source| completions_failed("open-stream", source))
    }

    fn emit_error_event(
        event_tx: &mpsc::UnboundedSender<StreamEventMapped>,
        target: StreamTarget,
        error: &ProviderError,
    ) {
        let _ = event_tx.send(StreamEventMapped {
            target,
            payload: StreamEventPayload::Error(ProviderFailure::from(error)),
        });
    }

    fn map_stream_item<R>(
        target: StreamTarget,
        item: StreamedAssistantContent<R>,
    ) -> Option<StreamEventMapped>
    where
        R: Clone + Unpin,
    {
        match item {
            StreamedAssistantContent::Text(text) if !text.text.is_empty() => {
                Some(StreamEventMapped {
                    target,
                    payload: StreamEventPayload::Delta(text.text),
                })
            }
            _ => None,
        }
    }

    async fn run_stream_worker(
        config: ProviderConfig,
        request: CompletionRequest,
        event_tx: mpsc::UnboundedSender<StreamEventMapped>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let target = request.target;
        let mut stream = match Self::open_stream(&config, &request).await {
            Ok(stream) => stream,
            Err(error) => {
                tracing::error!(
                    target = ?target,
                    provider_id = %config.provider_id,
                    model_id = %request.model_id,
                    error = %error,
                    "failed to open provider stream"
                );
                Self::emit_error_event(&event_tx, target, &error);
                return;
            }
        };

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    tracing::debug!(target = ?target, "provider stream cancelled");
                    stream.cancel();
                    return;
                }
                next_item = stream.next() => {
                    match next_item {
                        Some(Ok(item)) => {
                            if let Some(mapped) = Self::map_stream_item(target, item)
                                && event_tx.send(mapped).is_err()
                            {
                                return;
                            }
                        }
                        Some(Err(source)) => {
                            tracing::warn!(
                                target = ?target,
                                error = %source,
                                "provider stream emitted an error chunk"
                            );
                            let error = completions_failed("stream-chunk", source);
                            Self::emit_error_event(&event_tx, target, &error);
                            return;
                        }
                        None => break,
                    }
                }
            }
        }

        let _ = event_tx.send(StreamEventMapped {
            target,
            payload: StreamEventPayload::Done,
        });
    }
}

impl LlmProvider for RigProviderAdapter {
    fn id(&self) -> &str {
        &self.config.provider_id
    }

    fn name(&self) -> &str {
        &self.display_name
    }

    fn default_model(&self) -> &str {
        self.config
            .default_model
            .as_deref()
            .unwrap_or(DEFAULT_OPENROUTER_MODEL)
    }

    fn default_temperature(&self) -> f64 {
        self.config.default_temperature.unwrap_or(DEFAULT_TEMPERATURE)
    }

    fn fallback_models(&self) -> &[Model] {
        &self.fallback_models
    }

    fn list_available_models<'a>(&'a self) -> BoxFuture<'a, ProviderResult<ModelCatalog>> {
        Box::pin(async move {
            if let Some(models) = self.model_cache.get_fresh(self.id()).await {
                return Ok(ModelCatalog::from_cache_fresh(models));
            }

            // Provider API first, then stale cache, then static defaults.
            match self.fetch_models_from_provider().await {
                Ok(models) => {
                    self.model_cache.set(self.id(), models.clone()).await;
                    Ok(ModelCatalog::from_provider_api(models))
                }
                Err(error) => {
                    let error_message = error.to_string();

                    if let Some(models) = self.model_cache.get_any(self.id()).await {
                        tracing::warn!(
                            provider_id = %self.id(),
                            cached_model_count = models.len(),
                            error = %error_message,
                            "model fetch failed; serving stale cached models"
                        );
                        return Ok(ModelCatalog::from_cache_stale(models, error_message));
                    }

                    tracing::warn!(
                        provider_id = %self.id(),
                        fallback_model_count = self.fallback_models.len(),
                        error = %error_message,
                        "model fetch failed without cache; serving static fallback models"
                    );
                    Ok(ModelCatalog::from_static_fallback(
                        self.fallback_models.clone(),
                        error_message,
                    ))
                }
            }
        })
    }

    fn complete<'a>(
        &'a self,
        request: CompletionRequest,
    ) -> BoxFuture<'a, ProviderResult<Completion>> {
        Box::pin(async move {
            let client = Self::build_client(&self.config)?;
            let model = client.completion_model(request.model_id.clone());
            let response = Self::prepare_request(&model, &request)?
                .send()
                .await
                .map_err(|source| completions_failed("complete-send", source))?;

            let content = response
                .choice
                .iter()
                .filter_map(|content| match content {
                    AssistantContent::Text(text) => Some(text.text.as_str()),
                    _ => None,
                })
                .collect::<String>();

            tracing::debug!(
                target = ?request.target,
                model_id = %request.model_id,
                content_len = content.len(),
                "completion received"
            );
            Ok(Completion {
                content,
                model: request.model_id,
            })
        })
    }

    fn stream_complete(&self, request: CompletionRequest) -> ProviderResult<ProviderStreamHandle> {
        ensure!(
            request
                .messages
                .iter()
                .any(|message| !message.is_system()),
            EmptyMessageSetSnafu {
                stage: "stream-complete",
                target: request.target,
            }
        );

        let (event_tx, stream, cancel_rx) = make_event_stream(request.target);
        let worker: ProviderWorker = Box::pin(Self::run_stream_worker(
            self.config.clone(),
            request,
            event_tx,
            cancel_rx,
        ));

        Ok(ProviderStreamHandle { stream, worker })
    }
}

fn to_rig_message(message: &WireMessage) -> Option<RigMessage> {
    match message.role {
        WireRole::System => None,
        WireRole::User => Some(RigMessage::user(message.content.clone())),
        WireRole::Assistant => Some(RigMessage::assistant(message.content.clone())),
    }
}

fn completions_failed(stage: &'static str, source: CompletionError) -> ProviderError {
    ProviderError::CompletionsFailed {
        stage,
        kind: classify_completion_error(&source),
        source,
    }
}

fn classify_completion_error(error: &CompletionError) -> FailureKind {
    match error {
        CompletionError::ProviderError(body) => classify_provider_body(body),
        _ => FailureKind::Connection,
    }
}

#[derive(Deserialize)]
struct ProviderErrorEnvelope {
    error: ProviderErrorBody,
}

#[derive(Deserialize)]
struct ProviderErrorBody {
    #[serde(default)]
    code: Option<serde_json::Value>,
    #[serde(default)]
    param: Option<String>,
}

/// Classifies an error payload by its structured `error.code`/`error.param` fields.
/// Unparseable bodies are treated as connection failures.
fn classify_provider_body(body: &str) -> FailureKind {
    let Ok(envelope) = serde_json::from_str::<ProviderErrorEnvelope>(body) else {
        return FailureKind::Connection;
    };
    let error = envelope.error;

    let code_names_model = match &error.code {
        Some(serde_json::Value::Number(code)) => code.as_u64() == Some(404),
        Some(serde_json::Value::String(code)) => {
            matches!(code.as_str(), "model_not_found" | "invalid_model")
        }
        _ => false,
    };
    if code_names_model || error.param.as_deref() == Some("model") {
        FailureKind::InvalidModel
    } else {
        FailureKind::Connection
    }
}

#[derive(Deserialize)]
struct ModelListPayload {
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

/// Parses an OpenAI-style `{"data": [{"id": ..}]}` listing, keeping provider order.
fn parse_model_list(payload: &str) -> ProviderResult<Vec<Model>> {
    let parsed = serde_json::from_str::<ModelListPayload>(payload).map_err(|source| {
        ProviderError::ModelPayloadParse {
            stage: "parse-model-json",
            details: source.to_string(),
        }
    })?;

    let mut seen = HashSet::new();
    Ok(parsed
        .data
        .into_iter()
        .filter_map(|entry| {
            let id = entry.id.trim().to_string();
            if id.is_empty() || !seen.insert(id.clone()) {
                return None;
            }
            let mut model = match entry.name.filter(|name| !name.trim().is_empty()) {
                Some(name) => Model::new(id, name),
                None => Model::from_id(id),
            };
            model.description = entry.description;
            Some(model)
        })
        .collect())
}
