use std::fmt;
use std::future::Future;
use std::pin::Pin;

use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};

use super::model::{Model, ModelCatalog};
use super::wire::WireMessage;

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderConfig {
    pub provider_id: String,
    pub api_key: String,
    pub endpoint: String,
    pub default_model: Option<String>,
    pub default_temperature: Option<f64>,
}

impl ProviderConfig {
    pub fn new(
        provider_id: impl Into<String>,
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into().trim().to_string(),
            api_key: api_key.into().trim().to_string(),
            endpoint: endpoint.into().trim().to_string(),
            default_model: None,
            default_temperature: None,
        }
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        let model = model.into().trim().to_string();
        self.default_model = (!model.is_empty()).then_some(model);
        self
    }

    pub fn with_default_temperature(mut self, temperature: f64) -> Self {
        self.default_temperature = Some(temperature);
        self
    }
}

/// Correlates stream events with the turn that requested them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamTarget(pub u64);

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub target: StreamTarget,
    pub model_id: String,
    pub temperature: f64,
    pub messages: Vec<WireMessage>,
    pub max_tokens: Option<u64>,
}

impl CompletionRequest {
    pub fn new(
        target: StreamTarget,
        model_id: impl Into<String>,
        temperature: f64,
        messages: Vec<WireMessage>,
    ) -> Self {
        Self {
            target,
            model_id: model_id.into(),
            temperature,
            messages,
            max_tokens: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub content: String,
    /// Model that actually answered; may differ from the requested alias.
    pub model: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Connection,
    InvalidModel,
}

/// Classified, cloneable failure carried through stream events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ProviderFailure {
    pub fn connection(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Connection,
            message: message.into(),
        }
    }

    pub fn invalid_model(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::InvalidModel,
            message: message.into(),
        }
    }
}

impl fmt::Display for ProviderFailure {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.message)
    }
}

impl From<&ProviderError> for ProviderFailure {
    fn from(error: &ProviderError) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEventPayload {
    Delta(String),
    Done,
    Error(ProviderFailure),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEventMapped {
    pub target: StreamTarget,
    pub payload: StreamEventPayload,
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type ProviderWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProviderError {
    #[snafu(display("missing API key for provider '{provider_id}'"))]
    MissingApiKey {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("provider '{provider_id}' is not supported"))]
    UnsupportedProvider {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("request for {target:?} has no user or assistant messages"))]
    EmptyMessageSet {
        stage: &'static str,
        target: StreamTarget,
    },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("failed to finalize HTTP request body: {message}"))]
    BuildHttpRequestBody {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("provider model endpoint returned status {status}: {body}"))]
    ModelFetchStatus {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("failed to parse provider model list: {details}"))]
    ModelPayloadParse {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("completions failed on `{stage}`, {source}"))]
    CompletionsFailed {
        stage: &'static str,
        kind: FailureKind,
        source: rig::completion::CompletionError,
    },
    #[snafu(display("stream for {target:?} failed: {failure}"))]
    StreamInterrupted {
        stage: &'static str,
        target: StreamTarget,
        failure: ProviderFailure,
    },
    #[snafu(display("stream for {target:?} closed before completion"))]
    StreamClosed {
        stage: &'static str,
        target: StreamTarget,
    },
}

impl ProviderError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::CompletionsFailed { kind, .. } => *kind,
            Self::StreamInterrupted { failure, .. } => failure.kind,
            _ => FailureKind::Connection,
        }
    }
}

pub struct ProviderEventStream {
    target: StreamTarget,
    events: mpsc::UnboundedReceiver<StreamEventMapped>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

pub struct ProviderStreamHandle {
    pub stream: ProviderEventStream,
    pub worker: ProviderWorker,
}

impl ProviderEventStream {
    pub(crate) fn new(
        target: StreamTarget,
        events: mpsc::UnboundedReceiver<StreamEventMapped>,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            target,
            events,
            cancel_tx: Some(cancel_tx),
        }
    }

    pub fn target(&self) -> StreamTarget {
        self.target
    }

    pub async fn recv(&mut self) -> Option<StreamEventMapped> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StreamEventMapped> {
        self.events.try_recv().ok()
    }

    pub fn cancel(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }
}

impl Drop for ProviderEventStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

/// Remote model capability. Implementations classify their own failures so
/// callers only ever match on [`FailureKind`].
pub trait LlmProvider: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn default_model(&self) -> &str;
    fn default_temperature(&self) -> f64;
    fn fallback_models(&self) -> &[Model];
    fn list_available_models<'a>(&'a self) -> BoxFuture<'a, ProviderResult<ModelCatalog>>;
    fn complete<'a>(
        &'a self,
        request: CompletionRequest,
    ) -> BoxFuture<'a, ProviderResult<Completion>>;
    /// The returned worker must be polled (usually spawned) for events to flow.
    fn stream_complete(&self, request: CompletionRequest) -> ProviderResult<ProviderStreamHandle>;

    /// Explicit arguments win over provider defaults. Blank model overrides are ignored.
    fn resolve_parameters(&self, model: Option<&str>, temperature: Option<f64>) -> (String, f64) {
        let model = model
            .map(str::trim)
            .filter(|model| !model.is_empty())
            .unwrap_or_else(|| self.default_model())
            .to_string();
        (model, temperature.unwrap_or_else(|| self.default_temperature()))
    }
}

pub fn make_event_stream(
    target: StreamTarget,
) -> (
    mpsc::UnboundedSender<StreamEventMapped>,
    ProviderEventStream,
    oneshot::Receiver<()>,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        event_tx,
        ProviderEventStream::new(target, event_rx, cancel_tx),
        cancel_rx,
    )
}
