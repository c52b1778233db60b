use std::future::Future;
use std::pin::Pin;

use phoenix_storage::Turn;
use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};

use super::model::GenerationConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderConfig {
    pub provider_id: String,
    pub api_key: String,
    pub endpoint: String,
    pub model_id: String,
    pub generation: GenerationConfig,
}

impl ProviderConfig {
    pub fn new(
        provider_id: impl Into<String>,
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
        model_id: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into().trim().to_string(),
            api_key: api_key.into().trim().to_string(),
            endpoint: endpoint.into().trim().to_string(),
            model_id: model_id.into().trim().to_string(),
            generation: GenerationConfig::default(),
        }
    }

    pub fn with_generation(mut self, generation: GenerationConfig) -> Self {
        self.generation = generation;
        self
    }
}

/// Routing key attached to every event of one streaming call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamTarget {
    pub session_id: u64,
    pub sequence: u64,
}

impl StreamTarget {
    pub const fn new(session_id: u64, sequence: u64) -> Self {
        Self {
            session_id,
            sequence,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub target: StreamTarget,
    pub model_id: String,
    pub history: Vec<Turn>,
    pub prompt: String,
    pub generation: GenerationConfig,
}

impl StreamRequest {
    pub fn new(
        target: StreamTarget,
        model_id: impl Into<String>,
        history: Vec<Turn>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            target,
            model_id: model_id.into(),
            history,
            prompt: prompt.into(),
            generation: GenerationConfig::unset(),
        }
    }

    pub fn with_generation(mut self, generation: GenerationConfig) -> Self {
        self.generation = generation;
        self
    }
}

/// Provider-agnostic stream payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEventPayload {
    Delta(String),
    Done,
    Error(String),
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
    #[snafu(display("no API key configured for `{provider_id}` on `{stage}`"))]
    MissingApiKey {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("unknown model provider `{provider_id}` on `{stage}`"))]
    UnsupportedProvider {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("stream request for {target:?} has an empty prompt"))]
    EmptyPrompt {
        stage: &'static str,
        target: StreamTarget,
    },
    #[snafu(display("could not build the gemini client on `{stage}`: {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("gemini request failed on `{stage}`: {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
}

/// Receiving end of one streaming call.
///
/// Only events addressed to this call's target are yielded. Dropping the stream tells the
/// worker to stop.
pub struct ProviderEventStream {
    target: StreamTarget,
    receiver: mpsc::UnboundedReceiver<StreamEventMapped>,
    cancel: Option<oneshot::Sender<()>>,
}

pub struct ProviderStreamHandle {
    pub stream: ProviderEventStream,
    pub worker: ProviderWorker,
}

impl ProviderEventStream {
    pub fn target(&self) -> StreamTarget {
        self.target
    }

    pub async fn recv(&mut self) -> Option<StreamEventPayload> {
        loop {
            let event = self.receiver.recv().await?;
            if let Some(payload) = self.accept(event) {
                return Some(payload);
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<StreamEventPayload> {
        loop {
            let event = self.receiver.try_recv().ok()?;
            if let Some(payload) = self.accept(event) {
                return Some(payload);
            }
        }
    }

    /// Asks the worker to stop; `false` when it was already asked or is gone.
    pub fn cancel(&mut self) -> bool {
        match self.cancel.take() {
            Some(cancel) => cancel.send(()).is_ok(),
            None => false,
        }
    }

    fn accept(&self, event: StreamEventMapped) -> Option<StreamEventPayload> {
        if event.target == self.target {
            return Some(event.payload);
        }
        tracing::debug!(
            expected = ?self.target,
            received = ?event.target,
            "dropping event for foreign stream target"
        );
        None
    }
}

impl Drop for ProviderEventStream {
    fn drop(&mut self) {
        self.cancel();
    }
}

pub trait LlmProvider: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn default_model(&self) -> &str;
    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle>;
}

/// Channel plumbing shared by provider adapters and scripted test providers.
pub fn make_event_stream(
    target: StreamTarget,
) -> (
    mpsc::UnboundedSender<StreamEventMapped>,
    ProviderEventStream,
    oneshot::Receiver<()>,
) {
    let (event_tx, receiver) = mpsc::unbounded_channel();
    let (cancel, cancel_rx) = oneshot::channel();
    let stream = ProviderEventStream {
        target,
        receiver,
        cancel: Some(cancel),
    };
    (event_tx, stream, cancel_rx)
}
