use futures::StreamExt;
use phoenix_storage::{Role, Turn};
use rig::completion::{CompletionModel, Message as RigMessage};
use rig::prelude::CompletionClient;
use rig::providers::gemini;
use rig::streaming::{StreamedAssistantContent, StreamingCompletionResponse};
use snafu::{ResultExt, ensure};
use tokio::sync::{mpsc, oneshot};

use super::model::DEFAULT_GEMINI_MODEL;
use super::provider::{
    CompletionsFailedSnafu, EmptyPromptSnafu, HttpClientSnafu, LlmProvider, MissingApiKeySnafu,
    ProviderConfig, ProviderError, ProviderResult, ProviderStreamHandle, ProviderWorker,
    StreamEventMapped, StreamEventPayload, StreamRequest, make_event_stream,
};

pub const RIG_GEMINI_PROVIDER_ID: &str = "gemini";

pub struct GeminiProvider {
    config: ProviderConfig,
}

impl GeminiProvider {
    pub fn new(config: ProviderConfig) -> ProviderResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "gemini-provider-new",
                provider_id: config.provider_id.clone(),
            }
        );

        Ok(Self { config })
    }

    fn build_client(config: &ProviderConfig) -> ProviderResult<gemini::Client> {
        let mut builder = gemini::Client::builder().api_key(config.api_key.as_str());
        if !config.endpoint.is_empty() {
            builder = builder.base_url(config.endpoint.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })
    }

    fn to_rig_message(turn: &Turn) -> RigMessage {
        match turn.role {
            Role::User => RigMessage::user(turn.text.clone()),
            Role::Model => RigMessage::assistant(turn.text.clone()),
        }
    }

    async fn open_stream<M>(
        model: M,
        request: &StreamRequest,
    ) -> ProviderResult<StreamingCompletionResponse<M::StreamingResponse>>
    where
        M: CompletionModel,
    {
        let history = request
            .history
            .iter()
            .map(Self::to_rig_message)
            .collect::<Vec<_>>();

        let mut builder = model
            .completion_request(RigMessage::user(request.prompt.clone()))
            .messages(history);

        let generation = request.generation;
        if let Some(temperature) = generation.temperature {
            builder = builder.temperature(temperature);
        }

        if let Some(max_tokens) = generation.max_output_tokens {
            builder = builder.max_tokens(max_tokens);
        }

        if let Some(params) = generation.additional_params() {
            builder = builder.additional_params(params);
        }

        builder.stream().await.context(CompletionsFailedSnafu {
            stage: "open-stream",
        })
    }

    fn map_stream_item<R>(item: StreamedAssistantContent<R>) -> Option<StreamEventPayload>
    where
        R: Clone + Unpin,
    {
        match item {
            StreamedAssistantContent::Text(text) if !text.text.is_empty() => {
                Some(StreamEventPayload::Delta(text.text))
            }
            // Reasoning, tool calls and the final usage record never reach the transcript.
            _ => None,
        }
    }

    /// Opens the response and forwards its text chunks until something stops it.
    async fn drive<M>(
        model: M,
        request: &StreamRequest,
        event_tx: &mpsc::UnboundedSender<StreamEventMapped>,
        cancel_rx: &mut oneshot::Receiver<()>,
    ) -> StreamEnd
    where
        M: CompletionModel,
    {
        let target = request.target;
        let mut stream = match Self::open_stream(model, request).await {
            Ok(stream) => stream,
            Err(error) => return StreamEnd::Failed(error),
        };

        loop {
            tokio::select! {
                _ = &mut *cancel_rx => {
                    stream.cancel();
                    return StreamEnd::Cancelled;
                }
                next_item = stream.next() => match next_item {
                    Some(Ok(item)) => {
                        let Some(payload) = Self::map_stream_item(item) else {
                            continue;
                        };
                        if event_tx.send(StreamEventMapped { target, payload }).is_err() {
                            return StreamEnd::ListenerGone;
                        }
                    }
                    Some(Err(source)) => {
                        return StreamEnd::Failed(ProviderError::CompletionsFailed {
                            stage: "stream-chunk",
                            source,
                        });
                    }
                    None => return StreamEnd::Finished,
                },
            }
        }
    }

    async fn run_stream_worker(
        config: ProviderConfig,
        request: StreamRequest,
        event_tx: mpsc::UnboundedSender<StreamEventMapped>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let target = request.target;
        let end = match Self::build_client(&config) {
            Ok(client) => {
                let model = client.completion_model(request.model_id.clone());
                Self::drive(model, &request, &event_tx, &mut cancel_rx).await
            }
            Err(error) => StreamEnd::Failed(error),
        };

        let payload = match end {
            StreamEnd::Finished => StreamEventPayload::Done,
            StreamEnd::Failed(error) => {
                tracing::warn!(
                    target = ?target,
                    model_id = %request.model_id,
                    error = %error,
                    "gemini stream failed"
                );
                StreamEventPayload::Error(error.to_string())
            }
            StreamEnd::Cancelled => {
                tracing::debug!(target = ?target, "gemini stream cancelled");
                return;
            }
            StreamEnd::ListenerGone => return,
        };
        let _ = event_tx.send(StreamEventMapped { target, payload });
    }
}

/// Why a provider stream stopped producing chunks.
enum StreamEnd {
    Finished,
    Failed(ProviderError),
    Cancelled,
    ListenerGone,
}

impl LlmProvider for GeminiProvider {
    fn id(&self) -> &str {
        &self.config.provider_id
    }

    fn name(&self) -> &str {
        "Rig Gemini"
    }

    fn default_model(&self) -> &str {
        if self.config.model_id.is_empty() {
            DEFAULT_GEMINI_MODEL
        } else {
            &self.config.model_id
        }
    }

    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
        ensure!(
            !request.prompt.trim().is_empty(),
            EmptyPromptSnafu {
                stage: "stream-chat",
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
