use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use phoenix_storage::Turn;

use super::model::GenerationConfig;
use super::provider::{
    LlmProvider, ProviderEventStream, ProviderResult, ProviderWorker, StreamEventPayload,
    StreamRequest, StreamTarget,
};

/// Lazily created, process-lifetime conversation with the remote model.
pub struct ModelSession {
    provider: Arc<dyn LlmProvider>,
    model_id: String,
    generation: GenerationConfig,
    handle: Mutex<Option<SessionHandle>>,
    next_session_id: AtomicU64,
}

impl ModelSession {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        let model_id = provider.default_model().to_string();
        Self {
            provider,
            model_id,
            generation: GenerationConfig::default(),
            handle: Mutex::new(None),
            next_session_id: AtomicU64::new(1),
        }
    }

    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        let model_id = model_id.into();
        if !model_id.trim().is_empty() {
            self.model_id = model_id.trim().to_string();
        }
        self
    }

    pub fn with_generation(mut self, generation: GenerationConfig) -> Self {
        self.generation = generation;
        self
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Returns the live handle, creating it from `seed` only when none exists yet.
    pub fn start_or_reuse(&self, seed: &[Turn]) -> SessionHandle {
        let mut slot = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = slot.as_ref() {
            return handle.clone();
        }

        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let handle = SessionHandle::new(
            session_id,
            self.provider.clone(),
            self.model_id.clone(),
            self.generation,
            seed.to_vec(),
        );
        tracing::info!(
            session_id,
            provider_id = %self.provider.id(),
            model_id = %self.model_id,
            seeded_turns = seed.len(),
            "started model session"
        );
        *slot = Some(handle.clone());
        handle
    }

    pub fn current(&self) -> Option<SessionHandle> {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn reset_context(&self) {
        if let Some(handle) = self.current() {
            handle.reset_context();
        }
    }
}

#[derive(Debug, Default)]
struct SessionContext {
    epoch: u64,
    turns: Vec<Turn>,
}

struct SessionInner {
    id: u64,
    provider: Arc<dyn LlmProvider>,
    model_id: String,
    generation: GenerationConfig,
    context: Mutex<SessionContext>,
    next_sequence: AtomicU64,
}

/// Owned reference to one remote conversation. Its turn context is private.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<SessionInner>,
}

impl SessionHandle {
    fn new(
        id: u64,
        provider: Arc<dyn LlmProvider>,
        model_id: String,
        generation: GenerationConfig,
        seed: Vec<Turn>,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id,
                provider,
                model_id,
                generation,
                context: Mutex::new(SessionContext {
                    epoch: 0,
                    turns: seed,
                }),
                next_sequence: AtomicU64::new(1),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn context_len(&self) -> usize {
        self.lock_context().turns.len()
    }

    pub fn send_streaming(&self, text: &str) -> ProviderResult<SessionStream> {
        let (epoch, history) = {
            let context = self.lock_context();
            (context.epoch, context.turns.clone())
        };

        let sequence = self.inner.next_sequence.fetch_add(1, Ordering::Relaxed);
        let target = StreamTarget::new(self.inner.id, sequence);
        let request = StreamRequest::new(target, self.inner.model_id.clone(), history, text)
            .with_generation(self.inner.generation);

        let handle = self.inner.provider.stream_chat(request)?;
        Ok(SessionStream {
            stream: handle.stream,
            worker: Some(handle.worker),
            session: self.clone(),
            target,
            epoch,
            prompt: text.to_string(),
            reply: String::new(),
            finished: false,
        })
    }

    pub fn reset_context(&self) {
        let mut context = self.lock_context();
        context.turns.clear();
        context.epoch = context.epoch.saturating_add(1);
        tracing::debug!(session_id = self.inner.id, epoch = context.epoch, "reset session context");
    }

    fn commit(&self, epoch: u64, prompt: &str, reply: &str) -> bool {
        let mut context = self.lock_context();
        if context.epoch != epoch {
            return false;
        }

        context.turns.push(Turn::user(prompt));
        context.turns.push(Turn::model(reply));
        true
    }

    fn lock_context(&self) -> MutexGuard<'_, SessionContext> {
        self.inner
            .context
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// One in-flight streaming call. Finite and not restartable.
pub struct SessionStream {
    stream: ProviderEventStream,
    worker: Option<ProviderWorker>,
    session: SessionHandle,
    target: StreamTarget,
    epoch: u64,
    prompt: String,
    reply: String,
    finished: bool,
}

impl SessionStream {
    pub fn target(&self) -> StreamTarget {
        self.target
    }

    /// Worker future driving provider IO; the caller spawns it on its runtime.
    pub fn take_worker(&mut self) -> Option<ProviderWorker> {
        self.worker.take()
    }

    /// Next payload for this call; `None` once a terminal payload was returned or the
    /// provider went away.
    pub async fn recv(&mut self) -> Option<StreamEventPayload> {
        if self.finished {
            return None;
        }

        let payload = self.stream.recv().await?;
        match &payload {
            StreamEventPayload::Delta(chunk) => self.reply.push_str(chunk),
            StreamEventPayload::Done => {
                self.finished = true;
                if !self.session.commit(self.epoch, &self.prompt, &self.reply) {
                    tracing::debug!(
                        target = ?self.target,
                        "session context was reset mid-stream; exchange not recorded"
                    );
                }
            }
            StreamEventPayload::Error(_) => self.finished = true,
        }
        Some(payload)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::provider::{ProviderStreamHandle, StreamEventMapped, make_event_stream};

    /// Replays fixed deltas and records every request it receives.
    struct EchoProvider {
        deltas: Vec<&'static str>,
        requests: StdMutex<Vec<StreamRequest>>,
    }

    impl EchoProvider {
        fn new(deltas: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                deltas,
                requests: StdMutex::new(Vec::new()),
            })
        }
    }

    impl LlmProvider for EchoProvider {
        fn id(&self) -> &str {
            "echo"
        }

        fn name(&self) -> &str {
            "Echo"
        }

        fn default_model(&self) -> &str {
            "echo-1"
        }

        fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
            let target = request.target;
            self.requests.lock().unwrap().push(request);
            let (event_tx, stream, _cancel_rx) = make_event_stream(target);
            for delta in &self.deltas {
                let _ = event_tx.send(StreamEventMapped {
                    target,
                    payload: StreamEventPayload::Delta(delta.to_string()),
                });
            }
            let _ = event_tx.send(StreamEventMapped {
                target,
                payload: StreamEventPayload::Done,
            });
            Ok(ProviderStreamHandle {
                stream,
                worker: Box::pin(async {}),
            })
        }
    }

    async fn drain(stream: &mut SessionStream) -> Vec<StreamEventPayload> {
        let mut payloads = Vec::new();
        while let Some(payload) = stream.recv().await {
            payloads.push(payload);
        }
        payloads
    }

    #[test]
    fn start_or_reuse_ignores_seed_once_started() {
        let session = ModelSession::new(EchoProvider::new(vec![]));

        let first = session.start_or_reuse(&[Turn::user("a"), Turn::model("b")]);
        let second = session.start_or_reuse(&[]);

        assert_eq!(first.id(), second.id());
        assert_eq!(second.context_len(), 2);
    }

    #[tokio::test]
    async fn completed_exchange_is_added_to_context() {
        let provider = EchoProvider::new(vec!["Hi", " there"]);
        let session = ModelSession::new(provider.clone());
        let handle = session.start_or_reuse(&[]);

        let mut stream = handle.send_streaming("Hello").unwrap();
        let payloads = drain(&mut stream).await;

        assert_eq!(payloads.last(), Some(&StreamEventPayload::Done));
        assert_eq!(handle.context_len(), 2);

        let _ = drain(&mut handle.send_streaming("Again").unwrap()).await;
        let requests = provider.requests.lock().unwrap();
        assert_eq!(
            requests[1].history,
            vec![Turn::user("Hello"), Turn::model("Hi there")]
        );
        assert_eq!(requests[1].prompt, "Again");
    }

    #[tokio::test]
    async fn reset_during_stream_discards_the_exchange() {
        let session = ModelSession::new(EchoProvider::new(vec!["late"]));
        let handle = session.start_or_reuse(&[Turn::user("old"), Turn::model("old")]);

        let mut stream = handle.send_streaming("Hello").unwrap();
        session.reset_context();
        let _ = drain(&mut stream).await;

        assert_eq!(handle.context_len(), 0);
    }

    #[tokio::test]
    async fn stream_yields_nothing_after_terminal_payload() {
        let session = ModelSession::new(EchoProvider::new(vec!["x"]));
        let handle = session.start_or_reuse(&[]);
        let mut stream = handle.send_streaming("Hello").unwrap();

        let _ = drain(&mut stream).await;

        assert_eq!(stream.recv().await, None);
    }
}
