#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use phoenix_chat::{ControllerConfig, ConversationController, ConversationState};
use phoenix_llm::{
    LlmProvider, ModelSession, ProviderError, ProviderResult, ProviderStreamHandle,
    StreamEventMapped, StreamEventPayload, StreamRequest, make_event_stream,
};
use phoenix_storage::{
    BoxFuture, HistoryStore, KeyValueStore, MemoryKeyValueStore, StorageError, StorageResult,
};
use tokio::sync::{Notify, mpsc, watch};

/// One scripted response from the provider double.
pub enum Script {
    /// Emits every payload immediately.
    Replay(Vec<StreamEventPayload>),
    /// Refuses to open the stream.
    Refuse,
    /// Forwards payloads the test pushes through the paired sender.
    Manual(mpsc::UnboundedReceiver<StreamEventPayload>),
}

impl Script {
    pub fn deltas_then_done(deltas: &[&str]) -> Self {
        let mut payloads = deltas
            .iter()
            .map(|delta| StreamEventPayload::Delta(delta.to_string()))
            .collect::<Vec<_>>();
        payloads.push(StreamEventPayload::Done);
        Self::Replay(payloads)
    }

    pub fn manual() -> (Self, mpsc::UnboundedSender<StreamEventPayload>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::Manual(rx), tx)
    }
}

#[derive(Default)]
pub struct ScriptedProvider {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<StreamRequest>>,
}

impl ScriptedProvider {
    pub fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn push(&self, script: Script) {
        self.scripts.lock().unwrap().push_back(script);
    }

    pub fn requests(&self) -> Vec<StreamRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl LlmProvider for ScriptedProvider {
    fn id(&self) -> &str {
        "scripted"
    }

    fn name(&self) -> &str {
        "Scripted"
    }

    fn default_model(&self) -> &str {
        "scripted-1"
    }

    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
        let target = request.target;
        self.requests.lock().unwrap().push(request);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .expect("no scripted response left");

        let (event_tx, stream, mut cancel_rx) = make_event_stream(target);
        match script {
            Script::Refuse => Err(ProviderError::UnsupportedProvider {
                stage: "scripted-refuse",
                provider_id: "scripted".to_string(),
            }),
            Script::Replay(payloads) => {
                for payload in payloads {
                    let _ = event_tx.send(StreamEventMapped { target, payload });
                }
                Ok(ProviderStreamHandle {
                    stream,
                    worker: Box::pin(async {}),
                })
            }
            Script::Manual(mut payloads) => Ok(ProviderStreamHandle {
                stream,
                worker: Box::pin(async move {
                    loop {
                        tokio::select! {
                            _ = &mut cancel_rx => break,
                            next = payloads.recv() => match next {
                                Some(payload) => {
                                    if event_tx.send(StreamEventMapped { target, payload }).is_err() {
                                        break;
                                    }
                                }
                                None => break,
                            },
                        }
                    }
                }),
            }),
        }
    }
}

/// Signals around one write that waits to be released.
#[derive(Default)]
pub struct HeldWrite {
    pub started: Notify,
    pub release: Notify,
}

/// Key-value store whose writes can be switched to fail or held back.
#[derive(Default)]
pub struct FlakyKeyValueStore {
    inner: MemoryKeyValueStore,
    fail_writes: Mutex<bool>,
    held_write: Mutex<Option<Arc<HeldWrite>>>,
}

impl FlakyKeyValueStore {
    pub fn set_fail_writes(&self, fail: bool) {
        *self.fail_writes.lock().unwrap() = fail;
    }

    /// The next `set` reports `started` and then waits for `release`.
    pub fn hold_next_write(&self) -> Arc<HeldWrite> {
        let held = Arc::new(HeldWrite::default());
        *self.held_write.lock().unwrap() = Some(held.clone());
        held
    }

    fn check(&self, stage: &'static str) -> StorageResult<()> {
        if *self.fail_writes.lock().unwrap() {
            return Err(StorageError::SqliteQuery {
                stage,
                source: sqlx::Error::PoolClosed,
            });
        }
        Ok(())
    }
}

impl KeyValueStore for FlakyKeyValueStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StorageResult<Option<String>>> {
        self.inner.get(key)
    }

    fn set<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let held = self.held_write.lock().unwrap().take();
            if let Some(held) = held {
                held.started.notify_one();
                held.release.notified().await;
            }
            self.check("flaky-set")?;
            self.inner.set(key, value).await
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            self.check("flaky-remove")?;
            self.inner.remove(key).await
        })
    }
}

pub struct Harness {
    pub controller: ConversationController,
    pub provider: Arc<ScriptedProvider>,
    pub backend: Arc<FlakyKeyValueStore>,
    pub store: HistoryStore,
}

impl Harness {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self::with_config(scripts, ControllerConfig::default())
    }

    pub fn with_config(scripts: Vec<Script>, config: ControllerConfig) -> Self {
        let provider = ScriptedProvider::new(scripts);
        let backend = Arc::new(FlakyKeyValueStore::default());
        let store = HistoryStore::new(backend.clone());
        let session = ModelSession::new(provider.clone());
        let controller = ConversationController::new(store.clone(), session, config);
        Self {
            controller,
            provider,
            backend,
            store,
        }
    }
}

/// Waits (bounded) until a published snapshot satisfies `predicate`.
pub async fn wait_for_state(
    receiver: &mut watch::Receiver<Arc<ConversationState>>,
    predicate: impl FnMut(&Arc<ConversationState>) -> bool,
) -> Arc<ConversationState> {
    tokio::time::timeout(Duration::from_secs(5), receiver.wait_for(predicate))
        .await
        .expect("timed out waiting for conversation state")
        .expect("controller dropped")
        .clone()
}
