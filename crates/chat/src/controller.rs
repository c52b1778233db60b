use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwap;
use phoenix_llm::{ModelSession, StreamEventPayload};
use phoenix_storage::{HistoryStore, Turn};
use snafu::ResultExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{ChatResult, StorageSnafu};
use crate::message::{
    ConversationState, ExchangeEvent, ExchangePhase, ExchangeToken, PhaseTransition,
};

/// Runtime-adjustable controller knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControllerConfig {
    /// Minimum time between a submit and the first streamed update.
    pub response_delay: Duration,
}

impl ControllerConfig {
    pub fn with_response_delay(response_delay: Duration) -> Self {
        Self { response_delay }
    }
}

/// Result of a submit request.
#[derive(Debug)]
pub enum SubmitOutcome {
    /// Blank input; nothing changed.
    Ignored,
    /// Another exchange is still in flight; nothing changed.
    Rejected,
    Started(ExchangeTask),
}

impl SubmitOutcome {
    pub fn is_started(&self) -> bool {
        matches!(self, Self::Started(_))
    }

    pub fn into_task(self) -> Option<ExchangeTask> {
        match self {
            Self::Started(task) => Some(task),
            Self::Ignored | Self::Rejected => None,
        }
    }
}

/// Background task driving one exchange.
#[derive(Debug)]
pub struct ExchangeTask {
    token: ExchangeToken,
    join: JoinHandle<()>,
}

impl ExchangeTask {
    pub fn token(&self) -> ExchangeToken {
        self.token
    }

    pub async fn wait(self) {
        if let Err(error) = self.join.await {
            tracing::error!(token = ?self.token, error = %error, "exchange task did not finish cleanly");
        }
    }
}

struct ControllerState {
    conversation: ConversationState,
    phase: ExchangePhase,
    next_token: u64,
}

struct Shared {
    store: HistoryStore,
    session: ModelSession,
    config: ArcSwap<ControllerConfig>,
    state: Mutex<ControllerState>,
    snapshots: watch::Sender<Arc<ConversationState>>,
    // Serializes every store mutation so clear and append never interleave.
    store_gate: tokio::sync::Mutex<()>,
    last_persistence_error: Mutex<Option<String>>,
}

/// Owns the live conversation, drives the model session and mirrors finished exchanges
/// into durable history.
#[derive(Clone)]
pub struct ConversationController {
    shared: Arc<Shared>,
}

impl ConversationController {
    pub fn new(store: HistoryStore, session: ModelSession, config: ControllerConfig) -> Self {
        let (snapshots, _) = watch::channel(Arc::new(ConversationState::default()));
        Self {
            shared: Arc::new(Shared {
                store,
                session,
                config: ArcSwap::from_pointee(config),
                state: Mutex::new(ControllerState {
                    conversation: ConversationState::default(),
                    phase: ExchangePhase::Idle,
                    next_token: 1,
                }),
                snapshots,
                store_gate: tokio::sync::Mutex::new(()),
                last_persistence_error: Mutex::new(None),
            }),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ConversationState>> {
        self.shared.snapshots.subscribe()
    }

    pub fn snapshot(&self) -> Arc<ConversationState> {
        self.shared.snapshots.borrow().clone()
    }

    pub fn phase(&self) -> ExchangePhase {
        self.shared.lock_state().phase
    }

    pub fn config(&self) -> ControllerConfig {
        **self.shared.config.load()
    }

    pub fn reconfigure(&self, config: ControllerConfig) {
        tracing::info!(
            response_delay_ms = config.response_delay.as_millis() as u64,
            "reconfigured conversation controller"
        );
        self.shared.config.store(Arc::new(config));
    }

    /// Most recent failure to persist a finished exchange, cleared by the next success.
    pub fn last_persistence_error(&self) -> Option<String> {
        self.shared
            .last_persistence_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Turns the model session currently carries as context; zero before `initialize`.
    pub fn model_context_len(&self) -> usize {
        self.shared
            .session
            .current()
            .map_or(0, |handle| handle.context_len())
    }

    /// Seeds the live conversation from durable history and prepares the model session.
    ///
    /// Repeated calls replace the message list (never append to it) and reuse the
    /// existing session. The list is left alone while an exchange is in flight.
    pub async fn initialize(&self) {
        let turns = self.shared.store.load().await;

        let refreshed = self
            .shared
            .mutate(|state| {
                state
                    .phase
                    .is_idle()
                    .then(|| state.conversation = ConversationState::from_turns(&turns))
            })
            .is_some();

        let handle = self.shared.session.start_or_reuse(&turns);
        tracing::info!(
            loaded_turns = turns.len(),
            session_id = handle.id(),
            refreshed,
            "initialized conversation"
        );
    }

    /// Starts an exchange in the background and returns immediately.
    pub fn submit(&self, text: &str) -> SubmitOutcome {
        if text.trim().is_empty() {
            return SubmitOutcome::Ignored;
        }

        let started = self.shared.mutate(|state| {
            let token = ExchangeToken::new(state.next_token);
            match state.phase.apply(PhaseTransition::Start(token)) {
                Ok(next) => {
                    state.next_token = state.next_token.saturating_add(1);
                    state.phase = next;
                    state
                        .conversation
                        .apply(ExchangeEvent::Submitted(text.to_string()));
                    Some(token)
                }
                Err(rejection) => {
                    tracing::debug!(?rejection, "submit ignored while an exchange is in flight");
                    None
                }
            }
        });

        let Some(token) = started else {
            return SubmitOutcome::Rejected;
        };

        let shared = self.shared.clone();
        let prompt = text.to_string();
        let join = tokio::spawn(async move { shared.run_exchange(token, prompt).await });
        SubmitOutcome::Started(ExchangeTask { token, join })
    }

    /// Signals that the user wants to delete history; `false` when there is nothing to delete.
    pub fn request_delete(&self) -> bool {
        let has_history = !self.snapshot().is_empty();
        if has_history {
            tracing::debug!("history deletion requested");
        }
        has_history
    }

    /// Empties durable history, the live conversation and the model context together.
    ///
    /// When the store cannot be wiped nothing is reset. Any exchange still in flight
    /// becomes stale and its remaining callbacks are dropped.
    pub async fn clear_history(&self) -> ChatResult<()> {
        let _gate = self.shared.store_gate.lock().await;

        self.shared.store.clear().await.context(StorageSnafu {
            stage: "clear-history",
        })?;

        self.shared.mutate(|state| {
            let abandoned = state.phase.active_token();
            state.phase = ExchangePhase::Idle;
            state.conversation = ConversationState::default();
            if let Some(token) = abandoned {
                tracing::debug!(?token, "abandoned in-flight exchange on clear");
            }
            // Under the state lock so no submit observes the old model context.
            self.shared.session.reset_context();
            Some(())
        });

        tracing::info!("cleared conversation history");
        Ok(())
    }
}

impl Shared {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `apply` under the state lock and publishes a snapshot when it returns `Some`.
    fn mutate<R>(&self, apply: impl FnOnce(&mut ControllerState) -> Option<R>) -> Option<R> {
        let mut state = self.lock_state();
        let result = apply(&mut state)?;
        self.snapshots.send_replace(Arc::new(state.conversation.clone()));
        Some(result)
    }

    fn advance(&self, transition: PhaseTransition, event: ExchangeEvent) -> bool {
        self.mutate(|state| match state.phase.apply(transition) {
            Ok(next) => {
                state.phase = next;
                state.conversation.apply(event);
                Some(())
            }
            Err(rejection) => {
                tracing::debug!(?rejection, "dropping stale exchange callback");
                None
            }
        })
        .is_some()
    }

    fn is_current(&self, token: ExchangeToken) -> bool {
        self.lock_state().phase.active_token() == Some(token)
    }

    async fn run_exchange(self: Arc<Self>, token: ExchangeToken, prompt: String) {
        let delay = self.config.load().response_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if !self.is_current(token) {
            return;
        }

        let handle = match self.session.current() {
            Some(handle) => handle,
            None => {
                let seed = self.store.load().await;
                self.session.start_or_reuse(&seed)
            }
        };

        let mut stream = match handle.send_streaming(&prompt) {
            Ok(stream) => stream,
            Err(error) => {
                tracing::warn!(?token, error = %error, "failed to start model stream");
                self.advance(PhaseTransition::Fail(token), ExchangeEvent::Failed);
                return;
            }
        };

        if let Some(worker) = stream.take_worker() {
            tokio::spawn(worker);
        }

        let mut reply = String::new();
        while let Some(payload) = stream.recv().await {
            match payload {
                StreamEventPayload::Delta(chunk) => {
                    reply.push_str(&chunk);
                    let applied = self.advance(
                        PhaseTransition::Stream(token),
                        ExchangeEvent::Delta(reply.clone()),
                    );
                    if !applied {
                        // Dropping the stream cancels the provider worker.
                        return;
                    }
                }
                StreamEventPayload::Done => {
                    self.complete(token, prompt, reply).await;
                    return;
                }
                StreamEventPayload::Error(message) => {
                    tracing::warn!(?token, error = %message, "model stream failed");
                    self.advance(PhaseTransition::Fail(token), ExchangeEvent::Failed);
                    return;
                }
            }
        }

        tracing::warn!(?token, "model stream ended before a terminal event");
        self.advance(PhaseTransition::Fail(token), ExchangeEvent::Failed);
    }

    async fn complete(&self, token: ExchangeToken, prompt: String, reply: String) {
        let _gate = self.store_gate.lock().await;

        if !self.advance(
            PhaseTransition::Complete(token),
            ExchangeEvent::Completed(reply.clone()),
        ) {
            return;
        }

        let turns = [Turn::user(prompt), Turn::model(reply)];
        let outcome = self.store.append(&turns).await;
        let mut last_error = self
            .last_persistence_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match outcome {
            Ok(()) => *last_error = None,
            Err(error) => {
                tracing::warn!(
                    ?token,
                    error = %error,
                    "failed to persist finished exchange; conversation continues unsaved"
                );
                *last_error = Some(error.to_string());
            }
        }
    }
}
