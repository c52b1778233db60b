use phoenix_storage::{Role, Turn};

/// Fixed text shown in place of a reply when an exchange fails.
pub const ERROR_PLACEHOLDER: &str = "Sorry, there was an unexpected error!";

/// Who authored a display message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sender {
    User,
    Ai,
}

impl From<Role> for Sender {
    fn from(role: Role) -> Self {
        match role {
            Role::User => Self::User,
            Role::Model => Self::Ai,
        }
    }
}

/// Presentation-facing message; the trailing AI message may still be growing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayMessage {
    pub sender: Sender,
    pub text: String,
    pub is_streaming: bool,
}

impl DisplayMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            sender: Sender::User,
            text: text.into(),
            is_streaming: false,
        }
    }

    pub fn ai(text: impl Into<String>) -> Self {
        Self {
            sender: Sender::Ai,
            text: text.into(),
            is_streaming: false,
        }
    }

    pub fn ai_streaming(text: impl Into<String>) -> Self {
        Self {
            is_streaming: true,
            ..Self::ai(text)
        }
    }
}

impl From<&Turn> for DisplayMessage {
    fn from(turn: &Turn) -> Self {
        Self {
            sender: turn.role.into(),
            text: turn.text.clone(),
            is_streaming: false,
        }
    }
}

/// Immutable snapshot published to subscribers after every state change.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConversationState {
    pub messages: Vec<DisplayMessage>,
    pub is_awaiting_first_token: bool,
}

/// Input to the conversation reducer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeEvent {
    Submitted(String),
    /// Cumulative reply text received so far.
    Delta(String),
    Completed(String),
    Failed,
}

impl ConversationState {
    pub fn from_turns(turns: &[Turn]) -> Self {
        Self {
            messages: turns.iter().map(DisplayMessage::from).collect(),
            is_awaiting_first_token: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn streaming_message(&self) -> Option<&DisplayMessage> {
        self.messages.last().filter(|message| message.is_streaming)
    }

    /// Folds one exchange event into the state.
    pub fn apply(&mut self, event: ExchangeEvent) {
        match event {
            ExchangeEvent::Submitted(text) => {
                self.messages.push(DisplayMessage::user(text));
                self.is_awaiting_first_token = true;
            }
            ExchangeEvent::Delta(cumulative) => {
                self.is_awaiting_first_token = false;
                match self.streaming_message_mut() {
                    // Never let a shorter cumulative text replace a longer one.
                    Some(message) if cumulative.len() >= message.text.len() => {
                        message.text = cumulative;
                    }
                    Some(_) => {}
                    None => self.messages.push(DisplayMessage::ai_streaming(cumulative)),
                }
            }
            ExchangeEvent::Completed(reply) => {
                self.is_awaiting_first_token = false;
                match self.streaming_message_mut() {
                    Some(message) => {
                        message.text = reply;
                        message.is_streaming = false;
                    }
                    None => self.messages.push(DisplayMessage::ai(reply)),
                }
            }
            ExchangeEvent::Failed => {
                self.is_awaiting_first_token = false;
                match self.streaming_message_mut() {
                    Some(message) => {
                        message.text = ERROR_PLACEHOLDER.to_string();
                        message.is_streaming = false;
                    }
                    None => self.messages.push(DisplayMessage::ai(ERROR_PLACEHOLDER)),
                }
            }
        }
    }

    fn streaming_message_mut(&mut self) -> Option<&mut DisplayMessage> {
        self.messages.last_mut().filter(|message| message.is_streaming)
    }
}

/// Generation tag distinguishing the live exchange from stale ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExchangeToken(pub u64);

impl ExchangeToken {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Lifecycle of the single in-flight exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExchangePhase {
    #[default]
    Idle,
    AwaitingFirstToken(ExchangeToken),
    Streaming(ExchangeToken),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseTransition {
    Start(ExchangeToken),
    Stream(ExchangeToken),
    Complete(ExchangeToken),
    Fail(ExchangeToken),
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionRejection {
    Busy {
        active: ExchangeToken,
        attempted: ExchangeToken,
    },
    Stale {
        active: Option<ExchangeToken>,
        attempted: ExchangeToken,
    },
}

pub type TransitionResult = Result<ExchangePhase, TransitionRejection>;

impl ExchangePhase {
    pub fn active_token(&self) -> Option<ExchangeToken> {
        match self {
            Self::Idle => None,
            Self::AwaitingFirstToken(token) | Self::Streaming(token) => Some(*token),
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Applies one transition. Every transition except `Start` and `Reset` must carry the
    /// active token; `Start` is only legal from `Idle`.
    pub fn apply(&self, transition: PhaseTransition) -> TransitionResult {
        match transition {
            PhaseTransition::Start(token) => match self.active_token() {
                Some(active) => Err(TransitionRejection::Busy {
                    active,
                    attempted: token,
                }),
                None => Ok(Self::AwaitingFirstToken(token)),
            },
            PhaseTransition::Stream(token) => {
                self.ensure_active(token)?;
                Ok(Self::Streaming(token))
            }
            PhaseTransition::Complete(token) | PhaseTransition::Fail(token) => {
                self.ensure_active(token)?;
                Ok(Self::Idle)
            }
            PhaseTransition::Reset => Ok(Self::Idle),
        }
    }

    fn ensure_active(&self, token: ExchangeToken) -> Result<(), TransitionRejection> {
        match self.active_token() {
            Some(active) if active == token => Ok(()),
            active => Err(TransitionRejection::Stale {
                active,
                attempted: token,
            }),
        }
    }
}
