#![deny(unsafe_code)]

/// Presentation-facing actions and the delete confirmation prompt.
pub mod boundary;
/// Streaming conversation state machine.
pub mod controller;
pub mod error;
/// Display messages, exchange phases and the conversation reducer.
pub mod message;
/// Layered settings and their persistence.
pub mod settings;

pub use boundary::ChatBoundary;
pub use controller::{ControllerConfig, ConversationController, ExchangeTask, SubmitOutcome};
pub use error::{ChatError, ChatResult};
pub use message::{
    ConversationState, DisplayMessage, ERROR_PLACEHOLDER, ExchangeEvent, ExchangePhase,
    ExchangeToken, PhaseTransition, Sender, TransitionRejection,
};
pub use settings::{Settings, SettingsError, SettingsStore};
