use std::sync::Arc;

use tokio::sync::watch;

use crate::controller::{ConversationController, SubmitOutcome};
use crate::error::ChatResult;
use crate::message::ConversationState;

/// Actions and state a presentation layer may use.
///
/// The delete confirmation prompt lives here rather than in the controller: showing or
/// dismissing it never touches conversation state.
pub struct ChatBoundary {
    controller: ConversationController,
    delete_prompt: watch::Sender<bool>,
}

impl ChatBoundary {
    pub fn new(controller: ConversationController) -> Self {
        let (delete_prompt, _) = watch::channel(false);
        Self {
            controller,
            delete_prompt,
        }
    }

    pub fn controller(&self) -> &ConversationController {
        &self.controller
    }

    pub fn snapshot(&self) -> Arc<ConversationState> {
        self.controller.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ConversationState>> {
        self.controller.subscribe()
    }

    pub fn subscribe_delete_prompt(&self) -> watch::Receiver<bool> {
        self.delete_prompt.subscribe()
    }

    pub fn is_delete_prompt_visible(&self) -> bool {
        *self.delete_prompt.borrow()
    }

    pub fn submit(&self, text: &str) -> SubmitOutcome {
        self.controller.submit(text)
    }

    /// Shows the confirmation prompt when there is history to delete.
    pub fn request_delete(&self) -> bool {
        let requested = self.controller.request_delete();
        if requested {
            self.delete_prompt.send_replace(true);
        }
        requested
    }

    pub async fn confirm_delete(&self) -> ChatResult<()> {
        self.delete_prompt.send_replace(false);
        self.controller.clear_history().await
    }

    pub fn cancel_delete(&self) {
        self.delete_prompt.send_replace(false);
    }
}
