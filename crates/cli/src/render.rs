use std::sync::Arc;

use phoenix_chat::{ConversationState, DisplayMessage, Sender};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;

const USER_LABEL: &str = "you";
const MODEL_LABEL: &str = "gemini";

/// Transcript of everything already in the conversation, printed once at startup.
pub fn history_transcript(state: &ConversationState) -> String {
    let mut transcript = String::new();
    for message in &state.messages {
        transcript.push_str(&format!("{}> {}\n", label(message), message.text));
    }
    transcript
}

fn label(message: &DisplayMessage) -> &'static str {
    match message.sender {
        Sender::User => USER_LABEL,
        Sender::Ai => MODEL_LABEL,
    }
}

/// Tracks what has already been written so each snapshot only prints its growth.
#[derive(Debug, Default)]
pub struct Follower {
    rendered: usize,
    printed: Option<String>,
    awaiting_shown: bool,
}

impl Follower {
    pub fn starting_at(state: &ConversationState) -> Self {
        Self {
            rendered: state.messages.len(),
            ..Self::default()
        }
    }

    /// Output for the next snapshot. User messages are skipped; the terminal already echoed them.
    pub fn advance(&mut self, state: &ConversationState) -> String {
        let mut out = String::new();

        if state.messages.len() < self.rendered {
            if self.printed.take().is_some() {
                out.push('\n');
            }
            self.rendered = 0;
            self.awaiting_shown = false;
        }

        if state.is_awaiting_first_token && !self.awaiting_shown {
            out.push_str(&format!("{MODEL_LABEL}> "));
            self.awaiting_shown = true;
            self.printed = Some(String::new());
        }

        while let Some(message) = state.messages.get(self.rendered) {
            if message.sender == Sender::User {
                self.rendered += 1;
                continue;
            }

            let printed = match self.printed.take() {
                Some(printed) => printed,
                None => {
                    out.push_str(&format!("{MODEL_LABEL}> "));
                    String::new()
                }
            };
            match message.text.strip_prefix(printed.as_str()) {
                Some(growth) => out.push_str(growth),
                // Replaced rather than grown, e.g. by the failure placeholder.
                None => out.push_str(&format!("\n{MODEL_LABEL}> {}", message.text)),
            }

            if message.is_streaming {
                self.printed = Some(message.text.clone());
                break;
            }

            out.push('\n');
            self.rendered += 1;
            self.awaiting_shown = false;
        }

        out
    }
}

/// Prints conversation growth until the controller goes away.
pub async fn follow(mut receiver: watch::Receiver<Arc<ConversationState>>) {
    let mut follower = Follower::starting_at(&receiver.borrow_and_update());
    let mut stdout = tokio::io::stdout();

    while receiver.changed().await.is_ok() {
        let state = receiver.borrow_and_update().clone();
        let out = follower.advance(&state);
        if out.is_empty() {
            continue;
        }
        if let Err(error) = stdout.write_all(out.as_bytes()).await {
            tracing::warn!(error = %error, "failed to render conversation");
            return;
        }
        let _ = stdout.flush().await;
    }
}
