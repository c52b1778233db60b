use std::time::Duration;

/// One line of terminal input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send(String),
    Delete,
    Delay(Duration),
    Quit,
    Help,
    Blank,
    Invalid(String),
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Self::Blank;
        }

        let Some(rest) = trimmed.strip_prefix('/') else {
            return Self::Send(line.trim_end_matches(['\r', '\n']).to_string());
        };

        let mut parts = rest.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some("delete"), None, _) => Self::Delete,
            (Some("quit" | "exit"), None, _) => Self::Quit,
            (Some("help"), None, _) => Self::Help,
            (Some("delay"), Some(value), None) => match value.parse::<u64>() {
                Ok(millis) => Self::Delay(Duration::from_millis(millis)),
                Err(_) => Self::Invalid(format!("`{value}` is not a number of milliseconds")),
            },
            (Some("delay"), _, _) => Self::Invalid("usage: /delay <milliseconds>".to_string()),
            _ => Self::Invalid(format!("unknown command `/{rest}`")),
        }
    }
}

/// Answer to the delete confirmation prompt.
pub fn is_affirmative(line: &str) -> bool {
    matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

pub const HELP: &str = "\
Type a message and press enter to send it.
  /delete       delete the whole conversation history
  /delay <ms>   wait this long before each reply starts
  /help         show this help
  /quit         leave";
