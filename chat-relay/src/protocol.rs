//! Line protocol spoken between the relay and its clients.
//!
//! Every frame is one UTF-8 line terminated by `\n`. The first line a client
//! sends is its nickname; after that each line is parsed into a [`Command`].
//! Lines the server sends are plain text: `[SYSTEM] ...` notices,
//! `<nickname>> ...` broadcasts, and the two whisper forms.

/// Exact line that ends a session.
pub const QUIT_COMMAND: &str = "/quit";

/// Prefix (including the separating space) of a whisper line.
pub const WHISPER_PREFIX: &str = "/w ";

const SYSTEM_TAG: &str = "[SYSTEM]";

/// A single line received from a registered client.
#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    /// Blank or whitespace-only line. Ignored.
    Empty,
    Quit,
    Whisper { target: String, content: String },
    /// A whisper line without both a target and content.
    WhisperUsage,
    /// Anything else, already trimmed.
    Say { text: String },
}

impl Command {
    /// Parses a raw line read from an active session.
    ///
    /// The line is trimmed first. Whisper lines are split on the first two
    /// single spaces only, so the content keeps its inner spacing and a doubled
    /// space after the prefix produces an empty target.
    pub fn parse(line: &str) -> Self {
        let text = line.trim();
        if text.is_empty() {
            return Command::Empty;
        }

        if text == QUIT_COMMAND {
            return Command::Quit;
        }

        if text.starts_with(WHISPER_PREFIX) {
            let mut parts = text.splitn(3, ' ');
            let _prefix = parts.next();
            return match (parts.next(), parts.next()) {
                (Some(target), Some(content)) => Command::Whisper {
                    target: target.to_string(),
                    content: content.to_string(),
                },
                _ => Command::WhisperUsage,
            };
        }

        Command::Say {
            text: text.to_string(),
        }
    }
}

fn system(message: &str) -> String {
    format!("{SYSTEM_TAG} {message}")
}

pub fn welcome() -> String {
    system(&format!(
        "connected. \"{QUIT_COMMAND}\" to leave, \"{WHISPER_PREFIX}<nickname> <message>\" to whisper."
    ))
}

pub fn empty_nickname() -> String {
    system("nickname cannot be empty.")
}

pub fn unreadable_nickname() -> String {
    system("nickname must be a single line of valid UTF-8.")
}

pub fn joined(nickname: &str) -> String {
    system(&format!("[{nickname}] joined the chat."))
}

pub fn departed(nickname: &str) -> String {
    system(&format!("[{nickname}] left the chat."))
}

pub fn whisper_usage() -> String {
    system(&format!("usage: {WHISPER_PREFIX}<nickname> <message>"))
}

pub fn whisper_target_missing(target: &str) -> String {
    system(&format!("no user named [{target}]."))
}

pub fn shutting_down() -> String {
    system("server shutting down.")
}

pub fn chat(nickname: &str, text: &str) -> String {
    format!("{nickname}> {text}")
}

pub fn whisper(sender: &str, content: &str) -> String {
    format!("(whisper) {sender}> {content}")
}

pub fn whisper_sent(target: &str, content: &str) -> String {
    format!("(whisper sent) to {target}> {content}")
}
