//! Input lines typed at the prompt.

use shared::domain::{CallType, MessageId, RoomId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliCommand {
    Say(String),
    Typing(bool),
    Join(RoomId),
    Leave,
    Retry(MessageId),
    History,
    Who,
    Call(CallType),
    Hangup,
    Quit,
}

pub fn parse_line(line: &str) -> Result<Option<CliCommand>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(CliCommand::Say(line.to_string())));
    };
    // A leading "//" sends the rest as text.
    if rest.starts_with('/') {
        return Ok(Some(CliCommand::Say(rest.to_string())));
    }

    let mut parts = rest.split_whitespace();
    let name = parts.next().unwrap_or_default();
    let arg = parts.next();
    let command = match (name, arg) {
        ("typing", None | Some("on")) => CliCommand::Typing(true),
        ("typing", Some("off")) => CliCommand::Typing(false),
        ("join", Some(room)) => CliCommand::Join(RoomId::from(room)),
        ("leave", None) => CliCommand::Leave,
        ("retry", Some(id)) => CliCommand::Retry(MessageId::from(id)),
        ("history", None) => CliCommand::History,
        ("who", None) => CliCommand::Who,
        ("call", None | Some("audio")) => CliCommand::Call(CallType::Audio),
        ("call", Some("video")) => CliCommand::Call(CallType::Video),
        ("hangup", None) => CliCommand::Hangup,
        ("quit" | "exit", None) => CliCommand::Quit,
        _ => return Err(format!("unknown command: /{rest}")),
    };
    Ok(Some(command))
}

#[cfg(test)]
#[path = "tests/commands_tests.rs"]
mod tests;
