use std::time::Duration;

use shared::domain::{MessageId, RoomId};
use thiserror::Error;

use crate::call::CallPhase;

/// Which part of the session an error belongs to, so the UI can pick the
/// matching recovery affordance (reconnect banner, resend button, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connection,
    Room,
    Send,
    Call,
    History,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("no authentication token available")]
    MissingAuthToken,
    #[error("auth token provider failed: {0}")]
    AuthProvider(String),
    #[error("server rejected authentication: {0}")]
    AuthRejected(String),
    #[error("transport failure: {0}")]
    Network(String),
    #[error("invalid server url: {0}")]
    InvalidUrl(String),
    #[error("not connected")]
    NotConnected,
    #[error("gave up after {attempts} connection attempts")]
    RetriesExhausted { attempts: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomError {
    #[error("room id must not be empty")]
    EmptyRoomId,
    #[error("session is shut down")]
    SessionClosed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("message content is empty")]
    EmptyContent,
    #[error("not a member of room {0}")]
    NotJoined(RoomId),
    #[error("no pending or failed message {0}")]
    UnknownMessage(MessageId),
    #[error("message {0} was not confirmed in time")]
    ConfirmationTimeout(MessageId),
    #[error("server rejected message: {0}")]
    Rejected(String),
    #[error("message collaborator failed: {0}")]
    Collaborator(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("a call is already in progress ({phase:?})")]
    AlreadyInProgress { phase: CallPhase },
    #[error("missing room id for call")]
    MissingRoom,
    #[error("missing auth token for call")]
    MissingAuthToken,
    #[error("media token unavailable: {0}")]
    TokenUnavailable(String),
    #[error("media token request timed out after {0:?}")]
    TokenTimeout(Duration),
    #[error("cannot {action} while call is {phase:?}")]
    InvalidTransition {
        phase: CallPhase,
        action: &'static str,
    },
    #[error("media transport failed to connect: {0}")]
    MediaConnect(String),
    #[error("media device failure: {0}")]
    MediaDevice(String),
    #[error("call attempt was cancelled")]
    Cancelled,
    #[error("no active call")]
    NoActiveCall,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HistoryError {
    #[error("no query collaborator configured")]
    Unavailable,
    #[error("history fetch for room {room_id} failed: {message}")]
    Fetch { room_id: RoomId, message: String },
    #[error("history load for room {0} was cancelled")]
    Cancelled(RoomId),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Room(#[from] RoomError),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error(transparent)]
    Call(#[from] CallError),
    #[error(transparent)]
    History(#[from] HistoryError),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection(_) => ErrorKind::Connection,
            Self::Room(_) => ErrorKind::Room,
            Self::Send(_) => ErrorKind::Send,
            Self::Call(_) => ErrorKind::Call,
            Self::History(_) => ErrorKind::History,
        }
    }

    /// Whether offering a retry makes sense. Call errors never retry on their own.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(ConnectionError::MissingAuthToken)
            | Self::Connection(ConnectionError::InvalidUrl(_)) => false,
            Self::Connection(_) => true,
            Self::Room(_) => false,
            Self::Send(SendError::EmptyContent) | Self::Send(SendError::NotJoined(_)) => false,
            Self::Send(_) => true,
            Self::Call(_) => false,
            Self::History(HistoryError::Unavailable) => false,
            Self::History(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_distinguishable() {
        let errors = [
            CoreError::from(ConnectionError::NotConnected),
            CoreError::from(RoomError::EmptyRoomId),
            CoreError::from(SendError::EmptyContent),
            CoreError::from(CallError::MissingRoom),
            CoreError::from(HistoryError::Unavailable),
        ];
        let kinds: std::collections::HashSet<_> = errors.iter().map(CoreError::kind).collect();
        assert_eq!(kinds.len(), errors.len());
    }

    #[test]
    fn history_fetch_is_retryable_but_call_errors_are_not() {
        let history = CoreError::from(HistoryError::Fetch {
            room_id: RoomId::from("R1"),
            message: "503".into(),
        });
        assert!(history.is_retryable());
        assert!(!CoreError::from(CallError::TokenUnavailable("down".into())).is_retryable());
        assert!(!CoreError::from(ConnectionError::MissingAuthToken).is_retryable());
    }
}
