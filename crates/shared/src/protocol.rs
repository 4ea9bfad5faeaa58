//! Logical events exchanged over the bidirectional chat channel.
//!
//! Every websocket text frame is one JSON object `{ "event": <name>, "data": <payload> }`.
//! Event names follow the chat server's historical spelling (`join-room`,
//! `message-created`, `onlineUsers`, ...), so payload field names are camelCase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ClientMessageId, MessageId, MessageKind, OnlineUser, RoomId, UserId};

/// Client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientRequest {
    #[serde(rename = "join-room")]
    JoinRoom(RoomId),
    #[serde(rename = "leave-room")]
    LeaveRoom(RoomId),
    #[serde(rename = "chat-message")]
    ChatMessage(OutboundMessage),
    #[serde(rename = "typing")]
    Typing(TypingSignal),
}

impl ClientRequest {
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinRoom(_) => "join-room",
            Self::LeaveRoom(_) => "leave-room",
            Self::ChatMessage(_) => "chat-message",
            Self::Typing(_) => "typing",
        }
    }

    pub fn to_frame(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_frame(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    #[serde(rename = "chatRoomId")]
    pub room_id: RoomId,
    #[serde(rename = "userId")]
    pub sender_id: UserId,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_message_id: Option<ClientMessageId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingSignal {
    #[serde(rename = "chatRoomId")]
    pub room_id: RoomId,
    pub is_typing: bool,
}

/// Server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "message-created", alias = "chat-message")]
    MessageCreated(MessagePayload),
    #[serde(rename = "user-typing")]
    UserTyping(TypingPayload),
    #[serde(rename = "onlineUsers")]
    OnlineUsers(Vec<OnlineUser>),
    #[serde(rename = "message-error")]
    MessageError(MessageErrorPayload),
}

impl ServerEvent {
    pub fn to_frame(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_frame(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

/// A chat message as pushed by the server or returned by the query collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    #[serde(alias = "_id")]
    pub id: MessageId,
    #[serde(rename = "chatRoomId")]
    pub room_id: RoomId,
    #[serde(rename = "userId")]
    pub sender_id: UserId,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: String,
    #[serde(deserialize_with = "crate::timestamp::deserialize")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_message_id: Option<ClientMessageId>,
}

impl MessagePayload {
    /// Sender, kind and content: the fields the dedup heuristic compares.
    pub fn same_body(&self, other: &MessagePayload) -> bool {
        self.sender_id == other.sender_id && self.kind == other.kind && self.content == other.content
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub user_id: UserId,
    pub username: String,
    pub is_typing: bool,
    #[serde(default, rename = "chatRoomId", skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageErrorPayload {
    #[serde(alias = "error")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_message_id: Option<ClientMessageId>,
    #[serde(default, rename = "chatRoomId", skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
