//! HTTP-backed collaborators: the media-token endpoint and the GraphQL
//! query/mutation service.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use shared::{
    domain::{MessageId, MessageKind, RoomId, RoomSummary, UserId},
    error::ApiError,
    protocol::{MessagePayload, OutboundMessage},
    timestamp,
};
use tracing::debug;

use crate::{error::HistoryError, AuthTokenProvider, HistoryStore, MediaTokenProvider};

pub struct HttpMediaTokenProvider {
    http: Client,
    endpoint: String,
}

impl HttpMediaTokenProvider {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[derive(Serialize)]
struct MediaTokenRequest<'a> {
    room: &'a str,
}

#[derive(Deserialize)]
struct MediaTokenResponse {
    token: String,
}

#[async_trait]
impl MediaTokenProvider for HttpMediaTokenProvider {
    async fn fetch_media_token(&self, auth_token: &str, room_id: &RoomId) -> Result<String> {
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(auth_token)
            .json(&MediaTokenRequest {
                room: room_id.as_str(),
            })
            .send()
            .await
            .with_context(|| format!("media token request to {} failed", self.endpoint))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiError>(&body)
                .map(|err| err.message)
                .unwrap_or_else(|_| "an unknown error occurred".to_string());
            return Err(anyhow!("media token endpoint returned {status}: {message}"));
        }

        let body: MediaTokenResponse = response
            .json()
            .await
            .context("failed to parse media token response")?;
        Ok(body.token)
    }
}

const GET_MESSAGES: &str = "query getMessages($chatRoomId: ID!) {
  getMessages(chatRoomId: $chatRoomId) {
    chatRoomId
    ChatRoomsMessages { _id userId type content createdAt }
  }
}";

const CREATE_MESSAGE: &str = "mutation createMessage($chatRoomId: ID!, $userId: String!, $type: MediaType!, $content: String) {
  createMessage(chatRoomId: $chatRoomId, userId: $userId, type: $type, content: $content) {
    chatRoomId
    ChatRoomsMessages { _id userId type content createdAt }
  }
}";

const GET_CHAT_ROOM_BY_ID: &str = "query GetChatRoomById($id: String!) {
  getChatRoomById(_id: $id) { _id participants appointmentId allowedMedia }
}";

#[derive(Deserialize)]
struct GraphqlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

#[derive(Deserialize)]
struct GraphqlError {
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoomMessages {
    chat_room_id: RoomId,
    #[serde(rename = "ChatRoomsMessages", default)]
    messages: Vec<StoredMessage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredMessage {
    #[serde(rename = "_id", default)]
    id: Option<String>,
    user_id: UserId,
    #[serde(rename = "type")]
    kind: MessageKind,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    created_at: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetMessagesData {
    get_messages: Vec<RoomMessages>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateMessageData {
    create_message: Option<RoomMessages>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetChatRoomData {
    get_chat_room_by_id: Option<StoredRoom>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredRoom {
    #[serde(rename = "_id")]
    id: RoomId,
    #[serde(default)]
    participants: Vec<UserId>,
    #[serde(default)]
    appointment_id: Option<String>,
    #[serde(default)]
    allowed_media: Option<String>,
}

/// Query/mutation collaborator speaking the chat service's GraphQL schema.
pub struct GraphqlHistoryStore {
    http: Client,
    endpoint: String,
    auth: Arc<dyn AuthTokenProvider>,
}

impl GraphqlHistoryStore {
    pub fn new(endpoint: impl Into<String>, auth: Arc<dyn AuthTokenProvider>) -> Self {
        Self {
            http: Client::new(),
            endpoint: endpoint.into(),
            auth,
        }
    }

    async fn execute<T: DeserializeOwned>(&self, query: &str, variables: Value) -> Result<T> {
        let mut request = self
            .http
            .post(&self.endpoint)
            .json(&json!({ "query": query, "variables": variables }));
        if let Some(token) = self.auth.fetch_token().await? {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("graphql request to {} failed", self.endpoint))?
            .error_for_status()?;
        let body: GraphqlResponse<T> = response
            .json()
            .await
            .context("failed to parse graphql response")?;

        if let Some(first) = body.errors.first() {
            return Err(anyhow!("graphql error: {}", first.message));
        }
        body.data.ok_or_else(|| anyhow!("graphql response carried no data"))
    }
}

#[async_trait]
impl HistoryStore for GraphqlHistoryStore {
    async fn fetch_history(&self, room_id: &RoomId) -> Result<Vec<MessagePayload>> {
        let data: GetMessagesData = self
            .execute(GET_MESSAGES, json!({ "chatRoomId": room_id }))
            .await?;
        let Some(room) = data.get_messages.into_iter().next() else {
            return Ok(Vec::new());
        };
        let messages = to_payloads(room);
        debug!(room_id = %room_id, count = messages.len(), "timeline: history fetched");
        Ok(messages)
    }

    async fn create_message(&self, message: &OutboundMessage) -> Result<Option<MessagePayload>> {
        let data: CreateMessageData = self
            .execute(
                CREATE_MESSAGE,
                json!({
                    "chatRoomId": message.room_id,
                    "userId": message.sender_id,
                    "type": message.kind.as_wire(),
                    "content": message.content,
                }),
            )
            .await?;
        let Some(room) = data.create_message else {
            return Ok(None);
        };

        // The mutation answers with the room's messages; ours is the newest with our body.
        let created = to_payloads(room).into_iter().rev().find(|stored| {
            stored.sender_id == message.sender_id
                && stored.kind == message.kind
                && stored.content == message.content
        });
        Ok(created.map(|mut created| {
            created.client_message_id = message.client_message_id.clone();
            created
        }))
    }

    async fn fetch_room(&self, room_id: &RoomId) -> Result<Option<RoomSummary>> {
        let data: GetChatRoomData = self
            .execute(GET_CHAT_ROOM_BY_ID, json!({ "id": room_id }))
            .await?;
        Ok(data.get_chat_room_by_id.map(|room| RoomSummary {
            room_id: room.id,
            participants: room.participants,
            appointment_id: room.appointment_id,
            allowed_media: room.allowed_media,
        }))
    }
}

/// History served by the relay itself at `GET /api/rooms/:room_id/messages`.
/// The relay persists through the realtime channel and keeps no room
/// metadata, so the other two operations are unavailable.
pub struct RelayHistoryStore {
    http: Client,
    server_url: String,
    auth: Arc<dyn AuthTokenProvider>,
}

impl RelayHistoryStore {
    pub fn new(server_url: impl Into<String>, auth: Arc<dyn AuthTokenProvider>) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into(),
            auth,
        }
    }

    fn messages_url(&self, room_id: &RoomId) -> String {
        format!(
            "{}/api/rooms/{room_id}/messages",
            self.server_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl HistoryStore for RelayHistoryStore {
    async fn fetch_history(&self, room_id: &RoomId) -> Result<Vec<MessagePayload>> {
        let url = self.messages_url(room_id);
        let mut request = self.http.get(&url);
        if let Some(token) = self.auth.fetch_token().await? {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("history request to {url} failed"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiError>(&body)
                .map(|err| err.message)
                .unwrap_or_else(|_| "an unknown error occurred".to_string());
            return Err(anyhow!("history endpoint returned {status}: {message}"));
        }

        let messages: Vec<MessagePayload> = response
            .json()
            .await
            .context("failed to parse relay history")?;
        debug!(room_id = %room_id, count = messages.len(), "timeline: history fetched from relay");
        Ok(messages)
    }

    async fn create_message(&self, _message: &OutboundMessage) -> Result<Option<MessagePayload>> {
        Err(HistoryError::Unavailable.into())
    }

    async fn fetch_room(&self, _room_id: &RoomId) -> Result<Option<RoomSummary>> {
        Err(HistoryError::Unavailable.into())
    }
}

fn to_payloads(room: RoomMessages) -> Vec<MessagePayload> {
    let room_id = room.chat_room_id;
    room.messages
        .into_iter()
        .enumerate()
        .map(|(index, stored)| {
            let created_at = stored.created_at.as_ref().and_then(timestamp::parse);
            let id = stored.id.unwrap_or_else(|| match &stored.created_at {
                Some(Value::String(raw)) => format!("{}-{raw}", stored.user_id),
                Some(Value::Number(raw)) => format!("{}-{raw}", stored.user_id),
                _ => format!("{}-{index}", stored.user_id),
            });
            MessagePayload {
                id: MessageId::new(id),
                room_id: room_id.clone(),
                sender_id: stored.user_id,
                kind: stored.kind,
                content: stored.content.unwrap_or_default(),
                created_at: created_at.unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
                client_message_id: None,
            }
        })
        .collect()
}

#[cfg(test)]
#[path = "tests/http_tests.rs"]
mod tests;
