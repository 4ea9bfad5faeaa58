use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use livekit_integration::{LiveKitRoomConnector, LiveKitRoomSession};
use shared::{
    domain::{CallType, MessageId, MessageKind, OnlineUser, RoomId, RoomSummary, UserId},
    protocol::{
        ClientRequest, MessageErrorPayload, MessagePayload, OutboundMessage, ServerEvent,
        TypingPayload,
    },
};
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod call;
pub mod config;
pub mod connection;
pub mod error;
pub mod http;
pub mod presence;
pub mod rooms;
pub mod timeline;
pub mod transport;

use call::{CallSessionOrchestrator, CallState, MediaDevices, MediaToken};
use config::{ClientSettings, SendRoute};
use connection::{
    ConnectionManager, ConnectionSnapshot, ConnectionState, ReconnectPolicy, TransportEvent,
    TransportHandle,
};
use error::{CallError, ConnectionError, CoreError, ErrorKind, HistoryError, RoomError, SendError};
use http::{GraphqlHistoryStore, HttpMediaTokenProvider, RelayHistoryStore};
use presence::{PresenceAggregator, TypingTimings, TypingUser};
use rooms::RoomMembershipTracker;
use timeline::{HistoryMerge, IncomingOutcome, TimelineEntry, Timelines};
use transport::{TransportConnector, WebSocketConnector};

/// Supplies the application auth token. Called for every connection attempt
/// and every media-token exchange; implementations should refresh as needed.
#[async_trait]
pub trait AuthTokenProvider: Send + Sync {
    async fn fetch_token(&self) -> Result<Option<String>>;
}

pub struct StaticTokenProvider {
    token: Option<String>,
}

impl StaticTokenProvider {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }
}

#[async_trait]
impl AuthTokenProvider for StaticTokenProvider {
    async fn fetch_token(&self) -> Result<Option<String>> {
        Ok(self.token.clone())
    }
}

/// Exchanges an app token and room for a short-lived media session token.
#[async_trait]
pub trait MediaTokenProvider: Send + Sync {
    async fn fetch_media_token(&self, auth_token: &str, room_id: &RoomId) -> Result<String>;
}

pub struct MissingMediaTokenProvider;

#[async_trait]
impl MediaTokenProvider for MissingMediaTokenProvider {
    async fn fetch_media_token(&self, _auth_token: &str, _room_id: &RoomId) -> Result<String> {
        Err(anyhow!("media token provider is not configured"))
    }
}

/// Query/mutation collaborator for history, sends and room metadata.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn fetch_history(&self, room_id: &RoomId) -> Result<Vec<MessagePayload>>;
    /// Persists a message. `Some` is the authoritative stored copy.
    async fn create_message(&self, message: &OutboundMessage) -> Result<Option<MessagePayload>>;
    async fn fetch_room(&self, room_id: &RoomId) -> Result<Option<RoomSummary>>;
}

pub struct MissingHistoryStore;

#[async_trait]
impl HistoryStore for MissingHistoryStore {
    async fn fetch_history(&self, _room_id: &RoomId) -> Result<Vec<MessagePayload>> {
        Err(HistoryError::Unavailable.into())
    }

    async fn create_message(&self, _message: &OutboundMessage) -> Result<Option<MessagePayload>> {
        Err(HistoryError::Unavailable.into())
    }

    async fn fetch_room(&self, _room_id: &RoomId) -> Result<Option<RoomSummary>> {
        Err(HistoryError::Unavailable.into())
    }
}

/// Everything a UI needs to re-render, in the order it happened.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    ConnectionChanged(ConnectionSnapshot),
    MembershipChanged {
        joined: Vec<RoomId>,
    },
    TimelineUpdated {
        room_id: RoomId,
    },
    MessageConfirmed {
        room_id: RoomId,
        temp_id: MessageId,
    },
    MessageFailed {
        room_id: RoomId,
        temp_id: MessageId,
        reason: String,
    },
    HistoryLoaded {
        room_id: RoomId,
        merge: HistoryMerge,
    },
    TypingChanged {
        room_id: RoomId,
        users: Vec<TypingUser>,
    },
    OnlineUsersChanged(Vec<OnlineUser>),
    CallStateChanged(CallState),
    Error {
        kind: ErrorKind,
        message: String,
    },
}

/// One signed-in realtime session: connection, rooms, timelines, presence and calls.
pub struct ChatClient {
    settings: ClientSettings,
    local_user: UserId,
    auth: Arc<dyn AuthTokenProvider>,
    history: Arc<dyn HistoryStore>,
    connection: Arc<ConnectionManager>,
    transport: TransportHandle,
    rooms: Arc<RoomMembershipTracker>,
    calls: Arc<CallSessionOrchestrator>,
    timelines: Mutex<Timelines>,
    presence: Mutex<PresenceAggregator>,
    views: Mutex<HashMap<RoomId, u64>>,
    next_view: AtomicU64,
    events: broadcast::Sender<ChatEvent>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ChatClient {
    /// Wires the websocket transport and HTTP collaborators from `settings`.
    pub fn new(
        settings: ClientSettings,
        local_user: UserId,
        auth: Arc<dyn AuthTokenProvider>,
    ) -> Result<Arc<Self>, ConnectionError> {
        let connector = Arc::new(WebSocketConnector::new(settings.websocket_url()?));
        let media_tokens = Arc::new(HttpMediaTokenProvider::new(settings.media_token_endpoint()));
        let history: Arc<dyn HistoryStore> = match &settings.graphql_url {
            Some(url) => Arc::new(GraphqlHistoryStore::new(url.clone(), Arc::clone(&auth))),
            None => Arc::new(RelayHistoryStore::new(
                settings.server_url.clone(),
                Arc::clone(&auth),
            )),
        };
        Ok(Self::new_with_dependencies(
            settings,
            local_user,
            auth,
            connector,
            media_tokens,
            history,
        ))
    }

    pub fn new_with_dependencies(
        settings: ClientSettings,
        local_user: UserId,
        auth: Arc<dyn AuthTokenProvider>,
        connector: Arc<dyn TransportConnector>,
        media_tokens: Arc<dyn MediaTokenProvider>,
        history: Arc<dyn HistoryStore>,
    ) -> Arc<Self> {
        let connection =
            ConnectionManager::new(connector, ReconnectPolicy::from_settings(&settings));
        let transport = connection.handle();
        let rooms = RoomMembershipTracker::new(transport.clone(), settings.room_signal_debounce);
        let calls = CallSessionOrchestrator::new(
            Arc::clone(&auth),
            media_tokens,
            settings.call_token_timeout,
        );
        let presence = PresenceAggregator::new(
            local_user.clone(),
            TypingTimings {
                ttl: settings.typing_ttl,
                renew_interval: settings.typing_renew_interval,
                idle_timeout: settings.typing_idle_timeout,
            },
        );
        let (events, _) = broadcast::channel(1024);

        Arc::new(Self {
            timelines: Mutex::new(Timelines::new(settings.dedup_window)),
            presence: Mutex::new(presence),
            settings,
            local_user,
            auth,
            history,
            connection,
            transport,
            rooms,
            calls,
            views: Mutex::new(HashMap::new()),
            next_view: AtomicU64::new(0),
            events,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn connection_snapshot(&self) -> ConnectionSnapshot {
        self.connection.snapshot()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.connection.watch_state()
    }

    pub fn calls(&self) -> &Arc<CallSessionOrchestrator> {
        &self.calls
    }

    /// Starts the background loops and connects. A missing auth token fails
    /// here without any connection attempt.
    pub async fn start(self: &Arc<Self>) -> Result<ConnectionSnapshot, CoreError> {
        if self.shutdown.is_cancelled() {
            return Err(RoomError::SessionClosed.into());
        }

        {
            let mut tasks = self.tasks.lock().await;
            if tasks.is_empty() {
                let transport_events = self.connection.subscribe();
                tasks.push(tokio::spawn(Arc::clone(self).pump(transport_events)));
                tasks.push(tokio::spawn(Arc::clone(self).housekeeping()));
                tasks.push(tokio::spawn(Arc::clone(self).forward_call_state()));
            }
        }

        match self.connection.connect(Arc::clone(&self.auth)).await {
            Ok(snapshot) => Ok(snapshot),
            Err(err) => {
                let err = CoreError::from(err);
                self.report(&err);
                Err(err)
            }
        }
    }

    /// Tears the session down: connection, memberships, views and any call.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if !matches!(self.calls.phase(), call::CallPhase::Idle | call::CallPhase::Ended) {
            let _ = self.calls.end_call().await;
        }
        self.connection.disconnect().await;
        self.rooms.clear().await;
        self.timelines.lock().await.clear();
        self.presence.lock().await.reset_after_reconnect();
        self.views.lock().await.clear();
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        info!("conn: session shut down");
    }

    /// Joins `room_id` (leaving any other room), loads its history and returns
    /// a handle whose lifetime scopes the room view.
    pub async fn open_room(self: &Arc<Self>, room_id: &RoomId) -> Result<RoomView, CoreError> {
        if self.shutdown.is_cancelled() {
            return Err(RoomError::SessionClosed.into());
        }
        let left = self.rooms.join_room(room_id).await?;
        for stale in &left {
            self.forget_room(stale).await;
        }
        self.timelines.lock().await.room_mut(room_id);
        self.emit_membership().await;

        let view_id = self.next_view.fetch_add(1, Ordering::SeqCst) + 1;
        self.views.lock().await.insert(room_id.clone(), view_id);

        let cancel = self.shutdown.child_token();
        let client = Arc::clone(self);
        let room = room_id.clone();
        let history_cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = client.load_history_with(&room, &history_cancel).await;
        });

        Ok(RoomView {
            client: Arc::clone(self),
            room_id: room_id.clone(),
            view_id,
            cancel,
            closed: false,
        })
    }

    /// Keeps exactly `rooms` joined, without view handles.
    pub async fn join_rooms(&self, rooms: &[RoomId]) -> Result<(), CoreError> {
        let left = self.rooms.join_rooms(rooms).await?;
        for stale in &left {
            self.forget_room(stale).await;
        }
        {
            let mut timelines = self.timelines.lock().await;
            for room in rooms {
                timelines.room_mut(room);
            }
        }
        self.emit_membership().await;
        Ok(())
    }

    /// Returns whether the room was joined.
    pub async fn leave_room(&self, room_id: &RoomId) -> bool {
        let left = self.rooms.leave_room(room_id).await;
        if left {
            self.forget_room(room_id).await;
            self.views.lock().await.remove(room_id);
            self.emit_membership().await;
        }
        left
    }

    pub async fn joined_rooms(&self) -> Vec<RoomId> {
        self.rooms.joined_rooms().await
    }

    pub async fn load_history(&self, room_id: &RoomId) -> Result<HistoryMerge, CoreError> {
        let cancel = self.shutdown.child_token();
        self.load_history_with(room_id, &cancel).await
    }

    async fn load_history_with(
        &self,
        room_id: &RoomId,
        cancel: &CancellationToken,
    ) -> Result<HistoryMerge, CoreError> {
        let fetched = tokio::select! {
            _ = cancel.cancelled() => Err(HistoryError::Cancelled(room_id.clone())),
            fetched = self.history.fetch_history(room_id) => fetched.map_err(|err| history_error(room_id, err)),
        };

        let still_wanted = !cancel.is_cancelled() && self.rooms.is_member(room_id).await;
        let result = match fetched {
            Ok(_) if !still_wanted => Err(HistoryError::Cancelled(room_id.clone())),
            Ok(batch) => {
                let merge = self.timelines.lock().await.room_mut(room_id).load_history(batch);
                debug!(
                    room_id = %room_id,
                    appended = merge.appended,
                    duplicates = merge.duplicates,
                    "timeline: history merged"
                );
                for temp_id in &merge.confirmed {
                    self.send_event(ChatEvent::MessageConfirmed {
                        room_id: room_id.clone(),
                        temp_id: temp_id.clone(),
                    });
                }
                self.send_event(ChatEvent::HistoryLoaded {
                    room_id: room_id.clone(),
                    merge: merge.clone(),
                });
                self.send_event(ChatEvent::TimelineUpdated {
                    room_id: room_id.clone(),
                });
                Ok(merge)
            }
            Err(err) => Err(err),
        };

        result.map_err(|err| {
            let err = CoreError::from(err);
            if !matches!(err, CoreError::History(HistoryError::Cancelled(_))) {
                self.report(&err);
            }
            err
        })
    }

    pub async fn messages(&self, room_id: &RoomId) -> Vec<TimelineEntry> {
        self.timelines
            .lock()
            .await
            .room(room_id)
            .map(|timeline| timeline.entries().to_vec())
            .unwrap_or_default()
    }

    /// Appends the message optimistically and sends it. Returns the optimistic
    /// copy; while offline it stays pending and is sent after reconnecting.
    pub async fn send_message(
        &self,
        room_id: &RoomId,
        kind: MessageKind,
        content: &str,
    ) -> Result<MessagePayload, CoreError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(SendError::EmptyContent.into());
        }
        if !self.rooms.is_member(room_id).await {
            return Err(SendError::NotJoined(room_id.clone()).into());
        }

        let optimistic = self.timelines.lock().await.room_mut(room_id).append_optimistic(
            self.local_user.clone(),
            kind,
            content.to_string(),
            Utc::now(),
        );
        self.send_event(ChatEvent::TimelineUpdated {
            room_id: room_id.clone(),
        });

        let stop = self
            .presence
            .lock()
            .await
            .set_typing(room_id, false, Instant::now());
        if let Some(signal) = stop {
            let _ = self.transport.emit(ClientRequest::Typing(signal)).await;
        }

        self.dispatch(optimistic.clone()).await?;
        Ok(optimistic)
    }

    /// Re-sends a failed message under its original idempotency key.
    pub async fn retry_message(&self, room_id: &RoomId, temp_id: &MessageId) -> Result<(), CoreError> {
        let message = self
            .timelines
            .lock()
            .await
            .room_mut(room_id)
            .retry(temp_id)?;
        self.send_event(ChatEvent::TimelineUpdated {
            room_id: room_id.clone(),
        });
        self.dispatch(message).await
    }

    async fn dispatch(&self, message: MessagePayload) -> Result<(), CoreError> {
        let room_id = message.room_id.clone();
        let temp_id = message.id.clone();
        let outbound = OutboundMessage {
            room_id: room_id.clone(),
            sender_id: message.sender_id.clone(),
            kind: message.kind,
            content: message.content.clone(),
            client_message_id: message.client_message_id.clone(),
        };

        match self.settings.send_route {
            SendRoute::Transport => {
                match self.transport.emit(ClientRequest::ChatMessage(outbound)).await {
                    Ok(()) => {
                        self.timelines
                            .lock()
                            .await
                            .room_mut(&room_id)
                            .mark_dispatched(&temp_id, Instant::now());
                        debug!(room_id = %room_id, temp_id = %temp_id, "timeline: message dispatched");
                    }
                    Err(_) => {
                        debug!(room_id = %room_id, temp_id = %temp_id, "timeline: offline, message queued");
                    }
                }
                Ok(())
            }
            SendRoute::Collaborator => {
                self.timelines
                    .lock()
                    .await
                    .room_mut(&room_id)
                    .mark_dispatched(&temp_id, Instant::now());
                match self.history.create_message(&outbound).await {
                    Ok(Some(stored)) => {
                        let confirmed = self
                            .timelines
                            .lock()
                            .await
                            .room_mut(&room_id)
                            .confirm(&temp_id, stored);
                        if confirmed {
                            self.send_event(ChatEvent::MessageConfirmed {
                                room_id: room_id.clone(),
                                temp_id,
                            });
                        }
                        self.send_event(ChatEvent::TimelineUpdated { room_id });
                        Ok(())
                    }
                    Ok(None) => Ok(()),
                    Err(err) => {
                        let reason = err.to_string();
                        self.timelines
                            .lock()
                            .await
                            .room_mut(&room_id)
                            .mark_failed(&temp_id, reason.clone());
                        self.send_event(ChatEvent::MessageFailed {
                            room_id,
                            temp_id,
                            reason: reason.clone(),
                        });
                        let err = CoreError::from(SendError::Collaborator(reason));
                        self.report(&err);
                        Err(err)
                    }
                }
            }
        }
    }

    /// Local typing intent; rapid toggles are coalesced before reaching the server.
    pub async fn set_typing(&self, room_id: &RoomId, is_typing: bool) -> Result<(), CoreError> {
        if !self.rooms.is_member(room_id).await {
            return Err(SendError::NotJoined(room_id.clone()).into());
        }
        let signal = self
            .presence
            .lock()
            .await
            .set_typing(room_id, is_typing, Instant::now());
        if let Some(signal) = signal {
            if let Err(err) = self.transport.emit(ClientRequest::Typing(signal)).await {
                debug!(room_id = %room_id, "typing: signal dropped: {err}");
            }
        }
        Ok(())
    }

    pub async fn typing_users(&self, room_id: &RoomId) -> Vec<TypingUser> {
        self.presence.lock().await.typing_users(room_id)
    }

    pub async fn online_users(&self) -> Vec<OnlineUser> {
        self.presence.lock().await.online_users().to_vec()
    }

    pub async fn fetch_room(&self, room_id: &RoomId) -> Result<Option<RoomSummary>, CoreError> {
        self.history.fetch_room(room_id).await.map_err(|err| {
            let err = CoreError::from(history_error(room_id, err));
            self.report(&err);
            err
        })
    }

    /// The other participant of a one-to-one room.
    pub async fn counterpart(&self, room_id: &RoomId) -> Result<Option<UserId>, CoreError> {
        let room = self.fetch_room(room_id).await?;
        Ok(room.and_then(|room| room.counterpart(&self.local_user).cloned()))
    }

    pub async fn start_call(&self, room_id: &RoomId, call_type: CallType) -> Result<MediaToken, CoreError> {
        self.calls
            .start_call(room_id, call_type)
            .await
            .map_err(|err| self.report_call(err))
    }

    /// Connects to the configured media server with the issued token.
    pub async fn connect_media(
        &self,
        connector: &dyn LiveKitRoomConnector,
    ) -> Result<MediaDevices, CoreError> {
        let Some(url) = self.settings.media_server_url.clone() else {
            let err = CallError::MediaConnect("no media server url configured".into());
            if self.calls.phase() != call::CallPhase::Idle {
                let _ = self.calls.end_call().await;
            }
            return Err(self.report_call(err));
        };
        self.calls
            .connect_media(connector, &url)
            .await
            .map_err(|err| self.report_call(err))
    }

    /// For media layers that connect on their own and only report readiness.
    pub async fn on_media_connected(
        &self,
        session: Arc<dyn LiveKitRoomSession>,
    ) -> Result<MediaDevices, CoreError> {
        self.calls
            .on_transport_connected(session)
            .await
            .map_err(|err| self.report_call(err))
    }

    pub async fn end_call(&self) -> Result<(), CoreError> {
        self.calls.end_call().await.map_err(|err| self.report_call(err))
    }

    pub fn call_state(&self) -> CallState {
        self.calls.state()
    }

    async fn pump(self: Arc<Self>, mut transport_events: broadcast::Receiver<TransportEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = transport_events.recv() => event,
            };
            match event {
                Ok(TransportEvent::StateChanged(snapshot)) => self.on_state_changed(snapshot).await,
                Ok(TransportEvent::Server(event)) => self.on_server_event(event).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "conn: event pump lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn on_state_changed(self: &Arc<Self>, snapshot: ConnectionSnapshot) {
        self.send_event(ChatEvent::ConnectionChanged(snapshot.clone()));
        match snapshot.state {
            ConnectionState::Connected => {
                self.presence.lock().await.reset_after_reconnect();
                self.rooms.on_connected().await;
                self.resend_pending().await;
                if snapshot.generation > 1 {
                    self.refetch_joined_history().await;
                }
            }
            ConnectionState::Failed => {
                let failed: Vec<(RoomId, MessageId)> = {
                    let mut timelines = self.timelines.lock().await;
                    timelines
                        .rooms_mut()
                        .flat_map(|timeline| {
                            let room_id = timeline.room_id().clone();
                            timeline
                                .fail_all_pending("connection failed")
                                .into_iter()
                                .map(move |temp_id| (room_id.clone(), temp_id))
                        })
                        .collect()
                };
                for (room_id, temp_id) in failed {
                    self.send_event(ChatEvent::MessageFailed {
                        room_id,
                        temp_id,
                        reason: "connection failed".into(),
                    });
                }
                let err = snapshot
                    .last_error
                    .unwrap_or(ConnectionError::NotConnected);
                self.report(&CoreError::from(err));
            }
            ConnectionState::Disconnected
            | ConnectionState::Connecting
            | ConnectionState::Reconnecting => {}
        }
    }

    async fn resend_pending(&self) {
        if self.settings.send_route != SendRoute::Transport {
            return;
        }
        let joined = self.rooms.joined_rooms().await;
        let pending: Vec<MessagePayload> = {
            let timelines = self.timelines.lock().await;
            joined
                .iter()
                .filter_map(|room| timelines.room(room))
                .flat_map(|timeline| timeline.pending_outbound())
                .collect()
        };
        if !pending.is_empty() {
            info!(count = pending.len(), "timeline: resending unconfirmed messages");
        }
        for message in pending {
            let _ = self.dispatch(message).await;
        }
    }

    async fn refetch_joined_history(self: &Arc<Self>) {
        for room_id in self.rooms.joined_rooms().await {
            let client = Arc::clone(self);
            let cancel = self.shutdown.child_token();
            tokio::spawn(async move {
                let _ = client.load_history_with(&room_id, &cancel).await;
            });
        }
    }

    async fn on_server_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::MessageCreated(message) => self.on_message(message).await,
            ServerEvent::UserTyping(typing) => self.on_typing(typing).await,
            ServerEvent::OnlineUsers(users) => {
                self.presence.lock().await.set_online_users(users.clone());
                self.send_event(ChatEvent::OnlineUsersChanged(users));
            }
            ServerEvent::MessageError(rejection) => self.on_message_error(rejection).await,
        }
    }

    async fn on_message(&self, message: MessagePayload) {
        let room_id = message.room_id.clone();
        if !self.rooms.is_member(&room_id).await {
            debug!(room_id = %room_id, "timeline: ignoring message for unjoined room");
            return;
        }
        let outcome = self.timelines.lock().await.room_mut(&room_id).append_incoming(message);
        match outcome {
            IncomingOutcome::Appended => {}
            IncomingOutcome::Confirmed { temp_id } => {
                self.send_event(ChatEvent::MessageConfirmed {
                    room_id: room_id.clone(),
                    temp_id,
                });
            }
            IncomingOutcome::Duplicate => return,
        }
        self.send_event(ChatEvent::TimelineUpdated { room_id });
    }

    async fn on_typing(&self, typing: TypingPayload) {
        let rooms = match typing.room_id {
            Some(room_id) => {
                if !self.rooms.is_member(&room_id).await {
                    return;
                }
                vec![room_id]
            }
            None => self.rooms.joined_rooms().await,
        };

        let now = Instant::now();
        let mut changed = Vec::new();
        {
            let mut presence = self.presence.lock().await;
            for room_id in rooms {
                if presence.on_remote_typing(
                    &room_id,
                    &typing.user_id,
                    &typing.username,
                    typing.is_typing,
                    now,
                ) {
                    let users = presence.typing_users(&room_id);
                    changed.push((room_id, users));
                }
            }
        }
        for (room_id, users) in changed {
            self.send_event(ChatEvent::TypingChanged { room_id, users });
        }
    }

    async fn on_message_error(&self, rejection: MessageErrorPayload) {
        warn!(room_id = ?rejection.room_id, "timeline: server rejected message: {}", rejection.message);
        if let Some(client_id) = &rejection.client_message_id {
            let failed = {
                let mut timelines = self.timelines.lock().await;
                let mut found = None;
                for timeline in timelines.rooms_mut() {
                    if rejection.room_id.as_ref().is_some_and(|room| room != timeline.room_id()) {
                        continue;
                    }
                    if let Some(temp_id) = timeline.fail_by_client_id(client_id, &rejection.message) {
                        found = Some((timeline.room_id().clone(), temp_id));
                        break;
                    }
                }
                found
            };
            if let Some((room_id, temp_id)) = failed {
                self.send_event(ChatEvent::MessageFailed {
                    room_id,
                    temp_id,
                    reason: rejection.message.clone(),
                });
            }
        }
        self.report(&CoreError::from(SendError::Rejected(rejection.message)));
    }

    async fn housekeeping(self: Arc<Self>) {
        let period = self
            .settings
            .housekeeping_interval
            .max(std::time::Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let now = Instant::now();

            let (expired_rooms, idle) = {
                let mut presence = self.presence.lock().await;
                let expired = presence.expire_typing(now);
                let changed: Vec<(RoomId, Vec<TypingUser>)> = expired
                    .into_iter()
                    .map(|room| {
                        let users = presence.typing_users(&room);
                        (room, users)
                    })
                    .collect();
                (changed, presence.idle_typing(now))
            };
            for (room_id, users) in expired_rooms {
                self.send_event(ChatEvent::TypingChanged { room_id, users });
            }
            for signal in idle {
                let _ = self.transport.emit(ClientRequest::Typing(signal)).await;
            }

            let timed_out: Vec<(RoomId, MessageId)> = {
                let mut timelines = self.timelines.lock().await;
                let timeout = self.settings.send_confirm_timeout;
                timelines
                    .rooms_mut()
                    .flat_map(|timeline| {
                        let room_id = timeline.room_id().clone();
                        timeline
                            .expire_pending(now, timeout)
                            .into_iter()
                            .map(move |temp_id| (room_id.clone(), temp_id))
                    })
                    .collect()
            };
            for (room_id, temp_id) in timed_out {
                self.send_event(ChatEvent::MessageFailed {
                    room_id,
                    temp_id: temp_id.clone(),
                    reason: "not confirmed in time".into(),
                });
                self.report(&CoreError::from(SendError::ConfirmationTimeout(temp_id)));
            }
        }
    }

    async fn forward_call_state(self: Arc<Self>) {
        let mut state = self.calls.watch_state();
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = state.borrow_and_update().clone();
                    self.send_event(ChatEvent::CallStateChanged(current));
                }
            }
        }
    }

    async fn forget_room(&self, room_id: &RoomId) {
        let stop = self
            .presence
            .lock()
            .await
            .forget_room(room_id, Instant::now());
        if let Some(signal) = stop {
            let _ = self.transport.emit(ClientRequest::Typing(signal)).await;
        }
        self.timelines.lock().await.remove(room_id);
    }

    async fn emit_membership(&self) {
        let joined = self.rooms.joined_rooms().await;
        self.send_event(ChatEvent::MembershipChanged { joined });
    }

    fn report_call(&self, err: CallError) -> CoreError {
        let err = CoreError::from(err);
        self.report(&err);
        err
    }

    fn report(&self, err: &CoreError) {
        self.send_event(ChatEvent::Error {
            kind: err.kind(),
            message: err.to_string(),
        });
    }

    fn send_event(&self, event: ChatEvent) {
        let _ = self.events.send(event);
    }
}

fn history_error(room_id: &RoomId, err: anyhow::Error) -> HistoryError {
    match err.downcast_ref::<HistoryError>() {
        Some(known) => known.clone(),
        None => HistoryError::Fetch {
            room_id: room_id.clone(),
            message: err.to_string(),
        },
    }
}

/// An open room view. Closing or dropping it cancels its pending history
/// load and leaves the room unless a newer view of the same room exists.
pub struct RoomView {
    client: Arc<ChatClient>,
    room_id: RoomId,
    view_id: u64,
    cancel: CancellationToken,
    closed: bool,
}

impl RoomView {
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub async fn messages(&self) -> Vec<TimelineEntry> {
        self.client.messages(&self.room_id).await
    }

    pub async fn send(&self, content: &str) -> Result<MessagePayload, CoreError> {
        self.client
            .send_message(&self.room_id, MessageKind::Text, content)
            .await
    }

    pub async fn set_typing(&self, is_typing: bool) -> Result<(), CoreError> {
        self.client.set_typing(&self.room_id, is_typing).await
    }

    pub async fn reload_history(&self) -> Result<HistoryMerge, CoreError> {
        self.client.load_history_with(&self.room_id, &self.cancel).await
    }

    pub async fn close(mut self) {
        self.closed = true;
        self.cancel.cancel();
        release_view(&self.client, &self.room_id, self.view_id).await;
    }
}

impl Drop for RoomView {
    fn drop(&mut self) {
        self.cancel.cancel();
        if self.closed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let client = Arc::clone(&self.client);
        let room_id = self.room_id.clone();
        let view_id = self.view_id;
        runtime.spawn(async move {
            release_view(&client, &room_id, view_id).await;
        });
    }
}

async fn release_view(client: &ChatClient, room_id: &RoomId, view_id: u64) {
    let current = {
        let mut views = client.views.lock().await;
        if views.get(room_id) == Some(&view_id) {
            views.remove(room_id);
            true
        } else {
            false
        }
    };
    if current {
        client.leave_room(room_id).await;
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
