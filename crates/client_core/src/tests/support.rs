//! In-memory fakes for the collaborator seams.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use livekit_integration::{
    LiveKitRoomConnector, LiveKitRoomEvent, LiveKitRoomOptions, LiveKitRoomSession, LocalTrack,
};
use shared::{
    domain::RoomId,
    protocol::{ClientRequest, ServerEvent},
};
use tokio::sync::{broadcast, mpsc};

use crate::{
    connection::{ConnectionSnapshot, ConnectionState, TransportEvent},
    error::ConnectionError,
    transport::{TransportConnector, TransportLink},
    AuthTokenProvider, MediaTokenProvider,
};

/// The server's side of one accepted fake connection.
pub(crate) struct ServerEnd {
    pub token: String,
    pub from_client: mpsc::UnboundedReceiver<ClientRequest>,
    pub to_client: mpsc::UnboundedSender<ServerEvent>,
}

impl ServerEnd {
    pub async fn next_request(&mut self) -> ClientRequest {
        tokio::time::timeout(Duration::from_secs(5), self.from_client.recv())
            .await
            .expect("request within timeout")
            .expect("client still connected")
    }

    pub fn drain(&mut self) -> Vec<ClientRequest> {
        let mut requests = Vec::new();
        while let Ok(request) = self.from_client.try_recv() {
            requests.push(request);
        }
        requests
    }

    pub fn push(&self, event: ServerEvent) {
        self.to_client.send(event).expect("client inbound open");
    }
}

pub(crate) struct FakeConnector {
    failures: StdMutex<VecDeque<ConnectionError>>,
    tokens: StdMutex<Vec<String>>,
    accepted: mpsc::UnboundedSender<ServerEnd>,
}

impl FakeConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (accepted, accepted_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                failures: StdMutex::new(VecDeque::new()),
                tokens: StdMutex::new(Vec::new()),
                accepted,
            }),
            accepted_rx,
        )
    }

    pub fn fail_next(&self, err: ConnectionError) {
        self.failures.lock().expect("lock").push_back(err);
    }

    pub fn tokens(&self) -> Vec<String> {
        self.tokens.lock().expect("lock").clone()
    }
}

#[async_trait]
impl TransportConnector for FakeConnector {
    async fn connect(&self, auth_token: &str) -> Result<TransportLink, ConnectionError> {
        self.tokens.lock().expect("lock").push(auth_token.to_string());
        if let Some(err) = self.failures.lock().expect("lock").pop_front() {
            return Err(err);
        }

        let (outbound, from_client) = mpsc::unbounded_channel();
        let (to_client, inbound) = mpsc::unbounded_channel();
        let _ = self.accepted.send(ServerEnd {
            token: auth_token.to_string(),
            from_client,
            to_client,
        });
        Ok(TransportLink { outbound, inbound })
    }
}

/// Hands out `token-1`, `token-2`, ... so tests can see each reconnect fetched anew.
pub(crate) struct CountingTokenProvider {
    issued: AtomicU32,
    signed_in: bool,
}

impl CountingTokenProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            issued: AtomicU32::new(0),
            signed_in: true,
        })
    }

    pub fn signed_out() -> Arc<Self> {
        Arc::new(Self {
            issued: AtomicU32::new(0),
            signed_in: false,
        })
    }

    pub fn issued(&self) -> u32 {
        self.issued.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthTokenProvider for CountingTokenProvider {
    async fn fetch_token(&self) -> Result<Option<String>> {
        if !self.signed_in {
            return Ok(None);
        }
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Some(format!("token-{n}")))
    }
}

pub(crate) struct FailingTokenProvider;

#[async_trait]
impl AuthTokenProvider for FailingTokenProvider {
    async fn fetch_token(&self) -> Result<Option<String>> {
        Err(anyhow!("identity provider unreachable"))
    }
}

pub(crate) async fn next_server_end(accepted: &mut mpsc::UnboundedReceiver<ServerEnd>) -> ServerEnd {
    tokio::time::timeout(Duration::from_secs(5), accepted.recv())
        .await
        .expect("connection within timeout")
        .expect("connector alive")
}

/// Waits on the event stream rather than the state watch so that transient
/// states such as `Reconnecting` are never coalesced away.
pub(crate) async fn wait_for_state(
    events: &mut broadcast::Receiver<TransportEvent>,
    state: ConnectionState,
) -> ConnectionSnapshot {
    tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            match events.recv().await {
                Ok(TransportEvent::StateChanged(snapshot)) if snapshot.state == state => {
                    return snapshot
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("manager dropped"),
            }
        }
    })
    .await
    .expect("state reached within timeout")
}

pub(crate) struct StaticMediaTokens {
    pub token: Option<String>,
    pub delay: Duration,
    pub requests: StdMutex<Vec<(String, RoomId)>>,
}

impl StaticMediaTokens {
    pub fn issuing(token: &str) -> Arc<Self> {
        Arc::new(Self {
            token: Some(token.to_string()),
            delay: Duration::ZERO,
            requests: StdMutex::new(Vec::new()),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            token: None,
            delay: Duration::ZERO,
            requests: StdMutex::new(Vec::new()),
        })
    }

    pub fn hanging() -> Arc<Self> {
        Arc::new(Self {
            token: Some("never".into()),
            delay: Duration::from_secs(3600),
            requests: StdMutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl MediaTokenProvider for StaticMediaTokens {
    async fn fetch_media_token(&self, auth_token: &str, room_id: &RoomId) -> Result<String> {
        self.requests
            .lock()
            .expect("lock")
            .push((auth_token.to_string(), room_id.clone()));
        tokio::time::sleep(self.delay).await;
        self.token
            .clone()
            .ok_or_else(|| anyhow!("media service unreachable"))
    }
}

pub(crate) struct FakeRoomSession {
    pub toggles: StdMutex<Vec<(LocalTrack, bool)>>,
    pub left: AtomicU32,
    pub screen_share: bool,
    pub broken_track: Option<LocalTrack>,
    pub events: broadcast::Sender<LiveKitRoomEvent>,
}

impl FakeRoomSession {
    pub fn new() -> Arc<Self> {
        Self::with(true, None)
    }

    pub fn with(screen_share: bool, broken_track: Option<LocalTrack>) -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            toggles: StdMutex::new(Vec::new()),
            left: AtomicU32::new(0),
            screen_share,
            broken_track,
            events,
        })
    }

    pub fn toggles(&self) -> Vec<(LocalTrack, bool)> {
        self.toggles.lock().expect("lock").clone()
    }

    pub fn times_left(&self) -> u32 {
        self.left.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LiveKitRoomSession for FakeRoomSession {
    async fn set_track_enabled(&self, track: LocalTrack, enabled: bool) -> Result<()> {
        if self.broken_track == Some(track) {
            return Err(anyhow!("device busy"));
        }
        self.toggles.lock().expect("lock").push((track, enabled));
        Ok(())
    }

    async fn leave(&self) -> Result<()> {
        self.left.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn supports_screen_share(&self) -> bool {
        self.screen_share
    }

    fn subscribe_events(&self) -> broadcast::Receiver<LiveKitRoomEvent> {
        self.events.subscribe()
    }
}

pub(crate) struct FakeRoomConnector {
    pub session: Option<Arc<FakeRoomSession>>,
    pub options: StdMutex<Vec<LiveKitRoomOptions>>,
}

#[async_trait]
impl LiveKitRoomConnector for FakeRoomConnector {
    async fn connect(&self, options: LiveKitRoomOptions) -> Result<Arc<dyn LiveKitRoomSession>> {
        self.options.lock().expect("lock").push(options);
        match &self.session {
            Some(session) => Ok(session.clone() as Arc<dyn LiveKitRoomSession>),
            None => Err(anyhow!("sfu unreachable")),
        }
    }
}
