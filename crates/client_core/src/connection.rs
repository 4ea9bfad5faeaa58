use std::{sync::Arc, time::Duration};

use shared::protocol::{ClientRequest, ServerEvent};
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    config::ClientSettings,
    error::ConnectionError,
    transport::{TransportConnector, TransportLink},
    AuthTokenProvider,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Reconnect attempts are exhausted or the user is signed out.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub connection_id: Option<Uuid>,
    /// Bumped on every successful connection.
    pub generation: u64,
    /// Consecutive failed attempts since the last successful connection.
    pub attempt: u32,
    pub last_error: Option<ConnectionError>,
}

impl ConnectionSnapshot {
    fn initial() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            connection_id: None,
            generation: 0,
            attempt: 0,
            last_error: None,
        }
    }
}

/// State transitions and server frames, in transport order.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    StateChanged(ConnectionSnapshot),
    Server(ServerEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn from_settings(settings: &ClientSettings) -> Self {
        Self {
            base_delay: settings.reconnect_base_delay,
            max_delay: settings.reconnect_max_delay,
            max_attempts: settings.max_reconnect_attempts,
        }
    }

    /// Delay before retry number `attempt` (1-based): doubling, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

struct ConnectionInner {
    outbound: Option<mpsc::UnboundedSender<ClientRequest>>,
    supervisor: Option<CancellationToken>,
}

/// Owns the single realtime connection of a signed-in session.
pub struct ConnectionManager {
    connector: Arc<dyn TransportConnector>,
    policy: ReconnectPolicy,
    state: watch::Sender<ConnectionSnapshot>,
    events: broadcast::Sender<TransportEvent>,
    inner: Mutex<ConnectionInner>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn TransportConnector>, policy: ReconnectPolicy) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionSnapshot::initial());
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            connector,
            policy,
            state,
            events,
            inner: Mutex::new(ConnectionInner {
                outbound: None,
                supervisor: None,
            }),
        })
    }

    pub fn handle(self: &Arc<Self>) -> TransportHandle {
        TransportHandle {
            manager: Arc::clone(self),
        }
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    /// Starts the connection supervisor and waits for the outcome of the first
    /// attempt. A missing token is reported here and no attempt is made; a
    /// failed first attempt is left to the reconnect loop and shows up in the
    /// returned snapshot.
    pub async fn connect(
        self: &Arc<Self>,
        auth: Arc<dyn AuthTokenProvider>,
    ) -> Result<ConnectionSnapshot, ConnectionError> {
        let (first_tx, first_rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock().await;
            if inner.supervisor.is_some() {
                return Ok(self.snapshot());
            }

            let token = fetch_token(auth.as_ref()).await?;

            let cancel = CancellationToken::new();
            inner.supervisor = Some(cancel.clone());
            let snapshot = ConnectionSnapshot {
                state: ConnectionState::Connecting,
                connection_id: None,
                attempt: 0,
                last_error: None,
                ..self.snapshot()
            };
            self.publish(snapshot);

            let manager = Arc::clone(self);
            tokio::spawn(async move {
                manager.supervise(auth, cancel, token, first_tx).await;
            });
        }

        let _ = first_rx.await;
        Ok(self.snapshot())
    }

    /// Tears the connection down. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let mut inner = self.inner.lock().await;
        let had_supervisor = match inner.supervisor.take() {
            Some(cancel) => {
                cancel.cancel();
                true
            }
            None => false,
        };
        inner.outbound = None;

        if had_supervisor || self.snapshot().state != ConnectionState::Disconnected {
            info!("conn: disconnected by caller");
            let snapshot = ConnectionSnapshot {
                state: ConnectionState::Disconnected,
                connection_id: None,
                attempt: 0,
                last_error: None,
                ..self.snapshot()
            };
            self.publish(snapshot);
        }
    }

    pub async fn emit(&self, request: ClientRequest) -> Result<(), ConnectionError> {
        let inner = self.inner.lock().await;
        let Some(outbound) = inner.outbound.as_ref() else {
            return Err(ConnectionError::NotConnected);
        };
        outbound
            .send(request)
            .map_err(|_| ConnectionError::NotConnected)
    }

    async fn supervise(
        self: Arc<Self>,
        auth: Arc<dyn AuthTokenProvider>,
        cancel: CancellationToken,
        first_token: String,
        first_tx: oneshot::Sender<()>,
    ) {
        let mut first_tx = Some(first_tx);
        let mut next_token = Some(first_token);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let token = match next_token.take() {
                Some(token) => Ok(token),
                None => fetch_token(auth.as_ref()).await,
            };

            let outcome = match token {
                Ok(token) => tokio::select! {
                    _ = cancel.cancelled() => break,
                    outcome = self.connector.connect(&token) => outcome,
                },
                Err(err) => Err(err),
            };

            match outcome {
                Ok(link) => {
                    attempt = 0;
                    let Some(mut inbound) = self.install(link, &cancel).await else {
                        break;
                    };
                    notify(&mut first_tx);

                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            event = inbound.recv() => match event {
                                Some(event) => {
                                    let _ = self.events.send(TransportEvent::Server(event));
                                }
                                None => break,
                            }
                        }
                    }

                    if !self.mark_dropped(&cancel).await {
                        break;
                    }
                }
                Err(ConnectionError::MissingAuthToken) => {
                    warn!("conn: auth token gone, giving up");
                    self.finish_failed(&cancel, ConnectionError::MissingAuthToken, attempt)
                        .await;
                    notify(&mut first_tx);
                    return;
                }
                Err(err) => {
                    if attempt >= self.policy.max_attempts {
                        warn!(attempt, "conn: reconnect attempts exhausted: {err}");
                        self.finish_failed(
                            &cancel,
                            ConnectionError::RetriesExhausted { attempts: attempt },
                            attempt,
                        )
                        .await;
                        notify(&mut first_tx);
                        return;
                    }

                    let delay = self.policy.delay_for(attempt);
                    warn!(attempt, ?delay, "conn: attempt failed, reconnect scheduled: {err}");
                    let snapshot = ConnectionSnapshot {
                        state: ConnectionState::Reconnecting,
                        connection_id: None,
                        attempt,
                        last_error: Some(err),
                        ..self.snapshot()
                    };
                    if !self.publish_if_live(&cancel, snapshot).await {
                        break;
                    }
                    notify(&mut first_tx);

                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        notify(&mut first_tx);
    }

    async fn install(
        &self,
        link: TransportLink,
        cancel: &CancellationToken,
    ) -> Option<mpsc::UnboundedReceiver<ServerEvent>> {
        let mut inner = self.inner.lock().await;
        if cancel.is_cancelled() {
            return None;
        }
        inner.outbound = Some(link.outbound);

        let connection_id = Uuid::new_v4();
        let generation = self.snapshot().generation + 1;
        info!(%connection_id, generation, "conn: connected");
        self.publish(ConnectionSnapshot {
            state: ConnectionState::Connected,
            connection_id: Some(connection_id),
            generation,
            attempt: 0,
            last_error: None,
        });
        Some(link.inbound)
    }

    /// Records a dropped connection; returns false once the caller has disconnected.
    async fn mark_dropped(&self, cancel: &CancellationToken) -> bool {
        let mut inner = self.inner.lock().await;
        if cancel.is_cancelled() {
            return false;
        }
        inner.outbound = None;
        warn!("conn: connection lost");

        let lost = Some(ConnectionError::Network("connection closed".into()));
        self.publish(ConnectionSnapshot {
            state: ConnectionState::Disconnected,
            connection_id: None,
            attempt: 0,
            last_error: lost.clone(),
            ..self.snapshot()
        });
        self.publish(ConnectionSnapshot {
            state: ConnectionState::Reconnecting,
            connection_id: None,
            attempt: 0,
            last_error: lost,
            ..self.snapshot()
        });
        true
    }

    async fn finish_failed(&self, cancel: &CancellationToken, err: ConnectionError, attempt: u32) {
        let mut inner = self.inner.lock().await;
        if cancel.is_cancelled() {
            return;
        }
        inner.supervisor = None;
        inner.outbound = None;
        self.publish(ConnectionSnapshot {
            state: ConnectionState::Failed,
            connection_id: None,
            attempt,
            last_error: Some(err),
            ..self.snapshot()
        });
    }

    async fn publish_if_live(&self, cancel: &CancellationToken, snapshot: ConnectionSnapshot) -> bool {
        let _inner = self.inner.lock().await;
        if cancel.is_cancelled() {
            return false;
        }
        self.publish(snapshot);
        true
    }

    fn publish(&self, snapshot: ConnectionSnapshot) {
        self.state.send_replace(snapshot.clone());
        let _ = self.events.send(TransportEvent::StateChanged(snapshot));
    }
}

fn notify(first_tx: &mut Option<oneshot::Sender<()>>) {
    if let Some(tx) = first_tx.take() {
        let _ = tx.send(());
    }
}

async fn fetch_token(auth: &dyn AuthTokenProvider) -> Result<String, ConnectionError> {
    match auth.fetch_token().await {
        Ok(Some(token)) if !token.trim().is_empty() => Ok(token),
        Ok(_) => Err(ConnectionError::MissingAuthToken),
        Err(err) => Err(ConnectionError::AuthProvider(err.to_string())),
    }
}

/// Emit/observe access to the shared connection for the other components.
#[derive(Clone)]
pub struct TransportHandle {
    manager: Arc<ConnectionManager>,
}

impl TransportHandle {
    pub async fn emit(&self, request: ClientRequest) -> Result<(), ConnectionError> {
        self.manager.emit(request).await
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.manager.snapshot()
    }

    pub fn is_connected(&self) -> bool {
        self.manager.snapshot().state == ConnectionState::Connected
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.manager.subscribe()
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
