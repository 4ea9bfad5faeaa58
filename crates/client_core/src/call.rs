use std::{fmt, sync::Arc, time::Duration};

use livekit_integration::{
    LiveKitRoomConnector, LiveKitRoomEvent, LiveKitRoomOptions, LiveKitRoomSession, LocalTrack,
};
use shared::domain::{CallType, RoomId};
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{error::CallError, AuthTokenProvider, MediaTokenProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallPhase {
    Idle,
    RequestingToken,
    AwaitingTransport,
    ConnectingMedia,
    Active,
    Ended,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaDevices {
    pub microphone: bool,
    pub camera: bool,
    pub screen_share: bool,
}

/// Opaque media session token. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct MediaToken(String);

impl MediaToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for MediaToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MediaToken(..)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEndReason {
    Hangup,
    Failed(CallError),
    TransportLost(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallState {
    Idle,
    RequestingToken {
        room_id: RoomId,
        call_type: CallType,
    },
    AwaitingTransport {
        room_id: RoomId,
        call_type: CallType,
        token: MediaToken,
    },
    ConnectingMedia {
        room_id: RoomId,
        call_type: CallType,
        token: MediaToken,
    },
    Active {
        room_id: RoomId,
        call_type: CallType,
        token: MediaToken,
        devices: MediaDevices,
    },
    Ended {
        room_id: Option<RoomId>,
        reason: CallEndReason,
    },
}

impl CallState {
    pub fn phase(&self) -> CallPhase {
        match self {
            Self::Idle => CallPhase::Idle,
            Self::RequestingToken { .. } => CallPhase::RequestingToken,
            Self::AwaitingTransport { .. } => CallPhase::AwaitingTransport,
            Self::ConnectingMedia { .. } => CallPhase::ConnectingMedia,
            Self::Active { .. } => CallPhase::Active,
            Self::Ended { .. } => CallPhase::Ended,
        }
    }

    pub fn room_id(&self) -> Option<&RoomId> {
        match self {
            Self::Idle => None,
            Self::RequestingToken { room_id, .. }
            | Self::AwaitingTransport { room_id, .. }
            | Self::ConnectingMedia { room_id, .. }
            | Self::Active { room_id, .. } => Some(room_id),
            Self::Ended { room_id, .. } => room_id.as_ref(),
        }
    }

    pub fn token(&self) -> Option<&MediaToken> {
        match self {
            Self::AwaitingTransport { token, .. }
            | Self::ConnectingMedia { token, .. }
            | Self::Active { token, .. } => Some(token),
            _ => None,
        }
    }

    pub fn devices(&self) -> MediaDevices {
        match self {
            Self::Active { devices, .. } => *devices,
            _ => MediaDevices::default(),
        }
    }

    fn call_type(&self) -> Option<CallType> {
        match self {
            Self::RequestingToken { call_type, .. }
            | Self::AwaitingTransport { call_type, .. }
            | Self::ConnectingMedia { call_type, .. }
            | Self::Active { call_type, .. } => Some(*call_type),
            _ => None,
        }
    }
}

struct CallInner {
    /// Bumped whenever a call starts or ends so stale continuations can tell.
    attempt: u64,
    cancel: Option<CancellationToken>,
    room: Option<Arc<dyn LiveKitRoomSession>>,
    watcher: Option<JoinHandle<()>>,
}

/// Drives one call at a time through token exchange, media connect and hangup.
pub struct CallSessionOrchestrator {
    auth: Arc<dyn AuthTokenProvider>,
    media_tokens: Arc<dyn MediaTokenProvider>,
    token_timeout: Duration,
    state: watch::Sender<CallState>,
    inner: Mutex<CallInner>,
}

impl CallSessionOrchestrator {
    pub fn new(
        auth: Arc<dyn AuthTokenProvider>,
        media_tokens: Arc<dyn MediaTokenProvider>,
        token_timeout: Duration,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(CallState::Idle);
        Arc::new(Self {
            auth,
            media_tokens,
            token_timeout,
            state,
            inner: Mutex::new(CallInner {
                attempt: 0,
                cancel: None,
                room: None,
                watcher: None,
            }),
        })
    }

    pub fn state(&self) -> CallState {
        self.state.borrow().clone()
    }

    pub fn phase(&self) -> CallPhase {
        self.state.borrow().phase()
    }

    pub fn watch_state(&self) -> watch::Receiver<CallState> {
        self.state.subscribe()
    }

    /// Requests a media token for `room_id`. On success the call waits for the
    /// media transport; on any failure it ends and the error is returned.
    pub async fn start_call(
        &self,
        room_id: &RoomId,
        call_type: CallType,
    ) -> Result<MediaToken, CallError> {
        let (attempt, cancel) = {
            let mut inner = self.inner.lock().await;
            let phase = self.phase();
            if !matches!(phase, CallPhase::Idle | CallPhase::Ended) {
                return Err(CallError::AlreadyInProgress { phase });
            }
            inner.attempt += 1;
            if room_id.is_blank() {
                return Err(self.fail(None, CallError::MissingRoom));
            }
            let cancel = CancellationToken::new();
            inner.cancel = Some(cancel.clone());
            self.state.send_replace(CallState::RequestingToken {
                room_id: room_id.clone(),
                call_type,
            });
            (inner.attempt, cancel)
        };
        info!(room_id = %room_id, ?call_type, "call: requesting media token");

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(CallError::Cancelled),
            outcome = self.exchange_token(room_id) => outcome,
        };

        let mut inner = self.inner.lock().await;
        if inner.attempt != attempt {
            return Err(CallError::Cancelled);
        }
        inner.cancel = None;
        match outcome {
            Ok(token) => {
                info!(room_id = %room_id, "call: media token issued, awaiting transport");
                self.state.send_replace(CallState::AwaitingTransport {
                    room_id: room_id.clone(),
                    call_type,
                    token: token.clone(),
                });
                Ok(token)
            }
            Err(err) => Err(self.fail(Some(room_id.clone()), err)),
        }
    }

    /// The auth lookup and the media token request share one deadline.
    async fn exchange_token(&self, room_id: &RoomId) -> Result<MediaToken, CallError> {
        match tokio::time::timeout(self.token_timeout, self.request_token(room_id)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(CallError::TokenTimeout(self.token_timeout)),
        }
    }

    async fn request_token(&self, room_id: &RoomId) -> Result<MediaToken, CallError> {
        let auth_token = match self.auth.fetch_token().await {
            Ok(Some(token)) if !token.trim().is_empty() => token,
            Ok(_) => return Err(CallError::MissingAuthToken),
            Err(err) => return Err(CallError::TokenUnavailable(format!("auth provider: {err}"))),
        };

        match self.media_tokens.fetch_media_token(&auth_token, room_id).await {
            Err(err) => Err(CallError::TokenUnavailable(err.to_string())),
            Ok(token) if token.trim().is_empty() => {
                Err(CallError::TokenUnavailable("empty media token".into()))
            }
            Ok(token) => Ok(MediaToken(token)),
        }
    }

    /// Connects the media room with the issued token and finishes the call setup.
    pub async fn connect_media(
        self: &Arc<Self>,
        connector: &dyn LiveKitRoomConnector,
        url: &str,
    ) -> Result<MediaDevices, CallError> {
        let (attempt, token) = {
            let inner = self.inner.lock().await;
            let state = self.state();
            let phase = state.phase();
            let CallState::AwaitingTransport {
                room_id,
                call_type,
                token,
            } = state
            else {
                return Err(CallError::InvalidTransition {
                    phase,
                    action: "connect media",
                });
            };
            self.state.send_replace(CallState::ConnectingMedia {
                room_id,
                call_type,
                token: token.clone(),
            });
            (inner.attempt, token)
        };

        let connected = connector
            .connect(LiveKitRoomOptions {
                url: url.to_string(),
                token: token.as_str().to_string(),
            })
            .await;

        match connected {
            Ok(session) => self.activate(session, Some(attempt)).await,
            Err(err) => {
                let inner = self.inner.lock().await;
                if inner.attempt != attempt {
                    return Err(CallError::Cancelled);
                }
                let room_id = self.state().room_id().cloned();
                Err(self.fail(room_id, CallError::MediaConnect(err.to_string())))
            }
        }
    }

    /// The media transport is up: microphone on, camera only for video calls.
    pub async fn on_transport_connected(
        self: &Arc<Self>,
        session: Arc<dyn LiveKitRoomSession>,
    ) -> Result<MediaDevices, CallError> {
        self.activate(session, None).await
    }

    /// `expected_attempt` pins the session to the call that requested it; a
    /// session that finishes connecting after a hangup or restart is left.
    async fn activate(
        self: &Arc<Self>,
        session: Arc<dyn LiveKitRoomSession>,
        expected_attempt: Option<u64>,
    ) -> Result<MediaDevices, CallError> {
        let mut inner = self.inner.lock().await;
        if expected_attempt.is_some_and(|attempt| attempt != inner.attempt) {
            debug!("call: dropping media session of a superseded call");
            let _ = session.leave().await;
            return Err(CallError::Cancelled);
        }
        let state = self.state();
        let (room_id, call_type, token) = match state {
            CallState::AwaitingTransport {
                room_id,
                call_type,
                token,
            }
            | CallState::ConnectingMedia {
                room_id,
                call_type,
                token,
            } => (room_id, call_type, token),
            other => {
                let _ = session.leave().await;
                return Err(CallError::InvalidTransition {
                    phase: other.phase(),
                    action: "activate media",
                });
            }
        };
        self.state.send_replace(CallState::ConnectingMedia {
            room_id: room_id.clone(),
            call_type,
            token: token.clone(),
        });

        let mut devices = MediaDevices::default();
        let mut enable = vec![LocalTrack::Microphone];
        if call_type == CallType::Video {
            enable.push(LocalTrack::Camera);
        }
        for track in enable {
            if let Err(err) = session.set_track_enabled(track, true).await {
                warn!(room_id = %room_id, ?track, "call: failed to enable local track: {err}");
                let _ = session.leave().await;
                return Err(self.fail(
                    Some(room_id),
                    CallError::MediaDevice(format!("{track:?}: {err}")),
                ));
            }
            match track {
                LocalTrack::Microphone => devices.microphone = true,
                LocalTrack::Camera => devices.camera = true,
                LocalTrack::ScreenShare => devices.screen_share = true,
            }
        }

        let events = session.subscribe_events();
        inner.watcher = Some(self.spawn_transport_watcher(inner.attempt, events));
        inner.room = Some(session);
        info!(room_id = %room_id, ?call_type, "call: active");
        self.state.send_replace(CallState::Active {
            room_id,
            call_type,
            token,
            devices,
        });
        Ok(devices)
    }

    fn spawn_transport_watcher(
        self: &Arc<Self>,
        attempt: u64,
        mut events: broadcast::Receiver<LiveKitRoomEvent>,
    ) -> JoinHandle<()> {
        let orchestrator = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(LiveKitRoomEvent::Disconnected { reason }) => {
                        if let Some(orchestrator) = orchestrator.upgrade() {
                            orchestrator.on_transport_lost(attempt, reason).await;
                        }
                        break;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "call: media events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn on_transport_lost(&self, attempt: u64, reason: String) {
        let mut inner = self.inner.lock().await;
        if inner.attempt != attempt || self.phase() != CallPhase::Active {
            return;
        }
        warn!(reason = %reason, "call: media transport lost");
        inner.attempt += 1;
        inner.room = None;
        inner.watcher = None;
        let room_id = self.state().room_id().cloned();
        self.state.send_replace(CallState::Ended {
            room_id,
            reason: CallEndReason::TransportLost(reason),
        });
    }

    /// Hangs up. The state stays `Ended` until [`Self::reset`].
    pub async fn end_call(&self) -> Result<(), CallError> {
        let (room, watcher) = {
            let mut inner = self.inner.lock().await;
            let state = self.state();
            match state.phase() {
                CallPhase::Idle => {
                    return Err(CallError::InvalidTransition {
                        phase: CallPhase::Idle,
                        action: "end call",
                    })
                }
                CallPhase::Ended => return Ok(()),
                _ => {}
            }
            inner.attempt += 1;
            if let Some(cancel) = inner.cancel.take() {
                cancel.cancel();
            }
            info!(room_id = ?state.room_id(), "call: ended by hangup");
            self.state.send_replace(CallState::Ended {
                room_id: state.room_id().cloned(),
                reason: CallEndReason::Hangup,
            });
            (inner.room.take(), inner.watcher.take())
        };

        if let Some(watcher) = watcher {
            watcher.abort();
        }
        if let Some(room) = room {
            if let Err(err) = room.leave().await {
                warn!("call: leaving media room failed: {err}");
            }
        }
        Ok(())
    }

    /// `Ended` back to `Idle`.
    pub async fn reset(&self) -> Result<(), CallError> {
        let _inner = self.inner.lock().await;
        match self.phase() {
            CallPhase::Idle => Ok(()),
            CallPhase::Ended => {
                self.state.send_replace(CallState::Idle);
                Ok(())
            }
            phase => Err(CallError::InvalidTransition {
                phase,
                action: "reset",
            }),
        }
    }

    pub async fn set_microphone_enabled(&self, enabled: bool) -> Result<MediaDevices, CallError> {
        self.toggle(LocalTrack::Microphone, enabled).await
    }

    pub async fn set_camera_enabled(&self, enabled: bool) -> Result<MediaDevices, CallError> {
        self.toggle(LocalTrack::Camera, enabled).await
    }

    pub async fn set_screen_share_enabled(&self, enabled: bool) -> Result<MediaDevices, CallError> {
        self.toggle(LocalTrack::ScreenShare, enabled).await
    }

    async fn toggle(&self, track: LocalTrack, enabled: bool) -> Result<MediaDevices, CallError> {
        let inner = self.inner.lock().await;
        let CallState::Active {
            room_id,
            call_type,
            token,
            mut devices,
        } = self.state()
        else {
            return Err(CallError::NoActiveCall);
        };
        let Some(room) = inner.room.as_ref() else {
            return Err(CallError::NoActiveCall);
        };

        if track == LocalTrack::ScreenShare && enabled && !room.supports_screen_share() {
            warn!(room_id = %room_id, "call: screen share not supported by media backend");
            return Err(CallError::MediaDevice("screen share not supported".into()));
        }
        room.set_track_enabled(track, enabled)
            .await
            .map_err(|err| CallError::MediaDevice(format!("{track:?}: {err}")))?;

        match track {
            LocalTrack::Microphone => devices.microphone = enabled,
            LocalTrack::Camera => devices.camera = enabled,
            LocalTrack::ScreenShare => devices.screen_share = enabled,
        }
        self.state.send_replace(CallState::Active {
            room_id,
            call_type,
            token,
            devices,
        });
        Ok(devices)
    }

    pub fn call_type(&self) -> Option<CallType> {
        self.state.borrow().call_type()
    }

    /// Moves to `Ended` with `err` as the reason and hands the error back.
    fn fail(&self, room_id: Option<RoomId>, err: CallError) -> CallError {
        warn!(room_id = ?room_id, "call: attempt failed: {err}");
        self.state.send_replace(CallState::Ended {
            room_id,
            reason: CallEndReason::Failed(err.clone()),
        });
        err
    }
}

#[cfg(test)]
#[path = "tests/call_tests.rs"]
mod tests;
