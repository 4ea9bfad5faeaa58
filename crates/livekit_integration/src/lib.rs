use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

pub mod grant;

pub use grant::{mint_token, LiveKitConfig};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveKitRoomOptions {
    pub url: String,
    pub token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocalTrack {
    Microphone,
    Camera,
    ScreenShare,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteParticipant {
    pub participant_id: String,
    pub identity: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveKitRoomEvent {
    Connected,
    Disconnected { reason: String },
    ParticipantJoined(RemoteParticipant),
    ParticipantLeft { participant_id: String },
}

/// A joined media room as seen from the local participant.
#[async_trait]
pub trait LiveKitRoomSession: Send + Sync {
    async fn set_track_enabled(&self, track: LocalTrack, enabled: bool) -> anyhow::Result<()>;
    async fn leave(&self) -> anyhow::Result<()>;
    fn supports_screen_share(&self) -> bool;
    fn subscribe_events(&self) -> broadcast::Receiver<LiveKitRoomEvent>;
}

#[async_trait]
pub trait LiveKitRoomConnector: Send + Sync {
    /// Resolves once the media transport reports it is connected.
    async fn connect(
        &self,
        options: LiveKitRoomOptions,
    ) -> anyhow::Result<Arc<dyn LiveKitRoomSession>>;
}
