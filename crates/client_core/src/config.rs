use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use tracing::warn;
use url::Url;

use crate::error::ConnectionError;

/// Where an outbound message is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendRoute {
    /// Emit `chat-message` on the realtime channel; the server persists and echoes.
    #[default]
    Transport,
    /// Call the query/mutation collaborator; its result confirms the send.
    Collaborator,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    pub server_url: String,
    pub socket_path: String,
    pub media_token_url: Option<String>,
    pub media_server_url: Option<String>,
    pub graphql_url: Option<String>,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub room_signal_debounce: Duration,
    pub typing_ttl: Duration,
    pub typing_renew_interval: Duration,
    pub typing_idle_timeout: Duration,
    pub send_confirm_timeout: Duration,
    pub call_token_timeout: Duration,
    pub dedup_window: Duration,
    pub housekeeping_interval: Duration,
    pub send_route: SendRoute,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".into(),
            socket_path: "/ws".into(),
            media_token_url: None,
            media_server_url: None,
            graphql_url: None,
            reconnect_base_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(30),
            max_reconnect_attempts: 10,
            room_signal_debounce: Duration::from_millis(50),
            typing_ttl: Duration::from_secs(5),
            typing_renew_interval: Duration::from_secs(2),
            typing_idle_timeout: Duration::from_secs(4),
            send_confirm_timeout: Duration::from_secs(10),
            call_token_timeout: Duration::from_secs(10),
            dedup_window: Duration::from_secs(120),
            housekeeping_interval: Duration::from_millis(250),
            send_route: SendRoute::Transport,
        }
    }
}

impl ClientSettings {
    /// Websocket endpoint derived from `server_url` and `socket_path`.
    pub fn websocket_url(&self) -> Result<Url, ConnectionError> {
        let mut url = Url::parse(&self.server_url)
            .map_err(|err| ConnectionError::InvalidUrl(format!("{}: {err}", self.server_url)))?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(ConnectionError::InvalidUrl(format!(
                    "unsupported scheme {other}"
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| ConnectionError::InvalidUrl(self.server_url.clone()))?;
        url.set_path(&self.socket_path);
        Ok(url)
    }

    /// Media-token endpoint; falls back to the relay route on `server_url`.
    pub fn media_token_endpoint(&self) -> String {
        match &self.media_token_url {
            Some(url) => url.clone(),
            None => format!(
                "{}/api/livekit-token",
                self.server_url.trim_end_matches('/')
            ),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    server_url: Option<String>,
    socket_path: Option<String>,
    media_token_url: Option<String>,
    media_server_url: Option<String>,
    graphql_url: Option<String>,
    reconnect_base_delay_ms: Option<u64>,
    reconnect_max_delay_ms: Option<u64>,
    max_reconnect_attempts: Option<u32>,
    room_signal_debounce_ms: Option<u64>,
    typing_ttl_ms: Option<u64>,
    typing_renew_interval_ms: Option<u64>,
    typing_idle_timeout_ms: Option<u64>,
    send_confirm_timeout_ms: Option<u64>,
    call_token_timeout_ms: Option<u64>,
    dedup_window_ms: Option<u64>,
    housekeeping_interval_ms: Option<u64>,
    send_route: Option<SendRoute>,
}

pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new("client.toml"))
}

pub fn load_settings_from(path: &Path) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<FileSettings>(&raw) {
            Ok(file_cfg) => apply_file(&mut settings, file_cfg),
            Err(err) => warn!(path = %path.display(), "config: ignoring unreadable settings file: {err}"),
        }
    }

    apply_env(&mut settings, |key| std::env::var(key).ok());
    settings
}

fn apply_file(settings: &mut ClientSettings, file_cfg: FileSettings) {
    let millis = Duration::from_millis;

    if let Some(v) = file_cfg.server_url {
        settings.server_url = v;
    }
    if let Some(v) = file_cfg.socket_path {
        settings.socket_path = v;
    }
    if file_cfg.media_token_url.is_some() {
        settings.media_token_url = file_cfg.media_token_url;
    }
    if file_cfg.media_server_url.is_some() {
        settings.media_server_url = file_cfg.media_server_url;
    }
    if file_cfg.graphql_url.is_some() {
        settings.graphql_url = file_cfg.graphql_url;
    }
    if let Some(v) = file_cfg.reconnect_base_delay_ms {
        settings.reconnect_base_delay = millis(v);
    }
    if let Some(v) = file_cfg.reconnect_max_delay_ms {
        settings.reconnect_max_delay = millis(v);
    }
    if let Some(v) = file_cfg.max_reconnect_attempts {
        settings.max_reconnect_attempts = v;
    }
    if let Some(v) = file_cfg.room_signal_debounce_ms {
        settings.room_signal_debounce = millis(v);
    }
    if let Some(v) = file_cfg.typing_ttl_ms {
        settings.typing_ttl = millis(v);
    }
    if let Some(v) = file_cfg.typing_renew_interval_ms {
        settings.typing_renew_interval =
            nonzero_period("typing_renew_interval_ms", v, settings.typing_renew_interval);
    }
    if let Some(v) = file_cfg.typing_idle_timeout_ms {
        settings.typing_idle_timeout = millis(v);
    }
    if let Some(v) = file_cfg.send_confirm_timeout_ms {
        settings.send_confirm_timeout = millis(v);
    }
    if let Some(v) = file_cfg.call_token_timeout_ms {
        settings.call_token_timeout = millis(v);
    }
    if let Some(v) = file_cfg.dedup_window_ms {
        settings.dedup_window = millis(v);
    }
    if let Some(v) = file_cfg.housekeeping_interval_ms {
        settings.housekeeping_interval =
            nonzero_period("housekeeping_interval_ms", v, settings.housekeeping_interval);
    }
    if let Some(v) = file_cfg.send_route {
        settings.send_route = v;
    }
}

/// Periodic timers cannot tick at zero; a zero value keeps `current`.
fn nonzero_period(key: &str, ms: u64, current: Duration) -> Duration {
    if ms == 0 {
        warn!(key, "config: zero period ignored, keeping {current:?}");
        return current;
    }
    Duration::from_millis(ms)
}

fn apply_env(settings: &mut ClientSettings, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("CHAT_SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = var("APP__SERVER_URL") {
        settings.server_url = v;
    }

    if let Some(v) = var("APP__SOCKET_PATH") {
        settings.socket_path = v;
    }

    if let Some(v) = var("APP__MEDIA_TOKEN_URL") {
        settings.media_token_url = Some(v);
    }
    if let Some(v) = var("LIVEKIT_URL") {
        settings.media_server_url = Some(v);
    }
    if let Some(v) = var("APP__LIVEKIT_URL") {
        settings.media_server_url = Some(v);
    }

    if let Some(v) = var("APP__GRAPHQL_URL") {
        settings.graphql_url = Some(v);
    }

    if let Some(v) = var("APP__MAX_RECONNECT_ATTEMPTS") {
        match v.parse::<u32>() {
            Ok(parsed) => settings.max_reconnect_attempts = parsed,
            Err(_) => warn!(value = %v, "config: APP__MAX_RECONNECT_ATTEMPTS is not a number"),
        }
    }

    if let Some(v) = var("APP__SEND_ROUTE") {
        match v.as_str() {
            "transport" => settings.send_route = SendRoute::Transport,
            "collaborator" => settings.send_route = SendRoute::Collaborator,
            other => warn!(value = other, "config: unknown APP__SEND_ROUTE"),
        }
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
