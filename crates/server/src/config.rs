use std::{collections::HashMap, fs};

use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Settings {
    pub server_bind: String,
    /// HS256 secret shared with whoever mints application auth tokens.
    pub app_token_secret: String,
    pub livekit_api_key: String,
    pub livekit_api_secret: String,
    pub livekit_url: Option<String>,
    pub livekit_ttl_seconds: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8080".into(),
            app_token_secret: "dev-app-secret".into(),
            livekit_api_key: "devkey".into(),
            livekit_api_secret: "devsecret".into(),
            livekit_url: None,
            livekit_ttl_seconds: 3600,
        }
    }
}

pub fn load_settings() -> Settings {
    let file = fs::read_to_string("server.toml").ok();
    load_settings_with(file.as_deref(), |key| std::env::var(key).ok())
}

/// `server.toml` first, then environment overrides. Later keys in each list win.
pub(crate) fn load_settings_with(
    file: Option<&str>,
    var: impl Fn(&str) -> Option<String>,
) -> Settings {
    let mut settings = Settings::default();

    if let Some(raw) = file {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, toml::Value>>(raw) {
            let text = |key: &str| {
                file_cfg.get(key).map(|value| match value {
                    toml::Value::String(text) => text.clone(),
                    other => other.to_string(),
                })
            };
            if let Some(v) = text("bind_addr") {
                settings.server_bind = v;
            }
            if let Some(v) = text("app_token_secret") {
                settings.app_token_secret = v;
            }
            if let Some(v) = text("livekit_api_key") {
                settings.livekit_api_key = v;
            }
            if let Some(v) = text("livekit_api_secret") {
                settings.livekit_api_secret = v;
            }
            if let Some(v) = text("livekit_url") {
                settings.livekit_url = Some(v);
            }
            if let Some(v) = text("livekit_ttl_seconds").and_then(|v| v.parse().ok()) {
                settings.livekit_ttl_seconds = v;
            }
        }
    }

    for key in ["SERVER_BIND", "APP__BIND_ADDR"] {
        if let Some(v) = var(key) {
            settings.server_bind = v;
        }
    }
    for key in ["APP_TOKEN_SECRET", "APP__APP_TOKEN_SECRET"] {
        if let Some(v) = var(key) {
            settings.app_token_secret = v;
        }
    }
    for key in ["LIVEKIT_API_KEY", "APP__LIVEKIT_API_KEY"] {
        if let Some(v) = var(key) {
            settings.livekit_api_key = v;
        }
    }
    for key in ["LIVEKIT_API_SECRET", "APP__LIVEKIT_API_SECRET"] {
        if let Some(v) = var(key) {
            settings.livekit_api_secret = v;
        }
    }
    for key in ["LIVEKIT_URL", "APP__LIVEKIT_URL"] {
        if let Some(v) = var(key) {
            settings.livekit_url = Some(v);
        }
    }
    if let Some(v) = var("APP__LIVEKIT_TTL_SECONDS").and_then(|v| v.parse().ok()) {
        settings.livekit_ttl_seconds = v;
    }

    settings
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
