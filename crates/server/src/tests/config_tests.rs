use super::*;

fn no_env(_: &str) -> Option<String> {
    None
}

#[test]
fn defaults_without_file_or_env() {
    assert_eq!(load_settings_with(None, no_env), Settings::default());
}

#[test]
fn file_values_are_applied() {
    let settings = load_settings_with(
        Some(
            r#"
bind_addr = "0.0.0.0:9000"
app_token_secret = "from-file"
livekit_url = "wss://media.example"
livekit_ttl_seconds = 120
"#,
        ),
        no_env,
    );

    assert_eq!(settings.server_bind, "0.0.0.0:9000");
    assert_eq!(settings.app_token_secret, "from-file");
    assert_eq!(settings.livekit_url.as_deref(), Some("wss://media.example"));
    assert_eq!(settings.livekit_ttl_seconds, 120);
}

#[test]
fn prefixed_env_wins_over_plain_env_and_file() {
    let settings = load_settings_with(Some(r#"bind_addr = "0.0.0.0:9000""#), |key| match key {
        "SERVER_BIND" => Some("127.0.0.1:1".into()),
        "APP__BIND_ADDR" => Some("127.0.0.1:2".into()),
        "LIVEKIT_API_KEY" => Some("env-key".into()),
        "APP__LIVEKIT_TTL_SECONDS" => Some("not-a-number".into()),
        _ => None,
    });

    assert_eq!(settings.server_bind, "127.0.0.1:2");
    assert_eq!(settings.livekit_api_key, "env-key");
    assert_eq!(settings.livekit_ttl_seconds, 3600);
}

#[test]
fn malformed_file_is_ignored() {
    let settings = load_settings_with(Some("bind_addr = ["), no_env);
    assert_eq!(settings, Settings::default());
}
