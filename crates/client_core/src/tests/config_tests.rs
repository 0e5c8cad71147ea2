use super::*;

use std::{
    collections::HashMap,
    env,
    time::{SystemTime, UNIX_EPOCH},
};

#[test]
fn defaults_match_reference_cadence() {
    let settings = ClientSettings::default();
    assert_eq!(settings.poll_interval, Duration::from_secs(3));
    assert_eq!(settings.typing_idle, Duration::from_secs(2));
    assert_eq!(settings.typing_status_interval, Duration::from_secs(1));
    assert_eq!(settings.roster_interval, Duration::from_secs(30));
    assert_eq!(settings.reconnect.base, Duration::from_secs(1));
    assert_eq!(settings.reconnect.cap, Duration::from_secs(30));
    assert_eq!(settings.reconnect.max_attempts, 5);
    assert_eq!(settings.max_body_chars, 1_000);
}

#[test]
fn derives_signal_endpoint_from_server_url() {
    let mut settings = ClientSettings {
        server_url: "https://chat.example.org/".into(),
        ..ClientSettings::default()
    };
    assert_eq!(
        settings.signal_endpoint().expect("endpoint"),
        Some("wss://chat.example.org/api/ws".to_string())
    );

    settings.server_url = "http://127.0.0.1:9000".into();
    assert_eq!(
        settings.signal_endpoint().expect("endpoint"),
        Some("ws://127.0.0.1:9000/api/ws".to_string())
    );

    settings.signal_enabled = false;
    assert_eq!(settings.signal_endpoint().expect("endpoint"), None);
}

#[test]
fn rejects_server_url_without_http_scheme() {
    let settings = ClientSettings {
        server_url: "chat.example.org".into(),
        ..ClientSettings::default()
    };
    assert!(matches!(
        settings.signal_endpoint(),
        Err(ChannelError::InvalidUrl { .. })
    ));
}

#[test]
fn toml_values_override_defaults() {
    let mut settings = ClientSettings::default();
    settings
        .apply_toml(
            r#"
server_url = "https://chat.example.org/"
poll_interval_ms = 5000
signal_enabled = false
reconnect_max_attempts = 8
"#,
        )
        .expect("apply toml");

    assert_eq!(settings.server_url, "https://chat.example.org");
    assert_eq!(settings.poll_interval, Duration::from_millis(5000));
    assert!(!settings.signal_enabled);
    assert_eq!(settings.reconnect.max_attempts, 8);
}

#[test]
fn environment_overrides_win_and_report_bad_values() {
    let mut settings = ClientSettings::default();
    let vars: HashMap<&str, &str> = HashMap::from([
        ("APP__TYPING_IDLE_MS", "1500"),
        ("APP__SIGNAL_URL", "ws://relay.local/socket"),
    ]);
    settings
        .apply_overrides(|key| vars.get(key).map(|value| value.to_string()))
        .expect("overrides");
    assert_eq!(settings.typing_idle, Duration::from_millis(1500));
    assert_eq!(
        settings.signal_endpoint().expect("endpoint"),
        Some("ws://relay.local/socket".to_string())
    );

    let err = settings
        .apply_overrides(|key| (key == "APP__POLL_INTERVAL_MS").then(|| "soon".to_string()))
        .expect_err("must reject");
    assert!(err.to_string().contains("APP__POLL_INTERVAL_MS"));
}

#[test]
fn load_settings_reads_explicit_file() {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let path = env::temp_dir().join(format!("secure_chat_client_{suffix}.toml"));
    fs::write(&path, "max_body_chars = 250\n").expect("write config");

    let settings = load_settings(Some(&path)).expect("load");
    assert_eq!(settings.max_body_chars, 250);

    fs::remove_file(path).expect("cleanup");
}

#[test]
fn load_settings_tolerates_missing_file() {
    let path = env::temp_dir().join("secure_chat_client_does_not_exist.toml");
    let settings = load_settings(Some(&path)).expect("load");
    assert_eq!(settings.poll_interval, ClientSettings::default().poll_interval);
}
