use super::*;

use std::{
    collections::HashMap,
    env, fs,
    time::{SystemTime, UNIX_EPOCH},
};

#[test]
fn defaults_match_documented_values() {
    let config = ClientConfig::default();
    assert_eq!(config.reconnect_attempts, 5);
    assert_eq!(config.reconnect_delay(), Duration::from_millis(1000));
    assert_eq!(config.heartbeat_interval(), Duration::from_secs(20));
    assert_eq!(config.typing_debounce(), Duration::from_millis(2000));
    assert_eq!(config.max_send_retries, 2);
    assert_eq!(config.max_send_attempts(), 3);
    assert_eq!(config.seen_window, 50);
    assert!(config.typing_expiry() > config.typing_debounce());
}

#[test]
fn partial_toml_keeps_defaults_for_missing_keys() {
    let config = parse_config(
        r#"
server_url = "https://chat.example.com"
max_send_retries = 4
typing_debounce_ms = 1500
"#,
    )
    .expect("parse");

    assert_eq!(config.server_url, "https://chat.example.com");
    assert_eq!(config.max_send_retries, 4);
    assert_eq!(config.typing_debounce_ms, 1500);
    assert_eq!(config.reconnect_attempts, 5);
}

#[test]
fn env_overrides_win_over_file_values() {
    let mut config = parse_config("reconnect_attempts = 2").expect("parse");
    let vars: HashMap<&str, &str> = HashMap::from([
        ("CHAT__RECONNECT_ATTEMPTS", "9"),
        ("CHAT__WS_URL", "ws://127.0.0.1:9000/ws"),
        ("CHAT__SEEN_WINDOW", "not-a-number"),
    ]);

    apply_env_overrides(&mut config, |key| vars.get(key).map(|v| v.to_string()));

    assert_eq!(config.reconnect_attempts, 9);
    assert_eq!(config.ws_url.as_deref(), Some("ws://127.0.0.1:9000/ws"));
    assert_eq!(config.seen_window, 50);
}

#[test]
fn derives_websocket_url_from_server_url() {
    let mut config = ClientConfig {
        server_url: "https://chat.example.com/api".into(),
        ..ClientConfig::default()
    };
    assert_eq!(
        config.resolved_ws_url().expect("ws url"),
        "wss://chat.example.com/ws"
    );

    config.server_url = "ftp://chat.example.com".into();
    assert!(config.resolved_ws_url().is_err());

    config.ws_url = Some("ws://override/ws".into());
    assert_eq!(config.resolved_ws_url().expect("override"), "ws://override/ws");
}

#[test]
fn loads_config_file_from_disk() {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let path = env::temp_dir().join(format!("chat_client_config_{suffix}.toml"));
    fs::write(&path, "heartbeat_interval_ms = 1234\n").expect("write config");

    let config = load_config(Some(&path)).expect("load");
    assert_eq!(config.heartbeat_interval_ms, 1234);

    fs::remove_file(path).expect("cleanup");
}

#[test]
fn missing_config_file_is_an_error() {
    let path = env::temp_dir().join("chat_client_config_does_not_exist.toml");
    let err = load_config(Some(&path)).expect_err("must fail");
    assert!(err.to_string().contains("failed to read config file"));
}
