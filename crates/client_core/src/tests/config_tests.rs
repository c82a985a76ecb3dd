use std::{
    collections::HashMap,
    env,
    time::{SystemTime, UNIX_EPOCH},
};

use super::*;

fn temp_settings_path(name: &str) -> PathBuf {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    env::temp_dir().join(format!("chat_sync_{name}_{suffix}.toml"))
}

#[test]
fn defaults_match_reference_timings() {
    let settings = SyncSettings::default();
    assert_eq!(settings.heartbeat_interval, Duration::from_secs(25));
    assert_eq!(settings.reconnect_delay_floor, Duration::from_secs(1));
    assert_eq!(settings.reconnect_delay_ceiling, Duration::from_secs(5));
    assert_eq!(settings.dedup_retention, Duration::from_secs(300));
    assert_eq!(settings.request_timeout, Duration::from_secs(10));
}

#[test]
fn socket_endpoint_is_derived_from_rest_base() {
    let mut settings = SyncSettings {
        rest_base_url: "https://chat.example.org/".into(),
        ..SyncSettings::default()
    };
    assert_eq!(
        settings.socket_endpoint().expect("endpoint"),
        "wss://chat.example.org/ws"
    );

    settings.rest_base_url = "ftp://nope".into();
    assert!(settings.socket_endpoint().is_err());

    settings.socket_url = Some("ws://10.0.0.2:9000/socket".into());
    assert_eq!(
        settings.socket_endpoint().expect("endpoint"),
        "ws://10.0.0.2:9000/socket"
    );
}

#[test]
fn settings_file_overrides_defaults() {
    let path = temp_settings_path("file");
    fs::write(
        &path,
        "rest_base_url = \"http://10.1.1.1:3000\"\nheartbeat_interval_ms = 5000\nrefresh_debounce_ms = 10\n",
    )
    .expect("write settings");

    let settings = load_settings(Some(&path)).expect("load");
    assert_eq!(settings.rest_base_url, "http://10.1.1.1:3000");
    assert_eq!(settings.heartbeat_interval, Duration::from_secs(5));
    assert_eq!(settings.refresh_debounce, Duration::from_millis(10));
    assert_eq!(settings.reconnect_delay_ceiling, Duration::from_secs(5));

    fs::remove_file(path).expect("cleanup");
}

#[test]
fn explicit_missing_file_is_an_error() {
    let path = temp_settings_path("missing");
    let err = load_settings(Some(&path)).expect_err("must fail");
    assert!(err.to_string().contains("failed to read settings file"));
}

#[test]
fn unknown_keys_are_rejected() {
    let path = temp_settings_path("unknown");
    fs::write(&path, "heartbeat_ms = 1\n").expect("write settings");
    assert!(load_settings(Some(&path)).is_err());
    fs::remove_file(path).expect("cleanup");
}

#[test]
fn env_overrides_win_and_bad_values_are_ignored() {
    let vars: HashMap<&str, &str> = HashMap::from([
        ("CHAT_SYNC__REST_BASE_URL", "http://override:1"),
        ("CHAT_SYNC__DEDUP_RETENTION_MS", "1000"),
        ("CHAT_SYNC__REQUEST_TIMEOUT_MS", "soon"),
    ]);
    let mut settings = SyncSettings::default();
    settings.apply_env_overrides(|name| vars.get(name).map(|v| v.to_string()));

    assert_eq!(settings.rest_base_url, "http://override:1");
    assert_eq!(settings.dedup_retention, Duration::from_secs(1));
    assert_eq!(settings.request_timeout, Duration::from_secs(10));
}

#[test]
fn floor_above_ceiling_fails_validation() {
    let settings = SyncSettings {
        reconnect_delay_floor: Duration::from_secs(10),
        ..SyncSettings::default()
    };
    assert!(settings.validate().is_err());
}
