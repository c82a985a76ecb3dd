use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

pub const DEFAULT_SETTINGS_FILE: &str = "chat_sync.toml";
const ENV_PREFIX: &str = "CHAT_SYNC__";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    pub rest_base_url: String,
    /// Explicit socket endpoint; derived from `rest_base_url` when unset.
    pub socket_url: Option<String>,
    pub heartbeat_interval: Duration,
    pub reconnect_delay_floor: Duration,
    pub reconnect_delay_ceiling: Duration,
    pub connect_timeout: Duration,
    pub dedup_retention: Duration,
    pub dedup_sweep_interval: Duration,
    pub request_timeout: Duration,
    pub refresh_debounce: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            rest_base_url: "http://127.0.0.1:8080".into(),
            socket_url: None,
            heartbeat_interval: Duration::from_secs(25),
            reconnect_delay_floor: Duration::from_secs(1),
            reconnect_delay_ceiling: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            dedup_retention: Duration::from_secs(5 * 60),
            dedup_sweep_interval: Duration::from_secs(60),
            request_timeout: Duration::from_secs(10),
            refresh_debounce: Duration::from_millis(750),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSettings {
    rest_base_url: Option<String>,
    socket_url: Option<String>,
    heartbeat_interval_ms: Option<u64>,
    reconnect_delay_floor_ms: Option<u64>,
    reconnect_delay_ceiling_ms: Option<u64>,
    connect_timeout_ms: Option<u64>,
    dedup_retention_ms: Option<u64>,
    dedup_sweep_interval_ms: Option<u64>,
    request_timeout_ms: Option<u64>,
    refresh_debounce_ms: Option<u64>,
}

impl SyncSettings {
    /// Socket endpoint: the explicit `socket_url`, or the REST base with its
    /// scheme swapped to `ws`/`wss` and `/ws` appended.
    pub fn socket_endpoint(&self) -> Result<String> {
        if let Some(url) = &self.socket_url {
            return Ok(url.clone());
        }
        let base = self.rest_base_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            return Err(anyhow!("rest_base_url must start with http:// or https://"));
        };
        Ok(format!("{ws_base}/ws"))
    }

    fn apply_file(&mut self, file: FileSettings) {
        if let Some(v) = file.rest_base_url {
            self.rest_base_url = v;
        }
        if let Some(v) = file.socket_url {
            self.socket_url = Some(v);
        }
        apply_ms(&mut self.heartbeat_interval, file.heartbeat_interval_ms);
        apply_ms(&mut self.reconnect_delay_floor, file.reconnect_delay_floor_ms);
        apply_ms(&mut self.reconnect_delay_ceiling, file.reconnect_delay_ceiling_ms);
        apply_ms(&mut self.connect_timeout, file.connect_timeout_ms);
        apply_ms(&mut self.dedup_retention, file.dedup_retention_ms);
        apply_ms(&mut self.dedup_sweep_interval, file.dedup_sweep_interval_ms);
        apply_ms(&mut self.request_timeout, file.request_timeout_ms);
        apply_ms(&mut self.refresh_debounce, file.refresh_debounce_ms);
    }

    /// Applies `CHAT_SYNC__*` overrides looked up through `lookup`.
    /// Unparseable durations are ignored.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        let ms = |name: &str| var(name).and_then(|v| v.trim().parse::<u64>().ok());

        if let Some(v) = var("REST_BASE_URL") {
            self.rest_base_url = v;
        }
        if let Some(v) = var("SOCKET_URL") {
            self.socket_url = Some(v);
        }
        apply_ms(&mut self.heartbeat_interval, ms("HEARTBEAT_INTERVAL_MS"));
        apply_ms(&mut self.reconnect_delay_floor, ms("RECONNECT_DELAY_FLOOR_MS"));
        apply_ms(&mut self.reconnect_delay_ceiling, ms("RECONNECT_DELAY_CEILING_MS"));
        apply_ms(&mut self.connect_timeout, ms("CONNECT_TIMEOUT_MS"));
        apply_ms(&mut self.dedup_retention, ms("DEDUP_RETENTION_MS"));
        apply_ms(&mut self.dedup_sweep_interval, ms("DEDUP_SWEEP_INTERVAL_MS"));
        apply_ms(&mut self.request_timeout, ms("REQUEST_TIMEOUT_MS"));
        apply_ms(&mut self.refresh_debounce, ms("REFRESH_DEBOUNCE_MS"));
    }

    fn validate(&self) -> Result<()> {
        if self.reconnect_delay_floor > self.reconnect_delay_ceiling {
            return Err(anyhow!(
                "reconnect delay floor {:?} exceeds ceiling {:?}",
                self.reconnect_delay_floor,
                self.reconnect_delay_ceiling
            ));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(anyhow!("heartbeat interval must be non-zero"));
        }
        if self.dedup_sweep_interval.is_zero() {
            return Err(anyhow!("dedup sweep interval must be non-zero"));
        }
        self.socket_endpoint().map(|_| ())
    }
}

fn apply_ms(target: &mut Duration, value: Option<u64>) {
    if let Some(ms) = value {
        *target = Duration::from_millis(ms);
    }
}

/// Defaults, then the settings file, then `CHAT_SYNC__*` environment
/// variables. A missing default file is fine; a missing explicit one is not.
pub fn load_settings(path: Option<&Path>) -> Result<SyncSettings> {
    let mut settings = SyncSettings::default();

    let explicit = path.is_some();
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_FILE));

    match fs::read_to_string(&path) {
        Ok(raw) => {
            let file: FileSettings = toml::from_str(&raw)
                .with_context(|| format!("invalid settings file '{}'", path.display()))?;
            settings.apply_file(file);
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound && !explicit => {}
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read settings file '{}'", path.display()));
        }
    }

    settings.apply_env_overrides(|name| std::env::var(name).ok());
    settings.validate()?;
    Ok(settings)
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
