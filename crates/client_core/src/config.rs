use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_url: String,
    pub ws_url: Option<String>,
    pub reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub typing_debounce_ms: u64,
    pub typing_expiry_ms: u64,
    pub max_send_retries: u32,
    pub send_retry_delay_ms: u64,
    pub ready_timeout_ms: u64,
    pub seen_window: usize,
    pub reconcile_window_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8443".into(),
            ws_url: None,
            reconnect_attempts: 5,
            reconnect_delay_ms: 1000,
            heartbeat_interval_ms: 20_000,
            heartbeat_timeout_ms: 5000,
            typing_debounce_ms: 2000,
            typing_expiry_ms: 3000,
            max_send_retries: 2,
            send_retry_delay_ms: 1000,
            ready_timeout_ms: 5000,
            seen_window: 50,
            reconcile_window_ms: 10_000,
        }
    }
}

impl ClientConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn typing_debounce(&self) -> Duration {
        Duration::from_millis(self.typing_debounce_ms)
    }

    pub fn typing_expiry(&self) -> Duration {
        Duration::from_millis(self.typing_expiry_ms)
    }

    pub fn send_retry_delay(&self) -> Duration {
        Duration::from_millis(self.send_retry_delay_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn reconcile_window(&self) -> Duration {
        Duration::from_millis(self.reconcile_window_ms)
    }

    /// Total number of delivery attempts for one send: the first try plus the retries.
    pub fn max_send_attempts(&self) -> u32 {
        self.max_send_retries.saturating_add(1)
    }

    /// Realtime endpoint; derived from `server_url` when not configured explicitly.
    pub fn resolved_ws_url(&self) -> anyhow::Result<String> {
        if let Some(ws_url) = &self.ws_url {
            return Ok(ws_url.clone());
        }
        let mut url = url::Url::parse(&self.server_url)
            .with_context(|| format!("invalid server_url '{}'", self.server_url))?;
        let scheme = match url.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => anyhow::bail!("server_url must use http or https, got '{other}'"),
        };
        url.set_scheme(scheme)
            .map_err(|_| anyhow::anyhow!("cannot derive websocket url from '{}'", self.server_url))?;
        url.set_path("/ws");
        Ok(url.to_string())
    }
}

/// Loads configuration from an optional TOML file, then applies `CHAT__*` environment overrides.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<ClientConfig> {
    let mut config = match path {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read config file '{}'", path.display()))?;
            parse_config(&raw)
                .with_context(|| format!("failed to parse config file '{}'", path.display()))?
        }
        None => ClientConfig::default(),
    };
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

pub fn parse_config(raw: &str) -> anyhow::Result<ClientConfig> {
    Ok(toml::from_str::<ClientConfig>(raw)?)
}

fn apply_env_overrides(config: &mut ClientConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("CHAT__SERVER_URL") {
        config.server_url = v;
    }
    if let Some(v) = lookup("CHAT__WS_URL") {
        config.ws_url = Some(v);
    }

    override_number(&lookup, "CHAT__RECONNECT_ATTEMPTS", &mut config.reconnect_attempts);
    override_number(&lookup, "CHAT__RECONNECT_DELAY_MS", &mut config.reconnect_delay_ms);
    override_number(&lookup, "CHAT__HEARTBEAT_INTERVAL_MS", &mut config.heartbeat_interval_ms);
    override_number(&lookup, "CHAT__HEARTBEAT_TIMEOUT_MS", &mut config.heartbeat_timeout_ms);
    override_number(&lookup, "CHAT__TYPING_DEBOUNCE_MS", &mut config.typing_debounce_ms);
    override_number(&lookup, "CHAT__TYPING_EXPIRY_MS", &mut config.typing_expiry_ms);
    override_number(&lookup, "CHAT__MAX_SEND_RETRIES", &mut config.max_send_retries);
    override_number(&lookup, "CHAT__SEND_RETRY_DELAY_MS", &mut config.send_retry_delay_ms);
    override_number(&lookup, "CHAT__READY_TIMEOUT_MS", &mut config.ready_timeout_ms);
    override_number(&lookup, "CHAT__SEEN_WINDOW", &mut config.seen_window);
    override_number(&lookup, "CHAT__RECONCILE_WINDOW_MS", &mut config.reconcile_window_ms);
}

fn override_number<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(parsed) => *slot = parsed,
        Err(_) => warn!(key, value = %raw, "config: ignoring non-numeric override"),
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
