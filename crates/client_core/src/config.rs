use std::{fs, path::Path, time::Duration};

use anyhow::{anyhow, Context, Result};

use crate::{error::ChannelError, signal::ReconnectPolicy};

const DEFAULT_CONFIG_FILE: &str = "client.toml";
const ENV_PREFIX: &str = "APP__";

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub server_url: String,
    pub signal_url: Option<String>,
    pub signal_enabled: bool,
    pub poll_interval: Duration,
    pub roster_interval: Duration,
    pub typing_status_interval: Duration,
    pub typing_idle: Duration,
    pub reconnect: ReconnectPolicy,
    pub max_body_chars: usize,
    /// How far apart a local send and its polled counterpart may be stamped
    /// and still be treated as the same message.
    pub reconcile_window: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".into(),
            signal_url: None,
            signal_enabled: true,
            poll_interval: Duration::from_secs(3),
            roster_interval: Duration::from_secs(30),
            typing_status_interval: Duration::from_secs(1),
            typing_idle: Duration::from_secs(2),
            reconnect: ReconnectPolicy::default(),
            max_body_chars: 1_000,
            reconcile_window: Duration::from_secs(30),
        }
    }
}

impl ClientSettings {
    /// Socket endpoint, or `None` when the signal channel is disabled.
    pub fn signal_endpoint(&self) -> Result<Option<String>, ChannelError> {
        if !self.signal_enabled {
            return Ok(None);
        }
        if let Some(url) = &self.signal_url {
            return Ok(Some(url.clone()));
        }

        let base = self.server_url.trim_end_matches('/');
        let ws_base = if base.starts_with("https://") {
            base.replacen("https://", "wss://", 1)
        } else if base.starts_with("http://") {
            base.replacen("http://", "ws://", 1)
        } else {
            return Err(ChannelError::InvalidUrl {
                url: self.server_url.clone(),
                reason: "server_url must start with http:// or https://".into(),
            });
        };
        Ok(Some(format!("{ws_base}/api/ws")))
    }

    fn set(&mut self, key: &str, raw: &str) -> Result<()> {
        let raw = raw.trim();
        match key {
            "server_url" => self.server_url = raw.trim_end_matches('/').to_string(),
            "signal_url" => {
                self.signal_url = (!raw.is_empty()).then(|| raw.to_string());
            }
            "signal_enabled" => self.signal_enabled = parse_value(key, raw)?,
            "poll_interval_ms" => self.poll_interval = parse_millis(key, raw)?,
            "roster_interval_ms" => self.roster_interval = parse_millis(key, raw)?,
            "typing_status_interval_ms" => self.typing_status_interval = parse_millis(key, raw)?,
            "typing_idle_ms" => self.typing_idle = parse_millis(key, raw)?,
            "reconnect_base_ms" => self.reconnect.base = parse_millis(key, raw)?,
            "reconnect_cap_ms" => self.reconnect.cap = parse_millis(key, raw)?,
            "reconnect_max_attempts" => self.reconnect.max_attempts = parse_value(key, raw)?,
            "max_body_chars" => self.max_body_chars = parse_value(key, raw)?,
            "reconcile_window_ms" => self.reconcile_window = parse_millis(key, raw)?,
            other => tracing::warn!(key = other, "config: ignoring unknown setting"),
        }
        Ok(())
    }

    /// Applies `APP__*` overrides read through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        for key in KNOWN_KEYS {
            let env_key = format!("{ENV_PREFIX}{}", key.to_ascii_uppercase());
            if let Some(value) = lookup(&env_key) {
                self.set(key, &value)
                    .with_context(|| format!("invalid value in {env_key}"))?;
            }
        }
        Ok(())
    }

    pub fn apply_toml(&mut self, raw: &str) -> Result<()> {
        let table: toml::Table = toml::from_str(raw).context("client config is not valid TOML")?;
        for (key, value) in table {
            let value = match value {
                toml::Value::String(text) => text,
                other => other.to_string(),
            };
            self.set(&key, &value)?;
        }
        Ok(())
    }
}

const KNOWN_KEYS: [&str; 12] = [
    "server_url",
    "signal_url",
    "signal_enabled",
    "poll_interval_ms",
    "roster_interval_ms",
    "typing_status_interval_ms",
    "typing_idle_ms",
    "reconnect_base_ms",
    "reconnect_cap_ms",
    "reconnect_max_attempts",
    "max_body_chars",
    "reconcile_window_ms",
];

/// Defaults, then `client.toml` (or `path`), then `APP__*` environment.
pub fn load_settings(path: Option<&Path>) -> Result<ClientSettings> {
    let mut settings = ClientSettings::default();

    let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
    match fs::read_to_string(path) {
        Ok(raw) => settings
            .apply_toml(&raw)
            .with_context(|| format!("failed to load '{}'", path.display()))?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read '{}'", path.display()));
        }
    }

    settings.apply_overrides(|key| std::env::var(key).ok())?;
    Ok(settings)
}

fn parse_value<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.parse::<T>()
        .map_err(|_| anyhow!("setting '{key}' has invalid value '{raw}'"))
}

fn parse_millis(key: &str, raw: &str) -> Result<Duration> {
    parse_value::<u64>(key, raw).map(Duration::from_millis)
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
