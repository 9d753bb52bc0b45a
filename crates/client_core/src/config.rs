use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use shared::domain::UserId;
use tracing::warn;

use crate::{connection::ReconnectPolicy, error::ClientError};

pub const DEFAULT_CONFIG_FILE: &str = "chat_client.toml";
pub const CHAT_SOCKET_PATH: &str = "/v1/chat/ws";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub server_url: String,
    /// Explicit socket base such as `wss://chat.example.com`; derived from
    /// `server_url` when unset.
    pub ws_url: Option<String>,
    pub heartbeat_interval_secs: u64,
    pub manual_reconnect_delay_ms: u64,
    pub send_retry_delay_ms: u64,
    pub delivered_after_ms: u64,
    pub read_after_ms: u64,
    pub reconnect: ReconnectPolicy,
    pub store_path: Option<PathBuf>,
    pub github_client_id: Option<String>,
    pub github_redirect_uri: Option<String>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8000".into(),
            ws_url: None,
            heartbeat_interval_secs: 30,
            manual_reconnect_delay_ms: 100,
            send_retry_delay_ms: 1000,
            delivered_after_ms: 500,
            read_after_ms: 1500,
            reconnect: ReconnectPolicy::default(),
            store_path: None,
            github_client_id: None,
            github_redirect_uri: None,
        }
    }
}

impl ClientSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn manual_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.manual_reconnect_delay_ms)
    }

    pub fn send_retry_delay(&self) -> Duration {
        Duration::from_millis(self.send_retry_delay_ms)
    }

    pub fn delivered_after(&self) -> Duration {
        Duration::from_millis(self.delivered_after_ms)
    }

    pub fn read_after(&self) -> Duration {
        Duration::from_millis(self.read_after_ms)
    }

    pub fn api_base(&self) -> &str {
        self.server_url.trim_end_matches('/')
    }

    pub fn ws_base(&self) -> Result<String, ClientError> {
        if let Some(ws_url) = &self.ws_url {
            if ws_url.starts_with("ws://") || ws_url.starts_with("wss://") {
                return Ok(ws_url.trim_end_matches('/').to_string());
            }
            return Err(ClientError::Config(format!(
                "ws_url must start with ws:// or wss://, got {ws_url}"
            )));
        }

        let base = self.api_base();
        if let Some(rest) = base.strip_prefix("https://") {
            Ok(format!("wss://{rest}"))
        } else if let Some(rest) = base.strip_prefix("http://") {
            Ok(format!("ws://{rest}"))
        } else {
            Err(ClientError::Config(format!(
                "server_url must start with http:// or https://, got {base}"
            )))
        }
    }

    pub fn ws_endpoint(&self, user_id: UserId) -> Result<String, ClientError> {
        Ok(format!("{}{CHAT_SOCKET_PATH}/{user_id}", self.ws_base()?))
    }
}

pub fn load_settings() -> ClientSettings {
    let mut settings = load_settings_from(Path::new(DEFAULT_CONFIG_FILE));
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    settings
}

pub fn load_settings_from(path: &Path) -> ClientSettings {
    let Ok(raw) = fs::read_to_string(path) else {
        return ClientSettings::default();
    };

    match toml::from_str::<ClientSettings>(&raw) {
        Ok(settings) => settings,
        Err(err) => {
            warn!(path = %path.display(), %err, "config: ignoring unreadable settings file");
            ClientSettings::default()
        }
    }
}

pub fn apply_env_overrides<F>(settings: &mut ClientSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = lookup("CHAT_SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = lookup("APP__SERVER_URL") {
        settings.server_url = v;
    }

    if let Some(v) = lookup("APP__WS_URL") {
        settings.ws_url = Some(v);
    }

    if let Some(v) = lookup("APP__HEARTBEAT_SECS") {
        match v.parse::<u64>() {
            Ok(parsed) => settings.heartbeat_interval_secs = parsed,
            Err(_) => warn!(value = %v, "config: APP__HEARTBEAT_SECS is not a number"),
        }
    }

    if let Some(v) = lookup("APP__STORE_PATH") {
        settings.store_path = Some(PathBuf::from(v));
    }

    if let Some(v) = lookup("APP__GITHUB_CLIENT_ID") {
        settings.github_client_id = Some(v);
    }
    if let Some(v) = lookup("APP__GITHUB_REDIRECT_URI") {
        settings.github_redirect_uri = Some(v);
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
