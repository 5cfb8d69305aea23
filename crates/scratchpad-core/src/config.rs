use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ScratchpadError, ScratchpadResult};
use crate::types::ConnectionId;

/// Top-level client configuration (loaded from config.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScratchpadConfig {
    pub client: ClientConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Relay base URL (http:// or https://)
    pub server: String,
    /// JSON key-value store holding keys and the connection list
    pub store_path: PathBuf,
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// First reconnect delay; doubles after every close
    pub initial_backoff_secs: u64,
    /// Period of the flush check
    pub flush_tick_ms: u64,
    /// Quiet time after the last local edit before text is pushed
    pub quiet_interval_ms: u64,
    /// Document shown when the relay has no stored text yet
    pub welcome_text: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: "http://127.0.0.1:8000".into(),
            store_path: PathBuf::from("~/.local/share/scratchpad/store.json"),
            log_level: "info".into(),
            log_format: "text".into(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            initial_backoff_secs: 1,
            flush_tick_ms: 250,
            quiet_interval_ms: 1000,
            welcome_text:
                "\nHello there!\n\nThis is your newly minted scratchpad. Have fun with it!\n"
                    .into(),
        }
    }
}

impl SessionConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_secs(self.initial_backoff_secs)
    }

    pub fn flush_tick(&self) -> Duration {
        Duration::from_millis(self.flush_tick_ms.max(1))
    }
}

impl ClientConfig {
    /// Base URL for HTTP calls, without trailing slash.
    pub fn http_base(&self) -> ScratchpadResult<String> {
        let base = self.server.trim_end_matches('/');
        if base.starts_with("http://") || base.starts_with("https://") {
            Ok(base.to_string())
        } else {
            Err(ScratchpadError::Config(format!(
                "server must be an http:// or https:// URL, got '{}'",
                self.server
            )))
        }
    }

    /// Base URL for the WebSocket channel: http→ws, https→wss.
    pub fn ws_base(&self) -> ScratchpadResult<String> {
        let http = self.http_base()?;
        Ok(match http.strip_prefix("https://") {
            Some(rest) => format!("wss://{rest}"),
            None => format!("ws://{}", http.trim_start_matches("http://")),
        })
    }

    pub fn record_url(&self, id: &ConnectionId) -> ScratchpadResult<String> {
        Ok(format!("{}/api/connections/{id}", self.http_base()?))
    }

    pub fn socket_url(&self, id: &ConnectionId) -> ScratchpadResult<String> {
        Ok(format!("{}/api/ws/{id}", self.ws_base()?))
    }
}
