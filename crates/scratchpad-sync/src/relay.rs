//! HTTP side of the relay: connection records, connection creation, health.

use async_trait::async_trait;
use scratchpad_core::config::ClientConfig;
use scratchpad_core::types::ConnectionId;
use scratchpad_core::{ScratchpadError, ScratchpadResult};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::protocol::ConnectionRecord;

/// Reply of `GET /api/status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStatus {
    pub status: String,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub version: String,
}

#[async_trait]
pub trait RelayApi: Send + Sync {
    /// `GET /api/connections/{id}`
    async fn fetch_record(&self, id: &ConnectionId) -> ScratchpadResult<ConnectionRecord>;

    /// `POST /api/connections` with the admin bearer token; returns the new id.
    async fn create_connection(&self, admin_token: &str) -> ScratchpadResult<ConnectionId>;

    /// `GET /api/status`
    async fn status(&self) -> ScratchpadResult<RelayStatus>;
}

pub struct HttpRelay {
    client: reqwest::Client,
    config: ClientConfig,
    base: String,
}

impl HttpRelay {
    pub fn new(config: &ClientConfig) -> ScratchpadResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("scratchpad/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ScratchpadError::Transport(format!("building HTTP client: {e}")))?;
        Ok(HttpRelay {
            client,
            base: config.http_base()?,
            config: config.clone(),
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }
}

fn http_error(context: &str, e: reqwest::Error) -> ScratchpadError {
    ScratchpadError::Transport(format!("{context}: {e}"))
}

#[async_trait]
impl RelayApi for HttpRelay {
    async fn fetch_record(&self, id: &ConnectionId) -> ScratchpadResult<ConnectionRecord> {
        let url = self.config.record_url(id)?;
        debug!(%url, "fetching connection record");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| http_error("fetching connection record", e))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ScratchpadError::Transport(format!(
                "relay does not know connection {id}"
            )));
        }

        response
            .error_for_status()
            .map_err(|e| http_error("fetching connection record", e))?
            .json::<ConnectionRecord>()
            .await
            .map_err(|e| ScratchpadError::Protocol(format!("connection record: {e}")))
    }

    async fn create_connection(&self, admin_token: &str) -> ScratchpadResult<ConnectionId> {
        let url = format!("{}/api/connections", self.base);

        let response = self
            .client
            .post(&url)
            .bearer_auth(admin_token)
            .send()
            .await
            .map_err(|e| http_error("creating connection", e))?;

        if response.status() == reqwest::StatusCode::FORBIDDEN {
            return Err(ScratchpadError::Transport(
                "relay refused the admin token".into(),
            ));
        }

        response
            .error_for_status()
            .map_err(|e| http_error("creating connection", e))?
            .json::<ConnectionId>()
            .await
            .map_err(|e| ScratchpadError::Protocol(format!("new connection id: {e}")))
    }

    async fn status(&self) -> ScratchpadResult<RelayStatus> {
        let url = format!("{}/api/status", self.base);

        self.client
            .get(&url)
            .send()
            .await
            .map_err(|e| http_error("relay status", e))?
            .error_for_status()
            .map_err(|e| http_error("relay status", e))?
            .json::<RelayStatus>()
            .await
            .map_err(|e| ScratchpadError::Protocol(format!("relay status: {e}")))
    }
}
