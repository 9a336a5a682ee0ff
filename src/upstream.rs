use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

/// Request timeout for the upstream identity endpoint.
const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// The fields of Jellyfin's `/System/Info/Public` response this proxy
/// cares about; everything else in the body is ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerIdentity {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "ServerName")]
    pub server_name: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("upstream unreachable: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("upstream returned HTTP {0}")]
    Status(StatusCode),
    #[error("invalid upstream response body: {0}")]
    Decode(#[source] reqwest::Error),
}

/// HTTP client for the upstream identity endpoint. No retries here; the
/// engine retries only on the next incoming discovery request.
pub struct UpstreamFetcher {
    client: reqwest::Client,
}

impl UpstreamFetcher {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }

    /// Single bounded-timeout GET of `<base_url>/System/Info/Public`.
    pub async fn fetch(&self, base_url: &str) -> Result<ServerIdentity, FetchError> {
        let info_url = format!("{}/System/Info/Public", base_url);
        tracing::debug!("Fetching server info from {}", info_url);

        let response = self
            .client
            .get(&info_url)
            .send()
            .await
            .map_err(FetchError::Transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status));
        }

        let identity: ServerIdentity = response.json().await.map_err(FetchError::Decode)?;
        tracing::info!(
            "Retrieved server info from upstream (name: {}, id: {})",
            identity.server_name,
            identity.id
        );
        Ok(identity)
    }
}
