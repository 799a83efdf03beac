//! HTTP client for the admin server's upgrade status endpoint.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use crate::api::StatusSource;
use crate::api::types::StatusSnapshot;
use crate::error::PuwError;

/// Client for `GET /api/upgrade/status` on the admin server.
pub struct UpgradeApiClient {
    client: Client,
    status_url: String,
}

impl UpgradeApiClient {
    /// Build a client for the given base URL, e.g. `https://admin:3000`.
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            status_url: format!("{}/api/upgrade/status", base_url.trim_end_matches('/')),
        })
    }

    async fn fetch_status(&self) -> Result<StatusSnapshot, PuwError> {
        let response = self.client.get(&self.status_url).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PuwError::endpoint(status.as_u16(), &body));
        }

        let body = response.text().await?;
        let snapshot: StatusSnapshot = serde_json::from_str(&body)
            .map_err(|e| PuwError::Malformed(e.to_string()))?;

        debug!(
            url = %self.status_url,
            current_step = snapshot.current_step.as_deref().unwrap_or("none"),
            steps = snapshot.steps.len(),
            "Fetched upgrade status"
        );

        Ok(snapshot)
    }
}

#[async_trait]
impl StatusSource for UpgradeApiClient {
    async fn get_status(&self) -> Result<StatusSnapshot, PuwError> {
        self.fetch_status().await
    }
}
