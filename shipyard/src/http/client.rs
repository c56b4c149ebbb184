//! Client for the daemon's HTTP API

use std::time::Duration;

use reqwest::{header, Client, Response};
use serde::de::DeserializeOwned;
use tracing::{debug, error};
use url::Url;

use crate::deploy::bundle::DeployMode;
use crate::deploy::registry::DeploymentRecord;
use crate::errors::ShipyardError;
use crate::models::deployment::{
    DeployResponse, DeploymentList, ErrorBody, LogsResponse, UndeployResponse,
};

/// HTTP client for a running daemon
pub struct ShipyardClient {
    client: Client,
    base_url: String,
}

impl ShipyardClient {
    /// Create a new client.
    ///
    /// Deploys block until the application is live, so the request timeout
    /// has to outlast dependency installation and readiness probing.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ShipyardError> {
        let parsed = Url::parse(base_url)
            .map_err(|e| ShipyardError::ConfigError(format!("invalid server url {base_url}: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ShipyardError::ConfigError(format!(
                "unsupported scheme in server url: {base_url}"
            )));
        }

        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Upload a ZIP bundle
    pub async fn deploy_zip(
        &self,
        archive: Vec<u8>,
        mode: Option<DeployMode>,
    ) -> Result<DeployResponse, ShipyardError> {
        let mut url = format!("{}/deployments/zip", self.base_url);
        if let Some(mode) = mode {
            url.push_str(&format!("?mode={mode}"));
        }
        debug!("POST {}", url);

        let response = self
            .client
            .post(&url)
            .header(header::CONTENT_TYPE, "application/zip")
            .body(archive)
            .send()
            .await?;
        parse(response).await
    }

    pub async fn list(&self) -> Result<DeploymentList, ShipyardError> {
        self.get("/deployments").await
    }

    pub async fn status(&self, id: &str) -> Result<DeploymentRecord, ShipyardError> {
        self.get(&format!("/deployments/{id}")).await
    }

    pub async fn undeploy(&self, id: &str) -> Result<UndeployResponse, ShipyardError> {
        let url = format!("{}/deployments/{}", self.base_url, id);
        debug!("DELETE {}", url);
        let response = self.client.delete(&url).send().await?;
        parse(response).await
    }

    pub async fn logs(&self, id: &str, tail: usize) -> Result<LogsResponse, ShipyardError> {
        self.get(&format!("/deployments/{id}/logs?tail={tail}")).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ShipyardError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("GET {}", url);
        let response = self.client.get(&url).send().await?;
        parse(response).await
    }
}

async fn parse<T: DeserializeOwned>(response: Response) -> Result<T, ShipyardError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }

    let body = response.text().await.unwrap_or_default();
    error!("Request failed: {} - {}", status, body);
    match serde_json::from_str::<ErrorBody>(&body) {
        Ok(err) if err.error == "not_found" => Err(ShipyardError::NotFound(
            err.message.trim_start_matches("Not found: ").to_string(),
        )),
        Ok(err) => {
            let mut message = format!("{status}: {}", err.message);
            if let Some(logs) = err.logs.filter(|l| !l.is_empty()) {
                message.push('\n');
                message.push_str(&logs);
            }
            Err(ShipyardError::ServerError(message))
        }
        Err(_) => Err(ShipyardError::ServerError(format!("{status}: {body}"))),
    }
}
