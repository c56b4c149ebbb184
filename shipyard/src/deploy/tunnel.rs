//! Public tunnel provisioning

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};
use url::Url;

use crate::errors::ShipyardError;

/// Exposes local ports through a public endpoint
#[async_trait]
pub trait TunnelProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Open a tunnel to `port`, or return the one already open for it
    async fn open(&self, port: u16) -> Result<String, ShipyardError>;

    /// Close the tunnel behind `public_url`. A tunnel that is already gone
    /// is not an error.
    async fn close(&self, public_url: &str) -> Result<(), ShipyardError>;

    /// Release provider-wide resources at process exit
    async fn shutdown(&self) {}
}

/// Tunnels currently open, by local port
#[derive(Debug, Default)]
struct TunnelBook {
    by_port: Mutex<HashMap<u16, String>>,
}

impl TunnelBook {
    fn get(&self, port: u16) -> Option<String> {
        self.by_port
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&port)
            .cloned()
    }

    /// Record `url` for `port` unless another open raced us; returns the winner
    fn record(&self, port: u16, url: String) -> String {
        self.by_port
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(port)
            .or_insert(url)
            .clone()
    }

    fn forget(&self, public_url: &str) -> Option<u16> {
        let mut map = self.by_port.lock().unwrap_or_else(|e| e.into_inner());
        let port = map
            .iter()
            .find(|(_, url)| url.as_str() == public_url)
            .map(|(port, _)| *port)?;
        map.remove(&port);
        Some(port)
    }

    fn len(&self) -> usize {
        self.by_port.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

// ================================ LOCAL ======================================= //

/// Passthrough provider: the "public" URL is the local address itself.
///
/// Used when no tunneling service is configured and in tests.
#[derive(Debug)]
pub struct LocalTunnel {
    host: String,
    book: TunnelBook,
}

impl LocalTunnel {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            book: TunnelBook::default(),
        }
    }

    pub fn open_count(&self) -> usize {
        self.book.len()
    }
}

impl Default for LocalTunnel {
    fn default() -> Self {
        Self::new("127.0.0.1")
    }
}

#[async_trait]
impl TunnelProvider for LocalTunnel {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn open(&self, port: u16) -> Result<String, ShipyardError> {
        if let Some(url) = self.book.get(port) {
            return Ok(url);
        }
        Ok(self.book.record(port, format!("http://{}:{}", self.host, port)))
    }

    async fn close(&self, public_url: &str) -> Result<(), ShipyardError> {
        self.book.forget(public_url);
        Ok(())
    }
}

// ================================ NGROK ======================================= //

/// ngrok provider options
#[derive(Debug, Clone)]
pub struct NgrokOptions {
    /// Local agent API
    pub api_url: String,

    /// Agent authentication token
    pub auth_token: Option<SecretString>,

    /// Start an agent when none answers on `api_url`
    pub spawn_agent: bool,

    /// ngrok binary used when spawning the agent
    pub ngrok_bin: String,

    /// How long a spawned agent may take to expose its API
    pub agent_start_timeout: Duration,
}

impl Default for NgrokOptions {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:4040".to_string(),
            auth_token: None,
            spawn_agent: true,
            ngrok_bin: "ngrok".to_string(),
            agent_start_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Serialize)]
struct CreateTunnelRequest<'a> {
    name: &'a str,
    addr: String,
    proto: &'a str,
    schemes: [&'a str; 1],
}

#[derive(Debug, Deserialize)]
struct TunnelInfo {
    name: String,
    public_url: String,
}

#[derive(Debug, Deserialize)]
struct TunnelList {
    tunnels: Vec<TunnelInfo>,
}

/// Tunnels through a local ngrok agent's HTTP API
pub struct NgrokTunnel {
    client: Client,
    api_url: Url,
    options: NgrokOptions,
    book: TunnelBook,
    agent: tokio::sync::Mutex<Option<Child>>,
}

impl NgrokTunnel {
    pub fn new(options: NgrokOptions) -> Result<Self, ShipyardError> {
        let api_url = Url::parse(&options.api_url)
            .map_err(|e| ShipyardError::ConfigError(format!("invalid ngrok API url: {e}")))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .no_proxy()
            .build()?;
        Ok(Self {
            client,
            api_url,
            options,
            book: TunnelBook::default(),
            agent: tokio::sync::Mutex::new(None),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ShipyardError> {
        self.api_url
            .join(path)
            .map_err(|e| ShipyardError::ConfigError(format!("invalid ngrok API path {path}: {e}")))
    }

    async fn agent_responds(&self) -> bool {
        match self.endpoint("/api/tunnels") {
            Ok(url) => matches!(
                self.client.get(url).send().await,
                Ok(response) if response.status().is_success()
            ),
            Err(_) => false,
        }
    }

    /// Make sure an agent is answering, spawning one if allowed
    async fn ensure_agent(&self) -> Result<(), ShipyardError> {
        if self.agent_responds().await {
            return Ok(());
        }
        if !self.options.spawn_agent {
            return Err(ShipyardError::TunnelUnavailable(format!(
                "no ngrok agent answering on {}",
                self.api_url
            )));
        }

        let mut agent = self.agent.lock().await;
        let running = match agent.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        };

        if !running {
            info!("Starting ngrok agent");
            let mut cmd = Command::new(&self.options.ngrok_bin);
            cmd.args(["start", "--none", "--log", "stdout"])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true);
            if let Some(token) = &self.options.auth_token {
                cmd.env("NGROK_AUTHTOKEN", token.expose_secret());
            }
            let child = cmd.spawn().map_err(|e| {
                ShipyardError::TunnelUnavailable(format!("failed to start ngrok agent: {e}"))
            })?;
            *agent = Some(child);
        }
        drop(agent);

        let deadline = tokio::time::Instant::now() + self.options.agent_start_timeout;
        while tokio::time::Instant::now() < deadline {
            if self.agent_responds().await {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        Err(ShipyardError::TunnelUnavailable(format!(
            "ngrok agent did not answer on {} within {}s",
            self.api_url,
            self.options.agent_start_timeout.as_secs()
        )))
    }

    async fn fetch_tunnel(&self, name: &str) -> Result<Option<TunnelInfo>, ShipyardError> {
        let url = self.endpoint(&format!("/api/tunnels/{name}"))?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ShipyardError::TunnelUnavailable(e.to_string()))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(ShipyardError::TunnelUnavailable(format!(
                "ngrok API answered {}",
                response.status()
            )));
        }
        Ok(Some(response.json().await.map_err(|e| {
            ShipyardError::TunnelUnavailable(format!("unexpected ngrok API response: {e}"))
        })?))
    }

    async fn find_by_url(&self, public_url: &str) -> Result<Option<String>, ShipyardError> {
        let url = self.endpoint("/api/tunnels")?;
        let list: TunnelList = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(list
            .tunnels
            .into_iter()
            .find(|t| t.public_url == public_url)
            .map(|t| t.name))
    }
}

fn tunnel_name(port: u16) -> String {
    format!("shipyard-{port}")
}

fn validate_public_url(raw: &str) -> Result<String, ShipyardError> {
    let url = Url::parse(raw).map_err(|e| {
        ShipyardError::TunnelUnavailable(format!("provider returned an invalid url {raw:?}: {e}"))
    })?;
    if url.scheme() != "https" {
        return Err(ShipyardError::TunnelUnavailable(format!(
            "provider returned a non-TLS url: {raw}"
        )));
    }
    Ok(raw.to_string())
}

#[async_trait]
impl TunnelProvider for NgrokTunnel {
    fn name(&self) -> &'static str {
        "ngrok"
    }

    async fn open(&self, port: u16) -> Result<String, ShipyardError> {
        if let Some(url) = self.book.get(port) {
            debug!("Reusing tunnel for port {}: {}", port, url);
            return Ok(url);
        }

        self.ensure_agent().await?;

        let name = tunnel_name(port);
        let request = CreateTunnelRequest {
            name: &name,
            addr: port.to_string(),
            proto: "http",
            schemes: ["https"],
        };
        let response = self
            .client
            .post(self.endpoint("/api/tunnels")?)
            .json(&request)
            .send()
            .await
            .map_err(|e| ShipyardError::TunnelUnavailable(e.to_string()))?;

        let info: TunnelInfo = if response.status().is_success() {
            response.json().await.map_err(|e| {
                ShipyardError::TunnelUnavailable(format!("unexpected ngrok API response: {e}"))
            })?
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            // A tunnel with our name may survive from before a restart
            match self.fetch_tunnel(&name).await? {
                Some(existing) => existing,
                None => {
                    return Err(ShipyardError::TunnelUnavailable(format!(
                        "ngrok refused tunnel for port {port}: {status} {body}"
                    )))
                }
            }
        };

        let public_url = validate_public_url(&info.public_url)?;
        info!("Tunnel {} created: {} -> localhost:{}", info.name, public_url, port);
        Ok(self.book.record(port, public_url))
    }

    async fn close(&self, public_url: &str) -> Result<(), ShipyardError> {
        let name = match self.book.forget(public_url) {
            Some(port) => tunnel_name(port),
            None => match self.find_by_url(public_url).await {
                Ok(Some(name)) => name,
                Ok(None) => return Ok(()),
                Err(e) => {
                    warn!("Could not look up tunnel {}: {}", public_url, e);
                    return Ok(());
                }
            },
        };

        let url = self.endpoint(&format!("/api/tunnels/{name}"))?;
        match self.client.delete(url).send().await {
            Ok(response)
                if response.status().is_success() || response.status() == StatusCode::NOT_FOUND =>
            {
                info!("Closed tunnel {}", public_url);
            }
            Ok(response) => {
                warn!("ngrok refused to close {}: {}", public_url, response.status());
            }
            Err(e) => {
                // Agent gone or restarted: the tunnel died with it
                warn!("ngrok agent unreachable while closing {}: {}", public_url, e);
            }
        }
        Ok(())
    }

    async fn shutdown(&self) {
        if let Some(mut child) = self.agent.lock().await.take() {
            info!("Stopping ngrok agent");
            if let Err(e) = child.kill().await {
                warn!("Failed to stop ngrok agent: {}", e);
            }
        }
    }
}
