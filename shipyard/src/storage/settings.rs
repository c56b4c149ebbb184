//! Settings file management

use std::env;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::deploy::bundle::DeployMode;
use crate::deploy::docker::ContainerOptions;
use crate::deploy::probe::ProbeOptions;
use crate::deploy::process::SubprocessOptions;
use crate::deploy::stager::EntryRules;
use crate::deploy::tunnel::NgrokOptions;
use crate::errors::ShipyardError;
use crate::filesys::file::File;
use crate::logs::LogLevel;
use crate::workers::health;

/// Which tunnel provider publishes deployments
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelKind {
    #[default]
    Local,
    Ngrok,
}

impl FromStr for TunnelKind {
    type Err = ShipyardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(TunnelKind::Local),
            "ngrok" => Ok(TunnelKind::Ngrok),
            other => Err(ShipyardError::ConfigError(format!(
                "unknown tunnel provider: {other}"
            ))),
        }
    }
}

/// Daemon settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// HTTP API bind address
    #[serde(default)]
    pub api: ApiSettings,

    /// Tunnel configuration
    #[serde(default)]
    pub tunnel: TunnelSettings,

    /// Mode used when a request names none
    #[serde(default)]
    pub default_mode: DeployMode,

    /// Readiness timeout in seconds
    #[serde(default = "default_readiness_timeout")]
    pub readiness_timeout_secs: u64,

    /// Readiness poll interval in milliseconds
    #[serde(default = "default_readiness_interval")]
    pub readiness_interval_ms: u64,

    /// Health-check interval in seconds
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,

    /// Restart attempts before a dead deployment is torn down
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Grace period for a unit to exit before it is killed
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,

    /// Subprocess mode
    #[serde(default)]
    pub subprocess: SubprocessSettings,

    /// Containerized mode
    #[serde(default)]
    pub container: ContainerSettings,
}

fn default_readiness_timeout() -> u64 {
    30
}

fn default_readiness_interval() -> u64 {
    1000
}

fn default_health_interval() -> u64 {
    10
}

fn default_max_restarts() -> u32 {
    3
}

fn default_stop_grace() -> u64 {
    10
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            api: ApiSettings::default(),
            tunnel: TunnelSettings::default(),
            default_mode: DeployMode::Subprocess,
            readiness_timeout_secs: default_readiness_timeout(),
            readiness_interval_ms: default_readiness_interval(),
            health_interval_secs: default_health_interval(),
            max_restarts: default_max_restarts(),
            stop_grace_secs: default_stop_grace(),
            subprocess: SubprocessSettings::default(),
            container: ContainerSettings::default(),
        }
    }
}

impl Settings {
    /// Read `file` if it exists, then apply environment overrides
    pub async fn load(file: &File) -> Result<Self, ShipyardError> {
        let settings = if file.exists().await {
            file.read_json::<Settings>().await?
        } else {
            Settings::default()
        };
        settings.with_env_overrides(|key| env::var(key).ok())
    }

    /// Apply overrides from `lookup` (the process environment in production)
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Result<Self, ShipyardError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("SHIPYARD_LOG_LEVEL") {
            self.log_level = v.parse().map_err(ShipyardError::ConfigError)?;
        }
        if let Some(v) = lookup("SHIPYARD_API_HOST") {
            self.api.host = v;
        }
        if let Some(v) = lookup("API_PORT") {
            self.api.port = parse_env("API_PORT", &v)?;
        }
        if let Some(v) = lookup("SHIPYARD_TUNNEL_PROVIDER") {
            self.tunnel.provider = v.parse()?;
        }
        if let Some(v) = lookup("NGROK_AUTH_TOKEN") {
            self.tunnel.auth_token = Some(SecretString::from(v));
        }
        if let Some(v) = lookup("SHIPYARD_NGROK_API_URL") {
            self.tunnel.ngrok_api_url = v;
        }
        if let Some(v) = lookup("SHIPYARD_DEFAULT_MODE") {
            self.default_mode = v.parse().map_err(ShipyardError::ConfigError)?;
        }
        if let Some(v) = lookup("SHIPYARD_READINESS_TIMEOUT_SECS") {
            self.readiness_timeout_secs = parse_env("SHIPYARD_READINESS_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("SHIPYARD_HEALTH_INTERVAL_SECS") {
            self.health_interval_secs = parse_env("SHIPYARD_HEALTH_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = lookup("SHIPYARD_MAX_RESTARTS") {
            self.max_restarts = parse_env("SHIPYARD_MAX_RESTARTS", &v)?;
        }
        if let Some(v) = lookup("SHIPYARD_INSTALL_TIMEOUT_SECS") {
            self.subprocess.install_timeout_secs =
                parse_env("SHIPYARD_INSTALL_TIMEOUT_SECS", &v)?;
        }
        if self.tunnel.provider == TunnelKind::Ngrok && self.tunnel.auth_token.is_none() {
            warn!("ngrok selected without NGROK_AUTH_TOKEN, relying on the agent's own config");
        }
        Ok(self)
    }

    pub fn readiness(&self) -> ProbeOptions {
        ProbeOptions {
            timeout: Duration::from_secs(self.readiness_timeout_secs),
            interval: Duration::from_millis(self.readiness_interval_ms),
            ..Default::default()
        }
    }

    pub fn health(&self) -> health::Options {
        health::Options {
            interval: Duration::from_secs(self.health_interval_secs),
            max_restarts: self.max_restarts,
        }
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> Result<T, ShipyardError> {
    value
        .trim()
        .parse()
        .map_err(|_| ShipyardError::ConfigError(format!("invalid value for {key}: {value}")))
}

/// HTTP API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSettings {
    #[serde(default = "default_api_host")]
    pub host: String,

    #[serde(default = "default_api_port")]
    pub port: u16,
}

fn default_api_host() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    8001
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
        }
    }
}

/// Tunnel settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSettings {
    #[serde(default)]
    pub provider: TunnelKind,

    /// Only ever read from the environment
    #[serde(skip)]
    pub auth_token: Option<SecretString>,

    #[serde(default = "default_ngrok_api_url")]
    pub ngrok_api_url: String,

    /// Start a local ngrok agent when none is listening
    #[serde(default = "default_true")]
    pub spawn_agent: bool,

    /// Host used by the local provider in public URLs
    #[serde(default = "default_local_host")]
    pub local_host: String,
}

fn default_ngrok_api_url() -> String {
    "http://127.0.0.1:4040".to_string()
}

fn default_local_host() -> String {
    "127.0.0.1".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            provider: TunnelKind::Local,
            auth_token: None,
            ngrok_api_url: default_ngrok_api_url(),
            spawn_agent: true,
            local_host: default_local_host(),
        }
    }
}

impl TunnelSettings {
    pub fn ngrok(&self) -> NgrokOptions {
        NgrokOptions {
            api_url: self.ngrok_api_url.clone(),
            auth_token: self.auth_token.clone(),
            spawn_agent: self.spawn_agent,
            ..Default::default()
        }
    }
}

/// Subprocess mode settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubprocessSettings {
    #[serde(default = "default_entry_stems")]
    pub entry_stems: Vec<String>,

    #[serde(default = "default_entry_extension")]
    pub entry_extension: String,

    #[serde(default = "default_manifest_name")]
    pub manifest_name: String,

    #[serde(default = "default_install_command")]
    pub install_command: Vec<String>,

    #[serde(default = "default_install_timeout")]
    pub install_timeout_secs: u64,

    #[serde(default = "default_run_command")]
    pub run_command: Vec<String>,
}

fn default_entry_stems() -> Vec<String> {
    EntryRules::default().preferred_stems
}

fn default_entry_extension() -> String {
    EntryRules::default().extension
}

fn default_manifest_name() -> String {
    SubprocessOptions::default().manifest_name
}

fn default_install_command() -> Vec<String> {
    SubprocessOptions::default().install_command
}

fn default_install_timeout() -> u64 {
    300
}

fn default_run_command() -> Vec<String> {
    SubprocessOptions::default().run_command
}

impl Default for SubprocessSettings {
    fn default() -> Self {
        Self {
            entry_stems: default_entry_stems(),
            entry_extension: default_entry_extension(),
            manifest_name: default_manifest_name(),
            install_command: default_install_command(),
            install_timeout_secs: default_install_timeout(),
            run_command: default_run_command(),
        }
    }
}

impl SubprocessSettings {
    pub fn entry_rules(&self) -> EntryRules {
        EntryRules {
            preferred_stems: self.entry_stems.clone(),
            extension: self.entry_extension.clone(),
        }
    }

    pub fn options(&self) -> SubprocessOptions {
        SubprocessOptions {
            manifest_name: self.manifest_name.clone(),
            install_command: self.install_command.clone(),
            install_timeout: Duration::from_secs(self.install_timeout_secs),
            run_command: self.run_command.clone(),
            ..Default::default()
        }
    }
}

/// Containerized mode settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSettings {
    #[serde(default = "default_docker_bin")]
    pub docker_bin: String,

    #[serde(default = "default_internal_port")]
    pub internal_port: u16,

    #[serde(default = "default_port_env")]
    pub port_env: String,

    #[serde(default = "default_image_prefix")]
    pub image_prefix: String,

    #[serde(default = "default_container_prefix")]
    pub container_prefix: String,

    #[serde(default = "default_base_image")]
    pub base_image: String,
}

fn default_docker_bin() -> String {
    ContainerOptions::default().docker_bin
}

fn default_internal_port() -> u16 {
    ContainerOptions::default().internal_port
}

fn default_port_env() -> String {
    ContainerOptions::default().port_env
}

fn default_image_prefix() -> String {
    ContainerOptions::default().image_prefix
}

fn default_container_prefix() -> String {
    ContainerOptions::default().container_prefix
}

fn default_base_image() -> String {
    ContainerOptions::default().base_image
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            docker_bin: default_docker_bin(),
            internal_port: default_internal_port(),
            port_env: default_port_env(),
            image_prefix: default_image_prefix(),
            container_prefix: default_container_prefix(),
            base_image: default_base_image(),
        }
    }
}

impl ContainerSettings {
    pub fn options(&self, subprocess: &SubprocessSettings) -> ContainerOptions {
        ContainerOptions {
            docker_bin: self.docker_bin.clone(),
            internal_port: self.internal_port,
            port_env: self.port_env.clone(),
            image_prefix: self.image_prefix.clone(),
            container_prefix: self.container_prefix.clone(),
            base_image: self.base_image.clone(),
            manifest_name: subprocess.manifest_name.clone(),
            run_command: subprocess.run_command.clone(),
            ..Default::default()
        }
    }
}
