//! Deployment request and response models

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::deploy::bundle::{Bundle, BundleFile, DeployMode};
use crate::deploy::fsm::DeploymentStatus;
use crate::deploy::registry::DeploymentRecord;
use crate::errors::ShipyardError;

/// Deploy a bundle given inline, either as files or as a base64 ZIP
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployRequest {
    /// Falls back to the configured default mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<DeployMode>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<BundleFile>,

    /// Base64-encoded ZIP archive, used when `files` is empty
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive: Option<String>,
}

impl DeployRequest {
    /// Resolve the request into a bundle
    pub fn into_bundle(self) -> Result<Bundle, ShipyardError> {
        match (self.files.is_empty(), self.archive) {
            (false, Some(_)) => Err(ShipyardError::BundleInvalid(
                "request carries both files and an archive".to_string(),
            )),
            (false, None) => Ok(Bundle::new(self.files)),
            (true, Some(archive)) => {
                let bytes = BASE64.decode(archive.trim()).map_err(|e| {
                    ShipyardError::BundleInvalid(format!("archive is not valid base64: {e}"))
                })?;
                Bundle::from_zip(&bytes)
            }
            (true, None) => Err(ShipyardError::BundleInvalid(
                "request carries no files".to_string(),
            )),
        }
    }
}

/// Query for `POST /deployments/zip`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ZipDeployQuery {
    #[serde(default)]
    pub mode: Option<DeployMode>,
}

/// A successful deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployResponse {
    pub id: String,
    pub public_url: String,
    pub port: u16,
    pub status: DeploymentStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UndeployResponse {
    pub id: String,
    pub status: DeploymentStatus,
}

/// Every deployment currently held
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentList {
    pub deployments: Vec<DeploymentRecord>,
    pub total: usize,
}

impl From<Vec<DeploymentRecord>> for DeploymentList {
    fn from(deployments: Vec<DeploymentRecord>) -> Self {
        Self {
            total: deployments.len(),
            deployments,
        }
    }
}

/// Query for `GET /deployments/{id}/logs`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsQuery {
    #[serde(default = "default_tail")]
    pub tail: usize,
}

fn default_tail() -> usize {
    100
}

impl Default for LogsQuery {
    fn default() -> Self {
        Self {
            tail: default_tail(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsResponse {
    pub id: String,
    pub logs: String,
}

/// Body of every error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable code
    pub error: String,

    pub message: String,

    /// Captured output for launch, crash and timeout failures
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<String>,
}
