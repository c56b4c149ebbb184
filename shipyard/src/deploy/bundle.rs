//! Project bundles handed over by code generation

use std::io::{Cursor, Read};
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};

use crate::errors::ShipyardError;
use crate::utils::sha256_hash;

/// How a bundle is run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeployMode {
    /// Spawn the entry file directly as a child process
    #[default]
    Subprocess,

    /// Build an image and run it as a container
    #[serde(alias = "docker")]
    Container,
}

impl std::str::FromStr for DeployMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "subprocess" | "process" | "local" => Ok(DeployMode::Subprocess),
            "container" | "docker" => Ok(DeployMode::Container),
            _ => Err(format!("Invalid deployment mode: {}", s)),
        }
    }
}

impl std::fmt::Display for DeployMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeployMode::Subprocess => write!(f, "subprocess"),
            DeployMode::Container => write!(f, "container"),
        }
    }
}

/// One generated file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleFile {
    /// Path relative to the project root, `/`-separated
    pub path: String,

    /// Text content
    pub content: String,
}

impl BundleFile {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }

    /// Whether the file sits directly in the project root
    pub fn is_top_level(&self) -> bool {
        !self.path.trim_start_matches("./").contains('/')
    }

    /// File name without any leading directories
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

/// An ordered list of generated files
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Bundle {
    files: Vec<BundleFile>,
}

impl Bundle {
    pub fn new(files: Vec<BundleFile>) -> Self {
        Self { files }
    }

    /// Build a bundle from a ZIP archive held in memory.
    ///
    /// Directory entries are skipped. Entries that would land outside the
    /// project root, or that are not UTF-8 text, make the bundle invalid.
    pub fn from_zip(bytes: &[u8]) -> Result<Self, ShipyardError> {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
            .map_err(|e| ShipyardError::BundleInvalid(format!("unreadable archive: {e}")))?;

        let mut files = Vec::with_capacity(archive.len());
        for i in 0..archive.len() {
            let mut entry = archive.by_index(i)?;
            if entry.is_dir() {
                continue;
            }

            let path = entry
                .enclosed_name()
                .ok_or_else(|| {
                    ShipyardError::BundleInvalid(format!("unsafe archive path: {}", entry.name()))
                })?
                .to_string_lossy()
                .replace('\\', "/");

            let mut content = String::new();
            entry.read_to_string(&mut content).map_err(|_| {
                ShipyardError::BundleInvalid(format!("{path} is not a UTF-8 text file"))
            })?;

            files.push(BundleFile { path, content });
        }

        Ok(Self { files })
    }

    pub fn files(&self) -> &[BundleFile] {
        &self.files
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Look up a top-level file by exact name
    pub fn top_level(&self, name: &str) -> Option<&BundleFile> {
        self.files
            .iter()
            .find(|f| f.is_top_level() && f.file_name() == name)
    }

    /// Pick the entry file.
    ///
    /// Preferred stems are tried in order (`app.py`, `main.py`, ...); after
    /// that the first top-level file carrying `extension` wins.
    pub fn entry_file(&self, preferred_stems: &[String], extension: &str) -> Option<&BundleFile> {
        preferred_stems
            .iter()
            .find_map(|stem| self.top_level(&format!("{stem}.{extension}")))
            .or_else(|| {
                self.files.iter().find(|f| {
                    f.is_top_level()
                        && Path::new(f.file_name())
                            .extension()
                            .is_some_and(|ext| ext == extension)
                })
            })
    }

    /// Reject paths that could escape the staging directory
    pub fn validate_paths(&self) -> Result<(), ShipyardError> {
        for file in &self.files {
            let escapes = Path::new(&file.path).components().any(|c| {
                matches!(
                    c,
                    Component::ParentDir | Component::RootDir | Component::Prefix(_)
                )
            });
            if file.path.is_empty() || escapes {
                return Err(ShipyardError::BundleInvalid(format!(
                    "invalid file path: {:?}",
                    file.path
                )));
            }
        }
        Ok(())
    }

    /// SHA-256 over every path and content, in order
    pub fn digest(&self) -> String {
        let mut data = Vec::new();
        for file in &self.files {
            data.extend_from_slice(file.path.as_bytes());
            data.push(0);
            data.extend_from_slice(file.content.as_bytes());
            data.push(0);
        }
        sha256_hash(&data)
    }
}
