//! Directory operations

use std::path::{Component, Path, PathBuf};

use tokio::fs;

use crate::errors::ShipyardError;
use crate::filesys::file::File;

/// A directory wrapper with path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dir {
    path: PathBuf,
}

impl Dir {
    /// Create a new directory reference
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the directory path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if the directory exists
    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    /// Create the directory (and parents)
    pub async fn create(&self) -> Result<(), ShipyardError> {
        fs::create_dir_all(&self.path).await?;
        Ok(())
    }

    /// Create a fresh, uniquely named child directory.
    ///
    /// Fails rather than reusing a directory that already exists.
    pub async fn create_unique(&self, prefix: &str) -> Result<Dir, ShipyardError> {
        fs::create_dir_all(&self.path).await?;
        let child = self
            .path
            .join(format!("{}-{}", prefix, uuid::Uuid::new_v4().simple()));
        fs::create_dir(&child).await?;
        Ok(Dir::new(child))
    }

    /// Delete the directory and all contents. Missing directories are fine.
    pub async fn delete(&self) -> Result<(), ShipyardError> {
        match fs::remove_dir_all(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Get a file within this directory.
    ///
    /// `relative` must stay inside the directory: absolute paths and `..`
    /// components are rejected.
    pub fn file(&self, relative: &str) -> Result<File, ShipyardError> {
        let rel = Path::new(relative);
        let escapes = rel.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if relative.is_empty() || escapes {
            return Err(ShipyardError::BundleInvalid(format!(
                "path escapes the project directory: {relative:?}"
            )));
        }
        Ok(File::new(self.path.join(rel)))
    }
}
