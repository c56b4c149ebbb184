//! Materializes bundles into isolated working directories

use tracing::{debug, info, warn};

use crate::deploy::bundle::Bundle;
use crate::errors::ShipyardError;
use crate::filesys::dir::Dir;

/// How the stager recognizes an entry file
#[derive(Debug, Clone)]
pub struct EntryRules {
    /// Stems tried in order before falling back to any source file
    pub preferred_stems: Vec<String>,

    /// Extension of runnable source files, without the dot
    pub extension: String,
}

impl Default for EntryRules {
    fn default() -> Self {
        Self {
            preferred_stems: vec!["app".to_string(), "main".to_string()],
            extension: "py".to_string(),
        }
    }
}

/// A bundle written to disk
#[derive(Debug, Clone)]
pub struct StagedProject {
    /// Exclusively owned working directory
    pub dir: Dir,

    /// Entry file name, relative to `dir`
    pub entry: String,
}

/// Writes bundles below a shared staging root
#[derive(Debug, Clone)]
pub struct Stager {
    root: Dir,
    rules: EntryRules,
}

impl Stager {
    pub fn new(root: Dir, rules: EntryRules) -> Self {
        Self { root, rules }
    }

    /// Write every file of `bundle` into a fresh directory.
    ///
    /// The bundle is validated before anything touches the disk, so an
    /// invalid bundle never leaves a directory behind. If writing fails
    /// halfway, the partial directory is removed before the error returns.
    pub async fn stage(&self, bundle: &Bundle, prefix: &str) -> Result<StagedProject, ShipyardError> {
        if bundle.is_empty() {
            return Err(ShipyardError::BundleInvalid("bundle contains no files".to_string()));
        }
        bundle.validate_paths()?;

        let entry = bundle
            .entry_file(&self.rules.preferred_stems, &self.rules.extension)
            .ok_or_else(|| {
                ShipyardError::BundleInvalid(format!(
                    "no runnable .{} entry file at the top level",
                    self.rules.extension
                ))
            })?
            .file_name()
            .to_string();

        let dir = self.root.create_unique(prefix).await?;
        if let Err(e) = write_files(&dir, bundle).await {
            if let Err(cleanup) = dir.delete().await {
                warn!("Failed to remove partial staging dir {}: {}", dir.path().display(), cleanup);
            }
            return Err(e);
        }

        info!(
            "Staged {} files into {} (entry: {})",
            bundle.files().len(),
            dir.path().display(),
            entry
        );
        Ok(StagedProject { dir, entry })
    }
}

async fn write_files(dir: &Dir, bundle: &Bundle) -> Result<(), ShipyardError> {
    for file in bundle.files() {
        let target = dir.file(&file.path)?;
        target.write_string(&file.content).await?;
        debug!("Created file: {}", target.path().display());
    }
    Ok(())
}
