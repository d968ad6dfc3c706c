use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::arc_config::{ArcToml, CONFIG_FILE};
use crate::init::ARC_DIR;

/// Runtime configuration for arc.
///
/// Resolves the on-disk layout of a workspace and carries the loaded
/// `arc.toml` (with environment overrides already applied).
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub arc_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub log_dir: PathBuf,
    pub resource_root: PathBuf,
    pub config_file: PathBuf,
    pub verbose: bool,
    pub toml: ArcToml,
}

impl Config {
    /// Build the configuration for a project, reading overrides from the process environment.
    pub fn new(project_dir: PathBuf, verbose: bool) -> Result<Self> {
        Self::with_env(project_dir, verbose, |key| std::env::var(key).ok())
    }

    /// Same as [`Config::new`] with an explicit environment lookup.
    pub fn with_env<F>(project_dir: PathBuf, verbose: bool, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let arc_dir = project_dir.join(ARC_DIR);
        let toml = ArcToml::load_or_default(&arc_dir)?.with_env_overrides(lookup)?;

        let resource_root = match &toml.defaults.resource_root {
            Some(root) if root.is_absolute() => root.clone(),
            Some(root) => project_dir.join(root),
            None => arc_dir.clone(),
        };

        Ok(Self {
            runs_dir: arc_dir.join("runs"),
            log_dir: arc_dir.join("logs"),
            config_file: arc_dir.join(CONFIG_FILE),
            project_dir,
            arc_dir,
            resource_root,
            verbose,
            toml,
        })
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.runs_dir).context("Failed to create runs directory")?;
        std::fs::create_dir_all(&self.log_dir).context("Failed to create log directory")?;
        std::fs::create_dir_all(&self.resource_root)
            .context("Failed to create resource directory")?;
        Ok(())
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }
}
