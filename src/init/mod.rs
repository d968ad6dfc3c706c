//! Initialization of arc workspaces.
//!
//! `arc init` creates the `.arc/` directory structure in a project:
//!
//! ```text
//! .arc/
//! ├── arc.toml         # Configuration (written with defaults)
//! ├── runs/            # Checkpoints (<id>.json) and artifacts (<id>/)
//! ├── logs/            # Daily tracing logs
//! ├── teams/           # Resource storage
//! └── leases/          # Resource lease records
//! ```

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::arc_config::{ArcToml, CONFIG_FILE};

/// The name of the arc directory.
pub const ARC_DIR: &str = ".arc";

const SUBDIRS: &[&str] = &["runs", "logs", "teams", "leases"];

/// Result of initializing an arc workspace.
#[derive(Debug)]
pub struct InitResult {
    /// Path to the `.arc` directory
    pub arc_dir: PathBuf,
    /// Whether the directory was newly created (false if it already existed)
    pub created: bool,
    /// Whether a default `arc.toml` was written
    pub wrote_config: bool,
}

/// Initialize an arc workspace in the given directory.
///
/// Existing files are never overwritten; missing parts of the layout are filled in.
pub fn init_project(project_dir: &Path) -> Result<InitResult> {
    let arc_dir = project_dir.join(ARC_DIR);
    let created = !arc_dir.exists();

    std::fs::create_dir_all(&arc_dir)
        .with_context(|| format!("Failed to create directory: {}", arc_dir.display()))?;

    for sub in SUBDIRS {
        let path = arc_dir.join(sub);
        std::fs::create_dir_all(&path)
            .with_context(|| format!("Failed to create directory: {}", path.display()))?;
    }

    let config_path = arc_dir.join(CONFIG_FILE);
    let wrote_config = !config_path.exists();
    if wrote_config {
        ArcToml::default().save(&config_path)?;
    }

    Ok(InitResult {
        arc_dir,
        created,
        wrote_config,
    })
}

/// Check if a project has an `.arc` directory.
pub fn is_initialized(project_dir: &Path) -> bool {
    project_dir.join(ARC_DIR).is_dir()
}

/// Get the path to the arc directory for a project.
pub fn get_arc_dir(project_dir: &Path) -> PathBuf {
    project_dir.join(ARC_DIR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_init_project_creates_arc_directory() {
        let dir = tempdir().unwrap();
        let result = init_project(dir.path()).unwrap();

        assert!(result.arc_dir.is_dir());
        assert!(result.created);
        assert!(result.wrote_config);
        assert_eq!(result.arc_dir, dir.path().join(".arc"));
    }

    #[test]
    fn test_init_project_creates_subdirectories() {
        let dir = tempdir().unwrap();
        init_project(dir.path()).unwrap();

        let arc_dir = dir.path().join(".arc");
        for sub in ["runs", "logs", "teams", "leases"] {
            assert!(arc_dir.join(sub).is_dir(), "missing {}", sub);
        }
    }

    #[test]
    fn test_init_project_writes_parseable_default_config() {
        let dir = tempdir().unwrap();
        init_project(dir.path()).unwrap();

        let loaded = ArcToml::load(&dir.path().join(".arc/arc.toml")).unwrap();
        assert_eq!(loaded.budget.hard_cap_ms, ArcToml::default().budget.hard_cap_ms);
    }

    #[test]
    fn test_init_project_twice_keeps_existing_config() {
        let dir = tempdir().unwrap();
        init_project(dir.path()).unwrap();
        let config_path = dir.path().join(".arc/arc.toml");
        std::fs::write(&config_path, "[budget]\nhard_cap_ms = 60000\n").unwrap();

        let second = init_project(dir.path()).unwrap();
        assert!(!second.created);
        assert!(!second.wrote_config);

        let content = std::fs::read_to_string(&config_path).unwrap();
        assert!(content.contains("60000"));
    }

    #[test]
    fn test_is_initialized() {
        let dir = tempdir().unwrap();
        assert!(!is_initialized(dir.path()));
        init_project(dir.path()).unwrap();
        assert!(is_initialized(dir.path()));
        assert_eq!(get_arc_dir(dir.path()), dir.path().join(".arc"));
    }
}
