use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::forge_config::ForgeToml;

/// Name of the state directory created under the base directory.
pub const STATE_DIR: &str = ".guideforge";

/// Identifies one independent unit of work.
///
/// Every component receives this explicitly; nothing resolves paths relative
/// to the process working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetConfig {
    pub target_id: String,
    pub base_dir: PathBuf,
}

impl TargetConfig {
    pub fn new(target_id: impl Into<String>, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            target_id: target_id.into(),
            base_dir: base_dir.into(),
        }
    }

    /// Resolve `base_dir` to an absolute path.
    pub fn canonicalized(mut self) -> Result<Self> {
        self.base_dir = self
            .base_dir
            .canonicalize()
            .with_context(|| format!("Failed to resolve base directory {}", self.base_dir.display()))?;
        Ok(self)
    }

    /// Target id reduced to characters that are safe in a directory name.
    pub fn slug(&self) -> String {
        let slug: String = self
            .target_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        if slug.is_empty() || slug.chars().all(|c| c == '.') {
            "_".to_string()
        } else {
            slug
        }
    }

    pub fn layout(&self) -> TargetLayout {
        TargetLayout::new(self)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.base_dir.join(STATE_DIR)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.state_dir().join("logs")
    }

    /// Load `guideforge.toml` from the base directory (defaults if absent).
    pub fn load_settings(&self) -> Result<ForgeToml> {
        ForgeToml::load_or_default(&self.base_dir)
    }
}

/// Every durable path owned by one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetLayout {
    pub root: PathBuf,
    pub lock_file: PathBuf,
    pub working: PathBuf,
    pub checkpoint: PathBuf,
    pub checkpoint_meta: PathBuf,
    pub committed: PathBuf,
    pub history: PathBuf,
    pub runs_dir: PathBuf,
}

impl TargetLayout {
    fn new(config: &TargetConfig) -> Self {
        let root = config.state_dir().join("targets").join(config.slug());
        Self {
            lock_file: root.join("run.lock"),
            working: root.join("guidelines.working.md"),
            checkpoint: root.join("guidelines.checkpoint.md"),
            checkpoint_meta: root.join("checkpoint.json"),
            committed: root.join("guidelines.committed.md"),
            history: root.join("history.json"),
            runs_dir: root.join("runs"),
            root,
        }
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root).context("Failed to create target directory")?;
        std::fs::create_dir_all(&self.runs_dir).context("Failed to create runs directory")?;
        Ok(())
    }

    pub fn exists(&self) -> bool {
        self.root.exists()
    }
}

/// Write `content` to `path` through a sibling temp file and a rename, so a
/// crash never leaves a half-written slot behind.
pub fn write_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, std::process::id()));
    std::fs::write(&tmp, content)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}
