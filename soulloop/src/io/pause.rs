//! Process-wide pause flag backed by a one-line side file.
//!
//! The file holds exactly `true` or `false`. A missing or unreadable file
//! means "not paused". Every read goes to disk, so a write from another
//! process (e.g. `soulloop pause`) is seen by the next launch decision.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::{Context, Result};
use tracing::{debug, warn};

#[derive(Debug)]
pub struct PauseFlag {
    path: PathBuf,
    lock: RwLock<()>,
}

impl PauseFlag {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: RwLock::new(()),
        }
    }

    pub fn is_paused(&self) -> bool {
        let _guard = self.lock.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        match fs::read_to_string(&self.path) {
            Ok(contents) => contents.trim() == "true",
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => false,
            Err(err) => {
                warn!(
                    path = %self.path.display(),
                    err = %err,
                    "unreadable pause flag, assuming running"
                );
                false
            }
        }
    }

    /// Persist the flag; returns once the new value is durable on disk.
    pub fn set_paused(&self, paused: bool) -> Result<()> {
        let _guard = self.lock.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        debug!(path = %self.path.display(), paused, "writing pause flag");
        write_atomic(&self.path, if paused { "true" } else { "false" })
    }
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("pause flag path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp pause flag {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace pause flag {}", path.display()))?;
    Ok(())
}
