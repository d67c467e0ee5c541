//! Hot reload bookkeeping for the main shader.
//!
//! Paths are compared by canonical absolute form, case-insensitively. A
//! pending request is consumed exactly once by the render thread whether or
//! not it succeeds. When a poll interval is configured the loaded file's
//! modification time is also checked and an edited file is rebuilt in place.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

#[derive(Debug, thiserror::Error)]
pub enum ReloadError {
    #[error("shader file not found: {}", path.display())]
    NotFound { path: PathBuf },
    #[error("failed to read shader {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Comparison key for shader identity.
pub fn path_key(path: &Path) -> String {
    path.to_string_lossy().to_lowercase()
}

fn canonical(path: &Path) -> Result<PathBuf, ReloadError> {
    if !path.exists() {
        return Err(ReloadError::NotFound {
            path: path.to_path_buf(),
        });
    }
    fs::canonicalize(path).map_err(|source| ReloadError::Read {
        path: path.to_path_buf(),
        source,
    })
}

pub fn read_source(path: &Path) -> Result<String, ReloadError> {
    fs::read_to_string(path).map_err(|source| match source.kind() {
        io::ErrorKind::NotFound => ReloadError::NotFound {
            path: path.to_path_buf(),
        },
        _ => ReloadError::Read {
            path: path.to_path_buf(),
            source,
        },
    })
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

#[derive(Debug, Default)]
pub struct HotReload {
    loaded: Option<PathBuf>,
    loaded_mtime: Option<SystemTime>,
    poll: Option<Duration>,
    last_poll: Option<Instant>,
}

impl HotReload {
    pub fn new(poll: Option<Duration>) -> Self {
        Self {
            poll,
            ..Self::default()
        }
    }

    /// Canonical path of the shader currently on screen.
    pub fn loaded(&self) -> Option<&Path> {
        self.loaded.as_deref()
    }

    /// Resolves a pending request. `Ok(None)` means the path is already
    /// loaded and nothing needs to happen.
    pub fn check_pending(&self, pending: &Path) -> Result<Option<PathBuf>, ReloadError> {
        let resolved = canonical(pending)?;
        let unchanged = self
            .loaded
            .as_deref()
            .map(|loaded| path_key(loaded) == path_key(&resolved))
            .unwrap_or(false);
        Ok((!unchanged).then_some(resolved))
    }

    /// Records a successful load.
    pub fn mark_loaded(&mut self, path: PathBuf) {
        self.loaded_mtime = modified(&path);
        self.loaded = Some(path);
    }

    /// Records a failed rebuild of the loaded file so polling does not retry
    /// the same broken contents every interval.
    pub fn mark_attempted(&mut self, path: &Path) {
        if self.loaded.as_deref() == Some(path) {
            self.loaded_mtime = modified(path);
        }
    }

    /// Returns the loaded path when the poll interval has elapsed and the
    /// file changed on disk since it was last built.
    pub fn poll_modified(&mut self, now: Instant) -> Option<PathBuf> {
        let interval = self.poll?;
        let path = self.loaded.clone()?;
        if let Some(last) = self.last_poll {
            if now.saturating_duration_since(last) < interval {
                return None;
            }
        }
        self.last_poll = Some(now);
        let current = modified(&path)?;
        if Some(current) != self.loaded_mtime {
            tracing::info!(path = %path.display(), "main shader changed on disk");
            Some(path)
        } else {
            None
        }
    }

    /// Forgets the loaded shader so the next request rebuilds it.
    pub fn forget(&mut self) -> Option<PathBuf> {
        self.loaded_mtime = None;
        self.last_poll = None;
        self.loaded.take()
    }
}
