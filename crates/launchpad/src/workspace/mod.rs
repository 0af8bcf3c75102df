//! Per-run workspace directories
//!
//! Each run gets a fresh directory under the scratch root, keyed by project
//! id. Generated files are written into it, every command runs inside it, and
//! it is deleted when the run fails or the reaper fires.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::{debug, instrument, warn};

pub use crate::workspace::materialize::{MaterializeReport, ensure_manifest, write_files};

mod materialize;

/// Errors that occur during workspace operations
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("failed to allocate workspace at {path}: {source}")]
    Allocate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("path escapes the workspace root: {0}")]
    PathEscape(String),

    #[error("path resolves to the same file as '{0}'")]
    DuplicatePath(String),

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// An exclusively owned run directory
///
/// # Cleanup
///
/// Call [`destroy()`](Self::destroy) once the run is over. Dropping a
/// workspace that was never destroyed removes the directory from a spawned
/// thread, which is best-effort only.
#[derive(Debug)]
pub struct Workspace {
    project_id: String,

    root: PathBuf,

    /// Whether the directory still belongs to us
    allocated: bool,
}

impl Workspace {
    /// Create a fresh workspace for `project_id` under `scratch_root`
    ///
    /// Anything already at the workspace path is removed first.
    #[instrument(skip(scratch_root))]
    pub async fn allocate(
        scratch_root: impl AsRef<Path>,
        project_id: &str,
    ) -> Result<Self, WorkspaceError> {
        let root = scratch_root.as_ref().join(project_id);

        match tokio::fs::remove_dir_all(&root).await {
            Ok(()) => debug!(?root, "removed stale workspace"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(WorkspaceError::Allocate { path: root, source }),
        }

        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|source| WorkspaceError::Allocate {
                path: root.clone(),
                source,
            })?;

        debug!(?root, "workspace allocated");

        Ok(Self {
            project_id: project_id.to_string(),
            root,
            allocated: true,
        })
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Root directory of the workspace
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Host path for a relative file name inside the workspace
    ///
    /// The name is normalized lexically; names that are absolute or climb
    /// above the root are rejected.
    pub fn file_path(&self, name: &str) -> Result<PathBuf, WorkspaceError> {
        let relative = normalize_relative(name)
            .ok_or_else(|| WorkspaceError::PathEscape(name.to_string()))?;
        Ok(self.root.join(relative))
    }

    /// Check if the workspace has not been destroyed yet
    pub fn is_allocated(&self) -> bool {
        self.allocated
    }

    /// Remove the workspace directory
    ///
    /// Never fails: errors are logged and the workspace is considered gone.
    #[instrument(skip(self), fields(project_id = %self.project_id))]
    pub async fn destroy(&mut self) {
        if !self.allocated {
            return;
        }
        self.allocated = false;

        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => debug!(root = ?self.root, "workspace destroyed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(root = ?self.root, error = %e, "failed to remove workspace"),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.allocated {
            warn!(
                project_id = %self.project_id,
                root = %self.root.display(),
                "Workspace dropped without explicit destroy! \
                 Attempting best-effort removal via spawned thread."
            );

            let root = self.root.clone();
            std::thread::spawn(move || {
                if let Err(e) = std::fs::remove_dir_all(&root)
                    && e.kind() != std::io::ErrorKind::NotFound
                {
                    warn!(root = %root.display(), error = %e, "best-effort removal failed");
                }
            });
        }
    }
}

/// Lexically normalize a relative path, refusing to leave its root
///
/// Returns `None` for empty, absolute, or escaping paths. Backslashes are
/// treated as separators so Windows-style names cannot smuggle `..` past us.
pub fn normalize_relative(name: &str) -> Option<PathBuf> {
    let unified = name.replace('\\', "/");
    let mut parts: Vec<&str> = Vec::new();

    for component in Path::new(&unified).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop()?;
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }

    if parts.is_empty() {
        return None;
    }

    Some(parts.iter().collect())
}
