//! Per-request workspace arena.
//!
//! Every execution gets a freshly created directory whose name embeds the
//! language, the request ID and a random suffix. Creation fails instead of
//! reusing an existing directory, and the directory is removed when the
//! [`Workspace`] is dropped, whichever way the execution ended.

use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use coderunner_core::{Error, Result};

/// Scratch subdirectory exported as `TMPDIR`.
pub const SCRATCH_DIR: &str = "tmp";

/// Exclusively owned execution directory, deleted on drop.
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
}

impl Workspace {
    /// Create a new, uniquely named workspace under `root`.
    ///
    /// When `owner` is set the directory is handed to that uid/gid so a
    /// privilege-dropped child can write into it.
    pub fn create(
        root: &Path,
        language: &str,
        request_id: &str,
        owner: Option<(u32, u32)>,
    ) -> Result<Self> {
        fs::create_dir_all(root).map_err(|e| {
            Error::workspace(format!("cannot create root {}: {}", root.display(), e))
        })?;

        let name = format!(
            "{}-{}-{}",
            sanitize(language),
            sanitize(request_id),
            uuid::Uuid::new_v4().simple()
        );
        let path = root.join(name);

        // create_dir (not create_dir_all): an existing directory is an error.
        fs::create_dir(&path)
            .map_err(|e| Error::workspace(format!("cannot create {}: {}", path.display(), e)))?;
        let workspace = Self { path };

        fs::create_dir(workspace.path.join(SCRATCH_DIR))
            .map_err(|e| Error::workspace(format!("cannot create scratch dir: {}", e)))?;

        let mode = if owner.is_some() { 0o770 } else { 0o700 };
        for dir in [workspace.path.clone(), workspace.path.join(SCRATCH_DIR)] {
            fs::set_permissions(&dir, fs::Permissions::from_mode(mode))
                .map_err(|e| Error::workspace(format!("cannot set permissions: {}", e)))?;
            if let Some((uid, gid)) = owner {
                std::os::unix::fs::chown(&dir, Some(uid), Some(gid))
                    .map_err(|e| Error::workspace(format!("cannot chown workspace: {}", e)))?;
            }
        }

        tracing::debug!(path = %workspace.path.display(), "Workspace provisioned");
        Ok(workspace)
    }

    /// Absolute path of the workspace.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the submitted source as `file_name` inside the workspace.
    pub fn write_source(&self, file_name: &str, source: &str) -> Result<PathBuf> {
        if file_name.contains('/') || file_name.starts_with('.') {
            return Err(Error::workspace(format!("invalid source file name '{}'", file_name)));
        }
        let path = self.path.join(file_name);
        fs::write(&path, source)
            .map_err(|e| Error::workspace(format!("cannot write {}: {}", path.display(), e)))?;
        Ok(path)
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        let removed = match fs::remove_dir_all(&self.path) {
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                // The program may have locked directories with chmod.
                unlock_dirs(&self.path);
                fs::remove_dir_all(&self.path)
            }
            other => other,
        };
        match removed {
            Ok(()) => tracing::debug!(path = %self.path.display(), "Workspace removed"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            // Cleanup failures are logged only; they never reach the caller.
            Err(e) => tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "Workspace cleanup failed"
            ),
        }
    }
}

/// Restore owner `rwx` on every directory below `root`. Symlinks are not
/// followed. Iterative so a deeply nested tree cannot exhaust the stack.
fn unlock_dirs(root: &Path) {
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let _ = fs::set_permissions(&dir, fs::Permissions::from_mode(0o700));
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                pending.push(entry.path());
            }
        }
    }
}

fn sanitize(part: &str) -> String {
    part.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(40)
        .collect()
}
