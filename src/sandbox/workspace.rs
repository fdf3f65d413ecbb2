use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tempfile::TempDir;

const WORKSPACE_PREFIX: &str = "submission-";
const WORKSPACE_PERMISSIONS: u32 = 0o700;
const BINARY_NAME: &str = "main";

/// Single-use directory holding one submission's source and build artifacts
///
/// Removed by [`Workspace::close`], or on drop if an error path skips it.
pub(super) struct Workspace {
    dir: TempDir,
}

impl Workspace {
    pub(super) fn create(root: &Path) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(WORKSPACE_PREFIX)
            .tempdir_in(root)
            .with_context(|| format!("Failed to create workspace under {}", root.display()))?;
        fs::set_permissions(
            dir.path(),
            fs::Permissions::from_mode(WORKSPACE_PERMISSIONS),
        )?;
        Ok(Self { dir })
    }

    pub(super) fn path(&self) -> &Path {
        self.dir.path()
    }

    pub(super) fn binary_path(&self) -> PathBuf {
        self.dir.path().join(BINARY_NAME)
    }

    /// Writes the source file, terminated by a newline
    pub(super) fn write_source(&self, file_name: &str, source_code: &str) -> Result<PathBuf> {
        let path = self.dir.path().join(file_name);
        fs::write(&path, format!("{source_code}\n"))
            .with_context(|| format!("Failed to write source to {}", path.display()))?;
        Ok(path)
    }

    pub(super) fn close(self) {
        let path = self.dir.path().to_path_buf();
        if let Err(e) = self.dir.close() {
            log::error!("Failed to remove workspace {}: {e}", path.display());
        }
    }

    /// Removes workspaces left behind by a previous process that died mid-execution
    pub(super) fn sweep_stale(root: &Path) -> Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(root)? {
            let entry = entry?;
            let is_workspace = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(WORKSPACE_PREFIX));
            if is_workspace && entry.file_type()?.is_dir() {
                fs::remove_dir_all(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
