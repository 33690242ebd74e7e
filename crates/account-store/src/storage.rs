//! Managed file storage
//!
//! One directory holds the authoritative data file for every account known to
//! the backing store, named `<device_account>.xml`. Files arrive either by
//! import (copied from a watched folder) or by materialization from stored
//! credentials when an account is checked out without one.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::credential::{DeviceCredential, render_device_file};
use crate::error::{Error, Result};

/// Directory of account data files.
#[derive(Debug, Clone)]
pub struct ManagedStorage {
    root: PathBuf,
}

impl ManagedStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the data file for a device account.
    ///
    /// Path separators and other characters unsafe in file names are
    /// replaced so a hostile account name cannot escape the storage root.
    pub fn path_for(&self, device_account: &str) -> PathBuf {
        let name: String = device_account
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let name = name.trim_start_matches('.');
        self.root.join(format!("{name}.xml"))
    }

    /// Copy an external data file into storage, replacing any previous copy.
    pub async fn import_file(&self, source: &Path, device_account: &str) -> Result<PathBuf> {
        let target = self.path_for(device_account);
        if source == target {
            return Ok(target);
        }
        let contents = tokio::fs::read(source)
            .await
            .map_err(|e| Error::Io(format!("reading {}: {e}", source.display())))?;
        write_atomic(&target, &contents).await?;
        debug!(source = %source.display(), target = %target.display(), "imported data file");
        Ok(target)
    }

    /// Make sure the data file for `credential` exists, writing a minimal one
    /// from the stored credentials if it does not.
    ///
    /// Returns the file path and whether it had to be created.
    pub async fn ensure_file(&self, credential: &DeviceCredential) -> Result<(PathBuf, bool)> {
        let target = self.path_for(&credential.device_account);
        let exists = tokio::fs::try_exists(&target)
            .await
            .map_err(|e| Error::Io(format!("checking {}: {e}", target.display())))?;
        if exists {
            return Ok((target, false));
        }
        write_atomic(&target, render_device_file(credential).as_bytes()).await?;
        debug!(target = %target.display(), "materialized data file from stored credentials");
        Ok((target, true))
    }
}

/// Write a data file atomically (temp file in the same directory + rename).
async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("storage path has no parent directory".into()))?;
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| Error::Io(format!("creating {}: {e}", dir.display())))?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("account.xml");
    let tmp_path = dir.join(format!(".{file_name}.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, contents)
        .await
        .map_err(|e| Error::Io(format!("writing temp data file: {e}")))?;

    // Data files carry device passwords
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting data file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp data file: {e}")))?;
    Ok(())
}
