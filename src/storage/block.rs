// firmfetch - Persistent download queue for telematics devices
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Block storage controller
//!
//! Wraps the storage medium (an SD card on the device, any directory on a
//! host). Callers use device-style absolute paths such as
//! `/DOWNLOADS/QUEUE/41`; they are resolved against the mount root.
//!
//! Every operation takes the storage-wide lock for exactly its own duration.
//! Nothing holds it across a network call.

use crate::error::{FirmfetchError, Result};
use std::path::{Component, Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Suffix of in-flight rewrites; never a valid record name
pub const STAGING_SUFFIX: &str = ".tmp";

#[derive(Debug)]
pub struct StorageController {
    root: PathBuf,
    lock: Mutex<()>,
}

impl StorageController {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            root: root.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Mount the medium: the root must exist (or be creatable) and be a directory
    pub async fn begin(&self) -> Result<()> {
        let _guard = self.lock.lock().await;

        fs::create_dir_all(&self.root).await.map_err(|e| {
            FirmfetchError::StorageUnavailable(format!("{}: {}", self.root.display(), e))
        })?;
        let metadata = fs::metadata(&self.root).await.map_err(|e| {
            FirmfetchError::StorageUnavailable(format!("{}: {}", self.root.display(), e))
        })?;
        if !metadata.is_dir() {
            return Err(FirmfetchError::StorageUnavailable(format!(
                "{} is not a directory",
                self.root.display()
            )));
        }

        Ok(())
    }

    /// Map a device path onto the host filesystem
    ///
    /// Parent-directory components are rejected so a job destination can
    /// never escape the storage root.
    pub fn resolve(&self, device_path: &str) -> Result<PathBuf> {
        let mut resolved = self.root.clone();
        for component in Path::new(device_path).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(FirmfetchError::invalid_parameter(format!(
                        "path escapes storage root: {}",
                        device_path
                    )));
                }
            }
        }
        Ok(resolved)
    }

    pub async fn exists(&self, device_path: &str) -> Result<bool> {
        let path = self.resolve(device_path)?;
        let _guard = self.lock.lock().await;
        Ok(fs::try_exists(&path).await?)
    }

    pub async fn create_dir_all(&self, device_path: &str) -> Result<()> {
        let path = self.resolve(device_path)?;
        let _guard = self.lock.lock().await;
        fs::create_dir_all(&path).await?;
        Ok(())
    }

    /// Create the directory that will contain `device_path`
    pub async fn create_parent_dir(&self, device_path: &str) -> Result<()> {
        let path = self.resolve(device_path)?;
        let _guard = self.lock.lock().await;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    pub async fn read_to_string(&self, device_path: &str) -> Result<String> {
        let path = self.resolve(device_path)?;
        let _guard = self.lock.lock().await;
        Ok(fs::read_to_string(&path).await?)
    }

    /// Replace the file with `contents`, synced to the medium
    ///
    /// The data goes to `<name>.tmp` first and is renamed over the target,
    /// so a power cut leaves either the old or the new contents in place.
    pub async fn write(&self, device_path: &str, contents: &[u8]) -> Result<()> {
        let path = self.resolve(device_path)?;
        let staging = staging_path(&path);
        let _guard = self.lock.lock().await;

        let mut file = fs::File::create(&staging).await?;
        file.write_all(contents).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&staging, &path).await?;
        Ok(())
    }

    /// Append `bytes` to the file, creating it if absent
    pub async fn append(&self, device_path: &str, bytes: &[u8]) -> Result<()> {
        let path = self.resolve(device_path)?;
        let _guard = self.lock.lock().await;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(bytes).await?;
        file.sync_data().await?;
        Ok(())
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from_path = self.resolve(from)?;
        let to_path = self.resolve(to)?;
        let _guard = self.lock.lock().await;
        fs::rename(&from_path, &to_path).await?;
        Ok(())
    }

    pub async fn remove_file(&self, device_path: &str) -> Result<()> {
        let path = self.resolve(device_path)?;
        let _guard = self.lock.lock().await;
        fs::remove_file(&path).await?;
        Ok(())
    }

    /// Length of a regular file, `None` when it does not exist
    pub async fn file_len(&self, device_path: &str) -> Result<Option<u64>> {
        let path = self.resolve(device_path)?;
        let _guard = self.lock.lock().await;
        match fs::metadata(&path).await {
            Ok(metadata) => Ok(Some(metadata.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn truncate(&self, device_path: &str, len: u64) -> Result<()> {
        let path = self.resolve(device_path)?;
        let _guard = self.lock.lock().await;

        let file = OpenOptions::new().write(true).open(&path).await?;
        file.set_len(len).await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Names of the regular files in a directory, sorted
    ///
    /// Leftover staging files from an interrupted rewrite are not listed.
    pub async fn list_files(&self, device_path: &str) -> Result<Vec<String>> {
        let path = self.resolve(device_path)?;
        let _guard = self.lock.lock().await;

        let mut entries = fs::read_dir(&path).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.ends_with(STAGING_SUFFIX) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Sibling name used while a file is being rewritten
fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(STAGING_SUFFIX);
    path.with_file_name(name)
}
