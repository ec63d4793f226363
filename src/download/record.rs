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


//! Download job record
//!
//! A [`Download`] describes one transfer: where to fetch from, where to write
//! to, how to treat an existing destination, and how far it has progressed.
//! Its on-disk form is a [`Sidecar`], a small JSON file named by the job's
//! storage key (`<priority digit><id>`) inside one of the queue directories.

use super::queue::QueueDir;
use crate::error::{FirmfetchError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Scheduling weight; higher values are served first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum Priority {
    #[default]
    None = 1,
    Low = 2,
    Medium = 3,
    High = 4,
    Critical = 5,
}

impl Priority {
    pub fn value(self) -> u8 {
        self as u8
    }

    /// Single character used as the first character of the storage key
    pub fn digit(self) -> char {
        char::from(b'0' + self.value())
    }
}

impl TryFrom<u8> for Priority {
    type Error = FirmfetchError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Priority::None),
            2 => Ok(Priority::Low),
            3 => Ok(Priority::Medium),
            4 => Ok(Priority::High),
            5 => Ok(Priority::Critical),
            other => Err(FirmfetchError::invalid_parameter(format!(
                "priority {} outside 1..=5",
                other
            ))),
        }
    }
}

/// What to do when the destination file already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum ConflictPolicy {
    /// Refuse the job
    #[default]
    NoReplace = 0,
    /// Delete the existing file before the first byte is written
    Replace = 1,
    /// Keep the existing file and append to it
    Merge = 2,
}

impl ConflictPolicy {
    pub fn value(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for ConflictPolicy {
    type Error = FirmfetchError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ConflictPolicy::NoReplace),
            1 => Ok(ConflictPolicy::Replace),
            2 => Ok(ConflictPolicy::Merge),
            other => Err(FirmfetchError::invalid_parameter(format!(
                "conflict policy {} outside 0..=2",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DownloadStatus {
    #[default]
    None,
    Wait,
    Downloading,
    Finished,
    Error,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::None => "none",
            DownloadStatus::Wait => "wait",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Finished => "finished",
            DownloadStatus::Error => "error",
        }
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Latest failure attached to a job
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub code: u16,
    pub message: String,
}

impl From<&FirmfetchError> for JobError {
    fn from(error: &FirmfetchError) -> Self {
        Self {
            code: error.code(),
            message: error.to_string(),
        }
    }
}

/// One download job and its progress
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Download {
    id: u32,
    priority: Priority,
    conflict_policy: ConflictPolicy,
    status: DownloadStatus,
    downloaded: u64,
    file_size: u64,
    source_url: String,
    destination_path: String,
    current_directory: Option<QueueDir>,
    started_at: Option<String>,
    finished_at: Option<String>,
    last_error: Option<JobError>,
    initialized: bool,
}

impl Download {
    /// Zero-valued, uninitialized record
    pub fn new() -> Self {
        Self::default()
    }

    /// New initialized job
    pub fn create(
        url: &str,
        destination: &str,
        priority: Priority,
        conflict_policy: ConflictPolicy,
    ) -> Result<Self> {
        let mut download = Self::new();
        download.initialize(url, destination, priority.value(), conflict_policy.value())?;
        Ok(download)
    }

    /// Validate and set the job parameters from their raw device form
    ///
    /// Strips exactly one leading `http://` or `https://` from `url`. On
    /// failure the error is also attached to the record.
    pub fn initialize(
        &mut self,
        url: &str,
        destination: &str,
        priority: u8,
        conflict_policy: u8,
    ) -> Result<()> {
        match Self::validate(url, destination, priority, conflict_policy) {
            Ok((priority, conflict_policy)) => {
                self.source_url = strip_scheme(url).to_string();
                self.destination_path = destination.to_string();
                self.priority = priority;
                self.conflict_policy = conflict_policy;
                self.initialized = true;
                Ok(())
            }
            Err(e) => {
                self.last_error = Some(JobError::from(&e));
                Err(e)
            }
        }
    }

    fn validate(
        url: &str,
        destination: &str,
        priority: u8,
        conflict_policy: u8,
    ) -> Result<(Priority, ConflictPolicy)> {
        if url.is_empty() {
            return Err(FirmfetchError::invalid_parameter("empty url"));
        }
        if destination.is_empty() {
            return Err(FirmfetchError::invalid_parameter("empty destination"));
        }
        Ok((
            Priority::try_from(priority)?,
            ConflictPolicy::try_from(conflict_policy)?,
        ))
    }

    /// Rebuild a record from its storage key and sidecar
    ///
    /// Progress fields are only trusted for records in `CURRENT`.
    pub(crate) fn from_sidecar(
        priority: Priority,
        id: u32,
        directory: QueueDir,
        sidecar: &Sidecar,
    ) -> Result<Self> {
        let key = storage_key(priority, id);
        let conflict_policy = ConflictPolicy::try_from(sidecar.flag)
            .map_err(|e| FirmfetchError::record_corrupt(&key, e.to_string()))?;

        let mut download = Download {
            id,
            priority,
            conflict_policy,
            status: DownloadStatus::Wait,
            source_url: sidecar.file_url.clone(),
            destination_path: sidecar.destination_file.clone(),
            current_directory: Some(directory),
            initialized: true,
            ..Default::default()
        };

        if directory != QueueDir::Queue {
            download.downloaded = sidecar.downloaded;
            download.file_size = sidecar.file_size;
            download.started_at = non_empty(&sidecar.started);
            download.finished_at = sidecar.finished.as_deref().and_then(non_empty);
            if sidecar.id_status != 0 {
                download.last_error = Some(JobError {
                    code: sidecar.id_status,
                    message: sidecar.message.clone(),
                });
            }
        }

        match directory {
            QueueDir::Finished => download.status = DownloadStatus::Finished,
            QueueDir::Error => download.status = DownloadStatus::Error,
            QueueDir::Queue | QueueDir::Current => {}
        }

        Ok(download)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn set_id(&mut self, id: u32) {
        self.id = id;
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
    }

    pub fn conflict_policy(&self) -> ConflictPolicy {
        self.conflict_policy
    }

    pub fn set_conflict_policy(&mut self, conflict_policy: ConflictPolicy) {
        self.conflict_policy = conflict_policy;
    }

    pub fn status(&self) -> DownloadStatus {
        self.status
    }

    pub fn set_status(&mut self, status: DownloadStatus) {
        self.status = status;
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded
    }

    pub fn set_downloaded(&mut self, downloaded: u64) {
        self.downloaded = downloaded;
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn set_file_size(&mut self, file_size: u64) {
        self.file_size = file_size;
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    pub fn set_source_url<S: Into<String>>(&mut self, url: S) {
        self.source_url = url.into();
    }

    pub fn destination_path(&self) -> &str {
        &self.destination_path
    }

    pub fn set_destination_path<S: Into<String>>(&mut self, path: S) {
        self.destination_path = path.into();
    }

    pub fn current_directory(&self) -> Option<QueueDir> {
        self.current_directory
    }

    pub fn set_current_directory(&mut self, directory: QueueDir) {
        self.current_directory = Some(directory);
    }

    pub fn started_at(&self) -> Option<&str> {
        self.started_at.as_deref()
    }

    pub fn set_started_at<S: Into<String>>(&mut self, at: S) {
        self.started_at = Some(at.into());
    }

    pub fn finished_at(&self) -> Option<&str> {
        self.finished_at.as_deref()
    }

    pub fn set_finished_at<S: Into<String>>(&mut self, at: S) {
        self.finished_at = Some(at.into());
    }

    pub fn last_error(&self) -> Option<&JobError> {
        self.last_error.as_ref()
    }

    pub fn set_last_error(&mut self, error: JobError) {
        self.last_error = Some(error);
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Status queries answer unknown ids with a zero-valued record
    pub fn is_found(&self) -> bool {
        self.id != 0 && self.status != DownloadStatus::None
    }

    pub fn storage_key(&self) -> String {
        storage_key(self.priority, self.id)
    }

    pub fn progress_percentage(&self) -> f64 {
        if self.file_size == 0 {
            0.0
        } else {
            (self.downloaded as f64 / self.file_size as f64) * 100.0
        }
    }
}

/// `<priority digit><id>`, e.g. `412` for a HIGH job with id 12
pub fn storage_key(priority: Priority, id: u32) -> String {
    format!("{}{}", priority.digit(), id)
}

/// Split a storage key back into priority and id
///
/// The first character is the priority, the rest a positive decimal id.
pub fn parse_storage_key(name: &str) -> Option<(Priority, u32)> {
    let mut chars = name.chars();
    let digit = chars.next()?.to_digit(10)?;
    let rest = chars.as_str();
    if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let priority = Priority::try_from(digit as u8).ok()?;
    let id: u32 = rest.parse().ok()?;
    if id == 0 {
        return None;
    }
    Some((priority, id))
}

fn strip_scheme(url: &str) -> &str {
    url.strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
        .unwrap_or(url)
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// On-disk form of a job
///
/// Written in full on every update. Only `fileURL`, `destinationFile` and
/// `flag` are required when reading.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sidecar {
    #[serde(rename = "fileURL")]
    pub file_url: String,
    pub destination_file: String,
    pub flag: u8,
    #[serde(default)]
    pub file_size: u64,
    #[serde(default)]
    pub id_status: u16,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub downloaded: u64,
    #[serde(default)]
    pub started: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished: Option<String>,
}

impl From<&Download> for Sidecar {
    fn from(download: &Download) -> Self {
        let (id_status, message) = match &download.last_error {
            Some(error) => (error.code, error.message.clone()),
            None => (0, String::new()),
        };

        Self {
            file_url: download.source_url.clone(),
            destination_file: download.destination_path.clone(),
            flag: download.conflict_policy.value(),
            file_size: download.file_size,
            id_status,
            message,
            downloaded: download.downloaded,
            started: download.started_at.clone().unwrap_or_default(),
            finished: download.finished_at.clone(),
        }
    }
}
