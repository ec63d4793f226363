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


//! Durable directory queue
//!
//! The directory a sidecar sits in is the job's lifecycle state:
//!
//! ```text
//! /DOWNLOADS/QUEUE     waiting to be selected
//! /DOWNLOADS/CURRENT   being transferred (at most one record)
//! /DOWNLOADS/FINISHED  completed
//! /DOWNLOADS/ERROR     failed
//! ```
//!
//! Legal moves are `QUEUE → CURRENT`, `QUEUE → ERROR`, `CURRENT → FINISHED`
//! and `CURRENT → ERROR`. Every move goes through [`DirectoryQueue::transition`],
//! which writes in a fixed order: rename the sidecar, update the counters,
//! rewrite the sidecar. A power cut between steps leaves at worst a stale
//! counter, which [`DirectoryQueue::pick_next`] and
//! [`DirectoryQueue::reconcile_counters`] repair.
//!
//! Counter reads and the writes derived from them happen under one
//! counter lock, together with the directory change they describe. Lock
//! order is counter lock, then the storage lock.

use super::record::{parse_storage_key, ConflictPolicy, Download, DownloadStatus, Priority, Sidecar};
use crate::clock::Clock;
use crate::error::{FirmfetchError, Result};
use crate::storage::{CounterStore, StorageController};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const DOWNLOADS_ROOT: &str = "/DOWNLOADS";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueDir {
    Queue,
    Current,
    Finished,
    Error,
}

impl QueueDir {
    pub const ALL: [QueueDir; 4] = [
        QueueDir::Queue,
        QueueDir::Current,
        QueueDir::Finished,
        QueueDir::Error,
    ];

    pub fn name(self) -> &'static str {
        match self {
            QueueDir::Queue => "QUEUE",
            QueueDir::Current => "CURRENT",
            QueueDir::Finished => "FINISHED",
            QueueDir::Error => "ERROR",
        }
    }

    /// Device path of the directory, e.g. `/DOWNLOADS/QUEUE`
    pub fn path(self) -> String {
        format!("{}/{}", DOWNLOADS_ROOT, self.name())
    }

    pub fn record_path(self, key: &str) -> String {
        format!("{}/{}/{}", DOWNLOADS_ROOT, self.name(), key)
    }

    pub fn can_move_to(self, to: QueueDir) -> bool {
        matches!(
            (self, to),
            (QueueDir::Queue, QueueDir::Current)
                | (QueueDir::Queue, QueueDir::Error)
                | (QueueDir::Current, QueueDir::Finished)
                | (QueueDir::Current, QueueDir::Error)
        )
    }
}

impl fmt::Display for QueueDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Record chosen by [`DirectoryQueue::pick_next`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub directory: QueueDir,
    pub priority: Priority,
    pub id: u32,
}

impl Selection {
    pub fn key(&self) -> String {
        super::record::storage_key(self.priority, self.id)
    }

    /// Bare record carrying only what the file name tells
    ///
    /// Used to retire a record whose sidecar cannot be loaded.
    pub fn placeholder(&self) -> Download {
        let mut download = Download::new();
        download.set_id(self.id);
        download.set_priority(self.priority);
        download.set_current_directory(self.directory);
        download
    }
}

pub struct DirectoryQueue {
    storage: Arc<StorageController>,
    counters: CounterStore,
    counter_lock: Mutex<()>,
    clock: Arc<dyn Clock>,
}

impl DirectoryQueue {
    pub fn new(storage: Arc<StorageController>, counters: CounterStore, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            counters,
            counter_lock: Mutex::new(()),
            clock,
        }
    }

    pub fn storage(&self) -> &StorageController {
        &self.storage
    }

    pub fn counters(&self) -> &CounterStore {
        &self.counters
    }

    /// Create the four queue directories if absent
    pub async fn ensure_layout(&self) -> Result<()> {
        for dir in QueueDir::ALL {
            self.storage
                .create_dir_all(&dir.path())
                .await
                .map_err(|e| FirmfetchError::InitError(format!("{}: {}", dir.path(), e)))?;
        }
        Ok(())
    }

    /// Choose the next record to work on without moving anything
    ///
    /// `CURRENT` is served first when a download is in progress, otherwise
    /// `QUEUE`. Highest priority wins, ties go to the smallest id. Returns
    /// `Ok(None)` when there is nothing to do; a directory that holds no
    /// valid record resets its counter.
    pub async fn pick_next(&self) -> Result<Option<Selection>> {
        let _counters = self.counter_lock.lock().await;

        let directory = if self.counters.has_download_in_progress().await? {
            QueueDir::Current
        } else if self.counters.queued_count().await? > 0 {
            QueueDir::Queue
        } else {
            return Ok(None);
        };

        let names = self
            .storage
            .list_files(&directory.path())
            .await
            .map_err(|e| FirmfetchError::DirectoryCorrupt(format!("{}: {}", directory, e)))?;

        let best = names
            .iter()
            .filter_map(|name| parse_storage_key(name))
            .max_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));

        match best {
            Some((priority, id)) => Ok(Some(Selection {
                directory,
                priority,
                id,
            })),
            None => {
                warn!(directory = %directory, "no valid record found, resetting counter");
                match directory {
                    QueueDir::Current => self.counters.set_download_in_progress(false).await?,
                    _ => self.counters.set_queued_count(0).await?,
                }
                Ok(None)
            }
        }
    }

    /// Read and validate the sidecar of a selected record
    pub async fn load(&self, selection: &Selection) -> Result<Download> {
        let key = selection.key();
        let path = selection.directory.record_path(&key);

        let contents = self
            .storage
            .read_to_string(&path)
            .await
            .map_err(|e| FirmfetchError::record_corrupt(&key, format!("unreadable: {}", e)))?;
        let sidecar: Sidecar = serde_json::from_str(&contents)
            .map_err(|e| FirmfetchError::record_corrupt(&key, e.to_string()))?;

        let download =
            Download::from_sidecar(selection.priority, selection.id, selection.directory, &sidecar)?;

        if download.source_url().is_empty() {
            return Err(FirmfetchError::record_corrupt(&key, "empty fileURL"));
        }
        if download.destination_path().is_empty() {
            return Err(FirmfetchError::record_corrupt(&key, "empty destinationFile"));
        }
        if download.downloaded() > 0 && download.file_size() == 0 {
            return Err(FirmfetchError::record_corrupt(&key, "progress without file size"));
        }
        if download.downloaded() > download.file_size() {
            return Err(FirmfetchError::record_corrupt(
                &key,
                format!(
                    "downloaded {} exceeds file size {}",
                    download.downloaded(),
                    download.file_size()
                ),
            ));
        }

        Ok(download)
    }

    /// Write a new job into `QUEUE` and count it
    ///
    /// Assigns the job its id; the caller's record is updated in place.
    pub async fn enqueue(&self, download: &mut Download) -> Result<()> {
        let _counters = self.counter_lock.lock().await;

        let id = self.counters.next_id().await?;
        download.set_id(id);
        download.set_current_directory(QueueDir::Queue);
        download.set_status(DownloadStatus::Wait);

        self.write_sidecar(download).await?;
        self.counters.record_enqueued(id).await?;

        info!(id, key = %download.storage_key(), url = %download.source_url(), "download queued");
        Ok(())
    }

    /// Make a selected record ready for transfer
    ///
    /// A record fresh from `QUEUE` gets its destination conflict resolved and
    /// is promoted to `CURRENT`. A record already in `CURRENT` has its
    /// partial file reconciled with the persisted offset.
    pub async fn prepare(&self, download: &mut Download) -> Result<()> {
        match download.current_directory() {
            Some(QueueDir::Queue) => {
                self.resolve_conflict(download).await?;
                self.transition(download, QueueDir::Current).await
            }
            Some(QueueDir::Current) => self.reconcile_partial(download).await,
            other => Err(FirmfetchError::invalid_parameter(format!(
                "cannot prepare record in {:?}",
                other
            ))),
        }
    }

    /// Check the destination against the job's conflict policy
    pub async fn destination_conflicts(&self, download: &Download) -> Result<bool> {
        Ok(download.conflict_policy() == ConflictPolicy::NoReplace
            && self.storage.exists(download.destination_path()).await?)
    }

    async fn resolve_conflict(&self, download: &Download) -> Result<()> {
        let destination = download.destination_path();

        if self.storage.exists(destination).await? {
            match download.conflict_policy() {
                ConflictPolicy::NoReplace => {
                    return Err(FirmfetchError::AlreadyExists(destination.to_string()));
                }
                ConflictPolicy::Replace => {
                    debug!(destination, "removing existing destination");
                    self.storage.remove_file(destination).await?;
                }
                ConflictPolicy::Merge => {}
            }
        } else {
            self.storage.create_parent_dir(destination).await?;
        }

        Ok(())
    }

    /// Bring the partial destination file in line with `downloaded`
    async fn reconcile_partial(&self, download: &mut Download) -> Result<()> {
        if download.conflict_policy() == ConflictPolicy::Merge {
            return Ok(());
        }

        let destination = download.destination_path().to_string();
        let persisted = download.downloaded();
        let on_disk = self.storage.file_len(&destination).await?;

        match on_disk {
            Some(len) if len > persisted => {
                warn!(id = download.id(), len, persisted, "truncating unpersisted bytes");
                self.storage.truncate(&destination, persisted).await?;
            }
            Some(len) if len < persisted => {
                warn!(id = download.id(), len, persisted, "partial file shorter than recorded");
                download.set_downloaded(len);
                self.persist_progress(download).await?;
            }
            None if persisted > 0 => {
                warn!(id = download.id(), persisted, "partial file missing, restarting");
                download.set_downloaded(0);
                self.storage.create_parent_dir(&destination).await?;
                self.persist_progress(download).await?;
            }
            None => self.storage.create_parent_dir(&destination).await?,
            _ => {}
        }

        Ok(())
    }

    /// Move a record between queue directories
    ///
    /// Order: rename the sidecar, update the counters, rewrite the sidecar.
    /// `download.current_directory()` follows the file as soon as it moved.
    pub async fn transition(&self, download: &mut Download, to: QueueDir) -> Result<()> {
        let from = download
            .current_directory()
            .ok_or_else(|| FirmfetchError::invalid_parameter("record has no directory"))?;
        if !from.can_move_to(to) {
            return Err(FirmfetchError::invalid_parameter(format!(
                "illegal transition {} -> {}",
                from, to
            )));
        }

        let key = download.storage_key();
        let guard = self.counter_lock.lock().await;
        self.storage
            .rename(&from.record_path(&key), &to.record_path(&key))
            .await
            .map_err(|e| FirmfetchError::persist(format!("move {} {} -> {}", key, from, to), e))?;
        download.set_current_directory(to);

        match (from, to) {
            (QueueDir::Queue, QueueDir::Current) => self.counters.record_promoted().await?,
            (QueueDir::Queue, _) => self.counters.record_dequeued().await?,
            (QueueDir::Current, _) => self.counters.set_download_in_progress(false).await?,
            _ => {}
        }
        drop(guard);

        if matches!(to, QueueDir::Finished | QueueDir::Error) {
            download.set_finished_at(self.clock.now_string());
        }

        self.write_sidecar(download).await?;
        debug!(id = download.id(), %from, %to, "record moved");
        Ok(())
    }

    pub async fn retire_finished(&self, download: &mut Download) -> Result<()> {
        self.transition(download, QueueDir::Finished).await?;
        info!(id = download.id(), bytes = download.downloaded(), "download finished");
        Ok(())
    }

    /// Move a failed record to `ERROR`
    ///
    /// A record retired from `CURRENT` also loses its partial destination
    /// file; a missing file is not an error.
    pub async fn retire_error(&self, download: &mut Download) -> Result<()> {
        let from = download.current_directory();
        self.transition(download, QueueDir::Error).await?;

        if from == Some(QueueDir::Current) {
            let destination = download.destination_path();
            if !destination.is_empty() && self.storage.exists(destination).await? {
                self.storage.remove_file(destination).await?;
            }
        }

        warn!(
            id = download.id(),
            code = download.last_error().map(|e| e.code).unwrap_or_default(),
            "download moved to ERROR"
        );
        Ok(())
    }

    /// Rewrite the sidecar of the record in `CURRENT`
    pub async fn persist_progress(&self, download: &Download) -> Result<()> {
        self.write_sidecar(download).await
    }

    pub async fn append_bytes(&self, download: &Download, bytes: &[u8]) -> Result<()> {
        self.storage
            .append(download.destination_path(), bytes)
            .await
            .map_err(|e| FirmfetchError::persist(download.destination_path(), e))
    }

    /// Load every valid record of one directory, ordered by id
    ///
    /// Unparseable names and corrupt sidecars are skipped; the worker routes
    /// them to `ERROR` when it selects them.
    pub async fn scan(&self, directory: QueueDir) -> Result<Vec<Download>> {
        let names = self
            .storage
            .list_files(&directory.path())
            .await
            .map_err(|e| FirmfetchError::DirectoryCorrupt(format!("{}: {}", directory, e)))?;

        let mut records = Vec::new();
        for name in names {
            let Some((priority, id)) = parse_storage_key(&name) else {
                continue;
            };
            let selection = Selection {
                directory,
                priority,
                id,
            };
            match self.load(&selection).await {
                Ok(download) => records.push(download),
                Err(e) => warn!(%directory, key = %name, error = %e, "skipping record"),
            }
        }
        records.sort_by_key(|d| d.id());
        Ok(records)
    }

    /// Recompute `queuedCount` and `hasDownload` from the directories
    pub async fn reconcile_counters(&self) -> Result<()> {
        let _counters = self.counter_lock.lock().await;

        let queued = self.count_records(QueueDir::Queue).await?;
        let in_progress = self.count_records(QueueDir::Current).await? > 0;
        let counters = self.counters.snapshot().await?;

        if counters.queued_count != queued {
            warn!(stored = counters.queued_count, actual = queued, "queuedCount out of sync");
            self.counters.set_queued_count(queued).await?;
        }
        if counters.has_download_in_progress != in_progress {
            warn!(
                stored = counters.has_download_in_progress,
                actual = in_progress,
                "hasDownload out of sync"
            );
            self.counters.set_download_in_progress(in_progress).await?;
        }
        Ok(())
    }

    async fn count_records(&self, directory: QueueDir) -> Result<u32> {
        let names = self
            .storage
            .list_files(&directory.path())
            .await
            .map_err(|e| FirmfetchError::DirectoryCorrupt(format!("{}: {}", directory, e)))?;
        Ok(names.iter().filter(|n| parse_storage_key(n).is_some()).count() as u32)
    }

    async fn write_sidecar(&self, download: &Download) -> Result<()> {
        let directory = download
            .current_directory()
            .ok_or_else(|| FirmfetchError::invalid_parameter("record has no directory"))?;
        let key = download.storage_key();
        let json = serde_json::to_vec(&Sidecar::from(download))?;

        self.storage
            .write(&directory.record_path(&key), &json)
            .await
            .map_err(|e| FirmfetchError::persist(format!("sidecar {}", key), e))
    }
}
