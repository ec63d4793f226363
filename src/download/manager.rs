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


//! Download manager
//!
//! Public API of the queue. A `DownloadManager` is a cheap handle; clones
//! share one queue, one in-memory job index and at most one worker task.
//!
//! Shared state is split into independent lock domains that are never held
//! together:
//! - run state (`running`, stop request, worker client id, join handle)
//! - job index (insertion-ordered `Vec<Download>`)
//! - last manager error
//!
//! Storage operations take the storage-wide lock inside
//! [`StorageController`] on their own.

use super::queue::{DirectoryQueue, QueueDir};
use super::record::Download;
use super::worker::Worker;
use crate::clock::{Clock, SystemClock};
use crate::config::ManagerConfig;
use crate::error::{FirmfetchError, LastError, Result};
use crate::storage::{CounterStore, Database, StorageController};
use crate::transport::{HttpTransport, NetworkLink};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, Instrument};

#[derive(Default)]
struct RunState {
    running: bool,
    stop_requested: bool,
    client_id: Option<u8>,
    handle: Option<JoinHandle<()>>,
}

/// State shared between manager handles and the worker task
pub(crate) struct Shared {
    pub(crate) config: ManagerConfig,
    pub(crate) queue: DirectoryQueue,
    pub(crate) transport: Arc<dyn HttpTransport>,
    pub(crate) link: Arc<dyn NetworkLink>,
    pub(crate) clock: Arc<dyn Clock>,
    initialized: AtomicBool,
    run_state: Mutex<RunState>,
    index: RwLock<Vec<Download>>,
    last_error: Mutex<LastError>,
}

impl Shared {
    /// Log a failure and make it the manager's last error
    pub(crate) async fn record_error(&self, source: &str, err: &FirmfetchError) {
        error!(
            source,
            code = err.code(),
            category = err.category(),
            "{}",
            err
        );
        *self.last_error.lock().await = LastError::from_error(source, err);
    }

    pub(crate) async fn stop_requested(&self) -> bool {
        self.run_state.lock().await.stop_requested
    }

    /// Consume a pending stop request; the worker exits when this returns true
    pub(crate) async fn acknowledge_stop(&self) -> bool {
        let mut state = self.run_state.lock().await;
        if state.stop_requested {
            state.stop_requested = false;
            state.running = false;
            state.client_id = None;
            true
        } else {
            false
        }
    }

    pub(crate) async fn mark_stopped(&self) {
        let mut state = self.run_state.lock().await;
        state.running = false;
        state.stop_requested = false;
        state.client_id = None;
    }

    /// Replace the index entry with the same id; false when absent
    pub(crate) async fn replace_in_index(&self, download: Download) -> bool {
        let mut index = self.index.write().await;
        match index.iter_mut().find(|d| d.id() == download.id()) {
            Some(entry) => {
                *entry = download;
                true
            }
            None => false,
        }
    }
}

/// Persistent priority download queue
#[derive(Clone)]
pub struct DownloadManager {
    shared: Arc<Shared>,
}

impl DownloadManager {
    pub fn new(
        config: ManagerConfig,
        storage: Arc<StorageController>,
        counters: CounterStore,
        transport: Arc<dyn HttpTransport>,
        link: Arc<dyn NetworkLink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let queue = DirectoryQueue::new(storage, counters, Arc::clone(&clock));
        Self {
            shared: Arc::new(Shared {
                config,
                queue,
                transport,
                link,
                clock,
                initialized: AtomicBool::new(false),
                run_state: Mutex::new(RunState::default()),
                index: RwLock::new(Vec::new()),
                last_error: Mutex::new(LastError::default()),
            }),
        }
    }

    /// Build a manager from configuration: storage under `storage_root`,
    /// counters in the SQLite file at `database_path`, system clock
    pub async fn open(
        config: ManagerConfig,
        transport: Arc<dyn HttpTransport>,
        link: Arc<dyn NetworkLink>,
    ) -> Result<Self> {
        config.validate()?;

        let db = Database::new(&config.database_path).await?;
        let counters = CounterStore::new(db.pool().clone(), config.counter_namespace.clone());
        let storage = Arc::new(StorageController::new(config.storage_root.clone()));

        Ok(Self::new(
            config,
            storage,
            counters,
            transport,
            link,
            Arc::new(SystemClock),
        ))
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.shared.config
    }

    /// Direct access to the durable queue (inspection, bench tools)
    pub fn queue(&self) -> &DirectoryQueue {
        &self.shared.queue
    }

    /// Mount storage and create the queue layout
    ///
    /// Idempotent: once successful, later calls return `Ok(())`.
    pub async fn begin(&self) -> Result<()> {
        if self.shared.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }

        let result: Result<()> = async {
            let queue = &self.shared.queue;
            queue.storage().begin().await?;
            queue.ensure_layout().await?;
            let counters = queue.counters().snapshot().await.map_err(|e| {
                FirmfetchError::StorageUnavailable(format!("counter store: {}", e))
            })?;
            info!(
                root = %queue.storage().root().display(),
                next_id = counters.next_id,
                queued = counters.queued_count,
                in_progress = counters.has_download_in_progress,
                "download manager initialized"
            );
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                self.shared.initialized.store(true, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => self.fail("begin", e).await,
        }
    }

    /// Queue a job
    ///
    /// On success the caller's record carries its assigned id, status `Wait`
    /// and directory `QUEUE`. Starts no network activity.
    pub async fn add(&self, download: &mut Download) -> Result<u32> {
        match self.try_add(download).await {
            Ok(id) => Ok(id),
            Err(e) => self.fail("add", e).await,
        }
    }

    async fn try_add(&self, download: &mut Download) -> Result<u32> {
        self.ensure_initialized()?;
        if !download.is_initialized() {
            return Err(FirmfetchError::not_initialized("download record"));
        }

        let queue = &self.shared.queue;
        if queue.destination_conflicts(download).await? {
            return Err(FirmfetchError::AlreadyExists(
                download.destination_path().to_string(),
            ));
        }

        queue.enqueue(download).await?;
        self.shared.index.write().await.push(download.clone());

        Ok(download.id())
    }

    /// Start the worker on logical HTTP client `client_id`
    pub async fn start(&self, client_id: u8) -> Result<()> {
        match self.try_start(client_id).await {
            Ok(()) => Ok(()),
            Err(e) => self.fail("start", e).await,
        }
    }

    async fn try_start(&self, client_id: u8) -> Result<()> {
        self.ensure_initialized()?;

        {
            let mut state = self.shared.run_state.lock().await;
            if state.running {
                return Err(FirmfetchError::AlreadyRunning);
            }
            if client_id > self.shared.config.max_client_id {
                return Err(FirmfetchError::invalid_parameter(format!(
                    "client id {} outside 0..={}",
                    client_id, self.shared.config.max_client_id
                )));
            }
            state.running = true;
            state.stop_requested = false;
            state.client_id = Some(client_id);
        }

        if let Err(e) = self.rebuild_index().await {
            self.shared.mark_stopped().await;
            return Err(e);
        }

        let worker = Worker::new(Arc::clone(&self.shared), client_id);
        let handle = tokio::spawn(
            worker
                .run()
                .instrument(info_span!("download_worker", client_id)),
        );
        self.shared.run_state.lock().await.handle = Some(handle);

        info!(client_id, "download worker started");
        Ok(())
    }

    /// Rebuild the index from `CURRENT` then `QUEUE`
    async fn rebuild_index(&self) -> Result<()> {
        let queue = &self.shared.queue;
        queue.reconcile_counters().await?;

        let mut records = queue.scan(QueueDir::Current).await?;
        records.extend(queue.scan(QueueDir::Queue).await?);

        *self.shared.index.write().await = records;
        Ok(())
    }

    /// Ask the worker to stop after its current step
    ///
    /// The job in progress stays in `CURRENT` and resumes on the next start.
    pub async fn stop(&self) -> Result<()> {
        match self.try_stop().await {
            Ok(()) => Ok(()),
            Err(e) => self.fail("stop", e).await,
        }
    }

    async fn try_stop(&self) -> Result<()> {
        self.ensure_initialized()?;

        let mut state = self.shared.run_state.lock().await;
        if !state.running {
            return Err(FirmfetchError::NotRunning);
        }
        state.stop_requested = true;
        info!("stop requested");
        Ok(())
    }

    /// Wait for the worker task to exit
    pub async fn wait(&self) {
        let handle = self.shared.run_state.lock().await.handle.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "download worker task failed");
            }
        }
    }

    /// Replace the index entry with the same id
    pub async fn update_download(&self, download: Download) -> bool {
        self.shared.replace_in_index(download).await
    }

    /// Snapshot of one job; a zero-valued record when the id is unknown
    pub async fn get_download(&self, id: u32) -> Download {
        self.shared
            .index
            .read()
            .await
            .iter()
            .find(|d| d.id() == id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn list_downloads(&self) -> Vec<Download> {
        self.shared.index.read().await.clone()
    }

    pub async fn is_running(&self) -> bool {
        self.shared.run_state.lock().await.running
    }

    /// HTTP client id of the running worker
    pub async fn client_id(&self) -> Option<u8> {
        self.shared.run_state.lock().await.client_id
    }

    pub async fn get_last_error(&self) -> LastError {
        self.shared.last_error.lock().await.clone()
    }

    pub async fn set_last_error(&self, source: &str, code: u16, message: &str) {
        *self.shared.last_error.lock().await = LastError::new(source, code, message);
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.shared.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(FirmfetchError::not_initialized("download manager (call begin first)"))
        }
    }

    async fn fail<T>(&self, source: &str, err: FirmfetchError) -> Result<T> {
        self.shared.record_error(source, &err).await;
        Err(err)
    }
}
