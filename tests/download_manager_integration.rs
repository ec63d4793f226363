//! Integration tests for DownloadManager
//!
//! Drives the full queue lifecycle (add, promote, transfer, resume, retire)
//! against a scripted in-process HTTP transport and a real directory tree in
//! a temp dir.

use async_trait::async_trait;
use firmfetch::clock::SystemClock;
use firmfetch::config::ManagerConfig;
use firmfetch::download::{ConflictPolicy, Download, DownloadManager, DownloadStatus, Priority};
use firmfetch::error::{FirmfetchError, Result};
use firmfetch::storage::{CounterStore, Database, StorageController};
use firmfetch::transport::{HttpRequest, HttpResponse, HttpTransport, SharedLink};
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::{sleep, timeout, Instant};

const HOST: &str = "fw.example.com";

// ============================================================================
// Scripted transport
// ============================================================================

#[derive(Default)]
struct ServerState {
    files: Mutex<HashMap<String, Vec<u8>>>,
    requests: Mutex<Vec<HttpRequest>>,
    /// While set, reads return no data
    paused: AtomicBool,
    /// Answer ranged requests with a full 200 response
    ignore_range: AtomicBool,
    /// Drop the link once the body reaches this file offset (one shot)
    drop_link_at: Mutex<Option<u64>>,
}

struct FakeServer {
    state: Arc<ServerState>,
    link: Arc<SharedLink>,
}

impl FakeServer {
    fn serve(&self, resource: &str, body: Vec<u8>) {
        self.state
            .files
            .lock()
            .unwrap()
            .insert(resource.to_string(), body);
    }

    fn requests(&self) -> Vec<HttpRequest> {
        self.state.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpTransport for FakeServer {
    async fn get(&self, _client_id: u8, request: &HttpRequest) -> Result<Box<dyn HttpResponse>> {
        self.state.requests.lock().unwrap().push(request.clone());

        let file = self
            .state
            .files
            .lock()
            .unwrap()
            .get(&request.resource)
            .cloned();
        let Some(file) = file else {
            return Ok(Box::new(FakeResponse::empty(404, Arc::clone(&self.state), Arc::clone(&self.link))));
        };

        let honour_range = !self.state.ignore_range.load(Ordering::SeqCst);
        let (status, start) = match request.range {
            Some(range) if honour_range => (206, range.start.min(file.len() as u64)),
            _ => (200, 0),
        };

        Ok(Box::new(FakeResponse {
            status,
            body: file[start as usize..].to_vec(),
            offset: start,
            pos: 0,
            connected: true,
            state: Arc::clone(&self.state),
            link: Arc::clone(&self.link),
        }))
    }
}

struct FakeResponse {
    status: u16,
    body: Vec<u8>,
    /// File offset of `body[0]`
    offset: u64,
    pos: usize,
    connected: bool,
    state: Arc<ServerState>,
    link: Arc<SharedLink>,
}

impl FakeResponse {
    fn empty(status: u16, state: Arc<ServerState>, link: Arc<SharedLink>) -> Self {
        Self {
            status,
            body: Vec::new(),
            offset: 0,
            pos: 0,
            connected: true,
            state,
            link,
        }
    }
}

#[async_trait]
impl HttpResponse for FakeResponse {
    fn status(&self) -> u16 {
        self.status
    }

    fn headers(&self) -> Vec<(String, String)> {
        vec![("content-length".to_string(), self.body.len().to_string())]
    }

    fn content_length(&self) -> Option<u64> {
        Some(self.body.len() as u64)
    }

    async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.state.paused.load(Ordering::SeqCst) {
            return Ok(0);
        }

        let position = self.offset + self.pos as u64;
        let mut limit = buf.len().min(self.body.len() - self.pos);

        {
            let mut drop_at = self.state.drop_link_at.lock().unwrap();
            if let Some(at) = *drop_at {
                if position >= at {
                    *drop_at = None;
                    self.link.set_attached(false);
                    self.connected = false;
                    return Err(FirmfetchError::InterruptedTransfer("link dropped".to_string()));
                }
                limit = limit.min((at - position) as usize);
            }
        }

        buf[..limit].copy_from_slice(&self.body[self.pos..self.pos + limit]);
        self.pos += limit;
        if self.pos == self.body.len() {
            self.connected = false;
        }
        Ok(limit)
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    dir: TempDir,
    db: Database,
    server: Arc<FakeServer>,
    link: Arc<SharedLink>,
    manager: DownloadManager,
}

impl Harness {
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new_in_memory().await.unwrap();
        let link = Arc::new(SharedLink::new(true));
        let server = Arc::new(FakeServer {
            state: Arc::new(ServerState::default()),
            link: Arc::clone(&link),
        });
        let manager = Self::build_manager(&dir, &db, &server, &link);
        manager.begin().await.unwrap();

        Self {
            dir,
            db,
            server,
            link,
            manager,
        }
    }

    fn build_manager(
        dir: &TempDir,
        db: &Database,
        server: &Arc<FakeServer>,
        link: &Arc<SharedLink>,
    ) -> DownloadManager {
        let config = ManagerConfig {
            storage_root: dir.path().to_path_buf(),
            poll_interval_ms: 10,
            read_retry_delay_ms: 5,
            chunk_size: 256,
            ..Default::default()
        };
        DownloadManager::new(
            config,
            Arc::new(StorageController::new(dir.path())),
            CounterStore::new(db.pool().clone(), "downloadManager"),
            Arc::clone(server) as Arc<dyn HttpTransport>,
            Arc::clone(link) as Arc<dyn firmfetch::transport::NetworkLink>,
            Arc::new(SystemClock),
        )
    }

    /// Fresh manager over the same storage and counters, as after a reboot
    async fn reboot(&mut self) {
        self.manager = Self::build_manager(&self.dir, &self.db, &self.server, &self.link);
        self.manager.begin().await.unwrap();
    }

    fn path(&self, device_path: &str) -> PathBuf {
        self.dir.path().join(device_path.trim_start_matches('/'))
    }

    fn sidecar(&self, device_path: &str) -> serde_json::Value {
        let contents = std::fs::read_to_string(self.path(device_path)).unwrap();
        serde_json::from_str(&contents).unwrap()
    }

    fn dir_entries(&self, device_path: &str) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.path(device_path))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    async fn wait_for_status(&self, id: u32, status: DownloadStatus) {
        let manager = self.manager.clone();
        wait_until(&format!("job {id} to reach {status}"), move || {
            let manager = manager.clone();
            async move { manager.get_download(id).await.status() == status }
        })
        .await;
    }
}

async fn wait_until<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition().await {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(10)).await;
    }
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn job(resource: &str, destination: &str, priority: Priority, policy: ConflictPolicy) -> Download {
    Download::create(&format!("https://{HOST}{resource}"), destination, priority, policy).unwrap()
}

async fn stop_and_wait(manager: &DownloadManager) {
    manager.stop().await.unwrap();
    timeout(Duration::from_secs(5), manager.wait())
        .await
        .expect("worker did not stop");
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_full_download_lifecycle() {
    let h = Harness::new().await;
    let body = payload(2000);
    h.server.serve("/v2/image.bin", body.clone());
    h.server.state.paused.store(true, Ordering::SeqCst);

    let mut download = job("/v2/image.bin", "/fw/image.bin", Priority::High, ConflictPolicy::NoReplace);
    let id = h.manager.add(&mut download).await.unwrap();

    assert_eq!(h.dir_entries("/DOWNLOADS/QUEUE"), vec![format!("4{id}")]);
    let counters = h.manager.queue().counters().snapshot().await.unwrap();
    assert_eq!(counters.queued_count, 1);
    assert_eq!(counters.next_id, id + 1);

    h.manager.start(0).await.unwrap();

    // Promoted, but no bytes flow while the server is paused
    let queue_counters = h.manager.clone();
    wait_until("promotion", move || {
        let manager = queue_counters.clone();
        async move {
            let counters = manager.queue().counters().snapshot().await.unwrap();
            counters.has_download_in_progress && counters.queued_count == 0
        }
    })
    .await;
    assert!(h.path(&format!("/DOWNLOADS/CURRENT/4{id}")).is_file());
    assert!(h.dir_entries("/DOWNLOADS/QUEUE").is_empty());

    h.server.state.paused.store(false, Ordering::SeqCst);
    h.wait_for_status(id, DownloadStatus::Finished).await;
    stop_and_wait(&h.manager).await;

    let finished = h.manager.get_download(id).await;
    assert_eq!(finished.downloaded(), 2000);
    assert_eq!(finished.file_size(), 2000);
    assert!(finished.started_at().is_some());

    assert_eq!(std::fs::read(h.path("/fw/image.bin")).unwrap(), body);
    assert!(h.dir_entries("/DOWNLOADS/CURRENT").is_empty());
    let sidecar = h.sidecar(&format!("/DOWNLOADS/FINISHED/4{id}"));
    assert_eq!(sidecar["downloaded"], 2000);
    assert_eq!(sidecar["fileURL"], format!("{HOST}/v2/image.bin"));
    assert!(sidecar["finished"].is_string());

    let counters = h.manager.queue().counters().snapshot().await.unwrap();
    assert!(!counters.has_download_in_progress);
    assert_eq!(counters.queued_count, 0);

    let requests = h.server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].host, HOST);
    assert_eq!(requests[0].range, None);
}

#[tokio::test]
async fn test_resume_after_reboot_sends_range() {
    let mut h = Harness::new().await;
    let body = payload(2000);
    h.server.serve("/v2/image.bin", body.clone());

    // State left behind by a power cut at byte 500
    let mut download = job("/v2/image.bin", "/fw/image.bin", Priority::Medium, ConflictPolicy::NoReplace);
    let id = h.manager.add(&mut download).await.unwrap();
    let queue = h.manager.queue();
    queue.prepare(&mut download).await.unwrap();
    download.set_file_size(2000);
    download.set_downloaded(500);
    download.set_started_at("2025-03-01 10:00:00");
    queue.persist_progress(&download).await.unwrap();
    queue.append_bytes(&download, &body[..500]).await.unwrap();

    h.reboot().await;
    h.manager.start(1).await.unwrap();
    h.wait_for_status(id, DownloadStatus::Finished).await;
    stop_and_wait(&h.manager).await;

    let requests = h.server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].range.map(|r| r.header_value()),
        Some("bytes=500-2000".to_string())
    );

    assert_eq!(std::fs::read(h.path("/fw/image.bin")).unwrap(), body);
    let sidecar = h.sidecar(&format!("/DOWNLOADS/FINISHED/3{id}"));
    assert_eq!(sidecar["downloaded"], 2000);
    assert_eq!(sidecar["started"], "2025-03-01 10:00:00");
}

#[tokio::test]
async fn test_link_drop_keeps_job_in_current_and_resumes() {
    let h = Harness::new().await;
    let body = payload(2000);
    h.server.serve("/v2/image.bin", body.clone());
    *h.server.state.drop_link_at.lock().unwrap() = Some(700);

    let mut download = job("/v2/image.bin", "/fw/image.bin", Priority::High, ConflictPolicy::Replace);
    let id = h.manager.add(&mut download).await.unwrap();
    h.manager.start(0).await.unwrap();

    let link = Arc::clone(&h.link);
    wait_until("link drop", move || {
        let link = Arc::clone(&link);
        async move { !firmfetch::transport::NetworkLink::is_attached(&*link) }
    })
    .await;
    // Let the worker settle into its idle loop
    sleep(Duration::from_millis(50)).await;

    assert!(h.manager.is_running().await);
    assert!(h.dir_entries("/DOWNLOADS/ERROR").is_empty());
    let sidecar = h.sidecar(&format!("/DOWNLOADS/CURRENT/4{id}"));
    assert_eq!(sidecar["downloaded"], 700);
    assert_eq!(sidecar["fileSize"], 2000);
    let interrupted = h.manager.get_download(id).await;
    assert_eq!(interrupted.status(), DownloadStatus::Downloading);
    assert_eq!(interrupted.downloaded(), 700);

    h.link.set_attached(true);
    h.wait_for_status(id, DownloadStatus::Finished).await;
    stop_and_wait(&h.manager).await;

    assert_eq!(std::fs::read(h.path("/fw/image.bin")).unwrap(), body);
    let requests = h.server.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].range.map(|r| r.start), Some(700));
}

#[tokio::test]
async fn test_stop_mid_transfer_leaves_job_resumable() {
    let mut h = Harness::new().await;
    h.server.serve("/v2/image.bin", payload(2000));
    h.server.state.paused.store(true, Ordering::SeqCst);

    let mut download = job("/v2/image.bin", "/fw/image.bin", Priority::Low, ConflictPolicy::NoReplace);
    let id = h.manager.add(&mut download).await.unwrap();
    h.manager.start(0).await.unwrap();

    let server = Arc::clone(&h.server);
    wait_until("first request", move || {
        let server = Arc::clone(&server);
        async move { !server.requests().is_empty() }
    })
    .await;

    stop_and_wait(&h.manager).await;
    assert!(!h.manager.is_running().await);
    assert!(matches!(h.manager.stop().await, Err(FirmfetchError::NotRunning)));

    assert_eq!(h.dir_entries("/DOWNLOADS/CURRENT"), vec![format!("2{id}")]);
    assert_eq!(h.manager.get_download(id).await.status(), DownloadStatus::Wait);

    // The job picks up again after a restart
    h.server.state.paused.store(false, Ordering::SeqCst);
    h.reboot().await;
    h.manager.start(0).await.unwrap();
    h.wait_for_status(id, DownloadStatus::Finished).await;
    stop_and_wait(&h.manager).await;
}

#[tokio::test]
async fn test_failed_job_goes_to_error_and_queue_continues() {
    let h = Harness::new().await;
    h.server.serve("/v2/ok.bin", payload(600));

    let mut missing = job("/v2/missing.bin", "/fw/missing.bin", Priority::Critical, ConflictPolicy::NoReplace);
    let mut present = job("/v2/ok.bin", "/fw/ok.bin", Priority::Low, ConflictPolicy::NoReplace);
    let missing_id = h.manager.add(&mut missing).await.unwrap();
    let present_id = h.manager.add(&mut present).await.unwrap();

    h.manager.start(0).await.unwrap();
    h.wait_for_status(present_id, DownloadStatus::Finished).await;
    stop_and_wait(&h.manager).await;

    let failed = h.manager.get_download(missing_id).await;
    assert_eq!(failed.status(), DownloadStatus::Error);
    assert_eq!(failed.last_error().map(|e| e.code), Some(0x123));

    let sidecar = h.sidecar(&format!("/DOWNLOADS/ERROR/5{missing_id}"));
    assert_eq!(sidecar["idStatus"], 0x123);
    assert!(!h.path("/fw/missing.bin").exists());

    // The critical job was tried first
    let resources: Vec<String> = h.server.requests().into_iter().map(|r| r.resource).collect();
    assert_eq!(resources, vec!["/v2/missing.bin", "/v2/ok.bin"]);
}

#[tokio::test]
async fn test_ignored_range_retires_job() {
    let mut h = Harness::new().await;
    let body = payload(1000);
    h.server.serve("/v2/image.bin", body.clone());
    h.server.state.ignore_range.store(true, Ordering::SeqCst);

    let mut download = job("/v2/image.bin", "/fw/image.bin", Priority::Medium, ConflictPolicy::NoReplace);
    let id = h.manager.add(&mut download).await.unwrap();
    let queue = h.manager.queue();
    queue.prepare(&mut download).await.unwrap();
    download.set_file_size(1000);
    download.set_downloaded(300);
    queue.persist_progress(&download).await.unwrap();
    queue.append_bytes(&download, &body[..300]).await.unwrap();

    h.reboot().await;
    h.manager.start(0).await.unwrap();
    h.wait_for_status(id, DownloadStatus::Error).await;
    stop_and_wait(&h.manager).await;

    assert!(h.path(&format!("/DOWNLOADS/ERROR/3{id}")).is_file());
    assert!(!h.path("/fw/image.bin").exists());
    assert_eq!(h.manager.get_last_error().await.code, 0x122);
}

#[tokio::test]
async fn test_priority_order_of_execution() {
    let h = Harness::new().await;
    for name in ["a", "b", "c"] {
        h.server.serve(&format!("/{name}.bin"), payload(300));
    }

    let mut a = job("/a.bin", "/fw/a.bin", Priority::Medium, ConflictPolicy::NoReplace);
    let mut b = job("/b.bin", "/fw/b.bin", Priority::Critical, ConflictPolicy::NoReplace);
    let mut c = job("/c.bin", "/fw/c.bin", Priority::Critical, ConflictPolicy::NoReplace);
    h.manager.add(&mut a).await.unwrap();
    h.manager.add(&mut b).await.unwrap();
    let last = h.manager.add(&mut c).await.unwrap();
    assert_eq!(
        h.dir_entries("/DOWNLOADS/QUEUE"),
        vec!["31".to_string(), "52".to_string(), "53".to_string()]
    );

    h.manager.start(0).await.unwrap();
    h.wait_for_status(a.id(), DownloadStatus::Finished).await;
    stop_and_wait(&h.manager).await;

    let resources: Vec<String> = h.server.requests().into_iter().map(|r| r.resource).collect();
    assert_eq!(resources, vec!["/b.bin", "/c.bin", "/a.bin"]);
    assert_eq!(h.manager.get_download(last).await.status(), DownloadStatus::Finished);
    assert_eq!(h.dir_entries("/DOWNLOADS/FINISHED").len(), 3);
}

#[tokio::test]
async fn test_destination_conflicts() {
    let h = Harness::new().await;
    let body = payload(400);
    h.server.serve("/v2/image.bin", body.clone());

    std::fs::create_dir_all(h.path("/fw")).unwrap();
    std::fs::write(h.path("/fw/image.bin"), b"old firmware").unwrap();

    let mut refused = job("/v2/image.bin", "/fw/image.bin", Priority::High, ConflictPolicy::NoReplace);
    assert!(matches!(
        h.manager.add(&mut refused).await,
        Err(FirmfetchError::AlreadyExists(_))
    ));
    assert_eq!(h.manager.get_last_error().await.source, "add");
    assert!(h.dir_entries("/DOWNLOADS/QUEUE").is_empty());

    let mut replacing = job("/v2/image.bin", "/fw/image.bin", Priority::High, ConflictPolicy::Replace);
    let id = h.manager.add(&mut replacing).await.unwrap();
    h.manager.start(0).await.unwrap();
    h.wait_for_status(id, DownloadStatus::Finished).await;
    stop_and_wait(&h.manager).await;

    assert_eq!(std::fs::read(h.path("/fw/image.bin")).unwrap(), body);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_adds_get_unique_ids() {
    let h = Harness::new().await;

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let manager = h.manager.clone();
            tokio::spawn(async move {
                let mut download = job(
                    &format!("/v2/{i}.bin"),
                    &format!("/fw/{i}.bin"),
                    Priority::Medium,
                    ConflictPolicy::NoReplace,
                );
                manager.add(&mut download).await.unwrap()
            })
        })
        .collect();

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap());
    }
    ids.sort_unstable();
    assert_eq!(ids, (1..=8).collect::<Vec<u32>>());

    assert_eq!(h.dir_entries("/DOWNLOADS/QUEUE").len(), 8);
    let counters = h.manager.queue().counters().snapshot().await.unwrap();
    assert_eq!(counters.queued_count, 8);
    assert_eq!(counters.next_id, 9);
    assert_eq!(h.manager.list_downloads().await.len(), 8);
}

#[tokio::test]
async fn test_power_cut_during_sidecar_rewrite_still_resumes() {
    let mut h = Harness::new().await;
    let body = payload(2000);
    h.server.serve("/v2/image.bin", body.clone());

    let mut download = job("/v2/image.bin", "/fw/image.bin", Priority::Medium, ConflictPolicy::NoReplace);
    let id = h.manager.add(&mut download).await.unwrap();
    let queue = h.manager.queue();
    queue.prepare(&mut download).await.unwrap();
    download.set_file_size(2000);
    download.set_downloaded(500);
    queue.persist_progress(&download).await.unwrap();
    queue.append_bytes(&download, &body[..500]).await.unwrap();

    // The next rewrite was cut off after truncating its staging file
    std::fs::write(h.path(&format!("/DOWNLOADS/CURRENT/3{id}.tmp")), b"").unwrap();

    h.reboot().await;
    h.manager.start(0).await.unwrap();
    h.wait_for_status(id, DownloadStatus::Finished).await;
    stop_and_wait(&h.manager).await;

    assert!(h.dir_entries("/DOWNLOADS/ERROR").is_empty());
    assert!(h.dir_entries("/DOWNLOADS/CURRENT").is_empty());
    assert_eq!(std::fs::read(h.path("/fw/image.bin")).unwrap(), body);
    assert_eq!(
        h.server.requests()[0].range.map(|r| r.header_value()),
        Some("bytes=500-2000".to_string())
    );
}

#[tokio::test]
async fn test_failed_retirement_stops_worker() {
    let h = Harness::new().await;

    let mut download = job("/v2/missing.bin", "/fw/missing.bin", Priority::High, ConflictPolicy::NoReplace);
    let id = h.manager.add(&mut download).await.unwrap();
    std::fs::remove_dir_all(h.path("/DOWNLOADS/ERROR")).unwrap();

    h.manager.start(0).await.unwrap();
    let manager = h.manager.clone();
    wait_until("worker to stop", move || {
        let manager = manager.clone();
        async move { !manager.is_running().await }
    })
    .await;
    h.manager.wait().await;

    let last = h.manager.get_last_error().await;
    assert_eq!(last.source, "retire");
    assert_eq!(last.code, 0x113);
    assert_eq!(h.manager.client_id().await, None);
    assert_eq!(h.dir_entries("/DOWNLOADS/CURRENT"), vec![format!("4{id}")]);
    assert!(matches!(h.manager.stop().await, Err(FirmfetchError::NotRunning)));
}

#[tokio::test]
async fn test_unreadable_queue_directory_stops_worker() {
    let h = Harness::new().await;
    h.link.set_attached(false);

    let mut download = job("/v2/image.bin", "/fw/image.bin", Priority::High, ConflictPolicy::NoReplace);
    h.manager.add(&mut download).await.unwrap();
    h.manager.start(0).await.unwrap();

    std::fs::remove_dir_all(h.path("/DOWNLOADS/QUEUE")).unwrap();
    h.link.set_attached(true);

    let manager = h.manager.clone();
    wait_until("worker to stop", move || {
        let manager = manager.clone();
        async move { !manager.is_running().await }
    })
    .await;
    h.manager.wait().await;

    let last = h.manager.get_last_error().await;
    assert_eq!(last.source, "pickNext");
    assert_eq!(last.code, 0x111);
    assert!(h.server.requests().is_empty());
}

#[tokio::test]
async fn test_merge_job_appends_to_existing_file() {
    let h = Harness::new().await;
    let body = payload(700);
    h.server.serve("/v2/delta.bin", body.clone());

    std::fs::create_dir_all(h.path("/fw")).unwrap();
    std::fs::write(h.path("/fw/image.bin"), b"HEADER").unwrap();

    let mut download = job("/v2/delta.bin", "/fw/image.bin", Priority::High, ConflictPolicy::Merge);
    let id = h.manager.add(&mut download).await.unwrap();
    h.manager.start(0).await.unwrap();
    h.wait_for_status(id, DownloadStatus::Finished).await;
    stop_and_wait(&h.manager).await;

    let mut expected = b"HEADER".to_vec();
    expected.extend_from_slice(&body);
    assert_eq!(std::fs::read(h.path("/fw/image.bin")).unwrap(), expected);
    assert_eq!(h.manager.get_download(id).await.downloaded(), 700);
}

#[tokio::test]
async fn test_merge_job_resume_leaves_file_untouched() {
    let mut h = Harness::new().await;
    let body = payload(700);
    h.server.serve("/v2/delta.bin", body.clone());

    std::fs::create_dir_all(h.path("/fw")).unwrap();
    std::fs::write(h.path("/fw/image.bin"), b"HEADER").unwrap();

    let mut download = job("/v2/delta.bin", "/fw/image.bin", Priority::High, ConflictPolicy::Merge);
    let id = h.manager.add(&mut download).await.unwrap();
    let queue = h.manager.queue();
    queue.prepare(&mut download).await.unwrap();
    download.set_file_size(700);
    download.set_downloaded(300);
    queue.persist_progress(&download).await.unwrap();
    queue.append_bytes(&download, &body[..300]).await.unwrap();

    // The file is longer than the persisted offset; a merge must not truncate it
    h.reboot().await;
    h.manager.start(0).await.unwrap();
    h.wait_for_status(id, DownloadStatus::Finished).await;
    stop_and_wait(&h.manager).await;

    let mut expected = b"HEADER".to_vec();
    expected.extend_from_slice(&body);
    assert_eq!(std::fs::read(h.path("/fw/image.bin")).unwrap(), expected);
    assert_eq!(h.server.requests()[0].range.map(|r| r.start), Some(300));
}
