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


//! Download worker task
//!
//! One iteration per poll interval:
//! 1. exit if a stop was requested
//! 2. skip while the network link is down
//! 3. pick the next record; nothing to do → sleep
//! 4. load it and promote it to `CURRENT` (or reconcile a resumed one)
//! 5. transfer, persisting the offset after every chunk
//! 6. retire to `FINISHED`, or to `ERROR` on failure
//!
//! A dropped link or connection leaves the job in `CURRENT`; it is picked
//! again on the next iteration and resumed with a `Range` request. When a
//! failed job cannot even be moved to `ERROR` the worker stops.

use super::manager::Shared;
use super::record::{Download, DownloadStatus, JobError};
use crate::error::{FirmfetchError, Result};
use crate::transport::{ByteRange, HttpRequest};
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

enum Step {
    Continue,
    StopRequested,
    Fatal,
}

enum Transfer {
    Completed,
    Interrupted(String),
    StopRequested,
}

pub(crate) struct Worker {
    shared: Arc<Shared>,
    client_id: u8,
}

impl Worker {
    pub(crate) fn new(shared: Arc<Shared>, client_id: u8) -> Self {
        Self { shared, client_id }
    }

    pub(crate) async fn run(self) {
        loop {
            if self.shared.acknowledge_stop().await {
                info!("stop acknowledged");
                break;
            }

            if self.shared.link.is_attached() {
                match self.poll_once().await {
                    Step::Continue => {}
                    // Acknowledged at the top of the loop
                    Step::StopRequested => continue,
                    Step::Fatal => {
                        self.shared.mark_stopped().await;
                        error!("download worker stopped after a storage failure");
                        break;
                    }
                }
            } else {
                debug!("network link down");
            }

            sleep(self.shared.config.poll_interval()).await;
        }
    }

    async fn poll_once(&self) -> Step {
        let queue = &self.shared.queue;

        let selection = match queue.pick_next().await {
            Ok(Some(selection)) => selection,
            Ok(None) => return Step::Continue,
            Err(e) => {
                self.shared.record_error("pickNext", &e).await;
                return Step::Fatal;
            }
        };

        let mut download = match queue.load(&selection).await {
            Ok(download) => download,
            Err(e) => return self.fail(selection.placeholder(), "load", e).await,
        };

        if let Err(e) = queue.prepare(&mut download).await {
            return self.fail(download, "promote", e).await;
        }

        match self.execute(&mut download).await {
            Ok(Transfer::Completed) => self.finish(download).await,
            Ok(Transfer::Interrupted(reason)) => {
                warn!(
                    id = download.id(),
                    downloaded = download.downloaded(),
                    reason = %reason,
                    "transfer interrupted, will resume"
                );
                Step::Continue
            }
            Ok(Transfer::StopRequested) => {
                download.set_status(DownloadStatus::Wait);
                self.shared.replace_in_index(download).await;
                Step::StopRequested
            }
            Err(e) => self.fail(download, "execute", e).await,
        }
    }

    async fn execute(&self, download: &mut Download) -> Result<Transfer> {
        let shared = &self.shared;

        let range = (download.downloaded() > 0)
            .then(|| ByteRange::new(download.downloaded(), download.file_size()));
        let request = HttpRequest::from_url(download.source_url(), range);

        info!(
            id = download.id(),
            host = %request.host,
            resource = %request.resource,
            resume_from = download.downloaded(),
            "requesting"
        );
        let mut response = shared.transport.get(self.client_id, &request).await?;

        let status = response.status();
        if !(200..300).contains(&status) {
            return Err(FirmfetchError::NonSuccessStatus {
                status_code: status,
                host: request.host.clone(),
            });
        }
        if let Some(range) = range {
            if status != 206 {
                return Err(FirmfetchError::bad_response(format!(
                    "server answered {} to range {}",
                    status, range
                )));
            }
        }
        for (name, value) in response.headers() {
            debug!(%name, %value, "response header");
        }

        if download.downloaded() == 0 {
            let length = response
                .content_length()
                .ok_or_else(|| FirmfetchError::bad_response("missing content length"))?;
            download.set_file_size(length);
            download.set_started_at(shared.clock.now_string());
            shared.queue.persist_progress(download).await?;
        }

        let chunk_size = shared.config.chunk_size.max(1);
        let mut buf = vec![0u8; chunk_size];

        while download.downloaded() < download.file_size() {
            if shared.stop_requested().await {
                return Ok(Transfer::StopRequested);
            }
            if !shared.link.is_attached() {
                return Ok(Transfer::Interrupted("network link lost".to_string()));
            }
            if !response.is_connected() {
                return Ok(Transfer::Interrupted("connection closed".to_string()));
            }

            let remaining = download.file_size() - download.downloaded();
            let want = remaining.min(chunk_size as u64) as usize;
            let read = match response.read_chunk(&mut buf[..want]).await {
                Ok(read) => read,
                Err(FirmfetchError::InterruptedTransfer(reason)) => {
                    return Ok(Transfer::Interrupted(reason));
                }
                Err(e) => return Err(e),
            };
            if read == 0 {
                sleep(shared.config.read_retry_delay()).await;
                continue;
            }

            shared.queue.append_bytes(download, &buf[..read]).await?;
            download.set_downloaded(download.downloaded() + read as u64);
            download.set_status(DownloadStatus::Downloading);
            shared.queue.persist_progress(download).await?;
            shared.replace_in_index(download.clone()).await;

            debug!(
                id = download.id(),
                downloaded = download.downloaded(),
                file_size = download.file_size(),
                "chunk stored"
            );
        }

        Ok(Transfer::Completed)
    }

    async fn finish(&self, mut download: Download) -> Step {
        match self.shared.queue.retire_finished(&mut download).await {
            Ok(()) => {
                download.set_status(DownloadStatus::Finished);
                self.shared.replace_in_index(download).await;
                Step::Continue
            }
            Err(e) => self.fail(download, "retire", e).await,
        }
    }

    /// Retire a failed job to `ERROR`; the worker stops if that fails too
    async fn fail(&self, mut download: Download, source: &str, err: FirmfetchError) -> Step {
        self.shared.record_error(source, &err).await;
        download.set_last_error(JobError::from(&err));
        download.set_status(DownloadStatus::Error);

        match self.shared.queue.retire_error(&mut download).await {
            Ok(()) => {
                self.shared.replace_in_index(download).await;
                Step::Continue
            }
            Err(e) => {
                self.shared.record_error("retire", &e).await;
                Step::Fatal
            }
        }
    }
}
