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


//! reqwest adapter for [`HttpTransport`]
//!
//! The modem exposes a small fixed set of logical HTTP clients (ids
//! `0..=max_client_id`). Each id gets its own `reqwest::Client` and its own
//! async mutex; an open response keeps the mutex of its client id until it is
//! dropped, so two requests never share one logical client.
//!
//! The configured timeout bounds connecting, waiting for the response head
//! and each body read separately; a long transfer that keeps making
//! progress is never cut off.

use super::{HttpRequest, HttpResponse, HttpTransport};
use crate::error::{FirmfetchError, Result};
use async_trait::async_trait;
use reqwest::header::RANGE;
use reqwest::{Client, ClientBuilder};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::timeout;
use tracing::debug;

struct ClientSlot {
    client: Client,
    busy: Arc<Mutex<()>>,
}

pub struct CellularHttpClient {
    slots: Vec<ClientSlot>,
    scheme: String,
    timeout: Duration,
}

impl CellularHttpClient {
    /// Build one client per id in `0..=max_client_id`
    pub fn new(max_client_id: u8, timeout: Duration, scheme: &str) -> Result<Self> {
        Self::with_builder(max_client_id, timeout, scheme, Client::builder)
    }

    fn with_builder(
        max_client_id: u8,
        timeout: Duration,
        scheme: &str,
        builder: impl Fn() -> ClientBuilder,
    ) -> Result<Self> {
        let mut slots = Vec::with_capacity(max_client_id as usize + 1);
        for _ in 0..=max_client_id {
            let client = builder().connect_timeout(timeout).build()?;
            slots.push(ClientSlot {
                client,
                busy: Arc::new(Mutex::new(())),
            });
        }

        Ok(Self {
            slots,
            scheme: scheme.to_string(),
            timeout,
        })
    }

    fn url_for(&self, request: &HttpRequest) -> String {
        format!("{}://{}{}", self.scheme, request.host, request.resource)
    }
}

#[async_trait]
impl HttpTransport for CellularHttpClient {
    async fn get(&self, client_id: u8, request: &HttpRequest) -> Result<Box<dyn HttpResponse>> {
        let slot = self.slots.get(client_id as usize).ok_or_else(|| {
            FirmfetchError::invalid_parameter(format!("unknown HTTP client id {}", client_id))
        })?;

        let guard = Arc::clone(&slot.busy).lock_owned().await;

        let url = self.url_for(request);
        let mut builder = slot.client.get(&url);
        if let Some(range) = request.range {
            builder = builder.header(RANGE, range.header_value());
        }

        debug!(client_id, %url, range = ?request.range, "sending request");
        let response = timeout(self.timeout, builder.send())
            .await
            .map_err(|_| FirmfetchError::Timeout(request.host.clone()))?
            .map_err(|e| map_request_error(&request.host, e))?;

        Ok(Box::new(CellularResponse {
            host: request.host.clone(),
            response,
            pending: Vec::new(),
            pending_pos: 0,
            connected: true,
            read_timeout: self.timeout,
            _slot: guard,
        }))
    }
}

struct CellularResponse {
    host: String,
    response: reqwest::Response,
    // Body chunks arrive in whatever size the server sends; hand them out
    // in caller-sized pieces.
    pending: Vec<u8>,
    pending_pos: usize,
    connected: bool,
    read_timeout: Duration,
    _slot: OwnedMutexGuard<()>,
}

#[async_trait]
impl HttpResponse for CellularResponse {
    fn status(&self) -> u16 {
        self.response.status().as_u16()
    }

    fn headers(&self) -> Vec<(String, String)> {
        self.response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    value.to_str().unwrap_or("<binary>").to_string(),
                )
            })
            .collect()
    }

    fn content_length(&self) -> Option<u64> {
        self.response.content_length()
    }

    async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.pending_pos >= self.pending.len() {
            if !self.connected {
                return Ok(0);
            }
            let next = match timeout(self.read_timeout, self.response.chunk()).await {
                Ok(next) => next,
                Err(_) => {
                    self.connected = false;
                    return Err(FirmfetchError::InterruptedTransfer(format!(
                        "{}: no data for {:?}",
                        self.host, self.read_timeout
                    )));
                }
            };
            match next {
                Ok(Some(chunk)) => {
                    self.pending = chunk.to_vec();
                    self.pending_pos = 0;
                }
                Ok(None) => {
                    self.connected = false;
                    return Ok(0);
                }
                Err(e) => {
                    self.connected = false;
                    return Err(FirmfetchError::InterruptedTransfer(format!(
                        "{}: {}",
                        self.host, e
                    )));
                }
            }
        }

        let available = &self.pending[self.pending_pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.pending_pos += n;
        Ok(n)
    }

    fn is_connected(&self) -> bool {
        self.connected || self.pending_pos < self.pending.len()
    }
}

fn map_request_error(host: &str, error: reqwest::Error) -> FirmfetchError {
    if error.is_timeout() {
        FirmfetchError::Timeout(host.to_string())
    } else if error.is_connect() {
        FirmfetchError::ConnectError {
            host: host.to_string(),
            message: error.to_string(),
        }
    } else {
        FirmfetchError::bad_response(format!("{}: {}", host, error))
    }
}
