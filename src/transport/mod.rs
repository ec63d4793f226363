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


//! Network transport seam
//!
//! The download worker only talks to these traits. The production adapter is
//! [`CellularHttpClient`] (reqwest); tests plug in scripted fakes.
//!
//! Job URLs are stored without a scheme and split into `host` and `resource`
//! before they reach the transport, which supplies the scheme itself.

pub mod cellular;
pub mod link;

pub use cellular::CellularHttpClient;
pub use link::SharedLink;

use crate::error::Result;
use async_trait::async_trait;
use std::fmt;

/// Inclusive byte range for a resumed request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Value of the `Range` header, e.g. `bytes=500-2000`
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.header_value())
    }
}

/// A GET request for one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub host: String,
    /// Path part starting with `/`
    pub resource: String,
    pub range: Option<ByteRange>,
}

impl HttpRequest {
    /// Split a scheme-less URL at its first `/`
    ///
    /// `fw.example.com/v2/image.bin` → host `fw.example.com`, resource
    /// `/v2/image.bin`; a URL without a path requests `/`.
    pub fn from_url(url: &str, range: Option<ByteRange>) -> Self {
        let (host, resource) = match url.find('/') {
            Some(idx) => (&url[..idx], &url[idx..]),
            None => (url, "/"),
        };
        Self {
            host: host.to_string(),
            resource: resource.to_string(),
            range,
        }
    }
}

/// HTTP client able to issue GET requests on behalf of a logical client id
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(&self, client_id: u8, request: &HttpRequest) -> Result<Box<dyn HttpResponse>>;
}

/// An open response whose body is read incrementally
#[async_trait]
pub trait HttpResponse: Send {
    fn status(&self) -> u16;

    fn headers(&self) -> Vec<(String, String)>;

    fn content_length(&self) -> Option<u64>;

    /// Read up to `buf.len()` bytes of body
    ///
    /// `Ok(0)` means no data was available right now. A dropped connection is
    /// reported as `InterruptedTransfer` and leaves `is_connected()` false.
    async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize>;

    fn is_connected(&self) -> bool;
}

/// Physical link status (cellular data attach on the device)
pub trait NetworkLink: Send + Sync {
    fn is_attached(&self) -> bool;
}
