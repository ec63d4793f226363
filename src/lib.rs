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


//! firmfetch: persistent priority download queue
//!
//! Fetches large files over an intermittent cellular link, survives power
//! loss mid-transfer and resumes without re-downloading stored bytes.
//!
//! ```no_run
//! use firmfetch::config::ManagerConfig;
//! use firmfetch::download::{ConflictPolicy, Download, DownloadManager, Priority};
//! use firmfetch::transport::{CellularHttpClient, SharedLink};
//! use std::sync::Arc;
//!
//! # async fn example() -> firmfetch::error::Result<()> {
//! let config = ManagerConfig::default();
//! let transport = Arc::new(CellularHttpClient::new(
//!     config.max_client_id,
//!     config.http_timeout(),
//!     &config.url_scheme,
//! )?);
//! let link = Arc::new(SharedLink::new(true));
//!
//! let manager = DownloadManager::open(config, transport, link).await?;
//! manager.begin().await?;
//!
//! let mut job = Download::create(
//!     "https://fw.example.com/v2/image.bin",
//!     "/fw/image.bin",
//!     Priority::High,
//!     ConflictPolicy::Replace,
//! )?;
//! manager.add(&mut job).await?;
//! manager.start(0).await?;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod download;
pub mod error;
pub mod storage;
pub mod transport;

pub use download::DownloadManager;
pub use error::{FirmfetchError, LastError, Result};
