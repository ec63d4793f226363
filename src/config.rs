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


//! Download manager configuration
//!
//! All fields have defaults matching the device firmware, so a JSON config
//! file only needs to list the values it overrides.

use crate::error::{FirmfetchError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Longest namespace the device preference store accepts
pub const MAX_NAMESPACE_LEN: usize = 15;

/// Download manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Mount point of the storage medium; `/DOWNLOADS` lives under it
    pub storage_root: PathBuf,
    /// SQLite file backing the counter store
    pub database_path: PathBuf,
    /// Counter store namespace
    pub counter_namespace: String,
    /// Worker poll interval in milliseconds
    pub poll_interval_ms: u64,
    /// Delay before retrying a read that returned no bytes
    pub read_retry_delay_ms: u64,
    /// Bytes read from the response per iteration
    pub chunk_size: usize,
    /// Highest logical HTTP client id accepted by `start`
    pub max_client_id: u8,
    /// Per-request timeout of the HTTP transport in seconds
    pub http_timeout_secs: u64,
    /// Scheme prepended by the HTTP transport (job URLs are stored without one)
    pub url_scheme: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("./sd"),
            database_path: PathBuf::from("./sd/firmfetch.db"),
            counter_namespace: "downloadManager".to_string(),
            poll_interval_ms: 1000,
            read_retry_delay_ms: 500,
            chunk_size: 1024,
            max_client_id: 5,
            http_timeout_secs: 120,
            url_scheme: "http".to_string(),
        }
    }
}

impl ManagerConfig {
    /// Load configuration from a JSON file and validate it
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path.as_ref()).await?;
        let config: ManagerConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(FirmfetchError::invalid_parameter("chunk_size must be > 0"));
        }
        if self.counter_namespace.is_empty() || self.counter_namespace.len() > MAX_NAMESPACE_LEN {
            return Err(FirmfetchError::invalid_parameter(format!(
                "counter_namespace must be 1..={} characters",
                MAX_NAMESPACE_LEN
            )));
        }
        if self.url_scheme != "http" && self.url_scheme != "https" {
            return Err(FirmfetchError::invalid_parameter(format!(
                "unsupported url_scheme '{}'",
                self.url_scheme
            )));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn read_retry_delay(&self) -> Duration {
        Duration::from_millis(self.read_retry_delay_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}
