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


//! Error types for firmfetch
//!
//! A single error enum covers every failure the queue can report. Variants are
//! grouped by the layer that raises them:
//!
//! ### Parameters / lifecycle (manager API)
//! - `InvalidParameter`, `NotInitialized`, `AlreadyRunning`, `NotRunning`,
//!   `AlreadyExists`, `InitError`
//!
//! ### Storage (block storage, counter store, directory queue)
//! - `StorageUnavailable`, `DirectoryCorrupt`, `RecordCorrupt`, `PersistFailure`
//!
//! ### Network (transport adapter, worker)
//! - `ConnectError`, `Timeout`, `BadResponse`, `NonSuccessStatus`,
//!   `InterruptedTransfer`
//!
//! Every variant has a stable numeric code (`code()`), which is what gets
//! persisted into a job's sidecar (`idStatus`) and reported through
//! [`LastError`].

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias using our FirmfetchError type
pub type Result<T> = std::result::Result<T, FirmfetchError>;

/// Main error type for firmfetch
#[derive(Error, Debug)]
pub enum FirmfetchError {
    // ===== Parameter / Lifecycle Errors =====

    /// A caller-supplied value is empty or out of range
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Manager not initialized (`begin` not called) or record not initialized
    #[error("Not initialized: {0}")]
    NotInitialized(String),

    #[error("Download worker is already running")]
    AlreadyRunning,

    #[error("Download worker is not running")]
    NotRunning,

    /// Destination file exists and the job's conflict policy forbids replacing it
    #[error("Destination already exists: {0}")]
    AlreadyExists(String),

    /// Queue directory layout could not be created
    #[error("Initialization failed: {0}")]
    InitError(String),

    // ===== Storage Errors =====

    /// Storage medium missing, unmounted or not writable
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A queue directory could not be opened or listed
    #[error("Queue directory corrupt: {0}")]
    DirectoryCorrupt(String),

    /// A sidecar could not be read, parsed or validated
    #[error("Corrupt download record {key}: {reason}")]
    RecordCorrupt { key: String, reason: String },

    /// A durable write (move, counter, sidecar, payload) failed
    #[error("Failed to persist {what}: {message}")]
    PersistFailure { what: String, message: String },

    // ===== Network Errors =====

    #[error("Failed to connect to {host}: {message}")]
    ConnectError { host: String, message: String },

    #[error("Request to {0} timed out")]
    Timeout(String),

    /// Response could not be used (malformed, missing length, range ignored)
    #[error("Invalid response: {0}")]
    BadResponse(String),

    #[error("Server {host} responded with status code {status_code}")]
    NonSuccessStatus { status_code: u16, host: String },

    /// Connection dropped while reading the body; the job stays resumable
    #[error("Transfer interrupted: {0}")]
    InterruptedTransfer(String),

    // ===== External Library Errors =====

    /// HTTP client error from reqwest
    #[error("HTTP client error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),

    /// Database driver error from sqlx
    #[error("Database error: {0}")]
    SqlxError(#[from] sqlx::Error),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// Helper methods for creating common errors
impl FirmfetchError {
    pub fn invalid_parameter<S: Into<String>>(message: S) -> Self {
        FirmfetchError::InvalidParameter(message.into())
    }

    pub fn not_initialized<S: Into<String>>(what: S) -> Self {
        FirmfetchError::NotInitialized(what.into())
    }

    pub fn record_corrupt<K: Into<String>, R: Into<String>>(key: K, reason: R) -> Self {
        FirmfetchError::RecordCorrupt {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Wrap any failure of a durable write, keeping what was being written
    pub fn persist<S: Into<String>, E: fmt::Display>(what: S, err: E) -> Self {
        FirmfetchError::PersistFailure {
            what: what.into(),
            message: err.to_string(),
        }
    }

    pub fn bad_response<S: Into<String>>(message: S) -> Self {
        FirmfetchError::BadResponse(message.into())
    }

    /// Stable numeric code, persisted as `idStatus` and reported in `LastError`
    pub fn code(&self) -> u16 {
        match self {
            FirmfetchError::InvalidParameter(_) => 0x101,
            FirmfetchError::NotInitialized(_) => 0x102,
            FirmfetchError::AlreadyRunning => 0x103,
            FirmfetchError::NotRunning => 0x104,
            FirmfetchError::AlreadyExists(_) => 0x105,
            FirmfetchError::InitError(_) => 0x106,
            FirmfetchError::StorageUnavailable(_) => 0x110,
            FirmfetchError::DirectoryCorrupt(_) => 0x111,
            FirmfetchError::RecordCorrupt { .. } => 0x112,
            FirmfetchError::PersistFailure { .. } => 0x113,
            FirmfetchError::ConnectError { .. } => 0x120,
            FirmfetchError::Timeout(_) => 0x121,
            FirmfetchError::BadResponse(_) => 0x122,
            FirmfetchError::NonSuccessStatus { .. } => 0x123,
            FirmfetchError::InterruptedTransfer(_) => 0x124,
            FirmfetchError::ReqwestError(_) => 0x130,
            FirmfetchError::SerdeJsonError(_) => 0x131,
            FirmfetchError::SqlxError(_) => 0x132,
            FirmfetchError::IoError(_) => 0x133,
        }
    }

    /// Check if error was raised by the transport or the remote server
    pub fn is_network_error(&self) -> bool {
        matches!(
            self,
            FirmfetchError::ConnectError { .. }
                | FirmfetchError::Timeout(_)
                | FirmfetchError::BadResponse(_)
                | FirmfetchError::NonSuccessStatus { .. }
                | FirmfetchError::InterruptedTransfer(_)
                | FirmfetchError::ReqwestError(_)
        )
    }

    /// Check if error is related to storage, the counter store or on-disk records
    pub fn is_storage_error(&self) -> bool {
        matches!(
            self,
            FirmfetchError::StorageUnavailable(_)
                | FirmfetchError::DirectoryCorrupt(_)
                | FirmfetchError::RecordCorrupt { .. }
                | FirmfetchError::PersistFailure { .. }
                | FirmfetchError::SqlxError(_)
                | FirmfetchError::IoError(_)
        )
    }

    /// Short category label for structured logs
    pub fn category(&self) -> &'static str {
        if self.is_network_error() {
            "network"
        } else if self.is_storage_error() {
            "storage"
        } else {
            "api"
        }
    }
}

/// Most recent manager-level failure
///
/// `source` names the manager operation that failed (`begin`, `add`, `start`,
/// `stop`, `pickNext`, `load`, `promote`, `execute`, `retire`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastError {
    pub source: String,
    pub code: u16,
    pub message: String,
}

impl LastError {
    pub fn new<S: Into<String>, M: Into<String>>(source: S, code: u16, message: M) -> Self {
        Self {
            source: source.into(),
            code,
            message: message.into(),
        }
    }

    pub fn from_error<S: Into<String>>(source: S, error: &FirmfetchError) -> Self {
        Self::new(source, error.code(), error.to_string())
    }

    /// True until the first failure is recorded
    pub fn is_empty(&self) -> bool {
        self.code == 0 && self.source.is_empty()
    }
}

impl fmt::Display for LastError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] 0x{:03X}: {}", self.source, self.code, self.message)
    }
}
