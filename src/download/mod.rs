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


//! Download queue and execution
//!
//! - `record`: the job record and its on-disk sidecar
//! - `queue`: the four queue directories and every move between them
//! - `manager`: public API (`begin`, `add`, `start`, `stop`, status queries)
//! - `worker`: the background task that transfers and retires jobs

pub mod manager;
pub mod queue;
pub mod record;
mod worker;

// Re-export commonly used types
pub use manager::DownloadManager;
pub use queue::{DirectoryQueue, QueueDir, Selection};
pub use record::{ConflictPolicy, Download, DownloadStatus, JobError, Priority, Sidecar};
