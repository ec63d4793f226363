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


//! Durable storage
//!
//! Two stores back the download queue:
//! - [`StorageController`]: the file tree on the storage medium (queue
//!   directories, sidecars, downloaded payloads), guarded by one
//!   storage-wide lock.
//! - [`CounterStore`]: small namespaced integer/boolean counters kept in
//!   SQLite (`nextId`, `queuedCount`, `hasDownload`).
//!
//! # Usage Example
//! ```no_run
//! use firmfetch::storage::{CounterStore, Database, StorageController};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::new("./sd/firmfetch.db").await?;
//! let counters = CounterStore::new(db.pool().clone(), "downloadManager");
//! let storage = StorageController::new("./sd");
//! storage.begin().await?;
//!
//! let next = counters.next_id().await?;
//! # Ok(())
//! # }
//! ```

pub mod block;
pub mod counters;
pub mod database;
pub mod migrations;

// Re-export commonly used types
pub use block::StorageController;
pub use counters::{CounterSnapshot, CounterStore};
pub use database::Database;
