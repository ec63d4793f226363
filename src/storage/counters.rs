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


//! Queue counters
//!
//! Three durable values summarize the directory queue so the worker can pick
//! the right directory without listing all of them:
//! - `nextId`: the id the next added job receives (starts at 1, never reused)
//! - `queuedCount`: records waiting in `QUEUE`
//! - `hasDownload`: whether `CURRENT` holds a record
//!
//! Multi-key updates run in one SQLite transaction.

use crate::error::{FirmfetchError, Result};
use sqlx::SqlitePool;

pub const KEY_NEXT_ID: &str = "nextId";
pub const KEY_QUEUED_COUNT: &str = "queuedCount";
pub const KEY_IN_PROGRESS: &str = "hasDownload";

const UPSERT_SQL: &str = r#"
    INSERT INTO Preferences (namespace, key, value, updated_at)
    VALUES (?, ?, ?, CURRENT_TIMESTAMP)
    ON CONFLICT(namespace, key) DO UPDATE SET
        value = excluded.value,
        updated_at = excluded.updated_at
"#;

/// Point-in-time view of all counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub next_id: u32,
    pub queued_count: u32,
    pub has_download_in_progress: bool,
}

/// Namespaced counter store over SQLite
#[derive(Debug, Clone)]
pub struct CounterStore {
    pool: SqlitePool,
    namespace: String,
}

impl CounterStore {
    pub fn new<S: Into<String>>(pool: SqlitePool, namespace: S) -> Self {
        Self {
            pool,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub async fn get_int(&self, key: &str, default: i64) -> Result<i64> {
        let value: Option<i64> =
            sqlx::query_scalar("SELECT value FROM Preferences WHERE namespace = ? AND key = ?")
                .bind(&self.namespace)
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        Ok(value.unwrap_or(default))
    }

    pub async fn put_int(&self, key: &str, value: i64) -> Result<()> {
        sqlx::query(UPSERT_SQL)
            .bind(&self.namespace)
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await
            .map_err(|e| FirmfetchError::persist(format!("counter {}", key), e))?;

        Ok(())
    }

    pub async fn get_bool(&self, key: &str, default: bool) -> Result<bool> {
        Ok(self.get_int(key, default as i64).await? != 0)
    }

    pub async fn put_bool(&self, key: &str, value: bool) -> Result<()> {
        self.put_int(key, value as i64).await
    }

    pub async fn next_id(&self) -> Result<u32> {
        Ok(to_u32(self.get_int(KEY_NEXT_ID, 1).await?.max(1)))
    }

    pub async fn queued_count(&self) -> Result<u32> {
        Ok(to_u32(self.get_int(KEY_QUEUED_COUNT, 0).await?))
    }

    pub async fn has_download_in_progress(&self) -> Result<bool> {
        self.get_bool(KEY_IN_PROGRESS, false).await
    }

    pub async fn set_queued_count(&self, count: u32) -> Result<()> {
        self.put_int(KEY_QUEUED_COUNT, count as i64).await
    }

    pub async fn set_download_in_progress(&self, in_progress: bool) -> Result<()> {
        self.put_bool(KEY_IN_PROGRESS, in_progress).await
    }

    /// A job with `id` was written to `QUEUE`: bump `nextId` past it and count it
    pub async fn record_enqueued(&self, id: u32) -> Result<()> {
        let queued = self.queued_count().await?;
        self.put_many(&[
            (KEY_NEXT_ID, id as i64 + 1),
            (KEY_QUEUED_COUNT, queued as i64 + 1),
        ])
        .await
    }

    /// A job moved `QUEUE` → `CURRENT`
    pub async fn record_promoted(&self) -> Result<()> {
        let queued = self.queued_count().await?;
        self.put_many(&[
            (KEY_IN_PROGRESS, 1),
            (KEY_QUEUED_COUNT, queued.saturating_sub(1) as i64),
        ])
        .await
    }

    /// A job left `QUEUE` without being promoted
    pub async fn record_dequeued(&self) -> Result<()> {
        let queued = self.queued_count().await?;
        self.set_queued_count(queued.saturating_sub(1)).await
    }

    pub async fn snapshot(&self) -> Result<CounterSnapshot> {
        Ok(CounterSnapshot {
            next_id: self.next_id().await?,
            queued_count: self.queued_count().await?,
            has_download_in_progress: self.has_download_in_progress().await?,
        })
    }

    async fn put_many(&self, values: &[(&str, i64)]) -> Result<()> {
        let persist = |e: sqlx::Error| FirmfetchError::persist("queue counters", e);

        let mut tx = self.pool.begin().await.map_err(persist)?;
        for (key, value) in values {
            sqlx::query(UPSERT_SQL)
                .bind(&self.namespace)
                .bind(*key)
                .bind(*value)
                .execute(&mut *tx)
                .await
                .map_err(persist)?;
        }
        tx.commit().await.map_err(persist)?;

        Ok(())
    }
}

fn to_u32(value: i64) -> u32 {
    value.clamp(0, u32::MAX as i64) as u32
}
