//! Ban persistence.
//!
//! The server mirrors bans in memory and writes them through a
//! [`BanStore`]. Two stores are provided: [`MemoryBanStore`] for tests and
//! ephemeral servers, and [`JsonFileBanStore`] which keeps a JSON object
//! of `user_id → RFC 3339 timestamp` on disk.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::TetherError;

#[async_trait]
pub trait BanStore: Send + Sync {
    /// Record (or extend) a ban.
    async fn write_ban_record(&self, user_id: &str, until: DateTime<Utc>) -> Result<(), TetherError>;

    /// Forget a ban. Removing an unknown user is not an error.
    async fn remove_ban_record(&self, user_id: &str) -> Result<(), TetherError>;

    /// Every stored ban, expired or not.
    async fn load_ban_records(&self) -> Result<HashMap<String, DateTime<Utc>>, TetherError>;
}

// ── MemoryBanStore ───────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemoryBanStore {
    records: DashMap<String, DateTime<Utc>>,
}

impl MemoryBanStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BanStore for MemoryBanStore {
    async fn write_ban_record(&self, user_id: &str, until: DateTime<Utc>) -> Result<(), TetherError> {
        self.records.insert(user_id.to_string(), until);
        Ok(())
    }

    async fn remove_ban_record(&self, user_id: &str) -> Result<(), TetherError> {
        self.records.remove(user_id);
        Ok(())
    }

    async fn load_ban_records(&self) -> Result<HashMap<String, DateTime<Utc>>, TetherError> {
        Ok(self
            .records
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect())
    }
}

// ── JsonFileBanStore ─────────────────────────────────────────────

/// Bans kept in a single JSON file, rewritten on every change.
#[derive(Debug)]
pub struct JsonFileBanStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileBanStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<BTreeMap<String, DateTime<Utc>>, TetherError> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        if text.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&text)
            .map_err(|e| TetherError::Config(format!("{}: {e}", self.path.display())))
    }

    async fn write(&self, records: &BTreeMap<String, DateTime<Utc>>) -> Result<(), TetherError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let text = serde_json::to_string_pretty(records)
            .map_err(|e| TetherError::Encoding(e.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, text).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl BanStore for JsonFileBanStore {
    async fn write_ban_record(&self, user_id: &str, until: DateTime<Utc>) -> Result<(), TetherError> {
        let _guard = self.lock.lock().await;
        let mut records = self.read().await?;
        records.insert(user_id.to_string(), until);
        self.write(&records).await?;
        debug!(user_id, %until, path = %self.path.display(), "ban record written");
        Ok(())
    }

    async fn remove_ban_record(&self, user_id: &str) -> Result<(), TetherError> {
        let _guard = self.lock.lock().await;
        let mut records = self.read().await?;
        if records.remove(user_id).is_some() {
            self.write(&records).await?;
        }
        Ok(())
    }

    async fn load_ban_records(&self) -> Result<HashMap<String, DateTime<Utc>>, TetherError> {
        let _guard = self.lock.lock().await;
        Ok(self.read().await?.into_iter().collect())
    }
}
