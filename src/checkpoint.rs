// MIT License - Copyright (c) 2026 Peter Wright
// INIM Prime log bridge

//! Durable copy of the last reconciled log window.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{InimError, Result};
use crate::log_event::LogEvent;

/// Current layout version of the checkpoint document.
pub const CHECKPOINT_VERSION: u32 = 1;

const STORAGE_PREFIX: &str = "inim_prime";
const STORAGE_SUFFIX: &str = "last_panel_log_events";

/// Load/save of the known log tail.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// `Ok(None)` when nothing has been saved yet.
    async fn load(&self) -> Result<Option<Vec<LogEvent>>>;

    async fn save(&self, events: &[LogEvent]) -> Result<()>;
}

#[async_trait]
impl<T: CheckpointStore + ?Sized> CheckpointStore for Arc<T> {
    async fn load(&self) -> Result<Option<Vec<LogEvent>>> {
        (**self).load().await
    }

    async fn save(&self, events: &[LogEvent]) -> Result<()> {
        (**self).save(events).await
    }
}

/// Storage key for the panel with the given serial number.
pub fn storage_key(serial_number: &str) -> String {
    format!("{STORAGE_PREFIX}_{serial_number}_{STORAGE_SUFFIX}")
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointDocument {
    version: u32,
    key: String,
    data: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointData {
    logs: Vec<LogEvent>,
}

/// Bring `data` written under `version` up to the current layout.
fn migrate(version: u32, data: serde_json::Value) -> Result<CheckpointData> {
    match version {
        CHECKPOINT_VERSION => Ok(serde_json::from_value(data)?),
        found => Err(InimError::UnsupportedCheckpointVersion {
            found,
            supported: CHECKPOINT_VERSION,
        }),
    }
}

/// One JSON file per panel under a storage directory.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    key: String,
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl AsRef<Path>, serial_number: &str) -> Self {
        let key = storage_key(serial_number);
        let path = dir.as_ref().join(format!("{key}.json"));
        Self { key, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self) -> Result<Option<Vec<LogEvent>>> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let doc: CheckpointDocument = serde_json::from_str(&text)?;
        let data = migrate(doc.version, doc.data)?;
        debug!(
            "Loaded {} log events from {}",
            data.logs.len(),
            self.path.display()
        );
        Ok(Some(data.logs))
    }

    async fn save(&self, events: &[LogEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let doc = CheckpointDocument {
            version: CHECKPOINT_VERSION,
            key: self.key.clone(),
            data: serde_json::to_value(CheckpointData {
                logs: events.to_vec(),
            })?,
        };
        let json = serde_json::to_vec_pretty(&doc)?;

        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        // Write-then-rename so a crash never leaves a truncated checkpoint.
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!("Saved {} log events to {}", events.len(), self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn sample() -> Vec<LogEvent> {
        let ts = NaiveDate::from_ymd_opt(2025, 6, 1)
            .unwrap()
            .and_hms_opt(12, 30, 0)
            .unwrap();
        vec![
            LogEvent::new(1, ts, "Arm", Some("User 1".into()), None, None),
            LogEvent::new(2, ts, "Zone alarm", None, Some("Hall".into()), Some("3".into())),
        ]
    }

    #[test]
    fn test_storage_key() {
        assert_eq!(storage_key("ABC123"), "inim_prime_ABC123_last_panel_log_events");
    }

    #[tokio::test]
    async fn test_missing_file_loads_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path(), "SN1");
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("nested"), "SN1");
        store.save(&sample()).await.unwrap();

        assert_eq!(store.load().await.unwrap(), Some(sample()));

        let doc: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(doc["version"], 1);
        assert_eq!(doc["key"], "inim_prime_SN1_last_panel_log_events");
        assert_eq!(doc["data"]["logs"][1]["type"], "Zone alarm");
        assert_eq!(doc["data"]["logs"][0]["timestamp"], "2025-06-01T12:30:00");
    }

    #[tokio::test]
    async fn test_empty_save_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path(), "SN1");
        store.save(&sample()).await.unwrap();
        store.save(&[]).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(sample()));
    }

    #[tokio::test]
    async fn test_newer_version_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path(), "SN1");
        std::fs::write(
            store.path(),
            r#"{"version": 2, "key": "x", "data": {"logs": []}}"#,
        )
        .unwrap();
        assert!(matches!(
            store.load().await,
            Err(InimError::UnsupportedCheckpointVersion { found: 2, supported: 1 })
        ));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path(), "SN1");
        std::fs::write(store.path(), "{not json").unwrap();
        assert!(matches!(store.load().await, Err(InimError::Json(_))));
    }
}
