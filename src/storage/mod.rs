//! Durable storage for verified proxies and pipeline snapshots
//!
//! A store is scoped to one [`Session`]: dataset and text files live in the
//! session namespace, while snapshots are global so a restarted process can
//! resume from the previous run's state.

pub mod file;
pub mod sqlite;

pub use file::FileStore;
pub use sqlite::SqliteStore;

use crate::error::StorageError;
use crate::proxy::models::Proxy;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Dataset and text file name used for verified results
pub const RESULTS_NAME: &str = "results";

/// Read/write contract the pipeline needs from durable storage.
///
/// Absence of data is never an error: missing datasets read as empty and
/// missing snapshots as `None`. Every operation is safe to retry.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    /// Append records to the session dataset
    async fn append_dataset(&self, records: &[Proxy]) -> StorageResult<()>;

    /// Read the whole session dataset
    async fn get_dataset(&self) -> StorageResult<Vec<Proxy>>;

    /// Replace the snapshot stored under `key`
    async fn set_snapshot(&self, key: &str, value: Value) -> StorageResult<()>;

    async fn get_snapshot(&self, key: &str) -> StorageResult<Option<Value>>;

    /// Append to `<name>.txt` in the session namespace
    async fn append_text_file(&self, name: &str, text: &str) -> StorageResult<()>;

    /// Overwrite `<name>.<ext>` in the session namespace
    async fn write_text_file(&self, name: &str, text: &str, ext: &str) -> StorageResult<()>;

    /// Known session ids, newest first
    async fn list_sessions(&self) -> StorageResult<Vec<String>>;

    /// Dataset of any session, including past ones
    async fn session_results(&self, session_id: &str) -> StorageResult<Vec<Proxy>>;
}

/// One pipeline run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    id: String,
    started_at: DateTime<Utc>,
}

impl Session {
    /// Start a session now
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Session id is `session-` plus the ISO-8601 start time with `:` and
    /// `.` replaced by `-`
    pub fn starting_at(started_at: DateTime<Utc>) -> Self {
        let stamp = started_at
            .to_rfc3339_opts(SecondsFormat::Millis, true)
            .replace([':', '.'], "-");
        Self {
            id: format!("session-{}", stamp),
            started_at,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Strip anything that could escape the session directory
pub(crate) fn safe_session_id(session_id: &str) -> Option<&str> {
    let name = Path::new(session_id).file_name()?.to_str()?;
    (name == session_id && name.starts_with("session-")).then_some(name)
}

/// In-memory store. Nothing survives the process; backs the unit tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    dataset: Vec<Proxy>,
    snapshots: HashMap<String, Value>,
    files: HashMap<String, String>,
    appends: Vec<usize>,
}

impl MemoryStore {
    /// Sizes of every `append_dataset` call so far
    pub fn dataset_appends(&self) -> Vec<usize> {
        self.inner.lock().appends.clone()
    }

    /// Contents of a text file, keyed as `<name>.<ext>`
    pub fn text_file(&self, file_name: &str) -> Option<String> {
        self.inner.lock().files.get(file_name).cloned()
    }
}

#[async_trait]
impl PersistenceStore for MemoryStore {
    async fn append_dataset(&self, records: &[Proxy]) -> StorageResult<()> {
        let mut state = self.inner.lock();
        state.appends.push(records.len());
        state.dataset.extend_from_slice(records);
        Ok(())
    }

    async fn get_dataset(&self) -> StorageResult<Vec<Proxy>> {
        Ok(self.inner.lock().dataset.clone())
    }

    async fn set_snapshot(&self, key: &str, value: Value) -> StorageResult<()> {
        self.inner.lock().snapshots.insert(key.to_string(), value);
        Ok(())
    }

    async fn get_snapshot(&self, key: &str) -> StorageResult<Option<Value>> {
        Ok(self.inner.lock().snapshots.get(key).cloned())
    }

    async fn append_text_file(&self, name: &str, text: &str) -> StorageResult<()> {
        self.inner
            .lock()
            .files
            .entry(format!("{}.txt", name))
            .or_default()
            .push_str(text);
        Ok(())
    }

    async fn write_text_file(&self, name: &str, text: &str, ext: &str) -> StorageResult<()> {
        self.inner
            .lock()
            .files
            .insert(format!("{}.{}", name, ext), text.to_string());
        Ok(())
    }

    async fn list_sessions(&self) -> StorageResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn session_results(&self, _session_id: &str) -> StorageResult<Vec<Proxy>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_session_id_format() {
        let started = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap()
            + chrono::Duration::milliseconds(123);
        let session = Session::starting_at(started);
        assert_eq!(session.id(), "session-2024-03-09T14-05-07-123Z");
        assert_eq!(session.started_at(), started);
    }

    #[test]
    fn test_safe_session_id() {
        assert_eq!(
            safe_session_id("session-2024-03-09T14-05-07-123Z"),
            Some("session-2024-03-09T14-05-07-123Z")
        );
        assert_eq!(safe_session_id("../session-x"), None);
        assert_eq!(safe_session_id("cache"), None);
        assert_eq!(safe_session_id(".."), None);
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryStore::default();
        store
            .append_dataset(&[Proxy::new("1.1.1.1", 80)])
            .await
            .unwrap();
        store.append_text_file("results", "1.1.1.1:80\n").await.unwrap();
        store.append_text_file("results", "2.2.2.2:80\n").await.unwrap();

        assert_eq!(store.get_dataset().await.unwrap().len(), 1);
        assert_eq!(store.dataset_appends(), vec![1]);
        assert_eq!(
            store.text_file("results.txt").as_deref(),
            Some("1.1.1.1:80\n2.2.2.2:80\n")
        );
        assert!(store.get_snapshot("missing").await.unwrap().is_none());
    }
}
