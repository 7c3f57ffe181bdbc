//! JSON/text file storage
//!
//! Layout under the base directory:
//!
//! ```text
//! <base>/cache/<key>.json                      snapshots
//! <base>/proxy-results/<session>/results.json  verified dataset
//! <base>/proxy-results/<session>/<name>.<ext>  text exports
//! ```

use super::{safe_session_id, PersistenceStore, Session, StorageResult, RESULTS_NAME};
use crate::proxy::models::Proxy;
use async_trait::async_trait;
use serde_json::Value;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

const CACHE_DIR: &str = "cache";
const RESULTS_DIR: &str = "proxy-results";

/// Write `content` next to `path` and rename it into place
async fn write_atomic(path: &Path, content: &[u8]) -> StorageResult<()> {
    let tmp = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
    fs::write(&tmp, content).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

/// Read a file, treating absence as `None`
async fn read_optional(path: &Path) -> StorageResult<Option<String>> {
    match fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Map a snapshot key onto a file-name-safe stem
fn cache_file_stem(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect()
}

/// Text exports in a session directory, created on first write. Shared
/// with the SQLite backend, whose results file must still be tail-able.
#[derive(Debug, Clone)]
pub(crate) struct SessionFiles {
    dir: PathBuf,
}

impl SessionFiles {
    pub(crate) fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub(crate) fn path(&self, name: &str, ext: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", name, ext))
    }

    pub(crate) async fn append(&self, name: &str, text: &str) -> StorageResult<()> {
        fs::create_dir_all(&self.dir).await?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(name, "txt"))
            .await?;
        file.write_all(text.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    pub(crate) async fn write(&self, name: &str, text: &str, ext: &str) -> StorageResult<()> {
        fs::create_dir_all(&self.dir).await?;
        write_atomic(&self.path(name, ext), text.as_bytes()).await
    }
}

/// File-system backed [`PersistenceStore`]
#[derive(Debug)]
pub struct FileStore {
    base_dir: PathBuf,
    session: Session,
    files: SessionFiles,
    /// Serializes read-merge-write cycles on the dataset file
    dataset_lock: Mutex<()>,
}

impl FileStore {
    /// Open the storage root for a session. The session directory itself
    /// appears with the first write.
    pub async fn open(base_dir: impl Into<PathBuf>, session: Session) -> StorageResult<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(base_dir.join(CACHE_DIR)).await?;
        let files = SessionFiles::new(base_dir.join(RESULTS_DIR).join(session.id()));

        Ok(Self {
            base_dir,
            session,
            files,
            dataset_lock: Mutex::new(()),
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Directory holding this session's exports
    pub fn session_dir(&self) -> PathBuf {
        self.base_dir.join(RESULTS_DIR).join(self.session.id())
    }

    fn snapshot_path(&self, key: &str) -> PathBuf {
        self.base_dir
            .join(CACHE_DIR)
            .join(format!("{}.json", cache_file_stem(key)))
    }

    fn dataset_path(&self, session_id: &str) -> PathBuf {
        self.base_dir
            .join(RESULTS_DIR)
            .join(session_id)
            .join(format!("{}.json", RESULTS_NAME))
    }

    async fn read_dataset(path: &Path) -> StorageResult<Vec<Proxy>> {
        match read_optional(path).await? {
            Some(content) => Ok(serde_json::from_str(&content)?),
            None => Ok(Vec::new()),
        }
    }
}

#[async_trait]
impl PersistenceStore for FileStore {
    async fn append_dataset(&self, records: &[Proxy]) -> StorageResult<()> {
        let _guard = self.dataset_lock.lock().await;
        let path = self.dataset_path(self.session.id());
        fs::create_dir_all(self.session_dir()).await?;

        let mut existing = match Self::read_dataset(&path).await {
            Ok(existing) => existing,
            Err(e) => {
                // Keep the unreadable file for inspection and start a new one.
                let aside = path.with_extension("json.corrupt");
                tracing::warn!(path = %path.display(), error = %e, "Dataset unreadable, moving aside");
                fs::rename(&path, &aside).await?;
                Vec::new()
            }
        };

        existing.extend_from_slice(records);
        let content = serde_json::to_vec_pretty(&existing)?;
        write_atomic(&path, &content).await
    }

    async fn get_dataset(&self) -> StorageResult<Vec<Proxy>> {
        let _guard = self.dataset_lock.lock().await;
        Self::read_dataset(&self.dataset_path(self.session.id())).await
    }

    async fn set_snapshot(&self, key: &str, value: Value) -> StorageResult<()> {
        let content = serde_json::to_vec_pretty(&value)?;
        write_atomic(&self.snapshot_path(key), &content).await
    }

    async fn get_snapshot(&self, key: &str) -> StorageResult<Option<Value>> {
        match read_optional(&self.snapshot_path(key)).await? {
            Some(content) => Ok(Some(serde_json::from_str(&content)?)),
            None => Ok(None),
        }
    }

    async fn append_text_file(&self, name: &str, text: &str) -> StorageResult<()> {
        self.files.append(name, text).await
    }

    async fn write_text_file(&self, name: &str, text: &str, ext: &str) -> StorageResult<()> {
        self.files.write(name, text, ext).await
    }

    async fn list_sessions(&self) -> StorageResult<Vec<String>> {
        let mut entries = match fs::read_dir(self.base_dir.join(RESULTS_DIR)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut sessions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with("session-") {
                    sessions.push(name.to_string());
                }
            }
        }

        // Ids embed an ISO timestamp, so lexical order is chronological.
        sessions.sort_by(|a, b| b.cmp(a));
        Ok(sessions)
    }

    async fn session_results(&self, session_id: &str) -> StorageResult<Vec<Proxy>> {
        let Some(session_id) = safe_session_id(session_id) else {
            return Ok(Vec::new());
        };
        Self::read_dataset(&self.dataset_path(session_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_file_stem() {
        assert_eq!(cache_file_stem("PROXY-STORE-STATE"), "PROXY-STORE-STATE");
        assert_eq!(cache_file_stem("GEO-1.2.3.4"), "GEO-1.2.3.4");
        assert_eq!(cache_file_stem("GEO-../../etc"), "GEO-.._.._etc");
    }
}
