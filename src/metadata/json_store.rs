//! JSON-file metadata index.
//!
//! The whole record list is rewritten on every mutation (temp file + rename),
//! under the same lock that guards the in-memory map.

use crate::error::{Result, StoreError};
use crate::metadata::{validate_name, FileRecord, MetadataStore};
use crate::transport::ByteStream;
use async_trait::async_trait;
use fs2::FileExt;
use futures::StreamExt;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Metadata store persisted as a pretty-printed JSON array
pub struct JsonStore {
    path: PathBuf,
    records: Mutex<HashMap<String, FileRecord>>,
    // Held for the store's lifetime; released on drop
    _lock: fs::File,
}

impl JsonStore {
    /// Default index file name next to the config file
    pub const FILE_NAME: &'static str = "metadata.json";

    /// Open (or create) the index at `path` and take the single-writer lock.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| StoreError::io("create directory", parent, e))?;
            }
        }

        let lock_path = sibling(&path, "lock");
        let lock = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| StoreError::io("open lock file", &lock_path, e))?;
        lock.try_lock_exclusive()
            .map_err(|_| StoreError::Locked(path.clone()))?;

        let records = if path.exists() {
            Self::read_index(&path)?
        } else {
            HashMap::new()
        };

        tracing::debug!("Opened metadata index {} ({} records)", path.display(), records.len());

        Ok(Self {
            path,
            records: Mutex::new(records),
            _lock: lock,
        })
    }

    /// `<config dir>/tstore/metadata.json`
    pub fn default_path() -> Result<PathBuf> {
        let dir = dirs::config_dir().ok_or_else(|| {
            StoreError::Config("Cannot determine config directory".to_string())
        })?;
        Ok(dir.join("tstore").join(Self::FILE_NAME))
    }

    fn read_index(path: &Path) -> Result<HashMap<String, FileRecord>> {
        let data = fs::read(path).map_err(|e| StoreError::io("read", path, e))?;
        if data.iter().all(u8::is_ascii_whitespace) {
            return Ok(HashMap::new());
        }

        decode_index(&data)
    }

    /// Rewrite the index atomically. Caller holds the records lock.
    async fn save(&self, records: &HashMap<String, FileRecord>) -> Result<()> {
        let mut list: Vec<&FileRecord> = records.values().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        let data = serde_json::to_vec_pretty(&list)?;

        let temp_path = sibling(&self.path, "tmp");

        {
            let mut options = tokio::fs::OpenOptions::new();
            options.write(true).create(true).truncate(true);
            #[cfg(unix)]
            options.mode(0o600);

            let mut file = options
                .open(&temp_path)
                .await
                .map_err(|e| StoreError::io("create", &temp_path, e))?;
            file.write_all(&data)
                .await
                .map_err(|e| StoreError::io("write", &temp_path, e))?;
            file.sync_all()
                .await
                .map_err(|e| StoreError::io("sync", &temp_path, e))?;
        }

        // Atomic rename
        if let Err(e) = tokio::fs::rename(&temp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(StoreError::io("rename", &temp_path, e));
        }

        Ok(())
    }
}

/// Decode a record list, refusing names that escape the sync folder.
fn decode_index(data: &[u8]) -> Result<HashMap<String, FileRecord>> {
    let list: Vec<FileRecord> = serde_json::from_slice(data)?;
    list.into_iter()
        .map(|r| {
            validate_name(&r.name)?;
            Ok((r.name.clone(), r))
        })
        .collect()
}

/// `metadata.json` -> `metadata.json.<suffix>`
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

#[async_trait]
impl MetadataStore for JsonStore {
    async fn create(&self, record: &FileRecord) -> Result<()> {
        validate_name(&record.name)?;
        let mut records = self.records.lock().await;
        if records.contains_key(&record.name) {
            return Err(StoreError::AlreadyExists(record.name.clone()));
        }

        records.insert(record.name.clone(), record.clone());
        if let Err(e) = self.save(&records).await {
            // Keep memory and disk in agreement
            records.remove(&record.name);
            return Err(e);
        }
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<FileRecord> {
        let records = self.records.lock().await;
        records
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    async fn update(&self, record: &FileRecord) -> Result<()> {
        let mut records = self.records.lock().await;
        let previous = match records.get_mut(&record.name) {
            Some(existing) => std::mem::replace(existing, record.clone()),
            None => return Err(StoreError::NotFound(record.name.clone())),
        };

        if let Err(e) = self.save(&records).await {
            records.insert(previous.name.clone(), previous);
            return Err(e);
        }
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let mut records = self.records.lock().await;
        let previous = records
            .remove(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;

        if let Err(e) = self.save(&records).await {
            records.insert(previous.name.clone(), previous);
            return Err(e);
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<FileRecord>> {
        let records = self.records.lock().await;
        let mut list: Vec<FileRecord> = records.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(list)
    }

    async fn load(&self, mut stream: ByteStream) -> Result<usize> {
        let mut data = Vec::new();
        while let Some(part) = stream.next().await {
            data.extend_from_slice(&part?);
        }

        let fresh = decode_index(&data)?;
        let count = fresh.len();

        *self.records.lock().await = fresh;
        tracing::info!("Loaded {} records from backup", count);

        Ok(count)
    }

    async fn persist(&self) -> Result<()> {
        let records = self.records.lock().await;
        self.save(&records).await
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::FileState;
    use bytes::Bytes;
    use chrono::TimeZone;
    use chrono::Utc;
    use tempfile::TempDir;

    fn record(name: &str, state: FileState, chunk_ids: &[&str]) -> FileRecord {
        FileRecord {
            name: name.to_string(),
            state,
            description: format!("{} description", name),
            size: 123,
            checksum: "abc123".to_string(),
            uploaded_at: Utc.with_ymd_and_hms(2025, 5, 6, 15, 30, 0).unwrap(),
            chunk_ids: chunk_ids.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn stream_of(data: &'static [u8]) -> ByteStream {
        Box::pin(futures::stream::iter(vec![Ok(Bytes::from_static(data))]))
    }

    #[tokio::test]
    async fn test_crud_and_persistence() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("metadata.json");
        let store = JsonStore::open(&path).unwrap();

        let rec1 = record("file1.txt", FileState::Local, &["c1"]);
        let rec2 = record("file2.txt", FileState::Cloud, &["x", "y"]);

        store.create(&rec1).await.unwrap();
        assert_eq!(store.get("file1.txt").await.unwrap(), rec1);

        let err = store.create(&rec1).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(ref n) if n == "file1.txt"));

        store.create(&rec2).await.unwrap();
        let list = store.list().await.unwrap();
        assert_eq!(list.len(), 2);

        let mut updated = rec1.clone();
        updated.description = "updated desc".to_string();
        store.update(&updated).await.unwrap();
        assert_eq!(
            store.get("file1.txt").await.unwrap().description,
            "updated desc"
        );

        let missing = record("nope", FileState::Local, &[]);
        assert!(store.update(&missing).await.unwrap_err().is_not_found());

        store.delete("file2.txt").await.unwrap();
        assert!(store.get("file2.txt").await.unwrap_err().is_not_found());
        assert!(store.delete("nope").await.unwrap_err().is_not_found());

        // Release the writer lock before reopening
        drop(store);
        let reopened = JsonStore::open(&path).unwrap();
        assert_eq!(reopened.get("file1.txt").await.unwrap(), updated);
        assert_eq!(reopened.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_get_returns_copy() {
        let tmp = TempDir::new().unwrap();
        let store = JsonStore::open(tmp.path().join("metadata.json")).unwrap();
        store
            .create(&record("a.txt", FileState::Local, &["c1"]))
            .await
            .unwrap();

        let mut copy = store.get("a.txt").await.unwrap();
        copy.description = "changed".to_string();
        copy.chunk_ids.push("c2".to_string());

        let stored = store.get("a.txt").await.unwrap();
        assert_eq!(stored.description, "a.txt description");
        assert_eq!(stored.chunk_ids, vec!["c1".to_string()]);
    }

    #[tokio::test]
    async fn test_second_open_is_locked() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("metadata.json");
        let _store = JsonStore::open(&path).unwrap();

        match JsonStore::open(&path) {
            Err(StoreError::Locked(p)) => assert_eq!(p, path),
            Err(e) => panic!("expected Locked, got {e}"),
            Ok(_) => panic!("expected Locked, got a second writer"),
        }
    }

    #[tokio::test]
    async fn test_no_temp_file_left_behind() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("metadata.json");
        let store = JsonStore::open(&path).unwrap();
        store
            .create(&record("a.txt", FileState::Local, &["c1"]))
            .await
            .unwrap();

        assert!(path.exists());
        assert!(!tmp.path().join("metadata.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_on_disk_shape() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("metadata.json");
        let store = JsonStore::open(&path).unwrap();
        store
            .create(&record("a.txt", FileState::Cloud, &["c1", "c2"]))
            .await
            .unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        let entry = &raw[0];
        assert_eq!(entry["name"], "a.txt");
        assert_eq!(entry["state"], 1);
        assert_eq!(entry["size"], 123);
        assert_eq!(entry["checksum"], "abc123");
        assert!(entry["uploaded_at"].is_string());
        assert_eq!(entry["chunk_ids"], serde_json::json!(["c1", "c2"]));
    }

    #[tokio::test]
    async fn test_load_replaces_everything() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("metadata.json");
        let store = JsonStore::open(&path).unwrap();
        store
            .create(&record("old.txt", FileState::Local, &["c1"]))
            .await
            .unwrap();

        let backup = br#"[
            {"name":"restored.bin","state":1,"description":"","size":9,
             "checksum":"ff","uploaded_at":"2025-05-06T15:30:00Z","chunk_ids":["r1","r2"]}
        ]"#;
        let count = store.load(stream_of(backup)).await.unwrap();
        assert_eq!(count, 1);

        assert!(store.get("old.txt").await.unwrap_err().is_not_found());
        let restored = store.get("restored.bin").await.unwrap();
        assert_eq!(restored.state, FileState::Cloud);
        assert_eq!(restored.chunk_ids, vec!["r1".to_string(), "r2".to_string()]);

        // load does not persist by itself
        let on_disk: Vec<FileRecord> =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(on_disk.len(), 1);
        assert_eq!(on_disk[0].name, "old.txt");
    }

    #[tokio::test]
    async fn test_persist_after_load() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("metadata.json");
        let store = JsonStore::open(&path).unwrap();

        let backup = br#"[{"name":"b.bin","state":0,"size":1,"checksum":"00",
            "uploaded_at":"2025-05-06T15:30:00Z","chunk_ids":["x"]}]"#;
        store.load(stream_of(backup)).await.unwrap();
        store.persist().await.unwrap();

        drop(store);
        let reopened = JsonStore::open(&path).unwrap();
        let record = reopened.get("b.bin").await.unwrap();
        assert_eq!(record.state, FileState::Local);
        assert_eq!(record.description, "");
    }

    #[tokio::test]
    async fn test_load_rejects_escaping_names() {
        let tmp = TempDir::new().unwrap();
        let store = JsonStore::open(tmp.path().join("metadata.json")).unwrap();
        store
            .create(&record("keep.txt", FileState::Local, &["c1"]))
            .await
            .unwrap();

        let backup = br#"[{"name":"../victim.txt","state":0,"size":1,"checksum":"00",
            "uploaded_at":"2025-05-06T15:30:00Z","chunk_ids":["x"]}]"#;
        let err = store.load(stream_of(backup)).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidName(ref n) if n == "../victim.txt"));
        assert!(store.get("keep.txt").await.is_ok());
        assert!(store.get("../victim.txt").await.is_err());
    }

    #[tokio::test]
    async fn test_create_rejects_path_names() {
        let tmp = TempDir::new().unwrap();
        let store = JsonStore::open(tmp.path().join("metadata.json")).unwrap();

        for name in ["a/b.txt", "/etc/passwd", ".."] {
            let err = store
                .create(&record(name, FileState::Local, &["c1"]))
                .await
                .unwrap_err();
            assert!(matches!(err, StoreError::InvalidName(_)));
        }
        assert!(store.list().await.unwrap().is_empty());
    }

    #[test]
    fn test_open_rejects_escaping_names_on_disk() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("metadata.json");
        std::fs::write(
            &path,
            br#"[{"name":"/abs/path","state":0,"size":1,"checksum":"00",
                "uploaded_at":"2025-05-06T15:30:00Z","chunk_ids":["x"]}]"#,
        )
        .unwrap();

        assert!(matches!(
            JsonStore::open(&path),
            Err(StoreError::InvalidName(_))
        ));
    }

    #[tokio::test]
    async fn test_load_rejects_garbage_and_keeps_state() {
        let tmp = TempDir::new().unwrap();
        let store = JsonStore::open(tmp.path().join("metadata.json")).unwrap();
        store
            .create(&record("keep.txt", FileState::Local, &["c1"]))
            .await
            .unwrap();

        assert!(store.load(stream_of(b"not json")).await.is_err());
        assert!(store.get("keep.txt").await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_creates_all_persist() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("metadata.json");
        let store = std::sync::Arc::new(JsonStore::open(&path).unwrap());

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .create(&record(&format!("f{i}.txt"), FileState::Local, &["c"]))
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let on_disk: Vec<FileRecord> =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(on_disk.len(), 16);
    }
}
