//! File records and the metadata store that indexes them.

pub mod json_store;

pub use json_store::JsonStore;

use crate::error::{Result, StoreError};
use crate::transport::ByteStream;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::path::{Component, Path};

/// Where a file's bytes currently live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileState {
    /// Bytes exist in the managed sync folder
    Local,
    /// Bytes exist only as remote chunks
    Cloud,
}

impl FileState {
    fn as_u8(self) -> u8 {
        match self {
            FileState::Local => 0,
            FileState::Cloud => 1,
        }
    }

    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(FileState::Local),
            1 => Some(FileState::Cloud),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileState::Local => "local",
            FileState::Cloud => "cloud",
        }
    }
}

// Encoded as 0/1 so remote backups stay readable by older clients.
impl Serialize for FileState {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for FileState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let v = u8::deserialize(deserializer)?;
        FileState::from_u8(v).ok_or_else(|| de::Error::custom(format!("invalid file state {v}")))
    }
}

/// One tracked file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Base name inside the sync folder; primary key
    pub name: String,
    pub state: FileState,
    #[serde(default)]
    pub description: String,
    /// Total byte length at upload time
    pub size: u64,
    /// Hex blake3 of the chunked bytes
    pub checksum: String,
    pub uploaded_at: DateTime<Utc>,
    /// Remote ids in chunk order
    pub chunk_ids: Vec<String>,
}

/// Record names are bare file names inside the sync folder.
///
/// Rejects empty names, separators, `.`/`..` and absolute or prefixed paths,
/// so a name can never address anything outside the folder.
pub fn validate_name(name: &str) -> Result<()> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(part)), None)
            if part == name && !name.contains(['/', '\\']) =>
        {
            Ok(())
        }
        _ => Err(StoreError::InvalidName(name.to_string())),
    }
}

/// Persistent name -> record mapping.
///
/// Every mutating call persists the whole index before returning.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Insert a new record. Fails with `AlreadyExists` if the name is taken
    /// and `InvalidName` if it is not a bare file name.
    async fn create(&self, record: &FileRecord) -> Result<()>;

    /// Copy of the record. Fails with `NotFound`.
    async fn get(&self, name: &str) -> Result<FileRecord>;

    /// Replace an existing record. Fails with `NotFound`.
    async fn update(&self, record: &FileRecord) -> Result<()>;

    /// Remove a record. Fails with `NotFound`.
    async fn delete(&self, name: &str) -> Result<()>;

    /// Snapshot of every record.
    async fn list(&self) -> Result<Vec<FileRecord>>;

    /// Replace the whole index with the records decoded from `stream`.
    ///
    /// The whole stream is rejected if any record has an invalid name.
    ///
    /// Nothing is written locally until the next mutation. Returns the record count.
    async fn load(&self, stream: ByteStream) -> Result<usize>;

    /// Write the current index to disk without changing it.
    async fn persist(&self) -> Result<()>;

    /// Location of the persisted index.
    fn path(&self) -> &Path;

    /// Whether `name` is tracked.
    async fn contains(&self, name: &str) -> bool {
        self.get(name).await.is_ok()
    }
}
