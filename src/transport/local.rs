//! Directory-backed transport.
//!
//! Layout under the root:
//!
//! ```text
//! objects/<blake3 hex>            payloads (chunks and files)
//! <destination>/messages/<id>.json
//! <destination>/pinned.json       pinned message ids, oldest first
//! ```

use crate::error::{Result, StoreError};
use crate::temp_file::temp_path_for;
use crate::transport::{content_id, ByteStream, MessageId, RemoteTransport};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_util::io::ReaderStream;

/// Read buffer for fetch streams (64KB)
const FETCH_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Message {
    id: MessageId,
    chunk_id: Option<String>,
    file_name: Option<String>,
    caption: String,
    sent_at: DateTime<Utc>,
}

pub struct LocalDirTransport {
    root: PathBuf,
    // Serializes message id allocation and pin list edits
    messages: Mutex<()>,
}

impl LocalDirTransport {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let objects = root.join("objects");
        fs::create_dir_all(&objects)
            .await
            .map_err(|e| StoreError::io("create directory", &objects, e))?;

        Ok(Self {
            root,
            messages: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, chunk_id: &str) -> Result<PathBuf> {
        if chunk_id.is_empty() || !chunk_id.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StoreError::transport(format!("invalid chunk id: {chunk_id}")));
        }
        Ok(self.root.join("objects").join(chunk_id))
    }

    fn destination_dir(&self, destination: &str) -> Result<PathBuf> {
        let mut components = Path::new(destination).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) if destination != "objects" => {
                Ok(self.root.join(destination))
            }
            _ => Err(StoreError::transport(format!(
                "invalid destination: {destination}"
            ))),
        }
    }

    async fn put_object(&self, data: &[u8]) -> Result<String> {
        let id = content_id(data);
        let path = self.object_path(&id)?;
        if fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(id);
        }

        write_atomic(&path, data).await?;
        Ok(id)
    }

    async fn read_pins(&self, dir: &Path) -> Result<Vec<MessageId>> {
        let path = dir.join("pinned.json");
        match fs::read(&path).await {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(StoreError::io("read", &path, e)),
        }
    }

    async fn write_pins(&self, dir: &Path, pins: &[MessageId]) -> Result<()> {
        write_atomic(&dir.join("pinned.json"), &serde_json::to_vec(pins)?).await
    }

    async fn read_message(&self, dir: &Path, id: MessageId) -> Result<Message> {
        let path = dir.join("messages").join(format!("{id}.json"));
        match fs::read(&path).await {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::transport(format!("message {id} not found")))
            }
            Err(e) => Err(StoreError::io("read", &path, e)),
        }
    }

    async fn next_message_id(&self, messages_dir: &Path) -> Result<MessageId> {
        let mut max = 0;
        let mut entries = match fs::read_dir(messages_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(1),
            Err(e) => return Err(StoreError::io("list", messages_dir, e)),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io("list", messages_dir, e))?
        {
            let name = entry.file_name();
            let id = name
                .to_string_lossy()
                .strip_suffix(".json")
                .and_then(|s| s.parse::<MessageId>().ok());
            if let Some(id) = id {
                max = max.max(id);
            }
        }
        Ok(max + 1)
    }
}

async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::io("create directory", parent, e))?;
    }

    let temp = temp_path_for(path);

    let mut file = fs::File::create(&temp)
        .await
        .map_err(|e| StoreError::io("create", &temp, e))?;
    file.write_all(data)
        .await
        .map_err(|e| StoreError::io("write", &temp, e))?;
    file.sync_all()
        .await
        .map_err(|e| StoreError::io("sync", &temp, e))?;
    drop(file);

    fs::rename(&temp, path)
        .await
        .map_err(|e| StoreError::io("rename", &temp, e))
}

#[async_trait]
impl RemoteTransport for LocalDirTransport {
    async fn send_chunk(&self, destination: &str, data: Bytes, index: usize) -> Result<String> {
        self.destination_dir(destination)?;
        let id = self.put_object(&data).await?;
        tracing::trace!("stored chunk {} ({} bytes) as {}", index, data.len(), id);
        Ok(id)
    }

    async fn fetch(&self, chunk_id: &str) -> Result<ByteStream> {
        let path = self.object_path(chunk_id)?;
        let file = match fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::transport(format!("chunk {chunk_id} not found")));
            }
            Err(e) => return Err(StoreError::io("open", &path, e)),
        };

        let stream = ReaderStream::with_capacity(file, FETCH_BUFFER_SIZE)
            .map(move |r| r.map_err(StoreError::from));
        Ok(Box::pin(stream))
    }

    async fn send_file(
        &self,
        destination: &str,
        path: &Path,
        caption: &str,
    ) -> Result<(MessageId, String)> {
        let dir = self.destination_dir(destination)?;
        let data = fs::read(path)
            .await
            .map_err(|e| StoreError::io("read", path, e))?;
        let chunk_id = self.put_object(&data).await?;

        let _guard = self.messages.lock().await;
        let messages_dir = dir.join("messages");
        let id = self.next_message_id(&messages_dir).await?;
        let message = Message {
            id,
            chunk_id: Some(chunk_id.clone()),
            file_name: path.file_name().map(|n| n.to_string_lossy().into_owned()),
            caption: caption.to_string(),
            sent_at: Utc::now(),
        };
        write_atomic(
            &messages_dir.join(format!("{id}.json")),
            &serde_json::to_vec_pretty(&message)?,
        )
        .await?;

        Ok((id, chunk_id))
    }

    async fn pin(&self, destination: &str, message_id: MessageId) -> Result<()> {
        let dir = self.destination_dir(destination)?;
        let _guard = self.messages.lock().await;
        self.read_message(&dir, message_id).await?;

        let mut pins = self.read_pins(&dir).await?;
        pins.retain(|id| *id != message_id);
        pins.push(message_id);
        self.write_pins(&dir, &pins).await
    }

    async fn unpin(&self, destination: &str, message_id: MessageId) -> Result<()> {
        let dir = self.destination_dir(destination)?;
        let _guard = self.messages.lock().await;

        let mut pins = self.read_pins(&dir).await?;
        let before = pins.len();
        pins.retain(|id| *id != message_id);
        if pins.len() == before {
            return Err(StoreError::transport(format!(
                "message {message_id} is not pinned"
            )));
        }
        self.write_pins(&dir, &pins).await
    }

    async fn pinned_chunk_id(&self, destination: &str) -> Result<String> {
        let dir = self.destination_dir(destination)?;
        let _guard = self.messages.lock().await;

        let pins = self.read_pins(&dir).await?;
        let latest = pins
            .last()
            .ok_or_else(|| StoreError::transport("no pinned message"))?;
        self.read_message(&dir, *latest)
            .await?
            .chunk_id
            .ok_or_else(|| StoreError::transport("pinned message has no attached payload"))
    }
}
