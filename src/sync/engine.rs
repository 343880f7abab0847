//! Upload, download and offload orchestration.
//!
//! Upload:   source file -> ChunkStream -> RemoteTransport (in index order)
//!           -> move into sync folder -> record (Local) -> backup scheduled
//! Download: record.chunk_ids -> RemoteTransport::fetch -> `<name>.tmp`
//!           -> rename onto `<sync folder>/<name>` -> state Local
//! Offload:  state Cloud -> immediate backup (rolled back on failure)
//!           -> local copy removed

use crate::backup::BackupScheduler;
use crate::chunk::ChunkStream;
use crate::error::{Result, StoreError};
use crate::metadata::{validate_name, FileRecord, FileState, MetadataStore};
use crate::sync::mover::move_file;
use crate::temp_file::{temp_path_for, TempFileGuard};
use crate::transport::RemoteTransport;
use chrono::Utc;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

/// Engine settings
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Managed folder holding Local files
    pub sync_folder: PathBuf,
    /// Remote chat/channel that receives chunks and backups
    pub destination: String,
    /// Chunk size in bytes
    pub chunk_size: usize,
}

pub struct SyncEngine {
    config: EngineConfig,
    transport: Arc<dyn RemoteTransport>,
    store: Arc<dyn MetadataStore>,
    backup: BackupScheduler,
}

/// Percent of `total` covered by `done`, capped at 100.
fn percent(done: u64, total: u64) -> f64 {
    if total == 0 || done >= total {
        100.0
    } else {
        done as f64 / total as f64 * 100.0
    }
}

/// Forwards byte counts as percentages; [`Progress::finish`] guarantees a closing 100.
struct Progress<F> {
    report: F,
    total: u64,
    done: u64,
    last: f64,
}

impl<F: FnMut(f64)> Progress<F> {
    fn new(report: F, total: u64) -> Self {
        Self {
            report,
            total,
            done: 0,
            last: 0.0,
        }
    }

    fn advance(&mut self, bytes: u64) {
        self.done += bytes;
        self.last = percent(self.done, self.total);
        (self.report)(self.last);
    }

    /// A source that shrank mid-read never reaches `total` by itself.
    fn finish(&mut self) {
        if self.last < 100.0 {
            self.last = 100.0;
            (self.report)(100.0);
        }
    }
}

impl SyncEngine {
    pub fn new(
        config: EngineConfig,
        transport: Arc<dyn RemoteTransport>,
        store: Arc<dyn MetadataStore>,
        backup: BackupScheduler,
    ) -> Self {
        Self {
            config,
            transport,
            store,
            backup,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    pub fn backup(&self) -> &BackupScheduler {
        &self.backup
    }

    /// Location of `name` inside the sync folder.
    ///
    /// Fails with [`StoreError::InvalidName`] for anything but a bare file name,
    /// so a tampered record can never point outside the folder.
    pub fn local_path(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.config.sync_folder.join(name))
    }

    /// Chunk and send `path`, move it into the sync folder and record it.
    ///
    /// `progress` receives the percentage of bytes acknowledged after every
    /// chunk. Nothing is recorded unless every chunk was sent.
    pub async fn upload(
        &self,
        path: &Path,
        mut progress: impl FnMut(f64) + Send,
        cancel: &CancellationToken,
    ) -> Result<FileRecord> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                StoreError::io(
                    "upload",
                    path,
                    std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no file name"),
                )
            })?;

        // Refuse before sending anything; the move below would clobber the tracked copy.
        if self.store.contains(&name).await {
            return Err(StoreError::AlreadyExists(name));
        }
        let dst = self.local_path(&name)?;

        let (mut chunks, size) = ChunkStream::from_file(path, self.config.chunk_size).await?;
        if size == 0 {
            return Err(StoreError::InvalidSize { name, size });
        }

        tracing::info!("Uploading {} ({} bytes)", path.display(), size);

        let mut hasher = blake3::Hasher::new();
        let mut chunk_ids = Vec::new();
        let mut progress = Progress::new(&mut progress, size);

        while let Some(chunk) = chunks.next().await {
            if cancel.is_cancelled() {
                tracing::info!("Upload of {} cancelled at chunk {}", name, chunk.index);
                return Err(StoreError::Cancelled);
            }

            hasher.update(&chunk.data);
            let len = chunk.len() as u64;
            let id = self
                .transport
                .send_chunk(&self.config.destination, chunk.data, chunk.index)
                .await
                .map_err(|e| e.step(format!("send chunk {}", chunk.index)))?;
            tracing::debug!("Sent chunk {} of {} ({} bytes)", chunk.index, name, len);

            chunk_ids.push(id);
            progress.advance(len);
        }

        let read = chunks.finish().await.map_err(|e| e.step("read source"))?;
        if read != size {
            tracing::warn!(
                "{} changed while uploading ({} bytes at open, {} sent)",
                path.display(),
                size,
                read
            );
        }
        progress.finish();

        move_file(path, &dst)
            .await
            .map_err(|e| e.step("move file to sync folder"))?;

        let record = FileRecord {
            name,
            state: FileState::Local,
            description: String::new(),
            size: read,
            checksum: hasher.finalize().to_hex().to_string(),
            uploaded_at: Utc::now(),
            chunk_ids,
        };
        self.store
            .create(&record)
            .await
            .map_err(|e| e.step("save metadata"))?;
        self.backup.schedule();

        tracing::info!(
            "Uploaded {} in {} chunks (blake3 {})",
            record.name,
            record.chunk_ids.len(),
            record.checksum
        );
        Ok(record)
    }

    /// Reassemble `name` into the sync folder and mark it Local.
    ///
    /// On failure the partial temp file is removed and the record is untouched.
    pub async fn download(
        &self,
        name: &str,
        mut progress: impl FnMut(f64) + Send,
        cancel: &CancellationToken,
    ) -> Result<FileRecord> {
        let mut record = self
            .store
            .get(name)
            .await
            .map_err(|e| e.step(format!("lookup {name}")))?;
        if record.size == 0 {
            return Err(StoreError::InvalidSize {
                name: record.name,
                size: record.size,
            });
        }

        let dst = self.local_path(&record.name)?;
        fs::create_dir_all(&self.config.sync_folder)
            .await
            .map_err(|e| StoreError::io("create directory", &self.config.sync_folder, e))?;

        let temp = temp_path_for(&dst);
        let guard = TempFileGuard::new(&temp);
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp)
            .await
            .map_err(|e| StoreError::io("create", &temp, e))?;

        tracing::info!(
            "Downloading {} ({} bytes, {} chunks)",
            record.name,
            record.size,
            record.chunk_ids.len()
        );

        let mut received = 0u64;
        let mut progress = Progress::new(&mut progress, record.size);
        for (index, chunk_id) in record.chunk_ids.iter().enumerate() {
            if cancel.is_cancelled() {
                tracing::info!("Download of {} cancelled at chunk {}", name, index);
                return Err(StoreError::Cancelled);
            }

            let mut stream = self
                .transport
                .fetch(chunk_id)
                .await
                .map_err(|e| e.step(format!("fetch chunk {index}")))?;
            while let Some(part) = stream.next().await {
                let part = part.map_err(|e| e.step(format!("fetch chunk {index}")))?;
                file.write_all(&part)
                    .await
                    .map_err(|e| StoreError::io("write", &temp, e))?;
                received += part.len() as u64;
                progress.advance(part.len() as u64);
            }
            tracing::debug!("Fetched chunk {} of {}", index, record.name);
        }

        if received != record.size {
            return Err(StoreError::transport(format!(
                "{}: received {} bytes, expected {}",
                record.name, received, record.size
            )));
        }

        file.flush()
            .await
            .map_err(|e| StoreError::io("flush", &temp, e))?;
        file.sync_all()
            .await
            .map_err(|e| StoreError::io("sync", &temp, e))?;
        drop(file);

        fs::rename(&temp, &dst)
            .await
            .map_err(|e| StoreError::io("rename", &temp, e))?;
        guard.defuse();

        record.state = FileState::Local;
        self.store
            .update(&record)
            .await
            .map_err(|e| e.step("save metadata"))?;
        self.backup.schedule();

        tracing::info!("Downloaded {} to {}", record.name, dst.display());
        Ok(record)
    }

    /// Drop the local copy of `name`, keeping only the remote chunks.
    ///
    /// The Cloud state is backed up before the file is removed; if the
    /// backup fails the record goes back to its previous state and the file
    /// stays where it is.
    pub async fn offload(&self, name: &str) -> Result<FileRecord> {
        let path = self.local_path(name)?;
        let previous = self
            .store
            .get(name)
            .await
            .map_err(|e| e.step(format!("lookup {name}")))?;

        let mut record = previous.clone();
        record.state = FileState::Cloud;
        self.store
            .update(&record)
            .await
            .map_err(|e| e.step("save metadata"))?;

        if let Err(e) = self.backup.backup_now().await {
            tracing::warn!("Backup failed while offloading {}, rolling back", name);
            self.restore_state(name, previous.state).await;
            return Err(e.step("backup"));
        }

        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("{} already absent", path.display());
            }
            Err(e) => return Err(StoreError::io("remove", &path, e)),
        }

        tracing::info!("Offloaded {}", name);
        Ok(record)
    }

    /// Put back only the state of `name`; other fields may have changed meanwhile.
    async fn restore_state(&self, name: &str, state: FileState) {
        let mut current = match self.store.get(name).await {
            Ok(record) => record,
            Err(e) => {
                tracing::error!("Rollback of {} failed: {}", name, e);
                return;
            }
        };
        current.state = state;
        if let Err(e) = self.store.update(&current).await {
            tracing::error!("Rollback of {} failed: {}", name, e);
        }
    }

    /// Forget `name`. Remote chunks are left in place.
    pub async fn delete(&self, name: &str) -> Result<()> {
        self.store.delete(name).await?;
        self.backup.schedule();
        tracing::info!("Deleted record {}", name);
        Ok(())
    }

    pub async fn update_description(&self, name: &str, description: &str) -> Result<FileRecord> {
        let mut record = self
            .store
            .get(name)
            .await
            .map_err(|e| e.step(format!("lookup {name}")))?;
        record.description = description.to_string();
        self.store
            .update(&record)
            .await
            .map_err(|e| e.step("update metadata"))?;
        self.backup.schedule();
        Ok(record)
    }

    pub async fn list(&self) -> Result<Vec<FileRecord>> {
        self.store.list().await
    }

    /// Replace the local index with the pinned remote backup.
    ///
    /// Returns `Ok(None)` when the destination has no pinned backup.
    pub async fn restore(&self) -> Result<Option<usize>> {
        let chunk_id = match self
            .transport
            .pinned_chunk_id(&self.config.destination)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!("No pinned metadata backup: {}", e);
                return Ok(None);
            }
        };

        let stream = self
            .transport
            .fetch(&chunk_id)
            .await
            .map_err(|e| e.step("fetch metadata backup"))?;
        let count = self
            .store
            .load(stream)
            .await
            .map_err(|e| e.step("load metadata backup"))?;
        Ok(Some(count))
    }
}
