//! Wires config, store, transport, backup scheduler, engine and watcher.

use crate::backup::BackupScheduler;
use crate::config::Config;
use crate::error::Result;
use crate::metadata::{FileRecord, JsonStore, MetadataStore};
use crate::sync::{EngineConfig, SyncEngine};
use crate::transport::{LocalDirTransport, RemoteTransport};
use std::sync::Arc;

#[cfg(feature = "watch")]
use crate::watcher::{FolderWatcher, WatchHandler};
#[cfg(feature = "watch")]
use std::path::PathBuf;
#[cfg(feature = "watch")]
use tokio::task::JoinHandle;
#[cfg(feature = "watch")]
use tokio_util::sync::CancellationToken;

pub struct App {
    config: Config,
    engine: Arc<SyncEngine>,
}

impl App {
    /// Open the index and the directory-backed remote named by `config`.
    pub async fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(JsonStore::open(config.metadata_path()?)?);
        let transport = Arc::new(LocalDirTransport::open(&config.remote_dir).await?);
        Ok(Self::with_parts(config, transport, store))
    }

    /// Assemble from an already-open transport and store.
    pub fn with_parts(
        config: Config,
        transport: Arc<dyn RemoteTransport>,
        store: Arc<dyn MetadataStore>,
    ) -> Self {
        let backup = BackupScheduler::new(
            transport.clone(),
            store.clone(),
            config.destination.clone(),
            config.backup_debounce(),
        );
        let engine = SyncEngine::new(
            EngineConfig {
                sync_folder: config.sync_folder.clone(),
                destination: config.destination.clone(),
                chunk_size: config.chunk_size,
            },
            transport,
            store,
            backup,
        );
        Self {
            config,
            engine: Arc::new(engine),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Replace the local index with the pinned remote backup, if there is one.
    pub async fn bootstrap(&self) -> Result<()> {
        match self.engine.restore().await? {
            Some(count) => tracing::info!("Restored {} records from remote backup", count),
            None => tracing::info!("No remote backup, starting from the local index"),
        }
        Ok(())
    }

    pub async fn update_description(&self, name: &str, text: &str) -> Result<FileRecord> {
        self.engine.update_description(name, text).await
    }

    /// Watch the sync folder, uploading new files as they settle.
    #[cfg(feature = "watch")]
    pub fn watch(&self, cancel: CancellationToken) -> Result<JoinHandle<()>> {
        let bridge = Arc::new(WatchBridge {
            engine: self.engine.clone(),
            cancel: cancel.clone(),
        });
        let watcher = FolderWatcher::new(
            self.config.sync_folder.clone(),
            self.engine.store().clone(),
            bridge,
            self.config.stability_delay(),
        );
        watcher.spawn(cancel)
    }

    /// Flush any pending backup.
    pub async fn shutdown(&self) -> Result<()> {
        self.engine.backup().shutdown().await
    }
}

/// Routes watcher decisions into the engine.
#[cfg(feature = "watch")]
struct WatchBridge {
    engine: Arc<SyncEngine>,
    cancel: CancellationToken,
}

#[cfg(feature = "watch")]
#[async_trait::async_trait]
impl WatchHandler for WatchBridge {
    async fn file_detected(&self, path: PathBuf, name: String) {
        let result = self
            .engine
            .upload(
                &path,
                |p| tracing::debug!("{}: {:.1}%", name, p),
                &self.cancel,
            )
            .await;

        match result {
            Ok(record) => tracing::info!("Uploaded {} ({} bytes)", record.name, record.size),
            Err(e) if e.is_cancelled() => tracing::info!("Upload of {} cancelled", name),
            Err(e) if e.is_already_exists() => tracing::debug!("{} already tracked", name),
            Err(e) => tracing::error!("Failed to upload {}: {}", path.display(), e),
        }
    }

    async fn file_renamed(&self, _old_name: String, _new_name: String) {
        self.engine.backup().schedule();
    }

    async fn file_removed(&self, _name: String) {
        self.engine.backup().schedule();
    }
}
