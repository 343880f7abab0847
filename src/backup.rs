//! Debounced remote backup of the metadata index.
//!
//! Every mutation calls [`BackupScheduler::schedule`]; a burst of calls
//! collapses into one push fired `debounce` after the last call. A push sends
//! the index file as a message and pins it, so a cold start can find it.

use crate::error::Result;
use crate::metadata::MetadataStore;
use crate::transport::{MessageId, RemoteTransport};
use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Default quiet period before a backup push
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(60);

#[derive(Default)]
struct Pending {
    // Bumped on every schedule/cancel; a firing timer only proceeds if it
    // still owns the current generation.
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

struct Inner {
    transport: Arc<dyn RemoteTransport>,
    store: Arc<dyn MetadataStore>,
    destination: String,
    debounce: Duration,
    pending: Mutex<Pending>,
    // Serializes pushes and remembers what we pinned last
    last_pinned: tokio::sync::Mutex<Option<MessageId>>,
}

#[derive(Clone)]
pub struct BackupScheduler {
    inner: Arc<Inner>,
}

impl BackupScheduler {
    pub fn new(
        transport: Arc<dyn RemoteTransport>,
        store: Arc<dyn MetadataStore>,
        destination: impl Into<String>,
        debounce: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                store,
                destination: destination.into(),
                debounce,
                pending: Mutex::new(Pending::default()),
                last_pinned: tokio::sync::Mutex::new(None),
            }),
        }
    }

    fn pending(&self) -> MutexGuard<'_, Pending> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Whether a debounced push is waiting to fire.
    pub fn is_pending(&self) -> bool {
        self.pending().timer.is_some()
    }

    /// Request a backup. Resets the timer if one is already pending.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn schedule(&self) {
        let mut pending = self.pending();
        if let Some(timer) = pending.timer.take() {
            timer.abort();
        }
        pending.generation += 1;
        let generation = pending.generation;

        let this = self.clone();
        pending.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(this.inner.debounce).await;

            {
                let mut pending = this.pending();
                if pending.generation != generation {
                    return;
                }
                pending.timer = None;
            }

            match this.backup_now().await {
                Ok(id) => tracing::info!("Metadata backed up (message {})", id),
                Err(e) => tracing::error!("Metadata backup failed: {}", e),
            }
        }));

        tracing::debug!("Backup scheduled in {:?}", self.inner.debounce);
    }

    /// Push the index right away and pin it. Unpins the previous backup.
    pub async fn backup_now(&self) -> Result<MessageId> {
        let mut last_pinned = self.inner.last_pinned.lock().await;
        let transport = &self.inner.transport;
        let destination = &self.inner.destination;

        let caption = format!("tstore metadata backup {}", Utc::now().to_rfc3339());
        let (message_id, _) = transport
            .send_file(destination, self.inner.store.path(), &caption)
            .await
            .map_err(|e| e.step("send metadata backup"))?;
        transport
            .pin(destination, message_id)
            .await
            .map_err(|e| e.step("pin metadata backup"))?;

        if let Some(previous) = last_pinned.replace(message_id) {
            if previous != message_id {
                if let Err(e) = transport.unpin(destination, previous).await {
                    tracing::warn!("Failed to unpin previous backup {}: {}", previous, e);
                }
            }
        }

        Ok(message_id)
    }

    /// Replace a pending timer with an immediate push.
    ///
    /// Also waits for a push that is already in flight.
    pub async fn shutdown(&self) -> Result<()> {
        let timer = {
            let mut pending = self.pending();
            pending.generation += 1;
            pending.timer.take()
        };

        match timer {
            Some(timer) => {
                timer.abort();
                tracing::info!("Flushing pending metadata backup");
                self.backup_now().await?;
            }
            None => {
                let _ = self.inner.last_pinned.lock().await;
            }
        }
        Ok(())
    }
}
