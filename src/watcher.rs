//! Sync folder watcher.
//!
//! OS events are reduced to [`WatchEvent`]s and applied one at a time under a
//! single state lock:
//!
//! - `Created`/`Written` on an untracked file (re)arms a stability timer; when
//!   it expires the handler gets `file_detected`.
//! - `Renamed` on a tracked file parks its name; the next `Created` completes
//!   the rename transaction in the store.
//! - `Removed` on a tracked file marks it Cloud.
//!
//! `.tmp` paths never reach any of this.

use crate::error::Result;
use crate::metadata::{FileState, MetadataStore};
use crate::temp_file::is_temp_path;
use async_trait::async_trait;
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Quiet period a new file must survive before it is handed on
pub const STABILITY_DELAY: Duration = Duration::from_secs(1);

/// How long the source half of a rename waits for its destination half.
/// A tracked file moved out of the folder never gets one.
pub const RENAME_WINDOW: Duration = Duration::from_millis(500);

/// Filesystem change, reduced to what the watcher acts on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Created(PathBuf),
    Written(PathBuf),
    /// Source half of a rename
    Renamed(PathBuf),
    Removed(PathBuf),
}

impl WatchEvent {
    pub fn path(&self) -> &Path {
        match self {
            WatchEvent::Created(p)
            | WatchEvent::Written(p)
            | WatchEvent::Renamed(p)
            | WatchEvent::Removed(p) => p,
        }
    }
}

/// Receives the watcher's decisions.
#[async_trait]
pub trait WatchHandler: Send + Sync {
    /// A new untracked file has been stable for the stability delay.
    async fn file_detected(&self, path: PathBuf, name: String);

    /// A tracked file was renamed and its record moved to `new_name`.
    async fn file_renamed(&self, _old_name: String, _new_name: String) {}

    /// A tracked file was removed from the sync folder and marked Cloud.
    async fn file_removed(&self, _name: String) {}
}

#[derive(Default)]
struct WatchState {
    // path -> (generation, timer)
    timers: HashMap<PathBuf, (u64, JoinHandle<()>)>,
    next_generation: u64,
    // Old name and when its rename-from arrived
    pending_rename: Option<(String, Instant)>,
}

impl WatchState {
    /// Take the parked rename unless it has outlived [`RENAME_WINDOW`].
    fn take_rename(&mut self) -> Option<String> {
        match self.pending_rename.take() {
            Some((name, at)) if at.elapsed() <= RENAME_WINDOW => Some(name),
            Some((name, _)) => {
                tracing::debug!("{} left the folder; dropping pending rename", name);
                None
            }
            None => None,
        }
    }

    fn cancel_timer(&mut self, path: &Path) -> bool {
        match self.timers.remove(path) {
            Some((_, timer)) => {
                timer.abort();
                true
            }
            None => false,
        }
    }
}

struct Inner {
    root: PathBuf,
    store: Arc<dyn MetadataStore>,
    handler: Arc<dyn WatchHandler>,
    stability_delay: Duration,
    state: Mutex<WatchState>,
}

#[derive(Clone)]
pub struct FolderWatcher {
    inner: Arc<Inner>,
}

fn base_name(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}

async fn is_regular_file(path: &Path) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(meta) => meta.is_file(),
        Err(e) => {
            tracing::debug!("Skipping {}: {}", path.display(), e);
            false
        }
    }
}

/// Map one notify event onto the events the watcher acts on.
pub fn classify(event: &notify::Event) -> Vec<WatchEvent> {
    let paths = event.paths.iter().cloned();
    match &event.kind {
        EventKind::Create(_) => paths.map(WatchEvent::Created).collect(),
        EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any) => {
            paths.map(WatchEvent::Written).collect()
        }
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::From => paths.map(WatchEvent::Renamed).collect(),
            RenameMode::To => paths.map(WatchEvent::Created).collect(),
            // inotify also reports From and To separately
            RenameMode::Both => Vec::new(),
            RenameMode::Any | RenameMode::Other => paths
                .map(|p| {
                    if p.exists() {
                        WatchEvent::Created(p)
                    } else {
                        WatchEvent::Renamed(p)
                    }
                })
                .collect(),
        },
        EventKind::Remove(_) => paths.map(WatchEvent::Removed).collect(),
        _ => Vec::new(),
    }
}

impl FolderWatcher {
    pub fn new(
        root: impl Into<PathBuf>,
        store: Arc<dyn MetadataStore>,
        handler: Arc<dyn WatchHandler>,
        stability_delay: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                root: root.into(),
                store,
                handler,
                stability_delay,
                state: Mutex::new(WatchState::default()),
            }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Paths with a stability timer running.
    pub async fn pending_paths(&self) -> Vec<PathBuf> {
        self.inner.state.lock().await.timers.keys().cloned().collect()
    }

    /// Start watching the root. The returned task ends when `cancel` fires.
    pub fn spawn(&self, cancel: CancellationToken) -> Result<JoinHandle<()>> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })?;
        watcher.watch(&self.inner.root, RecursiveMode::NonRecursive)?;

        tracing::info!("Watching {}", self.inner.root.display());

        let this = self.clone();
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Some(Ok(event)) => {
                            for ev in classify(&event) {
                                this.handle_event(ev).await;
                            }
                        }
                        Some(Err(e)) => {
                            tracing::error!("Watch error on {}: {}", this.inner.root.display(), e);
                        }
                        None => {
                            tracing::warn!("Watcher channel closed for {}", this.inner.root.display());
                            break;
                        }
                    },
                }
            }

            drop(watcher);
            let mut state = this.inner.state.lock().await;
            for (_, (_, timer)) in state.timers.drain() {
                timer.abort();
            }
            tracing::info!("Stopped watching {}", this.inner.root.display());
        }))
    }

    /// Apply one event.
    pub async fn handle_event(&self, event: WatchEvent) {
        if is_temp_path(event.path()) {
            return;
        }
        let Some(name) = base_name(event.path()) else {
            return;
        };

        match event {
            WatchEvent::Created(path) => {
                // Directories and vanished paths must not consume a pending rename
                if !is_regular_file(&path).await {
                    return;
                }
                let pending = self.inner.state.lock().await.take_rename();
                match pending {
                    Some(old) => self.finish_rename(old, name).await,
                    None => self.file_changed(path, name).await,
                }
            }
            WatchEvent::Written(path) => {
                if is_regular_file(&path).await {
                    self.file_changed(path, name).await;
                }
            }
            WatchEvent::Renamed(path) => {
                let mut state = self.inner.state.lock().await;
                state.cancel_timer(&path);
                if self.inner.store.contains(&name).await {
                    tracing::debug!("Rename pending for {}", name);
                    state.pending_rename = Some((name, Instant::now()));
                }
            }
            WatchEvent::Removed(path) => {
                self.inner.state.lock().await.cancel_timer(&path);
                self.file_removed(name).await;
            }
        }
    }

    async fn file_changed(&self, path: PathBuf, name: String) {
        let mut state = self.inner.state.lock().await;
        if self.inner.store.contains(&name).await {
            // Tracked files are never re-uploaded behind the user's back
            return;
        }

        state.cancel_timer(&path);
        state.next_generation += 1;
        let generation = state.next_generation;

        let this = self.clone();
        let timer_path = path.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(this.inner.stability_delay).await;
            this.timer_fired(timer_path, name, generation).await;
        });
        state.timers.insert(path, (generation, timer));
    }

    async fn timer_fired(&self, path: PathBuf, name: String, generation: u64) {
        {
            let mut state = self.inner.state.lock().await;
            match state.timers.get(&path) {
                Some((current, _)) if *current == generation => {
                    state.timers.remove(&path);
                }
                _ => return,
            }
        }

        // The upload moves a file into this folder, which shows up as a create
        if self.inner.store.contains(&name).await {
            return;
        }
        if !path.is_file() {
            tracing::debug!("{} vanished before it settled", path.display());
            return;
        }

        tracing::info!("Detected new file {}", path.display());
        self.inner.handler.file_detected(path, name).await;
    }

    async fn finish_rename(&self, old: String, new: String) {
        if old == new {
            return;
        }
        let store = &self.inner.store;

        let record = match store.get(&old).await {
            Ok(record) => record,
            Err(e) => {
                tracing::error!("Rename {} -> {}: {}", old, new, e);
                return;
            }
        };

        let mut renamed = record.clone();
        renamed.name = new.clone();
        if let Err(e) = store.create(&renamed).await {
            tracing::error!("Rename {} -> {}: {}", old, new, e);
            return;
        }
        if let Err(e) = store.delete(&old).await {
            tracing::error!("Rename {} -> {}: {}", old, new, e);
            if let Err(e) = store.delete(&new).await {
                tracing::error!("Failed to undo rename {} -> {}: {}", old, new, e);
            }
            return;
        }

        tracing::info!("Renamed {} -> {}", old, new);
        self.inner.handler.file_renamed(old, new).await;
    }

    async fn file_removed(&self, name: String) {
        let store = &self.inner.store;
        let mut record = match store.get(&name).await {
            Ok(record) => record,
            Err(_) => return,
        };
        if record.state == FileState::Cloud {
            // Offload already did this
            return;
        }

        record.state = FileState::Cloud;
        if let Err(e) = store.update(&record).await {
            tracing::error!("Failed to mark {} as cloud: {}", name, e);
            return;
        }

        tracing::info!("{} removed locally, kept in cloud", name);
        self.inner.handler.file_removed(name).await;
    }
}
