//! In-process transport.
//!
//! Keeps everything in memory, counts calls and can be told to fail specific
//! operations. Used by tests and dry runs.

use crate::error::{Result, StoreError};
use crate::transport::{content_id, ByteStream, MessageId, RemoteTransport};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct State {
    objects: HashMap<String, Bytes>,
    // message id -> payload id
    messages: HashMap<MessageId, String>,
    pinned: HashMap<String, Vec<MessageId>>,
    next_message: MessageId,

    chunk_sends: usize,
    file_sends: usize,
    fetches: usize,

    fail_chunk_index: Option<usize>,
    fail_file_sends: bool,
    fail_fetch_id: Option<String>,
}

#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<State>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail every `send_chunk` for chunk `index`.
    pub fn fail_chunk_send_at(&self, index: usize) {
        self.state().fail_chunk_index = Some(index);
    }

    /// Fail (or stop failing) every `send_file`.
    pub fn fail_file_sends(&self, fail: bool) {
        self.state().fail_file_sends = fail;
    }

    /// Fail every fetch of `chunk_id`.
    pub fn fail_fetch_of(&self, chunk_id: impl Into<String>) {
        self.state().fail_fetch_id = Some(chunk_id.into());
    }

    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.fail_chunk_index = None;
        state.fail_file_sends = false;
        state.fail_fetch_id = None;
    }

    pub fn chunk_sends(&self) -> usize {
        self.state().chunk_sends
    }

    pub fn file_sends(&self) -> usize {
        self.state().file_sends
    }

    pub fn fetches(&self) -> usize {
        self.state().fetches
    }

    pub fn object(&self, id: &str) -> Option<Bytes> {
        self.state().objects.get(id).cloned()
    }

    /// Pinned message ids for `destination`, oldest first.
    pub fn pinned(&self, destination: &str) -> Vec<MessageId> {
        self.state()
            .pinned
            .get(destination)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl RemoteTransport for MemoryTransport {
    async fn send_chunk(&self, _destination: &str, data: Bytes, index: usize) -> Result<String> {
        let mut state = self.state();
        if state.fail_chunk_index == Some(index) {
            return Err(StoreError::transport(format!("injected failure at chunk {index}")));
        }

        state.chunk_sends += 1;
        let id = content_id(&data);
        state.objects.insert(id.clone(), data);
        Ok(id)
    }

    async fn fetch(&self, chunk_id: &str) -> Result<ByteStream> {
        let data = {
            let mut state = self.state();
            if state.fail_fetch_id.as_deref() == Some(chunk_id) {
                return Err(StoreError::transport(format!(
                    "injected failure fetching {chunk_id}"
                )));
            }
            state.fetches += 1;
            state
                .objects
                .get(chunk_id)
                .cloned()
                .ok_or_else(|| StoreError::transport(format!("chunk {chunk_id} not found")))?
        };

        // Two parts, so consumers see a multi-piece stream
        let mid = data.len() / 2;
        let parts = vec![Ok(data.slice(..mid)), Ok(data.slice(mid..))];
        Ok(Box::pin(futures::stream::iter(parts)))
    }

    async fn send_file(
        &self,
        destination: &str,
        path: &Path,
        _caption: &str,
    ) -> Result<(MessageId, String)> {
        if self.state().fail_file_sends {
            return Err(StoreError::transport(format!(
                "injected failure sending file to {destination}"
            )));
        }

        let data = std::fs::read(path).map_err(|e| StoreError::io("read", path, e))?;

        let mut state = self.state();
        state.file_sends += 1;
        state.next_message += 1;
        let message_id = state.next_message;
        let id = content_id(&data);
        state.objects.insert(id.clone(), Bytes::from(data));
        state.messages.insert(message_id, id.clone());
        Ok((message_id, id))
    }

    async fn pin(&self, destination: &str, message_id: MessageId) -> Result<()> {
        let mut state = self.state();
        if !state.messages.contains_key(&message_id) {
            return Err(StoreError::transport(format!("message {message_id} not found")));
        }
        let pins = state.pinned.entry(destination.to_string()).or_default();
        pins.retain(|id| *id != message_id);
        pins.push(message_id);
        Ok(())
    }

    async fn unpin(&self, destination: &str, message_id: MessageId) -> Result<()> {
        let mut state = self.state();
        let pins = state.pinned.entry(destination.to_string()).or_default();
        let before = pins.len();
        pins.retain(|id| *id != message_id);
        if pins.len() == before {
            return Err(StoreError::transport(format!(
                "message {message_id} is not pinned"
            )));
        }
        Ok(())
    }

    async fn pinned_chunk_id(&self, destination: &str) -> Result<String> {
        let state = self.state();
        let latest = state
            .pinned
            .get(destination)
            .and_then(|pins| pins.last())
            .ok_or_else(|| StoreError::transport("no pinned message"))?;
        state
            .messages
            .get(latest)
            .cloned()
            .ok_or_else(|| StoreError::transport("pinned message has no attached payload"))
    }
}
