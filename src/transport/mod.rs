//! Remote transport abstraction.
//!
//! The remote side is a messaging backend: payloads are posted as messages
//! into a destination (a chat), each attached payload gets an opaque id, and
//! one message per destination can be pinned as the "latest" pointer.

pub mod local;
pub mod memory;

pub use local::LocalDirTransport;
pub use memory::MemoryTransport;

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::path::Path;
use std::pin::Pin;

/// A boxed stream of bytes for streaming reads.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Message identifier within a destination
pub type MessageId = i64;

#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Post one chunk; returns the id used to fetch it back.
    async fn send_chunk(&self, destination: &str, data: Bytes, index: usize) -> Result<String>;

    /// Stream the payload stored under `chunk_id`.
    async fn fetch(&self, chunk_id: &str) -> Result<ByteStream>;

    /// Post a local file as a message. Returns (message id, payload id).
    async fn send_file(
        &self,
        destination: &str,
        path: &Path,
        caption: &str,
    ) -> Result<(MessageId, String)>;

    async fn pin(&self, destination: &str, message_id: MessageId) -> Result<()>;

    async fn unpin(&self, destination: &str, message_id: MessageId) -> Result<()>;

    /// Payload id of the most recently pinned message.
    ///
    /// Fails if nothing is pinned or the pinned message carries no payload.
    async fn pinned_chunk_id(&self, destination: &str) -> Result<String>;
}

/// Content id used by the bundled transports.
pub(crate) fn content_id(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}
