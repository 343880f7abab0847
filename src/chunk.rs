//! Chunk stream: splits a byte source into ordered fixed-size chunks.
//!
//! A reader task fills a bounded channel while the consumer drains it, so
//! reading the next chunk overlaps with sending the current one. Read
//! failures are reported by [`ChunkStream::finish`], never through the
//! chunk channel itself.

use crate::error::{Result, StoreError};
use bytes::{Bytes, BytesMut};
use std::io;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Default chunk size (5MB)
pub const DEFAULT_CHUNK_SIZE: usize = 5 * 1024 * 1024;

/// Chunks buffered between the reader task and the consumer
pub const CHUNK_CHANNEL_SIZE: usize = 4;

/// One contiguous slice of the source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Zero-based position in the source
    pub index: usize,
    /// Exactly `chunk_size` bytes, except for a shorter final chunk
    pub data: Bytes,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Lazy, single-use sequence of chunks.
pub struct ChunkStream {
    rx: mpsc::Receiver<Chunk>,
    reader: JoinHandle<Result<u64>>,
}

impl ChunkStream {
    /// Start reading `source` in the background.
    pub fn spawn<R>(source: R, chunk_size: usize) -> Result<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        if chunk_size == 0 {
            return Err(StoreError::Config("chunk size must be positive".into()));
        }

        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_SIZE);
        let reader = tokio::spawn(produce(source, chunk_size, tx));

        Ok(Self { rx, reader })
    }

    /// Open `path` and stream its contents. Returns the stream and the file size.
    pub async fn from_file(path: &Path, chunk_size: usize) -> Result<(Self, u64)> {
        let file = File::open(path)
            .await
            .map_err(|e| StoreError::io("open", path, e))?;
        let size = file
            .metadata()
            .await
            .map_err(|e| StoreError::io("stat", path, e))?
            .len();

        Ok((Self::spawn(file, chunk_size)?, size))
    }

    /// Next chunk in index order, or `None` once the reader has stopped.
    ///
    /// `None` alone does not mean the source was fully read; call
    /// [`finish`](Self::finish) to learn whether the reader hit an error.
    pub async fn next(&mut self) -> Option<Chunk> {
        self.rx.recv().await
    }

    /// Stop consuming and collect the reader's outcome.
    ///
    /// Returns the number of bytes read, or the I/O error that ended the stream.
    pub async fn finish(self) -> Result<u64> {
        drop(self.rx);
        match self.reader.await {
            Ok(result) => result,
            Err(e) => Err(StoreError::IoPlain(io::Error::other(format!(
                "chunk reader task failed: {e}"
            )))),
        }
    }
}

async fn produce<R>(mut source: R, chunk_size: usize, tx: mpsc::Sender<Chunk>) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut index = 0usize;
    let mut total = 0u64;

    loop {
        let mut buf = BytesMut::zeroed(chunk_size);
        let n = read_full(&mut source, &mut buf)
            .await
            .map_err(|e| StoreError::IoPlain(e).step(format!("read chunk {index}")))?;

        if n == 0 {
            break;
        }

        buf.truncate(n);
        total += n as u64;

        let chunk = Chunk {
            index,
            data: buf.freeze(),
        };
        if tx.send(chunk).await.is_err() {
            // Consumer stopped early (cancelled or failed); nothing left to do.
            tracing::debug!("chunk consumer dropped at index {}", index);
            break;
        }

        if n < chunk_size {
            break;
        }
        index += 1;
    }

    Ok(total)
}

/// Fill `buf` unless the source ends first. Returns bytes read.
async fn read_full<R>(source: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
