use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Record already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid file name: {0:?}")]
    InvalidName(String),

    #[error("Invalid size {size} for {name}")]
    InvalidSize { name: String, size: u64 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Failed to {op} {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    IoPlain(#[from] io::Error),

    #[error("Metadata encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Metadata index is locked by another process: {0}")]
    Locked(PathBuf),

    #[cfg(feature = "watch")]
    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("{context}: {source}")]
    Step {
        context: String,
        #[source]
        source: Box<StoreError>,
    },
}

impl StoreError {
    /// Attach the operation and path to an I/O failure.
    pub fn io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        StoreError::Io {
            op,
            path: path.into(),
            source,
        }
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        StoreError::Transport(msg.into())
    }

    /// Wrap an error with the sub-step that produced it ("send chunk 3", "save metadata").
    pub fn step(self, context: impl Into<String>) -> Self {
        StoreError::Step {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Innermost error, skipping any step context.
    pub fn root(&self) -> &StoreError {
        match self {
            StoreError::Step { source, .. } => source.root(),
            other => other,
        }
    }

    /// Cancellation is a normal early return, not a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), StoreError::Cancelled)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), StoreError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self.root(), StoreError::AlreadyExists(_))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
