//! tstore: a chunked file store that keeps a local sync folder and uses a
//! messaging backend as its durable remote.

pub mod app;
pub mod backup;
pub mod chunk;
pub mod config;
pub mod error;
pub mod metadata;
pub mod sync;
pub mod temp_file;
pub mod transport;
#[cfg(feature = "watch")]
pub mod watcher;

pub use app::App;
pub use config::Config;
pub use error::{Result, StoreError};
