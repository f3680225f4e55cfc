use thiserror::Error;

pub mod blob;
pub mod hash;
pub mod image;
pub mod index;
pub mod retry;
pub mod sweeper;

pub use blob::BlobStore;
pub use hash::Hasher;
pub use image::{CleanStats, ImageCache};
pub use index::{CacheIndex, CacheState, ExpiredKeys, IndexStats};
pub use retry::RetryPolicy;
pub use sweeper::{ExpirySweeper, SweepScheduler, SweepStats};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid salt: {0}")]
    InvalidSalt(String),

    #[error("Invalid setting {0}: {1}")]
    InvalidSetting(String, String),

    #[error("Background task failed: {0}")]
    Task(String),
}
