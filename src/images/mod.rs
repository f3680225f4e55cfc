use thiserror::Error;

use crate::cache::CacheError;

pub mod pipeline;
pub mod proxy;
pub mod tools;

pub use pipeline::{FetchOutcome, Pipeline};
pub use proxy::{Downloader, ImageProxy};
pub use tools::TargetFormat;

#[derive(Error, Debug)]
pub enum ImageProxyError {
    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Proxy error: {0}")]
    ProxyError(String),

    #[error("Image error: {0}")]
    ImageError(String),

    #[error("Image conversion error: {0}")]
    ConversionError(String),

    #[error("Image too large: more than {0} bytes")]
    TooLarge(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    StorageError(#[from] CacheError),
}
