use std::sync::Arc;

use super::tools::{self, TargetFormat};
use super::{Downloader, ImageProxyError};
use crate::cache::BlobStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Success,
    Failure,
}

/// Download, shrink and publish a remote image.
///
/// After `fetch_and_store` returns, a blob exists for the key: either the
/// converted image or the placeholder.
pub struct Pipeline {
    downloader: Arc<dyn Downloader>,
    blobs: BlobStore,
    placeholder: Arc<Vec<u8>>,
}

impl Pipeline {
    pub fn new(downloader: Arc<dyn Downloader>, blobs: BlobStore, placeholder: Vec<u8>) -> Self {
        Self {
            downloader,
            blobs,
            placeholder: Arc::new(placeholder),
        }
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    pub async fn fetch_and_store(
        &self,
        key: &str,
        url: &str,
        max_width: u32,
        max_height: u32,
    ) -> FetchOutcome {
        match self.try_fetch_and_store(key, url, max_width, max_height).await {
            Ok(()) => {
                log::info!("Cached image {} as {}", url, key);
                FetchOutcome::Success
            }
            Err(e) => {
                log::warn!("Failed to cache image {}: {}", url, e);
                self.store_placeholder(key).await;
                FetchOutcome::Failure
            }
        }
    }

    async fn try_fetch_and_store(
        &self,
        key: &str,
        url: &str,
        max_width: u32,
        max_height: u32,
    ) -> Result<(), ImageProxyError> {
        let data = self.downloader.download(url).await?;
        let format = TargetFormat::from_url(url);
        log::debug!("Storing {} as {}", url, format.content_type());

        // Decoding and resizing are CPU bound, keep them off the async workers
        let blobs = self.blobs.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            let converted = tools::convert_image(&data, format, max_width, max_height)?;
            blobs.write(&key, &converted)?;
            Ok::<_, ImageProxyError>(())
        })
        .await
        .map_err(|e| ImageProxyError::ImageError(format!("Image task failed: {}", e)))?
    }

    async fn store_placeholder(&self, key: &str) {
        let blobs = self.blobs.clone();
        let placeholder = Arc::clone(&self.placeholder);
        let key = key.to_string();

        let result = tokio::task::spawn_blocking(move || blobs.write(&key, &placeholder)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::error!("Failed to write placeholder image: {}", e),
            Err(e) => log::error!("Placeholder task failed: {}", e),
        }
    }
}
