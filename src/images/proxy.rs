use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use super::ImageProxyError;
use crate::config::AppConfig;

/// Source of remote image bytes.
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn download(&self, url: &str) -> Result<Vec<u8>, ImageProxyError>;
}

/// Fetches remote images over HTTP(S), optionally through an outbound proxy.
pub struct ImageProxy {
    client: Client,
    max_bytes: u64,
}

impl ImageProxy {
    pub fn new(config: &AppConfig) -> Result<Self, ImageProxyError> {
        Self::with_limits(
            Duration::from_secs(config.timeout),
            &config.user_agent,
            config.fetch_proxy.as_deref(),
            config.max_download_bytes,
        )
    }

    pub fn with_limits(
        timeout: Duration,
        user_agent: &str,
        proxy_url: Option<&str>,
        max_bytes: u64,
    ) -> Result<Self, ImageProxyError> {
        let client_builder = Client::builder().timeout(timeout).user_agent(user_agent);

        // Add proxy if provided
        let client_builder = if let Some(proxy) = proxy_url {
            match reqwest::Proxy::all(proxy) {
                Ok(proxy) => client_builder.proxy(proxy),
                Err(e) => return Err(ImageProxyError::ProxyError(format!("Failed to create proxy: {}", e))),
            }
        } else {
            client_builder
        };

        let client = match client_builder.build() {
            Ok(client) => client,
            Err(e) => return Err(ImageProxyError::ProxyError(format!("Failed to build client: {}", e))),
        };

        Ok(Self { client, max_bytes })
    }

    // Make the actual HTTP request, reading at most max_bytes of body
    async fn make_request(&self, url: &str) -> Result<Vec<u8>, ImageProxyError> {
        let request = self
            .client
            .get(url)
            .header("Accept", "image/avif,image/webp,image/png,image/*;q=0.8,*/*;q=0.5");

        let mut response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            log::warn!("Image request for {} failed with status: {}", url, status);
            return Err(ImageProxyError::ImageError(format!(
                "Image request failed with status: {}",
                status
            )));
        }

        // Refuse early when the server announces an oversized body
        if let Some(length) = response.content_length() {
            if length > self.max_bytes {
                return Err(ImageProxyError::TooLarge(self.max_bytes));
            }
        }

        let mut image_data = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if (image_data.len() + chunk.len()) as u64 > self.max_bytes {
                return Err(ImageProxyError::TooLarge(self.max_bytes));
            }
            image_data.extend_from_slice(&chunk);
        }

        log::debug!("Fetched {} bytes from {}", image_data.len(), url);
        Ok(image_data)
    }
}

#[async_trait]
impl Downloader for ImageProxy {
    async fn download(&self, url: &str) -> Result<Vec<u8>, ImageProxyError> {
        self.make_request(url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_outbound_proxy_is_reported() {
        let result = ImageProxy::with_limits(
            Duration::from_secs(1),
            "imgcache-test",
            Some("not a proxy url"),
            1024,
        );

        assert!(matches!(result, Err(ImageProxyError::ProxyError(_))));
    }

    #[tokio::test]
    async fn unreachable_host_is_a_network_error() {
        let proxy = ImageProxy::with_limits(Duration::from_secs(2), "imgcache-test", None, 1024).unwrap();

        // Port 9 on loopback is the discard service, normally closed
        let result = proxy.download("http://127.0.0.1:9/a.png").await;
        assert!(result.is_err());
    }
}
