use std::sync::Arc;

use chrono::Utc;
use reqwest::Url;
use serde::Serialize;

use super::{BlobStore, CacheError, CacheIndex, CacheState, Hasher, RetryPolicy};
use crate::config::{AppConfig, SettingsStore};
use crate::embed;
use crate::images::{FetchOutcome, Pipeline};

// Successful entries record at most one access per hour
const TOUCH_WINDOW_SECS: i64 = 3600;

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct CleanStats {
    pub blobs_removed: usize,
    pub entries_removed: usize,
}

/// Ties the index, the fetch pipeline and the retry policy together.
///
/// Requests never share in-process state: every decision about a key is
/// made against the index, and retries are claimed through a compare and
/// increment on the failure count so only one request refetches a failing
/// image. Two brand new requests for the same image may both fetch it; both
/// end in the same successful write.
pub struct ImageCache {
    index: Arc<CacheIndex>,
    hasher: Hasher,
    pipeline: Pipeline,
    retry: RetryPolicy,
    settings: Arc<SettingsStore>,
    site: Url,
    max_width: u32,
    max_height: u32,
}

impl ImageCache {
    pub fn new(
        config: &AppConfig,
        index: Arc<CacheIndex>,
        pipeline: Pipeline,
        settings: Arc<SettingsStore>,
    ) -> Result<Self, CacheError> {
        let site = Url::parse(&config.site_url)
            .map_err(|e| CacheError::InvalidSetting("site_url".to_string(), e.to_string()))?;
        let hasher = Hasher::new(&settings.salt()?)?;

        Ok(Self {
            index,
            hasher,
            pipeline,
            retry: RetryPolicy::new(config.max_retry),
            settings,
            site,
            max_width: config.max_width,
            max_height: config.max_height,
        })
    }

    pub fn key_for(&self, url: &str) -> String {
        self.hasher.compute_key(url)
    }

    pub fn index(&self) -> &CacheIndex {
        &self.index
    }

    pub fn blobs(&self) -> &BlobStore {
        self.pipeline.blobs()
    }

    pub fn blob_path(&self, key: &str) -> std::path::PathBuf {
        self.blobs().path_for(key)
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn site(&self) -> &Url {
        &self.site
    }

    /// Whether `url` should be rewritten to go through the cache.
    pub fn needs_caching(&self, url: &str) -> bool {
        embed::needs_caching(url, &self.site, self.settings.get().cache_all)
    }

    /// Makes sure the image for `url` is cached (fetching or retrying as
    /// needed) and returns its state afterwards.
    pub async fn access(&self, url: &str) -> CacheState {
        self.access_at(url, Utc::now().timestamp()).await
    }

    pub(crate) async fn access_at(&self, url: &str, now: i64) -> CacheState {
        let key = self.key_for(url);

        match self.try_access(&key, url, now).await {
            Ok(state) => state,
            Err(e) => {
                log::error!("Image cache lookup for {} failed: {}", url, e);
                self.index.lookup(&key).unwrap_or(CacheState::Unseen)
            }
        }
    }

    async fn try_access(&self, key: &str, url: &str, now: i64) -> Result<CacheState, CacheError> {
        let state = self.index.lookup(key)?;

        match state {
            CacheState::Unseen => self.first_fetch(key, url, now).await,
            CacheState::Succeeded { .. } if !self.blobs().exists(key) => {
                log::warn!("Cached image {} lost its file, fetching again", key);
                self.index.delete_entry(key)?;
                self.first_fetch(key, url, now).await
            }
            CacheState::Succeeded { last_access } => {
                if self.index.touch_success_if_stale(key, now, TOUCH_WINDOW_SECS)? {
                    return Ok(CacheState::Succeeded { last_access: now });
                }
                Ok(CacheState::Succeeded { last_access })
            }
            CacheState::Failed { count, .. } if self.retry.is_abandoned(count) => {
                log::debug!("Giving up on {} after {} failures", url, count);
                Ok(state)
            }
            CacheState::Failed { count, last_attempt } => {
                if !self.retry.is_due(count, last_attempt, now) {
                    return Ok(state);
                }

                // Only the request that moves the count forward gets to retry
                if !self.index.increment_failure_if_matches(key, count)? {
                    log::debug!("Retry of {} already claimed by another request", url);
                    return Ok(state);
                }

                log::info!("Retrying {} (attempt {})", url, count + 1);
                match self.fetch(key, url).await {
                    FetchOutcome::Success => {
                        self.index.upsert_success(key, now)?;
                        Ok(CacheState::Succeeded { last_access: now })
                    }
                    FetchOutcome::Failure => Ok(CacheState::Failed {
                        count: count + 1,
                        last_attempt,
                    }),
                }
            }
        }
    }

    async fn first_fetch(&self, key: &str, url: &str, now: i64) -> Result<CacheState, CacheError> {
        // Seed the row first so concurrent requests see a pending failure
        // rather than an unknown image
        self.index.insert_failure_if_absent(key, now)?;

        match self.fetch(key, url).await {
            FetchOutcome::Success => {
                self.index.upsert_success(key, now)?;
                Ok(CacheState::Succeeded { last_access: now })
            }
            FetchOutcome::Failure => Ok(CacheState::Failed {
                count: 1,
                last_attempt: now,
            }),
        }
    }

    async fn fetch(&self, key: &str, url: &str) -> FetchOutcome {
        self.pipeline
            .fetch_and_store(key, url, self.max_width, self.max_height)
            .await
    }

    /// Caches `url` and returns the local address serving it.
    pub async fn proxify(&self, url: &str) -> String {
        self.access(url).await;
        self.proxy_url(url)
    }

    pub fn proxy_url(&self, url: &str) -> String {
        let key = self.key_for(url);
        let base = self.site.path().trim_end_matches('/');

        let mut endpoint = self.site.clone();
        endpoint.set_path(&format!("{}/imagecache", base));
        endpoint.set_fragment(None);
        endpoint
            .query_pairs_mut()
            .clear()
            .append_pair("image", url)
            .append_pair("hash", &key);

        endpoint.to_string()
    }

    /// Drops every cached file and every index row.
    ///
    /// The directory walk runs on the blocking pool.
    pub async fn clean_all(&self) -> Result<CleanStats, CacheError> {
        let index = Arc::clone(&self.index);
        let blobs = self.blobs().clone();

        let stats = tokio::task::spawn_blocking(move || {
            let blobs_removed = blobs.remove_all()?;
            let entries_removed = index.truncate_all()?;

            Ok::<_, CacheError>(CleanStats {
                blobs_removed,
                entries_removed,
            })
        })
        .await
        .map_err(|e| CacheError::Task(e.to_string()))??;

        log::info!(
            "Image cache cleared: {} files, {} entries",
            stats.blobs_removed,
            stats.entries_removed
        );

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::images::pipeline::stub::{png_bytes, StubDownloader};
    use crate::images::tools;
    use rocket::figment::Figment;

    const URL: &str = "http://example.com/a.png";
    const T0: i64 = 1_700_000_000;

    fn test_config(dir: &std::path::Path, max_retry: u32) -> AppConfig {
        Figment::new()
            .merge(("site_url", "https://forum.test"))
            .merge(("cache_dir", dir.join("blobs")))
            .merge(("max_width", 100))
            .merge(("max_height", 100))
            .merge(("max_retry", max_retry))
            .extract()
            .unwrap()
    }

    fn build(downloader: Arc<StubDownloader>, max_retry: u32) -> (ImageCache, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), max_retry);
        let index = Arc::new(CacheIndex::open_in_memory().unwrap());
        let settings = Arc::new(SettingsStore::load(index.clone(), config.default_settings()).unwrap());
        let pipeline = Pipeline::new(
            downloader,
            BlobStore::new(&config.cache_dir).unwrap(),
            tools::load_placeholder(None).unwrap(),
        );

        (ImageCache::new(&config, index, pipeline, settings).unwrap(), dir)
    }

    #[tokio::test]
    async fn first_access_fetches_and_succeeds() {
        let downloader = Arc::new(StubDownloader::serving(png_bytes(20, 20)));
        let (cache, _dir) = build(downloader.clone(), 10);

        let state = cache.access_at(URL, T0).await;

        assert_eq!(state, CacheState::Succeeded { last_access: T0 });
        assert_eq!(downloader.calls(), 1);
        assert!(cache.blobs().exists(&cache.key_for(URL)));
    }

    #[tokio::test]
    async fn first_failure_records_one_failure_and_placeholder() {
        let downloader = Arc::new(StubDownloader::failing());
        let (cache, _dir) = build(downloader.clone(), 10);

        let state = cache.access_at(URL, T0).await;
        let key = cache.key_for(URL);

        assert_eq!(state, CacheState::Failed { count: 1, last_attempt: T0 });
        assert_eq!(cache.index().lookup(&key).unwrap(), state);
        assert!(cache.blobs().exists(&key));
    }

    #[tokio::test]
    async fn hits_do_not_refetch_and_touch_hourly() {
        let downloader = Arc::new(StubDownloader::serving(png_bytes(20, 20)));
        let (cache, _dir) = build(downloader.clone(), 10);

        cache.access_at(URL, T0).await;
        let soon = cache.access_at(URL, T0 + 60).await;
        let later = cache.access_at(URL, T0 + 3_601).await;

        assert_eq!(soon, CacheState::Succeeded { last_access: T0 });
        assert_eq!(later, CacheState::Succeeded { last_access: T0 + 3_601 });
        assert_eq!(downloader.calls(), 1);
    }

    #[tokio::test]
    async fn failures_wait_for_backoff_before_retrying() {
        let downloader = Arc::new(StubDownloader::failing());
        let (cache, _dir) = build(downloader.clone(), 10);
        let key = cache.key_for(URL);

        cache.access_at(URL, T0).await;
        cache.access_at(URL, T0 + 30).await;
        assert_eq!(downloader.calls(), 1);

        // Past the one minute delay
        let state = cache.access_at(URL, T0 + 61).await;
        assert_eq!(state, CacheState::Failed { count: 2, last_attempt: T0 });
        assert_eq!(downloader.calls(), 2);

        // Second delay is 16 minutes, counted from the first failure
        cache.access_at(URL, T0 + 900).await;
        assert_eq!(downloader.calls(), 2);

        downloader.set_response(Some(png_bytes(10, 10)));
        let state = cache.access_at(URL, T0 + 1_000).await;
        assert_eq!(state, CacheState::Succeeded { last_access: T0 + 1_000 });
        assert_eq!(
            cache.index().lookup(&key).unwrap(),
            CacheState::Succeeded { last_access: T0 + 1_000 }
        );
    }

    #[tokio::test]
    async fn abandoned_entries_are_never_fetched_again() {
        let downloader = Arc::new(StubDownloader::failing());
        let (cache, _dir) = build(downloader.clone(), 1);
        let key = cache.key_for(URL);

        cache.access_at(URL, T0).await;
        cache.access_at(URL, T0 + 61).await;
        assert_eq!(downloader.calls(), 2);

        for offset in [10_000, 1_000_000, 100_000_000] {
            let state = cache.access_at(URL, T0 + offset).await;
            assert_eq!(state, CacheState::Failed { count: 2, last_attempt: T0 });
        }
        assert_eq!(downloader.calls(), 2);
        assert_eq!(
            cache.index().lookup(&key).unwrap(),
            CacheState::Failed { count: 2, last_attempt: T0 }
        );
    }

    #[tokio::test]
    async fn concurrent_retries_fetch_once() {
        let downloader = Arc::new(StubDownloader::failing());
        let (cache, _dir) = build(downloader.clone(), 10);

        cache.access_at(URL, T0).await;
        let (a, b) = tokio::join!(cache.access_at(URL, T0 + 100), cache.access_at(URL, T0 + 100));

        assert_eq!(downloader.calls(), 2);
        assert!(matches!(a, CacheState::Failed { .. }));
        assert!(matches!(b, CacheState::Failed { .. }));
        assert_eq!(
            cache.index().lookup(&cache.key_for(URL)).unwrap(),
            CacheState::Failed { count: 2, last_attempt: T0 }
        );
    }

    #[tokio::test]
    async fn missing_file_resets_a_successful_entry() {
        let downloader = Arc::new(StubDownloader::serving(png_bytes(20, 20)));
        let (cache, _dir) = build(downloader.clone(), 10);
        let key = cache.key_for(URL);

        cache.access_at(URL, T0).await;
        cache.blobs().remove(&key).unwrap();

        let state = cache.access_at(URL, T0 + 10).await;
        assert_eq!(state, CacheState::Succeeded { last_access: T0 + 10 });
        assert_eq!(downloader.calls(), 2);
        assert!(cache.blobs().exists(&key));
    }

    #[tokio::test]
    async fn proxify_returns_local_address() {
        let downloader = Arc::new(StubDownloader::serving(png_bytes(20, 20)));
        let (cache, _dir) = build(downloader, 10);

        let proxied = cache.proxify(URL).await;
        let expected = format!(
            "https://forum.test/imagecache?image=http%3A%2F%2Fexample.com%2Fa.png&hash={}",
            cache.key_for(URL)
        );

        assert_eq!(proxied, expected);
        assert!(cache.index().lookup(&cache.key_for(URL)).unwrap().is_cached());
    }

    #[tokio::test]
    async fn clean_all_empties_files_and_index() {
        let downloader = Arc::new(StubDownloader::serving(png_bytes(20, 20)));
        let (cache, _dir) = build(downloader, 10);

        cache.access_at("http://example.com/1.png", T0).await;
        cache.access_at("http://example.com/2.png", T0).await;

        let stats = cache.clean_all().await.unwrap();
        assert_eq!(
            stats,
            CleanStats {
                blobs_removed: 2,
                entries_removed: 2
            }
        );
        assert_eq!(
            cache.index().lookup(&cache.key_for("http://example.com/1.png")).unwrap(),
            CacheState::Unseen
        );
    }
}
