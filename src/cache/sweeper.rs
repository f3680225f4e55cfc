use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;

use super::{BlobStore, CacheError, CacheIndex};
use crate::config::SettingsStore;

pub const TASK_NAME: &str = "remove_old_image_cache";

const SECONDS_PER_DAY: i64 = 86_400;

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SweepStats {
    pub entries_removed: usize,
    pub blobs_removed: usize,
}

/// Removes cache entries that have not been used within the retention window.
pub struct ExpirySweeper {
    index: Arc<CacheIndex>,
    blobs: BlobStore,
}

impl ExpirySweeper {
    pub fn new(index: Arc<CacheIndex>, blobs: BlobStore) -> Self {
        Self { index, blobs }
    }

    /// Zero days keeps everything forever.
    pub fn sweep(&self, retention_days: u32) -> Result<SweepStats, CacheError> {
        self.sweep_at(retention_days, Utc::now().timestamp())
    }

    pub(crate) fn sweep_at(&self, retention_days: u32, now: i64) -> Result<SweepStats, CacheError> {
        if retention_days == 0 {
            return Ok(SweepStats::default());
        }

        let cutoff = now - i64::from(retention_days) * SECONDS_PER_DAY;
        let mut keys = Vec::new();
        let mut blobs_removed = 0;

        for key in self.index.select_older_than(cutoff) {
            let key = key?;
            match self.blobs.remove(&key) {
                Ok(true) => blobs_removed += 1,
                Ok(false) => {}
                Err(e) => log::warn!("Failed to remove expired image {}: {}", key, e),
            }
            keys.push(key);
        }

        let entries_removed = self.index.delete_entries(&keys)?;
        if entries_removed > 0 {
            log::info!(
                "Expired {} cached images older than {} days",
                entries_removed,
                retention_days
            );
        }

        Ok(SweepStats {
            entries_removed,
            blobs_removed,
        })
    }
}

/// Registration of the recurring expiry task.
///
/// The task only exists while the image cache is enabled.
pub struct SweepScheduler {
    sweeper: Arc<ExpirySweeper>,
    settings: Arc<SettingsStore>,
    interval: Duration,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SweepScheduler {
    pub fn new(sweeper: Arc<ExpirySweeper>, settings: Arc<SettingsStore>, interval: Duration) -> Self {
        Self {
            sweeper,
            settings,
            interval,
            handle: Mutex::new(None),
        }
    }

    /// Runs one sweep right away on the blocking pool.
    pub async fn sweep_now(&self, retention_days: u32) -> Result<SweepStats, CacheError> {
        run_sweep(Arc::clone(&self.sweeper), retention_days).await
    }

    pub fn is_registered(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    /// Starts the recurring task. Must be called from within a tokio runtime.
    pub fn register(&self) -> bool {
        let mut handle = self.handle.lock();
        if handle.as_ref().map_or(false, |h| !h.is_finished()) {
            return false;
        }

        let sweeper = Arc::clone(&self.sweeper);
        let settings = Arc::clone(&self.settings);
        let period = self.interval.max(Duration::from_secs(1));

        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;

                let keep_days = settings.get().keep_days;
                match run_sweep(Arc::clone(&sweeper), keep_days).await {
                    Ok(stats) => log::debug!("{} finished: {:?}", TASK_NAME, stats),
                    Err(e) => log::error!("{} failed: {}", TASK_NAME, e),
                }
            }
        }));

        log::info!("Scheduled task {} registered", TASK_NAME);
        true
    }

    pub fn deregister(&self) -> bool {
        match self.handle.lock().take() {
            Some(handle) => {
                handle.abort();
                log::info!("Scheduled task {} removed", TASK_NAME);
                true
            }
            None => false,
        }
    }

    /// Registers or removes the task to match the `enabled` setting.
    pub fn sync_with(&self, enabled: bool) {
        if enabled {
            self.register();
        } else {
            self.deregister();
        }
    }
}

async fn run_sweep(sweeper: Arc<ExpirySweeper>, retention_days: u32) -> Result<SweepStats, CacheError> {
    tokio::task::spawn_blocking(move || sweeper.sweep(retention_days))
        .await
        .map_err(|e| CacheError::Task(e.to_string()))?
}

impl Drop for SweepScheduler {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.get_mut().take() {
            handle.abort();
        }
    }
}
