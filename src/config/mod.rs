use std::path::PathBuf;

use serde::Deserialize;

pub mod settings;

pub use settings::{ImageCacheSettings, SettingsStore, SettingsUpdate};

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    // Public base URL of the site embedding the images, e.g. https://forum.test
    pub site_url: String,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    // Remote fetch timeout, in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_max_width")]
    pub max_width: u32,
    #[serde(default = "default_max_height")]
    pub max_height: u32,
    #[serde(default = "default_max_retry")]
    pub max_retry: u32,
    #[serde(default = "default_max_download_bytes")]
    pub max_download_bytes: u64,
    pub fetch_proxy: Option<String>,
    pub placeholder_path: Option<PathBuf>,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    pub admin_token: Option<String>,

    // Defaults for the persisted settings, only used when the settings table is empty
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub cache_all: bool,
    #[serde(default)]
    pub nolink: bool,
    #[serde(default)]
    pub keep_days: u32,
}

impl AppConfig {
    pub fn default_settings(&self) -> ImageCacheSettings {
        ImageCacheSettings {
            enabled: self.enabled,
            cache_all: self.cache_all,
            nolink: self.nolink,
            keep_days: self.keep_days,
        }
    }
}

fn default_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache")
}

fn default_database_path() -> PathBuf {
    PathBuf::from("imgcache.sqlite")
}

fn default_timeout() -> u64 {
    60
}

fn default_user_agent() -> String {
    format!("imgcache/{}", env!("CARGO_PKG_VERSION"))
}

fn default_max_width() -> u32 {
    1024
}

fn default_max_height() -> u32 {
    768
}

fn default_max_retry() -> u32 {
    10
}

fn default_max_download_bytes() -> u64 {
    16 * 1024 * 1024
}

fn default_sweep_interval() -> u64 {
    24 * 60 * 60
}

fn default_true() -> bool {
    true
}
