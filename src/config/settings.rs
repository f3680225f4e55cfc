use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::cache::hash::generate_salt;
use crate::cache::{CacheError, CacheIndex};

pub const SALT_KEY: &str = "imagecache_sauce";
pub const ENABLED_KEY: &str = "image_cache_enabled";
pub const CACHE_ALL_KEY: &str = "image_cache_all";
pub const KEEP_DAYS_KEY: &str = "image_cache_keep_days";
pub const NOLINK_KEY: &str = "image_cache_nolink";

/// Administrator controlled switches, persisted across restarts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageCacheSettings {
    pub enabled: bool,
    // Cache every remote image, not only insecure ones on a secure site
    pub cache_all: bool,
    // Do not decorate rewritten images with a link back to the original
    pub nolink: bool,
    // 0 keeps entries forever
    pub keep_days: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsUpdate {
    pub enabled: Option<bool>,
    pub cache_all: Option<bool>,
    pub nolink: Option<bool>,
    pub keep_days: Option<u32>,
}

pub struct SettingsStore {
    index: Arc<CacheIndex>,
    current: RwLock<ImageCacheSettings>,
}

impl SettingsStore {
    /// Loads persisted settings, seeding missing ones from `defaults`.
    pub fn load(index: Arc<CacheIndex>, defaults: ImageCacheSettings) -> Result<Self, CacheError> {
        index.insert_setting_if_absent(ENABLED_KEY, encode_bool(defaults.enabled))?;
        index.insert_setting_if_absent(CACHE_ALL_KEY, encode_bool(defaults.cache_all))?;
        index.insert_setting_if_absent(NOLINK_KEY, encode_bool(defaults.nolink))?;
        index.insert_setting_if_absent(KEEP_DAYS_KEY, &defaults.keep_days.to_string())?;

        let current = ImageCacheSettings {
            enabled: read_bool(&index, ENABLED_KEY, defaults.enabled)?,
            cache_all: read_bool(&index, CACHE_ALL_KEY, defaults.cache_all)?,
            nolink: read_bool(&index, NOLINK_KEY, defaults.nolink)?,
            keep_days: read_days(&index, defaults.keep_days)?,
        };

        Ok(Self {
            index,
            current: RwLock::new(current),
        })
    }

    pub fn get(&self) -> ImageCacheSettings {
        *self.current.read()
    }

    pub fn update(&self, update: SettingsUpdate) -> Result<ImageCacheSettings, CacheError> {
        let mut current = self.current.write();
        let mut next = *current;

        if let Some(enabled) = update.enabled {
            self.index.set_setting(ENABLED_KEY, encode_bool(enabled))?;
            next.enabled = enabled;
        }
        if let Some(cache_all) = update.cache_all {
            self.index.set_setting(CACHE_ALL_KEY, encode_bool(cache_all))?;
            next.cache_all = cache_all;
        }
        if let Some(nolink) = update.nolink {
            self.index.set_setting(NOLINK_KEY, encode_bool(nolink))?;
            next.nolink = nolink;
        }
        if let Some(keep_days) = update.keep_days {
            self.index.set_setting(KEEP_DAYS_KEY, &keep_days.to_string())?;
            next.keep_days = keep_days;
        }

        *current = next;
        Ok(next)
    }

    /// The installation's secret salt, generated on first use.
    ///
    /// Generation is an insert-if-absent followed by a re-read, so two
    /// processes starting cold agree on whichever value landed first.
    pub fn salt(&self) -> Result<String, CacheError> {
        if let Some(salt) = self.index.get_setting(SALT_KEY)? {
            if !salt.is_empty() {
                return Ok(salt);
            }
            // An empty value is as good as none
            self.index.set_setting(SALT_KEY, &generate_salt())?;
        } else if self.index.insert_setting_if_absent(SALT_KEY, &generate_salt())? {
            log::info!("Generated a new image cache salt");
        }

        self.index
            .get_setting(SALT_KEY)?
            .filter(|salt| !salt.is_empty())
            .ok_or_else(|| CacheError::InvalidSalt("salt could not be stored".to_string()))
    }
}

fn encode_bool(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

fn read_bool(index: &CacheIndex, key: &str, default: bool) -> Result<bool, CacheError> {
    match index.get_setting(key)?.as_deref() {
        None => Ok(default),
        Some("1") | Some("true") => Ok(true),
        Some("0") | Some("false") | Some("") => Ok(false),
        Some(other) => Err(CacheError::InvalidSetting(key.to_string(), other.to_string())),
    }
}

fn read_days(index: &CacheIndex, default: u32) -> Result<u32, CacheError> {
    match index.get_setting(KEEP_DAYS_KEY)? {
        None => Ok(default),
        Some(value) if value.is_empty() => Ok(0),
        Some(value) => value
            .parse()
            .map_err(|_| CacheError::InvalidSetting(KEEP_DAYS_KEY.to_string(), value)),
    }
}
