use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use super::CacheError;

const BLOB_PREFIX: &str = "img_cache_";
const BLOB_SUFFIX: &str = ".elk";
const TEMP_PREFIX: &str = ".img_cache_tmp";

/// Directory of cached image files, one per key.
///
/// Files are never written in place: content goes to a private temporary
/// file in the same directory and is renamed over the final path, so readers
/// see either the previous blob or the complete new one.
#[derive(Debug, Clone)]
pub struct BlobStore {
    dir: PathBuf,
}

impl BlobStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}{}{}", BLOB_PREFIX, key, BLOB_SUFFIX))
    }

    pub fn exists(&self, key: &str) -> bool {
        self.path_for(key).is_file()
    }

    /// Atomically replaces the blob for `key` with `data`.
    pub fn write(&self, key: &str, data: &[u8]) -> Result<(), CacheError> {
        let mut tmp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(&self.dir)?;

        tmp.write_all(data)?;
        tmp.as_file().sync_data()?;
        tmp.persist(self.path_for(key)).map_err(|e| e.error)?;

        Ok(())
    }

    /// Removes the blob for `key`. A missing file is not an error.
    pub fn remove(&self, key: &str) -> Result<bool, CacheError> {
        ensure_file_removed(&self.path_for(key))
    }

    /// Removes every blob in the directory, leaving unrelated files alone.
    pub fn remove_all(&self) -> Result<usize, CacheError> {
        let mut removed = 0;

        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();

            if !name.starts_with(BLOB_PREFIX) {
                continue;
            }

            match ensure_file_removed(&entry.path()) {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => log::warn!("Failed to remove cached image {}: {}", name, e),
            }
        }

        Ok(removed)
    }
}

// Returns whether a file was actually removed
fn ensure_file_removed(path: &Path) -> Result<bool, CacheError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
