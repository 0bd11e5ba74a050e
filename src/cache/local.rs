use std::fs;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};

use super::CacheKey;
use crate::error::CacheError;

/// Directory backed tier. Entries live at `<dir>/<key[..2]>/<key>`.
#[derive(Debug, Clone)]
pub struct LocalCache {
    dir: Utf8PathBuf,
}

impl LocalCache {
    pub fn new(dir: impl Into<Utf8PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    fn path(&self, key: &CacheKey) -> Utf8PathBuf {
        let key = key.as_str();
        let shard = key.get(..2).unwrap_or(key);
        self.dir.join(shard).join(key)
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.path(key).is_file()
    }

    pub fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError> {
        match fs::read(self.path(key)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes through a temporary file so readers never see partial entries.
    pub fn put(&self, key: &CacheKey, data: &[u8]) -> Result<(), CacheError> {
        let path = self.path(key);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let temp = path.with_extension("part");
        fs::write(&temp, data)?;
        fs::rename(&temp, &path)?;
        Ok(())
    }
}
