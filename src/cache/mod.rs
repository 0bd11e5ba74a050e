//! Content-addressable store for task outputs.
//!
//! The cache has up to two tiers: a local directory, optionally backed by a
//! remote store shared between machines. Entries are addressed by
//! [`CacheKey`]s derived from the producing task, so identical work done
//! anywhere can be reused.

mod local;
#[cfg(feature = "remote-cache")]
mod remote;

use camino::{Utf8Path, Utf8PathBuf};

use crate::core::{Blake3Hasher, Options, Signature, keys};
use crate::error::CacheError;
use crate::resource::Resource;
use crate::task::Task;

pub use local::LocalCache;
#[cfg(feature = "remote-cache")]
pub use remote::HttpRemoteStore;

/// Fingerprint of a single task output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Key for the output at `index` of `task`. Two outputs of one task never
    /// share a key.
    pub fn calculate(
        task: &Task,
        options: &Options,
        signature: &Signature,
        index: usize,
        output: &Resource,
    ) -> Self {
        let hash = Blake3Hasher::new()
            .field(task.builder_id().as_bytes())
            .hash32(options.content_hash())
            .field(signature.as_bytes())
            .field((index as u64).to_le_bytes())
            .field(output.path().as_str())
            .finish32();

        Self(hash.to_hex())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Shared tier behind the local cache.
pub trait RemoteStore: Send + Sync {
    fn contains(&self, key: &CacheKey) -> Result<bool, CacheError>;

    fn get(&self, key: &CacheKey) -> Result<Vec<u8>, CacheError>;

    fn put(&self, key: &CacheKey, data: &[u8]) -> Result<(), CacheError>;
}

/// Where cached outputs live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheConfig {
    Disabled,
    Local {
        dir: Utf8PathBuf,
    },
    Remote {
        dir: Utf8PathBuf,
        url: String,
        user: Option<String>,
        pass: Option<String>,
    },
}

impl CacheConfig {
    /// Reads `resource-cache-local` and `resource-cache-remote`. A relative
    /// local directory is resolved against `root`. Credentials fall back to
    /// the environment.
    pub fn from_options(options: &Options, root: &Utf8Path) -> Self {
        let Some(dir) = options.get(keys::RESOURCE_CACHE_LOCAL) else {
            if options.has_option(keys::RESOURCE_CACHE_REMOTE) {
                tracing::warn!("Remote resource cache requires a local cache directory, caching disabled");
            }
            return Self::Disabled;
        };

        let dir = root.join(dir);

        match options.get(keys::RESOURCE_CACHE_REMOTE) {
            Some(url) => Self::Remote {
                dir,
                url: url.to_string(),
                user: options.option_or_env(keys::RESOURCE_CACHE_REMOTE_USER, keys::ENV_REMOTE_USER),
                pass: options.option_or_env(keys::RESOURCE_CACHE_REMOTE_PASS, keys::ENV_REMOTE_PASS),
            },
            None => Self::Local { dir },
        }
    }
}

/// The two-tier cache used by the engine.
#[derive(Default)]
pub struct ResourceCache {
    local: Option<LocalCache>,
    remote: Option<Box<dyn RemoteStore>>,
}

impl ResourceCache {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn local(dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            local: Some(LocalCache::new(dir)),
            remote: None,
        }
    }

    /// Adds a remote tier. Ignored while the cache has no local tier.
    pub fn with_remote(mut self, store: Box<dyn RemoteStore>) -> Self {
        if self.local.is_none() {
            tracing::warn!("Remote resource cache requires a local cache directory");
            return self;
        }
        self.remote = Some(store);
        self
    }

    pub fn from_config(config: &CacheConfig) -> Result<Self, CacheError> {
        match config {
            CacheConfig::Disabled => Ok(Self::disabled()),
            CacheConfig::Local { dir } => Ok(Self::local(dir)),
            #[cfg(feature = "remote-cache")]
            CacheConfig::Remote { dir, url, user, pass } => {
                let store = HttpRemoteStore::new(url, user.clone(), pass.clone())?;
                Ok(Self::local(dir).with_remote(Box::new(store)))
            }
            #[cfg(not(feature = "remote-cache"))]
            CacheConfig::Remote { dir, url, .. } => {
                tracing::warn!("Built without remote cache support, ignoring '{url}'");
                Ok(Self::local(dir))
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.local.is_some()
    }

    pub fn contains(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let Some(local) = &self.local else {
            return Ok(false);
        };

        if local.contains(key) {
            return Ok(true);
        }

        match &self.remote {
            Some(remote) => remote.contains(key),
            None => Ok(false),
        }
    }

    /// Local entries win. Remote hits are copied into the local tier.
    pub fn get(&self, key: &CacheKey) -> Result<Vec<u8>, CacheError> {
        let Some(local) = &self.local else {
            return Err(CacheError::Missing(key.to_string()));
        };

        if let Some(data) = local.get(key)? {
            return Ok(data);
        }

        let Some(remote) = &self.remote else {
            return Err(CacheError::Missing(key.to_string()));
        };

        let data = remote.get(key)?;
        local.put(key, &data)?;
        Ok(data)
    }

    /// Stores `data` in every tier.
    pub fn put(&self, key: &CacheKey, data: &[u8]) -> Result<(), CacheError> {
        let Some(local) = &self.local else {
            return Ok(());
        };

        local.put(key, data)?;

        if let Some(remote) = &self.remote {
            remote.put(key, data)?;
        }

        Ok(())
    }
}

impl std::fmt::Debug for ResourceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceCache")
            .field("local", &self.local)
            .field("remote", &self.remote.is_some())
            .finish()
    }
}
