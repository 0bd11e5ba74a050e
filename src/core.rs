use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

/// A 32-byte BLAKE3 hash used for content-addressing and change detection.
///
/// In `kiln`, this serves three purposes:
/// 1. It is the raw material of task [`Signature`]s.
/// 2. It fingerprints cache entries, see [`crate::cache::CacheKey`].
/// 3. It names generated resources (`_generated_<hash>.<suffix>`).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub fn hash_file(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        Ok(blake3::Hasher::new()
            .update_mmap_rayon(path)?
            .finalize()
            .into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Folds the hash into 64 bits, little endian.
    pub fn to_u64(self) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.0[..8]);
        u64::from_le_bytes(buf)
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in self.0.iter() {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

/// Incremental BLAKE3 hasher with length-prefixed framing, so that
/// `("ab", "c")` and `("a", "bc")` never collide.
#[derive(Default)]
pub struct Blake3Hasher(blake3::Hasher);

impl Blake3Hasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(&mut self, bytes: impl AsRef<[u8]>) -> &mut Self {
        let bytes = bytes.as_ref();
        self.0.update(&(bytes.len() as u64).to_le_bytes());
        self.0.update(bytes);
        self
    }

    pub fn hash32(&mut self, hash: Hash32) -> &mut Self {
        self.0.update(hash.as_bytes());
        self
    }

    pub fn finish32(&self) -> Hash32 {
        let bytes: [u8; 32] = self.0.finalize().into();
        Hash32::from(bytes)
    }
}

impl std::hash::Hasher for Blake3Hasher {
    fn finish(&self) -> u64 {
        let mut output = [0u8; 8];
        self.0.finalize_xof().fill(&mut output);
        u64::from_le_bytes(output)
    }

    fn write(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }
}

/// Opaque fingerprint of a task's effective inputs and options.
///
/// The empty signature is the "invalid" marker written into the state for
/// outputs of failed tasks; it never equals a computed one.
#[derive(Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "serde_bytes")] Vec<u8>);

impl Signature {
    pub fn invalid() -> Self {
        Self(Vec::new())
    }

    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Hash32> for Signature {
    fn from(value: Hash32) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for Signature {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            return write!(f, "Signature(invalid)");
        }
        write!(f, "Signature(")?;
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

/// Option keys understood by the pipeline.
pub mod keys {
    pub const RESOURCE_CACHE_LOCAL: &str = "resource-cache-local";
    pub const RESOURCE_CACHE_REMOTE: &str = "resource-cache-remote";
    pub const RESOURCE_CACHE_REMOTE_USER: &str = "resource-cache-remote-user";
    pub const RESOURCE_CACHE_REMOTE_PASS: &str = "resource-cache-remote-pass";
    pub const EXCLUDE_BUILD_FOLDER: &str = "exclude-build-folder";
    pub const BUILD_ARTIFACTS: &str = "build-artifacts";
    pub const VARIANT: &str = "variant";
    pub const WITH_SYMBOLS: &str = "with-symbols";
    pub const ARCHITECTURES: &str = "architectures";
    pub const PLATFORM: &str = "platform";
    pub const BINARY_OUTPUT: &str = "binary-output";
    pub const BUNDLE_OUTPUT: &str = "bundle-output";

    pub const ENV_REMOTE_USER: &str = "KILN_RESOURCE_CACHE_REMOTE_USER";
    pub const ENV_REMOTE_PASS: &str = "KILN_RESOURCE_CACHE_REMOTE_PASS";

    /// Options that change what a builder produces. They take part in both
    /// task signatures and cache keys.
    pub const CONTENT_AFFECTING: &[&str] = &[
        PLATFORM,
        VARIANT,
        ARCHITECTURES,
        "texture-profiles",
        "texture-compression",
    ];
}

/// Build options, a flat string map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options {
    map: BTreeMap<String, String>,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.map.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    /// Returns the value for `key`, or `default` when it is not set.
    pub fn option<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    pub fn has_option(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    /// Comma separated list, empty entries dropped.
    pub fn list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Value of `key`, falling back to the environment variable `env`.
    pub fn option_or_env(&self, key: &str, env: &str) -> Option<String> {
        self.get(key)
            .map(String::from)
            .or_else(|| std::env::var(env).ok())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Fingerprint of the options that affect builder output.
    pub fn content_hash(&self) -> Hash32 {
        let mut hasher = Blake3Hasher::new();
        for key in keys::CONTENT_AFFECTING {
            if let Some(value) = self.get(key) {
                hasher.field(key).field(value);
            }
        }
        hasher.finish32()
    }

    /// True when `artifact` is listed in `build-artifacts`.
    pub fn should_build_artifact(&self, artifact: &str) -> bool {
        self.list(keys::BUILD_ARTIFACTS).iter().any(|a| a == artifact)
    }

    /// The local content build runs unless `build-artifacts` is set and
    /// leaves out `engine`.
    pub fn should_build_engine(&self) -> bool {
        self.option(keys::BUILD_ARTIFACTS, "").is_empty() || self.should_build_artifact("engine")
    }
}

impl<K, V> FromIterator<(K, V)> for Options
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            map: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

/// Cooperative cancellation flag shared between the caller, the engine and
/// the remote build worker.
#[derive(Clone, Default, Debug)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_hex() {
        let hash = Hash32::hash(b"kiln");
        let hex = hash.to_hex();
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash, Hash32::hash(b"kiln"));
    }

    #[test]
    fn test_hasher_framing() {
        let a = Blake3Hasher::new().field("ab").field("c").finish32();
        let b = Blake3Hasher::new().field("a").field("bc").finish32();
        assert_ne!(a, b);
    }

    #[test]
    fn test_invalid_signature() {
        let sig = Signature::from(Hash32::hash(b"x"));
        assert!(sig.is_valid());
        assert!(!Signature::invalid().is_valid());
        assert_ne!(sig, Signature::invalid());
    }

    #[test]
    fn test_signature_is_a_cbor_byte_string() {
        let mut buf = Vec::new();
        ciborium::into_writer(&Signature::from(Hash32::hash(b"x")), &mut buf).unwrap();
        // major type 2, one byte length
        assert_eq!(&buf[..2], &[0x58, 32]);
        assert_eq!(buf.len(), 34);

        let back: Signature = ciborium::from_reader(buf.as_slice()).unwrap();
        assert_eq!(back, Signature::from(Hash32::hash(b"x")));
    }

    #[test]
    fn test_options_list() {
        let opts: Options = [("build-artifacts", "engine, library,,")].into_iter().collect();
        assert_eq!(opts.list("build-artifacts"), vec!["engine", "library"]);
        assert!(opts.should_build_artifact("library"));
        assert!(opts.should_build_engine());

        let opts: Options = [("build-artifacts", "library")].into_iter().collect();
        assert!(!opts.should_build_engine());
        assert!(Options::new().should_build_engine());
    }

    #[test]
    fn test_content_hash_ignores_unrelated_options() {
        let mut a = Options::new();
        a.set("platform", "x86_64-linux");
        let mut b = a.clone();
        b.set(keys::BUNDLE_OUTPUT, "out");
        assert_eq!(a.content_hash(), b.content_hash());

        b.set("variant", "debug");
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn test_cancel_token_shared() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(!other.is_cancelled());
        token.cancel();
        assert!(other.is_cancelled());
    }
}
