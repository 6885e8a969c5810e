//! Cache Store.
//!
//! Owns a set of cache directories for repodata artifacts: validated JSON,
//! a state-file sidecar, a shard index, and content-addressed shard files,
//! all guarded by process-wide advisory locks (`lock`).

pub mod lock;
pub mod state;

pub use state::{CacheHeaders, Expiring, SubdirCacheState};

use md5::{Digest, Md5};
use std::path::{Path, PathBuf};
use url::Url;

/// Derives the cache file base name for `url`: the first 8 hex characters
/// of `md5(url)`, a dash, then the URL's basename.
///
/// This differs deliberately from a pure-hash scheme: keeping the basename
/// makes cache directories human-browsable while the hash prefix keeps
/// distinct URLs with the same basename from colliding.
pub fn cache_filename(url: &Url) -> String {
    let digest = Md5::digest(url.as_str().as_bytes());
    let prefix = hex::encode(&digest[..4]);
    let basename = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|s| !s.is_empty())
        .unwrap_or("index");
    format!("{prefix}-{basename}")
}

/// A single writable cache directory, one per `pkgs_dir`.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
    /// When false, every lock acquisition is skipped (caller accepts the
    /// risk of concurrent corruption).
    pub locking_enabled: bool,
}

impl CacheStore {
    /// Opens (without creating) a cache store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), locking_enabled: true }
    }

    /// The root directory of this cache store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Ensures the root directory exists.
    pub fn ensure_dir(&self) -> std::io::Result<()> {
        fs_err::create_dir_all(&self.root)
    }

    /// Path to the validated `repodata.json` for `url`.
    pub fn json_path(&self, url: &Url) -> PathBuf {
        self.root.join(format!("{}.json", cache_filename(url)))
    }

    /// Path to the state sidecar for `url`.
    pub fn state_path(&self, url: &Url) -> PathBuf {
        self.root.join(format!("{}.state.json", cache_filename(url)))
    }

    /// Path to the cached shard index for `url`.
    pub fn shards_index_path(&self, url: &Url) -> PathBuf {
        self.root.join(format!("{}.msgpack.zst", cache_filename(url)))
    }

    /// Path to an individual content-addressed shard file.
    pub fn shard_path(&self, hash: &[u8; 32]) -> PathBuf {
        self.root.join(format!("{}.msgpack.zst", hex::encode(hash)))
    }

    /// Path to the optional solver-native sidecar; only its freshness
    /// relative to the JSON cache file is ever inspected by this crate.
    pub fn solv_path(&self, url: &Url) -> PathBuf {
        self.root.join(format!("{}.solv", cache_filename(url)))
    }

    /// Acquires the process-wide lock for mutating `url`'s cache entry, or
    /// `None` if locking is disabled on this store.
    pub fn lock_for(&self, url: &Url, msg: &str) -> anyhow::Result<Option<lock::SharedLock>> {
        let path = self.root.join(format!("{}.lock", cache_filename(url)));
        lock::acquire_exclusive_if_enabled(&path, msg, self.locking_enabled)
    }
}
