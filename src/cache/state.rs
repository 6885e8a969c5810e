//! Subdir cache state sidecar.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use url::Url;

/// HTTP cache headers extracted from a response, split out of the sidecar
/// proper.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheHeaders {
    /// The `ETag` response header.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    /// The `Last-Modified` response header.
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "mod")]
    pub last_modified: Option<String>,
    /// The `Cache-Control` response header.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<String>,
}

impl CacheHeaders {
    /// True if `cache_control` parses as fresh right now, per HTTP caching
    /// rules.
    pub fn is_fresh_by_cache_control(&self, cached_at: DateTime<Utc>) -> bool {
        let Some(raw) = self.cache_control.as_deref() else {
            return false;
        };
        let Some(parsed) = cache_control::CacheControl::from_value(raw) else {
            return false;
        };
        let Some(max_age) = parsed.max_age else {
            return false;
        };
        let max_age = Duration::from_std(max_age).unwrap_or(Duration::zero());
        Utc::now().signed_duration_since(cached_at) < max_age
    }
}

/// A value paired with when it was last confirmed true, with TTL-based
/// freshness.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Expiring<T> {
    /// The last observed value.
    pub value: T,
    /// When it was last checked.
    pub last_checked: DateTime<Utc>,
}

impl<T> Expiring<T> {
    /// Wraps `value` as checked right now.
    pub fn now(value: T) -> Self {
        Self { value, last_checked: Utc::now() }
    }

    /// `ttl == 0` means "always stale, recheck every call"; otherwise the
    /// value is fresh for `ttl` seconds since `last_checked`.
    pub fn is_fresh(&self, ttl: Duration) -> bool {
        if ttl <= Duration::zero() {
            return false;
        }
        Utc::now().signed_duration_since(self.last_checked) < ttl
    }

    /// Returns `Some(&value)` iff fresh.
    pub fn value(&self, ttl: Duration) -> Option<&T> {
        self.is_fresh(ttl).then_some(&self.value)
    }
}

/// The persisted `<name>.state.json` sidecar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubdirCacheState {
    /// Canonical URL the cache was fetched from.
    pub url: Url,
    /// HTTP cache headers from the last successful fetch or 304.
    #[serde(flatten)]
    pub headers: CacheHeaders,
    /// Whether `repodata.json.zst` is available, last checked when.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_zst: Option<Expiring<bool>>,
    /// Whether `repodata_shards.msgpack.zst` is available, last checked when.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_shards: Option<Expiring<bool>>,
    /// The data file's mtime (unix nanoseconds) at the time this sidecar was written.
    pub mtime_ns: i64,
    /// The data file's size in bytes at the time this sidecar was written.
    pub size: u64,
}

impl SubdirCacheState {
    /// Reads and parses a sidecar file.
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let content = fs_err::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Serializes this sidecar to `path`.
    pub fn to_path(&self, path: &Path) -> std::io::Result<()> {
        let file = fs_err::File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(std::io::Error::from)
    }

    /// True iff the data file's current `mtime`/`size` match what was
    /// recorded when this sidecar was written.
    pub fn matches_file(&self, metadata: &std::fs::Metadata) -> bool {
        let mtime_ns = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(-1);
        mtime_ns == self.mtime_ns && metadata.len() == self.size
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn expiring_zero_ttl_is_never_fresh() {
        let e = Expiring::now(true);
        assert!(!e.is_fresh(Duration::zero()));
    }

    #[test]
    fn expiring_positive_ttl_is_fresh_immediately() {
        let e = Expiring::now(true);
        assert!(e.is_fresh(Duration::seconds(60)));
    }

    #[test]
    fn expiring_expires_after_ttl() {
        let mut e = Expiring::now(true);
        e.last_checked = Utc::now() - Duration::seconds(120);
        assert!(!e.is_fresh(Duration::seconds(60)));
    }

    #[test]
    fn cache_control_without_max_age_is_not_fresh() {
        let headers = CacheHeaders { cache_control: Some("no-cache".to_string()), ..Default::default() };
        assert!(!headers.is_fresh_by_cache_control(Utc::now()));
    }

    #[test]
    fn cache_control_with_max_age_is_fresh_within_window() {
        let headers = CacheHeaders { cache_control: Some("public, max-age=600".to_string()), ..Default::default() };
        assert!(headers.is_fresh_by_cache_control(Utc::now()));
    }
}
