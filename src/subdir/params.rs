//! Explicit parameter structs for the subdir index loader.

use chrono::Duration;

/// Construction-time parameters.
#[derive(Debug, Clone)]
pub struct SubdirParams {
    /// If set, a cache entry younger than this is accepted without a
    /// network round trip.
    pub local_repodata_ttl: Option<Duration>,
    /// If true, an existing cache is accepted regardless of age.
    pub offline: bool,
    /// If true, the `.zst` variant is always preferred once known
    /// available, skipping the normal freshness reasoning about it.
    pub repodata_force_use_zst: bool,
    /// TTL for the `has_shards` flag.
    pub shards_ttl: Duration,
}

impl Default for SubdirParams {
    fn default() -> Self {
        Self {
            local_repodata_ttl: None,
            offline: false,
            repodata_force_use_zst: false,
            shards_ttl: Duration::zero(),
        }
    }
}

/// Batch-driver parameters.
#[derive(Debug, Clone, Default)]
pub struct SubdirDownloadParams {
    /// Mirrors [`SubdirParams::offline`] for the download phase.
    pub offline: bool,
    /// Whether to HEAD-check `repodata.json.zst` availability in phase A.
    pub repodata_check_zst: bool,
}
