//! Shard Index Loader.

use crate::auth::AuthenticationDb;
use crate::cache::CacheStore;
use crate::decompress::decompress_capped;
use crate::error::{CoreError, CoreResult, StopToken};
use crate::fetch::{self, params::RemoteFetchParams, Content, FetchOutcome, Request};
use crate::mirror::MirrorMap;
use crate::redact::redact_url;
use crate::types::{decode_shards_index, ShardsIndex};
use chrono::Duration;
use tracing::warn;
use url::Url;

/// Parses a decompressed `repodata_shards.msgpack.zst` payload.
///
/// Exposed standalone (not folded into the network path) so the decode
/// logic is independently testable.
pub fn parse_shard_index(zstd_bytes: &[u8]) -> CoreResult<ShardsIndex> {
    let decompressed = decompress_capped(zstd_bytes)
        .map_err(|e| CoreError::Zstd("shard index".to_string(), std::io::Error::other(e)))?;
    let (index, warnings) = decode_shards_index(&decompressed)
        .map_err(|e| CoreError::MsgpackDecode("shard index".to_string(), rmp_serde::decode::Error::InvalidDataRead(std::io::Error::other(e))))?;
    for warning in warnings {
        warn!(%warning, "shard index decode warning");
    }
    Ok(index)
}

/// Runs [`parse_shard_index`] (zstd decompress + msgpack decode, both
/// CPU-bound) on a blocking-pool thread so it never stalls the async
/// runtime.
async fn parse_shard_index_blocking(bytes: Vec<u8>) -> CoreResult<ShardsIndex> {
    simple_spawn_blocking::tokio::run_blocking_task(move || parse_shard_index(&bytes)).await
}

/// Gate: is `has_shards` fresh-and-true? Returns `Ok(None)` ("no shards",
/// not an error) if not.
///
/// On a cache hit, the cached file is parsed and returned directly. On a
/// cache miss, a GET is issued against `<platform>/repodata_shards.msgpack.zst`.
/// Network failure degrades gracefully to `Ok(None)`.
#[tracing::instrument(skip(cache, mirrors, remote_params, auth_db, stop), fields(shards_url = %redact_url(shards_url)))]
pub async fn fetch_and_parse_shard_index(
    shards_url: &Url,
    platform: &str,
    mirror_name: &str,
    cache: &CacheStore,
    mirrors: &MirrorMap,
    remote_params: &RemoteFetchParams,
    auth_db: &AuthenticationDb,
    has_up_to_date_shards: bool,
    stop: &StopToken,
) -> CoreResult<Option<ShardsIndex>> {
    if !has_up_to_date_shards {
        return Ok(None);
    }

    let cache_path = cache.shards_index_path(shards_url);
    if let Ok(bytes) = std::fs::read(&cache_path) {
        if let Ok(index) = parse_shard_index_blocking(bytes).await {
            return Ok(Some(index));
        }
    }

    let request = Request::get("shard-index", mirror_name, format!("{platform}/repodata_shards.msgpack.zst"));
    let mut outcomes = fetch::download(vec![request], mirrors, remote_params, auth_db, stop).await;
    let outcome = outcomes.pop().expect("requested exactly one outcome");

    let bytes = match outcome {
        FetchOutcome::Success { content: Content::Buffer(bytes), .. } => bytes.to_vec(),
        FetchOutcome::Success { content: Content::File(path), .. } => match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(_) => return Ok(None),
        },
        FetchOutcome::Success { content: Content::NotModified, .. } => return Ok(None),
        FetchOutcome::Error { .. } => return Ok(None),
    };

    let index = match parse_shard_index_blocking(bytes.clone()).await {
        Ok(index) => index,
        Err(_) => return Ok(None),
    };

    match cache.lock_for(shards_url, "shard-index") {
        Ok(_lock) => {
            if let Some(parent) = cache_path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            let _ = std::fs::write(&cache_path, &bytes);
        }
        Err(e) => warn!(error = %e, "acquiring cache lock for shard index"),
    }

    Ok(Some(index))
}

/// `TTL == 0` means "always recheck"; see [`crate::cache::Expiring::is_fresh`].
pub fn default_shards_ttl() -> Duration {
    Duration::zero()
}
