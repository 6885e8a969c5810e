//! Subdir Index Loader.
//!
//! For one `(Channel, platform)`, decides whether the existing cache is
//! valid and, if not, arranges the downloads that would make it valid.
//! Never loads repodata records into memory — only produces a path to a
//! validated JSON file, which is exactly as far downstream as this crate
//! goes.

pub mod params;

use crate::auth::AuthenticationDb;
use crate::cache::{CacheHeaders, CacheStore, Expiring, SubdirCacheState};
use crate::error::{CoreError, CoreResult, StopToken};
use crate::fetch::{self, params::RemoteFetchParams, Content, FetchOutcome, Request};
use crate::mirror::MirrorMap;
use crate::types::Channel;
use chrono::Utc;
pub use params::{SubdirDownloadParams, SubdirParams};
use std::path::PathBuf;
use tracing::debug;
use url::Url;

/// The lifecycle states a loader instance moves through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoaderState {
    /// No usable cache entry exists yet.
    NoCache,
    /// A check phase is required before the JSON path can be trusted.
    Checking,
    /// A download is in flight or queued.
    Downloading,
    /// `path` is a validated, up-to-date repodata JSON file.
    Valid {
        /// The validated file path.
        path: PathBuf,
    },
    /// The cache is stale but accepted anyway (offline mode only).
    ExpiredUse {
        /// The stale-but-accepted file path.
        path: PathBuf,
    },
    /// This channel cannot be cached (e.g. a `file://` channel).
    Forbidden,
    /// An unrecoverable error occurred for this subdir.
    Error(String),
}

/// One `(channel, platform)` subdir's index loading state.
#[derive(Debug, Clone)]
pub struct SubdirIndexLoader {
    /// The owning channel.
    pub channel: Channel,
    /// The platform subdirectory, e.g. `linux-64`.
    pub platform: String,
    /// If true, this subdir's failures do not fail the overall batch
    /// (used for optional subdirs such as `noarch` on older channels).
    pub ignore_failure: bool,
    subdir_url: Url,
    cache: CacheStore,
    state: LoaderState,
    cache_state: Option<SubdirCacheState>,
}

impl SubdirIndexLoader {
    /// Constructs a loader and immediately computes its initial state from
    /// whatever is on disk.
    pub fn new(channel: Channel, platform: impl Into<String>, cache: CacheStore, ignore_failure: bool, params: &SubdirParams) -> Self {
        let platform = platform.into();
        let subdir_url = channel.subdir_url(&platform);

        if subdir_url.scheme() == "file" {
            return Self {
                channel,
                platform,
                ignore_failure,
                subdir_url,
                cache,
                state: LoaderState::Forbidden,
                cache_state: None,
            };
        }

        let json_path = cache.json_path(&json_url(&subdir_url));
        let cache_state = cache.state_path(&json_url(&subdir_url));
        let cache_state = SubdirCacheState::from_path(&cache_state).ok();

        let state = compute_initial_state(&json_path, cache_state.as_ref(), params);

        Self { channel, platform, ignore_failure, subdir_url, cache, state, cache_state }
    }

    /// The current lifecycle state.
    pub fn state(&self) -> &LoaderState {
        &self.state
    }

    /// The validated JSON path, if this loader has reached `Valid` or
    /// `ExpiredUse`.
    pub fn valid_json_cache_path(&self) -> Option<&std::path::Path> {
        match &self.state {
            LoaderState::Valid { path } | LoaderState::ExpiredUse { path } => Some(path),
            _ => None,
        }
    }

    /// Whether `has_shards` is known fresh-and-true right now.
    pub fn has_up_to_date_shards(&self, ttl: chrono::Duration) -> bool {
        self.cache_state
            .as_ref()
            .and_then(|s| s.has_shards.as_ref())
            .is_some_and(|e| e.is_fresh(ttl) && e.value)
    }

    /// The URL the shard index would be fetched from, if shards are
    /// available for this subdir.
    pub fn shards_index_url(&self) -> Url {
        self.subdir_url.join("repodata_shards.msgpack.zst").expect("subdir URL is a valid base")
    }
}

fn json_url(subdir_url: &Url) -> Url {
    subdir_url.join("repodata.json").expect("subdir URL is a valid base")
}

fn compute_initial_state(json_path: &std::path::Path, cache_state: Option<&SubdirCacheState>, params: &SubdirParams) -> LoaderState {
    let Ok(metadata) = std::fs::metadata(json_path) else {
        return LoaderState::NoCache;
    };
    let Some(cache_state) = cache_state else {
        return LoaderState::Checking;
    };
    if !cache_state.matches_file(&metadata) {
        return LoaderState::Checking;
    }

    if params.offline {
        return LoaderState::Valid { path: json_path.to_owned() };
    }

    let mtime = metadata
        .modified()
        .map(chrono::DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());

    if let Some(ttl) = params.local_repodata_ttl {
        if Utc::now().signed_duration_since(mtime) < ttl {
            return LoaderState::Valid { path: json_path.to_owned() };
        }
    }
    if cache_state.headers.is_fresh_by_cache_control(mtime) {
        return LoaderState::Valid { path: json_path.to_owned() };
    }

    LoaderState::Checking
}

/// Drives every loader not already `Valid`/`Forbidden`/`Error` through
/// phase A (HEAD checks) then phase B (downloads).
/// Post-condition: every loader ends in `Valid`, `ExpiredUse`, `Forbidden`,
/// or `Error`.
#[tracing::instrument(skip_all)]
pub async fn download_required_indexes(
    loaders: &mut [SubdirIndexLoader],
    mirrors: &MirrorMap,
    remote_params: &RemoteFetchParams,
    auth_db: &AuthenticationDb,
    params: &SubdirParams,
    download_params: &SubdirDownloadParams,
    stop: &StopToken,
) -> CoreResult<()> {
    run_phase_a(loaders, mirrors, remote_params, auth_db, download_params, stop).await;
    run_phase_b(loaders, mirrors, remote_params, auth_db, params, stop).await;

    let errors: Vec<CoreError> = loaders
        .iter()
        .filter_map(|loader| match &loader.state {
            LoaderState::Error(message) if !loader.ignore_failure => Some(CoreError::Unknown(message.clone())),
            _ => None,
        })
        .collect();
    match CoreError::aggregate(errors) {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

async fn run_phase_a(
    loaders: &mut [SubdirIndexLoader],
    mirrors: &MirrorMap,
    remote_params: &RemoteFetchParams,
    auth_db: &AuthenticationDb,
    download_params: &SubdirDownloadParams,
    stop: &StopToken,
) {
    let mut requests = Vec::new();
    let mut indices = Vec::new();
    for (i, loader) in loaders.iter().enumerate() {
        if matches!(loader.state, LoaderState::Valid { .. } | LoaderState::Forbidden | LoaderState::Error(_)) {
            continue;
        }
        if download_params.repodata_check_zst {
            requests.push(
                Request::get(format!("{}/zst-check", loader.platform), loader.channel.id.clone(), format!("{}/repodata.json.zst", loader.platform)).head(),
            );
            indices.push((i, CheckKind::Zst));
        }
        requests.push(
            Request::get(format!("{}/shards-check", loader.platform), loader.channel.id.clone(), format!("{}/repodata_shards.msgpack.zst", loader.platform)).head(),
        );
        indices.push((i, CheckKind::Shards));
    }

    if requests.is_empty() {
        return;
    }

    let outcomes = fetch::download(requests, mirrors, remote_params, auth_db, stop).await;
    for ((i, kind), outcome) in indices.into_iter().zip(outcomes) {
        let loader = &mut loaders[i];
        let present = matches!(outcome, FetchOutcome::Success { .. });
        let now = Expiring::now(present);
        let json_url = json_url(&loader.subdir_url);
        let mut cache_state = loader.cache_state.take().unwrap_or_else(|| SubdirCacheState {
            url: json_url.clone(),
            headers: CacheHeaders::default(),
            has_zst: None,
            has_shards: None,
            mtime_ns: 0,
            size: 0,
        });
        match kind {
            CheckKind::Zst => cache_state.has_zst = Some(now),
            CheckKind::Shards => cache_state.has_shards = Some(now),
        }
        debug!(channel = %loader.channel.id, platform = %loader.platform, ?kind, present, "phase A check complete");
        loader.cache_state = Some(cache_state);
        if matches!(loader.state, LoaderState::NoCache | LoaderState::Checking) {
            loader.state = LoaderState::Downloading;
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum CheckKind {
    Zst,
    Shards,
}

async fn run_phase_b(
    loaders: &mut [SubdirIndexLoader],
    mirrors: &MirrorMap,
    remote_params: &RemoteFetchParams,
    auth_db: &AuthenticationDb,
    params: &SubdirParams,
    stop: &StopToken,
) {
    let mut requests = Vec::new();
    let mut indices = Vec::new();
    for (i, loader) in loaders.iter().enumerate() {
        if matches!(loader.state, LoaderState::Valid { .. } | LoaderState::Forbidden | LoaderState::Error(_)) {
            continue;
        }
        let use_zst = params.repodata_force_use_zst
            || loader.cache_state.as_ref().and_then(|s| s.has_zst.as_ref()).is_some_and(|e| e.value);
        let filename = if use_zst { "repodata.json.zst" } else { "repodata.json" };
        let mut request = Request::get(loader.platform.clone(), loader.channel.id.clone(), format!("{}/{filename}", loader.platform));
        if let Some(state) = &loader.cache_state {
            request = request.with_conditional(state.headers.etag.clone(), state.headers.last_modified.clone());
        }
        requests.push(request);
        indices.push(i);
    }

    if requests.is_empty() {
        return;
    }

    let outcomes = fetch::download(requests, mirrors, remote_params, auth_db, stop).await;
    for (i, outcome) in indices.into_iter().zip(outcomes) {
        apply_phase_b_outcome(&mut loaders[i], outcome, params).await;
    }
}

/// Runs zstd decompression and JSON-header validation (both CPU-bound) on
/// a blocking-pool thread so neither stalls the async runtime.
async fn decode_and_validate_repodata(bytes: Vec<u8>, is_zst: bool) -> CoreResult<Vec<u8>> {
    simple_spawn_blocking::tokio::run_blocking_task(move || {
        let decoded = if is_zst {
            crate::decompress::decompress_capped(&bytes).map_err(CoreError::Unknown)?
        } else {
            bytes
        };
        validate_repodata_json(&decoded).map_err(CoreError::Unknown)?;
        Ok(decoded)
    })
    .await
}

async fn apply_phase_b_outcome(loader: &mut SubdirIndexLoader, outcome: FetchOutcome, params: &SubdirParams) {
    let json_path = loader.cache.json_path(&json_url(&loader.subdir_url));
    let _lock = match loader.cache.lock_for(&json_url(&loader.subdir_url), "repodata.json") {
        Ok(lock) => lock,
        Err(e) => {
            loader.state = LoaderState::Error(format!("acquiring cache lock: {e}"));
            return;
        }
    };
    match outcome {
        FetchOutcome::Success { content: Content::NotModified, cache_control, etag, last_modified, .. } => {
            if let Ok(metadata) = std::fs::metadata(&json_path) {
                let mut state = loader.cache_state.clone().unwrap_or_else(|| SubdirCacheState {
                    url: json_url(&loader.subdir_url),
                    headers: CacheHeaders::default(),
                    has_zst: None,
                    has_shards: None,
                    mtime_ns: 0,
                    size: 0,
                });
                state.headers = CacheHeaders { etag, last_modified, cache_control };
                write_state_for(&json_path, &mut state, &metadata);
                let _ = state.to_path(&loader.cache.state_path(&json_url(&loader.subdir_url)));
                loader.cache_state = Some(state);
                loader.state = LoaderState::Valid { path: json_path };
            } else {
                loader.state = LoaderState::Error("received 304 but no cached file exists".to_string());
            }
        }
        FetchOutcome::Success { content, cache_control, etag, last_modified, .. } => {
            let bytes = match content {
                Content::Buffer(bytes) => bytes.to_vec(),
                Content::File(path) => match std::fs::read(&path) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        loader.state = LoaderState::Error(format!("reading downloaded file: {e}"));
                        return;
                    }
                },
                Content::NotModified => unreachable!("handled above"),
            };
            let is_zst = loader.subdir_url.as_str().ends_with(".zst") || bytes.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]);
            let decoded = match decode_and_validate_repodata(bytes, is_zst).await {
                Ok(d) => d,
                Err(e) => {
                    loader.state = LoaderState::Error(e.to_string());
                    return;
                }
            };

            if let Some(parent) = json_path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            let tmp = json_path.with_extension("json.tmp");
            if let Err(e) = std::fs::write(&tmp, &decoded) {
                loader.state = LoaderState::Error(format!("writing temp file: {e}"));
                return;
            }
            if let Err(e) = std::fs::rename(&tmp, &json_path) {
                loader.state = LoaderState::Error(format!("renaming into place: {e}"));
                return;
            }

            let Ok(metadata) = std::fs::metadata(&json_path) else {
                loader.state = LoaderState::Error("cache file vanished after rename".to_string());
                return;
            };
            let mut state = SubdirCacheState {
                url: json_url(&loader.subdir_url),
                headers: CacheHeaders { etag, last_modified, cache_control },
                has_zst: loader.cache_state.as_ref().and_then(|s| s.has_zst.clone()),
                has_shards: loader.cache_state.as_ref().and_then(|s| s.has_shards.clone()),
                mtime_ns: 0,
                size: 0,
            };
            write_state_for(&json_path, &mut state, &metadata);
            let _ = state.to_path(&loader.cache.state_path(&json_url(&loader.subdir_url)));
            loader.cache_state = Some(state);
            loader.state = LoaderState::Valid { path: json_path };
        }
        FetchOutcome::Error { message, .. } => {
            if params.offline {
                if let Some(path) = loader.valid_json_cache_path().map(ToOwned::to_owned).or_else(|| {
                    std::fs::metadata(&json_path).ok().map(|_| json_path.clone())
                }) {
                    loader.state = LoaderState::ExpiredUse { path };
                    return;
                }
            }
            loader.state = LoaderState::Error(message);
        }
    }
}

fn write_state_for(path: &std::path::Path, state: &mut SubdirCacheState, metadata: &std::fs::Metadata) {
    state.mtime_ns = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0);
    state.size = metadata.len();
    let _ = path; // path kept for signature symmetry with on-disk layout callers
}

/// Parses `bytes` only far enough to confirm they are a structurally valid
/// `repodata.json`: full record deserialization is explicitly out of scope
/// for this loader.
fn validate_repodata_json(bytes: &[u8]) -> Result<(), String> {
    let value: serde_json::Value = serde_json::from_slice(bytes).map_err(|e| format!("repodata.json is not valid JSON: {e}"))?;
    let serde_json::Value::Object(root) = value else {
        return Err("repodata.json root is not an object".to_string());
    };
    for key in ["packages", "conda_packages", "removed"] {
        if let Some(value) = root.get(key) {
            let ok = match key {
                "removed" => value.is_array(),
                _ => value.is_object(),
            };
            if !ok {
                return Err(format!("repodata.json field '{key}' has an unexpected shape"));
            }
        }
    }
    Ok(())
}
