//! Shards.
//!
//! Lazily materializes individual per-package shards and composes them
//! into a monolithic [`Repodata`].

pub mod index;

use crate::auth::AuthenticationDb;
use crate::cache::CacheStore;
use crate::decompress::decompress_capped;
use crate::error::{CoreError, CoreResult, StopToken};
use crate::fetch::{self, params::RemoteFetchParams, Content, FetchOutcome, Request};
use crate::mirror::MirrorMap;
use crate::types::{decode_shard_file, sort_records, Channel, Repodata, ShardDict, ShardsIndex};
use ahash::HashMap;
use tracing::warn;
use url::Url;

/// Default concurrent-shard-download budget.
pub const DEFAULT_DOWNLOAD_THREADS: usize = 10;

/// Owns one `ShardsIndex` and the per-package shards fetched from it so
/// far. The visited set is exclusive to this instance; callers share a
/// `Shards` by reference.
#[derive(Debug)]
pub struct Shards {
    index: ShardsIndex,
    index_url: Url,
    channel: Channel,
    mirrors: MirrorMap,
    auth_db: AuthenticationDb,
    remote_params: RemoteFetchParams,
    cache: CacheStore,
    download_threads: usize,
    shards_base_url: Url,
    visited: HashMap<String, ShardDict>,
}

impl Shards {
    /// Constructs a `Shards` from a just-loaded index.
    pub fn new(
        index: ShardsIndex,
        index_url: Url,
        channel: Channel,
        mirrors: MirrorMap,
        auth_db: AuthenticationDb,
        remote_params: RemoteFetchParams,
        cache: CacheStore,
        download_threads: Option<usize>,
    ) -> Self {
        let shards_base_url = derive_shards_base_url(&index, &index_url);
        Self {
            index,
            index_url,
            channel,
            mirrors,
            auth_db,
            remote_params,
            cache,
            download_threads: download_threads.unwrap_or(DEFAULT_DOWNLOAD_THREADS),
            shards_base_url,
            visited: HashMap::default(),
        }
    }

    /// The URL the shard index was fetched from.
    pub fn url(&self) -> &Url {
        &self.index_url
    }

    /// The id of the channel this `Shards` was constructed from.
    pub fn channel_id(&self) -> &str {
        &self.channel.id
    }

    /// Where package archives for this channel live.
    pub fn base_url(&self) -> &str {
        self.index.info.as_ref().map(|i| i.base_url.as_str()).unwrap_or("")
    }

    /// The platform subdirectory this `Shards` covers.
    pub fn subdir(&self) -> &str {
        self.index.info.as_ref().map(|i| i.subdir.as_str()).unwrap_or("")
    }

    /// Every package name mentioned by the shard index, in arbitrary order.
    pub fn package_names(&self) -> impl Iterator<Item = &str> {
        self.index.shards.keys().map(String::as_str)
    }

    /// Whether `name` is mentioned by the shard index at all.
    pub fn contains(&self, name: &str) -> bool {
        self.index.shards.contains_key(name)
    }

    /// Whether `name`'s shard content is already in memory.
    pub fn is_shard_present(&self, name: &str) -> bool {
        self.visited.contains_key(name)
    }

    /// The URL an individual shard would be fetched from.
    pub fn shard_url(&self, name: &str) -> CoreResult<Url> {
        let hash = self
            .index
            .shards
            .get(name)
            .ok_or_else(|| CoreError::Unknown(format!("package '{name}' is not in this shard index")))?;
        self.shards_base_url
            .join(&format!("{}.msgpack.zst", hex::encode(hash)))
            .map_err(|e| CoreError::Unknown(format!("invalid shard url for '{name}': {e}")))
    }

    /// The in-memory `ShardDict` for `name`.
    pub fn visit_package(&self, name: &str) -> CoreResult<&ShardDict> {
        self.visited
            .get(name)
            .ok_or_else(|| CoreError::RepodataNotLoaded(format!("shard for '{name}' has not been fetched yet")))
    }

    /// Convenience wrapper over [`Shards::fetch_shards`] for one package.
    pub async fn fetch_shard(&mut self, name: &str, stop: &StopToken) -> CoreResult<()> {
        self.fetch_shards(std::slice::from_ref(&name.to_string()), stop).await
    }

    /// At-most-once fetch: names already in memory are skipped; the rest
    /// are downloaded in parallel, bounded by `download_threads`.
    /// Individual failures are logged and simply absent from the result
    /// set afterward.
    pub async fn fetch_shards(&mut self, names: &[String], stop: &StopToken) -> CoreResult<()> {
        let mut to_fetch = Vec::new();
        for name in names {
            if !self.index.shards.contains_key(name.as_str()) || self.visited.contains_key(name.as_str()) {
                continue;
            }
            let hash = self.index.shards[name.as_str()];
            if let Ok(bytes) = std::fs::read(self.cache.shard_path(&hash)) {
                match decode_shard_blocking(bytes).await {
                    Ok(dict) => {
                        self.visited.insert(name.clone(), dict);
                        continue;
                    }
                    Err(e) => warn!(package = %name, error = %e, "cached shard failed to decode, refetching"),
                }
            }
            to_fetch.push((name.clone(), hash));
        }
        if to_fetch.is_empty() {
            return Ok(());
        }

        // `remote_params.download_threads` already bounds how many of these
        // requests are in flight at once; `download_threads` here
        // additionally caps how many downloaded shards this call will
        // decode, matching the `Shards` constructor's own thread budget.
        let mut requests = Vec::with_capacity(to_fetch.len());
        let mut urls = Vec::with_capacity(to_fetch.len());
        for (name, hash) in &to_fetch {
            let url = self.shard_url(name)?;
            let _ = hash;
            requests.push(build_shard_request(name, &self.channel, &url));
            urls.push(url);
        }

        let mut shard_remote_params = self.remote_params.clone();
        shard_remote_params.download_threads = self.download_threads;
        let outcomes = fetch::download(requests, &self.mirrors, &shard_remote_params, &self.auth_db, stop).await;

        for (((name, hash), url), outcome) in to_fetch.into_iter().zip(urls).zip(outcomes) {
            match outcome {
                FetchOutcome::Success { content, .. } => {
                    let bytes = match content {
                        Content::Buffer(b) => b.to_vec(),
                        Content::File(path) => match std::fs::read(&path) {
                            Ok(b) => b,
                            Err(e) => {
                                warn!(package = %name, error = %e, "reading downloaded shard");
                                continue;
                            }
                        },
                        Content::NotModified => continue,
                    };
                    match decode_shard_blocking(bytes.clone()).await {
                        Ok(dict) => {
                            let shard_path = self.cache.shard_path(&hash);
                            match self.cache.lock_for(&url, "shard") {
                                Ok(_lock) => {
                                    if let Some(parent) = shard_path.parent() {
                                        let _ = std::fs::create_dir_all(parent);
                                    }
                                    let _ = std::fs::write(&shard_path, &bytes);
                                }
                                Err(e) => warn!(package = %name, error = %e, "acquiring cache lock for shard"),
                            }
                            self.visited.insert(name, dict);
                        }
                        Err(e) => warn!(package = %name, error = %e, "decoding shard"),
                    }
                }
                FetchOutcome::Error { message, .. } => {
                    warn!(package = %name, error = %message, "fetching shard");
                }
            }
        }

        Ok(())
    }

    /// Assembles a deterministic [`Repodata`] from the visited set.
    pub fn build_repodata(&self) -> Repodata {
        let mut packages = Vec::new();
        let mut conda_packages = Vec::new();
        for dict in self.visited.values() {
            for (filename, record) in &dict.packages {
                packages.push((filename.clone(), record.clone()));
            }
            for (filename, record) in &dict.conda_packages {
                conda_packages.push((filename.clone(), record.clone()));
            }
        }
        sort_records(&mut packages);
        sort_records(&mut conda_packages);

        let info = self.index.info.clone().unwrap_or_default();
        Repodata { info, repodata_version: 2, packages, conda_packages }
    }
}

fn build_shard_request(name: &str, channel: &Channel, url: &Url) -> Request {
    if url.host_str() == channel.url.host_str() {
        Request::get(name, channel.id.clone(), url.path().trim_start_matches('/'))
    } else {
        // Cross-host shard URLs go through the pass-through mirror: the
        // fetch engine treats a mirror name that parses as an absolute URL
        // as its own base, so a fully-qualified shard URL works without a
        // registered mirror entry.
        Request::get(name, url.as_str(), "")
    }
}

fn derive_shards_base_url(index: &ShardsIndex, index_url: &Url) -> Url {
    let raw = index.info.as_ref().map(|i| i.shards_base_url.as_str()).unwrap_or("");
    if let Ok(absolute) = Url::parse(raw) {
        return ensure_trailing_slash(absolute);
    }
    let trimmed = raw.trim_start_matches("./").trim_start_matches('/');
    let relative = if trimmed.is_empty() { "." } else { trimmed };
    let base = index_url.join(&format!("{relative}/")).unwrap_or_else(|_| index_url.clone());
    ensure_trailing_slash(base)
}

fn ensure_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

fn decode_shard(bytes: &[u8]) -> Result<ShardDict, String> {
    let decompressed = decompress_capped(bytes)?;
    let (dict, warnings) = decode_shard_file(&decompressed)?;
    for warning in warnings {
        warn!(%warning, "shard record decode warning");
    }
    Ok(dict)
}

/// Runs [`decode_shard`] (zstd decompress + msgpack decode, both CPU-bound)
/// on a blocking-pool thread so it never stalls the async runtime.
async fn decode_shard_blocking(bytes: Vec<u8>) -> CoreResult<ShardDict> {
    simple_spawn_blocking::tokio::run_blocking_task(move || decode_shard(&bytes).map_err(CoreError::Unknown)).await
}
