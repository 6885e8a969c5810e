//! End-to-end scenarios driven against a real local HTTP server rather
//! than mocks.

mod support;

use mamba_repodata::auth::AuthenticationDb;
use mamba_repodata::cache::CacheStore;
use mamba_repodata::error::StopToken;
use mamba_repodata::fetch::params::RemoteFetchParams;
use mamba_repodata::mirror::MirrorMap;
use mamba_repodata::shards::index::fetch_and_parse_shard_index;
use mamba_repodata::shards::Shards;
use mamba_repodata::subdir::params::{SubdirDownloadParams, SubdirParams};
use mamba_repodata::subdir::{download_required_indexes, LoaderState, SubdirIndexLoader};
use mamba_repodata::traversal::{RepodataSubset, Strategy};
use mamba_repodata::types::Channel;
use rmpv::Value;
use support::{encode_msgpack, init_tracing, zstd_compress, TestChannelServer};
use tempfile::TempDir;

fn test_channel(server_url: url::Url) -> Channel {
    let id = server_url.to_string();
    Channel { id, url: server_url, platforms: vec!["linux-64".to_string()] }
}

const FAKE_REPO_DATA: &str = r#"{
    "info": { "subdir": "linux-64" },
    "packages": {},
    "conda_packages": {
        "numpy-1.26.0-py310.conda": {
            "name": "numpy",
            "version": "1.26.0",
            "build": "py310",
            "build_number": 0,
            "depends": ["python >=3.10"],
            "constrains": []
        }
    },
    "removed": []
}"#;

#[tokio::test]
async fn fresh_cache_no_shards() {
    init_tracing();
    let channel_dir = TempDir::new().unwrap();
    std::fs::create_dir_all(channel_dir.path().join("linux-64")).unwrap();
    std::fs::write(channel_dir.path().join("linux-64/repodata.json"), FAKE_REPO_DATA).unwrap();
    let server = TestChannelServer::new(channel_dir.path()).await;

    let cache_dir = TempDir::new().unwrap();
    let cache = CacheStore::new(cache_dir.path().to_owned());
    cache.ensure_dir().unwrap();

    let channel = test_channel(server.url());
    let mut loader = SubdirIndexLoader::new(channel, "linux-64", cache.clone(), false, &SubdirParams::default());
    assert_matches::assert_matches!(loader.state(), LoaderState::NoCache);

    let mirrors = MirrorMap::new();
    let auth = AuthenticationDb::new();
    let remote_params = RemoteFetchParams::default();
    let stop = StopToken::new();

    download_required_indexes(
        std::slice::from_mut(&mut loader),
        &mirrors,
        &remote_params,
        &auth,
        &SubdirParams::default(),
        &SubdirDownloadParams::default(),
        &stop,
    )
    .await
    .unwrap();

    let path = loader.valid_json_cache_path().expect("loader should have a validated cache path");
    let contents = std::fs::read_to_string(path).unwrap();
    assert!(contents.contains("numpy"));
}

#[tokio::test]
async fn repeat_check_gets_not_modified() {
    init_tracing();
    let channel_dir = TempDir::new().unwrap();
    std::fs::create_dir_all(channel_dir.path().join("linux-64")).unwrap();
    std::fs::write(channel_dir.path().join("linux-64/repodata.json"), FAKE_REPO_DATA).unwrap();
    let server = TestChannelServer::new(channel_dir.path()).await;

    let cache_dir = TempDir::new().unwrap();
    let cache = CacheStore::new(cache_dir.path().to_owned());
    cache.ensure_dir().unwrap();

    let mirrors = MirrorMap::new();
    let auth = AuthenticationDb::new();
    let remote_params = RemoteFetchParams::default();
    let stop = StopToken::new();

    // First pass populates the cache.
    let channel = test_channel(server.url());
    let mut loader = SubdirIndexLoader::new(channel.clone(), "linux-64", cache.clone(), false, &SubdirParams::default());
    download_required_indexes(
        std::slice::from_mut(&mut loader),
        &mirrors,
        &remote_params,
        &auth,
        &SubdirParams::default(),
        &SubdirDownloadParams::default(),
        &stop,
    )
    .await
    .unwrap();
    let first_path = loader.valid_json_cache_path().unwrap().to_owned();
    let first_mtime = std::fs::metadata(&first_path).unwrap().modified().unwrap();

    // The static server's Last-Modified header only has second precision;
    // without a short sleep the second pass could race the clock and the
    // conditional GET would spuriously mismatch.
    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;

    // Second loader sees a cache entry whose freshness (no Cache-Control
    // header, no configured TTL) forces a re-check, but the server has not
    // changed, so it should come back as 304 and leave the file untouched.
    let mut loader2 = SubdirIndexLoader::new(channel, "linux-64", cache.clone(), false, &SubdirParams::default());
    assert_matches::assert_matches!(loader2.state(), LoaderState::Checking);
    download_required_indexes(
        std::slice::from_mut(&mut loader2),
        &mirrors,
        &remote_params,
        &auth,
        &SubdirParams::default(),
        &SubdirDownloadParams::default(),
        &stop,
    )
    .await
    .unwrap();

    let second_path = loader2.valid_json_cache_path().unwrap();
    assert_eq!(second_path, first_path);
    let second_mtime = std::fs::metadata(second_path).unwrap().modified().unwrap();
    assert_eq!(first_mtime, second_mtime);
}

fn shard_index_bytes(shards: &[(&str, [u8; 32])], shards_base_url: &str) -> Vec<u8> {
    let v = Value::Map(vec![
        (
            Value::String("info".into()),
            Value::Map(vec![
                (Value::String("base_url".into()), Value::String("./".into())),
                (Value::String("shards_base_url".into()), Value::String(shards_base_url.into())),
                (Value::String("subdir".into()), Value::String("linux-64".into())),
            ]),
        ),
        (Value::String("version".into()), Value::Integer(1.into())),
        (
            Value::String("shards".into()),
            Value::Map(shards.iter().map(|(name, hash)| (Value::String((*name).into()), Value::Binary(hash.to_vec()))).collect()),
        ),
    ]);
    zstd_compress(&encode_msgpack(&v))
}

fn shard_file_bytes(name: &str, depends: &[&str]) -> Vec<u8> {
    let record = Value::Map(vec![
        (Value::String("name".into()), Value::String(name.into())),
        (Value::String("version".into()), Value::String("1.0".into())),
        (Value::String("build".into()), Value::String("0".into())),
        (Value::String("build_number".into()), Value::Integer(0.into())),
        (
            Value::String("depends".into()),
            Value::Array(depends.iter().map(|d| Value::String((*d).into())).collect()),
        ),
    ]);
    let v = Value::Map(vec![(
        Value::String("packages.conda".into()),
        Value::Map(vec![(Value::String(format!("{name}-1.0-0.conda")), record)]),
    )]);
    zstd_compress(&encode_msgpack(&v))
}

fn hash_of(name: &str) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(name.as_bytes());
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

#[tokio::test]
async fn shards_happy_path_no_reachable_dependency() {
    init_tracing();
    let channel_dir = TempDir::new().unwrap();
    let linux64 = channel_dir.path().join("linux-64");
    std::fs::create_dir_all(linux64.join("shards")).unwrap();

    let numpy_hash = hash_of("numpy");
    let cython_hash = hash_of("cython");
    let index = shard_index_bytes(&[("numpy", numpy_hash), ("cython", cython_hash)], "./shards");
    std::fs::write(linux64.join("repodata_shards.msgpack.zst"), &index).unwrap();
    std::fs::write(
        linux64.join(format!("shards/{}.msgpack.zst", hex::encode(numpy_hash))),
        shard_file_bytes("numpy", &["python_abi >=3.10"]),
    )
    .unwrap();

    let server = TestChannelServer::new(channel_dir.path()).await;
    let cache_dir = TempDir::new().unwrap();
    let cache = CacheStore::new(cache_dir.path().to_owned());
    cache.ensure_dir().unwrap();

    let mirrors = MirrorMap::new();
    let auth = AuthenticationDb::new();
    let remote_params = RemoteFetchParams::default();
    let stop = StopToken::new();
    let channel = test_channel(server.url());

    let shards_url = server.url().join("linux-64/repodata_shards.msgpack.zst").unwrap();
    let index = fetch_and_parse_shard_index(
        &shards_url,
        "linux-64",
        channel.id.as_str(),
        &cache,
        &mirrors,
        &remote_params,
        &auth,
        true,
        &stop,
    )
    .await
    .unwrap()
    .expect("shard index should parse");

    let mut shards = Shards::new(index, shards_url, channel, mirrors, auth, remote_params, cache, Some(4));

    let mut subset = RepodataSubset::new(vec![&mut shards], Strategy::Pipelined);
    subset.reachable(&["numpy".to_string()], None, &stop).await.unwrap();

    // numpy's only dependency, python_abi, isn't in this shard index, so
    // the closure is exactly {numpy}.
    assert_eq!(subset.nodes().len(), 1);

    let repodata = shards.build_repodata();
    assert_eq!(repodata.conda_packages.len(), 1);
}

#[rstest::rstest]
#[case::bfs(Strategy::Bfs)]
#[case::pipelined(Strategy::Pipelined)]
#[tokio::test]
async fn traversal_follows_dependency_chain_and_handles_cycles(#[case] strategy: Strategy) {
    init_tracing();
    let channel_dir = TempDir::new().unwrap();
    let linux64 = channel_dir.path().join("linux-64");
    std::fs::create_dir_all(linux64.join("shards")).unwrap();

    let a = hash_of("a");
    let b = hash_of("b");
    let c = hash_of("c");
    let index = shard_index_bytes(&[("a", a), ("b", b), ("c", c)], "./shards");
    std::fs::write(linux64.join("repodata_shards.msgpack.zst"), &index).unwrap();
    std::fs::write(linux64.join(format!("shards/{}.msgpack.zst", hex::encode(a))), shard_file_bytes("a", &["b", "nonexistent"])).unwrap();
    std::fs::write(linux64.join(format!("shards/{}.msgpack.zst", hex::encode(b))), shard_file_bytes("b", &["c", "a"])).unwrap();
    std::fs::write(linux64.join(format!("shards/{}.msgpack.zst", hex::encode(c))), shard_file_bytes("c", &[])).unwrap();

    let server = TestChannelServer::new(channel_dir.path()).await;
    let cache_dir = TempDir::new().unwrap();
    let cache = CacheStore::new(cache_dir.path().to_owned());
    cache.ensure_dir().unwrap();

    let mirrors = MirrorMap::new();
    let auth = AuthenticationDb::new();
    let remote_params = RemoteFetchParams::default();
    let stop = StopToken::new();
    let channel = test_channel(server.url());

    let shards_url = server.url().join("linux-64/repodata_shards.msgpack.zst").unwrap();
    let index = fetch_and_parse_shard_index(&shards_url, "linux-64", channel.id.as_str(), &cache, &mirrors, &remote_params, &auth, true, &stop)
        .await
        .unwrap()
        .unwrap();

    let mut shards = Shards::new(index, shards_url, channel, mirrors, auth, remote_params, cache, Some(4));
    let mut subset = RepodataSubset::new(vec![&mut shards], strategy);
    subset.reachable(&["a".to_string()], None, &stop).await.unwrap();

    // a -> b -> c, with a cycle back from b to a and a's dangling
    // "nonexistent" dependency. The closure is exactly {a, b, c} and the
    // cycle does not cause non-termination, regardless of traversal order.
    let nodes = subset.nodes();
    assert_eq!(nodes.len(), 3);
    let distance_of = |name: &str| nodes.iter().find(|(id, _)| id.package == name).unwrap().1.distance;
    assert_eq!(distance_of("a"), 0);
    assert_eq!(distance_of("b"), 1);
    assert_eq!(distance_of("c"), 2);
}

#[tokio::test]
async fn partial_shard_failure_is_logged_and_omitted() {
    init_tracing();
    let channel_dir = TempDir::new().unwrap();
    let linux64 = channel_dir.path().join("linux-64");
    std::fs::create_dir_all(linux64.join("shards")).unwrap();

    let a = hash_of("a");
    let b = hash_of("b");
    // Shard index advertises both `a` and `b`, but only `a`'s file is
    // actually present on the server, standing in for "every retry of
    // b's download fails".
    let index = shard_index_bytes(&[("a", a), ("b", b)], "./shards");
    std::fs::write(linux64.join("repodata_shards.msgpack.zst"), &index).unwrap();
    std::fs::write(linux64.join(format!("shards/{}.msgpack.zst", hex::encode(a))), shard_file_bytes("a", &[])).unwrap();

    let server = TestChannelServer::new(channel_dir.path()).await;
    let cache_dir = TempDir::new().unwrap();
    let cache = CacheStore::new(cache_dir.path().to_owned());
    cache.ensure_dir().unwrap();

    let mirrors = MirrorMap::new();
    let auth = AuthenticationDb::new();
    let mut remote_params = RemoteFetchParams::default();
    remote_params.max_retries = 0;
    let stop = StopToken::new();
    let channel = test_channel(server.url());

    let shards_url = server.url().join("linux-64/repodata_shards.msgpack.zst").unwrap();
    let index = fetch_and_parse_shard_index(&shards_url, "linux-64", channel.id.as_str(), &cache, &mirrors, &remote_params, &auth, true, &stop)
        .await
        .unwrap()
        .unwrap();

    let mut shards = Shards::new(index, shards_url, channel, mirrors, auth, remote_params, cache, Some(4));
    shards.fetch_shards(&["a".to_string(), "b".to_string()], &stop).await.unwrap();

    assert!(shards.is_shard_present("a"));
    assert!(!shards.is_shard_present("b"));
}
