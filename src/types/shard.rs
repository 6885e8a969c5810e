//! `ShardDict`, `RepoMetadata` and `ShardsIndex`.

use super::package_record::{decode_record, RecordDecode, ShardPackageRecord};
use super::wire::{self, key_as_str, map_get};
use ahash::HashMap;
use rmpv::Value;
use serde::{Deserialize, Serialize};

/// Where a channel's package archives and shards live.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoMetadata {
    /// Where package archives live.
    #[serde(default)]
    pub base_url: String,
    /// Where shard files live, relative-to-repodata or absolute.
    #[serde(default)]
    pub shards_base_url: String,
    /// The platform subdirectory this metadata describes.
    #[serde(default)]
    pub subdir: String,
}

/// Two filename-keyed maps of package records: `.tar.bz2` and `.conda`.
///
/// Invariant: every record's `name` equals the name key under which this
/// `ShardDict` is stored in its owning [`ShardsIndex`]; callers that build a
/// `ShardDict` from an untrusted wire payload should not assume this holds
/// without checking.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardDict {
    /// Records for `.tar.bz2` archives, keyed by filename.
    pub packages: HashMap<String, ShardPackageRecord>,
    /// Records for `.conda` archives, keyed by filename.
    pub conda_packages: HashMap<String, ShardPackageRecord>,
}

impl ShardDict {
    /// Iterates over every record in this shard, `.tar.bz2` then `.conda`.
    pub fn all_records(&self) -> impl Iterator<Item = (&str, &ShardPackageRecord)> {
        self.packages
            .iter()
            .chain(self.conda_packages.iter())
            .map(|(k, v)| (k.as_str(), v))
    }
}

/// A parsed `repodata_shards.msgpack.zst`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardsIndex {
    /// Channel/subdir metadata.
    pub info: Option<RepoMetadata>,
    /// Shard format version. Recognizes both the `version` and
    /// `repodata_version` wire keys.
    pub version: u64,
    /// Package name to 32-byte SHA-256 shard hash.
    pub shards: HashMap<String, [u8; 32]>,
}

/// Decodes a `ShardsIndex` from decompressed msgpack bytes.
///
/// A missing `info` or `shards` key only produces a warning (the caller is
/// expected to log it); the partial index is still returned.
/// A shard hash of any shape other than 32 raw bytes, or odd-length hex, is
/// skipped with a warning but does not fail the whole index.
pub fn decode_shards_index(bytes: &[u8]) -> Result<(ShardsIndex, Vec<String>), String> {
    let value: Value = rmpv::decode::read_value(&mut std::io::Cursor::new(bytes))
        .map_err(|e| format!("msgpack decode failed: {e}"))?;
    let Value::Map(root) = value else {
        return Err("shard index root is not a map".to_string());
    };

    let mut warnings = Vec::new();

    let info = match map_get(&root, "info") {
        Some(Value::Map(entries)) => Some(RepoMetadata {
            base_url: map_get(entries, "base_url")
                .and_then(wire::as_str)
                .unwrap_or_default()
                .to_owned(),
            shards_base_url: map_get(entries, "shards_base_url")
                .and_then(wire::as_str)
                .unwrap_or_default()
                .to_owned(),
            subdir: map_get(entries, "subdir")
                .and_then(wire::as_str)
                .unwrap_or_default()
                .to_owned(),
        }),
        Some(_) => {
            warnings.push("'info' present but not a map; ignoring".to_string());
            None
        }
        None => {
            warnings.push("shard index is missing 'info'".to_string());
            None
        }
    };

    let version = map_get(&root, "version")
        .or_else(|| map_get(&root, "repodata_version"))
        .and_then(wire::as_u64)
        .unwrap_or(1);

    let mut shards = HashMap::default();
    match map_get(&root, "shards") {
        Some(Value::Map(entries)) => {
            for (key, value) in entries {
                let Some(name) = key_as_str(key) else {
                    warnings.push("shard entry has a non-string name; skipping".to_string());
                    continue;
                };
                match wire::hash_bytes(value) {
                    Some(bytes) if bytes.len() == 32 => {
                        let mut hash = [0u8; 32];
                        hash.copy_from_slice(&bytes);
                        shards.insert(name.to_owned(), hash);
                    }
                    Some(bytes) => {
                        warnings.push(format!(
                            "shard hash for '{name}' is {} bytes, expected 32; skipping",
                            bytes.len()
                        ));
                    }
                    None => {
                        warnings.push(format!(
                            "shard hash for '{name}' has an unrecognized wire shape; skipping"
                        ));
                    }
                }
            }
        }
        Some(_) => warnings.push("'shards' present but not a map; ignoring".to_string()),
        None => warnings.push("shard index is missing 'shards'".to_string()),
    }

    Ok((
        ShardsIndex {
            info,
            version,
            shards,
        },
        warnings,
    ))
}

/// Decodes a single per-package shard file (`packages`/`packages.conda`
/// maps of filename to record).
pub fn decode_shard_file(bytes: &[u8]) -> Result<(ShardDict, Vec<String>), String> {
    let value: Value = rmpv::decode::read_value(&mut std::io::Cursor::new(bytes))
        .map_err(|e| format!("msgpack decode failed: {e}"))?;
    let Value::Map(root) = value else {
        return Err("shard root is not a map".to_string());
    };

    let mut warnings = Vec::new();
    let packages = decode_record_map(map_get(&root, "packages"), &mut warnings);
    let conda_packages = decode_record_map(map_get(&root, "packages.conda"), &mut warnings);

    Ok((
        ShardDict {
            packages,
            conda_packages,
        },
        warnings,
    ))
}

fn decode_record_map(
    value: Option<&Value>,
    warnings: &mut Vec<String>,
) -> HashMap<String, ShardPackageRecord> {
    let mut out = HashMap::default();
    let Some(Value::Map(entries)) = value else {
        return out;
    };
    for (key, record_value) in entries {
        let Some(filename) = key_as_str(key) else {
            warnings.push("record entry has a non-string filename; skipping".to_string());
            continue;
        };
        match decode_record(filename, record_value) {
            RecordDecode::Ok(record) => {
                out.insert(filename.to_owned(), record);
            }
            RecordDecode::Skipped { filename, reason } => {
                warnings.push(format!("skipping record '{filename}': {reason}"));
            }
        }
    }
    out
}
