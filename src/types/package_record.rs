//! `ShardPackageRecord`: the canonical in-memory package record.

use super::noarch::NoArchType;
use super::wire::{self, map_get};
use rmpv::Value;
use serde::{Deserialize, Serialize};

/// A single package record as it appears inside a shard.
///
/// Optional hashes always end up as lowercase hex in memory regardless of
/// whether the wire form was `Bin` or `Str`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardPackageRecord {
    /// Package name. Must equal the key this record's [`super::ShardDict`]
    /// is stored under in its [`super::ShardsIndex`].
    pub name: String,
    /// Package version string.
    pub version: String,
    /// Build string.
    pub build: String,
    /// Build number.
    pub build_number: u64,
    /// SHA-256 digest, canonical lowercase hex.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    /// MD5 digest, canonical lowercase hex.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
    /// Archive size in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Names of dependency match specs.
    #[serde(default)]
    pub depends: Vec<String>,
    /// Names of constrain match specs.
    #[serde(default)]
    pub constrains: Vec<String>,
    /// Architecture-independence marker.
    #[serde(default, deserialize_with = "super::noarch::deserialize_optional_noarch", skip_serializing_if = "Option::is_none")]
    pub noarch: Option<NoArchType>,
}

/// The outcome of decoding one record out of a shard map: either a record,
/// or a reason it was skipped. Never a hard failure: a bad record is
/// skipped with a warning rather than failing the whole shard.
pub enum RecordDecode {
    /// The record decoded successfully.
    Ok(ShardPackageRecord),
    /// The record was missing a required field and was skipped.
    Skipped {
        /// The map key this record was stored under.
        filename: String,
        /// Why the record was skipped.
        reason: &'static str,
    },
}

/// Decodes a single package record from its msgpack map representation.
///
/// `filename` is the map key this record was stored under; it is only used
/// for diagnostics, it is not itself a field of [`ShardPackageRecord`].
pub fn decode_record(filename: &str, value: &Value) -> RecordDecode {
    let Value::Map(entries) = value else {
        return RecordDecode::Skipped {
            filename: filename.to_owned(),
            reason: "record is not a map",
        };
    };

    let Some(name) = map_get(entries, "name").and_then(wire::as_str) else {
        return RecordDecode::Skipped {
            filename: filename.to_owned(),
            reason: "missing or non-string 'name'",
        };
    };
    let Some(version) = map_get(entries, "version").and_then(wire::as_str) else {
        return RecordDecode::Skipped {
            filename: filename.to_owned(),
            reason: "missing or non-string 'version'",
        };
    };
    let Some(build) = map_get(entries, "build").and_then(wire::as_str) else {
        return RecordDecode::Skipped {
            filename: filename.to_owned(),
            reason: "missing or non-string 'build'",
        };
    };
    let Some(build_number) = map_get(entries, "build_number").and_then(wire::as_u64) else {
        return RecordDecode::Skipped {
            filename: filename.to_owned(),
            reason: "missing or non-integer 'build_number'",
        };
    };

    let sha256 = map_get(entries, "sha256").and_then(wire::hash_as_hex);
    let md5 = map_get(entries, "md5").and_then(wire::hash_as_hex);
    let size = map_get(entries, "size").and_then(wire::as_u64);

    let (depends, depends_warned) = wire::as_string_list(map_get(entries, "depends"));
    let (constrains, constrains_warned) = wire::as_string_list(map_get(entries, "constrains"));
    if depends_warned {
        tracing::warn!(filename, "'depends' was present but not an array; treating as empty");
    }
    if constrains_warned {
        tracing::warn!(filename, "'constrains' was present but not an array; treating as empty");
    }

    let noarch = match map_get(entries, "noarch") {
        None | Some(Value::Nil) => None,
        Some(Value::Boolean(true)) => Some(NoArchType::Generic),
        Some(Value::Boolean(false)) => None,
        Some(v) => match wire::as_str(v) {
            Some(s) if s.eq_ignore_ascii_case("python") => Some(NoArchType::Python),
            Some(s) if s.eq_ignore_ascii_case("generic") => Some(NoArchType::Generic),
            _ => {
                tracing::warn!(filename, "unrecognized 'noarch' value; ignoring");
                None
            }
        },
    };

    RecordDecode::Ok(ShardPackageRecord {
        name: name.to_owned(),
        version: version.to_owned(),
        build: build.to_owned(),
        build_number,
        sha256,
        md5,
        size,
        depends,
        constrains,
        noarch,
    })
}
