//! Helpers for reading msgpack maps where a value's wire shape can vary.
//!
//! The shard wire format lets hashes and the names of optional keys
//! arrive in more than one shape: a SHA-256/MD5 digest may be sent as
//! raw bytes (`Bin`) or as a hex string (`Str`), and a map key may be
//! sent as either a string or `Bin`. Rather than threading a
//! type-switch through every call site, we centralize the shape
//! normalization here and let every caller work with plain
//! `&str`/`Vec<u8>`.

use rmpv::Value;

/// Returns the string key of a msgpack map entry, accepting both `Str` and
/// `Bin` representations.
pub fn key_as_str(value: &Value) -> Option<&str> {
    match value {
        Value::String(s) => s.as_str(),
        Value::Binary(b) => std::str::from_utf8(b).ok(),
        _ => None,
    }
}

/// Interprets a msgpack value as a byte string, accepting `Bin` directly or
/// decoding `Str` as hex. Returns `None` for any other shape, or for
/// odd-length hex input.
pub fn hash_bytes(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::Binary(bytes) => Some(bytes.clone()),
        Value::String(s) => {
            let s = s.as_str()?;
            if s.len() % 2 != 0 {
                return None;
            }
            hex::decode(s).ok()
        }
        _ => None,
    }
}

/// Canonical in-memory form of a hash: lowercase hex.
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

/// Interprets a msgpack value as a hex-encoded hash string, accepting either
/// wire shape and normalizing to lowercase hex.
pub fn hash_as_hex(value: &Value) -> Option<String> {
    hash_bytes(value).map(|b| bytes_to_hex(&b))
}

/// Reads an integer value, accepting any msgpack integer width/signedness.
pub fn as_u64(value: &Value) -> Option<u64> {
    value.as_u64().or_else(|| value.as_i64().map(|v| v.max(0) as u64))
}

/// Reads a plain UTF-8 string value.
pub fn as_str(value: &Value) -> Option<&str> {
    value.as_str()
}

/// Reads an array of strings leniently: a missing key yields an empty vector
/// with no warning, while an explicit `null` or any other non-array shape
/// yields an empty vector with a warning (the caller's responsibility to
/// log, since this helper has no logging context).
pub fn as_string_list(value: Option<&Value>) -> (Vec<String>, bool) {
    match value {
        None => (Vec::new(), false),
        Some(Value::Array(items)) => (
            items
                .iter()
                .filter_map(|v| v.as_str().map(ToOwned::to_owned))
                .collect(),
            false,
        ),
        Some(Value::Nil) | Some(_) => (Vec::new(), true),
    }
}

/// Looks up a key (string-or-binary) in a msgpack map.
pub fn map_get<'a>(map: &'a [(Value, Value)], key: &str) -> Option<&'a Value> {
    map.iter()
        .find(|(k, _)| key_as_str(k) == Some(key))
        .map(|(_, v)| v)
}
