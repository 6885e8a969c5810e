//! Shared zstd decompression with a hard output-size cap, so a malicious
//! or corrupt payload can't be used to exhaust memory via decompression.

use std::io::Read;

/// Anything that would decompress past this is rejected outright rather
/// than allowed to exhaust memory.
pub const MAX_DECOMPRESSED_BYTES: u64 = 100 * 1024 * 1024;

/// Decompresses `bytes` as zstd, refusing to produce more than
/// [`MAX_DECOMPRESSED_BYTES`].
pub fn decompress_capped(bytes: &[u8]) -> Result<Vec<u8>, String> {
    let decoder = zstd::stream::Decoder::new(bytes).map_err(|e| format!("zstd: {e}"))?;
    let mut limited = decoder.take(MAX_DECOMPRESSED_BYTES + 1);
    let mut out = Vec::new();
    limited.read_to_end(&mut out).map_err(|e| format!("zstd: {e}"))?;
    if out.len() as u64 > MAX_DECOMPRESSED_BYTES {
        return Err(format!("decompressed payload exceeds {MAX_DECOMPRESSED_BYTES} byte cap"));
    }
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;

    fn zstd_compress(data: &[u8]) -> Vec<u8> {
        zstd::stream::encode_all(data, 0).unwrap()
    }

    #[test]
    fn round_trips_small_payload() {
        let original = b"hello shard index";
        let compressed = zstd_compress(original);
        assert_eq!(decompress_capped(&compressed).unwrap(), original);
    }

    #[test]
    fn rejects_corrupt_input() {
        assert!(decompress_capped(b"not zstd at all").is_err());
    }

    #[test]
    fn rejects_payload_over_the_cap() {
        let original = vec![7u8; (MAX_DECOMPRESSED_BYTES + 16) as usize];
        let compressed = zstd_compress(&original);
        let err = decompress_capped(&compressed).unwrap_err();
        assert!(err.contains("exceeds"));
    }
}
