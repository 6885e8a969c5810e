//! Plain data types shared by every component.

mod channel;
mod noarch;
mod package_record;
mod repodata;
mod shard;
mod wire;

pub use channel::Channel;
pub use noarch::NoArchType;
pub use package_record::{decode_record, RecordDecode, ShardPackageRecord};
pub use repodata::{sort_records, Repodata};
pub use shard::{decode_shard_file, decode_shards_index, RepoMetadata, ShardDict, ShardsIndex};
pub use wire::{bytes_to_hex, hash_as_hex, hash_bytes, key_as_str, map_get};
