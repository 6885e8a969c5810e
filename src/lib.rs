#![deny(missing_docs)]

//! `mamba_repodata` fetches, caches, decodes and traverses conda repodata.
//!
//! This crate is the sharded-repodata core of a conda-compatible package
//! manager: it knows how to pull a per-subdirectory `repodata.json` (with
//! HTTP conditional-GET freshness and zstd negotiation), how to pull a
//! sharded index (`repodata_shards.msgpack.zst` plus per-package shard
//! files), and how to walk the dependency graph across one or more shard
//! sets to compute a closure of reachable packages for a downstream solver.
//!
//! What this crate does *not* do: parse CLI arguments, load configuration
//! files, activate shells, link or unlink environments, solve dependency
//! constraints, extract package archives, or load an authentication store
//! from disk. Those are the job of the surrounding application.

pub mod auth;
pub mod cache;
mod decompress;
pub mod error;
pub mod fetch;
pub mod matchspec;
pub mod mirror;
pub mod redact;
pub mod shards;
pub mod subdir;
pub mod traversal;
pub mod types;

pub use error::{CoreError, CoreResult};
