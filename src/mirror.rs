//! Mirror selection.
//!
//! A `MirrorMap` records, per channel base URL, an ordered list of mirror
//! base URLs to try in turn. It performs no network I/O itself; the fetch
//! engine consults it to build the list of candidate URLs for a request.
//!
//! Selection is round-robin with last-success preference: each channel
//! remembers the index of the mirror that last answered successfully, and
//! the next call starts there, rotating to the following candidate on each
//! subsequent retry attempt within the same call.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use url::Url;

/// Maps a channel base URL to an ordered list of mirrors.
#[derive(Debug, Clone, Default)]
pub struct MirrorMap {
    mirrors: HashMap<String, Vec<Url>>,
    last_success: Arc<DashMap<String, usize>>,
}

impl MirrorMap {
    /// Creates an empty map; every URL resolves to itself only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers mirrors for `channel`, tried in the given order.
    pub fn insert(&mut self, channel: impl Into<String>, mirrors: Vec<Url>) {
        self.mirrors.insert(channel.into(), mirrors);
    }

    /// Returns the candidate base URLs for `channel`, in the order they
    /// should be tried. If no mirrors are registered, `channel` itself
    /// (parsed as a URL) is the sole candidate — an already-absolute URL
    /// that isn't mirrored passes straight through.
    pub fn candidates(&self, channel: &str) -> Vec<Url> {
        if let Some(mirrors) = self.mirrors.get(channel) {
            return mirrors.clone();
        }
        Url::parse(channel).map(|u| vec![u]).unwrap_or_default()
    }

    /// Picks the mirror to use for `channel` on the given 1-based `attempt`,
    /// starting from the last mirror recorded successful for this channel
    /// (or index 0 if none yet) and advancing one candidate per attempt.
    /// Returns the chosen URL together with its index, so a later
    /// [`MirrorMap::record_success`] can remember it.
    pub fn select(&self, channel: &str, attempt: u32) -> Option<(Url, usize)> {
        let candidates = self.candidates(channel);
        if candidates.is_empty() {
            return None;
        }
        // A single candidate has nothing to rotate between; skip the
        // last-success lookup so callers with one-off, never-repeated
        // channel keys (e.g. a fully-qualified shard URL) don't grow
        // `last_success` with an entry that's never consulted again.
        if candidates.len() == 1 {
            return Some((candidates[0].clone(), 0));
        }
        let start = self.last_success.get(channel).map(|e| *e).unwrap_or(0);
        let index = (start + (attempt.saturating_sub(1) as usize)) % candidates.len();
        Some((candidates[index].clone(), index))
    }

    /// Records that `index` answered successfully for `channel`, so future
    /// calls prefer it first. A no-op for channels with at most one
    /// candidate, since there's no preference to remember.
    pub fn record_success(&self, channel: &str, index: usize) {
        let candidate_count = self.mirrors.get(channel).map_or(1, Vec::len);
        if candidate_count <= 1 {
            return;
        }
        self.last_success.insert(channel.to_string(), index);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unregistered_channel_falls_back_to_itself() {
        let map = MirrorMap::new();
        let candidates = map.candidates("https://conda.anaconda.org/conda-forge");
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].as_str(), "https://conda.anaconda.org/conda-forge");
    }

    #[test]
    fn registered_channel_returns_mirrors_in_order() {
        let mut map = MirrorMap::new();
        let a = Url::parse("https://mirror-a.example/conda-forge").unwrap();
        let b = Url::parse("https://mirror-b.example/conda-forge").unwrap();
        map.insert("https://conda.anaconda.org/conda-forge", vec![a.clone(), b.clone()]);
        assert_eq!(
            map.candidates("https://conda.anaconda.org/conda-forge"),
            vec![a, b]
        );
    }

    #[test]
    fn invalid_unregistered_channel_yields_no_candidates() {
        let map = MirrorMap::new();
        assert!(map.candidates("not a url").is_empty());
    }

    fn two_mirror_map() -> (MirrorMap, Url, Url) {
        let mut map = MirrorMap::new();
        let a = Url::parse("https://mirror-a.example/conda-forge").unwrap();
        let b = Url::parse("https://mirror-b.example/conda-forge").unwrap();
        map.insert("conda-forge", vec![a.clone(), b.clone()]);
        (map, a, b)
    }

    #[test]
    fn first_attempt_with_no_history_picks_the_first_mirror() {
        let (map, a, _b) = two_mirror_map();
        let (url, index) = map.select("conda-forge", 1).unwrap();
        assert_eq!(url, a);
        assert_eq!(index, 0);
    }

    #[test]
    fn later_attempts_round_robin_to_the_next_mirror() {
        let (map, a, b) = two_mirror_map();
        assert_eq!(map.select("conda-forge", 1).unwrap().0, a);
        assert_eq!(map.select("conda-forge", 2).unwrap().0, b);
        assert_eq!(map.select("conda-forge", 3).unwrap().0, a);
    }

    #[test]
    fn subsequent_calls_prefer_the_last_successful_mirror() {
        let (map, _a, b) = two_mirror_map();
        map.record_success("conda-forge", 1);
        let (url, index) = map.select("conda-forge", 1).unwrap();
        assert_eq!(url, b);
        assert_eq!(index, 1);
    }

    #[test]
    fn select_on_empty_candidates_returns_none() {
        let map = MirrorMap::new();
        assert!(map.select("not a url", 1).is_none());
    }

    #[test]
    fn single_candidate_channel_does_not_grow_last_success() {
        let map = MirrorMap::new();
        let channel = "https://conda.anaconda.org/conda-forge/noarch/some-shard.msgpack.zst";
        map.select(channel, 1).unwrap();
        map.record_success(channel, 0);
        assert!(map.last_success.is_empty());
    }
}

