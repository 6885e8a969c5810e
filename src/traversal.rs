//! Repodata Subset — Traversal.
//!
//! Given a set of root package names and one or more [`Shards`], walks
//! the dependency graph implied by each shard's `depends`/`constrains`
//! entries and computes the set of packages reachable from the roots.
//! Expressed as an explicit work queue over a `HashMap<NodeId, Node>`
//! rather than recursion, so depth is bounded only by available memory.

use crate::error::{CoreError, CoreResult, StopToken};
use crate::matchspec;
use crate::shards::Shards;
use crate::types::ShardDict;
use std::collections::{HashMap, VecDeque};
use tracing::warn;
use url::Url;

/// A traversal node's identity. Two nodes are equal when package,
/// channel, and shard URL all match, so the same package name visited
/// through two different channels (or two different shard sets serving
/// the same channel) is tracked separately.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeId {
    /// The package name.
    pub package: String,
    /// The id of the channel the owning [`Shards`] was constructed from.
    pub channel: String,
    /// The shard-index URL of the owning [`Shards`].
    pub shard_url: Url,
}

/// Per-node traversal bookkeeping.
#[derive(Debug, Clone, Copy)]
pub struct Node {
    /// BFS level: 0 for seeds, parent's distance + 1 otherwise.
    pub distance: u32,
    /// Whether this node's shard has been loaded and expanded.
    pub visited: bool,
}

/// Controls how pending nodes are fetched and expanded. Both strategies
/// converge on the same final node set; this only affects I/O shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Batch all not-yet-present shards by owning channel per BFS level,
    /// then decode and expand the whole level at once.
    Bfs,
    /// Fetch and expand one pending node at a time. Finer-grained
    /// pipelining of I/O and decoding, at the cost of more requests.
    #[default]
    Pipelined,
}

/// Extracts the set of package names mentioned by a shard's records.
///
/// Takes the union of `depends` and `constrains` across every record
/// (both `.tar.bz2` and `.conda`), parses each entry as a MatchSpec and
/// keeps its name, discards empty/free names, and dedupes the result.
/// Kept as a standalone, independently testable free function rather
/// than a method on `Shards` or `RepodataSubset`.
pub fn shard_mentioned_packages(shard: &ShardDict) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut names = Vec::new();
    for (_, record) in shard.all_records() {
        for dep in record.depends.iter().chain(record.constrains.iter()) {
            if let Some(name) = matchspec::package_name(dep) {
                if seen.insert(name.clone()) {
                    names.push(name);
                }
            }
        }
    }
    names
}

/// Computes the reachable-package closure across a fixed set of
/// [`Shards`] instances.
///
/// Borrows its `Shards` mutably (fetching shards mutates their visited
/// set), so one `RepodataSubset` owns exclusive access to the instances
/// it was built from for the duration of the traversal.
pub struct RepodataSubset<'a> {
    shards: Vec<&'a mut Shards>,
    strategy: Strategy,
    nodes: HashMap<NodeId, Node>,
}

impl<'a> RepodataSubset<'a> {
    /// Builds a traversal over `shards`, using `strategy` to decide how
    /// pending nodes are fetched.
    pub fn new(shards: Vec<&'a mut Shards>, strategy: Strategy) -> Self {
        Self { shards, strategy, nodes: HashMap::new() }
    }

    /// The node set accumulated by the most recent [`RepodataSubset::reachable`] call.
    pub fn nodes(&self) -> &HashMap<NodeId, Node> {
        &self.nodes
    }

    /// Computes the closure reachable from `roots`.
    ///
    /// If `root_shards` is given, only seeds whose owning shard-index
    /// URL is in that filter are kept; this lets a caller restrict the
    /// traversal's entry points without touching the `Shards` set
    /// itself.
    pub async fn reachable(
        &mut self,
        roots: &[String],
        root_shards: Option<&[Url]>,
        stop: &StopToken,
    ) -> CoreResult<()> {
        self.nodes.clear();
        let mut pending: VecDeque<NodeId> = VecDeque::new();

        for root in roots {
            for shards in &self.shards {
                if !shards.contains(root) {
                    continue;
                }
                let url = shards.url().clone();
                if let Some(filter) = root_shards {
                    if !filter.contains(&url) {
                        continue;
                    }
                }
                let id = NodeId { package: root.clone(), channel: shards.channel_id().to_string(), shard_url: url };
                if self.nodes.contains_key(&id) {
                    continue;
                }
                self.nodes.insert(id.clone(), Node { distance: 0, visited: false });
                pending.push_back(id);
            }
        }

        match self.strategy {
            Strategy::Pipelined => self.reachable_pipelined(pending, stop).await,
            Strategy::Bfs => self.reachable_bfs(pending, stop).await,
        }
    }

    async fn reachable_pipelined(&mut self, mut pending: VecDeque<NodeId>, stop: &StopToken) -> CoreResult<()> {
        while let Some(id) = pending.pop_front() {
            if stop.is_stopped() {
                return Err(CoreError::UserInterrupted);
            }
            let distance = self.nodes.get(&id).map(|n| n.distance).unwrap_or(0);
            let neighbors = self.expand_one(&id, stop).await;
            for neighbor in neighbors {
                if self.nodes.contains_key(&neighbor) {
                    continue;
                }
                self.nodes.insert(neighbor.clone(), Node { distance: distance + 1, visited: false });
                pending.push_back(neighbor);
            }
            if let Some(node) = self.nodes.get_mut(&id) {
                node.visited = true;
            }
        }
        Ok(())
    }

    async fn reachable_bfs(&mut self, seed: VecDeque<NodeId>, stop: &StopToken) -> CoreResult<()> {
        let mut level: Vec<NodeId> = seed.into_iter().collect();
        while !level.is_empty() {
            if stop.is_stopped() {
                return Err(CoreError::UserInterrupted);
            }

            // Batch not-yet-present shards by owning channel so each
            // `Shards` instance issues one `fetch_shards` call for the
            // whole level instead of one per node.
            let mut by_shard_url: HashMap<Url, Vec<String>> = HashMap::new();
            for id in &level {
                by_shard_url.entry(id.shard_url.clone()).or_default().push(id.package.clone());
            }
            for shards in self.shards.iter_mut() {
                if let Some(names) = by_shard_url.get(shards.url()) {
                    let to_fetch: Vec<String> =
                        names.iter().filter(|n| !shards.is_shard_present(n)).cloned().collect();
                    if !to_fetch.is_empty() {
                        shards.fetch_shards(&to_fetch, stop).await?;
                    }
                }
            }

            let mut next_level = Vec::new();
            for id in &level {
                let distance = self.nodes.get(id).map(|n| n.distance).unwrap_or(0);
                let neighbors = self.expand_loaded(id);
                for neighbor in neighbors {
                    if self.nodes.contains_key(&neighbor) {
                        continue;
                    }
                    self.nodes.insert(neighbor.clone(), Node { distance: distance + 1, visited: false });
                    next_level.push(neighbor);
                }
                if let Some(node) = self.nodes.get_mut(id) {
                    node.visited = true;
                }
            }
            level = next_level;
        }
        Ok(())
    }

    /// Fetches `id`'s shard on demand (if needed) and returns its
    /// neighbors. Fetch failures are logged and treated as a leaf.
    async fn expand_one(&mut self, id: &NodeId, stop: &StopToken) -> Vec<NodeId> {
        for shards in self.shards.iter_mut() {
            if shards.url() != &id.shard_url {
                continue;
            }
            if !shards.is_shard_present(&id.package) {
                if let Err(e) = shards.fetch_shard(&id.package, stop).await {
                    warn!(package = %id.package, error = %e, "fetching shard during traversal");
                    return Vec::new();
                }
            }
            break;
        }
        self.expand_loaded(id)
    }

    /// Returns `id`'s neighbors assuming its shard is already loaded (or
    /// silently empty if it is not).
    fn expand_loaded(&self, id: &NodeId) -> Vec<NodeId> {
        let owner = self.shards.iter().find(|s| s.url() == &id.shard_url);
        let Some(owner) = owner else { return Vec::new() };
        let Ok(dict) = owner.visit_package(&id.package) else { return Vec::new() };

        let mut neighbors = Vec::new();
        for name in shard_mentioned_packages(dict) {
            for shards in &self.shards {
                if !shards.contains(&name) {
                    continue;
                }
                let Ok(shard_url) = shards.shard_url(&name) else { continue };
                neighbors.push(NodeId {
                    package: name.clone(),
                    channel: shards.channel_id().to_string(),
                    shard_url,
                });
            }
        }
        neighbors
    }
}
