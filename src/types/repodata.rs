//! The assembled, monolithic repodata structure.

use super::package_record::ShardPackageRecord;
use super::shard::RepoMetadata;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A deterministic monolithic repodata structure assembled from visited
/// shards, for consumption by a downstream solver.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repodata {
    /// Channel/subdir metadata, copied from the originating [`super::ShardsIndex`].
    pub info: RepoMetadata,
    /// Always `2` for data produced by this crate.
    pub repodata_version: u64,
    /// `.tar.bz2` records, filename keyed, in deterministic sort order.
    pub packages: Vec<(String, ShardPackageRecord)>,
    /// `.conda` records, filename keyed, in deterministic sort order.
    pub conda_packages: Vec<(String, ShardPackageRecord)>,
}

impl Repodata {
    /// An empty repodata with the given metadata and `repodata_version = 2`.
    pub fn empty(info: RepoMetadata) -> Self {
        Self {
            info,
            repodata_version: 2,
            packages: Vec::new(),
            conda_packages: Vec::new(),
        }
    }
}

/// Sorts filename-keyed records by a deterministic key: name ascending,
/// parsed version descending (falling back to raw string descending
/// when parsing fails or disagrees), build number descending, build
/// string descending. Ties are left in input order (a stable sort).
pub fn sort_records(records: &mut [(String, ShardPackageRecord)]) {
    records.sort_by(|(_, a), (_, b)| compare_records(a, b));
}

fn compare_records(a: &ShardPackageRecord, b: &ShardPackageRecord) -> Ordering {
    a.name
        .cmp(&b.name)
        .then_with(|| compare_versions_descending(&a.version, &b.version))
        .then_with(|| b.build_number.cmp(&a.build_number))
        .then_with(|| b.build.cmp(&a.build))
}

fn compare_versions_descending(a: &str, b: &str) -> Ordering {
    match (parse_version(a), parse_version(b)) {
        (Some(pa), Some(pb)) => pb.cmp(&pa),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => b.cmp(a),
    }
}

/// A deliberately minimal dotted-numeric version parser, sufficient to order
/// conda-style versions (`1.2.3`, `2021.11`) without pulling in full
/// PEP-440/conda version-spec semantics, which are the solver's concern, not
/// this crate's.
fn parse_version(v: &str) -> Option<Vec<u64>> {
    let mut parts = Vec::new();
    for segment in v.split(['.', '-', '_']) {
        let digits: String = segment.chars().take_while(|c| c.is_ascii_digit()).collect();
        if digits.is_empty() || digits.len() != segment.len() {
            return None;
        }
        parts.push(digits.parse().ok()?);
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn rec(name: &str, version: &str, build_number: u64, build: &str) -> ShardPackageRecord {
        ShardPackageRecord {
            name: name.into(),
            version: version.into(),
            build: build.into(),
            build_number,
            sha256: None,
            md5: None,
            size: None,
            depends: vec![],
            constrains: vec![],
            noarch: None,
        }
    }

    #[test]
    fn sorts_by_name_then_version_descending() {
        let mut records = vec![
            ("b-1.0-0.conda".to_string(), rec("b", "1.0", 0, "0")),
            ("a-1.0-0.conda".to_string(), rec("a", "1.0", 0, "0")),
            ("a-2.0-0.conda".to_string(), rec("a", "2.0", 0, "0")),
        ];
        sort_records(&mut records);
        let names: Vec<_> = records.iter().map(|(_, r)| (r.name.as_str(), r.version.as_str())).collect();
        assert_eq!(names, vec![("a", "2.0"), ("a", "1.0"), ("b", "1.0")]);
    }

    #[test]
    fn build_number_breaks_version_ties_descending() {
        let mut records = vec![
            ("a-1.0-0.conda".to_string(), rec("a", "1.0", 0, "0")),
            ("a-1.0-1.conda".to_string(), rec("a", "1.0", 1, "0")),
        ];
        sort_records(&mut records);
        assert_eq!(records[0].1.build_number, 1);
    }

    #[test]
    fn unparsable_version_falls_back_to_raw_string_descending() {
        let mut records = vec![
            ("a-dev-0.conda".to_string(), rec("a", "dev", 0, "0")),
            ("a-rc1-0.conda".to_string(), rec("a", "rc1", 0, "0")),
        ];
        sort_records(&mut records);
        assert_eq!(records[0].1.version, "rc1");
    }

    #[test]
    fn parsed_version_wins_over_unparsable() {
        let mut records = vec![
            ("a-dev-0.conda".to_string(), rec("a", "dev", 0, "0")),
            ("a-1.0-0.conda".to_string(), rec("a", "1.0", 0, "0")),
        ];
        sort_records(&mut records);
        assert_eq!(records[0].1.version, "1.0");
    }
}
