//! Lightweight MatchSpec package-name extraction.
//!
//! The full MatchSpec grammar (channels, subdirs, version ranges, build
//! string globs, bracketed key-value pairs, URL specs) is parsing
//! machinery a solver needs and a repodata walker does not. Shard
//! traversal only ever needs the bare package name out of a `depends`
//! or `constrains` string, so this module implements just that slice
//! of the grammar rather than pulling in a full parser.

/// First character that can start a version constraint (`>1.2`, `=1.0`,
/// `~=1.0`, `!=1.0`), matching the conda MatchSpec grammar.
fn is_start_of_version_constraint(c: char) -> bool {
    matches!(c, '>' | '<' | '=' | '!' | '~')
}

/// Extracts the bare package name from a MatchSpec-like dependency
/// string, or `None` if the spec has no concrete name (a bare wildcard,
/// a URL spec, or an empty/unparseable string).
///
/// Handles the forms actually found in `depends`/`constrains` entries:
/// - `numpy`
/// - `numpy >=1.20,<2`
/// - `numpy[version='>=1.20']`
/// - `conda-forge::numpy >=1.20`
/// - `conda-forge/linux-64::numpy`
pub fn package_name(spec: &str) -> Option<String> {
    let spec = spec.trim();
    if spec.is_empty() {
        return None;
    }

    // A URL-like spec (`https://.../numpy-1.2.3-py310.conda`) names a
    // concrete archive, not a package name we can extract textually.
    if spec.contains("://") {
        return None;
    }

    // `channel::name` / `channel/subdir::name`: only the part after the
    // last `::` is the name+version+build portion.
    let after_channel = match spec.rsplit_once("::") {
        Some((_, rest)) => rest.trim(),
        None => spec,
    };
    if after_channel.is_empty() {
        return None;
    }

    // Bracketed key-value pairs (`[version='1.2.3']`) always trail the
    // name, so truncating at the first `[` is safe.
    let before_brackets = match after_channel.split_once('[') {
        Some((head, _)) => head.trim(),
        None => after_channel,
    };

    let name: String = before_brackets
        .chars()
        .take_while(|&c| !c.is_whitespace() && !is_start_of_version_constraint(c))
        .collect();
    let name = name.trim();

    if name.is_empty() || name == "*" {
        return None;
    }
    Some(name.to_string())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn extracts_bare_name() {
        assert_eq!(package_name("numpy"), Some("numpy".to_string()));
    }

    #[test]
    fn extracts_name_with_version_range() {
        assert_eq!(package_name("numpy >=1.20,<2"), Some("numpy".to_string()));
    }

    #[test]
    fn extracts_name_with_exact_version_no_space() {
        assert_eq!(package_name("numpy==1.20.0"), Some("numpy".to_string()));
    }

    #[test]
    fn extracts_name_with_bracket_list() {
        assert_eq!(package_name("numpy[version='>=1.20']"), Some("numpy".to_string()));
    }

    #[test]
    fn strips_channel_prefix() {
        assert_eq!(package_name("conda-forge::numpy >=1.20"), Some("numpy".to_string()));
    }

    #[test]
    fn strips_channel_and_subdir_prefix() {
        assert_eq!(package_name("conda-forge/linux-64::numpy"), Some("numpy".to_string()));
    }

    #[test]
    fn bare_wildcard_has_no_name() {
        assert_eq!(package_name("*"), None);
    }

    #[test]
    fn url_spec_has_no_extractable_name() {
        assert_eq!(package_name("https://example.com/numpy-1.2.3-py310.conda"), None);
    }

    #[test]
    fn empty_string_has_no_name() {
        assert_eq!(package_name(""), None);
        assert_eq!(package_name("   "), None);
    }
}
