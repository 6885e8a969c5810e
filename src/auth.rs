//! Authentication database lookup.
//!
//! This module only implements the in-memory prefix-weakening *lookup*
//! algorithm. Loading credentials from a keyring, netrc file, or token
//! store is the surrounding application's job - it builds an
//! [`AuthenticationDb`] however it likes and hands it to the fetch engine.

use std::collections::HashMap;

/// One stored credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// HTTP Basic authentication.
    Basic {
        /// Username.
        user: String,
        /// Password.
        password: String,
    },
    /// An `Authorization: Bearer <token>` header.
    BearerToken(String),
    /// A conda-style token inserted as a `/t/<token>/` path segment.
    CondaToken(String),
}

/// A map from URL prefix to credential, with prefix-weakening lookup.
#[derive(Debug, Clone, Default)]
pub struct AuthenticationDb {
    entries: HashMap<String, Credential>,
}

impl AuthenticationDb {
    /// Creates an empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a credential under the given URL prefix (scheme included).
    pub fn insert(&mut self, prefix: impl Into<String>, credential: Credential) {
        self.entries.insert(normalize(&prefix.into()), credential);
    }

    /// Looks up the most specific stored prefix that covers `url`.
    ///
    /// Starting from the full URL, trailing path segments are stripped one
    /// at a time (then trailing slashes), and the first exact match wins.
    /// This means a stored prefix `"mamba.org/private"` authenticates
    /// `"mamba.org/private/channel"` but not `"mamba.org/public"`.
    pub fn lookup(&self, url: &str) -> Option<&Credential> {
        let normalized = normalize(url);
        for candidate in prefixes(&normalized) {
            if let Some(credential) = self.entries.get(candidate) {
                return Some(credential);
            }
        }
        None
    }
}

fn normalize(s: &str) -> String {
    s.trim_end_matches('/').to_string()
}

/// Yields `url`, then progressively shorter path prefixes of it, each with
/// trailing slashes stripped, down to the bare scheme+host.
fn prefixes(url: &str) -> impl Iterator<Item = &str> {
    std::iter::successors(Some(url), |current| {
        let trimmed = current.trim_end_matches('/');
        // Strip one path segment.
        let without_segment = match trimmed.rfind('/') {
            Some(idx) if has_path_boundary(trimmed, idx) => &trimmed[..idx],
            _ => return None,
        };
        if without_segment.is_empty() || without_segment == trimmed {
            None
        } else {
            Some(without_segment)
        }
    })
}

/// True if stripping at byte index `idx` would not eat into the
/// `scheme://host` portion of the URL (i.e. leave at least one `/` of the
/// `://` separator behind).
fn has_path_boundary(s: &str, idx: usize) -> bool {
    match s.find("://") {
        Some(scheme_end) => idx > scheme_end + 2,
        None => true,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exact_match() {
        let mut db = AuthenticationDb::new();
        db.insert("https://mamba.org/private", Credential::BearerToken("t".into()));
        assert_eq!(
            db.lookup("https://mamba.org/private"),
            Some(&Credential::BearerToken("t".into()))
        );
    }

    #[test]
    fn prefix_weakening_matches_nested_path() {
        let mut db = AuthenticationDb::new();
        db.insert("mamba.org/private", Credential::BearerToken("t".into()));
        assert_eq!(
            db.lookup("mamba.org/private/channel/linux-64/repodata.json"),
            Some(&Credential::BearerToken("t".into()))
        );
    }

    #[test]
    fn disjoint_prefix_does_not_match() {
        let mut db = AuthenticationDb::new();
        db.insert("mamba.org/private", Credential::BearerToken("t".into()));
        assert_eq!(db.lookup("mamba.org/public/channel"), None);
    }

    #[test]
    fn most_specific_prefix_wins() {
        let mut db = AuthenticationDb::new();
        db.insert("mamba.org", Credential::BearerToken("outer".into()));
        db.insert("mamba.org/private", Credential::BearerToken("inner".into()));
        assert_eq!(
            db.lookup("mamba.org/private/channel"),
            Some(&Credential::BearerToken("inner".into()))
        );
    }

    #[test]
    fn no_match_returns_none() {
        let db = AuthenticationDb::new();
        assert_eq!(db.lookup("https://example.com/x"), None);
    }
}
