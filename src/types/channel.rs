//! Minimal stand-ins for the channel/platform types repodata handling
//! depends on.
//!
//! A full `Channel`/`Platform` model (name normalization, multi-mirror
//! aliasing, channel config files) belongs to the CLI/config layer. This
//! crate only needs the handful of fields the fetch/cache/traversal
//! components actually read.

use serde::{Deserialize, Serialize};
use url::Url;

/// A resolved channel location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    /// A stable identifier for this channel, used to key traversal nodes
    /// and disambiguate package names that exist identically in more than
    /// one channel.
    pub id: String,
    /// The channel's base URL, e.g. `https://conda.anaconda.org/conda-forge`.
    pub url: Url,
    /// Platform subdirectories this channel is known to carry
    /// (e.g. `linux-64`, `noarch`).
    pub platforms: Vec<String>,
}

impl Channel {
    /// Builds the URL of one of this channel's subdirectories, e.g.
    /// `<url>/linux-64/`.
    pub fn subdir_url(&self, platform: &str) -> Url {
        let mut url = self.url.clone();
        let path = url.path().to_owned();
        let path = if path.ends_with('/') {
            format!("{path}{platform}/")
        } else {
            format!("{path}/{platform}/")
        };
        url.set_path(&path);
        url
    }
}
