//! Error taxonomy shared by every component in this crate.
//!
//! Every fallible operation in `mamba_repodata` returns a [`CoreError`].
//! There are no panics on the network or parsing path; the only place a
//! panic is acceptable is a genuinely unreachable invariant violation (e.g.
//! a `Url::join` on a URL we just validated).

use std::fmt;

/// Convenience alias used throughout the crate.
pub type CoreResult<T> = Result<T, CoreError>;

/// The sum type returned by every fallible operation in this crate.
///
/// One flat enum rather than a tree of exception types, with an
/// [`CoreError::Aggregated`] variant for batch operations that can fail
/// partially.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Catch-all for errors that don't fit another variant.
    #[error("{0}")]
    Unknown(String),

    /// A `PrefixData`-equivalent failed to load. Kept for parity with the
    /// rest of the taxonomy even though this crate does not itself
    /// implement prefix loading.
    #[error("prefix data could not be loaded: {0}")]
    PrefixDataNotLoaded(String),

    /// Loading repodata for a subdirectory failed.
    #[error("subdirectory data could not be loaded: {0}")]
    SubdirDataNotLoaded(String),

    /// A cache file exists but could not be read or parsed.
    #[error("cache could not be loaded: {0}")]
    CacheNotLoaded(String),

    /// Repodata could not be loaded or assembled.
    #[error("repodata could not be loaded: {0}")]
    RepodataNotLoaded(String),

    /// The calling application signalled cancellation through a stop token.
    #[error("the operation was cancelled")]
    UserInterrupted,

    /// One or more requests in a batch failed; every failure is kept.
    #[error("{}", format_aggregated(.0))]
    Aggregated(Vec<CoreError>),

    /// An HTTP request failed (after retries, if any applied).
    #[error(transparent)]
    Http(#[from] reqwest_middleware::Error),

    /// A filesystem operation failed.
    #[error("{0}: {1}")]
    Io(String, #[source] std::io::Error),

    /// A msgpack payload could not be decoded.
    #[error("failed to decode msgpack from {0}: {1}")]
    MsgpackDecode(String, #[source] rmp_serde::decode::Error),

    /// A JSON payload could not be decoded.
    #[error("failed to decode json from {0}: {1}")]
    JsonDecode(String, #[source] serde_json::Error),

    /// The decompressed payload exceeded the configured safety cap.
    #[error("decompressed payload for {0} exceeded the {1}-byte cap")]
    DecompressionOverflow(String, u64),

    /// zstd (de)compression failed.
    #[error("zstd failure for {0}: {1}")]
    Zstd(String, #[source] std::io::Error),

    /// A checksum did not match what the caller expected.
    #[error("checksum mismatch for {0}")]
    ChecksumMismatch(String),

    /// Failed to acquire an advisory lock on a cache directory.
    #[error("failed to acquire lock on {0}: {1}")]
    LockFailed(String, #[source] anyhow::Error),
}

fn format_aggregated(errors: &[CoreError]) -> String {
    let mut out = String::from("Multiple errors occurred:");
    for err in errors {
        out.push_str("\n  - ");
        out.push_str(&err.to_string());
    }
    out.push_str("\n(if this looks like a bug, please file a report including the above)");
    out
}

impl CoreError {
    /// Builds an [`CoreError::Aggregated`] from a non-empty list of errors,
    /// collapsing a single-element list to that element directly.
    pub fn aggregate(mut errors: Vec<CoreError>) -> Option<CoreError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(CoreError::Aggregated(errors)),
        }
    }

    /// True if this error (or, for an aggregate, any inner error) represents
    /// a user-requested cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            CoreError::UserInterrupted => true,
            CoreError::Aggregated(errors) => errors.iter().any(CoreError::is_cancelled),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(err: reqwest::Error) -> Self {
        CoreError::Http(reqwest_middleware::Error::Reqwest(err))
    }
}

impl From<simple_spawn_blocking::Cancelled> for CoreError {
    fn from(_: simple_spawn_blocking::Cancelled) -> Self {
        CoreError::UserInterrupted
    }
}

/// A caller-supplied handle used to signal cancellation of an in-progress
/// batch operation. Cheap to clone; checking it is a relaxed atomic load.
#[derive(Clone, Default)]
pub struct StopToken {
    inner: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl StopToken {
    /// Creates a fresh, unsignalled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals cancellation. Idempotent.
    pub fn stop(&self) {
        self.inner.store(true, std::sync::atomic::Ordering::Relaxed);
    }

    /// Returns `true` once [`StopToken::stop`] has been called.
    pub fn is_stopped(&self) -> bool {
        self.inner.load(std::sync::atomic::Ordering::Relaxed)
    }
}

impl fmt::Debug for StopToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopToken")
            .field("is_stopped", &self.is_stopped())
            .finish()
    }
}
