//! Explicit parameter structs passed into the fetch engine.
//!
//! None of these are global state; a caller builds one per call and clones
//! it as needed rather than reaching into a shared singleton.

use std::time::Duration;

/// Remote fetch tuning.
#[derive(Debug, Clone)]
pub struct RemoteFetchParams {
    /// Maximum number of requests in flight at once.
    pub download_threads: usize,
    /// Base retry delay.
    pub retry_timeout: Duration,
    /// Multiplier applied to `retry_timeout` per attempt.
    pub retry_backoff: f64,
    /// Maximum number of retries per request before giving up.
    pub max_retries: u32,
    /// User agent string sent with every request.
    pub user_agent: String,
}

impl Default for RemoteFetchParams {
    fn default() -> Self {
        Self {
            download_threads: 5,
            retry_timeout: Duration::from_millis(500),
            retry_backoff: 2.0,
            max_retries: 3,
            user_agent: concat!("mamba_repodata/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}
