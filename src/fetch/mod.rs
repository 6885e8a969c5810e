//! Fetch Engine.
//!
//! Executes a batch of HTTP requests against a mirror pool with retries,
//! conditional GETs, auth, and checksumming. Built on `reqwest` +
//! `reqwest-middleware` so that authentication composes as headers rather
//! than bespoke per-call logic.

pub mod params;

use crate::auth::{AuthenticationDb, Credential};
use crate::error::{CoreError, CoreResult, StopToken};
use crate::mirror::MirrorMap;
use crate::redact::redact_url;
use bytes::Bytes;
use futures::stream::{FuturesOrdered, StreamExt};
use params::RemoteFetchParams;
use retry_policies::{policies::ExponentialBackoff, RetryDecision, RetryPolicy};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use url::Url;

pub use crate::error::CoreError as FetchError;

/// Where a successful response's body ends up.
#[derive(Debug, Clone)]
pub enum Content {
    /// The body was streamed to this file.
    File(PathBuf),
    /// The body was buffered in memory.
    Buffer(Bytes),
    /// A conditional GET returned `304 Not Modified`; the caller's existing
    /// cached content remains valid.
    NotModified,
}

/// Transfer accounting reported alongside every successful result.
#[derive(Debug, Clone, Default)]
pub struct Transfer {
    /// The HTTP status code of the final attempt.
    pub http_status: u16,
    /// The URL the response actually came from, after mirror selection.
    /// Secrets embedded in the URL (userinfo, a conda token path segment)
    /// are scrubbed before this is stored; see [`crate::redact`].
    pub effective_url: Option<Url>,
    /// Number of bytes downloaded in the final attempt.
    pub downloaded_size: u64,
    /// Average transfer speed in bytes/second, if timing was measurable.
    pub avg_speed: Option<f64>,
}

/// One outcome of a single [`Request`].
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// The request succeeded (including a `304` treated as success).
    Success {
        /// Where the body ended up.
        content: Content,
        /// Transfer accounting.
        transfer: Transfer,
        /// The response's `Cache-Control` header, if present.
        cache_control: Option<String>,
        /// The response's `ETag` header, if present.
        etag: Option<String>,
        /// The response's `Last-Modified` header, if present.
        last_modified: Option<String>,
        /// How many attempts this request took (1 = no retries needed).
        attempt_number: u32,
    },
    /// The request failed after exhausting retries, or was not retryable.
    Error {
        /// A human-readable failure description.
        message: String,
        /// If a retry is scheduled elsewhere, how long the caller should
        /// wait before trying this request again.
        retry_wait_seconds: Option<f64>,
        /// Transfer accounting from the final attempt, if any response was
        /// received at all.
        transfer: Option<Transfer>,
        /// How many attempts were made before giving up.
        attempt_number: u32,
        /// Set when the failure was caused by cancellation rather than a
        /// network or validation error.
        user_interrupted: bool,
    },
}

/// One request to perform against the mirror named by `mirror_name`.
#[derive(Clone)]
pub struct Request {
    /// A symbolic name for logging and correlating results back to callers.
    pub name: String,
    /// Key into the [`MirrorMap`] this request's base URL should resolve
    /// through.
    pub mirror_name: String,
    /// Path appended to the chosen mirror's base URL.
    pub url_path: String,
    /// If set, the body is streamed to this file; otherwise it is buffered.
    pub target_file: Option<PathBuf>,
    /// Issue a `HEAD` instead of a `GET`.
    pub head_only: bool,
    /// If true, a failure of this request does not fail the overall batch.
    pub ignore_failure: bool,
    /// Expected SHA-256 of the body; mismatches are a non-retryable error.
    pub sha256: Option<[u8; 32]>,
    /// Expected content length, compared against the final transfer size
    /// only for logging; a mismatch is not itself fatal.
    pub expected_size: Option<u64>,
    /// Prior `ETag`, sent as `If-None-Match` if set.
    pub etag: Option<String>,
    /// Prior `Last-Modified`, sent as `If-Modified-Since` if set.
    pub last_modified: Option<String>,
}

impl Request {
    /// Creates a `GET` request with no conditional headers or checksum.
    pub fn get(name: impl Into<String>, mirror_name: impl Into<String>, url_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mirror_name: mirror_name.into(),
            url_path: url_path.into(),
            target_file: None,
            head_only: false,
            ignore_failure: false,
            sha256: None,
            expected_size: None,
            etag: None,
            last_modified: None,
        }
    }

    /// Turns this into a `HEAD` request.
    pub fn head(mut self) -> Self {
        self.head_only = true;
        self
    }

    /// Streams the response body to `path` instead of buffering it.
    pub fn to_file(mut self, path: PathBuf) -> Self {
        self.target_file = Some(path);
        self
    }

    /// Sets conditional-GET headers from a prior cache state.
    pub fn with_conditional(mut self, etag: Option<String>, last_modified: Option<String>) -> Self {
        self.etag = etag;
        self.last_modified = last_modified;
        self
    }

    /// Requires the body to hash to `sha256`.
    pub fn with_sha256(mut self, sha256: [u8; 32]) -> Self {
        self.sha256 = Some(sha256);
        self
    }

    /// Marks this request as non-fatal to the overall batch on failure.
    pub fn ignoring_failure(mut self) -> Self {
        self.ignore_failure = true;
        self
    }
}

fn build_client(params: &RemoteFetchParams) -> CoreResult<reqwest_middleware::ClientWithMiddleware> {
    let client = reqwest::Client::builder()
        .user_agent(params.user_agent.clone())
        .build()
        .map_err(|e| CoreError::Io(format!("building http client: {e}"), std::io::Error::other(e.to_string())))?;
    Ok(reqwest_middleware::ClientBuilder::new(client).build())
}

/// Executes `requests` against `mirrors`, honoring `remote_params.download_threads`
/// in-flight at once, preserving input order in the output.
pub async fn download(
    requests: Vec<Request>,
    mirrors: &MirrorMap,
    remote_params: &RemoteFetchParams,
    auth_db: &AuthenticationDb,
    stop: &StopToken,
) -> Vec<FetchOutcome> {
    let client = match build_client(remote_params) {
        Ok(c) => c,
        Err(e) => {
            return requests
                .iter()
                .map(|_| FetchOutcome::Error {
                    message: e.to_string(),
                    retry_wait_seconds: None,
                    transfer: None,
                    attempt_number: 0,
                    user_interrupted: false,
                })
                .collect();
        }
    };
    let client = Arc::new(client);
    let semaphore = Arc::new(Semaphore::new(remote_params.download_threads.max(1)));

    let mut futures = FuturesOrdered::new();
    for request in requests {
        let client = client.clone();
        let semaphore = semaphore.clone();
        let mirrors = mirrors.clone();
        let auth_db = auth_db.clone();
        let remote_params = remote_params.clone();
        let stop = stop.clone();
        futures.push_back(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore is never closed");
            execute_with_retry(&client, &request, &mirrors, &remote_params, &auth_db, &stop).await
        });
    }

    futures.collect().await
}

async fn execute_with_retry(
    client: &reqwest_middleware::ClientWithMiddleware,
    request: &Request,
    mirrors: &MirrorMap,
    remote_params: &RemoteFetchParams,
    auth_db: &AuthenticationDb,
    stop: &StopToken,
) -> FetchOutcome {
    let backoff = ExponentialBackoff::builder()
        .retry_bounds(remote_params.retry_timeout, remote_params.retry_timeout * 16)
        .build_with_max_retries(remote_params.max_retries);
    let request_start_time = std::time::SystemTime::now();

    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        if stop.is_stopped() {
            return FetchOutcome::Error {
                message: "operation was cancelled".to_string(),
                retry_wait_seconds: None,
                transfer: None,
                attempt_number: attempt,
                user_interrupted: true,
            };
        }

        match execute_once(client, request, mirrors, auth_db, attempt).await {
            Ok(mut outcome) => {
                if let FetchOutcome::Success { attempt_number, .. } = &mut outcome {
                    *attempt_number = attempt;
                }
                return outcome;
            }
            Err(RequestError::NotRetryable(message)) => {
                return FetchOutcome::Error {
                    message,
                    retry_wait_seconds: None,
                    transfer: None,
                    attempt_number: attempt,
                    user_interrupted: false,
                };
            }
            Err(RequestError::Retryable(message)) => match backoff.should_retry(request_start_time, attempt - 1) {
                RetryDecision::Retry { .. } => {
                    let wait = retry_wait(remote_params, attempt);
                    tracing::warn!(request = %request.name, attempt, %message, wait_seconds = wait.as_secs_f64(), "retrying request");
                    tokio::time::sleep(wait).await;
                }
                RetryDecision::DoNotRetry => {
                    return FetchOutcome::Error {
                        message,
                        retry_wait_seconds: None,
                        transfer: None,
                        attempt_number: attempt,
                        user_interrupted: false,
                    };
                }
            },
        }
    }
}

enum RequestError {
    Retryable(String),
    NotRetryable(String),
}

fn resolve_url(request: &Request, mirrors: &MirrorMap, attempt: u32) -> Option<(Url, usize)> {
    let (base, index) = mirrors.select(&request.mirror_name, attempt)?;
    let url = base.join(&request.url_path).ok()?;
    Some((url, index))
}

fn apply_auth(
    builder: reqwest_middleware::RequestBuilder,
    url: &Url,
    auth_db: &AuthenticationDb,
) -> reqwest_middleware::RequestBuilder {
    match auth_db.lookup(url.as_str()) {
        Some(Credential::Basic { user, password }) => builder.basic_auth(user, Some(password)),
        Some(Credential::BearerToken(token)) => builder.bearer_auth(token),
        Some(Credential::CondaToken(_)) => builder, // applied via URL rewrite by the caller building url_path
        None => builder,
    }
}

async fn execute_once(
    client: &reqwest_middleware::ClientWithMiddleware,
    request: &Request,
    mirrors: &MirrorMap,
    auth_db: &AuthenticationDb,
    attempt: u32,
) -> Result<FetchOutcome, RequestError> {
    let (url, mirror_index) = resolve_url(request, mirrors, attempt)
        .ok_or_else(|| RequestError::NotRetryable(format!("no mirror registered for '{}'", request.mirror_name)))?;
    let display_url = redact_url(&url);

    let method = if request.head_only { reqwest::Method::HEAD } else { reqwest::Method::GET };
    let mut builder = client.request(method, url.clone());
    builder = apply_auth(builder, &url, auth_db);
    if let Some(etag) = &request.etag {
        builder = builder.header(reqwest::header::IF_NONE_MATCH, etag);
    }
    if let Some(last_modified) = &request.last_modified {
        builder = builder.header(reqwest::header::IF_MODIFIED_SINCE, last_modified);
    }

    let response = builder.send().await.map_err(classify_middleware_error)?;
    let status = response.status();
    let cache_control = header_string(&response, reqwest::header::CACHE_CONTROL);
    let etag = header_string(&response, reqwest::header::ETAG);
    let last_modified = header_string(&response, reqwest::header::LAST_MODIFIED);

    if status == reqwest::StatusCode::NOT_MODIFIED || status.is_success() {
        mirrors.record_success(&request.mirror_name, mirror_index);
    }

    if status == reqwest::StatusCode::NOT_MODIFIED {
        return Ok(FetchOutcome::Success {
            content: Content::NotModified,
            transfer: Transfer { http_status: 304, effective_url: Some(display_url), downloaded_size: 0, avg_speed: None },
            cache_control,
            etag,
            last_modified,
            attempt_number: 0,
        });
    }

    if !status.is_success() {
        let message = format!("unexpected status {status} for {display_url}");
        return Err(classify_status(status, message));
    }

    if request.head_only {
        return Ok(FetchOutcome::Success {
            content: Content::Buffer(Bytes::new()),
            transfer: Transfer {
                http_status: status.as_u16(),
                effective_url: Some(display_url),
                downloaded_size: 0,
                avg_speed: None,
            },
            cache_control,
            etag,
            last_modified,
            attempt_number: 0,
        });
    }

    let start = std::time::Instant::now();
    let body = response
        .bytes()
        .await
        .map_err(|e| RequestError::Retryable(format!("reading body from {display_url}: {e}")))?;

    if let Some(expected) = request.sha256 {
        let digest = Sha256::digest(&body);
        if digest.as_slice() != expected {
            return Err(RequestError::NotRetryable(format!(
                "checksum mismatch for {display_url}: expected {}, got {}",
                hex::encode(expected),
                hex::encode(digest)
            )));
        }
    }

    let downloaded_size = body.len() as u64;
    let elapsed = start.elapsed().as_secs_f64();
    let avg_speed = if elapsed > 0.0 { Some(downloaded_size as f64 / elapsed) } else { None };

    let content = if let Some(path) = &request.target_file {
        if let Some(parent) = path.parent() {
            fs_err::tokio::create_dir_all(parent)
                .await
                .map_err(|e| RequestError::NotRetryable(format!("creating parent dir for {}: {e}", path.display())))?;
        }
        fs_err::tokio::write(path, &body)
            .await
            .map_err(|e| RequestError::NotRetryable(format!("writing {}: {e}", path.display())))?;
        Content::File(path.clone())
    } else {
        Content::Buffer(body)
    };

    Ok(FetchOutcome::Success {
        content,
        transfer: Transfer { http_status: status.as_u16(), effective_url: Some(display_url), downloaded_size, avg_speed },
        cache_control,
        etag,
        last_modified,
        attempt_number: 0,
    })
}

/// Per-attempt retry wait: `retry_timeout * retry_backoff^(attempt-1)`,
/// clamped to the same bounds the `ExponentialBackoff` retry/give-up
/// decision uses, so `retry_backoff` has real effect on the wait.
fn retry_wait(remote_params: &RemoteFetchParams, attempt: u32) -> std::time::Duration {
    let factor = remote_params.retry_backoff.powi(attempt as i32 - 1).max(0.0);
    remote_params
        .retry_timeout
        .mul_f64(factor)
        .clamp(remote_params.retry_timeout, remote_params.retry_timeout * 16)
}

fn header_string(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    response.headers().get(name)?.to_str().ok().map(str::to_owned)
}

fn classify_status(status: reqwest::StatusCode, message: String) -> RequestError {
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        RequestError::Retryable(message)
    } else {
        RequestError::NotRetryable(message)
    }
}

fn classify_middleware_error(err: reqwest_middleware::Error) -> RequestError {
    let redacted = err.url().map(redact_url);
    let err = match redacted {
        Some(url) => err.with_url(url),
        None => err,
    };
    let message = err.to_string();
    match &err {
        reqwest_middleware::Error::Reqwest(e) if e.is_timeout() || e.is_connect() => RequestError::Retryable(message),
        reqwest_middleware::Error::Reqwest(_) => RequestError::NotRetryable(message),
        reqwest_middleware::Error::Middleware(_) => RequestError::NotRetryable(message),
    }
}
