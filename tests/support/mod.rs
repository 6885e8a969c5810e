//! A minimal static-file channel server for integration tests.
//!
//! Serves a directory over HTTP on a random local port so conditional-GET
//! and caching behavior can be exercised against a real server instead of
//! a mock.

use axum::routing::get_service;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::path::Path;
use tokio::sync::oneshot;
use tower_http::services::ServeDir;
use url::Url;

/// Installs a compact `tracing` subscriber so `tracing::warn!`/`debug!`
/// output from the crate under test is visible while running these
/// integration tests with `--nocapture`. Safe to call from every test;
/// only the first call in the process actually installs anything.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::DEBUG.into()))
        .compact()
        .with_test_writer()
        .try_init();
}

pub struct TestChannelServer {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestChannelServer {
    pub async fn new(root: impl AsRef<Path>) -> Self {
        let service = get_service(ServeDir::new(root.as_ref()));
        let app = axum::Router::new().fallback_service(service);

        let addr = SocketAddr::new([127, 0, 0, 1].into(), 0);
        let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
        let local_addr = listener.local_addr().unwrap();

        let (tx, rx) = oneshot::channel();
        let server = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                rx.await.ok();
            })
            .into_future();
        tokio::spawn(server);

        Self { local_addr, shutdown: Some(tx) }
    }

    pub fn url(&self) -> Url {
        Url::parse(&format!("http://127.0.0.1:{}/", self.local_addr.port())).unwrap()
    }
}

impl Drop for TestChannelServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// Encodes an `rmpv::Value` tree as plain msgpack bytes.
pub fn encode_msgpack(value: &rmpv::Value) -> Vec<u8> {
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, value).unwrap();
    buf
}

/// zstd-compresses `bytes` at the default compression level.
pub fn zstd_compress(bytes: &[u8]) -> Vec<u8> {
    zstd::stream::encode_all(bytes, 0).unwrap()
}
