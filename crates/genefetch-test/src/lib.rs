//! Helpers for testing the fetch layer and the updater.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. When dropped too early, the store and the fetch pool will
//!    lazily recreate directories inside a deleted tree. To avoid this, assign it to a variable
//!    in the test function (e.g. `let cache_dir = test::tempdir()`).
//!
//!  - When using [`Server`], make sure that the server is held until all requests to it have
//!    been made. The server runs on its own runtime and shuts down when dropped.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use tower_http::services::ServeDir;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;
use url::Url;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `genefetch` crates and mutes all
///    other logs (such as hyper or rusqlite).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new(
            "genefetch_service=trace,genefetch=trace,genefetch_sources=trace",
        ))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`keep`](TempDir::keep) is called. Use it as a guard to automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Writes `contents` to `path` below `root`, creating parent directories as needed.
pub fn write_file(root: &Path, path: &str, contents: &[u8]) {
    let full_path = root.join(path.trim_start_matches('/'));
    if let Some(parent) = full_path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(full_path, contents).unwrap();
}

/// A log of the requests a [`Server`] received, formatted as `METHOD /path`.
pub type RequestLog = Arc<Mutex<Vec<String>>>;

async fn record_request(State(log): State<RequestLog>, request: Request, next: Next) -> Response {
    let line = format!("{} {}", request.method(), request.uri().path());
    log.lock().unwrap().push(line);
    next.run(request).await
}

/// A test server that binds to a random port and serves a web app.
///
/// The server owns a dedicated `tokio` runtime, which makes it usable from plain blocking
/// tests. It stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    runtime: Option<tokio::runtime::Runtime>,
    socket: SocketAddr,
    requests: RequestLog,
}

impl Server {
    /// Creates a new test server from the given router.
    pub fn with_router(router: Router) -> Self {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();

        let requests = RequestLog::default();
        let router = router.layer(middleware::from_fn_with_state(
            requests.clone(),
            record_request,
        ));

        let listener = runtime
            .block_on(tokio::net::TcpListener::bind(("127.0.0.1", 0)))
            .unwrap();
        let socket = listener.local_addr().unwrap();

        runtime.spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self {
            runtime: Some(runtime),
            socket,
            requests,
        }
    }

    /// Creates a server that serves the files below `root`.
    ///
    /// Responses carry `Content-Length` and `Last-Modified` headers, and `HEAD` is supported.
    pub fn serve_dir(root: &Path) -> Self {
        Self::with_router(Router::new().fallback_service(ServeDir::new(root)))
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.socket.port(), path)
            .parse()
            .unwrap()
    }

    /// Returns all requests received so far.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    /// Counts the received requests that equal `line`, e.g. `GET /data/ann.tab`.
    pub fn count(&self, line: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.as_str() == line)
            .count()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
