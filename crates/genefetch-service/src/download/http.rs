//! Support to download from HTTP servers.
//!
//! Metadata comes from `HEAD` requests, one per file, and bodies are streamed from `GET`.

use std::error::Error;
use std::fmt;
use std::io::{self, Read};
use std::sync::Arc;

use genefetch_sources::{EndpointId, HttpEndpointConfig};
use reqwest::StatusCode;
use reqwest::blocking::{Client, Response};
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};

use super::{ChunkSink, Connection, DownloadTimeouts, RemoteStat, StatMode};
use crate::caching::CacheError;
use crate::clock::{Timestamp, parse_http_date};

const USER_AGENT: &str = concat!("genefetch/", env!("CARGO_PKG_VERSION"));

const CHUNK_SIZE: usize = 64 * 1024;

/// Maps an unsuccessful status code into the error taxonomy.
fn status_error(status: StatusCode) -> CacheError {
    let details = status.to_string();
    match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => CacheError::NotFound,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => CacheError::PermissionDenied(details),
        StatusCode::TOO_MANY_REQUESTS => CacheError::Transient(details),
        status if status.is_server_error() => CacheError::Transient(details),
        _ => CacheError::Permanent(details),
    }
}

fn request_error(error: reqwest::Error, timeouts: &DownloadTimeouts) -> CacheError {
    if error.is_timeout() {
        return CacheError::Timeout(timeouts.socket);
    }
    let is_connect = error.is_connect();

    let mut source: &dyn Error = &error;
    while let Some(next) = source.source() {
        source = next;
    }
    let details = source.to_string();

    match is_connect {
        true => CacheError::ConnectionLost(details),
        false => CacheError::Transient(details),
    }
}

/// Maps an error while reading a response body.
///
/// The blocking client reports an expired read timeout as an opaque I/O error wrapping
/// its own timeout error.
fn body_error(error: io::Error, timeouts: &DownloadTimeouts) -> CacheError {
    let timed_out = error.kind() == io::ErrorKind::TimedOut
        || error
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<reqwest::Error>())
            .is_some_and(reqwest::Error::is_timeout);
    match timed_out {
        true => CacheError::Timeout(timeouts.socket),
        false => CacheError::ConnectionLost(error.to_string()),
    }
}

fn check_status(response: Response) -> Result<Response, CacheError> {
    match response.status() {
        status if status.is_success() => Ok(response),
        status => {
            tracing::debug!(%status, url = %response.url(), "unexpected response");
            Err(status_error(status))
        }
    }
}

fn parse_stat(headers: &HeaderMap) -> Result<RemoteStat, CacheError> {
    let size = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .ok_or_else(|| CacheError::Corrupt("missing or invalid Content-Length".into()))?;

    let mtime = match headers.get(header::LAST_MODIFIED) {
        Some(value) => {
            let value = value
                .to_str()
                .map_err(|_| CacheError::Corrupt("invalid Last-Modified header".into()))?;
            parse_http_date(value)?
        }
        None => Timestamp::UNIX_EPOCH,
    };

    Ok(RemoteStat { size, mtime })
}

/// Opens "connections" to one HTTP endpoint.
///
/// All connections share one client and with it the client's connection pool.
#[derive(Clone)]
pub struct HttpConnector {
    config: Arc<HttpEndpointConfig>,
    client: Client,
    timeouts: DownloadTimeouts,
}

impl fmt::Debug for HttpConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpConnector")
            .field("id", &self.config.id)
            .field("url", &self.config.url.as_str())
            .finish()
    }
}

impl HttpConnector {
    pub fn new(
        config: Arc<HttpEndpointConfig>,
        timeouts: DownloadTimeouts,
    ) -> Result<Self, CacheError> {
        let mut headers = HeaderMap::new();
        for (key, value) in &config.headers {
            let key = HeaderName::from_bytes(key.as_bytes())
                .map_err(|err| CacheError::Permanent(format!("header {key:?}: {err}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|err| CacheError::Permanent(format!("header {key}: {err}")))?;
            headers.insert(key, value);
        }

        // the blocking client applies its timeout to every single read, not to whole bodies
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .connect_timeout(timeouts.connect)
            .timeout(timeouts.socket)
            .build()
            .map_err(CacheError::from_std_error)?;

        Ok(Self {
            config,
            client,
            timeouts,
        })
    }

    pub fn endpoint(&self) -> &EndpointId {
        &self.config.id
    }

    pub fn connect(&self) -> Result<Box<dyn Connection>, CacheError> {
        Ok(Box::new(self.clone()))
    }

    fn url_for(&self, path: &str) -> Result<reqwest::Url, CacheError> {
        self.config
            .url_for(path)
            .map_err(|err| CacheError::InvalidRequest(format!("{path}: {err}")))
    }
}

impl Connection for HttpConnector {
    fn stat_mode(&self) -> StatMode {
        StatMode::PerFile
    }

    fn list(&mut self, dir: &str) -> Result<Vec<String>, CacheError> {
        Err(CacheError::InvalidRequest(format!(
            "HTTP endpoints cannot list directories: {dir}"
        )))
    }

    fn head(&mut self, path: &str) -> Result<RemoteStat, CacheError> {
        let url = self.url_for(path)?;
        tracing::debug!(%url, "HEAD");

        let response = self
            .client
            .head(url)
            .send()
            .map_err(|err| request_error(err, &self.timeouts))?;
        let response = check_status(response)?;
        parse_stat(response.headers())
    }

    fn retrieve(&mut self, path: &str, sink: &mut ChunkSink<'_>) -> Result<u64, CacheError> {
        let url = self.url_for(path)?;
        tracing::debug!(%url, "GET");

        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| request_error(err, &self.timeouts))?;
        let mut response = check_status(response)?;

        let mut buf = vec![0; CHUNK_SIZE];
        let mut received = 0u64;
        loop {
            let read = match response.read(&mut buf) {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(body_error(err, &self.timeouts)),
            };
            received += read as u64;
            sink(&buf[..read])?;
        }
        Ok(received)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::net::TcpListener;
    use std::time::{Duration, Instant};

    use super::*;

    fn connector(server: &genefetch_test::Server) -> HttpConnector {
        let config = HttpEndpointConfig {
            id: EndpointId::new("files"),
            url: server.url("/"),
            headers: Default::default(),
        };
        HttpConnector::new(Arc::new(config), DownloadTimeouts::default()).unwrap()
    }

    #[test]
    fn test_head_and_get() {
        genefetch_test::setup();
        let root = genefetch_test::tempdir();
        genefetch_test::write_file(root.path(), "data/ann.tab", b"hello world\n");
        let server = genefetch_test::Server::serve_dir(root.path());

        let mut conn = connector(&server).connect().unwrap();
        let stat = conn.head("data/ann.tab").unwrap();
        assert_eq!(stat.size, 12);
        assert!(stat.mtime > Timestamp::UNIX_EPOCH);

        let mut body = Vec::new();
        let received = conn
            .retrieve("data/ann.tab", &mut |chunk| {
                body.extend_from_slice(chunk);
                Ok(())
            })
            .unwrap();
        assert_eq!(received, 12);
        assert_eq!(body, b"hello world\n");

        assert_eq!(server.count("HEAD /data/ann.tab"), 1);
        assert_eq!(server.count("GET /data/ann.tab"), 1);
    }

    #[test]
    fn test_missing_file() {
        genefetch_test::setup();
        let root = genefetch_test::tempdir();
        let server = genefetch_test::Server::serve_dir(root.path());

        let mut conn = connector(&server).connect().unwrap();
        assert_eq!(conn.head("i-do-not-exist"), Err(CacheError::NotFound));
        let result = conn.retrieve("i-do-not-exist", &mut |_| Ok(()));
        assert_eq!(result, Err(CacheError::NotFound));
    }

    #[test]
    fn test_stalled_body_times_out() {
        genefetch_test::setup();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = [0; 1024];
            let _ = stream.read(&mut request);
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\nabc")
                .unwrap();
            stream.flush().unwrap();
            std::thread::sleep(Duration::from_secs(6));
        });

        let config = HttpEndpointConfig {
            id: EndpointId::new("stalled"),
            url: format!("http://{addr}/").parse().unwrap(),
            headers: Default::default(),
        };
        let timeouts = DownloadTimeouts {
            connect: Duration::from_secs(1),
            socket: Duration::from_secs(1),
        };
        let mut conn = HttpConnector::new(Arc::new(config), timeouts)
            .unwrap()
            .connect()
            .unwrap();

        let start = Instant::now();
        let result = conn.retrieve("data/ann.tab", &mut |_| Ok(()));
        assert_eq!(result, Err(CacheError::Timeout(Duration::from_secs(1))));
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_body_errors() {
        let timeouts = DownloadTimeouts::default();
        let err = io::Error::new(io::ErrorKind::TimedOut, "timed out");
        assert_eq!(
            body_error(err, &timeouts),
            CacheError::Timeout(timeouts.socket)
        );
        let err = io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer");
        assert!(matches!(
            body_error(err, &timeouts),
            CacheError::ConnectionLost(_)
        ));
    }

    #[test]
    fn test_status_errors() {
        assert!(matches!(
            status_error(StatusCode::FORBIDDEN),
            CacheError::PermissionDenied(_)
        ));
        assert!(status_error(StatusCode::SERVICE_UNAVAILABLE).is_transient());
        assert!(status_error(StatusCode::TOO_MANY_REQUESTS).is_transient());
        assert!(matches!(
            status_error(StatusCode::BAD_REQUEST),
            CacheError::Permanent(_)
        ));
    }

    #[test]
    fn test_parse_stat() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("1024"));
        headers.insert(
            header::LAST_MODIFIED,
            HeaderValue::from_static("Sun, 15 Dec 2024 03:30:00 GMT"),
        );
        assert_eq!(
            parse_stat(&headers).unwrap(),
            RemoteStat {
                size: 1024,
                mtime: "2024-12-15T03:30:00Z".parse().unwrap(),
            }
        );

        headers.remove(header::CONTENT_LENGTH);
        assert!(matches!(parse_stat(&headers), Err(CacheError::Corrupt(_))));
    }
}
