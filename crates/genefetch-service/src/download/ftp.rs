//! Support to download from FTP servers.
//!
//! Uses passive mode binary transfers over a long-lived control connection. Metadata comes
//! from `LIST` replies, which the [`StatCache`](super::StatCache) parses once per directory.

use std::fmt;
use std::io::{self, Read};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use genefetch_sources::{EndpointId, FtpEndpointConfig};
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream, Mode};

use super::{ChunkSink, Connection, DownloadTimeouts, RemoteStat, StatMode};
use crate::caching::CacheError;

const CHUNK_SIZE: usize = 64 * 1024;

/// Classifies an FTP reply code.
///
/// `550` usually means the file is inaccessible to the logged-in user and gets one reconnect.
/// Other `5xx` replies, and a failed login, are permanent. `4xx` replies are temporary.
pub fn classify_reply(code: u32, message: &str) -> CacheError {
    let message = format!("{code} {}", message.trim());
    match code {
        550 => CacheError::PermissionDenied(message),
        530 => CacheError::Permanent(message),
        400..=499 => CacheError::Transient(message),
        500..=599 => CacheError::Permanent(message),
        _ => CacheError::Transient(message),
    }
}

fn classify_io(err: &io::Error, timeouts: &DownloadTimeouts) -> CacheError {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            CacheError::Timeout(timeouts.socket)
        }
        _ => CacheError::ConnectionLost(err.to_string()),
    }
}

fn classify(err: FtpError, timeouts: &DownloadTimeouts) -> CacheError {
    match err {
        FtpError::ConnectionError(err) => classify_io(&err, timeouts),
        FtpError::UnexpectedResponse(response) => classify_reply(
            response.status.code(),
            &String::from_utf8_lossy(&response.body),
        ),
        FtpError::BadResponse => CacheError::Corrupt("bad response from FTP server".into()),
        err => CacheError::Transient(err.to_string()),
    }
}

/// Opens FTP control connections to one endpoint.
#[derive(Clone)]
pub struct FtpConnector {
    config: Arc<FtpEndpointConfig>,
    timeouts: DownloadTimeouts,
}

impl fmt::Debug for FtpConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FtpConnector")
            .field("id", &self.config.id)
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .finish()
    }
}

impl FtpConnector {
    pub fn new(config: Arc<FtpEndpointConfig>, timeouts: DownloadTimeouts) -> Self {
        Self { config, timeouts }
    }

    pub fn endpoint(&self) -> &EndpointId {
        &self.config.id
    }

    fn resolve(&self) -> Result<SocketAddr, CacheError> {
        let host = (self.config.host.as_str(), self.config.port);
        host.to_socket_addrs()
            .map_err(|err| CacheError::ConnectionLost(err.to_string()))?
            .next()
            .ok_or_else(|| {
                CacheError::ConnectionLost(format!("{} does not resolve", self.config.host))
            })
    }

    pub fn connect(&self) -> Result<Box<dyn Connection>, CacheError> {
        let timeouts = &self.timeouts;
        let addr = self.resolve()?;

        let mut stream = FtpStream::connect_timeout(addr, timeouts.connect)
            .map_err(|err| classify(err, timeouts))?;
        stream
            .get_ref()
            .set_read_timeout(Some(timeouts.socket))
            .map_err(|err| classify_io(&err, timeouts))?;
        stream
            .login(self.config.login_user(), self.config.login_password())
            .map_err(|err| classify(err, timeouts))?;
        stream
            .transfer_type(FileType::Binary)
            .map_err(|err| classify(err, timeouts))?;
        stream.set_mode(Mode::Passive);

        tracing::debug!(endpoint = %self.config.id, %addr, "connected to FTP server");
        Ok(Box::new(FtpConnection {
            stream,
            timeouts: self.timeouts,
        }))
    }
}

struct FtpConnection {
    stream: FtpStream,
    timeouts: DownloadTimeouts,
}

impl Connection for FtpConnection {
    fn stat_mode(&self) -> StatMode {
        StatMode::Listing
    }

    fn list(&mut self, dir: &str) -> Result<Vec<String>, CacheError> {
        match self.stream.list(Some(dir)) {
            Ok(lines) => Ok(lines),
            // servers answer a missing directory with a negative reply instead of no rows
            Err(FtpError::UnexpectedResponse(response))
                if matches!(response.status.code(), 450 | 550) =>
            {
                Ok(Vec::new())
            }
            Err(err) => Err(classify(err, &self.timeouts)),
        }
    }

    fn head(&mut self, path: &str) -> Result<RemoteStat, CacheError> {
        Err(CacheError::InvalidRequest(format!(
            "FTP files are described by their directory listing: {path}"
        )))
    }

    fn retrieve(&mut self, path: &str, sink: &mut ChunkSink<'_>) -> Result<u64, CacheError> {
        let timeouts = self.timeouts;
        let mut reader = self
            .stream
            .retr_as_stream(path)
            .map_err(|err| classify(err, &timeouts))?;

        let mut buf = vec![0; CHUNK_SIZE];
        let mut received = 0u64;
        loop {
            let read = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(classify_io(&err, &timeouts)),
            };
            received += read as u64;
            sink(&buf[..read])?;
        }

        self.stream
            .finalize_retr_stream(reader)
            .map_err(|err| classify(err, &timeouts))?;
        Ok(received)
    }
}

impl Drop for FtpConnection {
    fn drop(&mut self) {
        // best effort, the connection may already be gone
        self.stream.quit().ok();
    }
}
