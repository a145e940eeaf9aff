//! Endpoint configuration types.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use url::Url;

/// An identifier for remote endpoints.
///
/// This is essentially a newtype for a string. Its value is opaque to the fetch layer, it is
/// only used to group connections, listings and remote references.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct EndpointId(pub(crate) String);

impl EndpointId {
    /// Creates a new [`EndpointId`].
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Deref the [`EndpointId`] to a `&str`.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EndpointId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for EndpointId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Configuration for a remote endpoint.
///
/// An endpoint is the host portion of a remote reference: everything that is needed to open a
/// control connection to it.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EndpointConfig {
    /// An FTP server, listed with `LIST` and downloaded with `RETR`.
    Ftp(Arc<FtpEndpointConfig>),
    /// An HTTP(S) server, statted with `HEAD` and downloaded with `GET`.
    Http(Arc<HttpEndpointConfig>),
}

impl EndpointConfig {
    /// The unique identifier of this endpoint.
    pub fn id(&self) -> &EndpointId {
        match self {
            Self::Ftp(x) => &x.id,
            Self::Http(x) => &x.id,
        }
    }

    /// Name of this endpoint's transport.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Ftp(..) => "ftp",
            Self::Http(..) => "http",
        }
    }
}

/// Configuration for an FTP endpoint.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FtpEndpointConfig {
    /// Unique endpoint identifier.
    pub id: EndpointId,

    /// Host name of the FTP server, without scheme.
    pub host: String,

    /// Control connection port.
    #[serde(default = "default_ftp_port")]
    pub port: u16,

    /// User to log in as. Defaults to anonymous login.
    #[serde(default)]
    pub user: Option<String>,

    /// Password for [`user`](Self::user).
    #[serde(default)]
    pub password: Option<String>,
}

fn default_ftp_port() -> u16 {
    21
}

impl FtpEndpointConfig {
    /// The user name used to log in, `anonymous` if none is configured.
    pub fn login_user(&self) -> &str {
        self.user.as_deref().unwrap_or("anonymous")
    }

    /// The password used to log in.
    pub fn login_password(&self) -> &str {
        self.password.as_deref().unwrap_or("anonymous@")
    }
}

/// Configuration for an HTTP endpoint.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct HttpEndpointConfig {
    /// Unique endpoint identifier.
    pub id: EndpointId,

    /// Absolute base URL. Remote paths are resolved relative to it.
    pub url: Url,

    /// Additional headers to be sent with every request.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl HttpEndpointConfig {
    /// Returns the URL of `path` on this endpoint.
    ///
    /// Each segment of the path is percent-encoded, and empty segments are skipped. The base URL
    /// is treated as a directory.
    pub fn url_for(&self, path: &str) -> anyhow::Result<Url> {
        let mut joined = self.url.clone();
        joined
            .path_segments_mut()
            .map_err(|_| anyhow::Error::msg("URL cannot-be-a-base"))?
            .pop_if_empty()
            .extend(path.split('/').filter(|s| !s.is_empty()));
        Ok(joined)
    }
}
