//! Types for dealing with remote file locations.
//!
//! This provides the [`RemoteRef`] type, which identifies one file on one endpoint.

use std::borrow::Cow;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::EndpointId;

/// A reference to a single file on a remote endpoint.
///
/// The path is always absolute and normalized: it starts with a `/`, and empty segments are
/// collapsed, so `data//ann.tab` and `/data/ann.tab` refer to the same file.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct RemoteRef {
    endpoint: EndpointId,
    path: String,
}

impl RemoteRef {
    /// Creates a new [`RemoteRef`] for `path` on `endpoint`.
    pub fn new(endpoint: impl Into<EndpointId>, path: &str) -> Self {
        let mut normalized = String::with_capacity(path.len() + 1);
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            normalized.push('/');
            normalized.push_str(segment);
        }
        if normalized.is_empty() {
            normalized.push('/');
        }

        Self {
            endpoint: endpoint.into(),
            path: normalized,
        }
    }

    /// The endpoint this file lives on.
    pub fn endpoint(&self) -> &EndpointId {
        &self.endpoint
    }

    /// The absolute remote path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The directory containing this file, `/` for files at the root.
    pub fn directory(&self) -> &str {
        match self.path.rfind('/') {
            Some(0) | None => "/",
            Some(idx) => &self.path[..idx],
        }
    }

    /// The last path segment.
    pub fn file_name(&self) -> &str {
        match self.path.rfind('/') {
            Some(idx) => &self.path[idx + 1..],
            None => &self.path,
        }
    }

    /// A relative local path mirroring the remote one: `<endpoint>/<path segments>`.
    ///
    /// Distinct references always map to distinct paths, and no path escapes the base
    /// directory. See [`escape_segment`] for the encoding.
    pub fn relative_path(&self) -> PathBuf {
        let mut path = PathBuf::from(&*escape_segment(self.endpoint.as_str()));
        for segment in self.path.split('/').filter(|s| !s.is_empty()) {
            path.push(&*escape_segment(segment));
        }
        path
    }
}

/// Encodes one segment of a local path.
///
/// `.` and `..` become `%2E` and `%2E%2E`. Separators, `:` and the escape character itself
/// are percent-encoded, everything else is kept.
fn escape_segment(segment: &str) -> Cow<'_, str> {
    match segment {
        "." => return Cow::Borrowed("%2E"),
        ".." => return Cow::Borrowed("%2E%2E"),
        _ => {}
    }
    if !segment.contains(['%', '/', '\\', ':']) {
        return Cow::Borrowed(segment);
    }

    let mut escaped = String::with_capacity(segment.len() + 8);
    for c in segment.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            '/' => escaped.push_str("%2F"),
            '\\' => escaped.push_str("%5C"),
            ':' => escaped.push_str("%3A"),
            c => escaped.push(c),
        }
    }
    Cow::Owned(escaped)
}

impl fmt::Display for RemoteRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.endpoint.as_str().contains("://") {
            write!(f, "{}{}", self.endpoint, self.path)
        } else {
            write!(f, "{}:{}", self.endpoint, self.path)
        }
    }
}

/// The error returned when parsing a [`RemoteRef`] fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseRemoteRefError(String);

impl fmt::Display for ParseRemoteRefError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "invalid remote reference `{}`", self.0)
    }
}

impl std::error::Error for ParseRemoteRefError {}

impl FromStr for RemoteRef {
    type Err = ParseRemoteRefError;

    /// Parses either `scheme://host/path` (the endpoint is `scheme://host`) or `endpoint:path`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseRemoteRefError(s.to_owned());

        let (endpoint, path) = match s.find("://") {
            Some(scheme_end) => {
                let host_start = scheme_end + 3;
                match s[host_start..].find('/') {
                    Some(idx) => s.split_at(host_start + idx),
                    None => (s, "/"),
                }
            }
            None => s.split_once(':').ok_or_else(invalid)?,
        };

        if endpoint.is_empty() || endpoint.ends_with("://") {
            return Err(invalid());
        }

        Ok(Self::new(endpoint, path))
    }
}
