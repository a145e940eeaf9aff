//! Utilities dealing with remote database endpoints.
//!
//! Includes the configuration of FTP and HTTP endpoints and the [`RemoteRef`] type which
//! identifies a single file on one of them.

#![warn(missing_docs)]

mod endpoints;
mod remotefile;

pub use endpoints::*;
pub use remotefile::*;
