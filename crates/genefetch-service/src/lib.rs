//! A persistent, concurrent fetch and cache layer for gene databases.
//!
//! Remote database files are retrieved through per-endpoint [`download::FetchPool`]s, and slow
//! remote lookups are memoized on disk by the [`caching::Memoizer`]. [`services::Services`]
//! wires both up from a [`config::Config`].

#[macro_use]
pub mod metrics;

pub mod batch;
pub mod caching;
pub mod clock;
pub mod config;
pub mod download;
pub mod logging;
pub mod services;
