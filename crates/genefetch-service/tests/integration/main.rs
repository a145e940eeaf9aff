// See <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

pub mod http_fetch;
pub mod memoize;
pub mod services;
pub mod utils;

pub use utils::*;
