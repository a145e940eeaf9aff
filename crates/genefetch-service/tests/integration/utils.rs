use std::sync::Arc;

use genefetch_service::config::Config;
use genefetch_service::services::Services;
use genefetch_sources::{EndpointConfig, EndpointId, HttpEndpointConfig};
use genefetch_test::{Server, TempDir};

/// The id of the HTTP endpoint configured by [`setup_services`].
pub const ENDPOINT: &str = "files";

pub fn http_endpoint(server: &Server) -> EndpointConfig {
    EndpointConfig::Http(Arc::new(HttpEndpointConfig {
        id: EndpointId::new(ENDPOINT),
        url: server.url("/"),
        headers: Default::default(),
    }))
}

/// Creates services with a fresh cache dir, fetching from `server`.
pub fn setup_services(server: &Server) -> (Services, TempDir) {
    genefetch_test::setup();
    let cache_dir = genefetch_test::tempdir();
    let mut config = Config {
        cache_dir: cache_dir.path().to_owned(),
        endpoints: vec![http_endpoint(server)],
        ..Default::default()
    };
    config.fetch.workers = 2;
    config.fetch.retry_delay = std::time::Duration::from_millis(1);

    let services = Services::from_config(config).unwrap();
    (services, cache_dir)
}
