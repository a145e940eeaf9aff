use std::sync::Arc;

use genefetch_service::caching::{CacheError, CacheKey, Lookup, Validity};
use genefetch_service::clock::{ManualClock, Timestamp};
use genefetch_service::config::Config;
use genefetch_service::download::UpdatePolicy;
use genefetch_service::services::Services;
use genefetch_sources::{EndpointId, RemoteRef};
use genefetch_test::Server;

use crate::{ENDPOINT, http_endpoint, setup_services};

fn ts(s: &str) -> Timestamp {
    s.parse().unwrap()
}

#[test]
fn test_pools_per_endpoint() {
    let root = genefetch_test::tempdir();
    let server = Server::serve_dir(root.path());
    let (services, _cache_dir) = setup_services(&server);

    let pool = services.pool(&EndpointId::new(ENDPOINT)).unwrap();
    assert_eq!(pool.endpoint().as_str(), ENDPOINT);
    assert_eq!(services.pools().count(), 1);
    assert!(matches!(
        services.pool(&EndpointId::new("elsewhere")),
        Err(CacheError::InvalidRequest(_))
    ));

    let kegg = services.database("kegg").unwrap();
    let foreign = RemoteRef::new("elsewhere", "/data/ann.tab");
    assert!(matches!(
        services.retrieve(&kegg, &foreign, UpdatePolicy::Check),
        Err(CacheError::InvalidRequest(_))
    ));
    assert!(matches!(
        services.retrieve_all(&kegg, &[foreign], UpdatePolicy::Check, |_: u8| {}),
        Err(CacheError::InvalidRequest(_))
    ));
}

#[test]
fn test_database_layout() {
    let root = genefetch_test::tempdir();
    let server = Server::serve_dir(root.path());
    let (services, cache_dir) = setup_services(&server);

    let kegg = services.database("kegg").unwrap();
    services.database("ensembl").unwrap();
    assert!(cache_dir.path().join("kegg/cache.sqlite3").is_file());
    assert!(cache_dir.path().join("kegg/files").is_dir());
    assert_eq!(kegg.files_dir(), cache_dir.path().join("kegg/files"));

    let escaping = RemoteRef::new(ENDPOINT, "/../../etc/passwd");
    assert!(kegg.local_path(&escaping).starts_with(kegg.files_dir()));

    // endpoints do not share a namespace, and dot segments stay distinct
    let here = kegg.local_path(&RemoteRef::new(ENDPOINT, "/a/../b"));
    let underscore = kegg.local_path(&RemoteRef::new(ENDPOINT, "/a/_/b"));
    let elsewhere = kegg.local_path(&RemoteRef::new("elsewhere", "/a/../b"));
    assert_ne!(here, underscore);
    assert_ne!(here, elsewhere);
    assert_eq!(here, kegg.files_dir().join("files/a/%2E%2E/b"));

    assert_eq!(
        services.databases_on_disk().unwrap(),
        vec!["ensembl".to_owned(), "kegg".to_owned()]
    );

    for name in ["", "../kegg", ".hidden", "a/b"] {
        assert!(matches!(
            services.database(name),
            Err(CacheError::InvalidRequest(_))
        ));
    }
}

#[test]
fn test_downloads_are_recorded() {
    let root = genefetch_test::tempdir();
    genefetch_test::write_file(root.path(), "data/ann.tab", b"annotation\n");
    let server = Server::serve_dir(root.path());
    let (services, cache_dir) = setup_services(&server);
    let kegg = services.database("kegg").unwrap();

    let remote = RemoteRef::new(ENDPOINT, "/data/ann.tab");
    let key = CacheKey::new("retrieve", &remote.to_string()).unwrap();
    assert_eq!(services.updates.last_update(&key), None);

    services
        .retrieve(&kegg, &remote, UpdatePolicy::Check)
        .unwrap();
    let recorded = services.updates.last_update(&key).unwrap();
    assert!(cache_dir.path().join("updates").is_file());

    // an up-to-date check does not count as an update
    services
        .retrieve(&kegg, &remote, UpdatePolicy::Check)
        .unwrap();
    assert_eq!(services.updates.last_update(&key), Some(recorded));
}

#[test]
fn test_cleanup() -> anyhow::Result<()> {
    genefetch_test::setup();
    let cache_dir = genefetch_test::tempdir();
    let config = Config {
        cache_dir: cache_dir.path().to_owned(),
        ..Default::default()
    };
    let clock = Arc::new(ManualClock::new(ts("2024-06-15T12:00:00Z")));
    let services = Services::with_clock(config, clock.clone())?;

    let kegg = services.database("kegg")?;
    let hourly = kegg.memoizer().wrap(
        "hourly",
        Validity::After(std::time::Duration::from_secs(3600)),
        |id: &str| Ok(id.to_owned()),
    );
    let forever = kegg
        .memoizer()
        .wrap("forever", Validity::Never, |id: &str| Ok(id.to_owned()));
    hourly.call("a")?;
    forever.call("a")?;
    assert_eq!(kegg.store().len()?, 2);

    // nothing has expired yet
    assert_eq!(services.cleanup()?, 0);

    clock.set(ts("2024-06-16T12:00:00Z"));
    assert_eq!(services.cleanup()?, 1);
    assert_eq!(kegg.store().len()?, 1);
    assert_eq!(forever.cached("a")?, Some(Lookup::Value("a".to_owned())));
    Ok(())
}

#[test]
fn test_invalid_endpoint_config() {
    let root = genefetch_test::tempdir();
    let server = Server::serve_dir(root.path());
    let cache_dir = genefetch_test::tempdir();

    let mut endpoint = http_endpoint(&server);
    if let genefetch_sources::EndpointConfig::Http(ref mut http) = endpoint {
        Arc::make_mut(http)
            .headers
            .insert("bad header".into(), "value".into());
    }
    let config = Config {
        cache_dir: cache_dir.path().to_owned(),
        endpoints: vec![endpoint],
        ..Default::default()
    };
    let err = Services::from_config(config).unwrap_err();
    assert!(err.to_string().contains("failed to configure endpoints"));
}
