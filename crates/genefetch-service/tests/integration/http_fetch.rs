use std::fs;

use genefetch_service::caching::CacheError;
use genefetch_service::download::UpdatePolicy;
use genefetch_sources::RemoteRef;
use genefetch_test::Server;

use crate::{ENDPOINT, setup_services};

fn remote(path: &str) -> RemoteRef {
    RemoteRef::new(ENDPOINT, path)
}

#[test]
fn test_retrieve_over_http() {
    let root = genefetch_test::tempdir();
    genefetch_test::write_file(root.path(), "data/ann.tab", &[b'a'; 1024]);
    let server = Server::serve_dir(root.path());
    let (services, cache_dir) = setup_services(&server);
    let kegg = services.database("kegg").unwrap();

    let local = services
        .retrieve(&kegg, &remote("/data/ann.tab"), UpdatePolicy::Check)
        .unwrap();
    assert_eq!(local, cache_dir.path().join("kegg/files/files/data/ann.tab"));
    assert_eq!(fs::read(&local).unwrap(), vec![b'a'; 1024]);
    assert_eq!(server.count("GET /data/ann.tab"), 1);

    // the installed file carries the remote mtime, so it is up to date now
    services
        .retrieve(&kegg, &remote("/data/ann.tab"), UpdatePolicy::Check)
        .unwrap();
    assert_eq!(server.count("GET /data/ann.tab"), 1);

    services
        .retrieve(&kegg, &remote("/data/ann.tab"), UpdatePolicy::Force)
        .unwrap();
    assert_eq!(server.count("GET /data/ann.tab"), 2);
}

#[test]
fn test_retrieve_missing_over_http() {
    let root = genefetch_test::tempdir();
    let server = Server::serve_dir(root.path());
    let (services, _cache_dir) = setup_services(&server);
    let kegg = services.database("kegg").unwrap();

    let result = services.retrieve(&kegg, &remote("/data/nope.tab"), UpdatePolicy::Check);
    assert_eq!(result, Err(CacheError::NotFound));
    assert!(!kegg.local_path(&remote("/data/nope.tab")).exists());
}

#[test]
fn test_retrieve_all_over_http() {
    let root = genefetch_test::tempdir();
    for i in 0..6 {
        let contents = format!("gene{i}\tdescription\n").repeat(i + 1);
        genefetch_test::write_file(root.path(), &format!("genes/g{i}.tab"), contents.as_bytes());
    }
    let server = Server::serve_dir(root.path());
    let (services, _cache_dir) = setup_services(&server);
    let kegg = services.database("kegg").unwrap();

    let mut remotes: Vec<_> = (0..6).map(|i| remote(&format!("/genes/g{i}.tab"))).collect();
    remotes.push(remote("/genes/missing.tab"));

    let mut reported = Vec::new();
    let report = services
        .retrieve_all(&kegg, &remotes, UpdatePolicy::Check, |p: u8| {
            reported.push(p)
        })
        .unwrap();

    assert_eq!(report.total, 7);
    assert_eq!(report.succeeded, 6);
    assert_eq!(
        report.failed,
        vec![(remote("/genes/missing.tab"), CacheError::NotFound)]
    );
    assert_eq!(reported.iter().filter(|p| **p == 100).count(), 1);
    assert!(reported.windows(2).all(|w| w[0] < w[1]));

    for i in 0..6 {
        let local = kegg.local_path(&remote(&format!("/genes/g{i}.tab")));
        let expected = format!("gene{i}\tdescription\n").repeat(i + 1);
        assert_eq!(fs::read_to_string(local).unwrap(), expected);
    }
}
