use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use genefetch_service::batch::BatchCoalescer;
use genefetch_service::caching::{CacheError, Lookup, Validity};
use genefetch_service::clock::{ManualClock, Timestamp};
use genefetch_service::config::Config;
use genefetch_service::services::Services;

fn ts(s: &str) -> Timestamp {
    s.parse().unwrap()
}

fn services(config: &Config, clock: &Arc<ManualClock>) -> Services {
    Services::with_clock(config.clone(), clock.clone()).unwrap()
}

fn config(cache_dir: &genefetch_test::TempDir) -> Config {
    Config {
        cache_dir: cache_dir.path().to_owned(),
        release: Some("110.0".into()),
        ..Default::default()
    }
}

#[test]
fn test_results_survive_restarts() -> anyhow::Result<()> {
    genefetch_test::setup();
    let cache_dir = genefetch_test::tempdir();
    let config = config(&cache_dir);
    let clock = Arc::new(ManualClock::new(ts("2024-06-15T12:00:00Z")));

    let calls = AtomicUsize::new(0);
    let symbol = |id: &str| -> Result<String, CacheError> {
        calls.fetch_add(1, Ordering::Relaxed);
        match id {
            "hsa:7157" => Ok("TP53".to_owned()),
            _ => Err(CacheError::NotFound),
        }
    };

    {
        let services = services(&config, &clock);
        let kegg = services.database("kegg")?;
        let lookup = kegg.memoizer().wrap("symbol", Validity::Never, symbol);
        assert_eq!(lookup.call("hsa:7157")?, Lookup::Value("TP53".to_owned()));
        assert_eq!(lookup.call("hsa:0")?, Lookup::Missing);
    }

    let services = services(&config, &clock);
    let kegg = services.database("kegg")?;
    let lookup = kegg.memoizer().wrap("symbol", Validity::Never, symbol);
    assert_eq!(lookup.call("hsa:7157")?, Lookup::Value("TP53".to_owned()));
    assert_eq!(lookup.call("hsa:0")?, Lookup::Missing);
    assert_eq!(calls.load(Ordering::Relaxed), 2);

    // other databases do not see these results
    let ensembl = services.database("ensembl")?;
    let lookup = ensembl.memoizer().wrap("symbol", Validity::Never, symbol);
    assert_eq!(lookup.cached("hsa:7157")?, None);
    Ok(())
}

#[test]
fn test_expiry_and_release_change() -> anyhow::Result<()> {
    let cache_dir = genefetch_test::tempdir();
    let mut config = config(&cache_dir);
    let clock = Arc::new(ManualClock::new(ts("2024-06-15T12:00:00Z")));

    let calls = AtomicUsize::new(0);
    let fetch = |id: &str| -> Result<usize, CacheError> {
        Ok(calls.fetch_add(1, Ordering::Relaxed) + id.len())
    };

    {
        let services = services(&config, &clock);
        let kegg = services.database("kegg")?;
        let hourly = kegg
            .memoizer()
            .wrap("hourly", Validity::After(Duration::from_secs(3600)), fetch);
        let per_release = kegg
            .memoizer()
            .wrap("per_release", Validity::OnReleaseChange, fetch);
        hourly.call("a")?;
        per_release.call("a")?;
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    // half an hour later, nothing is stale
    clock.set(ts("2024-06-15T12:30:00Z"));
    {
        let services = services(&config, &clock);
        let kegg = services.database("kegg")?;
        let hourly = kegg
            .memoizer()
            .wrap("hourly", Validity::After(Duration::from_secs(3600)), fetch);
        let per_release = kegg
            .memoizer()
            .wrap("per_release", Validity::OnReleaseChange, fetch);
        hourly.call("a")?;
        per_release.call("a")?;
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    // two hours later, only the expiring result is refreshed
    clock.set(ts("2024-06-15T14:00:00Z"));
    {
        let services = services(&config, &clock);
        let kegg = services.database("kegg")?;
        let hourly = kegg
            .memoizer()
            .wrap("hourly", Validity::After(Duration::from_secs(3600)), fetch);
        let per_release = kegg
            .memoizer()
            .wrap("per_release", Validity::OnReleaseChange, fetch);
        hourly.call("a")?;
        per_release.call("a")?;
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    config.release = Some("111.0".into());
    let services = services(&config, &clock);
    let kegg = services.database("kegg")?;
    let per_release = kegg
        .memoizer()
        .wrap("per_release", Validity::OnReleaseChange, fetch);
    per_release.call("a")?;
    per_release.call("a")?;
    assert_eq!(calls.load(Ordering::Relaxed), 4);
    Ok(())
}

#[test]
fn test_batch_records_survive_restarts() -> anyhow::Result<()> {
    let cache_dir = genefetch_test::tempdir();
    let config = config(&cache_dir);
    let clock = Arc::new(ManualClock::new(ts("2024-06-15T12:00:00Z")));

    let remote_calls = Arc::new(AtomicUsize::new(0));
    let service = {
        let remote_calls = remote_calls.clone();
        move |ids: &[String]| -> Result<String, CacheError> {
            remote_calls.fetch_add(1, Ordering::Relaxed);
            Ok(ids
                .iter()
                .filter(|id| id.as_str() != "hsa:0")
                .map(|id| format!("ENTRY {id}\n///\n"))
                .collect())
        }
    };

    {
        let services = services(&config, &clock);
        let kegg = services.database("kegg")?;
        let coalescer =
            BatchCoalescer::new(kegg.memoizer(), "get", Validity::Never, service.clone());
        let records = coalescer.batch(&["hsa:1", "hsa:0", "hsa:2"])?;
        assert_eq!(records, "ENTRY hsa:1\n///\nENTRY hsa:2\n///\n");
    }
    let calls = remote_calls.load(Ordering::Relaxed);

    let services = services(&config, &clock);
    let kegg = services.database("kegg")?;
    let coalescer = BatchCoalescer::new(kegg.memoizer(), "get", Validity::Never, service);
    assert_eq!(coalescer.batch(&["hsa:2", "hsa:0"])?, "ENTRY hsa:2\n///\n");
    assert_eq!(coalescer.cached("hsa:0")?, Some(Lookup::Missing));
    assert_eq!(remote_calls.load(Ordering::Relaxed), calls);
    Ok(())
}
