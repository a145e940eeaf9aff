//! Coalescing of per-id lookups into batched remote calls.
//!
//! Services like KEGG's `get` operation answer up to 100 ids per request with a stream of
//! flat-file records, each closed by a `///` line. The [`BatchCoalescer`] asks the remote only
//! for ids that are not cached yet, and records the result of every id on its own, so later
//! batches with overlapping ids are served from the store.
//!
//! When the remote answers with fewer records than ids were requested, it is not known which
//! ids are missing. Small shortfalls are isolated by splitting the batch in halves, larger ones
//! by asking for every id on its own. Ids without a record end up as tombstones.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::caching::{CacheError, Lookup, Memoized, Memoizer, Validity};

/// The line closing every record of a batch response.
pub const RECORD_TERMINATOR: &str = "///\n";

/// The largest number of ids a remote call may carry.
pub const MAX_BATCH: usize = 100;

/// Shortfalls up to this many records are isolated by bisection.
const MAX_BISECT_SHORTFALL: usize = 3;

/// A remote service that answers many ids with one call.
pub trait BatchService: Send + Sync {
    /// Returns the records of all known `ids`, in request order.
    fn fetch_batch(&self, ids: &[String]) -> Result<String, CacheError>;
}

impl<F> BatchService for F
where
    F: Fn(&[String]) -> Result<String, CacheError> + Send + Sync,
{
    fn fetch_batch(&self, ids: &[String]) -> Result<String, CacheError> {
        self(ids)
    }
}

/// Splits a batch response into its records, each with its terminator.
pub fn split_records(response: &str) -> Vec<String> {
    response
        .split(RECORD_TERMINATOR)
        .filter(|record| !record.trim().is_empty())
        .map(|record| format!("{record}{RECORD_TERMINATOR}"))
        .collect()
}

fn remote_call(service: &dyn BatchService, ids: &[String]) -> Result<Vec<String>, CacheError> {
    metric!(counter("batch.remote_call") += 1);
    tracing::debug!(ids = ids.len(), "requesting batch");
    match service.fetch_batch(ids) {
        Ok(response) => Ok(split_records(&response)),
        Err(CacheError::NotFound) => Ok(Vec::new()),
        Err(err) => Err(err),
    }
}

type Probe = Box<dyn Fn(&str) -> Result<String, CacheError> + Send + Sync>;

/// Serves per-id records from the cache, and fetches the rest in batches.
pub struct BatchCoalescer {
    service: Arc<dyn BatchService>,
    records: Memoized<str, String, Probe>,
    max_batch: usize,
}

impl fmt::Debug for BatchCoalescer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchCoalescer")
            .field("name", &self.records.name())
            .field("max_batch", &self.max_batch)
            .finish()
    }
}

impl BatchCoalescer {
    /// Creates a coalescer that records results under `name`.
    pub fn new(
        memoizer: &Memoizer,
        name: &str,
        validity: Validity,
        service: impl BatchService + 'static,
    ) -> Self {
        let service: Arc<dyn BatchService> = Arc::new(service);

        let single = service.clone();
        let probe: Probe = Box::new(move |id: &str| {
            let mut records = remote_call(single.as_ref(), &[id.to_owned()])?;
            match records.len() {
                0 => Err(CacheError::NotFound),
                1 => Ok(records.remove(0)),
                n => Err(CacheError::Corrupt(format!("{n} records for id {id}"))),
            }
        });

        Self {
            service,
            records: memoizer.wrap(name, validity, probe),
            max_batch: MAX_BATCH,
        }
    }

    /// The recorded result for `id`, if any.
    pub fn cached(&self, id: &str) -> Result<Option<Lookup<String>>, CacheError> {
        self.records.cached(id)
    }

    /// Returns the concatenated records of `ids`, in request order.
    ///
    /// Ids unknown to the remote contribute nothing. More than [`MAX_BATCH`] ids are rejected
    /// with [`CacheError::InvalidRequest`] before anything is fetched or recorded.
    pub fn batch<S: AsRef<str>>(&self, ids: &[S]) -> Result<String, CacheError> {
        if ids.len() > self.max_batch {
            return Err(CacheError::InvalidRequest(format!(
                "batch of {} ids exceeds the limit of {}",
                ids.len(),
                self.max_batch
            )));
        }

        let mut resolved = HashMap::new();
        let mut uncached = Vec::new();
        for id in ids {
            let id = id.as_ref();
            match self.records.cached(id)? {
                Some(lookup) => {
                    resolved.insert(id.to_owned(), lookup);
                }
                None => uncached.push(id.to_owned()),
            }
        }
        uncached.sort();
        uncached.dedup();

        if !uncached.is_empty() {
            self.resolve(&uncached, &mut resolved)?;
        }

        let mut output = String::new();
        for id in ids {
            if let Some(Lookup::Value(record)) = resolved.get(id.as_ref()) {
                output.push_str(record);
            }
        }
        Ok(output)
    }

    fn resolve(
        &self,
        ids: &[String],
        resolved: &mut HashMap<String, Lookup<String>>,
    ) -> Result<(), CacheError> {
        if let [id] = ids {
            let lookup = self.records.call(id)?;
            resolved.insert(id.clone(), lookup);
            return Ok(());
        }

        let records = remote_call(self.service.as_ref(), ids)?;
        if records.len() == ids.len() {
            for (id, record) in ids.iter().zip(records) {
                self.records.memoize(id, &record, None)?;
                resolved.insert(id.clone(), Lookup::Value(record));
            }
            return Ok(());
        }
        if records.len() > ids.len() {
            return Err(CacheError::Corrupt(format!(
                "{} records for {} ids",
                records.len(),
                ids.len()
            )));
        }

        let shortfall = ids.len() - records.len();
        tracing::debug!(ids = ids.len(), shortfall, "isolating unknown ids");
        if shortfall <= MAX_BISECT_SHORTFALL {
            let (left, right) = ids.split_at(ids.len() / 2);
            self.resolve(left, resolved)?;
            self.resolve(right, resolved)?;
        } else {
            for id in ids {
                self.resolve(std::slice::from_ref(id), resolved)?;
            }
        }
        Ok(())
    }
}
