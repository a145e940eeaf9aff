use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{CacheEntry, CacheError, CacheKey, Payload, Store};
use crate::clock::{Clock, Timestamp};

/// How long a memoized result may be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    /// Results never go stale on their own.
    Never,
    /// Results are reused for the given duration after they were recorded.
    After(Duration),
    /// Results are reused as long as the current release is the one they were recorded under.
    OnReleaseChange,
}

/// The outcome of a memoized call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    Value(T),
    /// The remote side reported the object as not found, now or when it was recorded.
    Missing,
}

impl<T> Lookup<T> {
    pub fn into_option(self) -> Option<T> {
        match self {
            Self::Value(value) => Some(value),
            Self::Missing => None,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing)
    }
}

/// The process-wide release tag, shared by all memoizers created from the same services.
#[derive(Debug, Clone, Default)]
pub struct ReleaseTag(Arc<RwLock<Option<String>>>);

impl ReleaseTag {
    pub fn new(release: Option<String>) -> Self {
        Self(Arc::new(RwLock::new(release)))
    }

    pub fn get(&self) -> Option<String> {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set(&self, release: Option<String>) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = release;
    }
}

/// Turns functions into persistent, keyed lookups backed by a [`Store`].
#[derive(Clone)]
pub struct Memoizer {
    store: Store,
    clock: Arc<dyn Clock>,
    release: ReleaseTag,
}

impl fmt::Debug for Memoizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memoizer")
            .field("store", &self.store)
            .field("release", &self.release)
            .finish()
    }
}

impl Memoizer {
    pub fn new(store: Store, clock: Arc<dyn Clock>, release: ReleaseTag) -> Self {
        Self {
            store,
            clock,
            release,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn release(&self) -> &ReleaseTag {
        &self.release
    }

    /// Wraps `f` so that its results are recorded under `name`.
    ///
    /// `f` reports absent objects with [`CacheError::NotFound`], which is recorded as a
    /// tombstone. Any other error is passed through without recording anything.
    pub fn wrap<A, T, F>(&self, name: &str, validity: Validity, f: F) -> Memoized<A, T, F>
    where
        A: Serialize + ?Sized,
        T: Serialize + DeserializeOwned,
        F: Fn(&A) -> Result<T, CacheError>,
    {
        Memoized {
            memoizer: self.clone(),
            name: name.into(),
            validity,
            f,
            _marker: PhantomData,
        }
    }
}

/// A memoized function, see [`Memoizer::wrap`].
pub struct Memoized<A: ?Sized, T, F> {
    memoizer: Memoizer,
    name: Arc<str>,
    validity: Validity,
    f: F,
    _marker: PhantomData<fn(&A) -> T>,
}

impl<A, T, F> Memoized<A, T, F>
where
    A: Serialize + ?Sized,
    T: Serialize + DeserializeOwned,
    F: Fn(&A) -> Result<T, CacheError>,
{
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The store key for calling with `args`.
    pub fn key(&self, args: &A) -> Result<CacheKey, CacheError> {
        CacheKey::new(&self.name, args)
    }

    /// Returns the recorded result for `args`, calling the function on a miss.
    pub fn call(&self, args: &A) -> Result<Lookup<T>, CacheError> {
        let key = self.key(args)?;
        if let Some(hit) = self.read(&key)? {
            crate::metric!(counter("memoizer.hit") += 1, "function" => &self.name);
            return Ok(hit);
        }
        crate::metric!(counter("memoizer.miss") += 1, "function" => &self.name);

        let now = self.memoizer.clock.now();
        match (self.f)(args) {
            Ok(value) => {
                self.record(&key, Payload::Value(serde_json::to_value(&value)?), now)?;
                Ok(Lookup::Value(value))
            }
            Err(CacheError::NotFound) => {
                tracing::debug!(%key, "recording tombstone");
                self.record(&key, Payload::Missing, now)?;
                Ok(Lookup::Missing)
            }
            Err(err) => Err(err),
        }
    }

    /// Returns the recorded result for `args` if it is still valid, without calling the
    /// function.
    pub fn cached(&self, args: &A) -> Result<Option<Lookup<T>>, CacheError> {
        self.read(&self.key(args)?)
    }

    /// Records `value` as the result for `args`, produced at `mtime` or now.
    pub fn memoize(&self, args: &A, value: &T, mtime: Option<Timestamp>) -> Result<(), CacheError> {
        let mtime = mtime.unwrap_or_else(|| self.memoizer.clock.now());
        let payload = Payload::Value(serde_json::to_value(value)?);
        self.record(&self.key(args)?, payload, mtime)
    }

    /// Records a tombstone for `args`.
    pub fn memoize_missing(&self, args: &A) -> Result<(), CacheError> {
        let now = self.memoizer.clock.now();
        self.record(&self.key(args)?, Payload::Missing, now)
    }

    /// Forgets the result for `args`.
    pub fn invalidate(&self, args: &A) -> Result<bool, CacheError> {
        self.memoizer.store.delete(&self.key(args)?)
    }

    /// Forgets all results of this function. Returns how many there were.
    pub fn invalidate_all(&self) -> Result<usize, CacheError> {
        let keys = self
            .memoizer
            .store
            .keys_with_prefix(&CacheKey::prefix(&self.name))?;
        let mut removed = 0;
        for key in &keys {
            if self.memoizer.store.delete(key)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn read(&self, key: &CacheKey) -> Result<Option<Lookup<T>>, CacheError> {
        let entry = match self.memoizer.store.get(key) {
            Ok(entry) => entry,
            Err(CacheError::NotFound) => return Ok(None),
            Err(CacheError::Corrupt(reason)) => {
                tracing::warn!(%key, %reason, "ignoring unreadable entry");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        if !self.is_valid(&entry) {
            return Ok(None);
        }

        match entry.payload {
            Payload::Missing => Ok(Some(Lookup::Missing)),
            Payload::Value(value) => match serde_json::from_value(value) {
                Ok(value) => Ok(Some(Lookup::Value(value))),
                Err(err) => {
                    tracing::warn!(%key, error = %err, "ignoring entry of unexpected shape");
                    Ok(None)
                }
            },
            // byte payloads decode into sequence types such as `Vec<u8>`
            Payload::Bytes(bytes) => Ok(serde_json::from_value(bytes.into())
                .ok()
                .map(Lookup::Value)),
        }
    }

    fn is_valid(&self, entry: &CacheEntry) -> bool {
        let now = self.memoizer.clock.now();
        if entry.is_stale(now) {
            return false;
        }
        match self.validity {
            Validity::Never => true,
            Validity::After(max_age) => chrono::Duration::from_std(max_age)
                .ok()
                .and_then(|max_age| now.checked_sub_signed(max_age))
                .is_none_or(|oldest| entry.mtime >= oldest),
            Validity::OnReleaseChange => entry.release == self.memoizer.release.get(),
        }
    }

    fn record(&self, key: &CacheKey, payload: Payload, mtime: Timestamp) -> Result<(), CacheError> {
        let expires = match self.validity {
            Validity::After(max_age) => chrono::Duration::from_std(max_age)
                .ok()
                .and_then(|max_age| mtime.checked_add_signed(max_age)),
            Validity::Never | Validity::OnReleaseChange => None,
        };
        let entry = CacheEntry::new(payload, mtime)
            .with_expires(expires)
            .with_release(self.memoizer.release.get());
        self.memoizer.store.put(key, &entry)
    }
}
