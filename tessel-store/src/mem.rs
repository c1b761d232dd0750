use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tessel_error::TesselResult;
use tessel_metrics::{Counter, TesselMetrics};

use crate::{ApplyFn, Key, Store};

#[derive(Debug, Clone)]
struct Versioned<V> {
    version: u64,
    value: V,
}

/// An in-memory [`Store`] with optimistic, versioned [`Store::apply`].
///
/// Every commit stamps the entry with a store-wide version, so a value that was removed and put
/// back is never mistaken for the one an in-flight `apply` read.
pub struct MemStore<V> {
    entries: DashMap<Key, Versioned<V>>,
    next_version: AtomicU64,
    metrics: StoreMetrics,
}

struct StoreMetrics {
    puts: Arc<Counter>,
    removes: Arc<Counter>,
    commits: Arc<Counter>,
    retries: Arc<Counter>,
}

impl StoreMetrics {
    fn new(metrics: &TesselMetrics) -> Self {
        Self {
            puts: metrics.counter("store.puts"),
            removes: metrics.counter("store.removes"),
            commits: metrics.counter("store.apply.commits"),
            retries: metrics.counter("store.apply.retries"),
        }
    }
}

impl<V> Default for MemStore<V> {
    fn default() -> Self {
        Self::new(TesselMetrics::default())
    }
}

impl<V> MemStore<V> {
    pub fn new(metrics: TesselMetrics) -> Self {
        Self {
            entries: DashMap::new(),
            next_version: AtomicU64::new(0),
            metrics: StoreMetrics::new(&metrics),
        }
    }

    /// Number of values written with [`Store::put`] so far.
    pub fn puts(&self) -> i64 {
        self.metrics.puts.count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.entries.contains_key(key)
    }

    fn stamp(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::Relaxed)
    }
}

impl<V> Store<V> for MemStore<V>
where
    V: Clone + Send + Sync,
{
    fn put(&self, key: Key, value: V) {
        let version = self.stamp();
        self.entries.insert(key, Versioned { version, value });
        self.metrics.puts.inc();
    }

    fn get(&self, key: &Key) -> Option<V> {
        self.entries.get(key).map(|e| e.value.clone())
    }

    fn remove(&self, key: &Key) -> Option<V> {
        let removed = self.entries.remove(key).map(|(_, e)| e.value);
        if removed.is_some() {
            self.metrics.removes.inc();
        }
        removed
    }

    fn apply(&self, key: &Key, f: &mut ApplyFn<'_, V>) -> TesselResult<Option<V>> {
        loop {
            // Read without holding the shard lock while `f` runs.
            let observed = self
                .entries
                .get(key)
                .map(|e| (e.version, e.value.clone()));
            let (version, current) = match observed {
                Some((version, value)) => (Some(version), Some(value)),
                None => (None, None),
            };

            let Some(next) = f(current.as_ref())? else {
                return Ok(current);
            };

            let committed = match self.entries.entry(key.clone()) {
                Entry::Occupied(mut entry) if Some(entry.get().version) == version => {
                    entry.insert(Versioned {
                        version: self.stamp(),
                        value: next.clone(),
                    });
                    true
                }
                Entry::Vacant(entry) if version.is_none() => {
                    entry.insert(Versioned {
                        version: self.stamp(),
                        value: next.clone(),
                    });
                    true
                }
                _ => false,
            };

            if committed {
                self.metrics.commits.inc();
                return Ok(Some(next));
            }
            self.metrics.retries.inc();
            log::trace!("apply on {key} lost a race, retrying");
        }
    }
}
