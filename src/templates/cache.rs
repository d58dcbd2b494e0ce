use std::collections::HashMap;
use std::future::Future;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};
use std::time::{Duration, Instant};

use anyhow::{Error, Result, anyhow};
use tokio::sync::OnceCell;
use tracing::debug;

use crate::models::template::Template;

const SHARDS: usize = 8;

type LoadCell = Arc<OnceCell<Option<Arc<Template>>>>;

struct Entry {
    template: Arc<Template>,
    inserted_at: Instant,
    touched: u64,
}

enum Slot {
    Ready(Entry),
    Loading(LoadCell),
}

struct Shard {
    slots: HashMap<String, Slot>,
}

/// Time-bounded template cache keyed by `(name, service, locale)`.
///
/// Entries expire after a uniform TTL and are lazily removed on access.
/// Concurrent misses on the same key coalesce on a per-key sentinel so the
/// loader runs once. Eviction is LRU, bounded by the configured capacity
/// across all shards; a shared residency counter keeps the global bound
/// while each shard keeps its own lock.
pub struct TemplateCache {
    shards: Vec<Mutex<Shard>>,
    ttl: Duration,
    capacity: usize,
    ready_count: AtomicUsize,
    ticks: AtomicU64,
}

impl TemplateCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        let shards = (0..SHARDS)
            .map(|_| {
                Mutex::new(Shard {
                    slots: HashMap::new(),
                })
            })
            .collect();
        Self {
            shards,
            ttl,
            capacity: capacity.max(1),
            ready_count: AtomicUsize::new(0),
            ticks: AtomicU64::new(0),
        }
    }

    pub fn get(&self, name: &str, service: &str, locale: &str) -> Option<Arc<Template>> {
        let key = cache_key(name, service, locale);
        let Ok(mut shard) = self.shard(&key).lock() else {
            return None;
        };
        match shard.slots.get_mut(&key) {
            Some(Slot::Ready(entry)) => {
                if entry.inserted_at.elapsed() < self.ttl {
                    entry.touched = self.tick();
                    Some(entry.template.clone())
                } else {
                    shard.slots.remove(&key);
                    self.ready_count.fetch_sub(1, Ordering::Relaxed);
                    None
                }
            }
            _ => None,
        }
    }

    /// Inserts or replaces the entry for the key. The last writer wins;
    /// readers only ever see a complete entry.
    pub fn put(&self, name: &str, service: &str, locale: &str, template: Template) {
        self.put_arc(&cache_key(name, service, locale), Arc::new(template));
    }

    /// Returns the cached template, or runs `loader` to fill the slot.
    /// Callers racing on the same key block on the first loader's result
    /// instead of issuing redundant loads. A `None` or `Err` outcome leaves
    /// the slot empty.
    pub async fn get_or_load<F, Fut>(
        &self,
        name: &str,
        service: &str,
        locale: &str,
        loader: F,
    ) -> Result<Option<Arc<Template>>, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<Template>, Error>>,
    {
        let key = cache_key(name, service, locale);

        let cell = {
            let mut shard = self
                .shard(&key)
                .lock()
                .map_err(|_| anyhow!("cache lock poisoned"))?;
            match shard.slots.get_mut(&key) {
                Some(Slot::Ready(entry)) if entry.inserted_at.elapsed() < self.ttl => {
                    entry.touched = self.tick();
                    return Ok(Some(entry.template.clone()));
                }
                Some(Slot::Loading(cell)) => cell.clone(),
                _ => {
                    let cell: LoadCell = Arc::new(OnceCell::new());
                    let previous = shard.slots.insert(key.clone(), Slot::Loading(cell.clone()));
                    if matches!(previous, Some(Slot::Ready(_))) {
                        self.ready_count.fetch_sub(1, Ordering::Relaxed);
                    }
                    debug!(key = %key, "Template cache miss, loading");
                    cell
                }
            }
        };

        let loaded = cell
            .get_or_try_init(|| async { loader().await.map(|found| found.map(Arc::new)) })
            .await
            .map(|found| found.clone());

        let mut installed = false;
        {
            let mut shard = self
                .shard(&key)
                .lock()
                .map_err(|_| anyhow!("cache lock poisoned"))?;
            let ours = matches!(
                shard.slots.get(&key),
                Some(Slot::Loading(current)) if Arc::ptr_eq(current, &cell)
            );
            if ours {
                match &loaded {
                    Ok(Some(template)) => {
                        let entry = Entry {
                            template: template.clone(),
                            inserted_at: Instant::now(),
                            touched: self.tick(),
                        };
                        let previous = shard.slots.insert(key.clone(), Slot::Ready(entry));
                        if !matches!(previous, Some(Slot::Ready(_))) {
                            self.ready_count.fetch_add(1, Ordering::Relaxed);
                        }
                        installed = true;
                    }
                    _ => {
                        shard.slots.remove(&key);
                    }
                }
            }
        }
        if installed {
            self.evict_to_capacity();
        }

        loaded
    }

    fn put_arc(&self, key: &str, template: Arc<Template>) {
        {
            let Ok(mut shard) = self.shard(key).lock() else {
                return;
            };
            let entry = Entry {
                template,
                inserted_at: Instant::now(),
                touched: self.tick(),
            };
            let previous = shard.slots.insert(key.to_string(), Slot::Ready(entry));
            if !matches!(previous, Some(Slot::Ready(_))) {
                self.ready_count.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.evict_to_capacity();
    }

    /// Drops least-recently-touched ready entries until the whole cache fits
    /// its capacity. In-flight loads are never evicted.
    fn evict_to_capacity(&self) {
        while self.ready_count.load(Ordering::Relaxed) > self.capacity {
            if !self.evict_one() {
                return;
            }
        }
    }

    /// Removes the globally least-recently-touched ready entry. Shards are
    /// locked one at a time, never nested; a racing writer re-runs the loop
    /// above until the bound holds.
    fn evict_one(&self) -> bool {
        let mut oldest: Option<(u64, usize, String)> = None;
        for (index, shard) in self.shards.iter().enumerate() {
            let Ok(shard) = shard.lock() else {
                continue;
            };
            for (key, slot) in &shard.slots {
                if let Slot::Ready(entry) = slot {
                    if oldest
                        .as_ref()
                        .is_none_or(|(touched, _, _)| entry.touched < *touched)
                    {
                        oldest = Some((entry.touched, index, key.clone()));
                    }
                }
            }
        }

        let Some((_, index, key)) = oldest else {
            return false;
        };
        let Ok(mut shard) = self.shards[index].lock() else {
            return false;
        };
        if matches!(shard.slots.get(&key), Some(Slot::Ready(_))) {
            shard.slots.remove(&key);
            self.ready_count.fetch_sub(1, Ordering::Relaxed);
        }
        true
    }

    fn shard(&self, key: &str) -> &Mutex<Shard> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % SHARDS]
    }

    fn tick(&self) -> u64 {
        self.ticks.fetch_add(1, Ordering::Relaxed)
    }
}

fn cache_key(name: &str, service: &str, locale: &str) -> String {
    format!("{}|{}|{}", name, service, locale)
}
