//! Simple Cache: TTL map with bounded size and polling subscriptions.

use super::subscribers::{EntityCallback, Subscription, TableCallback};
use super::{Entity, EntityKey, EntityPredicate, EntityStore, StoreStats};
use crate::clock::{system_clock, Clock};
use crate::config::CacheStrategy;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::AbortHandle;
use tracing::debug;

/// Entity subscription polling interval
pub const ENTITY_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Table subscription polling interval
pub const TABLE_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
struct Slot {
    entity: Entity,
    first_inserted: DateTime<Utc>,
    refreshed_at: DateTime<Utc>,
    /// Write order; breaks ties between equal timestamps
    inserted_seq: u64,
    written_seq: u64,
}

#[derive(Debug)]
struct Inner {
    tables: RwLock<HashMap<String, HashMap<String, Slot>>>,
    clock: Arc<dyn Clock>,
    ttl: chrono::Duration,
}

impl Inner {
    fn is_live(&self, slot: &Slot, now: DateTime<Utc>) -> bool {
        slot.refreshed_at
            .checked_add_signed(self.ttl)
            .map(|expires_at| expires_at > now)
            .unwrap_or(true)
    }

    /// TTL-aware read without touching hit counters
    async fn peek(&self, table: &str, id: &str) -> Option<Entity> {
        let now = self.clock.now();
        let tables = self.tables.read().await;
        tables
            .get(table)
            .and_then(|rows| rows.get(id))
            .filter(|slot| self.is_live(slot, now))
            .map(|slot| slot.entity.clone())
    }

    async fn rows(&self, table: &str) -> Vec<(String, Entity)> {
        let now = self.clock.now();
        let tables = self.tables.read().await;
        tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|(_, slot)| self.is_live(slot, now))
                    .map(|(id, slot)| (id.clone(), slot.entity.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug)]
pub struct SimpleCache {
    inner: Arc<Inner>,
    max_size: usize,
    strategy: CacheStrategy,
    pollers: Arc<Mutex<HashMap<u64, AbortHandle>>>,
    next_poller: AtomicU64,
    next_seq: AtomicU64,
    hits: AtomicU64,
    accesses: AtomicU64,
}

impl SimpleCache {
    pub fn new(max_size: usize, ttl: Duration, strategy: CacheStrategy) -> Self {
        Self::with_clock(max_size, ttl, strategy, system_clock())
    }

    pub fn with_clock(
        max_size: usize,
        ttl: Duration,
        strategy: CacheStrategy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        Self {
            inner: Arc::new(Inner {
                tables: RwLock::new(HashMap::new()),
                clock,
                ttl,
            }),
            max_size,
            strategy,
            pollers: Arc::new(Mutex::new(HashMap::new())),
            next_poller: AtomicU64::new(0),
            next_seq: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            accesses: AtomicU64::new(0),
        }
    }

    fn rank(&self, slot: &Slot) -> (DateTime<Utc>, u64) {
        match self.strategy {
            CacheStrategy::Lru => (slot.entity.meta.last_updated, slot.written_seq),
            CacheStrategy::Fifo => (slot.first_inserted, slot.inserted_seq),
            CacheStrategy::Ttl => (slot.refreshed_at, slot.written_seq),
        }
    }

    /// Drop expired slots, then evict by strategy until within capacity
    fn enforce_limits(&self, tables: &mut HashMap<String, HashMap<String, Slot>>, now: DateTime<Utc>) {
        for rows in tables.values_mut() {
            rows.retain(|_, slot| self.inner.is_live(slot, now));
        }

        let total: usize = tables.values().map(|rows| rows.len()).sum();
        if total <= self.max_size {
            return;
        }

        let mut candidates: Vec<((DateTime<Utc>, u64), EntityKey)> = tables
            .iter()
            .flat_map(|(table, rows)| {
                rows.iter()
                    .map(move |(id, slot)| (self.rank(slot), EntityKey::new(table.clone(), id.clone())))
            })
            .collect();
        candidates.sort_by_key(|(rank, _)| *rank);

        let excess = total - self.max_size;
        for (_, key) in candidates.into_iter().take(excess) {
            if let Some(rows) = tables.get_mut(&key.table) {
                rows.remove(&key.id);
            }
            debug!(key = %key, "simple cache eviction");
        }
        tables.retain(|_, rows| !rows.is_empty());
    }

    fn insert(
        &self,
        tables: &mut HashMap<String, HashMap<String, Slot>>,
        key: EntityKey,
        mut entity: Entity,
        now: DateTime<Utc>,
    ) {
        entity.meta.last_updated = now;
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let rows = tables.entry(key.table).or_default();
        let (first_inserted, inserted_seq) = rows
            .get(&key.id)
            .filter(|slot| self.inner.is_live(slot, now))
            .map(|slot| (slot.first_inserted, slot.inserted_seq))
            .unwrap_or((now, seq));
        rows.insert(
            key.id,
            Slot {
                entity,
                first_inserted,
                refreshed_at: now,
                inserted_seq,
                written_seq: seq,
            },
        );
    }

    fn register_poller(&self, handle: AbortHandle) -> Subscription {
        let id = self.next_poller.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut pollers) = self.pollers.lock() {
            pollers.insert(id, handle.clone());
        }
        let pollers = Arc::downgrade(&self.pollers);
        Subscription::new(move || {
            handle.abort();
            if let Some(pollers) = pollers.upgrade() {
                if let Ok(mut pollers) = pollers.lock() {
                    pollers.remove(&id);
                }
            }
        })
    }
}

#[async_trait]
impl EntityStore for SimpleCache {
    fn name(&self) -> &'static str {
        "simple"
    }

    async fn get(&self, table: &str, id: &str) -> Result<Option<Entity>> {
        self.accesses.fetch_add(1, Ordering::Relaxed);
        let now = self.inner.clock.now();

        let mut tables = self.inner.tables.write().await;
        let Some(rows) = tables.get_mut(table) else {
            return Ok(None);
        };
        let live = match rows.get(id) {
            Some(slot) => self.inner.is_live(slot, now),
            None => return Ok(None),
        };
        if live {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(rows.get(id).map(|slot| slot.entity.clone()));
        }

        rows.remove(id);
        debug!(table, id, "simple cache entry expired");
        Ok(None)
    }

    async fn set(&self, table: &str, id: &str, entity: Entity) -> Result<()> {
        let now = self.inner.clock.now();
        let mut tables = self.inner.tables.write().await;
        self.insert(&mut tables, EntityKey::new(table, id), entity, now);
        self.enforce_limits(&mut tables, now);
        Ok(())
    }

    async fn remove(&self, table: &str, id: &str) -> Result<Option<Entity>> {
        let now = self.inner.clock.now();
        let mut tables = self.inner.tables.write().await;
        Ok(tables
            .get_mut(table)
            .and_then(|rows| rows.remove(id))
            .filter(|slot| self.inner.is_live(slot, now))
            .map(|slot| slot.entity))
    }

    async fn set_many(&self, entries: Vec<(EntityKey, Entity)>) -> Result<()> {
        let now = self.inner.clock.now();
        let mut tables = self.inner.tables.write().await;
        for (key, entity) in entries {
            self.insert(&mut tables, key, entity, now);
        }
        self.enforce_limits(&mut tables, now);
        Ok(())
    }

    async fn remove_many(&self, keys: Vec<EntityKey>) -> Result<usize> {
        let mut tables = self.inner.tables.write().await;
        let mut removed = 0;
        for key in keys {
            if let Some(rows) = tables.get_mut(&key.table) {
                if rows.remove(&key.id).is_some() {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn query(
        &self,
        table: &str,
        predicate: EntityPredicate<'_>,
    ) -> Result<Vec<(String, Entity)>> {
        Ok(self
            .inner
            .rows(table)
            .await
            .into_iter()
            .filter(|(_, e)| predicate(e))
            .collect())
    }

    fn subscribe_entity(&self, table: &str, id: &str, callback: EntityCallback) -> Subscription {
        let inner = Arc::clone(&self.inner);
        let (table, id) = (table.to_string(), id.to_string());

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(ENTITY_POLL_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let entity = inner.peek(&table, &id).await;
                callback(entity.as_ref());
            }
        });
        self.register_poller(task.abort_handle())
    }

    fn subscribe_table(&self, table: &str, callback: TableCallback) -> Subscription {
        let inner = Arc::clone(&self.inner);
        let table = table.to_string();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(TABLE_POLL_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let rows = inner.rows(&table).await;
                callback(&rows);
            }
        });
        self.register_poller(task.abort_handle())
    }

    async fn stats(&self) -> StoreStats {
        let now = self.inner.clock.now();
        let tables = self.inner.tables.read().await;
        let mut stats = StoreStats::default();
        for (table, rows) in tables.iter() {
            let live: Vec<_> = rows
                .iter()
                .filter(|(_, slot)| self.inner.is_live(slot, now))
                .collect();
            if live.is_empty() {
                continue;
            }
            stats.per_table.insert(table.clone(), live.len());
            stats.total_entities += live.len();
            stats.memory_bytes += live
                .iter()
                .map(|(id, slot)| id.len() + slot.entity.approx_size())
                .sum::<usize>();
        }
        stats.finish(
            self.hits.load(Ordering::Relaxed),
            self.accesses.load(Ordering::Relaxed),
        )
    }

    async fn destroy(&self) {
        let handles: Vec<AbortHandle> = match self.pollers.lock() {
            Ok(mut pollers) => pollers.drain().map(|(_, h)| h).collect(),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            handle.abort();
        }
        self.inner.tables.write().await.clear();
    }
}
