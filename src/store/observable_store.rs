//! Reactive store over a single ordered key map.
//!
//! Keys are ordered by `(table, id)`, so a table is a contiguous range and
//! queries iterate in id order.

use super::subscribers::{EntityCallback, SubscriberRegistry, Subscription, TableCallback};
use super::{Entity, EntityKey, EntityPredicate, EntityStore, StoreStats};
use crate::clock::{system_clock, Clock};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug)]
pub struct ObservableStore {
    entries: Arc<RwLock<BTreeMap<EntityKey, Entity>>>,
    subscribers: Arc<SubscriberRegistry>,
    clock: Arc<dyn Clock>,
    hits: AtomicU64,
    accesses: AtomicU64,
}

fn table_rows<'a>(
    entries: &'a BTreeMap<EntityKey, Entity>,
    table: &'a str,
) -> impl Iterator<Item = (&'a EntityKey, &'a Entity)> + 'a {
    entries
        .range(EntityKey::new(table, "")..)
        .take_while(move |(key, _)| key.table == table)
}

impl ObservableStore {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(RwLock::new(BTreeMap::new())),
            subscribers: SubscriberRegistry::new(),
            clock,
            hits: AtomicU64::new(0),
            accesses: AtomicU64::new(0),
        }
    }

    async fn commit(&self, writes: Vec<(EntityKey, Entity)>, removals: Vec<EntityKey>) -> usize {
        let mut events: Vec<(EntityKey, Option<Entity>)> = Vec::new();
        let mut touched: BTreeSet<String> = BTreeSet::new();

        let snapshots = {
            let mut entries = self.entries.write().await;
            let now = self.clock.now();

            for (key, mut entity) in writes {
                entity.meta.last_updated = now;
                let unchanged = entries
                    .get(&key)
                    .map(|old| old.same_content(&entity))
                    .unwrap_or(false);
                entries.insert(key.clone(), entity.clone());
                if !unchanged {
                    touched.insert(key.table.clone());
                    events.push((key, Some(entity)));
                }
            }

            for key in removals {
                if entries.remove(&key).is_some() {
                    touched.insert(key.table.clone());
                    events.push((key, None));
                }
            }

            touched
                .iter()
                .filter(|table| self.subscribers.has_table_subscribers(table))
                .map(|table| {
                    let rows: Vec<(String, Entity)> = table_rows(&entries, table)
                        .map(|(k, e)| (k.id.clone(), e.clone()))
                        .collect();
                    (table.clone(), rows)
                })
                .collect::<Vec<_>>()
        };

        let removed = events.iter().filter(|(_, e)| e.is_none()).count();
        for (key, entity) in &events {
            self.subscribers.notify_entity(key, entity.as_ref());
        }
        for (table, rows) in &snapshots {
            self.subscribers.notify_table(table, rows);
        }
        if !events.is_empty() {
            debug!(changes = events.len(), tables = touched.len(), "observable store commit");
        }

        removed
    }
}

impl Default for ObservableStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EntityStore for ObservableStore {
    fn name(&self) -> &'static str {
        "observable"
    }

    async fn get(&self, table: &str, id: &str) -> Result<Option<Entity>> {
        self.accesses.fetch_add(1, Ordering::Relaxed);
        let entity = self
            .entries
            .read()
            .await
            .get(&EntityKey::new(table, id))
            .cloned();
        if entity.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        Ok(entity)
    }

    async fn set(&self, table: &str, id: &str, entity: Entity) -> Result<()> {
        self.commit(vec![(EntityKey::new(table, id), entity)], Vec::new())
            .await;
        Ok(())
    }

    async fn remove(&self, table: &str, id: &str) -> Result<Option<Entity>> {
        let key = EntityKey::new(table, id);
        let existing = self.entries.read().await.get(&key).cloned();
        if existing.is_some() {
            self.commit(Vec::new(), vec![key]).await;
        }
        Ok(existing)
    }

    async fn set_many(&self, entries: Vec<(EntityKey, Entity)>) -> Result<()> {
        self.commit(entries, Vec::new()).await;
        Ok(())
    }

    async fn remove_many(&self, keys: Vec<EntityKey>) -> Result<usize> {
        Ok(self.commit(Vec::new(), keys).await)
    }

    async fn query(
        &self,
        table: &str,
        predicate: EntityPredicate<'_>,
    ) -> Result<Vec<(String, Entity)>> {
        let entries = self.entries.read().await;
        Ok(table_rows(&entries, table)
            .filter(|(_, e)| predicate(*e))
            .map(|(k, e)| (k.id.clone(), e.clone()))
            .collect())
    }

    fn subscribe_entity(&self, table: &str, id: &str, callback: EntityCallback) -> Subscription {
        self.subscribers
            .add_entity(EntityKey::new(table, id), callback)
    }

    fn subscribe_table(&self, table: &str, callback: TableCallback) -> Subscription {
        self.subscribers.add_table(table, callback)
    }

    async fn stats(&self) -> StoreStats {
        let entries = self.entries.read().await;
        let mut stats = StoreStats {
            total_entities: entries.len(),
            ..Default::default()
        };
        for (key, entity) in entries.iter() {
            *stats.per_table.entry(key.table.clone()).or_insert(0) += 1;
            stats.memory_bytes += key.id.len() + entity.approx_size();
        }
        stats.finish(
            self.hits.load(Ordering::Relaxed),
            self.accesses.load(Ordering::Relaxed),
        )
    }

    async fn destroy(&self) {
        self.subscribers.clear();
        self.entries.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn entity(value: serde_json::Value) -> Entity {
        Entity::new(value.as_object().cloned().unwrap_or_default())
    }

    #[tokio::test]
    async fn test_query_stays_within_table() {
        let store = ObservableStore::new();
        store.set("post", "x", entity(json!({"n": 0}))).await.unwrap();
        store.set("posts", "b", entity(json!({"n": 2}))).await.unwrap();
        store.set("posts", "a", entity(json!({"n": 1}))).await.unwrap();
        store.set("postsz", "c", entity(json!({"n": 3}))).await.unwrap();

        let rows = store.query("posts", &|_: &Entity| true).await.unwrap();
        let ids: Vec<_> = rows.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_notifications_and_equality_suppression() {
        let store = ObservableStore::new();
        let entity_calls = Arc::new(AtomicUsize::new(0));
        let table_calls = Arc::new(AtomicUsize::new(0));

        let ec = Arc::clone(&entity_calls);
        let _e = store.subscribe_entity(
            "users",
            "u1",
            Arc::new(move |_: Option<&Entity>| {
                ec.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let tc = Arc::clone(&table_calls);
        let t = store.subscribe_table(
            "users",
            Arc::new(move |_: &[(String, Entity)]| {
                tc.fetch_add(1, Ordering::SeqCst);
            }),
        );

        store.set("users", "u1", entity(json!({"a": 1}))).await.unwrap();
        store.set("users", "u1", entity(json!({"a": 1}))).await.unwrap();
        assert_eq!(entity_calls.load(Ordering::SeqCst), 1);
        assert_eq!(table_calls.load(Ordering::SeqCst), 1);

        t.unsubscribe();
        store.set("users", "u1", entity(json!({"a": 2}))).await.unwrap();
        assert_eq!(entity_calls.load(Ordering::SeqCst), 2);
        assert_eq!(table_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stats_per_table() {
        let store = ObservableStore::new();
        store.set("users", "u1", entity(json!({"a": 1}))).await.unwrap();
        store.set("posts", "p1", entity(json!({"a": 1}))).await.unwrap();
        store.set("posts", "p2", entity(json!({"a": 1}))).await.unwrap();

        let stats = store.stats().await;
        assert_eq!(stats.total_entities, 3);
        assert_eq!(stats.per_table.get("posts"), Some(&2));
        assert!(stats.memory_bytes > 0);
        assert_eq!(stats.hit_ratio, 0.0);
    }
}
