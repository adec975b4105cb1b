//! Reactive store keeping one map per table.

use super::subscribers::{EntityCallback, SubscriberRegistry, Subscription, TableCallback};
use super::{Entity, EntityKey, EntityPredicate, EntityStore, StoreStats};
use crate::clock::{system_clock, Clock};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

type Rows = HashMap<String, Entity>;

#[derive(Debug)]
pub struct TableStore {
    tables: Arc<RwLock<HashMap<String, Rows>>>,
    subscribers: Arc<SubscriberRegistry>,
    clock: Arc<dyn Clock>,
    hits: AtomicU64,
    accesses: AtomicU64,
}

impl TableStore {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            tables: Arc::new(RwLock::new(HashMap::new())),
            subscribers: SubscriberRegistry::new(),
            clock,
            hits: AtomicU64::new(0),
            accesses: AtomicU64::new(0),
        }
    }

    fn snapshot(rows: &Rows) -> Vec<(String, Entity)> {
        rows.iter().map(|(id, e)| (id.clone(), e.clone())).collect()
    }

    /// Apply writes and removals as one batch, then notify
    async fn apply(
        &self,
        writes: Vec<(EntityKey, Entity)>,
        removals: Vec<EntityKey>,
    ) -> usize {
        let mut changed_entities: Vec<(EntityKey, Option<Entity>)> = Vec::new();
        let mut changed_tables: HashSet<String> = HashSet::new();
        let mut removed = 0;

        let table_snapshots = {
            let mut tables = self.tables.write().await;

            for (key, mut entity) in writes {
                entity.meta.last_updated = self.clock.now();
                let rows = tables.entry(key.table.clone()).or_default();
                let changed = rows
                    .get(&key.id)
                    .map(|old| !old.same_content(&entity))
                    .unwrap_or(true);
                rows.insert(key.id.clone(), entity.clone());
                if changed {
                    changed_tables.insert(key.table.clone());
                    changed_entities.push((key, Some(entity)));
                }
            }

            for key in removals {
                let Some(rows) = tables.get_mut(&key.table) else {
                    continue;
                };
                if rows.remove(&key.id).is_some() {
                    removed += 1;
                    changed_tables.insert(key.table.clone());
                    changed_entities.push((key, None));
                }
            }

            changed_tables
                .iter()
                .filter(|t| self.subscribers.has_table_subscribers(t))
                .map(|t| {
                    let rows = tables.get(t).map(Self::snapshot).unwrap_or_default();
                    (t.clone(), rows)
                })
                .collect::<Vec<_>>()
        };

        for (key, entity) in &changed_entities {
            debug!(key = %key, removed = entity.is_none(), "table store change");
            self.subscribers.notify_entity(key, entity.as_ref());
        }
        for (table, rows) in &table_snapshots {
            self.subscribers.notify_table(table, rows);
        }

        removed
    }
}

impl Default for TableStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EntityStore for TableStore {
    fn name(&self) -> &'static str {
        "table"
    }

    async fn get(&self, table: &str, id: &str) -> Result<Option<Entity>> {
        self.accesses.fetch_add(1, Ordering::Relaxed);
        let tables = self.tables.read().await;
        let entity = tables.get(table).and_then(|rows| rows.get(id)).cloned();
        if entity.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        Ok(entity)
    }

    async fn set(&self, table: &str, id: &str, entity: Entity) -> Result<()> {
        self.apply(vec![(EntityKey::new(table, id), entity)], Vec::new())
            .await;
        Ok(())
    }

    async fn remove(&self, table: &str, id: &str) -> Result<Option<Entity>> {
        let existing = {
            let tables = self.tables.read().await;
            tables.get(table).and_then(|rows| rows.get(id)).cloned()
        };
        if existing.is_some() {
            self.apply(Vec::new(), vec![EntityKey::new(table, id)]).await;
        }
        Ok(existing)
    }

    async fn set_many(&self, entries: Vec<(EntityKey, Entity)>) -> Result<()> {
        self.apply(entries, Vec::new()).await;
        Ok(())
    }

    async fn remove_many(&self, keys: Vec<EntityKey>) -> Result<usize> {
        Ok(self.apply(Vec::new(), keys).await)
    }

    async fn query(
        &self,
        table: &str,
        predicate: EntityPredicate<'_>,
    ) -> Result<Vec<(String, Entity)>> {
        let tables = self.tables.read().await;
        Ok(tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|(_, e)| predicate(*e))
                    .map(|(id, e)| (id.clone(), e.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn subscribe_entity(&self, table: &str, id: &str, callback: EntityCallback) -> Subscription {
        self.subscribers
            .add_entity(EntityKey::new(table, id), callback)
    }

    fn subscribe_table(&self, table: &str, callback: TableCallback) -> Subscription {
        self.subscribers.add_table(table, callback)
    }

    async fn stats(&self) -> StoreStats {
        let tables = self.tables.read().await;
        let mut stats = StoreStats::default();
        for (table, rows) in tables.iter() {
            stats.per_table.insert(table.clone(), rows.len());
            stats.total_entities += rows.len();
            stats.memory_bytes += rows
                .iter()
                .map(|(id, e)| id.len() + e.approx_size())
                .sum::<usize>();
        }
        stats.finish(
            self.hits.load(Ordering::Relaxed),
            self.accesses.load(Ordering::Relaxed),
        )
    }

    async fn destroy(&self) {
        self.subscribers.clear();
        self.tables.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Record;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn entity(value: serde_json::Value) -> Entity {
        let data: Record = value.as_object().cloned().unwrap_or_default();
        Entity::new(data)
    }

    #[tokio::test]
    async fn test_set_get_remove() {
        let store = TableStore::new();
        store.set("users", "u1", entity(json!({"name": "A"}))).await.unwrap();

        let found = store.get("users", "u1").await.unwrap().unwrap();
        assert_eq!(found.field("name"), Some(&json!("A")));
        assert!(store.get("users", "missing").await.unwrap().is_none());

        assert!(store.remove("users", "u1").await.unwrap().is_some());
        assert!(store.remove("users", "u1").await.unwrap().is_none());

        let stats = store.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.total_accesses, 2);
        assert!((stats.hit_ratio - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_entity_notification_suppressed_when_equal() {
        let store = TableStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = store.subscribe_entity(
            "users",
            "u1",
            Arc::new(move |e: Option<&Entity>| {
                sink.lock()
                    .unwrap()
                    .push(e.and_then(|e| e.field("name").cloned()));
            }),
        );

        store.set("users", "u1", entity(json!({"name": "A"}))).await.unwrap();
        store.set("users", "u1", entity(json!({"name": "A"}))).await.unwrap();
        store.set("users", "u1", entity(json!({"name": "B"}))).await.unwrap();
        store.remove("users", "u1").await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec![Some(json!("A")), Some(json!("B")), None]);
    }

    #[tokio::test]
    async fn test_set_many_notifies_table_once() {
        let store = TableStore::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let rows_seen = Arc::new(AtomicUsize::new(0));
        let (c, r) = (Arc::clone(&calls), Arc::clone(&rows_seen));
        let _sub = store.subscribe_table(
            "posts",
            Arc::new(move |rows: &[(String, Entity)]| {
                c.fetch_add(1, Ordering::SeqCst);
                r.store(rows.len(), Ordering::SeqCst);
            }),
        );

        store
            .set_many(vec![
                (EntityKey::new("posts", "p1"), entity(json!({"t": 1}))),
                (EntityKey::new("posts", "p2"), entity(json!({"t": 2}))),
                (EntityKey::new("users", "u1"), entity(json!({"t": 3}))),
            ])
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(rows_seen.load(Ordering::SeqCst), 2);

        let removed = store
            .remove_many(vec![
                EntityKey::new("posts", "p1"),
                EntityKey::new("posts", "p2"),
                EntityKey::new("posts", "nope"),
            ])
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(rows_seen.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_query_filters_by_predicate() {
        let store = TableStore::new();
        store.set("posts", "p1", entity(json!({"authorId": "u1"}))).await.unwrap();
        store.set("posts", "p2", entity(json!({"authorId": "u2"}))).await.unwrap();

        let matches = store
            .query("posts", &|e: &Entity| e.field("authorId") == Some(&json!("u1")))
            .await
            .unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].0, "p1");
        assert!(store.query("empty", &|_: &Entity| true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let store = TableStore::new();
        store.set("users", "u1", entity(json!({"name": "A"}))).await.unwrap();
        store.destroy().await;
        store.destroy().await;
        assert_eq!(store.stats().await.total_entities, 0);
    }
}
