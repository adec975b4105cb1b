//! Entity stores: reactive backends and the polling Simple Cache.
//!
//! Every backend implements [`EntityStore`]. Reactive backends notify
//! subscribers synchronously inside the mutating call; the Simple Cache
//! polls on a fixed interval instead.

pub mod observable_store;
pub mod simple_cache;
pub mod subscribers;
pub mod table_store;

pub use observable_store::ObservableStore;
pub use simple_cache::SimpleCache;
pub use subscribers::{EntityCallback, Subscription, TableCallback};
pub use table_store::TableStore;

use crate::clock::Clock;
use crate::config::{BackendKind, StoreConfig};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Open attribute map of an entity
pub type Record = serde_json::Map<String, Value>;

/// Predicate used by [`EntityStore::query`]
pub type EntityPredicate<'a> = &'a (dyn Fn(&Entity) -> bool + Send + Sync);

/// (table, id) key of an entity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub table: String,
    pub id: String,
}

impl EntityKey {
    pub fn new(table: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.table, self.id)
    }
}

/// System metadata carried next to the attribute map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityMeta {
    pub last_updated: DateTime<Utc>,
    /// A write for this entity is waiting in the queue
    #[serde(default)]
    pub queued: bool,
    /// Persistence failed after all retries
    #[serde(default)]
    pub failed: bool,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Default for EntityMeta {
    fn default() -> Self {
        Self {
            last_updated: Utc::now(),
            queued: false,
            failed: false,
            last_error: None,
        }
    }
}

/// A single keyed record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub data: Record,
    #[serde(default)]
    pub meta: EntityMeta,
}

impl Entity {
    pub fn new(data: Record) -> Self {
        Self {
            data,
            meta: EntityMeta::default(),
        }
    }

    /// Field lookup on the attribute map
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }

    /// Deep equality ignoring `last_updated`
    pub fn same_content(&self, other: &Entity) -> bool {
        self.data == other.data
            && self.meta.queued == other.meta.queued
            && self.meta.failed == other.meta.failed
            && self.meta.last_error == other.meta.last_error
    }

    /// Approximate in-memory size (serialized length)
    pub fn approx_size(&self) -> usize {
        serde_json::to_vec(&self.data).map(|v| v.len()).unwrap_or(0)
    }
}

impl From<Record> for Entity {
    fn from(data: Record) -> Self {
        Entity::new(data)
    }
}

/// Store statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_entities: usize,
    pub per_table: HashMap<String, usize>,
    pub hits: u64,
    pub total_accesses: u64,
    /// `hits / total_accesses`, both counted on `get` only
    pub hit_ratio: f64,
    /// Approximate bytes held
    pub memory_bytes: usize,
}

impl StoreStats {
    pub(crate) fn finish(mut self, hits: u64, total_accesses: u64) -> Self {
        self.hits = hits;
        self.total_accesses = total_accesses;
        self.hit_ratio = if total_accesses == 0 {
            0.0
        } else {
            hits as f64 / total_accesses as f64
        };
        self
    }
}

/// Contract shared by every store backend
#[async_trait]
pub trait EntityStore: Send + Sync + fmt::Debug {
    /// Backend name for logging
    fn name(&self) -> &'static str;

    async fn get(&self, table: &str, id: &str) -> Result<Option<Entity>>;

    async fn set(&self, table: &str, id: &str, entity: Entity) -> Result<()>;

    /// Returns the removed entity, if any
    async fn remove(&self, table: &str, id: &str) -> Result<Option<Entity>>;

    /// One logical batch: table subscribers are notified once per affected table
    async fn set_many(&self, entries: Vec<(EntityKey, Entity)>) -> Result<()>;

    async fn remove_many(&self, keys: Vec<EntityKey>) -> Result<usize>;

    /// Unordered, no implicit limit
    async fn query(&self, table: &str, predicate: EntityPredicate<'_>)
        -> Result<Vec<(String, Entity)>>;

    fn subscribe_entity(&self, table: &str, id: &str, callback: EntityCallback) -> Subscription;

    fn subscribe_table(&self, table: &str, callback: TableCallback) -> Subscription;

    async fn stats(&self) -> StoreStats;

    /// Releases subscriptions and clears state; idempotent
    async fn destroy(&self);
}

/// Build the store selected by `config.backend`
pub fn create_store(
    config: &StoreConfig,
    custom: Option<Arc<dyn EntityStore>>,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn EntityStore>> {
    let store: Arc<dyn EntityStore> = match config.backend {
        BackendKind::Table => Arc::new(TableStore::with_clock(clock)),
        BackendKind::Observable => Arc::new(ObservableStore::with_clock(clock)),
        BackendKind::Custom => custom.ok_or_else(|| {
            Error::Config("backend \"custom\" requires a store implementation".to_string())
        })?,
        BackendKind::None | BackendKind::Simple => Arc::new(SimpleCache::with_clock(
            config.simple_cache_capacity(),
            Duration::from_millis(config.simple_cache_ttl_ms()),
            config.cache.strategy,
            clock,
        )),
    };

    info!(backend = store.name(), "entity store created");
    Ok(store)
}
