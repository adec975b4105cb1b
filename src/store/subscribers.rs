//! Subscriber registry shared by the reactive stores.

use super::{Entity, EntityKey};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Entity change callback; `None` when the entity was removed
pub type EntityCallback = Arc<dyn Fn(Option<&Entity>) + Send + Sync>;

/// Table change callback receiving the current `(id, entity)` rows
pub type TableCallback = Arc<dyn Fn(&[(String, Entity)]) + Send + Sync>;

/// Unsubscribe handle. Dropping it unsubscribes.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

// Locks are held only to copy callbacks out; callbacks run unlocked.
#[derive(Default)]
pub struct SubscriberRegistry {
    next_id: AtomicU64,
    entity: Mutex<HashMap<EntityKey, HashMap<u64, EntityCallback>>>,
    table: Mutex<HashMap<String, HashMap<u64, TableCallback>>>,
}

impl fmt::Debug for SubscriberRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberRegistry")
            .field("entity_keys", &self.entity.lock().map(|m| m.len()).unwrap_or(0))
            .field("tables", &self.table.lock().map(|m| m.len()).unwrap_or(0))
            .finish()
    }
}

impl SubscriberRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_entity(self: &Arc<Self>, key: EntityKey, callback: EntityCallback) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut entity) = self.entity.lock() {
            entity.entry(key.clone()).or_default().insert(id, callback);
        }

        let registry: Weak<Self> = Arc::downgrade(self);
        Subscription::new(move || {
            if let Some(registry) = registry.upgrade() {
                if let Ok(mut entity) = registry.entity.lock() {
                    if let Some(callbacks) = entity.get_mut(&key) {
                        callbacks.remove(&id);
                        if callbacks.is_empty() {
                            entity.remove(&key);
                        }
                    }
                }
            }
        })
    }

    pub fn add_table(self: &Arc<Self>, table: &str, callback: TableCallback) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let table = table.to_string();
        if let Ok(mut tables) = self.table.lock() {
            tables.entry(table.clone()).or_default().insert(id, callback);
        }

        let registry: Weak<Self> = Arc::downgrade(self);
        Subscription::new(move || {
            if let Some(registry) = registry.upgrade() {
                if let Ok(mut tables) = registry.table.lock() {
                    if let Some(callbacks) = tables.get_mut(&table) {
                        callbacks.remove(&id);
                        if callbacks.is_empty() {
                            tables.remove(&table);
                        }
                    }
                }
            }
        })
    }

    pub fn has_table_subscribers(&self, table: &str) -> bool {
        self.table
            .lock()
            .map(|t| t.contains_key(table))
            .unwrap_or(false)
    }

    pub fn notify_entity(&self, key: &EntityKey, entity: Option<&Entity>) {
        let callbacks: Vec<EntityCallback> = match self.entity.lock() {
            Ok(map) => map
                .get(key)
                .map(|c| c.values().cloned().collect())
                .unwrap_or_default(),
            Err(_) => return,
        };
        for callback in callbacks {
            callback(entity);
        }
    }

    pub fn notify_table(&self, table: &str, rows: &[(String, Entity)]) {
        let callbacks: Vec<TableCallback> = match self.table.lock() {
            Ok(map) => map
                .get(table)
                .map(|c| c.values().cloned().collect())
                .unwrap_or_default(),
            Err(_) => return,
        };
        for callback in callbacks {
            callback(rows);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut entity) = self.entity.lock() {
            entity.clear();
        }
        if let Ok(mut table) = self.table.lock() {
            table.clear();
        }
    }
}
