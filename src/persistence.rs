//! Persistence collaborator: the source of truth behind the store.

use crate::error::{Error, Result};
use crate::store::Record;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Filter for [`PersistenceAdapter::load_where`]
#[derive(Debug, Clone, PartialEq)]
pub enum RecordFilter {
    /// Every record of the table
    All,
    /// Records where at least one of `fields` equals `value`
    AnyFieldEquals { fields: Vec<String>, value: Value },
}

impl RecordFilter {
    pub fn owned_by(fields: &[String], user_id: &str) -> Self {
        RecordFilter::AnyFieldEquals {
            fields: fields.to_vec(),
            value: Value::String(user_id.to_string()),
        }
    }

    pub fn matches(&self, record: &Record) -> bool {
        match self {
            RecordFilter::All => true,
            RecordFilter::AnyFieldEquals { fields, value } => {
                fields.iter().any(|f| record.get(f) == Some(value))
            }
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PersistenceAdapter: Send + Sync + std::fmt::Debug {
    async fn load(&self, table: &str, id: &str) -> Result<Option<Record>>;

    async fn load_where(&self, table: &str, filter: &RecordFilter) -> Result<Vec<(String, Record)>>;

    /// Merge `fields` into the stored record, creating it if absent
    async fn write(&self, table: &str, id: &str, fields: &Record) -> Result<()>;

    async fn delete(&self, table: &str, id: &str) -> Result<()>;
}

/// In-memory persistence backend
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    tables: Arc<RwLock<HashMap<String, BTreeMap<String, Record>>>>,
    writes: AtomicUsize,
    fail_writes: std::sync::atomic::AtomicBool,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `write` calls
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make every subsequent `write` fail with a backend error
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn insert(&self, table: &str, id: &str, record: Record) {
        self.tables
            .write()
            .await
            .entry(table.to_string())
            .or_default()
            .insert(id.to_string(), record);
    }

    pub async fn count(&self, table: &str) -> usize {
        self.tables
            .read()
            .await
            .get(table)
            .map(|rows| rows.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl PersistenceAdapter for MemoryPersistence {
    async fn load(&self, table: &str, id: &str) -> Result<Option<Record>> {
        let tables = self.tables.read().await;
        Ok(tables.get(table).and_then(|rows| rows.get(id)).cloned())
    }

    async fn load_where(&self, table: &str, filter: &RecordFilter) -> Result<Vec<(String, Record)>> {
        let tables = self.tables.read().await;
        Ok(tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|(_, r)| filter.matches(r))
                    .map(|(id, r)| (id.clone(), r.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn write(&self, table: &str, id: &str, fields: &Record) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::backend(format!("write rejected for {}/{}", table, id)));
        }
        let mut tables = self.tables.write().await;
        let record = tables
            .entry(table.to_string())
            .or_default()
            .entry(id.to_string())
            .or_default();
        for (field, value) in fields {
            record.insert(field.clone(), value.clone());
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, table: &str, id: &str) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(rows) = tables.get_mut(table) {
            rows.remove(id);
        }
        Ok(())
    }
}
