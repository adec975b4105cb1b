//! `ComplianceStore`: the single entry point for entity CRUD.
//!
//! Reads go cache first and fall through to persistence on a miss. Writes pass
//! the [`DataHooks`] (consent gate, field encryption), update the entity store
//! optimistically and are coalesced by the [`WriteQueue`] before they reach
//! persistence. Every mutation is recorded in the [`AuditLog`].

pub mod hooks;
pub mod metrics;

pub use hooks::{DataHooks, GdprHooks, WriteContext, WriteOrigin};
pub use self::metrics::QueryMetrics;

use crate::clock::{system_clock, Clock};
use crate::compliance::{
    ConsentLedger, DataExport, DeletionOptions, DeletionResult, ExportedRecord, RectificationResult,
    Corrections, RetentionManager, RightsOrchestrator, UserDataSource,
};
use crate::config::{AuditLevel, BackendKind, StoreConfig};
use crate::error::{Error, Result, StorageErrorCode};
use crate::persistence::{MemoryPersistence, PersistenceAdapter, RecordFilter};
use crate::queue::{FlushReport, QueueMetrics, WriteQueue};
use crate::security::{AuditCategory, AuditEvent, AuditLog, AuditResult, EncryptionService};
use crate::store::{
    create_store, Entity, EntityCallback, EntityStore, Record, StoreStats, Subscription,
    TableCallback,
};
use async_trait::async_trait;
use self::metrics::QueryRecorder;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Components created by [`ComplianceStore::initialize`]
#[derive(Debug)]
struct Runtime {
    store: Arc<dyn EntityStore>,
    queue: WriteQueue,
    retention: Option<Arc<RetentionManager>>,
    background: StdMutex<Vec<JoinHandle<()>>>,
}

/// Aggregated statistics of the data layer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplianceStoreStats {
    pub store: StoreStats,
    pub queue: QueueMetrics,
    pub queries: QueryMetrics,
}

/// One failed item of a batch operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchFailure {
    pub table: String,
    pub id: String,
    pub error: String,
}

/// Outcome of [`ComplianceStore::batch_update`] / [`ComplianceStore::batch_remove`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchReport {
    pub succeeded: usize,
    pub failures: Vec<BatchFailure>,
}

impl BatchReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Builder for [`ComplianceStore`]
pub struct ComplianceStoreBuilder {
    config: StoreConfig,
    persistence: Option<Arc<dyn PersistenceAdapter>>,
    custom_store: Option<Arc<dyn EntityStore>>,
    hooks: Option<Arc<dyn DataHooks>>,
    master_key: Option<SecretString>,
    clock: Arc<dyn Clock>,
}

impl ComplianceStoreBuilder {
    pub fn persistence(mut self, persistence: Arc<dyn PersistenceAdapter>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Store used when `backend = "custom"`
    pub fn custom_store(mut self, store: Arc<dyn EntityStore>) -> Self {
        self.custom_store = Some(store);
        self
    }

    /// Replace the default [`GdprHooks`]
    pub fn hooks(mut self, hooks: Arc<dyn DataHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Master key for field encryption; without it the key is read from
    /// `gdpr.encryption.master_key_env`.
    pub fn master_key(mut self, key: SecretString) -> Self {
        self.master_key = Some(key);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Result<ComplianceStore> {
        self.config.validate()?;
        let gdpr = &self.config.gdpr;

        let consent = Arc::new(ConsentLedger::with_clock(&gdpr.consent, self.clock.clone())?);
        let audit = Arc::new(AuditLog::with_clock(gdpr.audit.clone(), self.clock.clone()));
        let encryption = Arc::new(match (gdpr.encryption.enabled, self.master_key) {
            (false, _) => EncryptionService::disabled(),
            (true, Some(key)) => EncryptionService::with_master_key(gdpr.encryption.clone(), key)?,
            (true, None) => EncryptionService::new(gdpr.encryption.clone())?,
        });
        let hooks = self.hooks.unwrap_or_else(|| {
            Arc::new(GdprHooks::new(
                &self.config,
                consent.clone(),
                encryption.clone(),
                audit.clone(),
            ))
        });
        let persistence = self.persistence.unwrap_or_else(|| {
            debug!("no persistence adapter supplied, using in-memory persistence");
            Arc::new(MemoryPersistence::new())
        });

        Ok(ComplianceStore {
            config: self.config,
            persistence,
            custom_store: self.custom_store,
            hooks,
            consent,
            audit,
            encryption,
            clock: self.clock,
            runtime: OnceCell::new(),
            init_lock: Mutex::new(()),
            queries: StdMutex::new(QueryRecorder::default()),
        })
    }
}

/// GDPR-aware data layer facade
pub struct ComplianceStore {
    config: StoreConfig,
    persistence: Arc<dyn PersistenceAdapter>,
    custom_store: Option<Arc<dyn EntityStore>>,
    hooks: Arc<dyn DataHooks>,
    consent: Arc<ConsentLedger>,
    audit: Arc<AuditLog>,
    encryption: Arc<EncryptionService>,
    clock: Arc<dyn Clock>,
    runtime: OnceCell<Runtime>,
    init_lock: Mutex<()>,
    queries: StdMutex<QueryRecorder>,
}

impl std::fmt::Debug for ComplianceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComplianceStore")
            .field("backend", &self.config.backend)
            .field("initialized", &self.runtime.initialized())
            .finish()
    }
}

impl ComplianceStore {
    pub fn builder(config: StoreConfig) -> ComplianceStoreBuilder {
        ComplianceStoreBuilder {
            config,
            persistence: None,
            custom_store: None,
            hooks: None,
            master_key: None,
            clock: system_clock(),
        }
    }

    /// Build with the given persistence and default hooks
    pub fn new(config: StoreConfig, persistence: Arc<dyn PersistenceAdapter>) -> Result<Self> {
        Self::builder(config).persistence(persistence).build()
    }

    /// Create the entity store and write queue and start background tasks.
    /// Calling it again only logs a warning.
    pub async fn initialize(&self) -> Result<()> {
        let _guard = self.init_lock.lock().await;
        if self.runtime.initialized() {
            warn!("compliance store already initialized, ignoring");
            return Ok(());
        }

        if self.config.backend == BackendKind::None {
            info!("no reactive backend configured, falling back to the simple cache");
        }
        let store = create_store(&self.config, self.custom_store.clone(), self.clock.clone())?;
        let queue = WriteQueue::new(
            self.config.update_queue.clone(),
            store.clone(),
            self.persistence.clone(),
        );

        let retention = if self.config.gdpr.retention.tables.is_empty() {
            None
        } else {
            Some(Arc::new(RetentionManager::with_clock(
                self.config.gdpr.retention.clone(),
                store.clone(),
                self.persistence.clone(),
                queue.clone(),
                self.audit.clone(),
                self.clock.clone(),
            )?))
        };

        let mut background = vec![self.audit.start_retention_sweep()];
        if let Some(ref manager) = retention {
            background.extend(manager.start());
        }

        let runtime = Runtime {
            store,
            queue,
            retention,
            background: StdMutex::new(background),
        };
        if self.runtime.set(runtime).is_err() {
            return Err(Error::Config("compliance store initialized concurrently".to_string()));
        }

        self.audit
            .log_event(
                AuditEvent::new(AuditCategory::System, "system", "system.initialize", "store")
                    .with_details(json!({ "backend": self.config.backend })),
            )
            .await;
        info!(backend = ?self.config.backend, "compliance store initialized");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.runtime.initialized()
    }

    fn runtime(&self) -> Result<&Runtime> {
        self.runtime.get().ok_or(Error::NotInitialized)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn consent(&self) -> &Arc<ConsentLedger> {
        &self.consent
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn encryption(&self) -> &Arc<EncryptionService> {
        &self.encryption
    }

    /// Retention manager, present when `gdpr.retention.tables` is configured
    pub fn retention(&self) -> Result<Option<Arc<RetentionManager>>> {
        Ok(self.runtime()?.retention.clone())
    }

    /// Acting user for audit entries: the record's owner, or `system`
    fn actor(&self, record: Option<&Record>) -> String {
        record
            .and_then(|r| {
                self.config
                    .gdpr
                    .rights
                    .owner_fields
                    .iter()
                    .find_map(|f| r.get(f).and_then(Value::as_str))
            })
            .unwrap_or("system")
            .to_string()
    }

    fn record_query(&self, hit: bool, started: Instant) {
        if let Ok(mut recorder) = self.queries.lock() {
            recorder.record(hit, started.elapsed().as_secs_f64() * 1000.0);
        }
    }

    /// At-rest form of an entity: cache first, then persistence (populating the cache)
    async fn load_entity(&self, runtime: &Runtime, table: &str, id: &str) -> Result<(Option<Entity>, bool)> {
        if self.config.cache.enabled {
            if let Some(entity) = runtime.store.get(table, id).await? {
                return Ok((Some(entity), true));
            }
        }
        if !self.config.backend_options.persistence {
            return Ok((None, false));
        }

        match self.persistence.load(table, id).await? {
            Some(record) => {
                let entity = Entity::new(record);
                if self.config.cache.enabled {
                    runtime.store.set(table, id, entity.clone()).await?;
                }
                Ok((Some(entity), false))
            }
            None => Ok((None, false)),
        }
    }

    /// Entity with decrypted data and its queue/failure metadata
    pub async fn get_entity(&self, table: &str, id: &str) -> Result<Option<Entity>> {
        let runtime = self.runtime()?;
        let started = Instant::now();

        let (entity, hit) = self.load_entity(runtime, table, id).await?;
        self.record_query(hit, started);

        let Some(mut entity) = entity else {
            return Ok(None);
        };
        entity.data = self.hooks.after_read(table, id, entity.data).await?;

        if self.audit.level() == AuditLevel::Detailed {
            self.audit
                .log_data_access(
                    &self.actor(Some(&entity.data)),
                    table,
                    id,
                    json!({ "cacheHit": hit }),
                )
                .await;
        }
        Ok(Some(entity))
    }

    /// Decrypted record
    pub async fn get(&self, table: &str, id: &str) -> Result<Option<Record>> {
        Ok(self.get_entity(table, id).await?.map(|e| e.data))
    }

    /// Hook, store update and queueing without the audit entry
    async fn write(&self, table: &str, id: &str, record: Record, origin: WriteOrigin) -> Result<Vec<String>> {
        let runtime = self.runtime()?;
        if table.is_empty() || id.is_empty() {
            return Err(Error::Validation("table and id must not be empty".to_string()));
        }

        // The cache must hold the full record before the queue merges a partial write into it
        let (existing, _) = self.load_entity(runtime, table, id).await?;
        let ctx = WriteContext {
            table,
            id,
            existing: existing.as_ref().map(|e| &e.data),
            origin,
        };

        let fields: Vec<String> = record.keys().cloned().collect();
        let prepared = match self.hooks.before_write(&ctx, record).await {
            Ok(prepared) => prepared,
            Err(e) => {
                self.audit
                    .log_event(
                        AuditEvent::new(
                            AuditCategory::DataModification,
                            self.actor(ctx.existing),
                            "data.update.rejected",
                            table,
                        )
                        .with_resource_id(id)
                        .with_result(AuditResult::Failure)
                        .with_details(json!({ "error": e.to_string(), "code": e.code() })),
                    )
                    .await;
                return Err(e);
            }
        };

        runtime.queue.queue_update(table, id, prepared).await?;
        Ok(fields)
    }

    /// Write `record` (merged field-wise into any existing value)
    pub async fn set(&self, table: &str, id: &str, record: Record) -> Result<()> {
        let actor = self.actor(Some(&record));
        let fields = self.write(table, id, record, WriteOrigin::Application).await?;
        self.audit
            .log_data_modification(&actor, "data.update", table, Some(id), json!({ "fields": fields }))
            .await;
        Ok(())
    }

    async fn delete(&self, table: &str, id: &str) -> Result<Option<Entity>> {
        let runtime = self.runtime()?;
        let (existing, _) = self.load_entity(runtime, table, id).await?;
        if existing.is_none() {
            return Err(Error::not_found(table, id));
        }
        runtime.queue.queue_deletion(table, id).await?;
        Ok(existing)
    }

    /// Delete an entity from the store and persistence.
    /// Fails with `ENTITY_NOT_FOUND` when neither holds it.
    pub async fn remove(&self, table: &str, id: &str) -> Result<()> {
        let removed = self.delete(table, id).await?;
        let actor = self.actor(removed.as_ref().map(|e| &e.data));
        self.audit
            .log_data_modification(&actor, "data.delete", table, Some(id), json!({}))
            .await;
        Ok(())
    }

    /// Apply several writes; failures are collected, one audit entry summarizes the batch
    pub async fn batch_update(&self, updates: Vec<(String, String, Record)>) -> Result<BatchReport> {
        self.runtime()?;
        let mut report = BatchReport::default();
        let mut tables: BTreeMap<String, usize> = BTreeMap::new();

        for (table, id, record) in updates {
            match self.write(&table, &id, record, WriteOrigin::Application).await {
                Ok(_) => {
                    report.succeeded += 1;
                    *tables.entry(table).or_default() += 1;
                }
                Err(e) => report.failures.push(BatchFailure {
                    table,
                    id,
                    error: e.to_string(),
                }),
            }
        }

        self.log_batch("data.batch_update", &report, tables).await;
        Ok(report)
    }

    pub async fn batch_remove(&self, keys: Vec<(String, String)>) -> Result<BatchReport> {
        self.runtime()?;
        let mut report = BatchReport::default();
        let mut tables: BTreeMap<String, usize> = BTreeMap::new();

        for (table, id) in keys {
            match self.delete(&table, &id).await {
                Ok(_) => {
                    report.succeeded += 1;
                    *tables.entry(table).or_default() += 1;
                }
                Err(e) => report.failures.push(BatchFailure {
                    table,
                    id,
                    error: e.to_string(),
                }),
            }
        }

        self.log_batch("data.batch_delete", &report, tables).await;
        Ok(report)
    }

    async fn log_batch(&self, action: &str, report: &BatchReport, tables: BTreeMap<String, usize>) {
        let result = if report.is_clean() {
            AuditResult::Success
        } else {
            AuditResult::Failure
        };
        self.audit
            .log_event(
                AuditEvent::new(AuditCategory::DataModification, "system", action, "batch")
                    .with_result(result)
                    .with_details(json!({
                        "succeeded": report.succeeded,
                        "failed": report.failures.len(),
                        "tables": tables,
                    })),
            )
            .await;
    }

    /// Primary record (id = user id) and owner-matched records of one table, decrypted.
    ///
    /// Persistence rows are overlaid with the cached value so unflushed
    /// changes are taken into account.
    pub async fn find_user_records(
        &self,
        table: &str,
        user_id: &str,
        owner_fields: &[String],
    ) -> Result<Vec<(String, Record)>> {
        let runtime = self.runtime()?;
        let mut rows: BTreeMap<String, Record> = BTreeMap::new();

        if self.config.backend_options.persistence {
            for (id, record) in self
                .persistence
                .load_where(table, &RecordFilter::owned_by(owner_fields, user_id))
                .await?
            {
                rows.insert(id, record);
            }
            if let Some(record) = self.persistence.load(table, user_id).await? {
                rows.insert(user_id.to_string(), record);
            }
        }

        let filter = RecordFilter::owned_by(owner_fields, user_id);
        for (id, entity) in runtime.store.query(table, &|_: &Entity| true).await? {
            if rows.contains_key(&id) || id == user_id || filter.matches(&entity.data) {
                rows.entry(id).or_default().extend(entity.data);
            }
        }

        let mut matched = Vec::new();
        for (id, record) in rows {
            if id == user_id || filter.matches(&record) {
                let record = self.hooks.after_read(table, &id, record).await?;
                matched.push((id, record));
            }
        }
        Ok(matched)
    }

    /// Plain table scan of a user's records across `tables`
    pub async fn export_user_data(
        &self,
        user_id: &str,
        tables: &[String],
    ) -> Result<HashMap<String, Vec<ExportedRecord>>> {
        let owner_fields = &self.config.gdpr.rights.owner_fields;
        let mut export = HashMap::new();
        for table in tables {
            let records = self.find_user_records(table, user_id, owner_fields).await?;
            export.insert(
                table.clone(),
                records
                    .into_iter()
                    .map(|(id, data)| ExportedRecord { id, data })
                    .collect(),
            );
        }
        Ok(export)
    }

    /// Delete a user's primary and owner-matched records across `tables`
    pub async fn delete_user_data(&self, user_id: &str, tables: &[String]) -> Result<usize> {
        let owner_fields = &self.config.gdpr.rights.owner_fields;
        let mut deleted = 0;
        for table in tables {
            for (id, _) in self.find_user_records(table, user_id, owner_fields).await? {
                self.delete(table, &id).await?;
                deleted += 1;
            }
        }
        self.audit
            .log_data_modification(
                user_id,
                "data.delete.user",
                "user_data",
                None,
                json!({ "tables": tables, "recordsDeleted": deleted }),
            )
            .await;
        Ok(deleted)
    }

    /// Data-subject-rights orchestrator bound to this store
    pub fn rights_orchestrator(self: &Arc<Self>) -> Result<RightsOrchestrator> {
        self.runtime()?;
        RightsOrchestrator::with_clock(
            self.config.gdpr.rights.clone(),
            Arc::clone(self) as Arc<dyn UserDataSource>,
            self.consent.clone(),
            self.audit.clone(),
            self.clock.clone(),
        )
    }

    /// Art. 15 export including consent history and audit trail
    pub async fn handle_access_request(self: &Arc<Self>, user_id: &str) -> Result<DataExport> {
        self.rights_orchestrator()?.export_user_data(user_id).await
    }

    /// Art. 17 erasure or anonymization with a deletion certificate
    pub async fn handle_erasure_request(
        self: &Arc<Self>,
        user_id: &str,
        options: DeletionOptions,
    ) -> Result<DeletionResult> {
        self.rights_orchestrator()?.delete_user_data(user_id, options).await
    }

    /// Art. 16 rectification
    pub async fn handle_rectification_request(
        self: &Arc<Self>,
        user_id: &str,
        corrections: Corrections,
    ) -> Result<RectificationResult> {
        self.rights_orchestrator()?
            .rectify_user_data(user_id, corrections)
            .await
    }

    /// Subscribe to one entity. Callbacks receive the stored (at-rest) value.
    pub fn subscribe(&self, table: &str, id: &str, callback: EntityCallback) -> Result<Subscription> {
        Ok(self.runtime()?.store.subscribe_entity(table, id, callback))
    }

    pub fn subscribe_to_table(&self, table: &str, callback: TableCallback) -> Result<Subscription> {
        Ok(self.runtime()?.store.subscribe_table(table, callback))
    }

    pub async fn stats(&self) -> Result<ComplianceStoreStats> {
        let runtime = self.runtime()?;
        let queries = match self.queries.lock() {
            Ok(recorder) => recorder.snapshot(),
            Err(_) => QueryMetrics::default(),
        };
        Ok(ComplianceStoreStats {
            store: runtime.store.stats().await,
            queue: runtime.queue.metrics().await,
            queries,
        })
    }

    /// Flush every pending write now
    pub async fn flush(&self) -> Result<FlushReport> {
        Ok(self.runtime()?.queue.flush_all().await)
    }

    /// Flush pending writes, stop background tasks and release the store.
    /// Idempotent; a store that was never initialized only stops the audit log.
    pub async fn destroy(&self) {
        if let Some(runtime) = self.runtime.get() {
            let report = runtime.queue.flush_all().await;
            if !report.is_clean() {
                warn!(failed = report.failures.len(), "pending writes failed during shutdown");
            }
            runtime.queue.destroy().await;
            if let Some(ref retention) = runtime.retention {
                retention.stop();
            }
            let handles: Vec<JoinHandle<()>> = match runtime.background.lock() {
                Ok(mut handles) => handles.drain(..).collect(),
                Err(_) => Vec::new(),
            };
            self.audit.destroy();
            self.encryption.clear_key_cache().await;
            for handle in handles {
                if let Err(e) = handle.await {
                    warn!(error = %e, "background task ended abnormally");
                }
            }
            runtime.store.destroy().await;
        } else {
            self.audit.destroy();
            self.encryption.clear_key_cache().await;
        }
        info!("compliance store destroyed");
    }
}

#[async_trait]
impl UserDataSource for ComplianceStore {
    async fn find_user_records(
        &self,
        table: &str,
        user_id: &str,
        owner_fields: &[String],
    ) -> Result<Vec<(String, Record)>> {
        ComplianceStore::find_user_records(self, table, user_id, owner_fields).await
    }

    async fn fetch_record(&self, table: &str, id: &str) -> Result<Option<Record>> {
        self.get(table, id).await
    }

    async fn write_record(&self, table: &str, id: &str, fields: Record) -> Result<()> {
        self.write(table, id, fields, WriteOrigin::DataSubjectRights)
            .await
            .map(|_| ())
    }

    async fn delete_record(&self, table: &str, id: &str) -> Result<()> {
        match self.delete(table, id).await {
            Ok(_) => Ok(()),
            Err(Error::Storage {
                code: StorageErrorCode::EntityNotFound,
                ..
            }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compliance::ConsentOptions;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap_or_default()
    }

    fn config(backend: BackendKind) -> StoreConfig {
        let mut config = StoreConfig::default();
        config.backend = backend;
        config.update_queue.batch_window_ms = 50;
        config.update_queue.retry_delay_ms = 10;
        config
    }

    async fn store_with(config: StoreConfig) -> (ComplianceStore, Arc<MemoryPersistence>) {
        let persistence = Arc::new(MemoryPersistence::new());
        let store = ComplianceStore::new(config, persistence.clone()).unwrap();
        store.initialize().await.unwrap();
        (store, persistence)
    }

    #[tokio::test]
    async fn test_operations_require_initialize() {
        let store =
            ComplianceStore::new(StoreConfig::default(), Arc::new(MemoryPersistence::new())).unwrap();
        assert!(!store.is_initialized());
        assert_eq!(store.get("users", "u1").await.unwrap_err().code(), "NOT_INITIALIZED");
        assert_eq!(
            store.set("users", "u1", Record::new()).await.unwrap_err().code(),
            "NOT_INITIALIZED"
        );
        assert!(store.stats().await.is_err());
        store.destroy().await;
    }

    #[tokio::test]
    async fn test_repeated_initialize_is_noop() {
        let (store, _) = store_with(config(BackendKind::Table)).await;
        store.initialize().await.unwrap();
        assert!(store.is_initialized());
        store.destroy().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_get_roundtrip_through_queue() {
        let (store, persistence) = store_with(config(BackendKind::Table)).await;

        store
            .set("users", "u1", record(json!({"name": "A"})))
            .await
            .unwrap();
        store
            .set("users", "u1", record(json!({"age": 30})))
            .await
            .unwrap();

        let entity = store.get_entity("users", "u1").await.unwrap().unwrap();
        assert!(entity.meta.queued);
        assert_eq!(entity.data, record(json!({"name": "A", "age": 30})));

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(persistence.write_count(), 1);
        assert_eq!(
            persistence.load("users", "u1").await.unwrap(),
            Some(record(json!({"name": "A", "age": 30})))
        );
        assert!(!store.get_entity("users", "u1").await.unwrap().unwrap().meta.queued);
        store.destroy().await;
    }

    #[tokio::test]
    async fn test_read_through_populates_cache() {
        let (store, persistence) = store_with(config(BackendKind::Simple)).await;
        persistence
            .insert("users", "u7", record(json!({"name": "Grace"})))
            .await;

        assert_eq!(
            store.get("users", "u7").await.unwrap(),
            Some(record(json!({"name": "Grace"})))
        );
        assert!(store.get("users", "u7").await.unwrap().is_some());
        assert!(store.get("users", "missing").await.unwrap().is_none());

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.queries.total_queries, 3);
        assert_eq!(stats.queries.cache_hits, 1);
        assert_eq!(stats.queries.cache_misses, 2);
        assert!(stats.queries.p99_ms <= stats.queries.max_ms);
        assert_eq!(stats.store.total_entities, 1);
        store.destroy().await;
    }

    #[tokio::test]
    async fn test_partial_write_keeps_persisted_fields() {
        let (store, persistence) = store_with(config(BackendKind::Observable)).await;
        persistence
            .insert("users", "u1", record(json!({"name": "A", "email": "a@example.com"})))
            .await;

        store
            .set("users", "u1", record(json!({"name": "B"})))
            .await
            .unwrap();
        assert_eq!(
            store.get("users", "u1").await.unwrap(),
            Some(record(json!({"name": "B", "email": "a@example.com"})))
        );
        store.destroy().await;
    }

    #[tokio::test]
    async fn test_consent_gated_table() {
        let mut config = config(BackendKind::Table);
        config
            .gdpr
            .consent
            .table_purposes
            .insert("events".to_string(), "analytics".to_string());
        let (store, _) = store_with(config).await;

        let err = store
            .set("events", "e1", record(json!({"userId": "u1", "page": "/"})))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CONSENT_ERROR");
        assert!(store.get("events", "e1").await.unwrap().is_none());

        let rejected = store
            .audit()
            .query_logs(&crate::security::AuditQuery {
                action: Some("data.update.rejected".to_string()),
                ..Default::default()
            })
            .await;
        assert_eq!(rejected.len(), 1);

        store
            .consent()
            .record_consent("u1", "analytics", true, ConsentOptions::default())
            .await
            .unwrap();
        store
            .set("events", "e1", record(json!({"userId": "u1", "page": "/"})))
            .await
            .unwrap();
        store.destroy().await;
    }

    #[tokio::test]
    async fn test_remove_missing_entity() {
        let (store, _) = store_with(config(BackendKind::Table)).await;
        let err = store.remove("users", "ghost").await.unwrap_err();
        assert_eq!(err.code(), "ENTITY_NOT_FOUND");
        store.destroy().await;
    }

    #[tokio::test]
    async fn test_batch_operations_audit_once() {
        let (store, persistence) = store_with(config(BackendKind::Table)).await;
        persistence.insert("users", "u1", record(json!({"name": "A"}))).await;

        let report = store
            .batch_update(vec![
                ("users".to_string(), "u2".to_string(), record(json!({"name": "B"}))),
                ("users".to_string(), "".to_string(), record(json!({"name": "C"}))),
            ])
            .await
            .unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failures.len(), 1);

        let removed = store
            .batch_remove(vec![
                ("users".to_string(), "u1".to_string()),
                ("users".to_string(), "nope".to_string()),
            ])
            .await
            .unwrap();
        assert_eq!(removed.succeeded, 1);
        assert!(persistence.load("users", "u1").await.unwrap().is_none());

        let stats = store.audit().get_statistics().await;
        // system.initialize + two batch summaries
        assert_eq!(stats.total_entries, 3);
        assert_eq!(stats.failures, 2);
        store.destroy().await;
    }

    #[tokio::test]
    async fn test_user_data_helpers() {
        let (store, persistence) = store_with(config(BackendKind::Table)).await;
        persistence.insert("users", "u1", record(json!({"name": "A"}))).await;
        persistence
            .insert("posts", "p1", record(json!({"authorId": "u1", "title": "t"})))
            .await;
        store
            .set("posts", "p2", record(json!({"authorId": "u1", "title": "queued"})))
            .await
            .unwrap();
        store
            .set("posts", "p3", record(json!({"authorId": "u2"})))
            .await
            .unwrap();

        let tables = vec!["users".to_string(), "posts".to_string()];
        let export = store.export_user_data("u1", &tables).await.unwrap();
        assert_eq!(export["users"].len(), 1);
        let posts: Vec<&str> = export["posts"].iter().map(|r| r.id.as_str()).collect();
        assert_eq!(posts, vec!["p1", "p2"]);

        assert_eq!(store.delete_user_data("u1", &tables).await.unwrap(), 3);
        assert!(store.get("posts", "p1").await.unwrap().is_none());
        assert!(store.get("posts", "p3").await.unwrap().is_some());
        store.destroy().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_table_subscription_through_facade() {
        let (store, _) = store_with(config(BackendKind::Table)).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let subscription = store
            .subscribe_to_table(
                "users",
                Arc::new(move |_: &[(String, Entity)]| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        store.set("users", "u1", record(json!({"n": 1}))).await.unwrap();
        assert!(calls.load(Ordering::SeqCst) >= 1);

        subscription.unsubscribe();
        let before = calls.load(Ordering::SeqCst);
        store.set("users", "u2", record(json!({"n": 2}))).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), before);
        store.destroy().await;
    }

    #[tokio::test]
    async fn test_custom_backend_requires_store() {
        let store = ComplianceStore::new(
            config(BackendKind::Custom),
            Arc::new(MemoryPersistence::new()),
        )
        .unwrap();
        assert_eq!(store.initialize().await.unwrap_err().code(), "CONFIG_ERROR");
        assert!(!store.is_initialized());
    }

    #[tokio::test]
    async fn test_destroy_drops_derived_keys() {
        let mut config = config(BackendKind::Table);
        config.gdpr.encryption.enabled = true;
        config.gdpr.encryption.key_derivation_iterations = 1_000;
        config
            .gdpr
            .encryption
            .encrypted_fields
            .insert("users".to_string(), vec!["email".to_string()]);
        let store = ComplianceStore::builder(config)
            .master_key(secrecy::SecretString::from("facade-test-master-key".to_string()))
            .build()
            .unwrap();
        store.initialize().await.unwrap();

        store
            .set("users", "u1", record(json!({"email": "a@example.com"})))
            .await
            .unwrap();
        assert_eq!(store.encryption().cached_key_count().await, 1);

        store.destroy().await;
        assert_eq!(store.encryption().cached_key_count().await, 0);
    }
}
