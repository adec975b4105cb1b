//! Debounced, per-key write-behind queue.
//!
//! Writes to one key inside a batch window are merged field-by-field and
//! reach persistence as a single call. Flushes of the same key are
//! serialized through a per-key lock; different keys flush independently.
//! A timer-driven flush that is still writing or waiting out a retry is
//! tracked as in flight, so `flush_all` awaits it and `destroy` aborts it.

use super::metrics::{MetricsRecorder, QueueMetrics};
use crate::config::UpdateQueueConfig;
use crate::error::{Error, Result};
use crate::persistence::PersistenceAdapter;
use crate::store::{Entity, EntityKey, EntityStore, Record};
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug)]
struct PendingEntry {
    fields: Record,
    update_count: usize,
    enqueued_at: Instant,
    generation: u64,
    timer: Option<FlushTask>,
}

type FlushTask = JoinHandle<Result<bool>>;

impl PendingEntry {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Failed key in a [`FlushReport`]
#[derive(Debug, Clone, Serialize)]
pub struct FlushFailure {
    pub key: EntityKey,
    pub error: String,
}

/// Outcome of [`WriteQueue::flush_all`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct FlushReport {
    pub flushed: usize,
    pub failures: Vec<FlushFailure>,
}

impl FlushReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug)]
struct QueueInner {
    config: UpdateQueueConfig,
    store: Arc<dyn EntityStore>,
    persistence: Arc<dyn PersistenceAdapter>,
    pending: Mutex<HashMap<EntityKey, PendingEntry>>,
    key_locks: StdMutex<HashMap<EntityKey, Arc<Mutex<()>>>>,
    /// Timer tasks that took their entry out of `pending`
    in_flight: StdMutex<HashMap<EntityKey, FlushTask>>,
    metrics: StdMutex<MetricsRecorder>,
    generation: AtomicU64,
    closed: AtomicBool,
}

#[derive(Debug, Clone)]
pub struct WriteQueue {
    inner: Arc<QueueInner>,
}

impl WriteQueue {
    pub fn new(
        config: UpdateQueueConfig,
        store: Arc<dyn EntityStore>,
        persistence: Arc<dyn PersistenceAdapter>,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                config,
                store,
                persistence,
                pending: Mutex::new(HashMap::new()),
                key_locks: StdMutex::new(HashMap::new()),
                in_flight: StdMutex::new(HashMap::new()),
                metrics: StdMutex::new(MetricsRecorder::default()),
                generation: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Merge `fields` into the pending change set for `(table, id)` and
    /// restart its batch window. The store is updated immediately.
    pub async fn queue_update(&self, table: &str, id: &str, fields: Record) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Queue("write queue has been destroyed".to_string()));
        }
        if table.is_empty() || id.is_empty() {
            return Err(Error::Validation("table and id must not be empty".to_string()));
        }

        let key = EntityKey::new(table, id);
        let mut pending = self.inner.pending.lock().await;

        let mut entity = self
            .inner
            .store
            .get(table, id)
            .await?
            .unwrap_or_else(|| Entity::new(Record::new()));
        for (field, value) in &fields {
            entity.data.insert(field.clone(), value.clone());
        }
        entity.meta.queued = true;
        entity.meta.failed = false;
        entity.meta.last_error = None;
        self.inner.store.set(table, id, entity).await?;

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let entry = pending.entry(key.clone()).or_insert_with(|| PendingEntry {
            fields: Record::new(),
            update_count: 0,
            enqueued_at: Instant::now(),
            generation,
            timer: None,
        });
        entry.cancel_timer();
        entry.fields.extend(fields);
        entry.update_count += 1;
        entry.generation = generation;

        let delay = if entry.update_count >= self.inner.config.max_batch_size {
            debug!(key = %key, updates = entry.update_count, "batch size reached, flushing now");
            Duration::ZERO
        } else {
            Duration::from_millis(self.inner.config.batch_window_ms)
        };

        let inner = Arc::clone(&self.inner);
        let timer_key = key.clone();
        entry.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.flush_key(timer_key, Some(generation)).await
        }));

        debug!(key = %key, updates = entry.update_count, "update queued");
        Ok(())
    }

    /// Delete bypassing the batch window. Any pending change set is discarded.
    pub async fn queue_deletion(&self, table: &str, id: &str) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Queue("write queue has been destroyed".to_string()));
        }
        let key = EntityKey::new(table, id);

        if let Some(mut entry) = self.inner.pending.lock().await.remove(&key) {
            entry.cancel_timer();
            debug!(key = %key, updates = entry.update_count, "pending updates discarded by deletion");
        }
        self.inner.store.remove(table, id).await?;

        let lock = self.inner.key_lock(&key);
        let result = {
            let _guard = lock.lock().await;
            self.inner.persistence.delete(table, id).await
        };
        drop(lock);
        self.inner.release_key_lock(&key);

        if let Err(ref e) = result {
            error!(key = %key, error = %e, "deletion failed");
            self.inner.record_error();
        }
        result
    }

    /// Flush every pending key now and wait for all of them, including
    /// flushes already in progress
    pub async fn flush_all(&self) -> FlushReport {
        let keys: Vec<EntityKey> = {
            let mut pending = self.inner.pending.lock().await;
            pending
                .iter_mut()
                .map(|(key, entry)| {
                    entry.cancel_timer();
                    key.clone()
                })
                .collect()
        };
        let running = self.inner.take_in_flight();

        let direct = join_all(keys.into_iter().map(|key| {
            let inner = Arc::clone(&self.inner);
            async move {
                let result = inner.flush_key(key.clone(), None).await;
                (key, result)
            }
        }));
        let awaited = join_all(running.into_iter().map(|(key, task)| async move {
            let result = task
                .await
                .unwrap_or_else(|e| Err(Error::Queue(format!("flush task ended abnormally: {}", e))));
            (key, result)
        }));
        let (direct, awaited) = futures::join!(direct, awaited);

        let mut report = FlushReport::default();
        for (key, result) in direct.into_iter().chain(awaited) {
            match result {
                Ok(true) => report.flushed += 1,
                Ok(false) => {}
                Err(e) => report.failures.push(FlushFailure {
                    key,
                    error: e.to_string(),
                }),
            }
        }

        info!(
            flushed = report.flushed,
            failed = report.failures.len(),
            "write queue flushed"
        );
        report
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.pending.lock().await.len()
    }

    pub async fn metrics(&self) -> QueueMetrics {
        let pending = self.pending_count().await;
        match self.inner.metrics.lock() {
            Ok(recorder) => recorder.snapshot(pending),
            Err(_) => QueueMetrics::default(),
        }
    }

    pub async fn performance_insights(&self) -> Vec<String> {
        self.metrics().await.performance_insights()
    }

    /// Cancel every timer, abort in-flight flushes and discard pending
    /// change sets; idempotent
    pub async fn destroy(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let discarded = {
            let mut pending = self.inner.pending.lock().await;
            let discarded = pending.len();
            for (_, mut entry) in pending.drain() {
                entry.cancel_timer();
            }
            discarded
        };

        let running = self.inner.take_in_flight();
        let aborted = running.len();
        for (key, task) in running {
            task.abort();
            // 中断完了を待ってから戻る
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(key = %key, error = %e, "flush task ended abnormally");
                }
            }
        }

        if discarded > 0 || aborted > 0 {
            warn!(discarded, aborted, "write queue destroyed with unflushed updates");
        }
    }
}

impl QueueInner {
    fn key_lock(&self, key: &EntityKey) -> Arc<Mutex<()>> {
        match self.key_locks.lock() {
            Ok(mut locks) => Arc::clone(locks.entry(key.clone()).or_default()),
            Err(_) => Arc::new(Mutex::new(())),
        }
    }

    /// Drop the per-key lock when no one else holds it
    fn release_key_lock(&self, key: &EntityKey) {
        if let Ok(mut locks) = self.key_locks.lock() {
            if locks.get(key).map(|l| Arc::strong_count(l) == 1).unwrap_or(false) {
                locks.remove(key);
            }
        }
    }

    fn take_in_flight(&self) -> Vec<(EntityKey, FlushTask)> {
        match self.in_flight.lock() {
            Ok(mut tasks) => tasks.drain().collect(),
            Err(_) => Vec::new(),
        }
    }

    fn finish_in_flight(&self, key: &EntityKey) {
        if let Ok(mut tasks) = self.in_flight.lock() {
            tasks.remove(key);
        }
    }

    fn record_error(&self) {
        if let Ok(mut recorder) = self.metrics.lock() {
            recorder.record_error();
        }
    }

    /// Flush the pending entry of `key`. With `expected` set, only the
    /// entry of that generation is flushed. Returns whether a write ran.
    async fn flush_key(&self, key: EntityKey, expected: Option<u64>) -> Result<bool> {
        let lock = self.key_lock(&key);
        let result = {
            let _guard = lock.lock().await;

            let entry = {
                let mut pending = self.pending.lock().await;
                let current = pending.get(&key).map(|e| e.generation);
                match (current, expected) {
                    (Some(g), Some(want)) if g != want => None,
                    (Some(_), _) => pending.remove(&key),
                    (None, _) => None,
                }
            };

            match entry {
                Some(mut entry) => {
                    // Only a timer-driven flush still owns its task handle
                    let tracked = match (entry.timer.take(), self.in_flight.lock()) {
                        (Some(task), Ok(mut tasks)) => {
                            tasks.insert(key.clone(), task);
                            true
                        }
                        _ => false,
                    };
                    let result = self.write_with_retries(&key, entry).await.map(|_| true);
                    if tracked {
                        self.finish_in_flight(&key);
                    }
                    result
                }
                None => Ok(false),
            }
        };
        drop(lock);
        self.release_key_lock(&key);
        result
    }

    async fn write_with_retries(&self, key: &EntityKey, entry: PendingEntry) -> Result<()> {
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            match self.persistence.write(&key.table, &key.id, &entry.fields).await {
                Ok(()) => {
                    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                    if let Ok(mut recorder) = self.metrics.lock() {
                        recorder.record_success(entry.update_count, elapsed_ms);
                    }
                    debug!(
                        key = %key,
                        updates = entry.update_count,
                        attempts = attempt + 1,
                        waited_ms = entry.enqueued_at.elapsed().as_millis() as u64,
                        "flush completed"
                    );
                    self.mark_flushed(key).await;
                    return Ok(());
                }
                Err(e) if attempt < self.config.retry_attempts => {
                    attempt += 1;
                    let delay = Duration::from_millis(self.config.retry_delay_ms * attempt as u64);
                    warn!(key = %key, attempt, error = %e, "flush failed, retrying in {:?}", delay);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(key = %key, attempts = attempt + 1, error = %e, "flush failed permanently");
                    self.record_error();
                    self.mark_failed(key, &e).await;
                    return Err(e);
                }
            }
        }
    }

    async fn mark_flushed(&self, key: &EntityKey) {
        if self.pending.lock().await.contains_key(key) {
            return;
        }
        if let Ok(Some(mut entity)) = self.store.get(&key.table, &key.id).await {
            entity.meta.queued = false;
            if let Err(e) = self.store.set(&key.table, &key.id, entity).await {
                warn!(key = %key, error = %e, "failed to clear queued flag");
            }
        }
    }

    async fn mark_failed(&self, key: &EntityKey, err: &Error) {
        if let Ok(Some(mut entity)) = self.store.get(&key.table, &key.id).await {
            entity.meta.queued = false;
            entity.meta.failed = true;
            entity.meta.last_error = Some(err.to_string());
            if let Err(e) = self.store.set(&key.table, &key.id, entity).await {
                warn!(key = %key, error = %e, "failed to mark entity as failed");
            }
        }
    }
}
