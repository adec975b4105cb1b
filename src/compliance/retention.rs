//! Retention Manager
//!
//! 保持ポリシーに基づくデータの自動削除

use crate::clock::{system_clock, Clock};
use crate::config::RetentionConfig;
use crate::error::{Error, Result};
use crate::persistence::{PersistenceAdapter, RecordFilter};
use crate::queue::WriteQueue;
use crate::security::audit_log::{AuditCategory, AuditEvent, AuditLog};
use crate::store::{Entity, EntityStore, Record};
use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// レコードの作成・更新日時として参照する属性
const TIMESTAMP_FIELDS: &[&str] = &["updatedAt", "lastUpdated", "createdAt"];

/// 保持期間・猶予期間の上限（100年）
pub const MAX_RETENTION_DAYS: i64 = 36_500;

/// ISO-8601 期間を解析（年=365日、月=30日、週=7日として換算）
///
/// `P[n]Y[n]M[n]W[n]D[T[n]H[n]M[n]S]` 形式。少なくとも1つの要素が必要。
pub fn parse_iso8601_duration(input: &str) -> Result<Duration> {
    let pattern = Regex::new(
        r"^P(?:(\d+)Y)?(?:(\d+)M)?(?:(\d+)W)?(?:(\d+)D)?(?:T(?:(\d+)H)?(?:(\d+)M)?(?:(\d+)S)?)?$",
    )
    .map_err(|e| Error::Config(e.to_string()))?;

    let invalid = || Error::Config(format!("Invalid ISO-8601 duration: {}", input));
    let caps = pattern.captures(input).ok_or_else(invalid)?;
    if caps.iter().skip(1).all(|c| c.is_none()) {
        return Err(invalid());
    }
    if input.ends_with('T') {
        return Err(invalid());
    }

    let part = |i: usize| -> Result<i64> {
        caps.get(i)
            .map(|m| m.as_str().parse::<i64>().map_err(|_| invalid()))
            .unwrap_or(Ok(0))
    };

    let too_long = || {
        Error::Config(format!(
            "ISO-8601 duration exceeds {} days: {}",
            MAX_RETENTION_DAYS, input
        ))
    };
    let weighted = |parts: &[(usize, i64)]| -> Result<i64> {
        parts.iter().try_fold(0i64, |acc, &(i, factor)| {
            part(i)?
                .checked_mul(factor)
                .and_then(|v| acc.checked_add(v))
                .ok_or_else(too_long)
        })
    };

    let days = weighted(&[(1, 365), (2, 30), (3, 7), (4, 1)])?;
    let seconds = weighted(&[(5, 3600), (6, 60), (7, 1)])?;

    let duration = Duration::try_days(days)
        .and_then(|d| d.checked_add(&Duration::try_seconds(seconds)?))
        .ok_or_else(too_long)?;
    if duration > Duration::days(MAX_RETENTION_DAYS) {
        return Err(too_long());
    }
    Ok(duration)
}

/// 削除実行レポート
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionReport {
    /// この日時より古いレコードを削除対象とした
    pub cutoff: DateTime<Utc>,
    pub tables_scanned: usize,
    pub records_deleted: usize,
    /// テーブル別削除件数
    pub deleted_by_table: HashMap<String, usize>,
    pub errors: Vec<String>,
}

/// データ保持マネージャー
#[derive(Debug)]
pub struct RetentionManager {
    config: RetentionConfig,
    policy: Duration,
    store: Arc<dyn EntityStore>,
    persistence: Arc<dyn PersistenceAdapter>,
    queue: WriteQueue,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
}

impl RetentionManager {
    pub fn new(
        config: RetentionConfig,
        store: Arc<dyn EntityStore>,
        persistence: Arc<dyn PersistenceAdapter>,
        queue: WriteQueue,
        audit: Arc<AuditLog>,
    ) -> Result<Self> {
        Self::with_clock(config, store, persistence, queue, audit, system_clock())
    }

    pub fn with_clock(
        config: RetentionConfig,
        store: Arc<dyn EntityStore>,
        persistence: Arc<dyn PersistenceAdapter>,
        queue: WriteQueue,
        audit: Arc<AuditLog>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let policy = parse_iso8601_duration(&config.default_policy)?;
        Ok(Self {
            config,
            policy,
            store,
            persistence,
            queue,
            audit,
            clock,
            shutdown: CancellationToken::new(),
        })
    }

    /// 削除基準日時（現在 - 保持期間 - 猶予期間）
    pub fn cutoff(&self) -> DateTime<Utc> {
        let grace = Duration::try_days(i64::from(self.config.grace_period_days));
        grace
            .and_then(|g| self.policy.checked_add(&g))
            .and_then(|age| self.clock.now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn record_timestamp(record: &Record) -> Option<DateTime<Utc>> {
        TIMESTAMP_FIELDS.iter().find_map(|field| {
            record
                .get(*field)
                .and_then(|v| v.as_str())
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc))
        })
    }

    /// 期限切れレコードを削除
    pub async fn run_cleanup(&self) -> Result<RetentionReport> {
        let cutoff = self.cutoff();
        let mut report = RetentionReport {
            cutoff,
            tables_scanned: 0,
            records_deleted: 0,
            deleted_by_table: HashMap::new(),
            errors: Vec::new(),
        };

        for table in &self.config.tables {
            report.tables_scanned += 1;

            let cached: HashMap<String, DateTime<Utc>> = self
                .store
                .query(table, &|_: &Entity| true)
                .await?
                .into_iter()
                .map(|(id, e)| (id, e.meta.last_updated))
                .collect();
            let rows = self.persistence.load_where(table, &RecordFilter::All).await?;

            let expired: Vec<String> = rows
                .into_iter()
                .filter_map(|(id, record)| {
                    let stamp = Self::record_timestamp(&record).or_else(|| cached.get(&id).copied());
                    match stamp {
                        Some(ts) if ts < cutoff => Some(id),
                        _ => None,
                    }
                })
                .collect();

            let mut deleted = 0;
            for id in expired {
                match self.queue.queue_deletion(table, &id).await {
                    Ok(()) => deleted += 1,
                    Err(e) => {
                        warn!(table, id, error = %e, "retention deletion failed");
                        report.errors.push(format!("{}/{}: {}", table, id, e));
                    }
                }
            }

            debug!(table, deleted, "retention sweep of table completed");
            report.records_deleted += deleted;
            report.deleted_by_table.insert(table.clone(), deleted);
        }

        self.audit
            .log_event(
                AuditEvent::new(AuditCategory::System, "system", "data.delete.retention", "retention")
                    .with_details(serde_json::json!({
                        "cutoff": cutoff.to_rfc3339(),
                        "recordsDeleted": report.records_deleted,
                        "tables": report.deleted_by_table,
                        "errors": report.errors.len(),
                    })),
            )
            .await;

        info!(
            records_deleted = report.records_deleted,
            tables = report.tables_scanned,
            "retention cleanup completed"
        );
        Ok(report)
    }

    /// 定期削除を開始（`automatic_cleanup` が無効なら何もしない）
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if !self.config.automatic_cleanup {
            return None;
        }

        let manager = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        let period = std::time::Duration::from_secs(self.config.cleanup_interval_secs.max(1));

        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = manager.run_cleanup().await {
                            warn!(error = %e, "scheduled retention cleanup failed");
                        }
                    }
                }
            }
            debug!("retention scheduler stopped");
        }))
    }

    /// 定期削除を停止
    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}
