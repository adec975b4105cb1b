//! 監査ログシステム
//! データアクセス・変更・同意・データ主体権利・セキュリティイベントの記録

use crate::clock::{system_clock, Clock};
use crate::config::{AuditConfig, AuditLevel, ExportFormat};
use crate::error::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 保持期間の定期掃除の間隔
const RETENTION_SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(24 * 60 * 60);

/// クエリの既定件数
pub const DEFAULT_QUERY_LIMIT: usize = 100;

/// CSVエクスポートのヘッダー
pub const CSV_HEADER: [&str; 8] = [
    "timestamp",
    "userId",
    "action",
    "resource",
    "resourceId",
    "result",
    "ipAddress",
    "details",
];

/// 監査ログカテゴリ
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    /// データ参照
    DataAccess,
    /// データ変更
    DataModification,
    /// 同意
    Consent,
    /// データ主体権利
    DataSubjectRights,
    /// セキュリティ
    Security,
    /// 暗号化
    Encryption,
    /// システム
    System,
}

impl fmt::Display for AuditCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditCategory::DataAccess => write!(f, "DATA_ACCESS"),
            AuditCategory::DataModification => write!(f, "DATA_MODIFICATION"),
            AuditCategory::Consent => write!(f, "CONSENT"),
            AuditCategory::DataSubjectRights => write!(f, "DATA_SUBJECT_RIGHTS"),
            AuditCategory::Security => write!(f, "SECURITY"),
            AuditCategory::Encryption => write!(f, "ENCRYPTION"),
            AuditCategory::System => write!(f, "SYSTEM"),
        }
    }
}

/// 処理結果
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AuditResult {
    Success,
    Failure,
}

impl fmt::Display for AuditResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditResult::Success => write!(f, "success"),
            AuditResult::Failure => write!(f, "failure"),
        }
    }
}

/// 監査ログエントリ（追記後は不変）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    /// 一意の識別子
    pub id: String,
    /// タイムスタンプ（UTC）
    pub timestamp: DateTime<Utc>,
    /// ユーザーID
    pub user_id: String,
    /// 実行されたアクション
    pub action: String,
    /// 対象リソース
    pub resource: String,
    /// 対象リソースID
    pub resource_id: Option<String>,
    /// 結果
    pub result: AuditResult,
    /// カテゴリ
    pub category: AuditCategory,
    /// 詳細
    pub details: Value,
    /// 追加のメタデータ
    pub metadata: HashMap<String, Value>,
    /// IPアドレス
    pub ip_address: Option<String>,
}

/// 記録前のイベント
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub user_id: String,
    pub action: String,
    pub resource: String,
    pub resource_id: Option<String>,
    pub result: AuditResult,
    pub category: AuditCategory,
    pub details: Value,
    pub metadata: HashMap<String, Value>,
    pub ip_address: Option<String>,
}

impl AuditEvent {
    /// 新しいイベントを作成
    pub fn new(
        category: AuditCategory,
        user_id: impl Into<String>,
        action: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            action: action.into(),
            resource: resource.into(),
            resource_id: None,
            result: AuditResult::Success,
            category,
            details: Value::Object(Default::default()),
            metadata: HashMap::new(),
            ip_address: None,
        }
    }

    /// リソースIDを設定
    pub fn with_resource_id(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    /// 詳細を設定
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    /// 結果を設定
    pub fn with_result(mut self, result: AuditResult) -> Self {
        self.result = result;
        self
    }

    /// IPアドレスを設定
    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }

    /// メタデータを追加
    pub fn add_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// minimal レベルでも残すイベントか
    fn is_essential(&self) -> bool {
        matches!(
            self.category,
            AuditCategory::Consent | AuditCategory::DataSubjectRights
        ) || self.action.contains("delete")
            || self.result == AuditResult::Failure
    }
}

/// 監査ログ検索条件
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub user_id: Option<String>,
    pub action: Option<String>,
    pub resource: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub offset: usize,
    /// 未指定時は100件
    pub limit: Option<usize>,
}

impl AuditQuery {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Default::default()
        }
    }

    fn matches(&self, entry: &AuditLogEntry) -> bool {
        if let Some(ref user_id) = self.user_id {
            if &entry.user_id != user_id {
                return false;
            }
        }
        if let Some(ref action) = self.action {
            if &entry.action != action {
                return false;
            }
        }
        if let Some(ref resource) = self.resource {
            if &entry.resource != resource {
                return false;
            }
        }
        if let Some(start) = self.start {
            if entry.timestamp < start {
                return false;
            }
        }
        if let Some(end) = self.end {
            if entry.timestamp > end {
                return false;
            }
        }
        true
    }
}

/// 監査ログ統計情報
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditStatistics {
    /// 総ログエントリ数
    pub total_entries: usize,
    /// カテゴリ別エントリ数
    pub entries_by_category: HashMap<AuditCategory, usize>,
    /// 失敗エントリ数
    pub failures: usize,
    /// 最初のエントリのタイムスタンプ
    pub first_entry_time: Option<DateTime<Utc>>,
    /// 最後のエントリのタイムスタンプ
    pub last_entry_time: Option<DateTime<Utc>>,
}

/// 監査ログ
#[derive(Debug)]
pub struct AuditLog {
    /// 設定
    config: AuditConfig,
    /// ログエントリ（追記順）
    entries: Arc<RwLock<Vec<AuditLogEntry>>>,
    clock: Arc<dyn Clock>,
    /// 定期掃除の停止用
    shutdown: CancellationToken,
}

impl AuditLog {
    /// 新しい監査ログを作成
    pub fn new(config: AuditConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: AuditConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            entries: Arc::new(RwLock::new(Vec::new())),
            clock,
            shutdown: CancellationToken::new(),
        }
    }

    /// デフォルト設定で作成
    pub fn with_defaults() -> Self {
        Self::new(AuditConfig::default())
    }

    pub fn level(&self) -> AuditLevel {
        self.config.log_level
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// イベントを記録（レベルで除外された場合は None）
    pub async fn log_event(&self, event: AuditEvent) -> Option<AuditLogEntry> {
        if !self.config.enabled {
            return None;
        }
        if self.config.log_level == AuditLevel::Minimal && !event.is_essential() {
            return None;
        }

        let entry = AuditLogEntry {
            id: Uuid::new_v4().to_string(),
            timestamp: self.clock.now(),
            user_id: event.user_id,
            action: event.action,
            resource: event.resource,
            resource_id: event.resource_id,
            result: event.result,
            category: event.category,
            details: event.details,
            metadata: event.metadata,
            ip_address: event.ip_address,
        };

        {
            let mut entries = self.entries.write().await;
            entries.push(entry.clone());
            Self::purge_expired(&mut entries, self.retention_cutoff());
        }

        debug!(
            category = %entry.category,
            action = %entry.action,
            user_id = %entry.user_id,
            "audit event recorded"
        );
        Some(entry)
    }

    /// データアクセスログ
    pub async fn log_data_access(
        &self,
        user_id: &str,
        resource: &str,
        resource_id: &str,
        details: Value,
    ) -> Option<AuditLogEntry> {
        self.log_event(
            AuditEvent::new(AuditCategory::DataAccess, user_id, "data.read", resource)
                .with_resource_id(resource_id)
                .with_details(details),
        )
        .await
    }

    /// データ変更ログ
    pub async fn log_data_modification(
        &self,
        user_id: &str,
        action: &str,
        resource: &str,
        resource_id: Option<&str>,
        details: Value,
    ) -> Option<AuditLogEntry> {
        let mut event = AuditEvent::new(AuditCategory::DataModification, user_id, action, resource)
            .with_details(details);
        if let Some(id) = resource_id {
            event = event.with_resource_id(id);
        }
        self.log_event(event).await
    }

    /// 同意ログ
    pub async fn log_consent_event(
        &self,
        user_id: &str,
        purpose_id: &str,
        granted: bool,
    ) -> Option<AuditLogEntry> {
        let action = if granted {
            "consent.granted"
        } else {
            "consent.denied"
        };
        self.log_event(
            AuditEvent::new(AuditCategory::Consent, user_id, action, "consent")
                .with_resource_id(purpose_id)
                .with_details(serde_json::json!({ "purpose": purpose_id, "granted": granted })),
        )
        .await
    }

    /// データ主体権利ログ
    pub async fn log_data_subject_request(
        &self,
        user_id: &str,
        action: &str,
        request_id: &str,
        result: AuditResult,
        details: Value,
    ) -> Option<AuditLogEntry> {
        self.log_event(
            AuditEvent::new(
                AuditCategory::DataSubjectRights,
                user_id,
                action,
                "data_subject_request",
            )
            .with_resource_id(request_id)
            .with_result(result)
            .with_details(details),
        )
        .await
    }

    /// セキュリティログ
    pub async fn log_security_event(
        &self,
        user_id: &str,
        action: &str,
        result: AuditResult,
        details: Value,
    ) -> Option<AuditLogEntry> {
        self.log_event(
            AuditEvent::new(AuditCategory::Security, user_id, action, "security")
                .with_result(result)
                .with_details(details),
        )
        .await
    }

    /// 暗号化ログ
    pub async fn log_encryption_event(
        &self,
        user_id: &str,
        action: &str,
        resource: &str,
        result: AuditResult,
        details: Value,
    ) -> Option<AuditLogEntry> {
        self.log_event(
            AuditEvent::new(AuditCategory::Encryption, user_id, action, resource)
                .with_result(result)
                .with_details(details),
        )
        .await
    }

    /// ログを検索（新しい順、offset/limit でページング）
    pub async fn query_logs(&self, query: &AuditQuery) -> Vec<AuditLogEntry> {
        let limit = query.limit.unwrap_or(DEFAULT_QUERY_LIMIT);
        self.filtered(query)
            .await
            .into_iter()
            .skip(query.offset)
            .take(limit)
            .collect()
    }

    async fn filtered(&self, query: &AuditQuery) -> Vec<AuditLogEntry> {
        let entries = self.entries.read().await;
        let mut matched: Vec<AuditLogEntry> =
            entries.iter().filter(|e| query.matches(e)).cloned().collect();
        // 追記順を保ったまま新しい順に並べる
        matched.reverse();
        matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        matched
    }

    /// ログをエクスポート（検索条件のフィルタを適用、件数制限なし）
    pub async fn export_logs(
        &self,
        query: &AuditQuery,
        format: Option<ExportFormat>,
    ) -> Result<String> {
        let entries: Vec<_> = self
            .filtered(query)
            .await
            .into_iter()
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .collect();

        match format.unwrap_or(self.config.export_format) {
            ExportFormat::Json => Ok(serde_json::to_string_pretty(&entries)?),
            ExportFormat::Csv => Self::render_csv(&entries),
        }
    }

    fn render_csv(entries: &[AuditLogEntry]) -> Result<String> {
        let mut writer = csv::Writer::from_writer(vec![]);
        writer
            .write_record(CSV_HEADER)
            .map_err(|e| Error::Validation(format!("CSV write failed: {}", e)))?;

        for entry in entries {
            let details = serde_json::to_string(&entry.details)?;
            writer
                .write_record([
                    entry.timestamp.to_rfc3339().as_str(),
                    entry.user_id.as_str(),
                    entry.action.as_str(),
                    entry.resource.as_str(),
                    entry.resource_id.as_deref().unwrap_or(""),
                    entry.result.to_string().as_str(),
                    entry.ip_address.as_deref().unwrap_or(""),
                    details.as_str(),
                ])
                .map_err(|e| Error::Validation(format!("CSV write failed: {}", e)))?;
        }

        let bytes = writer
            .into_inner()
            .map_err(|e| Error::Validation(format!("CSV flush failed: {}", e)))?;
        String::from_utf8(bytes).map_err(|e| Error::Validation(format!("CSV encoding: {}", e)))
    }

    /// ユーザーのログを削除
    pub async fn delete_user_logs(&self, user_id: &str) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|e| e.user_id != user_id);
        let removed = before - entries.len();

        info!(user_id, removed, "audit logs deleted for user");
        removed
    }

    /// ユーザーのログを匿名化（件数は変わらない）
    pub async fn anonymize_user_logs(&self, user_id: &str) -> usize {
        let anonymous_id = format!("anon_{}", Uuid::new_v4().simple());
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        let mut count = 0;

        for entry in entries.iter_mut().filter(|e| e.user_id == user_id) {
            entry.user_id = anonymous_id.clone();
            entry
                .metadata
                .insert("originalUserId".to_string(), Value::String("[REDACTED]".into()));
            entry
                .metadata
                .insert("anonymizedAt".to_string(), Value::String(now.to_rfc3339()));
            count += 1;
        }

        info!(user_id, count, "audit logs anonymized for user");
        count
    }

    /// 統計情報を取得
    pub async fn get_statistics(&self) -> AuditStatistics {
        let entries = self.entries.read().await;
        let mut stats = AuditStatistics {
            total_entries: entries.len(),
            ..Default::default()
        };

        for entry in entries.iter() {
            *stats.entries_by_category.entry(entry.category).or_insert(0) += 1;
            if entry.result == AuditResult::Failure {
                stats.failures += 1;
            }
            stats.first_entry_time = Some(match stats.first_entry_time {
                Some(t) if t <= entry.timestamp => t,
                _ => entry.timestamp,
            });
            stats.last_entry_time = Some(match stats.last_entry_time {
                Some(t) if t >= entry.timestamp => t,
                _ => entry.timestamp,
            });
        }

        stats
    }

    /// 保持期間を過ぎたエントリを削除
    pub async fn purge_expired_logs(&self) -> usize {
        let mut entries = self.entries.write().await;
        Self::purge_expired(&mut entries, self.retention_cutoff())
    }

    fn retention_cutoff(&self) -> Option<DateTime<Utc>> {
        if self.config.retention_days <= 0 {
            return None;
        }
        // 表現できないほど長い保持期間は全件保持として扱う
        Duration::try_days(self.config.retention_days)
            .and_then(|age| self.clock.now().checked_sub_signed(age))
    }

    fn purge_expired(entries: &mut Vec<AuditLogEntry>, cutoff: Option<DateTime<Utc>>) -> usize {
        let Some(cutoff) = cutoff else {
            return 0;
        };
        let before = entries.len();
        entries.retain(|e| e.timestamp >= cutoff);
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "expired audit entries purged");
        }
        removed
    }

    /// 24時間ごとの保持期間掃除を開始
    pub fn start_retention_sweep(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let log = Arc::clone(self);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(RETENTION_SWEEP_INTERVAL);
            // 最初の tick は即時に完了する
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let removed = log.purge_expired_logs().await;
                        if removed > 0 {
                            info!(removed, "audit retention sweep completed");
                        }
                    }
                }
            }
        })
    }

    /// 定期掃除を停止（冪等）
    pub fn destroy(&self) {
        if !self.shutdown.is_cancelled() {
            warn!("audit log shutting down");
            self.shutdown.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn log_with_clock(config: AuditConfig) -> (AuditLog, ManualClock) {
        let clock = ManualClock::default();
        (AuditLog::with_clock(config, Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn test_basic_logging() {
        let log = AuditLog::with_defaults();
        let entry = log
            .log_data_modification(
                "user123",
                "data.update",
                "users",
                Some("user123"),
                serde_json::json!({"fields": ["email"]}),
            )
            .await
            .expect("entry recorded");

        assert_eq!(entry.category, AuditCategory::DataModification);
        assert_eq!(log.get_statistics().await.total_entries, 1);
    }

    #[tokio::test]
    async fn test_minimal_level_filters() {
        let config = AuditConfig {
            log_level: AuditLevel::Minimal,
            ..Default::default()
        };
        let (log, _) = log_with_clock(config);

        assert!(log
            .log_data_access("u1", "users", "u1", Value::Null)
            .await
            .is_none());
        assert!(log.log_consent_event("u1", "marketing", true).await.is_some());
        assert!(log
            .log_data_modification("u1", "data.delete", "posts", Some("p1"), Value::Null)
            .await
            .is_some());
        assert!(log
            .log_security_event("u1", "login", AuditResult::Failure, Value::Null)
            .await
            .is_some());
        assert!(log
            .log_security_event("u1", "login", AuditResult::Success, Value::Null)
            .await
            .is_none());

        assert_eq!(log.get_statistics().await.total_entries, 3);
    }

    #[tokio::test]
    async fn test_disabled_log_records_nothing() {
        let config = AuditConfig {
            enabled: false,
            ..Default::default()
        };
        let log = AuditLog::new(config);
        assert!(log.log_consent_event("u1", "marketing", true).await.is_none());
    }

    #[tokio::test]
    async fn test_retention_purges_on_log() {
        let config = AuditConfig {
            retention_days: 30,
            ..Default::default()
        };
        let (log, clock) = log_with_clock(config);

        log.log_consent_event("u1", "marketing", true).await;
        clock.advance(Duration::days(31));
        log.log_consent_event("u1", "analytics", true).await;

        let entries = log.query_logs(&AuditQuery::for_user("u1")).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].resource_id.as_deref(), Some("analytics"));
    }

    #[tokio::test]
    async fn test_huge_retention_does_not_overflow() {
        let config = AuditConfig {
            retention_days: i64::MAX,
            ..Default::default()
        };
        let (log, _) = log_with_clock(config);

        log.log_consent_event("u1", "marketing", true).await;
        assert_eq!(log.purge_expired_logs().await, 0);
        assert_eq!(log.get_statistics().await.total_entries, 1);
    }

    #[tokio::test]
    async fn test_non_positive_retention_keeps_everything() {
        let config = AuditConfig {
            retention_days: 0,
            ..Default::default()
        };
        let (log, clock) = log_with_clock(config);

        log.log_consent_event("u1", "marketing", true).await;
        clock.advance(Duration::days(10_000));
        log.log_consent_event("u1", "analytics", true).await;
        assert_eq!(log.purge_expired_logs().await, 0);
        assert_eq!(log.get_statistics().await.total_entries, 2);
    }

    #[tokio::test]
    async fn test_query_newest_first_with_pagination() {
        let (log, clock) = log_with_clock(AuditConfig::default());
        for i in 0..5 {
            log.log_data_modification("u1", "data.update", "posts", Some(&format!("p{}", i)), Value::Null)
                .await;
            clock.advance(Duration::seconds(1));
        }
        log.log_data_modification("u2", "data.update", "posts", Some("other"), Value::Null)
            .await;

        let query = AuditQuery {
            user_id: Some("u1".to_string()),
            offset: 1,
            limit: Some(2),
            ..Default::default()
        };
        let page = log.query_logs(&query).await;
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].resource_id.as_deref(), Some("p3"));
        assert_eq!(page[1].resource_id.as_deref(), Some("p2"));
    }

    #[tokio::test]
    async fn test_query_default_limit() {
        let log = AuditLog::with_defaults();
        for _ in 0..120 {
            log.log_consent_event("u1", "marketing", true).await;
        }
        assert_eq!(log.query_logs(&AuditQuery::default()).await.len(), 100);
    }

    #[tokio::test]
    async fn test_csv_export_escapes_details() {
        let log = AuditLog::with_defaults();
        log.log_event(
            AuditEvent::new(AuditCategory::Security, "u1", "login", "security")
                .with_ip("10.0.0.1")
                .with_details(serde_json::json!({"note": "said \"hi\""})),
        )
        .await;

        let csv = log
            .export_logs(&AuditQuery::default(), Some(ExportFormat::Csv))
            .await
            .unwrap();
        let mut lines = csv.lines();
        assert_eq!(
            lines.next(),
            Some("timestamp,userId,action,resource,resourceId,result,ipAddress,details")
        );
        let row = lines.next().unwrap();
        assert!(row.contains(",u1,login,security,,success,10.0.0.1,"));
        assert!(row.ends_with(r#""{""note"":""said \""hi\""""}""#));
    }

    #[tokio::test]
    async fn test_json_export() {
        let log = AuditLog::with_defaults();
        log.log_consent_event("u1", "marketing", false).await;
        let json = log.export_logs(&AuditQuery::default(), None).await.unwrap();
        let parsed: Vec<AuditLogEntry> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].action, "consent.denied");
    }

    #[tokio::test]
    async fn test_delete_and_anonymize_user_logs() {
        let log = AuditLog::with_defaults();
        log.log_consent_event("u1", "marketing", true).await;
        log.log_consent_event("u1", "analytics", true).await;
        log.log_consent_event("u2", "analytics", true).await;

        assert_eq!(log.anonymize_user_logs("u1").await, 2);
        assert!(log.query_logs(&AuditQuery::for_user("u1")).await.is_empty());
        let stats = log.get_statistics().await;
        assert_eq!(stats.total_entries, 3);

        let anonymized: Vec<_> = log
            .query_logs(&AuditQuery::default())
            .await
            .into_iter()
            .filter(|e| e.user_id.starts_with("anon_"))
            .collect();
        assert_eq!(anonymized.len(), 2);
        assert_eq!(
            anonymized[0].metadata.get("originalUserId"),
            Some(&Value::String("[REDACTED]".into()))
        );

        assert_eq!(log.delete_user_logs("u2").await, 1);
        assert_eq!(log.get_statistics().await.total_entries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retention_sweep_stops_on_destroy() {
        let log = Arc::new(AuditLog::with_defaults());
        let handle = log.start_retention_sweep();
        log.destroy();
        log.destroy();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("sweep task stops")
            .unwrap();
    }
}
