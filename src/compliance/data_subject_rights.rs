//! Data Subject Rights
//!
//! データ主体権利リクエスト（アクセス・削除・訂正）の処理
//!
//! 各リクエストは「受付 → 検証 → 実行 → 監査 → 結果」の順に処理する。
//! リクエスト単位の失敗は `Error::DataSubjectRights` として返し、
//! 失敗エントリを1件だけ監査ログに残す。

use super::consent_ledger::ConsentLedger;
use super::types::*;
use crate::clock::{system_clock, Clock};
use crate::config::RightsConfig;
use crate::error::{Error, Result};
use crate::security::audit_log::{AuditLog, AuditQuery, AuditResult};
use crate::store::Record;
use async_trait::async_trait;
use chrono::Duration;
use regex::Regex;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

/// 匿名化で置き換える値
pub const REDACTED: &str = "[REDACTED]";

/// 空にできないフィールド
const REQUIRED_FIELDS: &[&str] = &["email", "name", "username"];

/// データ主体のレコードへのアクセス手段
#[async_trait]
pub trait UserDataSource: Send + Sync {
    /// 主レコード（id = ユーザーID）と所有者フィールドが一致するレコード（復号済み）
    async fn find_user_records(
        &self,
        table: &str,
        user_id: &str,
        owner_fields: &[String],
    ) -> Result<Vec<(String, Record)>>;

    async fn fetch_record(&self, table: &str, id: &str) -> Result<Option<Record>>;

    /// 同意チェックを行わずにフィールドを書き込む
    async fn write_record(&self, table: &str, id: &str, fields: Record) -> Result<()>;

    async fn delete_record(&self, table: &str, id: &str) -> Result<()>;
}

/// データ主体権利オーケストレーター
pub struct RightsOrchestrator {
    config: RightsConfig,
    data: Arc<dyn UserDataSource>,
    consent: Arc<ConsentLedger>,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
    email_pattern: Regex,
    phone_pattern: Regex,
}

impl std::fmt::Debug for RightsOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RightsOrchestrator")
            .field("tables", &self.config.tables)
            .finish()
    }
}

impl RightsOrchestrator {
    pub fn new(
        config: RightsConfig,
        data: Arc<dyn UserDataSource>,
        consent: Arc<ConsentLedger>,
        audit: Arc<AuditLog>,
    ) -> Result<Self> {
        Self::with_clock(config, data, consent, audit, system_clock())
    }

    pub fn with_clock(
        config: RightsConfig,
        data: Arc<dyn UserDataSource>,
        consent: Arc<ConsentLedger>,
        audit: Arc<AuditLog>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let email_pattern = Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$")
            .map_err(|e| Error::Config(e.to_string()))?;
        let phone_pattern =
            Regex::new(r"^\+?[0-9][0-9\s\-()]{5,19}$").map_err(|e| Error::Config(e.to_string()))?;

        Ok(Self {
            config,
            data,
            consent,
            audit,
            clock,
            email_pattern,
            phone_pattern,
        })
    }

    fn new_request_id() -> String {
        format!("dsr_{}", Uuid::new_v4().simple())
    }

    fn elapsed_ms(started: Instant) -> u64 {
        started.elapsed().as_millis() as u64
    }

    /// リクエストを受け付けて監査ログに記録
    async fn open_request(&self, request_type: RequestType, user_id: &str) -> Result<String> {
        if user_id.trim().is_empty() {
            let err = Error::rights(&request_type.to_string(), "user id must not be empty");
            self.audit
                .log_data_subject_request(
                    "system",
                    &format!("dsr.{}.failed", request_type),
                    "",
                    AuditResult::Failure,
                    json!({ "error": err.to_string() }),
                )
                .await;
            return Err(err);
        }

        let request_id = Self::new_request_id();
        self.audit
            .log_data_subject_request(
                user_id,
                &format!("dsr.{}.requested", request_type),
                &request_id,
                AuditResult::Success,
                json!({ "gdprArticle": request_type.gdpr_article() }),
            )
            .await;
        info!(%request_type, user_id, request_id, "data subject request received");
        Ok(request_id)
    }

    /// リクエスト単位の失敗を記録してエラーに変換
    async fn fail_request(
        &self,
        request_type: RequestType,
        user_id: &str,
        request_id: &str,
        cause: Error,
    ) -> Error {
        warn!(%request_type, user_id, request_id, error = %cause, "data subject request failed");
        self.audit
            .log_data_subject_request(
                user_id,
                &format!("dsr.{}.failed", request_type),
                request_id,
                AuditResult::Failure,
                json!({ "error": cause.to_string(), "code": cause.code() }),
            )
            .await;
        Error::DataSubjectRights {
            request_type: request_type.to_string(),
            message: cause.to_string(),
            details: Some(json!({ "requestId": request_id, "code": cause.code() })),
        }
    }

    // ------------------------------------------------------------------
    // アクセス権（Art. 15）
    // ------------------------------------------------------------------

    /// ユーザーの個人データをエクスポート
    pub async fn export_user_data(&self, user_id: &str) -> Result<DataExport> {
        let started = Instant::now();
        let request_id = self.open_request(RequestType::Access, user_id).await?;

        let personal_data = match self.collect_user_records(user_id).await {
            Ok(data) => data,
            Err(e) => return Err(self.fail_request(RequestType::Access, user_id, &request_id, e).await),
        };

        let consent_history = self.consent.export_consent_history(user_id).await;
        let trail_days = self.config.audit_trail_days.clamp(0, 365);
        let audit_trail = self
            .audit
            .query_logs(&AuditQuery {
                user_id: Some(user_id.to_string()),
                start: Some(self.clock.now() - Duration::days(trail_days)),
                limit: Some(usize::MAX),
                ..Default::default()
            })
            .await;

        let record_count = personal_data.values().map(Vec::len).sum();
        let table_count = personal_data.values().filter(|r| !r.is_empty()).count();
        let export = DataExport {
            request_id: request_id.clone(),
            user_id: user_id.to_string(),
            personal_data,
            consent_history,
            audit_trail,
            metadata: ExportMetadata {
                record_count,
                table_count,
                processing_time_ms: Self::elapsed_ms(started),
                exported_at: self.clock.now(),
            },
        };

        self.audit
            .log_data_subject_request(
                user_id,
                "dsr.export.completed",
                &request_id,
                AuditResult::Success,
                json!({ "recordCount": record_count, "tableCount": table_count }),
            )
            .await;
        Ok(export)
    }

    async fn collect_user_records(
        &self,
        user_id: &str,
    ) -> Result<HashMap<String, Vec<ExportedRecord>>> {
        let mut personal_data = HashMap::new();
        for table in &self.config.tables {
            let records = self
                .data
                .find_user_records(table, user_id, &self.config.owner_fields)
                .await?;
            personal_data.insert(
                table.clone(),
                records
                    .into_iter()
                    .map(|(id, data)| ExportedRecord { id, data })
                    .collect(),
            );
        }
        Ok(personal_data)
    }

    // ------------------------------------------------------------------
    // 削除権（Art. 17）
    // ------------------------------------------------------------------

    /// ユーザーデータを削除または匿名化し、削除証明書を発行
    pub async fn delete_user_data(
        &self,
        user_id: &str,
        options: DeletionOptions,
    ) -> Result<DeletionResult> {
        let started = Instant::now();
        let request_id = self.open_request(RequestType::Erasure, user_id).await?;
        let method = if options.hard_delete {
            DeletionMethod::HardDelete
        } else {
            DeletionMethod::Anonymize
        };

        let outcome = match method {
            DeletionMethod::HardDelete => self.hard_delete(user_id).await,
            DeletionMethod::Anonymize => self.anonymize(user_id).await,
        };
        let summary = match outcome {
            Ok(summary) => summary,
            Err(e) => {
                return Err(self.fail_request(RequestType::Erasure, user_id, &request_id, e).await)
            }
        };

        let certificate = self.issue_certificate(&request_id, user_id, method, &summary);
        // 削除後の完了記録は対象ユーザーに紐づけない
        self.audit
            .log_data_subject_request(
                "system",
                "dsr.deletion.completed",
                &request_id,
                AuditResult::Success,
                json!({
                    "method": method,
                    "certificateId": certificate.certificate_id,
                    "summary": summary,
                    "reason": options.reason,
                }),
            )
            .await;
        info!(request_id, ?method, "deletion request completed");

        Ok(DeletionResult {
            request_id,
            user_id: user_id.to_string(),
            method,
            summary,
            certificate,
            processing_time_ms: Self::elapsed_ms(started),
        })
    }

    async fn hard_delete(&self, user_id: &str) -> Result<DeletionSummary> {
        let mut summary = DeletionSummary {
            tables_processed: self.config.tables.len(),
            ..Default::default()
        };

        for table in &self.config.tables {
            let records = self
                .data
                .find_user_records(table, user_id, &self.config.owner_fields)
                .await?;
            for (id, _) in records {
                self.data.delete_record(table, &id).await?;
                summary.records_deleted += 1;
            }
        }

        summary.consent_records_deleted = self.consent.delete_user_consents(user_id).await;
        summary.audit_logs_deleted = self.audit.delete_user_logs(user_id).await;
        Ok(summary)
    }

    async fn anonymize(&self, user_id: &str) -> Result<DeletionSummary> {
        let anonymous_id = format!("anon_{}", Uuid::new_v4().simple());
        let mut summary = DeletionSummary {
            tables_processed: self.config.tables.len(),
            ..Default::default()
        };

        for table in &self.config.tables {
            let records = self
                .data
                .find_user_records(table, user_id, &self.config.owner_fields)
                .await?;
            for (id, record) in records {
                let changes = self.anonymized_fields(&record, user_id, &anonymous_id);
                if changes.is_empty() {
                    continue;
                }
                self.data.write_record(table, &id, changes).await?;
                summary.anonymized_records += 1;
            }
        }

        summary.consent_records_anonymized = self
            .consent
            .anonymize_user_consents(user_id, &anonymous_id)
            .await;
        summary.audit_logs_anonymized = self.audit.anonymize_user_logs(user_id).await;
        Ok(summary)
    }

    /// 匿名化で書き換えるフィールド
    fn anonymized_fields(&self, record: &Record, user_id: &str, anonymous_id: &str) -> Record {
        let mut changes = Record::new();
        for field in &self.config.pii_fields {
            if let Some(value) = record.get(field) {
                if !value.is_null() && value != REDACTED {
                    changes.insert(field.clone(), Value::String(REDACTED.to_string()));
                }
            }
        }
        for field in &self.config.owner_fields {
            if record.get(field).and_then(Value::as_str) == Some(user_id) {
                changes.insert(field.clone(), Value::String(anonymous_id.to_string()));
            }
        }
        changes
    }

    fn issue_certificate(
        &self,
        request_id: &str,
        user_id: &str,
        method: DeletionMethod,
        summary: &DeletionSummary,
    ) -> DeletionCertificate {
        DeletionCertificate {
            certificate_id: format!("cert_{}", Uuid::new_v4().simple()),
            request_id: request_id.to_string(),
            user_id: user_id.to_string(),
            deletion_date: self.clock.now(),
            summary: summary.clone(),
            compliance: CertificateCompliance {
                gdpr_article: RequestType::Erasure.gdpr_article().to_string(),
                method,
                verification: "sha256".to_string(),
            },
            signature: certificate_signature(request_id, user_id, summary),
        }
    }

    // ------------------------------------------------------------------
    // 訂正権（Art. 16）
    // ------------------------------------------------------------------

    /// フィールドを検証して訂正。検証に失敗したフィールドは記録してスキップする
    pub async fn rectify_user_data(
        &self,
        user_id: &str,
        corrections: Corrections,
    ) -> Result<RectificationResult> {
        let started = Instant::now();
        let request_id = self.open_request(RequestType::Rectification, user_id).await?;

        let mut result = RectificationResult {
            request_id: request_id.clone(),
            user_id: user_id.to_string(),
            fields_updated: 0,
            changes: Vec::new(),
            validation_errors: Vec::new(),
            processing_time_ms: 0,
        };

        // 処理順を固定する
        let ordered: BTreeMap<String, BTreeMap<String, HashMap<String, Value>>> = corrections
            .into_iter()
            .map(|(table, records)| (table, records.into_iter().collect()))
            .collect();

        for (table, records) in ordered {
            for (record_id, fields) in records {
                if let Err(e) = self
                    .rectify_record(user_id, &table, &record_id, fields, &mut result)
                    .await
                {
                    return Err(self
                        .fail_request(RequestType::Rectification, user_id, &request_id, e)
                        .await);
                }
            }
        }

        result.processing_time_ms = Self::elapsed_ms(started);
        self.audit
            .log_data_subject_request(
                user_id,
                "dsr.rectification.completed",
                &request_id,
                AuditResult::Success,
                json!({
                    "fieldsUpdated": result.fields_updated,
                    "validationErrors": result.validation_errors.len(),
                }),
            )
            .await;
        Ok(result)
    }

    async fn rectify_record(
        &self,
        user_id: &str,
        table: &str,
        record_id: &str,
        fields: HashMap<String, Value>,
        result: &mut RectificationResult,
    ) -> Result<()> {
        let error = |field: &str, message: String| FieldValidationError {
            table: table.to_string(),
            record_id: record_id.to_string(),
            field: field.to_string(),
            message,
        };

        let mut valid = Record::new();
        let mut names: Vec<&String> = fields.keys().collect();
        names.sort();
        for field in names {
            let value = &fields[field];
            match self.validate_field(field, value) {
                Ok(()) => {
                    valid.insert(field.clone(), value.clone());
                }
                Err(message) => result.validation_errors.push(error(field, message)),
            }
        }
        if valid.is_empty() {
            return Ok(());
        }

        let current = match self.data.fetch_record(table, record_id).await? {
            Some(record) if self.belongs_to(record_id, &record, user_id) => record,
            Some(_) => {
                for field in valid.keys() {
                    result.validation_errors.push(error(
                        field,
                        "record does not belong to the data subject".to_string(),
                    ));
                }
                return Ok(());
            }
            None => {
                for field in valid.keys() {
                    result
                        .validation_errors
                        .push(error(field, "record not found".to_string()));
                }
                return Ok(());
            }
        };

        let changes: Vec<FieldChange> = valid
            .iter()
            .map(|(field, after)| FieldChange {
                table: table.to_string(),
                record_id: record_id.to_string(),
                field: field.clone(),
                before: current.get(field).cloned().unwrap_or(Value::Null),
                after: after.clone(),
            })
            .collect();

        let updated = valid.len();
        self.data.write_record(table, record_id, valid).await?;

        self.audit
            .log_data_modification(
                user_id,
                "dsr.rectification.update",
                table,
                Some(record_id),
                json!({
                    "changes": changes
                        .iter()
                        .map(|c| json!({ "field": c.field, "before": c.before, "after": c.after }))
                        .collect::<Vec<_>>(),
                }),
            )
            .await;

        result.fields_updated += updated;
        result.changes.extend(changes);
        Ok(())
    }

    fn belongs_to(&self, record_id: &str, record: &Record, user_id: &str) -> bool {
        record_id == user_id
            || self
                .config
                .owner_fields
                .iter()
                .any(|f| record.get(f).and_then(Value::as_str) == Some(user_id))
    }

    /// フィールド単位の検証
    fn validate_field(&self, field: &str, value: &Value) -> std::result::Result<(), String> {
        if REQUIRED_FIELDS.contains(&field) {
            match value.as_str() {
                Some(s) if !s.trim().is_empty() => {}
                _ => return Err(format!("{} must be a non-empty string", field)),
            }
        }

        match field {
            "email" => match value.as_str() {
                Some(s) if self.email_pattern.is_match(s) => Ok(()),
                _ => Err("invalid email address".to_string()),
            },
            "phone" => match value {
                Value::Null => Ok(()),
                Value::String(s) if self.phone_pattern.is_match(s) => Ok(()),
                _ => Err("invalid phone number".to_string()),
            },
            _ => Ok(()),
        }
    }
}

/// 削除証明書の署名（リクエストID・ユーザーID・サマリーのSHA-256）
pub fn certificate_signature(request_id: &str, user_id: &str, summary: &DeletionSummary) -> String {
    let summary_json = serde_json::to_string(summary).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(request_id.as_bytes());
    hasher.update(user_id.as_bytes());
    hasher.update(summary_json.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// 証明書の署名を検証
pub fn verify_certificate(certificate: &DeletionCertificate) -> bool {
    certificate.signature
        == certificate_signature(
            &certificate.request_id,
            &certificate.user_id,
            &certificate.summary,
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuditConfig, ConsentConfig};
    use std::sync::Mutex;

    /// テスト用のインメモリデータソース
    #[derive(Default)]
    struct FakeData {
        tables: Mutex<HashMap<String, BTreeMap<String, Record>>>,
        fail: bool,
    }

    impl FakeData {
        fn with(rows: Vec<(&str, &str, Value)>) -> Self {
            let data = FakeData::default();
            {
                let mut tables = data.tables.lock().unwrap();
                for (table, id, value) in rows {
                    tables
                        .entry(table.to_string())
                        .or_default()
                        .insert(id.to_string(), value.as_object().cloned().unwrap());
                }
            }
            data
        }

        fn get(&self, table: &str, id: &str) -> Option<Record> {
            self.tables
                .lock()
                .unwrap()
                .get(table)
                .and_then(|t| t.get(id))
                .cloned()
        }
    }

    #[async_trait]
    impl UserDataSource for FakeData {
        async fn find_user_records(
            &self,
            table: &str,
            user_id: &str,
            owner_fields: &[String],
        ) -> Result<Vec<(String, Record)>> {
            if self.fail {
                return Err(Error::backend("connection lost"));
            }
            let tables = self.tables.lock().unwrap();
            Ok(tables
                .get(table)
                .map(|rows| {
                    rows.iter()
                        .filter(|(id, r)| {
                            id.as_str() == user_id
                                || owner_fields
                                    .iter()
                                    .any(|f| r.get(f).and_then(Value::as_str) == Some(user_id))
                        })
                        .map(|(id, r)| (id.clone(), r.clone()))
                        .collect()
                })
                .unwrap_or_default())
        }

        async fn fetch_record(&self, table: &str, id: &str) -> Result<Option<Record>> {
            Ok(self.get(table, id))
        }

        async fn write_record(&self, table: &str, id: &str, fields: Record) -> Result<()> {
            let mut tables = self.tables.lock().unwrap();
            let record = tables
                .entry(table.to_string())
                .or_default()
                .entry(id.to_string())
                .or_default();
            record.extend(fields);
            Ok(())
        }

        async fn delete_record(&self, table: &str, id: &str) -> Result<()> {
            if let Some(rows) = self.tables.lock().unwrap().get_mut(table) {
                rows.remove(id);
            }
            Ok(())
        }
    }

    struct Fixture {
        data: Arc<FakeData>,
        consent: Arc<ConsentLedger>,
        audit: Arc<AuditLog>,
        rights: RightsOrchestrator,
    }

    fn fixture(data: FakeData) -> Fixture {
        let data = Arc::new(data);
        let consent = Arc::new(ConsentLedger::new(&ConsentConfig::default()).unwrap());
        let audit = Arc::new(AuditLog::new(AuditConfig::default()));
        let config = RightsConfig {
            tables: vec!["users".to_string(), "posts".to_string()],
            ..Default::default()
        };
        let rights =
            RightsOrchestrator::new(config, data.clone(), consent.clone(), audit.clone()).unwrap();
        Fixture {
            data,
            consent,
            audit,
            rights,
        }
    }

    fn sample_data() -> FakeData {
        FakeData::with(vec![
            (
                "users",
                "u1",
                json!({"email": "alice@example.com", "name": "Alice", "plan": "pro"}),
            ),
            ("users", "u2", json!({"email": "bob@example.com", "name": "Bob"})),
            ("posts", "p1", json!({"authorId": "u1", "title": "Hello", "bio": "x"})),
            ("posts", "p2", json!({"authorId": "u2", "title": "Other"})),
        ])
    }

    #[tokio::test]
    async fn test_export_collects_primary_and_owned_records() {
        let f = fixture(sample_data());
        f.consent
            .record_consent("u1", "marketing", true, ConsentOptions::default())
            .await
            .unwrap();

        let export = f.rights.export_user_data("u1").await.unwrap();
        assert_eq!(export.personal_data["users"].len(), 1);
        assert_eq!(export.personal_data["posts"].len(), 1);
        assert_eq!(export.personal_data["posts"][0].id, "p1");
        assert_eq!(export.metadata.record_count, 2);
        assert_eq!(export.metadata.table_count, 2);
        assert_eq!(export.consent_history.current.len(), 1);
        // 受付イベントが監査証跡に含まれる
        assert!(export
            .audit_trail
            .iter()
            .any(|e| e.action == "dsr.export.requested"));
    }

    #[tokio::test]
    async fn test_export_failure_is_audited_once() {
        let mut data = sample_data();
        data.fail = true;
        let f = fixture(data);

        let err = f.rights.export_user_data("u1").await.unwrap_err();
        assert_eq!(err.code(), "DATA_SUBJECT_RIGHTS_ERROR");

        let failures = f
            .audit
            .query_logs(&AuditQuery {
                action: Some("dsr.export.failed".to_string()),
                ..Default::default()
            })
            .await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].result, AuditResult::Failure);
    }

    #[tokio::test]
    async fn test_empty_user_id_rejected() {
        let f = fixture(sample_data());
        let err = f
            .rights
            .delete_user_data(" ", DeletionOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "DATA_SUBJECT_RIGHTS_ERROR");
    }

    #[tokio::test]
    async fn test_hard_delete_removes_everything() {
        let f = fixture(sample_data());
        f.consent
            .record_consent("u1", "analytics", true, ConsentOptions::default())
            .await
            .unwrap();

        let result = f
            .rights
            .delete_user_data(
                "u1",
                DeletionOptions {
                    hard_delete: true,
                    reason: Some("user request".to_string()),
                },
            )
            .await
            .unwrap();

        assert_eq!(result.method, DeletionMethod::HardDelete);
        assert_eq!(result.summary.records_deleted, 2);
        assert_eq!(result.summary.consent_records_deleted, 1);
        // 受付エントリ1件（同意の記録は台帳経由で監査していない）
        assert_eq!(result.summary.audit_logs_deleted, 1);
        assert!(f.data.get("users", "u1").is_none());
        assert!(f.data.get("posts", "p1").is_none());
        assert!(f.data.get("posts", "p2").is_some());
        assert!(f.consent.get_user_consents("u1").await.is_empty());
        assert!(f
            .audit
            .query_logs(&AuditQuery::for_user("u1"))
            .await
            .is_empty());

        assert!(verify_certificate(&result.certificate));
        assert_eq!(result.certificate.compliance.gdpr_article, "Article 17");
    }

    #[tokio::test]
    async fn test_anonymize_redacts_pii_and_owner_fields() {
        let f = fixture(sample_data());
        let result = f
            .rights
            .delete_user_data("u1", DeletionOptions::default())
            .await
            .unwrap();

        assert_eq!(result.method, DeletionMethod::Anonymize);
        assert_eq!(result.summary.anonymized_records, 2);

        let user = f.data.get("users", "u1").unwrap();
        assert_eq!(user["email"], json!(REDACTED));
        assert_eq!(user["name"], json!(REDACTED));
        assert_eq!(user["plan"], json!("pro"));

        let post = f.data.get("posts", "p1").unwrap();
        assert_eq!(post["bio"], json!(REDACTED));
        assert!(post["authorId"].as_str().unwrap().starts_with("anon_"));
        assert_eq!(post["title"], json!("Hello"));

        // 匿名化後のエクスポートに個人情報が残らない
        let export = f.rights.export_user_data("u1").await.unwrap();
        for records in export.personal_data.values() {
            for record in records {
                for field in ["email", "name", "bio"] {
                    if let Some(value) = record.data.get(field) {
                        assert_eq!(value, &json!(REDACTED));
                    }
                }
            }
        }
    }

    #[test]
    fn test_signature_is_deterministic() {
        let summary = DeletionSummary {
            records_deleted: 3,
            ..Default::default()
        };
        let a = certificate_signature("dsr_1", "u1", &summary);
        let b = certificate_signature("dsr_1", "u1", &summary);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, certificate_signature("dsr_2", "u1", &summary));
    }

    #[tokio::test]
    async fn test_rectify_invalid_email_is_collected() {
        let f = fixture(sample_data());
        let corrections: Corrections = serde_json::from_value(json!({
            "users": { "u1": { "email": "not-an-email" } }
        }))
        .unwrap();

        let result = f.rights.rectify_user_data("u1", corrections).await.unwrap();
        assert_eq!(result.fields_updated, 0);
        assert_eq!(result.validation_errors.len(), 1);
        assert_eq!(result.validation_errors[0].path(), "users.email");
        assert!(!result.is_complete());
        assert_eq!(f.data.get("users", "u1").unwrap()["email"], json!("alice@example.com"));
    }

    #[tokio::test]
    async fn test_rectify_partial_success() {
        let f = fixture(sample_data());
        let corrections: Corrections = serde_json::from_value(json!({
            "users": {
                "u1": { "email": "alice@new.example.com", "name": "", "phone": "+44 20 7946 0958" },
                "u2": { "name": "Mallory" },
                "u9": { "name": "Ghost" }
            }
        }))
        .unwrap();

        let result = f.rights.rectify_user_data("u1", corrections).await.unwrap();
        assert_eq!(result.fields_updated, 2);
        assert_eq!(result.changes.len(), 2);
        let email = result.changes.iter().find(|c| c.field == "email").unwrap();
        assert_eq!(email.before, json!("alice@example.com"));
        assert_eq!(email.after, json!("alice@new.example.com"));

        let paths: Vec<String> = result
            .validation_errors
            .iter()
            .map(|e| format!("{}:{}", e.record_id, e.field))
            .collect();
        assert_eq!(paths, vec!["u1:name", "u2:name", "u9:name"]);

        let user = f.data.get("users", "u1").unwrap();
        assert_eq!(user["email"], json!("alice@new.example.com"));
        assert_eq!(user["name"], json!("Alice"));
        assert_eq!(f.data.get("users", "u2").unwrap()["name"], json!("Bob"));
    }
}
