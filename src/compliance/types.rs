//! Compliance Types
//!
//! GDPRコンプライアンスに関連する型定義

use crate::security::audit_log::AuditLogEntry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// データ主体リクエストの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    /// アクセス権（GDPR Art.15）
    Access,
    /// 訂正権（GDPR Art.16）
    Rectification,
    /// 削除権（GDPR Art.17）
    Erasure,
}

impl RequestType {
    /// 対応するGDPR条文
    pub fn gdpr_article(&self) -> &'static str {
        match self {
            RequestType::Access => "Article 15",
            RequestType::Rectification => "Article 16",
            RequestType::Erasure => "Article 17",
        }
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestType::Access => write!(f, "export"),
            RequestType::Rectification => write!(f, "rectification"),
            RequestType::Erasure => write!(f, "deletion"),
        }
    }
}

/// 法的根拠
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LegalBasis {
    /// 同意（GDPR Art.6(1)(a)）
    Consent,
    /// 契約履行（GDPR Art.6(1)(b)）
    Contract,
    /// 法的義務（GDPR Art.6(1)(c)）
    LegalObligation,
    /// 正当な利益（GDPR Art.6(1)(f)）
    LegitimateInterests,
}

/// 同意目的のカテゴリ
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConsentCategory {
    Essential,
    Functional,
    Analytics,
    Marketing,
}

/// 同意目的の定義
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsentPurpose {
    /// 目的ID
    pub id: String,
    /// 表示名
    pub name: String,
    /// 必須目的（常に同意済みとして扱う）
    #[serde(default)]
    pub required: bool,
    /// 法的根拠
    pub legal_basis: LegalBasis,
    /// カテゴリ
    pub category: ConsentCategory,
    /// 既定のデータ保持期間（日数）
    #[serde(default)]
    pub retention_days: Option<u32>,
}

impl ConsentPurpose {
    /// 既定の目的定義
    pub fn defaults() -> Vec<ConsentPurpose> {
        vec![
            ConsentPurpose {
                id: "essential".to_string(),
                name: "Essential service operation".to_string(),
                required: true,
                legal_basis: LegalBasis::Contract,
                category: ConsentCategory::Essential,
                retention_days: None,
            },
            ConsentPurpose {
                id: "analytics".to_string(),
                name: "Usage analytics".to_string(),
                required: false,
                legal_basis: LegalBasis::Consent,
                category: ConsentCategory::Analytics,
                retention_days: Some(365),
            },
            ConsentPurpose {
                id: "marketing".to_string(),
                name: "Marketing communication".to_string(),
                required: false,
                legal_basis: LegalBasis::Consent,
                category: ConsentCategory::Marketing,
                retention_days: Some(1095), // 3 years
            },
            ConsentPurpose {
                id: "personalization".to_string(),
                name: "Personalized experience".to_string(),
                required: false,
                legal_basis: LegalBasis::Consent,
                category: ConsentCategory::Functional,
                retention_days: Some(365),
            },
        ]
    }
}

/// 同意の取得経路
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConsentSource {
    #[default]
    Explicit,
    Implicit,
    LegitimateInterest,
}

/// 同意記録
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsentRecord {
    /// データ主体の識別子
    pub user_id: String,
    /// 同意目的
    pub purpose_id: String,
    /// 同意したか
    pub granted: bool,
    /// 記録日時
    pub timestamp: DateTime<Utc>,
    /// 有効期限
    pub expires_at: Option<DateTime<Utc>>,
    /// 取得経路
    pub source: ConsentSource,
    /// 追加情報
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ConsentRecord {
    /// 指定時刻で期限切れかどうか
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// 同意記録オプション
#[derive(Debug, Clone, Default)]
pub struct ConsentOptions {
    /// 有効期限（日数）。未指定なら台帳の既定値
    pub expiry_days: Option<u32>,
    pub source: ConsentSource,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ConsentOptions {
    pub fn with_expiry_days(mut self, days: u32) -> Self {
        self.expiry_days = Some(days);
        self
    }

    pub fn with_source(mut self, source: ConsentSource) -> Self {
        self.source = source;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// 同意履歴のエクスポート
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentExport {
    pub user_id: String,
    /// 目的ごとの最新記録
    pub current: Vec<ConsentRecord>,
    /// 全履歴（古い順）
    pub history: Vec<ConsentRecord>,
    pub exported_at: DateTime<Utc>,
}

/// 削除方法
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeletionMethod {
    /// 物理削除
    HardDelete,
    /// 匿名化
    Anonymize,
}

/// エクスポートされたレコード
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedRecord {
    pub id: String,
    pub data: serde_json::Map<String, serde_json::Value>,
}

/// エクスポートメタデータ
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportMetadata {
    pub record_count: usize,
    pub table_count: usize,
    pub processing_time_ms: u64,
    pub exported_at: DateTime<Utc>,
}

/// アクセス権リクエストの結果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataExport {
    pub request_id: String,
    pub user_id: String,
    /// テーブル → レコード
    pub personal_data: HashMap<String, Vec<ExportedRecord>>,
    pub consent_history: ConsentExport,
    pub audit_trail: Vec<AuditLogEntry>,
    pub metadata: ExportMetadata,
}

/// 削除オプション
#[derive(Debug, Clone, Default)]
pub struct DeletionOptions {
    /// true: 物理削除 / false: 匿名化
    pub hard_delete: bool,
    pub reason: Option<String>,
}

/// 削除サマリー
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeletionSummary {
    pub tables_processed: usize,
    pub records_deleted: usize,
    pub anonymized_records: usize,
    pub consent_records_deleted: usize,
    pub consent_records_anonymized: usize,
    pub audit_logs_deleted: usize,
    pub audit_logs_anonymized: usize,
}

/// 削除証明書のコンプライアンス情報
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CertificateCompliance {
    pub gdpr_article: String,
    pub method: DeletionMethod,
    pub verification: String,
}

/// 削除証明書
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeletionCertificate {
    pub certificate_id: String,
    pub request_id: String,
    pub user_id: String,
    pub deletion_date: DateTime<Utc>,
    pub summary: DeletionSummary,
    pub compliance: CertificateCompliance,
    pub signature: String,
}

/// 削除権リクエストの結果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletionResult {
    pub request_id: String,
    pub user_id: String,
    pub method: DeletionMethod,
    pub summary: DeletionSummary,
    pub certificate: DeletionCertificate,
    pub processing_time_ms: u64,
}

/// テーブル → レコードID → フィールド → 新しい値
pub type Corrections = HashMap<String, HashMap<String, HashMap<String, serde_json::Value>>>;

/// フィールド単位の変更
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldChange {
    pub table: String,
    pub record_id: String,
    pub field: String,
    pub before: serde_json::Value,
    pub after: serde_json::Value,
}

/// フィールド単位の検証エラー
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldValidationError {
    pub table: String,
    pub record_id: String,
    pub field: String,
    pub message: String,
}

impl FieldValidationError {
    /// "table.field" 形式のパス
    pub fn path(&self) -> String {
        format!("{}.{}", self.table, self.field)
    }
}

/// 訂正権リクエストの結果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RectificationResult {
    pub request_id: String,
    pub user_id: String,
    pub fields_updated: usize,
    pub changes: Vec<FieldChange>,
    pub validation_errors: Vec<FieldValidationError>,
    pub processing_time_ms: u64,
}

impl RectificationResult {
    pub fn is_complete(&self) -> bool {
        self.validation_errors.is_empty()
    }
}
