use crate::compliance::retention::{parse_iso8601_duration, MAX_RETENTION_DAYS};
use crate::compliance::types::ConsentPurpose;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Main data layer configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Entity store backend selector
    pub backend: BackendKind,

    /// Backend options
    pub backend_options: BackendOptions,

    /// GDPR compliance configuration
    pub gdpr: GdprConfig,

    /// Read cache configuration
    pub cache: CacheConfig,

    /// Write queue configuration
    pub update_queue: UpdateQueueConfig,
}

/// Entity store backend variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// No reactive backend: Simple Cache fallback
    None,
    /// Simple Cache (TTL map, polling subscriptions)
    #[default]
    Simple,
    /// Reactive store with nested per-table maps
    Table,
    /// Reactive store with a flat ordered key map
    Observable,
    /// Caller-supplied store implementation
    Custom,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendOptions {
    /// Fall through to the persistence collaborator on cache misses
    pub persistence: bool,

    /// Maximum number of cached entities (Simple Cache)
    pub max_cache_size: Option<usize>,

    /// Entity time-to-live in milliseconds (Simple Cache)
    pub ttl_ms: Option<u64>,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            persistence: true,
            max_cache_size: None,
            ttl_ms: None,
        }
    }
}

/// GDPR configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GdprConfig {
    pub encryption: EncryptionConfig,
    pub audit: AuditConfig,
    pub retention: RetentionConfig,
    pub consent: ConsentConfig,
    pub rights: RightsConfig,
}

/// フィールド暗号化設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// 暗号化を有効にするか
    pub enabled: bool,
    /// 暗号化アルゴリズム
    pub algorithm: String,
    /// キー導出関数
    pub key_derivation: String,
    /// PBKDF2 反復回数
    pub key_derivation_iterations: u32,
    /// マスターキーを読み込む環境変数名
    pub master_key_env: String,
    /// テーブルごとの暗号化対象フィールド
    pub encrypted_fields: HashMap<String, Vec<String>>,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            algorithm: "aes-256-gcm".to_string(),
            key_derivation: "pbkdf2-sha256".to_string(),
            key_derivation_iterations: 100_000,
            master_key_env: "COMPLIANCE_MASTER_KEY".to_string(),
            encrypted_fields: HashMap::new(),
        }
    }
}

/// 監査ログの記録レベル
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditLevel {
    /// 同意・データ主体権利・削除・失敗イベントのみ
    Minimal,
    #[default]
    Standard,
    Detailed,
}

/// 監査ログのエクスポート形式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Json,
    Csv,
}

/// 監査ログ設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub enabled: bool,
    pub log_level: AuditLevel,
    /// 保持日数（0以下で自動削除を無効化）
    pub retention_days: i64,
    pub export_format: ExportFormat,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_level: AuditLevel::Standard,
            retention_days: 2555, // 7 years
            export_format: ExportFormat::Json,
        }
    }
}

/// データ保持設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// ISO-8601 期間（例: "P2Y"）
    pub default_policy: String,
    /// 猶予期間（日数）
    pub grace_period_days: u32,
    /// 定期自動削除を有効にするか
    pub automatic_cleanup: bool,
    /// 自動削除の実行間隔（秒）
    pub cleanup_interval_secs: u64,
    /// 保持ポリシーを適用するテーブル
    pub tables: Vec<String>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            default_policy: "P2Y".to_string(),
            grace_period_days: 30,
            automatic_cleanup: false,
            cleanup_interval_secs: 86_400,
            tables: Vec::new(),
        }
    }
}

/// 同意管理設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsentConfig {
    /// 同意管理を有効にするか（false の場合は常に default_consent を返す）
    pub required: bool,
    /// 記録が無い場合の既定値
    pub default_consent: bool,
    /// 追加の目的定義
    pub purposes: Vec<ConsentPurpose>,
    /// 既定の有効期限（日数）
    pub expiry_days: Option<u32>,
    /// テーブル → 書き込みに必要な目的
    pub table_purposes: HashMap<String, String>,
}

impl Default for ConsentConfig {
    fn default() -> Self {
        Self {
            required: true,
            default_consent: false,
            purposes: Vec::new(),
            expiry_days: Some(365),
            table_purposes: HashMap::new(),
        }
    }
}

/// データ主体権利リクエスト設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RightsConfig {
    /// エクスポート・削除の対象テーブル
    pub tables: Vec<String>,
    /// 匿名化で消去するフィールド
    pub pii_fields: Vec<String>,
    /// 所有者を示すフィールド
    pub owner_fields: Vec<String>,
    /// エクスポートに含める監査ログの日数（最大365）
    pub audit_trail_days: i64,
}

impl Default for RightsConfig {
    fn default() -> Self {
        Self {
            tables: vec!["users".to_string()],
            pii_fields: [
                "email",
                "phone",
                "name",
                "firstName",
                "lastName",
                "displayName",
                "username",
                "address",
                "ipAddress",
                "dateOfBirth",
                "bio",
                "avatar",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            owner_fields: ["userId", "authorId", "createdBy", "ownerId"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            audit_trail_days: 365,
        }
    }
}

/// Cache eviction strategy for the Simple Cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStrategy {
    /// Evict the oldest by last write
    #[default]
    Lru,
    /// Evict the oldest by first insertion
    Fifo,
    /// Evict the entries closest to expiry
    Ttl,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Serve reads from the entity store
    pub enabled: bool,
    /// Entity time-to-live in milliseconds
    pub ttl_ms: u64,
    /// Maximum number of cached entities
    pub max_size: usize,
    pub strategy: CacheStrategy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_ms: 5 * 60 * 1000,
            max_size: 10_000,
            strategy: CacheStrategy::Lru,
        }
    }
}

/// Write queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateQueueConfig {
    /// Debounce window per key (ms)
    pub batch_window_ms: u64,
    /// Updates per key that force an immediate flush
    pub max_batch_size: usize,
    /// Retries after the first failed write
    pub retry_attempts: u32,
    /// Base retry delay (ms), multiplied by the attempt number
    pub retry_delay_ms: u64,
}

impl Default for UpdateQueueConfig {
    fn default() -> Self {
        Self {
            batch_window_ms: 100,
            max_batch_size: 50,
            retry_attempts: 3,
            retry_delay_ms: 1000,
        }
    }
}

impl StoreConfig {
    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.update_queue.batch_window_ms == 0 {
            return Err(Error::Config(
                "update_queue.batch_window_ms must be greater than 0".to_string(),
            ));
        }
        if self.update_queue.max_batch_size == 0 {
            return Err(Error::Config(
                "update_queue.max_batch_size must be greater than 0".to_string(),
            ));
        }
        if self.cache.max_size == 0 {
            return Err(Error::Config("cache.max_size must be greater than 0".to_string()));
        }
        if self.backend_options.max_cache_size == Some(0) {
            return Err(Error::Config(
                "backend_options.max_cache_size must be greater than 0".to_string(),
            ));
        }

        self.gdpr.validate()
    }

    /// Simple Cache capacity: backend option wins over the cache section
    pub fn simple_cache_capacity(&self) -> usize {
        self.backend_options
            .max_cache_size
            .unwrap_or(self.cache.max_size)
    }

    pub fn simple_cache_ttl_ms(&self) -> u64 {
        self.backend_options.ttl_ms.unwrap_or(self.cache.ttl_ms)
    }
}

impl GdprConfig {
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for purpose in &self.consent.purposes {
            if !seen.insert(purpose.id.as_str()) {
                return Err(Error::Config(format!(
                    "Duplicate consent purpose id: {}",
                    purpose.id
                )));
            }
        }

        for (table, purpose) in &self.consent.table_purposes {
            if purpose.is_empty() {
                return Err(Error::Config(format!(
                    "Empty consent purpose for table: {}",
                    table
                )));
            }
        }

        parse_iso8601_duration(&self.retention.default_policy)?;
        if i64::from(self.retention.grace_period_days) > MAX_RETENTION_DAYS {
            return Err(Error::Config(format!(
                "retention.grace_period_days must not exceed {}",
                MAX_RETENTION_DAYS
            )));
        }
        if self.audit.retention_days > MAX_RETENTION_DAYS {
            return Err(Error::Config(format!(
                "audit.retention_days must not exceed {}",
                MAX_RETENTION_DAYS
            )));
        }

        if self.encryption.enabled && self.encryption.key_derivation_iterations == 0 {
            return Err(Error::Config(
                "encryption.key_derivation_iterations must be greater than 0".to_string(),
            ));
        }

        if self.rights.audit_trail_days > 365 {
            return Err(Error::Config(
                "rights.audit_trail_days must not exceed 365".to_string(),
            ));
        }

        Ok(())
    }
}
