//! 書き込み前・読み込み後のコンプライアンスフック

use crate::compliance::ConsentLedger;
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::security::audit_log::{AuditLog, AuditResult};
use crate::security::{EncryptionEnvelope, EncryptionService, ENCRYPTION_BLOCK};
use crate::store::Record;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// 書き込みの発生元
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOrigin {
    /// アプリケーションからの通常の書き込み
    Application,
    /// データ主体権利リクエスト（匿名化・訂正）による書き込み
    DataSubjectRights,
}

/// 書き込みフックに渡すコンテキスト
#[derive(Debug)]
pub struct WriteContext<'a> {
    pub table: &'a str,
    pub id: &'a str,
    /// 書き込み前の保存形式（暗号化済み）のレコード
    pub existing: Option<&'a Record>,
    pub origin: WriteOrigin,
}

/// ファサードのデータフック
#[async_trait]
pub trait DataHooks: Send + Sync + fmt::Debug {
    /// 保存前に呼ばれる。エラーを返すと書き込みは中止される
    async fn before_write(&self, ctx: &WriteContext<'_>, record: Record) -> Result<Record>;

    /// 呼び出し元に返す前に呼ばれる
    async fn after_read(&self, table: &str, id: &str, record: Record) -> Result<Record>;
}

/// 同意チェックとフィールド暗号化を行う既定のフック
///
/// 暗号化・復号化の失敗は監査ログに記録する。
#[derive(Debug)]
pub struct GdprHooks {
    consent: Arc<ConsentLedger>,
    encryption: Arc<EncryptionService>,
    audit: Arc<AuditLog>,
    consent_required: bool,
    table_purposes: HashMap<String, String>,
    owner_fields: Vec<String>,
}

impl GdprHooks {
    pub fn new(
        config: &StoreConfig,
        consent: Arc<ConsentLedger>,
        encryption: Arc<EncryptionService>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            consent,
            encryption,
            audit,
            consent_required: config.gdpr.consent.required,
            table_purposes: config.gdpr.consent.table_purposes.clone(),
            owner_fields: config.gdpr.rights.owner_fields.clone(),
        }
    }

    /// 所有者フィールドの値（新しいレコードを優先）
    fn owner_of<'r>(&self, record: &'r Record, existing: Option<&'r Record>) -> Option<&'r str> {
        let find = |r: &'r Record| {
            self.owner_fields
                .iter()
                .find_map(|f| r.get(f).and_then(Value::as_str))
        };
        find(record).or_else(|| existing.and_then(find))
    }

    /// 暗号化対象フィールドに渡された封筒形式の値は、保存済みの値と
    /// 完全に一致する場合だけ受け付ける
    fn check_envelopes(&self, ctx: &WriteContext<'_>, record: &Record, fields: &[String]) -> Result<()> {
        for field in fields {
            let Some(value) = record.get(field) else {
                continue;
            };
            if !EncryptionEnvelope::is_envelope(value) {
                continue;
            }
            if ctx.existing.and_then(|r| r.get(field)) != Some(value) {
                return Err(Error::Validation(format!(
                    "field {}.{} holds an encryption envelope that does not match the stored value",
                    ctx.table, field
                )));
            }
        }
        Ok(())
    }

    async fn audit_encryption_failure(&self, actor: &str, action: &str, table: &str, id: &str, err: &Error) {
        self.audit
            .log_encryption_event(
                actor,
                action,
                table,
                AuditResult::Failure,
                json!({ "resourceId": id, "error": err.to_string(), "code": err.code() }),
            )
            .await;
    }

    async fn enforce_consent(&self, ctx: &WriteContext<'_>, record: &Record) -> Result<()> {
        if !self.consent_required || ctx.origin == WriteOrigin::DataSubjectRights {
            return Ok(());
        }
        let Some(purpose) = self.table_purposes.get(ctx.table) else {
            return Ok(());
        };
        let Some(owner) = self.owner_of(record, ctx.existing) else {
            return Ok(());
        };

        if self.consent.check_consent(owner, purpose).await? {
            Ok(())
        } else {
            Err(Error::Consent(format!(
                "user {} has not consented to purpose {} required by table {}",
                owner, purpose, ctx.table
            )))
        }
    }
}

#[async_trait]
impl DataHooks for GdprHooks {
    async fn before_write(&self, ctx: &WriteContext<'_>, mut record: Record) -> Result<Record> {
        self.enforce_consent(ctx, &record).await?;

        let fields = self.encryption.fields_for(ctx.table);
        if fields.is_empty() || !self.encryption.is_enabled() {
            return Ok(record);
        }
        self.check_envelopes(ctx, &record, fields)?;

        // 部分書き込みでも既存の暗号化ブロックを引き継ぐ
        if !record.contains_key(ENCRYPTION_BLOCK) {
            if let Some(block) = ctx.existing.and_then(|r| r.get(ENCRYPTION_BLOCK)) {
                record.insert(ENCRYPTION_BLOCK.to_string(), block.clone());
            }
        }

        debug!(table = ctx.table, id = ctx.id, "encrypting configured fields");
        match self.encryption.encrypt_entity(ctx.table, &record, fields).await {
            Ok(encrypted) => Ok(encrypted),
            Err(e) => {
                let actor = self.owner_of(&record, ctx.existing).unwrap_or("system");
                self.audit_encryption_failure(actor, "encryption.encrypt.failed", ctx.table, ctx.id, &e)
                    .await;
                Err(e)
            }
        }
    }

    async fn after_read(&self, table: &str, id: &str, record: Record) -> Result<Record> {
        match self.encryption.decrypt_entity(&record).await {
            Ok(decrypted) => Ok(decrypted),
            Err(e) => {
                let actor = self.owner_of(&record, None).unwrap_or("system");
                self.audit_encryption_failure(actor, "encryption.decrypt.failed", table, id, &e)
                    .await;
                Err(e)
            }
        }
    }
}
