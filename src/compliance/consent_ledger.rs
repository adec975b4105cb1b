//! Consent Ledger
//!
//! 目的ベースの同意台帳。必須目的・有効期限・既定値の扱いを一元管理する。

use super::types::*;
use crate::clock::{system_clock, Clock};
use crate::config::ConsentConfig;
use crate::error::{Error, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// 同意台帳
#[derive(Debug)]
pub struct ConsentLedger {
    /// 台帳が有効か（無効時は常に既定値を返す）
    enabled: bool,
    /// 記録が無い場合の既定値
    default_consent: bool,
    /// 既定の有効期限（日数）
    default_expiry_days: Option<u32>,
    /// 目的レジストリ
    purposes: Arc<RwLock<HashMap<String, ConsentPurpose>>>,
    /// 最新の同意記録（user_id -> purpose_id -> 記録）
    consents: Arc<RwLock<HashMap<String, HashMap<String, ConsentRecord>>>>,
    /// 同意履歴（user_id -> 記録リスト）
    history: Arc<RwLock<HashMap<String, Vec<ConsentRecord>>>>,
    clock: Arc<dyn Clock>,
}

impl ConsentLedger {
    /// 新しい同意台帳を作成
    pub fn new(config: &ConsentConfig) -> Result<Self> {
        Self::with_clock(config, system_clock())
    }

    /// 時計を指定して作成
    pub fn with_clock(config: &ConsentConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let mut purposes: HashMap<String, ConsentPurpose> = ConsentPurpose::defaults()
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();

        // 設定で指定された目的は既定の定義を上書きする（設定内の重複は不可）
        let mut configured = std::collections::HashSet::new();
        for purpose in &config.purposes {
            if !configured.insert(purpose.id.clone()) {
                return Err(Error::Config(format!(
                    "Duplicate consent purpose id: {}",
                    purpose.id
                )));
            }
            purposes.insert(purpose.id.clone(), purpose.clone());
        }

        Ok(Self {
            enabled: config.required,
            default_consent: config.default_consent,
            default_expiry_days: config.expiry_days,
            purposes: Arc::new(RwLock::new(purposes)),
            consents: Arc::new(RwLock::new(HashMap::new())),
            history: Arc::new(RwLock::new(HashMap::new())),
            clock,
        })
    }

    /// 目的を登録
    pub async fn register_purpose(&self, purpose: ConsentPurpose) -> Result<()> {
        let mut purposes = self.purposes.write().await;
        if purposes.contains_key(&purpose.id) {
            return Err(Error::Config(format!(
                "Consent purpose already registered: {}",
                purpose.id
            )));
        }
        info!(purpose = %purpose.id, required = purpose.required, "consent purpose registered");
        purposes.insert(purpose.id.clone(), purpose);
        Ok(())
    }

    /// 目的を取得
    pub async fn get_purpose(&self, purpose_id: &str) -> Option<ConsentPurpose> {
        self.purposes.read().await.get(purpose_id).cloned()
    }

    /// 登録済みの全目的
    pub async fn list_purposes(&self) -> Vec<ConsentPurpose> {
        let mut list: Vec<_> = self.purposes.read().await.values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    async fn require_purpose(&self, purpose_id: &str) -> Result<ConsentPurpose> {
        self.get_purpose(purpose_id)
            .await
            .ok_or_else(|| Error::UnknownPurpose(purpose_id.to_string()))
    }

    /// 同意を記録（同じ user/purpose の既存記録は上書き）
    pub async fn record_consent(
        &self,
        user_id: &str,
        purpose_id: &str,
        granted: bool,
        options: ConsentOptions,
    ) -> Result<ConsentRecord> {
        let purpose = self.require_purpose(purpose_id).await?;
        let now = self.clock.now();

        // 必須目的は期限管理の対象外
        let expires_at = if purpose.required {
            None
        } else {
            options
                .expiry_days
                .or(self.default_expiry_days)
                .map(|days| now + Duration::days(days as i64))
        };

        let record = ConsentRecord {
            user_id: user_id.to_string(),
            purpose_id: purpose_id.to_string(),
            granted,
            timestamp: now,
            expires_at,
            source: options.source,
            metadata: options.metadata,
        };

        {
            let mut consents = self.consents.write().await;
            consents
                .entry(user_id.to_string())
                .or_default()
                .insert(purpose_id.to_string(), record.clone());
        }
        {
            let mut history = self.history.write().await;
            history
                .entry(user_id.to_string())
                .or_default()
                .push(record.clone());
        }

        debug!(user_id, purpose_id, granted, "consent recorded");
        Ok(record)
    }

    /// 同意状態を確認
    pub async fn check_consent(&self, user_id: &str, purpose_id: &str) -> Result<bool> {
        if !self.enabled {
            return Ok(self.default_consent);
        }

        let purpose = self.require_purpose(purpose_id).await?;
        if purpose.required {
            return Ok(true);
        }

        let consents = self.consents.read().await;
        let record = consents.get(user_id).and_then(|m| m.get(purpose_id));

        Ok(match record {
            None => self.default_consent,
            Some(r) if r.is_expired_at(self.clock.now()) => {
                // 期限切れは取り消しとして扱い、付与に戻すことはない
                if r.granted {
                    false
                } else {
                    self.default_consent
                }
            }
            Some(r) => r.granted,
        })
    }

    /// 同意を撤回
    pub async fn withdraw_consent(&self, user_id: &str, purpose_id: &str) -> Result<ConsentRecord> {
        let purpose = self.require_purpose(purpose_id).await?;
        if purpose.required {
            return Err(Error::Consent(format!(
                "Cannot withdraw consent for required purpose: {}",
                purpose_id
            )));
        }

        info!(user_id, purpose_id, "consent withdrawn");
        self.record_consent(
            user_id,
            purpose_id,
            false,
            ConsentOptions::default().with_source(ConsentSource::Explicit),
        )
        .await
    }

    /// ユーザーの最新の同意記録
    pub async fn get_user_consents(&self, user_id: &str) -> Vec<ConsentRecord> {
        let consents = self.consents.read().await;
        let mut records: Vec<_> = consents
            .get(user_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        records.sort_by(|a, b| a.purpose_id.cmp(&b.purpose_id));
        records
    }

    /// 同意履歴をエクスポート
    pub async fn export_consent_history(&self, user_id: &str) -> ConsentExport {
        let current = self.get_user_consents(user_id).await;
        let history = self
            .history
            .read()
            .await
            .get(user_id)
            .cloned()
            .unwrap_or_default();

        ConsentExport {
            user_id: user_id.to_string(),
            current,
            history,
            exported_at: self.clock.now(),
        }
    }

    /// ユーザーの同意記録を全て削除（削除した履歴件数を返す）
    pub async fn delete_user_consents(&self, user_id: &str) -> usize {
        self.consents.write().await.remove(user_id);
        let removed = self
            .history
            .write()
            .await
            .remove(user_id)
            .map(|h| h.len())
            .unwrap_or(0);

        info!(user_id, removed, "user consents deleted");
        removed
    }

    /// ユーザーの同意記録を匿名IDへ付け替える
    pub async fn anonymize_user_consents(&self, user_id: &str, anonymous_id: &str) -> usize {
        let anonymize = |record: &mut ConsentRecord| {
            record.user_id = anonymous_id.to_string();
            record
                .metadata
                .insert("anonymized".to_string(), serde_json::Value::Bool(true));
        };

        {
            let mut consents = self.consents.write().await;
            if let Some(mut current) = consents.remove(user_id) {
                current.values_mut().for_each(anonymize);
                consents.insert(anonymous_id.to_string(), current);
            }
        }

        let mut history = self.history.write().await;
        match history.remove(user_id) {
            Some(mut records) => {
                records.iter_mut().for_each(anonymize);
                let count = records.len();
                history.insert(anonymous_id.to_string(), records);
                count
            }
            None => 0,
        }
    }

    /// 同意統計を取得
    pub async fn get_consent_stats(&self) -> ConsentStats {
        let purposes = self.purposes.read().await;
        let consents = self.consents.read().await;
        let history = self.history.read().await;
        let now = self.clock.now();

        let mut by_purpose: HashMap<String, PurposeStats> = HashMap::new();
        let mut compliant_users = 0;

        for records in consents.values() {
            let mut compliant = true;
            for record in records.values() {
                let expired = record.is_expired_at(now);
                let stats = by_purpose.entry(record.purpose_id.clone()).or_default();
                if expired {
                    stats.expired += 1;
                } else if record.granted {
                    stats.granted += 1;
                } else {
                    stats.denied += 1;
                }

                let required = purposes
                    .get(&record.purpose_id)
                    .map(|p| p.required)
                    .unwrap_or(false);
                if !required && (!record.granted || expired) {
                    compliant = false;
                }
            }
            if compliant {
                compliant_users += 1;
            }
        }

        let total_users = consents.len();
        ConsentStats {
            total_users,
            total_records: history.values().map(|h| h.len()).sum(),
            by_purpose,
            compliance_rate: if total_users == 0 {
                1.0
            } else {
                compliant_users as f64 / total_users as f64
            },
        }
    }
}

/// 目的別の集計
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PurposeStats {
    pub granted: usize,
    pub denied: usize,
    pub expired: usize,
}

/// 同意統計
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentStats {
    /// 総データ主体数
    pub total_users: usize,
    /// 履歴を含む総記録数
    pub total_records: usize,
    /// 目的別の集計
    pub by_purpose: HashMap<String, PurposeStats>,
    /// 必須以外の目的で拒否・期限切れが無いユーザーの割合
    pub compliance_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn ledger_with_clock() -> (ConsentLedger, ManualClock) {
        let clock = ManualClock::default();
        let ledger =
            ConsentLedger::with_clock(&ConsentConfig::default(), Arc::new(clock.clone())).unwrap();
        (ledger, clock)
    }

    #[tokio::test]
    async fn test_unknown_purpose_rejected() {
        let (ledger, _) = ledger_with_clock();
        let err = ledger
            .record_consent("u1", "telemetry", true, ConsentOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownPurpose(ref p) if p == "telemetry"));
    }

    #[tokio::test]
    async fn test_required_purpose_always_granted() {
        let (ledger, _) = ledger_with_clock();
        ledger
            .record_consent("u1", "essential", false, ConsentOptions::default())
            .await
            .unwrap();
        assert!(ledger.check_consent("u1", "essential").await.unwrap());
        assert!(ledger.check_consent("nobody", "essential").await.unwrap());
    }

    #[tokio::test]
    async fn test_required_purpose_never_expires() {
        let (ledger, _) = ledger_with_clock();
        let record = ledger
            .record_consent(
                "u1",
                "essential",
                true,
                ConsentOptions::default().with_expiry_days(1),
            )
            .await
            .unwrap();
        assert!(record.expires_at.is_none());
    }

    #[tokio::test]
    async fn test_expired_grant_resolves_false_not_default() {
        let config = ConsentConfig {
            default_consent: true,
            ..Default::default()
        };
        let clock = ManualClock::default();
        let ledger = ConsentLedger::with_clock(&config, Arc::new(clock.clone())).unwrap();

        ledger
            .record_consent(
                "u1",
                "marketing",
                true,
                ConsentOptions::default().with_expiry_days(0),
            )
            .await
            .unwrap();
        clock.advance(Duration::milliseconds(1));

        assert!(!ledger.check_consent("u1", "marketing").await.unwrap());
        // 記録が無いユーザーは既定値
        assert!(ledger.check_consent("u2", "marketing").await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_denial_resolves_default() {
        let config = ConsentConfig {
            default_consent: true,
            ..Default::default()
        };
        let clock = ManualClock::default();
        let ledger = ConsentLedger::with_clock(&config, Arc::new(clock.clone())).unwrap();

        ledger
            .record_consent(
                "u1",
                "analytics",
                false,
                ConsentOptions::default().with_expiry_days(1),
            )
            .await
            .unwrap();
        assert!(!ledger.check_consent("u1", "analytics").await.unwrap());

        clock.advance(Duration::days(2));
        assert!(ledger.check_consent("u1", "analytics").await.unwrap());
    }

    #[tokio::test]
    async fn test_disabled_ledger_returns_default() {
        let config = ConsentConfig {
            required: false,
            default_consent: true,
            ..Default::default()
        };
        let ledger = ConsentLedger::new(&config).unwrap();
        ledger
            .record_consent("u1", "marketing", false, ConsentOptions::default())
            .await
            .unwrap();
        assert!(ledger.check_consent("u1", "marketing").await.unwrap());
    }

    #[tokio::test]
    async fn test_latest_record_wins() {
        let (ledger, _) = ledger_with_clock();
        ledger
            .record_consent("u1", "analytics", true, ConsentOptions::default())
            .await
            .unwrap();
        ledger.withdraw_consent("u1", "analytics").await.unwrap();

        assert!(!ledger.check_consent("u1", "analytics").await.unwrap());
        let export = ledger.export_consent_history("u1").await;
        assert_eq!(export.current.len(), 1);
        assert_eq!(export.history.len(), 2);
    }

    #[tokio::test]
    async fn test_withdraw_required_purpose_fails() {
        let (ledger, _) = ledger_with_clock();
        let err = ledger.withdraw_consent("u1", "essential").await.unwrap_err();
        assert_eq!(err.code(), "CONSENT_ERROR");
    }

    #[tokio::test]
    async fn test_register_purpose() {
        let (ledger, _) = ledger_with_clock();
        let purpose = ConsentPurpose {
            id: "research".to_string(),
            name: "Research".to_string(),
            required: false,
            legal_basis: LegalBasis::Consent,
            category: ConsentCategory::Functional,
            retention_days: Some(90),
        };
        ledger.register_purpose(purpose.clone()).await.unwrap();
        assert!(ledger.register_purpose(purpose).await.is_err());
        assert!(ledger.get_purpose("research").await.is_some());
        assert_eq!(ledger.list_purposes().await.len(), 5);
    }

    #[tokio::test]
    async fn test_consent_stats_compliance_rate() {
        let (ledger, _) = ledger_with_clock();
        ledger
            .record_consent("u1", "analytics", true, ConsentOptions::default())
            .await
            .unwrap();
        ledger
            .record_consent("u2", "analytics", true, ConsentOptions::default())
            .await
            .unwrap();
        ledger
            .record_consent("u2", "marketing", false, ConsentOptions::default())
            .await
            .unwrap();

        let stats = ledger.get_consent_stats().await;
        assert_eq!(stats.total_users, 2);
        assert_eq!(stats.total_records, 3);
        assert!((stats.compliance_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(stats.by_purpose["analytics"].granted, 2);
        assert_eq!(stats.by_purpose["marketing"].denied, 1);
    }

    #[tokio::test]
    async fn test_delete_and_anonymize() {
        let (ledger, _) = ledger_with_clock();
        ledger
            .record_consent("u1", "analytics", true, ConsentOptions::default())
            .await
            .unwrap();
        ledger
            .record_consent("u2", "analytics", true, ConsentOptions::default())
            .await
            .unwrap();

        assert_eq!(ledger.delete_user_consents("u1").await, 1);
        assert!(ledger.get_user_consents("u1").await.is_empty());

        assert_eq!(ledger.anonymize_user_consents("u2", "anon_1").await, 1);
        assert!(ledger.get_user_consents("u2").await.is_empty());
        let anonymized = ledger.get_user_consents("anon_1").await;
        assert_eq!(anonymized[0].user_id, "anon_1");
    }
}
