//! GDPR Compliance
//!
//! このモジュールは、GDPR（EU一般データ保護規則）に準拠したデータ層のための
//! コンプライアンス機能を提供します。
//!
//! ## 主要機能
//!
//! - **同意管理**: 目的ごとの同意記録、撤回、有効期限、履歴
//! - **データ主体権利**: アクセス権（エクスポート）、削除権（物理削除・匿名化）、訂正権
//! - **データ保持**: ISO-8601 期間による保持ポリシーと定期削除
//!
//! ## 使用例
//!
//! ```rust
//! use compliance_store::compliance::{ConsentLedger, ConsentOptions};
//! use compliance_store::config::ConsentConfig;
//!
//! # async fn example() -> compliance_store::Result<()> {
//! let ledger = ConsentLedger::new(&ConsentConfig::default())?;
//!
//! ledger
//!     .record_consent("user-1", "analytics", true, ConsentOptions::default())
//!     .await?;
//! assert!(ledger.check_consent("user-1", "analytics").await?);
//! # Ok(())
//! # }
//! ```

pub mod consent_ledger;
pub mod data_subject_rights;
pub mod retention;
pub mod types;

pub use consent_ledger::{ConsentLedger, ConsentStats, PurposeStats};
pub use data_subject_rights::{
    certificate_signature, verify_certificate, RightsOrchestrator, UserDataSource,
};
pub use retention::{parse_iso8601_duration, RetentionManager, RetentionReport};
pub use types::*;
