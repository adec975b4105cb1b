//! 監査ログとフィールド暗号化

pub mod audit_log;
pub mod encryption;

pub use audit_log::{
    AuditCategory, AuditEvent, AuditLog, AuditLogEntry, AuditQuery, AuditResult, AuditStatistics,
};
pub use encryption::{EncryptionBlock, EncryptionEnvelope, EncryptionService, ENCRYPTION_BLOCK};
