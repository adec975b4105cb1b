//! Error types for the compliance data layer.

use serde::Serialize;
use thiserror::Error;

/// Result type alias for data layer operations
pub type Result<T> = std::result::Result<T, Error>;

/// Machine-readable storage error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageErrorCode {
    /// Entity does not exist (update/delete on a missing key)
    EntityNotFound,
    /// Persistence collaborator or store backend failed
    BackendFailure,
}

impl StorageErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageErrorCode::EntityNotFound => "ENTITY_NOT_FOUND",
            StorageErrorCode::BackendFailure => "BACKEND_FAILURE",
        }
    }
}

/// Error types for data layer operations
#[derive(Debug, Error)]
pub enum Error {
    /// Operation attempted before `initialize()` completed
    #[error("Data layer is not initialized: call initialize() first")]
    NotInitialized,

    /// Consent purpose is not registered
    #[error("Unknown consent purpose: {0}")]
    UnknownPurpose(String),

    /// Consent rule violation (withdrawal of required purpose, missing consent)
    #[error("Consent error: {0}")]
    Consent(String),

    /// Encryption/decryption/key derivation failure
    #[error("Encryption error: {0}")]
    Encryption(#[from] EncryptionError),

    /// Write queue failure after local validation
    #[error("Queue error: {0}")]
    Queue(String),

    /// Request-level data subject rights failure
    #[error("Data subject rights error ({request_type}): {message}")]
    DataSubjectRights {
        request_type: String,
        message: String,
        details: Option<serde_json::Value>,
    },

    /// Storage error with a machine-readable code
    #[error("Storage error [{}]: {message}", .code.as_str())]
    Storage {
        code: StorageErrorCode,
        message: String,
    },

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Validation error: {0}")]
    Validation(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotInitialized => "NOT_INITIALIZED",
            Error::UnknownPurpose(_) => "UNKNOWN_PURPOSE",
            Error::Consent(_) => "CONSENT_ERROR",
            Error::Encryption(_) => "ENCRYPTION_ERROR",
            Error::Queue(_) => "QUEUE_ERROR",
            Error::DataSubjectRights { .. } => "DATA_SUBJECT_RIGHTS_ERROR",
            Error::Storage { code, .. } => code.as_str(),
            Error::Config(_) => "CONFIG_ERROR",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::Json(_) => "JSON_ERROR",
        }
    }

    pub fn not_found(table: &str, id: &str) -> Self {
        Error::Storage {
            code: StorageErrorCode::EntityNotFound,
            message: format!("{}/{} not found", table, id),
        }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Error::Storage {
            code: StorageErrorCode::BackendFailure,
            message: message.into(),
        }
    }

    pub fn rights(request_type: &str, message: impl Into<String>) -> Self {
        Error::DataSubjectRights {
            request_type: request_type.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

/// 暗号化エラー
#[derive(Debug, Error)]
pub enum EncryptionError {
    #[error("暗号化に失敗しました: {0}")]
    EncryptionFailed(String),
    #[error("復号化に失敗しました: {0}")]
    DecryptionFailed(String),
    #[error("キー派生に失敗しました: {0}")]
    KeyDerivationFailed(String),
    #[error("Base64デコードに失敗しました: {0}")]
    Base64DecodeError(String),
    #[error("不正なエンベロープです: {0}")]
    MalformedEnvelope(String),
}
