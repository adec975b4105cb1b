//! フィールド単位の暗号化・復号化
//! AES-256-GCMによる暗号化と、PBKDF2-HMAC-SHA256によるコンテキスト別キー導出を実装

#![allow(deprecated)] // generic-array v1.x移行中の一時的対応

use crate::config::EncryptionConfig;
use crate::error::{EncryptionError, Error, Result};
use crate::store::Record;
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose, Engine as _};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use zeroize::Zeroizing;

/// エンティティに付与される暗号化メタデータのキー
pub const ENCRYPTION_BLOCK: &str = "_encryption";

/// AES-GCM のノンス長
const NONCE_LEN: usize = 12;

/// 個人情報とみなすフィールド名（部分一致）
const SENSITIVE_FIELD_PATTERNS: &[&str] = &[
    "password",
    "secret",
    "token",
    "ssn",
    "social_security",
    "credit_card",
    "card_number",
    "cvv",
    "iban",
    "bank_account",
    "tax_id",
    "passport",
    "email",
    "phone",
    "address",
    "birth",
    "dob",
];

/// 暗号化されたフィールド値
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionEnvelope {
    /// 暗号化アルゴリズム
    pub algorithm: String,
    /// ノンス（Base64エンコード）
    pub iv: String,
    /// 暗号文と認証タグ（Base64エンコード）
    pub ciphertext: String,
    /// キー導出に使ったコンテキスト（"table.field"）
    pub key_context: String,
}

impl EncryptionEnvelope {
    /// 値がエンベロープの形をしているか
    pub fn is_envelope(value: &Value) -> bool {
        match value.as_object() {
            Some(obj) => ["algorithm", "iv", "ciphertext", "keyContext"]
                .iter()
                .all(|k| obj.get(*k).map(Value::is_string).unwrap_or(false)),
            None => false,
        }
    }
}

/// エンティティの暗号化メタデータ
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionBlock {
    /// 暗号化されたフィールド
    pub fields: Vec<String>,
    pub algorithm: String,
}

impl EncryptionBlock {
    /// レコードから暗号化メタデータを読み取る
    pub fn from_record(record: &Record) -> Option<Self> {
        record
            .get(ENCRYPTION_BLOCK)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// 既存のメタデータとフィールドを統合
    pub fn merge(&mut self, other: &EncryptionBlock) {
        let fields: BTreeSet<String> = self
            .fields
            .iter()
            .chain(other.fields.iter())
            .cloned()
            .collect();
        self.fields = fields.into_iter().collect();
    }
}

/// 導出済みキー（破棄時にゼロ化）
type DerivedKey = Arc<Zeroizing<[u8; 32]>>;

/// フィールド暗号化サービス
pub struct EncryptionService {
    config: EncryptionConfig,
    master_key: Option<SecretString>,
    /// コンテキスト → 導出済みキー
    key_cache: Arc<RwLock<HashMap<String, DerivedKey>>>,
}

impl EncryptionService {
    /// 設定からサービスを作成（有効時はマスターキーを環境変数から読み込む）
    pub fn new(config: EncryptionConfig) -> Result<Self> {
        if !config.enabled {
            return Ok(Self::disabled());
        }
        let master_key = std::env::var(&config.master_key_env).map_err(|_| {
            Error::Config(format!(
                "encryption is enabled but {} is not set",
                config.master_key_env
            ))
        })?;
        Self::with_master_key(config, SecretString::from(master_key))
    }

    /// マスターキーを直接指定して作成
    pub fn with_master_key(config: EncryptionConfig, master_key: SecretString) -> Result<Self> {
        if master_key.expose_secret().is_empty() {
            return Err(Error::Config("master key must not be empty".to_string()));
        }
        if config.algorithm != "aes-256-gcm" {
            return Err(Error::Config(format!(
                "unsupported encryption algorithm: {}",
                config.algorithm
            )));
        }
        Ok(Self {
            config,
            master_key: Some(master_key),
            key_cache: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// 何もしない（素通しの）サービス
    pub fn disabled() -> Self {
        Self {
            config: EncryptionConfig::default(),
            master_key: None,
            key_cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.master_key.is_some()
    }

    /// テーブルの暗号化対象フィールド
    pub fn fields_for(&self, table: &str) -> &[String] {
        self.config
            .encrypted_fields
            .get(table)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// フィールド名が個人情報らしいか（部分一致）
    pub fn should_encrypt_field(field_name: &str) -> bool {
        let name = field_name.to_lowercase();
        SENSITIVE_FIELD_PATTERNS.iter().any(|p| name.contains(p))
    }

    /// コンテキスト別のキーを取得（未導出ならブロッキングプールで導出）
    async fn key_for(&self, context: &str) -> Result<DerivedKey> {
        if let Some(key) = self.key_cache.read().await.get(context) {
            return Ok(Arc::clone(key));
        }

        let master_key = self
            .master_key
            .as_ref()
            .ok_or_else(|| EncryptionError::KeyDerivationFailed("暗号化が無効です".to_string()))?;
        let password = Zeroizing::new(master_key.expose_secret().as_bytes().to_vec());
        let salt = context.as_bytes().to_vec();
        let iterations = self.config.key_derivation_iterations;

        let derived = tokio::task::spawn_blocking(move || derive_key(&password, &salt, iterations))
            .await
            .map_err(|e| EncryptionError::KeyDerivationFailed(e.to_string()))?;
        let key: DerivedKey = Arc::new(derived);

        let mut cache = self.key_cache.write().await;
        let key = Arc::clone(cache.entry(context.to_string()).or_insert(key));
        debug!(context, "encryption key derived");
        Ok(key)
    }

    /// 値を暗号化（無効時または null はそのまま返す）
    pub async fn encrypt_field(&self, value: &Value, context: &str) -> Result<Value> {
        if !self.is_enabled() || value.is_null() {
            return Ok(value.clone());
        }

        let key = self.key_for(context).await?;
        let plaintext = Zeroizing::new(serde_json::to_vec(value)?);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_slice()));
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext.as_slice(),
                    aad: context.as_bytes(),
                },
            )
            .map_err(|e| EncryptionError::EncryptionFailed(e.to_string()))?;

        let envelope = EncryptionEnvelope {
            algorithm: self.config.algorithm.clone(),
            iv: general_purpose::STANDARD.encode(nonce),
            ciphertext: general_purpose::STANDARD.encode(ciphertext),
            key_context: context.to_string(),
        };
        Ok(serde_json::to_value(envelope)?)
    }

    /// エンベロープを復号化（エンベロープ以外はそのまま返す）
    pub async fn decrypt_field(&self, value: &Value) -> Result<Value> {
        if !self.is_enabled() || !EncryptionEnvelope::is_envelope(value) {
            return Ok(value.clone());
        }

        let envelope: EncryptionEnvelope = serde_json::from_value(value.clone())
            .map_err(|e| EncryptionError::MalformedEnvelope(e.to_string()))?;
        let nonce_bytes = general_purpose::STANDARD
            .decode(&envelope.iv)
            .map_err(|e| EncryptionError::Base64DecodeError(e.to_string()))?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(EncryptionError::MalformedEnvelope("無効なノンスサイズです".to_string()).into());
        }
        let ciphertext = general_purpose::STANDARD
            .decode(&envelope.ciphertext)
            .map_err(|e| EncryptionError::Base64DecodeError(e.to_string()))?;

        let key = self.key_for(&envelope.key_context).await?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_slice()));
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(
                    Nonce::from_slice(&nonce_bytes),
                    Payload {
                        msg: ciphertext.as_slice(),
                        aad: envelope.key_context.as_bytes(),
                    },
                )
                .map_err(|e| EncryptionError::DecryptionFailed(e.to_string()))?,
        );

        match serde_json::from_slice(&plaintext) {
            Ok(value) => Ok(value),
            Err(_) => {
                let raw = String::from_utf8(plaintext.to_vec()).map_err(|e| {
                    EncryptionError::DecryptionFailed(format!("UTF-8変換エラー: {}", e))
                })?;
                Ok(Value::String(raw))
            }
        }
    }

    /// 指定フィールドを暗号化し `_encryption` ブロックを付与
    pub async fn encrypt_entity(
        &self,
        table: &str,
        record: &Record,
        fields: &[String],
    ) -> Result<Record> {
        if !self.is_enabled() || fields.is_empty() {
            return Ok(record.clone());
        }

        let mut encrypted = record.clone();
        let mut enveloped = Vec::new();
        for field in fields {
            let Some(value) = record.get(field) else {
                continue;
            };
            if value.is_null() || EncryptionEnvelope::is_envelope(value) {
                continue;
            }
            let context = format!("{}.{}", table, field);
            encrypted.insert(field.clone(), self.encrypt_field(value, &context).await?);
            enveloped.push(field.clone());
        }

        if !enveloped.is_empty() {
            let mut block = EncryptionBlock {
                fields: enveloped,
                algorithm: self.config.algorithm.clone(),
            };
            if let Some(existing) = EncryptionBlock::from_record(record) {
                block.merge(&existing);
            }
            encrypted.insert(ENCRYPTION_BLOCK.to_string(), serde_json::to_value(block)?);
        }
        Ok(encrypted)
    }

    /// `_encryption` ブロックに従って復号化し、ブロックを取り除く
    pub async fn decrypt_entity(&self, record: &Record) -> Result<Record> {
        let Some(block) = EncryptionBlock::from_record(record) else {
            return Ok(record.clone());
        };
        if !self.is_enabled() {
            return Ok(record.clone());
        }

        let mut decrypted = record.clone();
        for field in &block.fields {
            if let Some(value) = record.get(field) {
                decrypted.insert(field.clone(), self.decrypt_field(value).await?);
            }
        }
        decrypted.remove(ENCRYPTION_BLOCK);
        Ok(decrypted)
    }

    /// キャッシュ済みキーを破棄
    pub async fn clear_key_cache(&self) {
        self.key_cache.write().await.clear();
    }

    pub async fn cached_key_count(&self) -> usize {
        self.key_cache.read().await.len()
    }
}

// Debugトレイトでマスターキーを露出しないようにカスタム実装
impl fmt::Debug for EncryptionService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionService")
            .field("enabled", &self.is_enabled())
            .field("algorithm", &self.config.algorithm)
            .field("master_key", &"[REDACTED]")
            .finish()
    }
}

/// PBKDF2-HMAC-SHA256 でキーを導出
fn derive_key(password: &[u8], salt: &[u8], iterations: u32) -> Zeroizing<[u8; 32]> {
    use pbkdf2::pbkdf2_hmac_array;
    use sha2::Sha256;

    Zeroizing::new(pbkdf2_hmac_array::<Sha256, 32>(password, salt, iterations))
}
