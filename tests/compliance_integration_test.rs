//! GDPR Compliance Integration Tests

use chrono::Duration;
use compliance_store::compliance::*;
use compliance_store::config::ExportFormat;
use compliance_store::security::{AuditQuery, EncryptionEnvelope};
use compliance_store::{ComplianceStore, ManualClock, MemoryPersistence, PersistenceAdapter, Record, StoreConfig};
use secrecy::SecretString;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};

fn record(value: Value) -> Record {
    value.as_object().cloned().unwrap_or_default()
}

fn rights_config() -> StoreConfig {
    let mut config = StoreConfig::default();
    config.gdpr.rights.tables = vec!["users".to_string(), "posts".to_string()];
    config.update_queue.batch_window_ms = 20;
    config
}

async fn seeded_store(config: StoreConfig) -> (Arc<ComplianceStore>, Arc<MemoryPersistence>) {
    let persistence = Arc::new(MemoryPersistence::new());
    let store = Arc::new(ComplianceStore::new(config, persistence.clone()).unwrap());
    assert_ok!(store.initialize().await);

    store
        .set(
            "users",
            "u1",
            record(json!({"email": "alice@example.com", "name": "Alice", "plan": "pro"})),
        )
        .await
        .unwrap();
    store
        .set("posts", "p1", record(json!({"authorId": "u1", "title": "Hello", "bio": "about me"})))
        .await
        .unwrap();
    store
        .set("posts", "p2", record(json!({"authorId": "u2", "title": "Other"})))
        .await
        .unwrap();
    assert!(store.flush().await.unwrap().is_clean());

    store
        .consent()
        .record_consent("u1", "marketing", true, ConsentOptions::default())
        .await
        .unwrap();

    (store, persistence)
}

#[tokio::test]
async fn test_access_request_bundles_data_consent_and_audit() {
    let (store, _) = seeded_store(rights_config()).await;

    let export = store.handle_access_request("u1").await.unwrap();
    assert_eq!(export.user_id, "u1");
    assert_eq!(export.personal_data["users"].len(), 1);
    assert_eq!(export.personal_data["posts"].len(), 1);
    assert_eq!(export.personal_data["posts"][0].id, "p1");
    assert_eq!(export.metadata.record_count, 2);
    assert_eq!(export.consent_history.current[0].purpose_id, "marketing");
    assert!(export
        .audit_trail
        .iter()
        .any(|entry| entry.action == "dsr.export.requested"));

    let completed = store
        .audit()
        .query_logs(&AuditQuery {
            action: Some("dsr.export.completed".to_string()),
            ..Default::default()
        })
        .await;
    assert_eq!(completed.len(), 1);
    store.destroy().await;
}

#[tokio::test]
async fn test_anonymization_leaves_no_pii() {
    let (store, persistence) = seeded_store(rights_config()).await;

    let result = store
        .handle_erasure_request("u1", DeletionOptions::default())
        .await
        .unwrap();
    assert_eq!(result.method, DeletionMethod::Anonymize);
    assert_eq!(result.summary.anonymized_records, 2);
    assert_eq!(result.summary.consent_records_anonymized, 1);
    assert!(verify_certificate(&result.certificate));
    assert!(store.flush().await.unwrap().is_clean());

    let user = persistence.load("users", "u1").await.unwrap().unwrap();
    assert_eq!(user["email"], json!("[REDACTED]"));
    assert_eq!(user["name"], json!("[REDACTED]"));
    assert_eq!(user["plan"], json!("pro"));

    let post = persistence.load("posts", "p1").await.unwrap().unwrap();
    assert_eq!(post["bio"], json!("[REDACTED]"));
    assert!(post["authorId"].as_str().unwrap().starts_with("anon_"));

    let export = store.handle_access_request("u1").await.unwrap();
    assert!(export.personal_data["posts"].is_empty());
    let user = &export.personal_data["users"][0].data;
    for field in ["email", "name"] {
        assert_eq!(user[field], json!("[REDACTED]"));
    }
    assert!(export.consent_history.current.is_empty());
    store.destroy().await;
}

#[tokio::test]
async fn test_hard_delete_counts_match() {
    let (store, persistence) = seeded_store(rights_config()).await;
    let logs_before = store.audit().query_logs(&AuditQuery::for_user("u1")).await.len();

    let result = store
        .handle_erasure_request(
            "u1",
            DeletionOptions {
                hard_delete: true,
                reason: Some("account closed".to_string()),
            },
        )
        .await
        .unwrap();

    assert_eq!(result.summary.records_deleted, 2);
    assert_eq!(result.summary.consent_records_deleted, 1);
    // 受付エントリ1件が加わる
    assert_eq!(result.summary.audit_logs_deleted, logs_before + 1);
    assert_eq!(result.certificate.compliance.gdpr_article, "Article 17");

    assert!(persistence.load("users", "u1").await.unwrap().is_none());
    assert!(persistence.load("posts", "p1").await.unwrap().is_none());
    assert!(persistence.load("posts", "p2").await.unwrap().is_some());
    assert!(store.consent().get_user_consents("u1").await.is_empty());
    assert!(store
        .audit()
        .query_logs(&AuditQuery::for_user("u1"))
        .await
        .is_empty());

    // 完了記録は system として残る
    let completed = store
        .audit()
        .query_logs(&AuditQuery {
            action: Some("dsr.deletion.completed".to_string()),
            ..Default::default()
        })
        .await;
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].user_id, "system");
    store.destroy().await;
}

#[tokio::test]
async fn test_rectification_rejects_invalid_email() {
    let (store, persistence) = seeded_store(rights_config()).await;
    let corrections: Corrections = serde_json::from_value(json!({
        "users": { "u1": { "email": "not-an-email" } }
    }))
    .unwrap();

    let result = assert_ok!(store.handle_rectification_request("u1", corrections).await);
    assert_eq!(result.fields_updated, 0);
    assert_eq!(result.validation_errors.len(), 1);
    assert_eq!(result.validation_errors[0].path(), "users.email");

    let user = persistence.load("users", "u1").await.unwrap().unwrap();
    assert_eq!(user["email"], json!("alice@example.com"));
    store.destroy().await;
}

#[tokio::test]
async fn test_rectification_with_encrypted_fields() {
    let mut config = rights_config();
    config.gdpr.encryption.enabled = true;
    config.gdpr.encryption.key_derivation_iterations = 1_000;
    config
        .gdpr
        .encryption
        .encrypted_fields
        .insert("users".to_string(), vec!["email".to_string()]);

    let persistence = Arc::new(MemoryPersistence::new());
    let store = Arc::new(
        ComplianceStore::builder(config)
            .persistence(persistence.clone())
            .master_key(SecretString::from("integration-master-key".to_string()))
            .build()
            .unwrap(),
    );
    store.initialize().await.unwrap();

    store
        .set("users", "u1", record(json!({"email": "old@example.com", "name": "Alice"})))
        .await
        .unwrap();
    let corrections: Corrections = serde_json::from_value(json!({
        "users": { "u1": { "email": "new@example.com" } }
    }))
    .unwrap();
    let result = store
        .handle_rectification_request("u1", corrections)
        .await
        .unwrap();
    assert_eq!(result.fields_updated, 1);
    assert_eq!(result.changes[0].before, json!("old@example.com"));
    assert!(store.flush().await.unwrap().is_clean());

    let at_rest = persistence.load("users", "u1").await.unwrap().unwrap();
    assert!(EncryptionEnvelope::is_envelope(&at_rest["email"]));
    assert_eq!(at_rest["name"], json!("Alice"));

    let plain = store.get("users", "u1").await.unwrap().unwrap();
    assert_eq!(plain["email"], json!("new@example.com"));
    store.destroy().await;
}

#[tokio::test]
async fn test_granted_consent_expires() {
    let clock = ManualClock::default();
    let ledger = ConsentLedger::with_clock(
        &compliance_store::config::ConsentConfig::default(),
        Arc::new(clock.clone()),
    )
    .unwrap();

    ledger
        .record_consent("u1", "marketing", true, ConsentOptions::default().with_expiry_days(0))
        .await
        .unwrap();
    clock.advance(Duration::seconds(1));

    assert!(!ledger.check_consent("u1", "marketing").await.unwrap());
    assert!(ledger.check_consent("u1", "essential").await.unwrap());
    assert_err!(ledger.withdraw_consent("u1", "essential").await);
}

#[tokio::test]
async fn test_audit_csv_export() {
    let (store, _) = seeded_store(rights_config()).await;
    let csv = store
        .audit()
        .export_logs(&AuditQuery::for_user("u1"), Some(ExportFormat::Csv))
        .await
        .unwrap();

    let mut lines = csv.lines();
    assert_eq!(
        lines.next(),
        Some("timestamp,userId,action,resource,resourceId,result,ipAddress,details")
    );
    assert!(lines.any(|line| line.contains("data.update") && line.contains("posts")));
    store.destroy().await;
}
