//! # compliance-store
//!
//! GDPR-aware data layer: a keyed entity cache with reactive subscriptions and a
//! write-coalescing queue in front of a persistence backend, plus consent,
//! audit, field-encryption, retention and data-subject-rights services.
//!
//! ```no_run
//! use compliance_store::{ComplianceStore, MemoryPersistence, StoreConfig};
//! use std::sync::Arc;
//!
//! # async fn example() -> compliance_store::Result<()> {
//! let store = ComplianceStore::new(StoreConfig::default(), Arc::new(MemoryPersistence::new()))?;
//! store.initialize().await?;
//!
//! let mut user = serde_json::Map::new();
//! user.insert("name".into(), "Ada".into());
//! store.set("users", "u1", user).await?;
//!
//! store.flush().await?;
//! store.destroy().await;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod compliance;
pub mod config;
pub mod error;
pub mod facade;
pub mod logging;
pub mod persistence;
pub mod queue;
pub mod security;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigLoader, StoreConfig};
pub use error::{EncryptionError, Error, Result, StorageErrorCode};
pub use facade::{ComplianceStore, ComplianceStoreBuilder, DataHooks, GdprHooks};
pub use persistence::{MemoryPersistence, PersistenceAdapter, RecordFilter};
pub use store::{Entity, EntityKey, EntityStore, Record, Subscription};
