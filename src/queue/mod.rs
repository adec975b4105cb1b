//! Write-behind queue between the store and persistence.

pub mod metrics;
pub mod write_queue;

pub use self::metrics::QueueMetrics;
pub use self::write_queue::{FlushFailure, FlushReport, WriteQueue};
