//! Read-path metrics for the facade.

use serde::{Deserialize, Serialize};

/// Snapshot of facade read statistics.
///
/// Only count, sum, min and max are tracked, so `p95_ms` and `p99_ms` are
/// approximations derived from the maximum rather than true percentiles.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryMetrics {
    pub total_queries: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub hit_ratio: f64,
    pub average_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

#[derive(Debug, Default)]
pub(crate) struct QueryRecorder {
    total: u64,
    hits: u64,
    misses: u64,
    sum_ms: f64,
    min_ms: Option<f64>,
    max_ms: f64,
}

impl QueryRecorder {
    pub fn record(&mut self, hit: bool, elapsed_ms: f64) {
        self.total += 1;
        if hit {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        self.sum_ms += elapsed_ms;
        self.min_ms = Some(self.min_ms.map_or(elapsed_ms, |m| m.min(elapsed_ms)));
        self.max_ms = self.max_ms.max(elapsed_ms);

        #[cfg(feature = "metrics")]
        {
            metrics::counter!(
                "compliance_store_reads_total",
                "result" => if hit { "hit" } else { "miss" }
            )
            .increment(1);
            metrics::histogram!("compliance_store_read_ms").record(elapsed_ms);
        }
    }

    pub fn snapshot(&self) -> QueryMetrics {
        if self.total == 0 {
            return QueryMetrics::default();
        }
        QueryMetrics {
            total_queries: self.total,
            cache_hits: self.hits,
            cache_misses: self.misses,
            hit_ratio: self.hits as f64 / self.total as f64,
            average_ms: self.sum_ms / self.total as f64,
            min_ms: self.min_ms.unwrap_or(0.0),
            max_ms: self.max_ms,
            p95_ms: self.max_ms * 0.95,
            p99_ms: self.max_ms * 0.99,
        }
    }
}
