//! Write queue metrics and tuning hints.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Rolling window size for batch samples
pub const SAMPLE_WINDOW: usize = 100;

/// Snapshot of queue metrics
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueueMetrics {
    /// Keys waiting for a flush
    pub pending: usize,
    /// Successful flushes
    pub total_processed: u64,
    /// Flushes that exhausted their retries, plus failed deletions
    pub errors: u64,
    pub average_batch_size: f64,
    pub average_processing_time_ms: f64,
    /// `processed / (processed + errors)`, 1.0 before any flush
    pub success_rate: f64,
    /// Samples currently in the rolling window
    pub samples: usize,
}

#[derive(Debug, Clone, Copy)]
struct BatchSample {
    batch_size: usize,
    processing_ms: f64,
}

#[derive(Debug, Default)]
pub(crate) struct MetricsRecorder {
    samples: VecDeque<BatchSample>,
    processed: u64,
    errors: u64,
}

impl MetricsRecorder {
    pub fn record_success(&mut self, batch_size: usize, processing_ms: f64) {
        if self.samples.len() == SAMPLE_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(BatchSample {
            batch_size,
            processing_ms,
        });
        self.processed += 1;

        #[cfg(feature = "metrics")]
        {
            metrics::counter!("compliance_store_queue_flushes_total").increment(1);
            metrics::histogram!("compliance_store_queue_batch_size").record(batch_size as f64);
            metrics::histogram!("compliance_store_queue_flush_ms").record(processing_ms);
        }
    }

    pub fn record_error(&mut self) {
        self.errors += 1;

        #[cfg(feature = "metrics")]
        metrics::counter!("compliance_store_queue_errors_total").increment(1);
    }

    pub fn snapshot(&self, pending: usize) -> QueueMetrics {
        let n = self.samples.len();
        let (batch_sum, time_sum) = self
            .samples
            .iter()
            .fold((0usize, 0f64), |(b, t), s| (b + s.batch_size, t + s.processing_ms));

        let total = self.processed + self.errors;
        QueueMetrics {
            pending,
            total_processed: self.processed,
            errors: self.errors,
            average_batch_size: if n == 0 { 0.0 } else { batch_sum as f64 / n as f64 },
            average_processing_time_ms: if n == 0 { 0.0 } else { time_sum / n as f64 },
            success_rate: if total == 0 {
                1.0
            } else {
                self.processed as f64 / total as f64
            },
            samples: n,
        }
    }
}

impl QueueMetrics {
    /// Threshold-based tuning recommendations
    pub fn performance_insights(&self) -> Vec<String> {
        let mut insights = Vec::new();

        if self.samples >= 10 && self.average_batch_size < 1.5 {
            insights.push(format!(
                "Average batch size is {:.2}: the batch window may be too small to coalesce writes",
                self.average_batch_size
            ));
        }
        if self.average_processing_time_ms > 1000.0 {
            insights.push(format!(
                "Average flush takes {:.0}ms: persistence is slow",
                self.average_processing_time_ms
            ));
        }
        if self.total_processed + self.errors > 0 && self.success_rate < 0.95 {
            insights.push(format!(
                "Success rate is {:.1}%: check persistence errors",
                self.success_rate * 100.0
            ));
        }
        if self.pending > 100 {
            insights.push(format!(
                "{} keys pending: the queue is building a backlog",
                self.pending
            ));
        }

        insights
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_is_bounded() {
        let mut recorder = MetricsRecorder::default();
        for i in 0..150 {
            recorder.record_success(if i < 50 { 100 } else { 2 }, 10.0);
        }
        let metrics = recorder.snapshot(0);
        assert_eq!(metrics.samples, SAMPLE_WINDOW);
        assert_eq!(metrics.total_processed, 150);
        assert!((metrics.average_batch_size - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_success_rate() {
        let mut recorder = MetricsRecorder::default();
        assert_eq!(recorder.snapshot(0).success_rate, 1.0);
        recorder.record_success(1, 1.0);
        recorder.record_success(1, 1.0);
        recorder.record_success(1, 1.0);
        recorder.record_error();
        assert!((recorder.snapshot(0).success_rate - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_insights() {
        let mut recorder = MetricsRecorder::default();
        for _ in 0..10 {
            recorder.record_success(1, 1500.0);
        }
        recorder.record_error();
        let insights = recorder.snapshot(150).performance_insights();
        assert_eq!(insights.len(), 4);

        let healthy = MetricsRecorder::default().snapshot(0).performance_insights();
        assert!(healthy.is_empty());
    }
}
