//! Metrics collection for the streaming session
//!
//! Tracks chunk delivery, delivery gaps, reconnects, upload outcomes, and a
//! bounded error history. Used for the CLI status output and diagnostics.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::streaming::StreamStats;

/// Maximum number of errors to retain in history
const MAX_ERROR_HISTORY: usize = 20;

/// Counters accumulated over the life of a session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionStats {
    /// Live chunks delivered to the channel
    pub chunks_sent: u64,
    /// Live chunks lost to delivery gaps (reported, never silent)
    pub chunks_dropped: u64,
    /// Completed live streams (start..end-of-stream)
    pub streams_completed: u64,
    /// Reconnection attempts made by the channel
    pub reconnect_attempts: u64,
    /// Uploads started
    pub uploads_started: u64,
    /// Uploads the backend reported completed
    pub uploads_completed: u64,
    /// Uploads that failed locally or at the backend
    pub uploads_failed: u64,
}

/// Record of an error that occurred during operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Unix timestamp when the error occurred (seconds)
    pub timestamp: u64,
    /// Component that produced it (e.g. "capture", "transport", "upload")
    pub component: String,
    /// Human-readable error message
    pub message: String,
}

/// Point-in-time summary for display
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub stats: SessionStats,
    pub last_error: Option<ErrorRecord>,
}

/// Collects session metrics.
///
/// Not internally synchronized; the session wraps it in `Arc<Mutex<>>`.
pub struct MetricsCollector {
    stats: SessionStats,
    errors: VecDeque<ErrorRecord>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            stats: SessionStats::default(),
            errors: VecDeque::with_capacity(MAX_ERROR_HISTORY),
        }
    }

    /// Record a finished live stream.
    ///
    /// Dropped chunks are counted as the gaps were reported, not here, so
    /// the stream total only contributes its delivered count.
    pub fn record_stream(&mut self, stats: StreamStats) {
        self.stats.chunks_sent += stats.chunks_sent;
        self.stats.streams_completed += 1;
    }

    /// Record chunks lost to a delivery gap.
    pub fn record_gap(&mut self, dropped: u64) {
        self.stats.chunks_dropped += dropped;
    }

    /// Record a channel reconnection attempt.
    pub fn record_reconnect(&mut self) {
        self.stats.reconnect_attempts += 1;
    }

    pub fn upload_started(&mut self) {
        self.stats.uploads_started += 1;
    }

    pub fn upload_completed(&mut self) {
        self.stats.uploads_completed += 1;
    }

    pub fn upload_failed(&mut self) {
        self.stats.uploads_failed += 1;
    }

    /// Record an error, evicting the oldest once the history is full.
    pub fn record_error(&mut self, component: &str, message: &str) {
        if self.errors.len() >= MAX_ERROR_HISTORY {
            self.errors.pop_front();
        }

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        self.errors.push_back(ErrorRecord {
            timestamp,
            component: component.to_string(),
            message: message.to_string(),
        });
    }

    pub fn errors(&self) -> impl Iterator<Item = &ErrorRecord> {
        self.errors.iter()
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            stats: self.stats.clone(),
            last_error: self.errors.back().cloned(),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_and_gap_counters_accumulate() {
        let mut metrics = MetricsCollector::new();

        metrics.record_gap(2);
        metrics.record_stream(StreamStats {
            chunks_sent: 10,
            chunks_dropped: 2,
        });

        let summary = metrics.summary();
        assert_eq!(summary.stats.chunks_sent, 10);
        assert_eq!(summary.stats.chunks_dropped, 2);
        assert_eq!(summary.stats.streams_completed, 1);
    }

    #[test]
    fn upload_counters() {
        let mut metrics = MetricsCollector::new();
        metrics.upload_started();
        metrics.upload_started();
        metrics.upload_completed();
        metrics.upload_failed();

        let stats = metrics.summary().stats;
        assert_eq!(stats.uploads_started, 2);
        assert_eq!(stats.uploads_completed, 1);
        assert_eq!(stats.uploads_failed, 1);
    }

    #[test]
    fn error_history_is_bounded() {
        let mut metrics = MetricsCollector::new();
        for i in 0..(MAX_ERROR_HISTORY + 5) {
            metrics.record_error("transport", &format!("error {}", i));
        }

        assert_eq!(metrics.errors().count(), MAX_ERROR_HISTORY);
        // The newest record survives eviction
        let summary = metrics.summary();
        assert!(summary
            .last_error
            .unwrap()
            .message
            .contains(&format!("error {}", MAX_ERROR_HISTORY + 4)));
    }

    #[test]
    fn summary_without_errors_has_no_last_error() {
        let metrics = MetricsCollector::new();
        assert!(metrics.summary().last_error.is_none());
    }
}
