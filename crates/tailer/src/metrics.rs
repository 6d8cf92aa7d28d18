//! Metrics — per-target counters, readable as a serializable snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

/// Counters for one tailed container. All updates are `Relaxed`; readers
/// only ever see a best-effort snapshot.
#[derive(Debug, Default)]
pub struct TargetMetrics {
    lines_read: AtomicU64,
    stream_errors: AtomicU64,
    reconnects: AtomicU64,
    relabel_dropped: AtomicU64,
    frame_errors: AtomicU64,
    timestamp_fallbacks: AtomicU64,
    forward_dropped: AtomicU64,
    resume_skipped: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TargetMetricsSnapshot {
    pub container_id: String,
    pub lines_read: u64,
    pub stream_errors: u64,
    pub reconnects: u64,
    pub relabel_dropped: u64,
    pub frame_errors: u64,
    pub timestamp_fallbacks: u64,
    pub forward_dropped: u64,
    pub resume_skipped: u64,
}

impl TargetMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inc_lines_read(&self) {
        self.lines_read.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_stream_errors(&self) {
        self.stream_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_reconnects(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_relabel_dropped(&self) {
        self.relabel_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_frame_errors(&self) {
        self.frame_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_timestamp_fallbacks(&self) {
        self.timestamp_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_forward_dropped(&self) {
        self.forward_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_resume_skipped(&self) {
        self.resume_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, container_id: &str) -> TargetMetricsSnapshot {
        TargetMetricsSnapshot {
            container_id: container_id.to_string(),
            lines_read: self.lines_read.load(Ordering::Relaxed),
            stream_errors: self.stream_errors.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            relabel_dropped: self.relabel_dropped.load(Ordering::Relaxed),
            frame_errors: self.frame_errors.load(Ordering::Relaxed),
            timestamp_fallbacks: self.timestamp_fallbacks.load(Ordering::Relaxed),
            forward_dropped: self.forward_dropped.load(Ordering::Relaxed),
            resume_skipped: self.resume_skipped.load(Ordering::Relaxed),
        }
    }
}

/// Counters keyed by container id. Entries survive target restarts so
/// totals keep accumulating; they are removed together with the target.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    targets: DashMap<String, Arc<TargetMetrics>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_target(&self, container_id: &str) -> Arc<TargetMetrics> {
        self.targets
            .entry(container_id.to_string())
            .or_default()
            .clone()
    }

    pub fn remove(&self, container_id: &str) {
        self.targets.remove(container_id);
    }

    /// Snapshot of every target, ordered by container id.
    pub fn snapshot(&self) -> Vec<TargetMetricsSnapshot> {
        let mut all: Vec<_> = self
            .targets
            .iter()
            .map(|e| e.value().snapshot(e.key()))
            .collect();
        all.sort_by(|a, b| a.container_id.cmp(&b.container_id));
        all
    }
}
