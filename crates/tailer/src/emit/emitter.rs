//! Emitter — turns parsed lines into labeled entries and hands them to
//! the downstream channel.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::entry::{LabelSet, LogEntry};
use super::relabel::RelabelPipeline;
use crate::frame::{ParsedLine, StreamTag};
use crate::metrics::TargetMetrics;

/// Per-entry label carrying the originating stream.
pub const STREAM_LABEL: &str = "__meta_docker_container_log_stream";
/// Per-target label carrying the container id.
pub const CONTAINER_ID_LABEL: &str = "__meta_docker_container_id";
/// Per-target label carrying the container name.
pub const CONTAINER_NAME_LABEL: &str = "__meta_docker_container_name";

/// Outcome of a single [`Emitter::emit`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forwarded {
    Sent,
    /// Relabeling dropped the entry or left it without labels.
    Dropped,
    /// The receiver stayed full for longer than the send timeout.
    TimedOut,
    /// The receiver is gone.
    Closed,
}

impl Forwarded {
    /// Whether the position may advance past this line.
    pub fn is_settled(self) -> bool {
        matches!(self, Forwarded::Sent | Forwarded::Dropped | Forwarded::TimedOut)
    }
}

pub struct Emitter {
    pipeline: Arc<dyn RelabelPipeline>,
    sender: mpsc::Sender<LogEntry>,
    send_timeout: Duration,
}

impl Emitter {
    pub fn new(
        pipeline: Arc<dyn RelabelPipeline>,
        sender: mpsc::Sender<LogEntry>,
        send_timeout: Duration,
    ) -> Self {
        Self {
            pipeline,
            sender,
            send_timeout,
        }
    }

    /// Build an emitter together with the bounded receiving end.
    pub fn channel(
        pipeline: Arc<dyn RelabelPipeline>,
        capacity: usize,
        send_timeout: Duration,
    ) -> (Self, mpsc::Receiver<LogEntry>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(pipeline, tx, send_timeout), rx)
    }

    /// Final label set for a line on `stream`, or `None` if it must be dropped.
    pub fn labels_for(&self, base: &LabelSet, stream: StreamTag) -> Option<LabelSet> {
        let mut labels = base.clone();
        labels.insert(STREAM_LABEL, stream.as_str());
        let mut labels = self.pipeline.process(labels)?;
        labels.strip_internal();
        (!labels.is_empty()).then_some(labels)
    }

    pub async fn emit(
        &self,
        container_id: &str,
        base: &LabelSet,
        line: ParsedLine,
        metrics: &TargetMetrics,
    ) -> Forwarded {
        let Some(labels) = self.labels_for(base, line.stream) else {
            metrics.inc_relabel_dropped();
            debug!(container = %container_id, "Entry dropped by relabeling");
            return Forwarded::Dropped;
        };

        let entry = LogEntry::new(line.timestamp, line.text, line.stream, labels);
        match timeout(self.send_timeout, self.sender.send(entry)).await {
            Ok(Ok(())) => Forwarded::Sent,
            Ok(Err(_)) => {
                metrics.inc_forward_dropped();
                warn!(container = %container_id, "Entry receiver closed, dropping entry");
                Forwarded::Closed
            }
            Err(_) => {
                metrics.inc_forward_dropped();
                warn!(
                    container = %container_id,
                    timeout_ms = self.send_timeout.as_millis() as u64,
                    "Entry receiver is full, dropping entry"
                );
                Forwarded::TimedOut
            }
        }
    }
}
