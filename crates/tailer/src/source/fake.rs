//! Fake — test double for the runtime daemon.
//!
//! Provides a deterministic [`FakeSource`] that implements [`LogSource`]
//! from in-memory containers. Log bytes are rendered exactly as the daemon
//! sends them (timestamp prefix, multiplexed frames unless TTY) so the
//! whole demux path is exercised.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use tokio::sync::Mutex;
use tokio_stream::StreamExt;

use super::error::SourceError;
use super::{ByteStream, ContainerStatus, LogSource, LogsRequest};
use crate::frame::{encode_frame, StreamTag};

// ── In-memory state ─────────────────────────────────────────────

/// A canned log line for the fake store.
#[derive(Clone, Debug)]
pub struct FakeLogLine {
    pub timestamp: DateTime<Utc>,
    pub stream: StreamTag,
    pub text: String,
    /// Render without the timestamp prefix. `timestamp` still decides
    /// whether a `since` request replays the line.
    pub unstamped: bool,
}

impl FakeLogLine {
    pub fn new(timestamp: DateTime<Utc>, stream: StreamTag, text: &str) -> Self {
        Self {
            timestamp,
            stream,
            text: text.to_string(),
            unstamped: false,
        }
    }

    pub fn stdout(timestamp: DateTime<Utc>, text: &str) -> Self {
        Self::new(timestamp, StreamTag::Stdout, text)
    }

    /// A line whose timestamp prefix the reader cannot parse.
    pub fn unstamped(timestamp: DateTime<Utc>, text: &str) -> Self {
        Self {
            unstamped: true,
            ..Self::stdout(timestamp, text)
        }
    }

    fn render(&self) -> String {
        if self.unstamped {
            return format!("{}\n", self.text);
        }
        format!(
            "{} {}\n",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
            self.text
        )
    }
}

/// A canned container for the fake store.
#[derive(Clone, Debug, Default)]
pub struct FakeContainer {
    pub tty: bool,
    pub running: bool,
    pub logs: Vec<FakeLogLine>,
    /// Split the rendered bytes into chunks of this size.
    pub chunk_size: Option<usize>,
    /// End the stream after the canned logs instead of following forever.
    pub end_after_logs: bool,
}

impl FakeContainer {
    pub fn running(logs: Vec<FakeLogLine>) -> Self {
        Self {
            running: true,
            logs,
            ..Default::default()
        }
    }

    /// Bytes the daemon would send for `since`. Like the daemon, `since`
    /// is inclusive.
    fn render(&self, since: Option<DateTime<Utc>>) -> Vec<u8> {
        let mut out = Vec::new();
        for line in self
            .logs
            .iter()
            .filter(|l| since.map_or(true, |s| l.timestamp >= s))
        {
            let text = line.render();
            if self.tty {
                out.extend_from_slice(text.as_bytes());
            } else {
                out.extend(encode_frame(line.stream, text.as_bytes()));
            }
        }
        out
    }
}

/// Mutable inner state protected by a mutex.
#[derive(Default)]
struct Inner {
    containers: HashMap<String, FakeContainer>,
    stream_failures: u32,
    requests: Vec<LogsRequest>,
}

/// A fake runtime daemon for deterministic testing.
pub struct FakeSource {
    inner: Mutex<Inner>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Seed a container into the fake store.
    pub async fn add_container(&self, id: &str, container: FakeContainer) {
        self.inner
            .lock()
            .await
            .containers
            .insert(id.to_string(), container);
    }

    /// Append lines to a container's log, as if it kept writing.
    pub async fn push_logs(&self, id: &str, logs: Vec<FakeLogLine>) {
        if let Some(container) = self.inner.lock().await.containers.get_mut(id) {
            container.logs.extend(logs);
        }
    }

    pub async fn remove_container(&self, id: &str) {
        self.inner.lock().await.containers.remove(id);
    }

    /// Make the next `n` log stream calls fail with a connection error.
    pub async fn fail_next_streams(&self, n: u32) {
        self.inner.lock().await.stream_failures = n;
    }

    /// Every log stream request received so far, in order.
    pub async fn requests(&self) -> Vec<LogsRequest> {
        self.inner.lock().await.requests.clone()
    }
}

impl Default for FakeSource {
    fn default() -> Self {
        Self::new()
    }
}

// ── LogSource implementation ────────────────────────────────────

impl LogSource for FakeSource {
    fn inspect<'a>(
        &'a self,
        container_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<ContainerStatus, SourceError>> + Send + 'a>> {
        Box::pin(async move {
            let state = self.inner.lock().await;
            Ok(match state.containers.get(container_id) {
                Some(c) => ContainerStatus {
                    exists: true,
                    tty: c.tty,
                    running: c.running,
                },
                None => ContainerStatus::gone(),
            })
        })
    }

    fn stream_logs(
        &self,
        request: LogsRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ByteStream, SourceError>> + Send + '_>> {
        Box::pin(async move {
            let mut state = self.inner.lock().await;
            state.requests.push(request.clone());

            if state.stream_failures > 0 {
                state.stream_failures -= 1;
                return Err(SourceError::ConnectionFailed(
                    "connection refused".to_string(),
                ));
            }

            let container = state
                .containers
                .get(&request.container_id)
                .ok_or_else(|| SourceError::ContainerNotFound(request.container_id.clone()))?;

            let data = container.render(request.since);
            let chunk_size = container.chunk_size.unwrap_or(data.len()).max(1);
            let chunks: Vec<Result<Bytes, SourceError>> = data
                .chunks(chunk_size)
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect();

            let stream = tokio_stream::iter(chunks);
            let stream: ByteStream = if container.end_after_logs || !request.follow {
                Box::pin(stream)
            } else {
                Box::pin(stream.chain(tokio_stream::pending()))
            };
            Ok(stream)
        })
    }
}
