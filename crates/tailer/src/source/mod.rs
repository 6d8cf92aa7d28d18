//! Source — capability interface over the container runtime daemon.
//!
//! The tailing core only needs two calls: inspect a container and open its
//! raw log stream. `live.rs` provides the Docker-backed implementation,
//! `fake.rs` an in-memory test double.

pub mod error;
pub mod fake;
pub mod live;

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio_stream::Stream;

pub use error::SourceError;
pub use fake::{FakeContainer, FakeLogLine, FakeSource};
pub use live::DockerClient;

/// Raw log bytes in arrival order, unaware of frame or line boundaries.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, SourceError>> + Send>>;

/// What the tailer needs to know about a container before reading it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerStatus {
    pub exists: bool,
    /// TTY containers send raw newline-delimited logs without frame headers.
    pub tty: bool,
    pub running: bool,
}

impl ContainerStatus {
    pub fn gone() -> Self {
        Self {
            exists: false,
            tty: false,
            running: false,
        }
    }
}

/// Parameters of one streaming read. stdout, stderr and per-line
/// timestamps are always requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogsRequest {
    pub container_id: String,
    /// `None` reads from the beginning of the container's log.
    pub since: Option<DateTime<Utc>>,
    pub follow: bool,
}

impl LogsRequest {
    pub fn follow(container_id: &str, since: Option<DateTime<Utc>>) -> Self {
        Self {
            container_id: container_id.to_string(),
            since,
            follow: true,
        }
    }

    /// `since` query value: Unix seconds with a nanosecond fraction, or
    /// `0` for the epoch.
    pub fn since_param(&self) -> String {
        match self.since {
            Some(ts) => format!("{}.{:09}", ts.timestamp(), ts.timestamp_subsec_nanos()),
            None => "0".to_string(),
        }
    }
}

/// Async interface over the runtime daemon.
///
/// Object-safe thanks to `Pin<Box<…>>` returns; implementations must be
/// `Send + Sync` so every target task can share one `Arc<dyn LogSource>`.
pub trait LogSource: Send + Sync {
    fn inspect<'a>(
        &'a self,
        container_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<ContainerStatus, SourceError>> + Send + 'a>>;

    fn stream_logs(
        &self,
        request: LogsRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ByteStream, SourceError>> + Send + '_>>;
}
