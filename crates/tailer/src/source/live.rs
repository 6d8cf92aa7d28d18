//! Live — `LogSource` backed by the Docker daemon.
//!
//! Inspect and events go through bollard. The log stream itself is read
//! with a plain HTTP/1 request so the multiplexed framing reaches the
//! demuxer untouched; bollard would decode the frames on its own.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bollard::models::{ContainerInspectResponse, EventMessage};
use bollard::Docker;
use bytes::Bytes;
use futures_util::stream::{Stream, StreamExt};
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::{header, Request, Response};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tracing::debug;

use super::error::SourceError;
use super::{ByteStream, ContainerStatus, LogSource, LogsRequest};

const DEFAULT_SOCKET: &str = "/var/run/docker.sock";
const REQUEST_TIMEOUT_SECS: u64 = 120;
/// Connect plus response headers for the raw log request. The body of a
/// follow stream is unbounded and is not covered.
const LOG_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Where the daemon listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(String),
    Tcp(String),
}

impl Endpoint {
    /// Accepts `""` (default socket), `unix:///path`, a bare socket path,
    /// `tcp://host:port` or `http://host:port`.
    pub fn parse(host: &str) -> Self {
        if host.is_empty() {
            return Endpoint::Unix(DEFAULT_SOCKET.to_string());
        }
        if let Some(path) = host.strip_prefix("unix://") {
            return Endpoint::Unix(path.to_string());
        }
        if let Some(addr) = host
            .strip_prefix("tcp://")
            .or_else(|| host.strip_prefix("http://"))
        {
            return Endpoint::Tcp(addr.trim_end_matches('/').to_string());
        }
        Endpoint::Unix(host.to_string())
    }
}

/// A container lifecycle event from the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEvent {
    pub id: String,
    pub name: String,
    pub action: String,
}

impl From<EventMessage> for ContainerEvent {
    fn from(event: EventMessage) -> Self {
        let actor = event.actor.unwrap_or_default();
        let name = actor
            .attributes
            .as_ref()
            .and_then(|attrs| attrs.get("name").cloned())
            .unwrap_or_default();
        Self {
            id: actor.id.unwrap_or_default(),
            name,
            action: event.action.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DockerClient {
    client: Docker,
    endpoint: Endpoint,
    response_timeout: Duration,
}

impl DockerClient {
    pub fn new(docker_host: &str) -> Result<Self, SourceError> {
        let endpoint = Endpoint::parse(docker_host);
        let client = match &endpoint {
            Endpoint::Unix(path) => {
                Docker::connect_with_socket(path, REQUEST_TIMEOUT_SECS, &bollard::API_DEFAULT_VERSION)
            }
            Endpoint::Tcp(addr) => {
                Docker::connect_with_http(addr, REQUEST_TIMEOUT_SECS, &bollard::API_DEFAULT_VERSION)
            }
        }
        .map_err(|e| SourceError::ConnectionFailed(e.to_string()))?;

        Ok(Self {
            client,
            endpoint,
            response_timeout: LOG_RESPONSE_TIMEOUT,
        })
    }

    /// Bound on connecting and receiving response headers for `/logs`.
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Inspect a container. A 404 is reported as a status, not an error.
    pub async fn inspect_container(&self, container_id: &str) -> Result<ContainerStatus, SourceError> {
        match self.client.inspect_container(container_id, None).await {
            Ok(details) => Ok(status_from_inspect(&details)),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {
                Ok(ContainerStatus::gone())
            }
            Err(e) => Err(SourceError::from(e)),
        }
    }

    /// Open `GET /containers/{id}/logs` and hand back the body as raw chunks.
    pub async fn open_log_stream(&self, request: LogsRequest) -> Result<ByteStream, SourceError> {
        let path = format!(
            "/containers/{}/logs?follow={}&stdout=true&stderr=true&timestamps=true&since={}",
            request.container_id,
            request.follow,
            request.since_param()
        );
        let response = tokio::time::timeout(self.response_timeout, self.get(&path))
            .await
            .map_err(|_| {
                SourceError::ConnectionFailed(format!(
                    "no response from {:?} within {:?}",
                    self.endpoint, self.response_timeout
                ))
            })??;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .into_body()
                .collect()
                .await
                .map(|collected| collected.to_bytes())
                .unwrap_or_default();
            return Err(SourceError::from_status(
                status.as_u16(),
                &request.container_id,
                error_message(&body),
            ));
        }

        let stream = response
            .into_body()
            .into_data_stream()
            .map(|chunk| chunk.map_err(|e| SourceError::StreamReset(e.to_string())));
        Ok(Box::pin(stream))
    }

    /// Stream container lifecycle events (start, restart, destroy, ...).
    pub fn container_events(&self) -> impl Stream<Item = Result<ContainerEvent, SourceError>> + '_ {
        use bollard::query_parameters::EventsOptionsBuilder;

        let mut filters = HashMap::new();
        filters.insert("type", vec!["container"]);

        let options = EventsOptionsBuilder::default().filters(&filters).build();

        self.client
            .events(Some(options))
            .map(|r| r.map(ContainerEvent::from).map_err(SourceError::from))
    }

    async fn get(&self, path: &str) -> Result<Response<Incoming>, SourceError> {
        let request = Request::get(path)
            .header(header::HOST, "docker")
            .body(Empty::<Bytes>::new())
            .map_err(connection_failed)?;

        match &self.endpoint {
            Endpoint::Unix(socket) => {
                let io = UnixStream::connect(socket).await.map_err(connection_failed)?;
                send(io, request).await
            }
            Endpoint::Tcp(addr) => {
                let io = TcpStream::connect(addr.as_str()).await.map_err(connection_failed)?;
                send(io, request).await
            }
        }
    }
}

impl LogSource for DockerClient {
    fn inspect<'a>(
        &'a self,
        container_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<ContainerStatus, SourceError>> + Send + 'a>> {
        Box::pin(self.inspect_container(container_id))
    }

    fn stream_logs(
        &self,
        request: LogsRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ByteStream, SourceError>> + Send + '_>> {
        Box::pin(self.open_log_stream(request))
    }
}

fn status_from_inspect(details: &ContainerInspectResponse) -> ContainerStatus {
    ContainerStatus {
        exists: true,
        tty: details
            .config
            .as_ref()
            .and_then(|c| c.tty)
            .unwrap_or(false),
        running: details
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false),
    }
}

/// The daemon reports errors as `{"message": "..."}`.
fn error_message(body: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| String::from_utf8_lossy(body).trim().to_string())
}

async fn send<S>(io: S, request: Request<Empty<Bytes>>) -> Result<Response<Incoming>, SourceError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, connection) = http1::handshake::<_, Empty<Bytes>>(TokioIo::new(io))
        .await
        .map_err(connection_failed)?;

    // Dropping the response body ends this task and releases the socket.
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!(error = %e, "Docker log connection closed with error");
        }
    });

    sender.send_request(request).await.map_err(connection_failed)
}

fn connection_failed(e: impl std::fmt::Display) -> SourceError {
    SourceError::ConnectionFailed(e.to_string())
}
