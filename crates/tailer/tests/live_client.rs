//! Docker client against a mock daemon served over TCP.
//!
//! `/logs` answers with the first batch when asked for `since=0` and with
//! the second batch otherwise; inspect reports a non-TTY container.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Request;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use parking_lot::Mutex;
use tailer::conf::BackoffConfig;
use tailer::emit::{Emitter, LabelSet, LogEntry, NoRelabel};
use tailer::frame::{encode_frame, StreamTag};
use tailer::positions::Positions;
use tailer::source::{DockerClient, LogSource, LogsRequest, SourceError};
use tailer::target::{Target, TargetDeps, TargetExit, TargetSpec, TargetState};
use tailer::metrics::TargetMetrics;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;

const FIRST: [&str; 3] = [
    "2021-12-09T09:15:02.000000001Z GET /brand 503",
    "2021-12-09T09:15:03.000000001Z POST /next-generation 416",
    "2021-12-09T09:15:03.000000002Z HEAD /content/visionary 302",
];

const SECOND: [&str; 2] = [
    "2023-12-09T09:16:57.000000001Z DELETE /morph/exploit 500",
    "2023-12-09T09:16:57.000000002Z POST /revolutionize/mesh 401",
];

#[derive(Clone, Default)]
struct MockDaemon {
    queries: Arc<Mutex<Vec<String>>>,
}

impl MockDaemon {
    fn frames(lines: &[&str]) -> Vec<u8> {
        let mut out = Vec::new();
        for (i, line) in lines.iter().enumerate() {
            let stream = if i % 2 == 0 { StreamTag::Stdout } else { StreamTag::Stderr };
            out.extend(encode_frame(stream, format!("{}\n", line).as_bytes()));
        }
        out
    }

    async fn handle(&self, req: Request) -> Response {
        let path = req.uri().path().to_string();
        let query = req.uri().query().unwrap_or("").to_string();

        if !path.contains("/containers/flog/") {
            return (
                StatusCode::NOT_FOUND,
                [(header::CONTENT_TYPE, "application/json")],
                r#"{"message":"No such container"}"#,
            )
                .into_response();
        }

        if path.ends_with("/logs") {
            self.queries.lock().push(query.clone());
            let body = if query.contains("since=0") {
                Self::frames(&FIRST)
            } else {
                Self::frames(&SECOND)
            };
            return (StatusCode::OK, body).into_response();
        }

        (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            r#"{"Id":"flog","Name":"/flog","Config":{"Tty":false},"State":{"Running":true}}"#,
        )
            .into_response()
    }

    async fn serve(&self) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let daemon = self.clone();
        let app = Router::new().fallback(move |req: Request| {
            let daemon = daemon.clone();
            async move { daemon.handle(req).await }
        });
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn queries(&self) -> Vec<String> {
        self.queries.lock().clone()
    }
}

async fn client() -> (MockDaemon, DockerClient) {
    let daemon = MockDaemon::default();
    let addr = daemon.serve().await;
    let client = DockerClient::new(&format!("tcp://{}", addr)).unwrap();
    (daemon, client)
}

fn text(line: &str) -> String {
    line.split_once(' ').unwrap().1.to_string()
}

#[tokio::test]
async fn test_inspect_reports_non_tty() {
    let (_daemon, client) = client().await;
    let status = client.inspect("flog").await.unwrap();
    assert!(status.exists);
    assert!(status.running);
    assert!(!status.tty);

    let missing = client.inspect("ghost").await.unwrap();
    assert!(!missing.exists);
}

#[tokio::test]
async fn test_stream_returns_raw_frames() {
    let (daemon, client) = client().await;
    let mut stream = client
        .stream_logs(LogsRequest::follow("flog", None))
        .await
        .unwrap();

    let mut body = Vec::new();
    while let Some(chunk) = stream.next().await {
        body.extend_from_slice(&chunk.unwrap());
    }
    assert_eq!(body, MockDaemon::frames(&FIRST));

    let queries = daemon.queries();
    assert_eq!(queries.len(), 1);
    assert!(queries[0].contains("follow=true"));
    assert!(queries[0].contains("stdout=true"));
    assert!(queries[0].contains("stderr=true"));
    assert!(queries[0].contains("timestamps=true"));
    assert!(queries[0].contains("since=0"));
}

#[tokio::test]
async fn test_stream_for_missing_container_is_fatal() {
    let (_daemon, client) = client().await;
    let err = match client.stream_logs(LogsRequest::follow("ghost", None)).await {
        Ok(_) => panic!("expected an error"),
        Err(e) => e,
    };
    assert!(matches!(err, SourceError::ContainerNotFound(_)));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_unreachable_daemon_is_retryable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = DockerClient::new(&format!("tcp://{}", addr)).unwrap();
    let err = match client.stream_logs(LogsRequest::follow("flog", None)).await {
        Ok(_) => panic!("expected an error"),
        Err(e) => e,
    };
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_silent_daemon_times_out_as_retryable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    // Accept connections and hold them open without ever answering.
    let silent = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });

    let client = DockerClient::new(&format!("tcp://{}", addr))
        .unwrap()
        .with_response_timeout(Duration::from_millis(200));
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        client.stream_logs(LogsRequest::follow("flog", None)),
    )
    .await
    .expect("log request should give up on a silent daemon");
    let err = match result {
        Ok(_) => panic!("expected an error"),
        Err(e) => e,
    };
    assert!(matches!(err, SourceError::ConnectionFailed(_)));
    assert!(err.is_retryable());
    silent.abort();
}

#[tokio::test]
async fn test_target_reads_then_resumes_after_cursor() {
    let (daemon, client) = client().await;
    let dir = tempfile::tempdir().unwrap();
    let positions = Arc::new(Positions::open(dir.path().join("positions.json"), false).unwrap());
    let (emitter, mut rx) = Emitter::channel(Arc::new(NoRelabel), 16, Duration::from_secs(1));
    let (exit_tx, _exits) = mpsc::unbounded_channel::<TargetExit>();
    let deps = TargetDeps {
        source: Arc::new(client),
        positions: positions.clone(),
        emitter: Arc::new(emitter),
        backoff: BackoffConfig {
            min_delay_ms: 20,
            max_delay_ms: 100,
            jitter: 0.0,
        },
        exits: Some(exit_tx),
    };
    let labels: LabelSet = [("job", "docker")].into_iter().collect();
    let target = Target::new(
        TargetSpec::new("flog", "flog", labels),
        deps,
        Arc::new(TargetMetrics::new()),
    );
    assert!(target.start_if_not_running());

    let mut received: Vec<LogEntry> = Vec::new();
    for _ in 0..FIRST.len() + SECOND.len() {
        let entry = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for entries")
            .unwrap();
        received.push(entry);
    }

    let lines: Vec<String> = received.iter().map(|e| e.line().to_string()).collect();
    let expected: Vec<String> = FIRST.iter().chain(SECOND.iter()).map(|l| text(l)).collect();
    assert_eq!(lines, expected);
    assert_eq!(received[1].stream(), StreamTag::Stderr);

    // Later reconnects only see lines at or before the cursor.
    let extra = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
    assert!(extra.is_err(), "unexpected entry: {:?}", extra);

    let queries = daemon.queries();
    assert!(queries[0].contains("since=0"));
    assert!(queries[1].contains("since=1639041303.000000002"));
    assert_ne!(target.state(), TargetState::Stopped);
    assert!(target.metrics().snapshot("flog").reconnects >= 1);

    target.stop().await;
    assert_eq!(target.state(), TargetState::Stopped);
    assert_eq!(
        positions.get("flog").map(|t| t.to_rfc3339()),
        Some("2023-12-09T09:16:57.000000002+00:00".to_string())
    );
}
