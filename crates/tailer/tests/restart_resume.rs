//! Restart resumption against the in-memory daemon.
//!
//! A container logs five lines, the target is restarted (or the whole
//! process is), the container logs five more, and exactly the new five
//! must come through.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tailer::conf::BackoffConfig;
use tailer::emit::{Emitter, LabelSet, LogEntry, NoRelabel};
use tailer::manager::TargetManager;
use tailer::metrics::MetricsRegistry;
use tailer::positions::Positions;
use tailer::source::{FakeContainer, FakeLogLine, FakeSource};
use tailer::target::{TargetDeps, TargetSpec};
use tokio::sync::mpsc;

const BEFORE: [(&str, &str); 5] = [
    ("2021-12-09T09:15:02.000000100Z", "5.3.69.55 - - [09/Dec/2021:09:15:02 +0000] \"HEAD /brand/users/clicks-and-mortar/front-end HTTP/2.0\" 503 27087"),
    ("2021-12-09T09:15:03.000000100Z", "101.54.183.185 - - [09/Dec/2021:09:15:03 +0000] \"POST /next-generation HTTP/1.0\" 416 11468"),
    ("2021-12-09T09:15:03.000000200Z", "69.27.137.160 - runolfsdottir2670 [09/Dec/2021:09:15:03 +0000] \"HEAD /content/visionary/engineer/cultivate HTTP/1.1\" 302 2975"),
    ("2021-12-09T09:15:03.000000300Z", "28.104.242.74 - - [09/Dec/2021:09:15:03 +0000] \"PATCH /value-added/cultivate/systems HTTP/2.0\" 405 11843"),
    ("2021-12-09T09:15:03.000000400Z", "150.187.51.54 - satterfield1852 [09/Dec/2021:09:15:03 +0000] \"GET /incentivize/deliver/innovative/cross-platform HTTP/1.1\" 301 13032"),
];

const AFTER: [(&str, &str); 5] = [
    ("2023-12-09T09:16:57.000000100Z", "243.115.12.215 - - [09/Dec/2023:09:16:57 +0000] \"DELETE /morph/exploit/granular HTTP/1.0\" 500 26468"),
    ("2023-12-09T09:16:57.000000200Z", "221.41.123.237 - - [09/Dec/2023:09:16:57 +0000] \"DELETE /user-centric/whiteboard HTTP/2.0\" 205 22487"),
    ("2023-12-09T09:16:57.000000300Z", "89.111.144.144 - - [09/Dec/2023:09:16:57 +0000] \"DELETE /open-source/e-commerce HTTP/1.0\" 401 11092"),
    ("2023-12-09T09:16:57.000000400Z", "62.180.191.187 - - [09/Dec/2023:09:16:57 +0000] \"DELETE /cultivate/integrate/technologies HTTP/2.0\" 302 12979"),
    ("2023-12-09T09:16:57.000000500Z", "156.249.2.192 - - [09/Dec/2023:09:16:57 +0000] \"POST /revolutionize/mesh/metrics HTTP/2.0\" 401 5297"),
];

fn ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

fn logs(lines: &[(&str, &str)]) -> Vec<FakeLogLine> {
    lines
        .iter()
        .map(|(t, text)| FakeLogLine::stdout(ts(t), text))
        .collect()
}

fn texts(lines: &[(&str, &str)]) -> Vec<String> {
    lines.iter().map(|(_, text)| text.to_string()).collect()
}

fn flog_spec() -> TargetSpec {
    let labels: LabelSet = [("job", "docker")].into_iter().collect();
    TargetSpec::new("flog", "flog", labels)
}

fn build_manager(
    source: Arc<FakeSource>,
    positions: Arc<Positions>,
) -> (Arc<TargetManager>, mpsc::Receiver<LogEntry>) {
    let (emitter, rx) = Emitter::channel(Arc::new(NoRelabel), 64, Duration::from_secs(1));
    let deps = TargetDeps {
        source,
        positions,
        emitter: Arc::new(emitter),
        backoff: BackoffConfig {
            min_delay_ms: 20,
            max_delay_ms: 200,
            jitter: 0.0,
        },
        exits: None,
    };
    (TargetManager::new(deps, Arc::new(MetricsRegistry::new())), rx)
}

/// Receive `n` entries, ordered by timestamp.
async fn receive(rx: &mut mpsc::Receiver<LogEntry>, n: usize) -> Vec<LogEntry> {
    let mut entries = Vec::with_capacity(n);
    for _ in 0..n {
        let entry = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for entries")
            .expect("entry channel closed");
        entries.push(entry);
    }
    entries.sort_by_key(|e| e.timestamp());
    entries
}

async fn assert_no_more(rx: &mut mpsc::Receiver<LogEntry>) {
    let extra = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(extra.is_err(), "unexpected extra entry: {:?}", extra);
}

fn lines_of(entries: &[LogEntry]) -> Vec<String> {
    entries.iter().map(|e| e.line().to_string()).collect()
}

#[tokio::test]
async fn test_target_restart_resumes_without_overlap() {
    let dir = tempfile::tempdir().unwrap();
    let positions = Arc::new(Positions::open(dir.path().join("positions.json"), false).unwrap());
    let source = Arc::new(FakeSource::new());
    source
        .add_container("flog", FakeContainer::running(logs(&BEFORE)))
        .await;
    let (manager, mut rx) = build_manager(source.clone(), positions.clone());

    assert!(manager.ensure(flog_spec()).await);
    let first = receive(&mut rx, 5).await;
    assert_eq!(lines_of(&first), texts(&BEFORE));
    assert_eq!(first[0].labels().get("job"), Some("docker"));
    assert!(first[0].labels().get("__meta_docker_container_log_stream").is_none());

    source.push_logs("flog", logs(&AFTER)).await;
    assert!(manager.restart("flog").await);

    let second = receive(&mut rx, 5).await;
    assert_eq!(lines_of(&second), texts(&AFTER));
    assert_no_more(&mut rx).await;

    let requests = source.requests().await;
    assert_eq!(requests[0].since_param(), "0");
    assert_eq!(requests[1].since, Some(ts(BEFORE[4].0)));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_process_restart_resumes_from_positions_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("positions.json");
    let source = Arc::new(FakeSource::new());
    source
        .add_container("flog", FakeContainer::running(logs(&BEFORE)))
        .await;

    {
        let positions = Arc::new(Positions::open(&path, false).unwrap());
        let (manager, mut rx) = build_manager(source.clone(), positions);
        manager.ensure(flog_spec()).await;
        receive(&mut rx, 5).await;
        manager.shutdown().await;
    }

    source.push_logs("flog", logs(&AFTER)).await;

    let positions = Arc::new(Positions::open(&path, false).unwrap());
    assert_eq!(positions.get("flog"), Some(ts(BEFORE[4].0)));
    let (manager, mut rx) = build_manager(source.clone(), positions);
    manager.ensure(flog_spec()).await;

    let resumed = receive(&mut rx, 5).await;
    assert_eq!(lines_of(&resumed), texts(&AFTER));
    assert_no_more(&mut rx).await;

    let snapshot = manager.metrics();
    assert_eq!(snapshot[0].resume_skipped, 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_chunked_delivery_matches_whole() {
    let dir = tempfile::tempdir().unwrap();
    let positions = Arc::new(Positions::open(dir.path().join("positions.json"), false).unwrap());
    let source = Arc::new(FakeSource::new());
    source
        .add_container(
            "flog",
            FakeContainer {
                chunk_size: Some(3),
                ..FakeContainer::running(logs(&BEFORE))
            },
        )
        .await;
    let (manager, mut rx) = build_manager(source, positions);

    manager.ensure(flog_spec()).await;
    let entries = receive(&mut rx, 5).await;
    assert_eq!(lines_of(&entries), texts(&BEFORE));
    assert_eq!(manager.metrics()[0].frame_errors, 0);
    manager.shutdown().await;
}
