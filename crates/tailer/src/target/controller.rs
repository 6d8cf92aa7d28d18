//! Controller — lifecycle of one container's tailing task.
//!
//! A [`Target`] owns at most one reading task at a time. The state enum,
//! the resume cursor and the task handle live behind a single mutex, and
//! every run carries a generation number so a task that was replaced by a
//! stop or restart can no longer change the target's state.
//!
//! Resume boundary: the daemon treats `since` as inclusive, so each session
//! discards lines stamped at or before the cursor it was opened with. Lines
//! whose timestamp did not parse never move the cursor; the target counts
//! how many it delivered past the cursor and skips that many on replay.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backoff::Backoff;
use super::state::{TargetExit, TargetState};
use crate::conf::{BackoffConfig, TargetConfig};
use crate::emit::{Emitter, LabelSet, CONTAINER_ID_LABEL, CONTAINER_NAME_LABEL};
use crate::frame::{DemuxEvent, Demuxer, FrameMode, ParsedLine, RawLine};
use crate::metrics::TargetMetrics;
use crate::positions::Positions;
use crate::source::{LogSource, LogsRequest, SourceError};

/// Identity and static labels of a container to tail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSpec {
    pub container_id: String,
    pub name: String,
    pub labels: LabelSet,
}

impl TargetSpec {
    pub fn new(container_id: &str, name: &str, labels: LabelSet) -> Self {
        Self {
            container_id: container_id.to_string(),
            name: name.to_string(),
            labels,
        }
    }

    /// Static labels plus the container metadata labels.
    pub fn base_labels(&self) -> LabelSet {
        let mut labels = self.labels.clone();
        labels.insert(CONTAINER_ID_LABEL, self.container_id.as_str());
        labels.insert(CONTAINER_NAME_LABEL, self.name.as_str());
        labels
    }
}

impl From<&TargetConfig> for TargetSpec {
    fn from(config: &TargetConfig) -> Self {
        Self::new(&config.container, config.display_name(), config.label_set())
    }
}

/// Collaborators shared by every target.
#[derive(Clone)]
pub struct TargetDeps {
    pub source: Arc<dyn LogSource>,
    pub positions: Arc<Positions>,
    pub emitter: Arc<Emitter>,
    pub backoff: BackoffConfig,
    /// Receives a [`TargetExit`] whenever a run stops on its own.
    pub exits: Option<mpsc::UnboundedSender<TargetExit>>,
}

struct Inner {
    state: TargetState,
    cursor: Option<DateTime<Utc>>,
    /// Unstamped lines delivered after `cursor`.
    unstamped: u64,
    generation: u64,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

struct Shared {
    spec: TargetSpec,
    labels: LabelSet,
    deps: TargetDeps,
    metrics: Arc<TargetMetrics>,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<TargetState>,
}

/// Handle to one tailed container. Cloning shares the same target.
#[derive(Clone)]
pub struct Target {
    shared: Arc<Shared>,
}

/// What a session has already seen: lines at or before `since`, then
/// `unstamped` lines without a parseable timestamp.
#[derive(Debug, Clone, Copy)]
struct Resume {
    since: Option<DateTime<Utc>>,
    unstamped: u64,
}

/// How one connected session ended.
enum Session {
    Cancelled,
    /// Stream closed while the container still exists.
    Ended { delivered: u64 },
    Gone(String),
    Failed { error: SourceError, delivered: u64 },
}

impl Target {
    pub fn new(spec: TargetSpec, deps: TargetDeps, metrics: Arc<TargetMetrics>) -> Self {
        let (state_tx, _) = watch::channel(TargetState::Stopped);
        Self {
            shared: Arc::new(Shared {
                labels: spec.base_labels(),
                spec,
                deps,
                metrics,
                inner: Mutex::new(Inner {
                    state: TargetState::Stopped,
                    cursor: None,
                    unstamped: 0,
                    generation: 0,
                    cancel: None,
                    task: None,
                }),
                state_tx,
            }),
        }
    }

    pub fn container_id(&self) -> &str {
        &self.shared.spec.container_id
    }

    pub fn spec(&self) -> &TargetSpec {
        &self.shared.spec
    }

    pub fn state(&self) -> TargetState {
        self.shared.inner.lock().state
    }

    pub fn cursor(&self) -> Option<DateTime<Utc>> {
        self.shared.inner.lock().cursor
    }

    pub fn generation(&self) -> u64 {
        self.shared.inner.lock().generation
    }

    pub fn metrics(&self) -> &Arc<TargetMetrics> {
        &self.shared.metrics
    }

    pub fn subscribe(&self) -> watch::Receiver<TargetState> {
        self.shared.state_tx.subscribe()
    }

    /// Launch the reading task unless one is already live. Returns whether
    /// a new task was started.
    pub fn start_if_not_running(&self) -> bool {
        let shared = &self.shared;
        let mut inner = shared.inner.lock();
        if inner.state != TargetState::Stopped {
            return false;
        }

        inner.generation += 1;
        inner.cursor = shared.deps.positions.get(&shared.spec.container_id);
        inner.unstamped = shared.deps.positions.unstamped(&shared.spec.container_id);
        let generation = inner.generation;
        let cancel = CancellationToken::new();
        inner.cancel = Some(cancel.clone());
        shared.set_state(&mut inner, TargetState::Running);

        info!(
            container = %shared.spec.container_id,
            name = %shared.spec.name,
            cursor = ?inner.cursor,
            unstamped = inner.unstamped,
            "Starting target"
        );
        inner.task = Some(tokio::spawn(run(Arc::clone(shared), generation, cancel)));
        true
    }

    /// Cancel the reading task and wait until it has released its stream.
    pub async fn stop(&self) {
        let (cancel, task) = {
            let mut inner = self.shared.inner.lock();
            if inner.state == TargetState::Stopped && inner.task.is_none() {
                return;
            }
            inner.generation += 1;
            self.shared.set_state(&mut inner, TargetState::Stopped);
            (inner.cancel.take(), inner.task.take())
        };

        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(task) = task {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!(container = %self.shared.spec.container_id, "Target task panicked");
                }
            }
        }
        debug!(container = %self.shared.spec.container_id, "Target stopped");
    }

    /// Drop any in-flight connection and start again from the persisted cursor.
    pub async fn restart(&self) {
        self.stop().await;
        self.start_if_not_running();
    }
}

impl Shared {
    fn set_state(&self, inner: &mut Inner, state: TargetState) {
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    /// Apply `state` only if `generation` is still the live run.
    fn transition(&self, generation: u64, state: TargetState) -> bool {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return false;
        }
        if inner.state != state {
            self.set_state(&mut inner, state);
        }
        true
    }

    fn resume(&self) -> Resume {
        let inner = self.inner.lock();
        Resume {
            since: inner.cursor,
            unstamped: inner.unstamped,
        }
    }

    fn advance(&self, generation: u64, ts: DateTime<Utc>) {
        self.deps.positions.put(&self.spec.container_id, ts);
        let mut inner = self.inner.lock();
        if inner.generation == generation && inner.cursor.map_or(true, |c| c < ts) {
            inner.cursor = Some(ts);
            inner.unstamped = 0;
        }
    }

    fn note_unstamped(&self, generation: u64) {
        let count = {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                return;
            }
            inner.unstamped += 1;
            inner.unstamped
        };
        self.deps.positions.set_unstamped(&self.spec.container_id, count);
    }

    async fn tail_once(&self, generation: u64, cancel: &CancellationToken) -> Session {
        let id = self.spec.container_id.as_str();
        let mut resume = self.resume();

        let status = match self.deps.source.inspect(id).await {
            Ok(status) => status,
            Err(error) => return Session::Failed { error, delivered: 0 },
        };
        if !status.exists {
            return Session::Gone("container no longer exists".to_string());
        }

        let mut stream = match self
            .deps
            .source
            .stream_logs(LogsRequest::follow(id, resume.since))
            .await
        {
            Ok(stream) => stream,
            Err(error) => return Session::Failed { error, delivered: 0 },
        };
        if !self.transition(generation, TargetState::Running) {
            return Session::Cancelled;
        }
        debug!(
            container = %id,
            tty = status.tty,
            running = status.running,
            since = ?resume.since,
            skip_unstamped = resume.unstamped,
            "Log stream opened"
        );

        let mut demuxer = Demuxer::new(FrameMode::from_tty(status.tty));
        let mut delivered = 0u64;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Session::Cancelled,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(chunk)) => demuxer.push(chunk),
                Some(Err(error)) => return Session::Failed { error, delivered },
                None => {
                    demuxer.finish();
                    if !self.drain(&mut demuxer, &mut resume, generation, cancel, &mut delivered).await {
                        return Session::Cancelled;
                    }
                    break;
                }
            }
            if !self.drain(&mut demuxer, &mut resume, generation, cancel, &mut delivered).await {
                return Session::Cancelled;
            }
        }

        match self.deps.source.inspect(id).await {
            Ok(status) if !status.exists => Session::Gone("container no longer exists".to_string()),
            Err(e) if e.is_fatal() => Session::Gone(e.to_string()),
            Ok(status) => {
                debug!(container = %id, running = status.running, "Log stream closed by daemon");
                Session::Ended { delivered }
            }
            Err(_) => Session::Ended { delivered },
        }
    }

    /// Forward every complete line the demuxer holds. Returns `false` once
    /// cancellation is observed.
    async fn drain(
        &self,
        demuxer: &mut Demuxer,
        resume: &mut Resume,
        generation: u64,
        cancel: &CancellationToken,
        delivered: &mut u64,
    ) -> bool {
        while let Some(event) = demuxer.pop() {
            match event {
                DemuxEvent::Malformed(err) => {
                    self.metrics.inc_frame_errors();
                    warn!(container = %self.spec.container_id, error = %err, "Discarding malformed log frame");
                }
                DemuxEvent::Line(raw) => {
                    if cancel.is_cancelled() {
                        return false;
                    }
                    match self.forward(raw, resume, generation, cancel).await {
                        Some(true) => *delivered += 1,
                        Some(false) => {}
                        None => return false,
                    }
                }
            }
        }
        true
    }

    /// `Some(true)` when the line was handed downstream, `Some(false)` when
    /// it was skipped, `None` on cancellation.
    async fn forward(
        &self,
        raw: RawLine,
        resume: &mut Resume,
        generation: u64,
        cancel: &CancellationToken,
    ) -> Option<bool> {
        let line = ParsedLine::parse(&raw);
        self.metrics.inc_lines_read();

        let ts = line.timestamp;
        let fallback = line.fallback.is_some();
        if let Some(err) = &line.fallback {
            if resume.unstamped > 0 {
                resume.unstamped -= 1;
                self.metrics.inc_resume_skipped();
                return Some(false);
            }
            self.metrics.inc_timestamp_fallbacks();
            warn!(container = %self.spec.container_id, error = %err, "Unparseable log timestamp, using local time");
        } else if resume.since.is_some_and(|s| ts <= s) {
            self.metrics.inc_resume_skipped();
            return Some(false);
        } else {
            // Past the replayed prefix.
            resume.unstamped = 0;
        }

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            outcome = self.deps.emitter.emit(&self.spec.container_id, &self.labels, line, &self.metrics) => outcome,
        };

        // Local-clock timestamps would push the cursor past lines not read yet.
        if outcome.is_settled() {
            if fallback {
                self.note_unstamped(generation);
            } else {
                self.advance(generation, ts);
            }
        }
        Some(true)
    }
}

/// Marks the target stopped if its run ends while still current, including
/// by panic.
struct ExitGuard {
    shared: Arc<Shared>,
    generation: u64,
    reason: String,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        if !self.shared.transition(self.generation, TargetState::Stopped) {
            return;
        }
        if let Some(exits) = &self.shared.deps.exits {
            let _ = exits.send(TargetExit {
                container_id: self.shared.spec.container_id.clone(),
                generation: self.generation,
                reason: std::mem::take(&mut self.reason),
            });
        }
    }
}

async fn run(shared: Arc<Shared>, generation: u64, cancel: CancellationToken) {
    let mut guard = ExitGuard {
        shared: Arc::clone(&shared),
        generation,
        reason: "task ended unexpectedly".to_string(),
    };
    let id = shared.spec.container_id.clone();
    let mut backoff = Backoff::new(&shared.deps.backoff);

    loop {
        let session = tokio::select! {
            biased;
            _ = cancel.cancelled() => Session::Cancelled,
            session = shared.tail_once(generation, &cancel) => session,
        };

        match session {
            Session::Cancelled => {
                guard.reason = "cancelled".to_string();
                return;
            }
            Session::Gone(reason) => {
                info!(container = %id, reason = %reason, "Container gone, stopping target");
                guard.reason = reason;
                return;
            }
            Session::Failed { error, .. } if !error.is_retryable() => {
                warn!(container = %id, error = %error, "Fatal log stream error, stopping target");
                guard.reason = error.to_string();
                return;
            }
            Session::Failed { error, delivered } => {
                shared.metrics.inc_stream_errors();
                warn!(container = %id, error = %error, "Log stream failed");
                if delivered > 0 {
                    backoff.reset();
                }
            }
            Session::Ended { delivered } => {
                debug!(container = %id, delivered, "Log stream ended");
                if delivered > 0 {
                    backoff.reset();
                }
            }
        }

        if !shared.transition(generation, TargetState::Retrying) {
            return;
        }
        let delay = backoff.next_delay();
        debug!(container = %id, attempt = backoff.attempt(), delay_ms = delay.as_millis() as u64, "Reconnecting after backoff");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = time::sleep(delay) => {}
        }
        shared.metrics.inc_reconnects();
    }
}
