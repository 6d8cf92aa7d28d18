//! Boot — logging init, config load, daemon connection, target wiring.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use super::events::watch_events;
use super::sink::write_json_lines;
use super::stop::shutdown_signal;
use crate::conf::TailerConfig;
use crate::emit::{Emitter, LogEntry, RuleSet};
use crate::manager::TargetManager;
use crate::metrics::MetricsRegistry;
use crate::positions::Positions;
use crate::source::DockerClient;
use crate::target::{TargetDeps, TargetSpec};

const SINK_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Initialise the tracing / logging subsystem. Logs go to stderr; stdout
/// carries the entries.
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tailer=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Everything the process needs once booted.
pub struct App {
    config: TailerConfig,
    client: Arc<DockerClient>,
    positions: Arc<Positions>,
    manager: Arc<TargetManager>,
    entries: mpsc::Receiver<LogEntry>,
}

/// Load config, connect to the daemon, open the positions store and build
/// the target manager.
pub async fn boot() -> Result<App, Box<dyn std::error::Error>> {
    info!("Starting tailer v{}", env!("CARGO_PKG_VERSION"));

    let config = TailerConfig::load()?;
    config.validate()?;
    info!(
        targets = config.targets.len(),
        relabel_rules = config.relabel_configs.len(),
        positions = %config.positions.path,
        "Loaded configuration"
    );

    let client = Arc::new(DockerClient::new(&config.docker_host).map_err(|e| {
        error!("Failed to connect to Docker: {}", e);
        e
    })?);
    info!(endpoint = ?client.endpoint(), "Connecting to Docker daemon");

    let positions = Arc::new(Positions::load(&config.positions)?);
    let rules = RuleSet::compile(&config.relabel_configs)?;
    let (emitter, entries) = Emitter::channel(
        Arc::new(rules),
        config.forward.queue_capacity,
        config.forward.send_timeout(),
    );

    let deps = TargetDeps {
        source: client.clone(),
        positions: Arc::clone(&positions),
        emitter: Arc::new(emitter),
        backoff: config.backoff.clone(),
        exits: None,
    };
    let manager = TargetManager::new(deps, Arc::new(MetricsRegistry::new()));

    Ok(App {
        config,
        client,
        positions,
        manager,
        entries,
    })
}

impl App {
    /// Tail until a shutdown signal arrives, then stop cleanly.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        let App {
            config,
            client,
            positions,
            manager,
            entries,
        } = self;

        let shutdown = CancellationToken::new();
        let sink = tokio::spawn(write_json_lines(entries, tokio::io::stdout()));

        let sync = tokio::spawn(
            Arc::clone(&positions).run_sync(config.positions.sync_period(), shutdown.clone()),
        );

        let specs: HashMap<String, TargetSpec> = config
            .targets
            .iter()
            .map(|t| (t.container.clone(), TargetSpec::from(t)))
            .collect();
        manager.sync(specs.values().cloned().collect()).await;
        info!(targets = manager.len(), "Tailing started");

        let watcher = tokio::spawn(watch_events(
            client,
            Arc::clone(&manager),
            specs,
            config.backoff.clone(),
            shutdown.clone(),
        ));

        shutdown_signal().await;
        shutdown.cancel();
        let _ = watcher.await;
        manager.shutdown().await;
        let _ = sync.await;

        for snapshot in manager.metrics() {
            match serde_json::to_string(&snapshot) {
                Ok(json) => info!(metrics = %json, "Target metrics"),
                Err(e) => warn!(error = %e, "Failed to serialize metrics"),
            }
        }

        // The sink ends once the last emitter clone is dropped.
        drop(manager);
        match tokio::time::timeout(SINK_DRAIN_TIMEOUT, sink).await {
            Ok(Ok(Ok(written))) => info!(entries = written, "Sink drained"),
            Ok(Ok(Err(e))) => error!(error = %e, "Sink failed"),
            Ok(Err(e)) => error!(error = %e, "Sink task panicked"),
            Err(_) => warn!("Sink did not drain in time"),
        }

        info!("Shutdown complete");
        Ok(())
    }
}
