//! Events — follows daemon container events and keeps targets in step.
//!
//! `start`/`restart` of a configured container restarts its target from
//! the persisted cursor; `destroy` removes it. Missed events are covered by
//! re-ensuring every configured target each time the subscription opens.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::conf::BackoffConfig;
use crate::manager::TargetManager;
use crate::source::live::ContainerEvent;
use crate::source::DockerClient;
use crate::target::{Backoff, TargetSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    Restart,
    Remove,
}

impl EventAction {
    pub fn from_action(action: &str) -> Option<Self> {
        match action {
            "start" | "restart" => Some(EventAction::Restart),
            "destroy" => Some(EventAction::Remove),
            _ => None,
        }
    }
}

/// Find the configured target an event refers to, by id or by name.
pub fn resolve_event_target<'a>(
    specs: &'a HashMap<String, TargetSpec>,
    id: &str,
    name: &str,
) -> Option<&'a TargetSpec> {
    specs
        .get(id)
        .or_else(|| specs.get(name.trim_start_matches('/')))
}

/// Apply one event to the manager. Events for unconfigured containers are ignored.
pub async fn apply_event(
    manager: &TargetManager,
    specs: &HashMap<String, TargetSpec>,
    event: &ContainerEvent,
) -> Option<EventAction> {
    let action = EventAction::from_action(&event.action)?;
    let spec = resolve_event_target(specs, &event.id, &event.name)?;
    debug!(container = %spec.container_id, action = %event.action, "Container event");

    match action {
        EventAction::Restart => {
            if !manager.restart(&spec.container_id).await {
                manager.ensure(spec.clone()).await;
            }
        }
        EventAction::Remove => {
            manager.remove(&spec.container_id).await;
        }
    }
    Some(action)
}

/// Follow daemon events until `shutdown` fires, resubscribing with backoff.
pub async fn watch_events(
    client: Arc<DockerClient>,
    manager: Arc<TargetManager>,
    specs: HashMap<String, TargetSpec>,
    backoff: BackoffConfig,
    shutdown: CancellationToken,
) {
    let mut backoff = Backoff::new(&backoff);

    loop {
        let mut events = Box::pin(client.container_events());
        for spec in specs.values() {
            manager.ensure(spec.clone()).await;
        }
        info!("Watching container events");

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return,
                next = events.next() => next,
            };
            match next {
                Some(Ok(event)) => {
                    backoff.reset();
                    apply_event(&manager, &specs, &event).await;
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Container event stream failed");
                    break;
                }
                None => {
                    warn!("Container event stream ended");
                    break;
                }
            }
        }

        let delay = backoff.next_delay();
        debug!(delay_ms = delay.as_millis() as u64, "Resubscribing to container events");
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            _ = time::sleep(delay) => {}
        }
    }
}
