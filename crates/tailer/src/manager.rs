//! Manager — the single registry of live targets, keyed by container id.
//!
//! All mutation goes through [`TargetManager`]; a container id maps to at
//! most one [`Target`] at any time.

use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::metrics::{MetricsRegistry, TargetMetricsSnapshot};
use crate::target::{Target, TargetDeps, TargetExit, TargetSpec, TargetState};

pub struct TargetManager {
    targets: DashMap<String, Target>,
    deps: TargetDeps,
    metrics: Arc<MetricsRegistry>,
}

impl TargetManager {
    /// Build the manager and spawn the reaper that forgets targets whose
    /// container went away.
    pub fn new(mut deps: TargetDeps, metrics: Arc<MetricsRegistry>) -> Arc<Self> {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        deps.exits = Some(exit_tx);

        let manager = Arc::new(Self {
            targets: DashMap::new(),
            deps,
            metrics,
        });
        tokio::spawn(reap(Arc::downgrade(&manager), exit_rx));
        manager
    }

    /// Register `spec` if needed and make sure it is tailing. A target whose
    /// labels changed is replaced.
    pub async fn ensure(&self, spec: TargetSpec) -> bool {
        let id = spec.container_id.clone();
        let (target, replaced) = match self.targets.entry(id.clone()) {
            Entry::Occupied(mut slot) if slot.get().spec() != &spec => {
                let fresh = self.build(spec);
                let old = slot.insert(fresh.clone());
                (fresh, Some(old))
            }
            Entry::Occupied(slot) => (slot.get().clone(), None),
            Entry::Vacant(slot) => (slot.insert(self.build(spec)).clone(), None),
        };

        if let Some(old) = replaced {
            info!(container = %id, "Target spec changed, replacing");
            old.stop().await;
        }
        target.start_if_not_running()
    }

    /// Restart a managed target from its persisted cursor. Returns `false`
    /// if `container_id` is not managed.
    pub async fn restart(&self, container_id: &str) -> bool {
        let Some(target) = self.get(container_id) else {
            return false;
        };
        info!(container = %container_id, "Restarting target");
        target.restart().await;
        true
    }

    /// Stop and forget a target. Its position stays in the store.
    pub async fn remove(&self, container_id: &str) -> bool {
        let Some((_, target)) = self.targets.remove(container_id) else {
            return false;
        };
        target.stop().await;
        self.metrics.remove(container_id);
        info!(container = %container_id, "Target removed");
        true
    }

    /// Reconcile the managed set with `specs`.
    pub async fn sync(&self, specs: Vec<TargetSpec>) {
        let stale: Vec<String> = self
            .targets
            .iter()
            .filter(|e| !specs.iter().any(|s| &s.container_id == e.key()))
            .map(|e| e.key().clone())
            .collect();
        for id in stale {
            self.remove(&id).await;
        }
        for spec in specs {
            self.ensure(spec).await;
        }
    }

    /// Stop every target, then flush positions one last time.
    pub async fn shutdown(&self) {
        let targets: Vec<Target> = self.targets.iter().map(|e| e.value().clone()).collect();
        info!(targets = targets.len(), "Stopping all targets");
        join_all(targets.iter().map(|t| t.stop())).await;

        let positions = Arc::clone(&self.deps.positions);
        match tokio::task::spawn_blocking(move || positions.flush()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => error!(error = %e, "Final positions flush failed"),
            Err(e) => error!(error = %e, "Final positions flush panicked"),
        }
    }

    pub fn get(&self, container_id: &str) -> Option<Target> {
        self.targets.get(container_id).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Current state of every target, ordered by container id.
    pub fn states(&self) -> Vec<(String, TargetState)> {
        let mut all: Vec<_> = self
            .targets
            .iter()
            .map(|e| (e.key().clone(), e.value().state()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn metrics(&self) -> Vec<TargetMetricsSnapshot> {
        self.metrics.snapshot()
    }

    fn build(&self, spec: TargetSpec) -> Target {
        let metrics = self.metrics.for_target(&spec.container_id);
        Target::new(spec, self.deps.clone(), metrics)
    }

    fn forget_exited(&self, exit: &TargetExit) {
        let removed = self.targets.remove_if(&exit.container_id, |_, target| {
            target.generation() == exit.generation && target.state() == TargetState::Stopped
        });
        if removed.is_some() {
            self.metrics.remove(&exit.container_id);
            info!(container = %exit.container_id, reason = %exit.reason, "Target finished");
        } else {
            debug!(container = %exit.container_id, "Ignoring exit from a replaced run");
        }
    }
}

async fn reap(manager: Weak<TargetManager>, mut exits: mpsc::UnboundedReceiver<TargetExit>) {
    while let Some(exit) = exits.recv().await {
        let Some(manager) = manager.upgrade() else {
            break;
        };
        manager.forget_exited(&exit);
    }
}
