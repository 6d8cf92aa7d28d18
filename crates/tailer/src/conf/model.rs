//! Model — TailerConfig and related structs.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::emit::{LabelSet, RelabelRuleConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TailerConfig {
    /// Daemon address. Empty means the local unix socket.
    pub docker_host: String,
    pub positions: PositionsConfig,
    pub backoff: BackoffConfig,
    pub forward: ForwardConfig,
    pub targets: Vec<TargetConfig>,
    pub relabel_configs: Vec<RelabelRuleConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionsConfig {
    pub path: String,
    pub sync_period_secs: u64,
    /// Start from an empty store instead of failing on a corrupt file.
    pub ignore_invalid: bool,
}

/// Reconnect delay bounds for one target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction in `[0, 1)` subtracted at random from each delay.
    pub jitter: f64,
}

/// Downstream channel behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardConfig {
    pub queue_capacity: usize,
    pub send_timeout_ms: u64,
}

/// A statically configured container to tail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Container id or name, as accepted by the daemon.
    pub container: String,
    /// Name recorded in `__meta_docker_container_name`. Defaults to `container`.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl Default for TailerConfig {
    fn default() -> Self {
        Self {
            docker_host: "".to_string(),
            positions: PositionsConfig::default(),
            backoff: BackoffConfig::default(),
            forward: ForwardConfig::default(),
            targets: Vec::new(),
            relabel_configs: Vec::new(),
        }
    }
}

impl Default for PositionsConfig {
    fn default() -> Self {
        Self {
            path: "/var/lib/tailer/positions.json".to_string(),
            sync_period_secs: 10,
            ignore_invalid: false,
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 500,
            max_delay_ms: 60_000,
            jitter: 0.2,
        }
    }
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            send_timeout_ms: 5000,
        }
    }
}

impl PositionsConfig {
    pub fn sync_period(&self) -> Duration {
        Duration::from_secs(self.sync_period_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.path.is_empty() {
            return Err("positions.path must not be empty".to_string());
        }
        if self.sync_period_secs == 0 {
            return Err("positions.sync_period_secs must be > 0".to_string());
        }
        Ok(())
    }
}

impl BackoffConfig {
    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.min_delay_ms == 0 {
            return Err("backoff.min_delay_ms must be > 0".to_string());
        }
        if self.max_delay_ms < self.min_delay_ms {
            return Err("backoff.max_delay_ms must be >= backoff.min_delay_ms".to_string());
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err("backoff.jitter must be in [0, 1)".to_string());
        }
        Ok(())
    }
}

impl ForwardConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.queue_capacity == 0 {
            return Err("forward.queue_capacity must be > 0".to_string());
        }
        if self.send_timeout_ms == 0 {
            return Err("forward.send_timeout_ms must be > 0".to_string());
        }
        Ok(())
    }
}

impl TargetConfig {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.container)
    }

    pub fn label_set(&self) -> LabelSet {
        self.labels.clone().into()
    }
}
