//! Load — config loading from file and environment variables.

use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use super::model::{BackoffConfig, ForwardConfig, PositionsConfig, TailerConfig};
use crate::emit::RuleSet;

impl TailerConfig {
    /// Load configuration from file or environment variables
    /// Priority: Environment Variables > Config File > Defaults
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let config_path = std::env::var("TAILER_CONFIG_FILE")
            .unwrap_or_else(|_| "/etc/tailer/tailer.toml".to_string());

        let mut config = if Path::new(&config_path).exists() {
            tracing::info!("Loading configuration from: {}", config_path);
            Self::from_file(&config_path)?
        } else {
            tracing::info!("Config file not found at {}, using environment variables", config_path);
            Self::from_env()
        };

        if let Ok(host) = std::env::var("DOCKER_HOST") {
            config.docker_host = host;
        }
        if let Ok(path) = std::env::var("TAILER_POSITIONS_FILE") {
            config.positions.path = path;
        }

        Ok(config)
    }

    /// Load configuration from TOML file
    pub fn from_file(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let mut file = File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let config: TailerConfig = toml::from_str(contents)?;
        Ok(config)
    }

    /// Load configuration from environment variables with sensible defaults.
    /// Targets and relabel rules are file-only.
    pub fn from_env() -> Self {
        Self {
            docker_host: std::env::var("DOCKER_HOST").unwrap_or_default(),
            positions: PositionsConfig::from_env(),
            backoff: BackoffConfig::from_env(),
            forward: ForwardConfig::from_env(),
            ..Default::default()
        }
    }

    /// Check value ranges, duplicate targets, and that every relabel rule compiles.
    pub fn validate(&self) -> Result<(), String> {
        self.positions.validate()?;
        self.backoff.validate()?;
        self.forward.validate()?;

        let mut seen = HashSet::new();
        for target in &self.targets {
            if target.container.is_empty() {
                return Err("targets[].container must not be empty".to_string());
            }
            if !seen.insert(target.container.as_str()) {
                return Err(format!("duplicate target: {}", target.container));
            }
        }

        RuleSet::compile(&self.relabel_configs).map_err(|e| e.to_string())?;
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

impl PositionsConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            path: std::env::var("TAILER_POSITIONS_FILE").unwrap_or(defaults.path),
            sync_period_secs: env_parse("TAILER_POSITIONS_SYNC_SECS")
                .unwrap_or(defaults.sync_period_secs),
            ignore_invalid: env_parse("TAILER_POSITIONS_IGNORE_INVALID")
                .unwrap_or(defaults.ignore_invalid),
        }
    }
}

impl BackoffConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            min_delay_ms: env_parse("TAILER_BACKOFF_MIN_MS").unwrap_or(defaults.min_delay_ms),
            max_delay_ms: env_parse("TAILER_BACKOFF_MAX_MS").unwrap_or(defaults.max_delay_ms),
            jitter: env_parse("TAILER_BACKOFF_JITTER").unwrap_or(defaults.jitter),
        }
    }
}

impl ForwardConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            queue_capacity: env_parse("TAILER_QUEUE_CAPACITY").unwrap_or(defaults.queue_capacity),
            send_timeout_ms: env_parse("TAILER_SEND_TIMEOUT_MS")
                .unwrap_or(defaults.send_timeout_ms),
        }
    }
}
