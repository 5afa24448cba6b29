//! Configuration management for the Tandem node
//!
//! Settings come from `conf/tandem.yml` (optional), then `TANDEM__*`
//! environment variables, then command line overrides.

use std::{path::PathBuf, time::Duration};

use clap::Parser;
use config::{Config, ConfigBuilder, Environment, FileFormat, builder::DefaultState};
use serde_json::{Map, Value};
use tandem_common::{TandemError, TandemResult};
use tandem_consistency::{DEFAULT_ACQUIRE_TIMEOUT, sync::DEFAULT_FETCH_TIMEOUT};
use tandem_persistence::memory::MEMORY_BACKEND;
use tracing::{debug, warn};

use crate::startup::LoggingConfig;

pub const DEFAULT_CONFIG_PATH: &str = "conf/tandem.yml";
pub const DEFAULT_PRIVATE_KEY_PATH: &str = "./cluster-private.key";
pub const DEFAULT_PUBLIC_KEY_PATH: &str = "./cluster-public.key";
pub const DEFAULT_SPILL_THRESHOLD: usize = 4096;
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_TRANSPORT: &str = "memory";

const NODE_NAME: &str = "tandem.node.name";
const CLUSTER_PRIVATE_KEY: &str = "tandem.cluster.private_key";
const CLUSTER_PUBLIC_KEY: &str = "tandem.cluster.public_key";
const PERSISTENCE: &str = "tandem.persistence";
const EVENTS: &str = "tandem.events";
const LOCKS_ACQUIRE_TIMEOUT_MS: &str = "tandem.locks.acquire_timeout_ms";
const SYNC_FETCH_TIMEOUT_MS: &str = "tandem.sync.fetch_timeout_ms";
const CRYPTO_SPILL_THRESHOLD: &str = "tandem.crypto.spill_threshold";
const CRYPTO_SPILL_DIR: &str = "tandem.crypto.spill_dir";
const LOGS_LEVEL: &str = "tandem.logs.level";
const LOGS_PATH: &str = "tandem.logs.path";

/// Command line arguments for the node
#[derive(Debug, Default, Parser)]
#[command(name = "tandem-server", version, about)]
pub struct Cli {
    /// Configuration file, skipped when missing
    #[arg(short = 'c', long = "config", env = "TANDEM_CONFIG")]
    pub config: Option<PathBuf>,
    #[arg(long = "log-level")]
    pub log_level: Option<String>,
    #[arg(long = "node-name")]
    pub node_name: Option<String>,
}

/// Application configuration loaded from config files and environment
#[derive(Clone, Debug, Default)]
pub struct Configuration {
    pub config: Config,
}

impl Configuration {
    pub fn new() -> TandemResult<Self> {
        Self::load(&Cli::parse())
    }

    pub fn load(cli: &Cli) -> TandemResult<Self> {
        let path = cli
            .config
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        if !path.is_file() {
            debug!("No configuration file at {}, using defaults", path.display());
        }

        let builder = Config::builder()
            .add_source(config::File::from(path.as_path()).required(false))
            .add_source(
                Environment::with_prefix("TANDEM")
                    .separator("__")
                    .keep_prefix(true)
                    .try_parsing(true),
            );
        Self::with_overrides(builder, cli)
    }

    /// Configuration from YAML text, with command line overrides on top
    pub fn from_yaml(yaml: &str, cli: &Cli) -> TandemResult<Self> {
        let builder = Config::builder().add_source(config::File::from_str(yaml, FileFormat::Yaml));
        Self::with_overrides(builder, cli)
    }

    fn with_overrides(mut builder: ConfigBuilder<DefaultState>, cli: &Cli) -> TandemResult<Self> {
        if let Some(v) = &cli.log_level {
            builder = builder
                .set_override(LOGS_LEVEL, v.as_str())
                .map_err(config_error)?;
        }
        if let Some(v) = &cli.node_name {
            builder = builder
                .set_override(NODE_NAME, v.as_str())
                .map_err(config_error)?;
        }

        let config = builder.build().map_err(config_error)?;
        Ok(Configuration { config })
    }

    // ========================================================================
    // Cluster
    // ========================================================================

    pub fn node_name(&self) -> Option<String> {
        self.config
            .get_string(NODE_NAME)
            .ok()
            .filter(|name| !name.is_empty())
    }

    pub fn cluster_private_key(&self) -> PathBuf {
        self.config
            .get_string(CLUSTER_PRIVATE_KEY)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_PRIVATE_KEY_PATH))
    }

    pub fn cluster_public_key(&self) -> PathBuf {
        self.config
            .get_string(CLUSTER_PUBLIC_KEY)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_PUBLIC_KEY_PATH))
    }

    // ========================================================================
    // Plugins
    // ========================================================================

    /// Persistence backend name and its options
    pub fn persistence(&self) -> (String, Value) {
        self.selected(PERSISTENCE, MEMORY_BACKEND)
    }

    /// Event transport name and its options
    pub fn events(&self) -> (String, Value) {
        self.selected(EVENTS, DEFAULT_TRANSPORT)
    }

    /// First entry of the map under `key`, or `default` with no options
    fn selected(&self, key: &str, default: &str) -> (String, Value) {
        let entries = match self.config.get::<Map<String, Value>>(key) {
            Ok(entries) => entries,
            Err(_) => return (default.to_string(), Value::Null),
        };
        if entries.len() > 1 {
            warn!(
                "{} lists {} entries, using the first of {:?}",
                key,
                entries.len(),
                entries.keys().collect::<Vec<_>>()
            );
        }
        entries
            .into_iter()
            .next()
            .unwrap_or_else(|| (default.to_string(), Value::Null))
    }

    // ========================================================================
    // Locks, sync and crypto
    // ========================================================================

    pub fn lock_acquire_timeout(&self) -> Duration {
        self.millis(LOCKS_ACQUIRE_TIMEOUT_MS, DEFAULT_ACQUIRE_TIMEOUT)
    }

    pub fn sync_fetch_timeout(&self) -> Duration {
        self.millis(SYNC_FETCH_TIMEOUT_MS, DEFAULT_FETCH_TIMEOUT)
    }

    fn millis(&self, key: &str, default: Duration) -> Duration {
        self.config
            .get_int(key)
            .ok()
            .and_then(|ms| u64::try_from(ms).ok())
            .map(Duration::from_millis)
            .unwrap_or(default)
    }

    pub fn spill_threshold(&self) -> usize {
        self.config
            .get_int(CRYPTO_SPILL_THRESHOLD)
            .ok()
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(DEFAULT_SPILL_THRESHOLD)
    }

    pub fn spill_dir(&self) -> Option<PathBuf> {
        self.config.get_string(CRYPTO_SPILL_DIR).ok().map(PathBuf::from)
    }

    // ========================================================================
    // Logging
    // ========================================================================

    pub fn log_level(&self) -> String {
        self.config
            .get_string(LOGS_LEVEL)
            .unwrap_or(DEFAULT_LOG_LEVEL.to_string())
    }

    pub fn log_path(&self) -> Option<PathBuf> {
        self.config.get_string(LOGS_PATH).ok().map(PathBuf::from)
    }

    pub fn logging_config(&self) -> LoggingConfig {
        LoggingConfig::from_config(self.log_path(), &self.log_level())
    }
}

fn config_error(e: config::ConfigError) -> TandemError {
    TandemError::Config(e.to_string())
}
