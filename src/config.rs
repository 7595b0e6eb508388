//! Runtime configuration (spec §11): CLI flags via `clap`, optionally
//! merged with a TOML file via the `config` crate. CLI flags always win
//! over file values, matching spec §6's "CLI flags with sane defaults"
//! contract.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::{NidsError, Result};

#[derive(Debug, Parser)]
#[command(name = "nids", about = "Network intrusion detection service")]
pub struct Cli {
    /// Network interface to capture on. Leave unset to run in replay/test
    /// mode with no live capture source.
    #[arg(long)]
    pub interface: Option<String>,

    #[arg(long)]
    pub rules_dir: Option<PathBuf>,

    #[arg(long)]
    pub db_url: Option<String>,

    #[arg(long)]
    pub firewall_config: Option<PathBuf>,

    /// Optional TOML file with defaults for any flag not given on the
    /// command line.
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub queue_capacity: Option<usize>,

    #[arg(long)]
    pub workers: Option<usize>,

    /// Control-plane HTTP bind address, e.g. 127.0.0.1:8080.
    #[arg(long)]
    pub bind: Option<SocketAddr>,
}

/// Fully resolved configuration the runtime is built from. Every field has
/// a default so the binary runs out of the box in replay/test mode
/// without a config file or root privileges (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub interface: Option<String>,
    pub rules_dir: PathBuf,
    pub db_url: Option<String>,
    pub firewall_config: Option<PathBuf>,
    pub queue_capacity: usize,
    pub worker_count: usize,
    pub session_idle_timeout_secs: u64,
    pub max_window_secs: u64,
    pub emit_on_every_match: bool,
    pub control_bind_addr: SocketAddr,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            interface: None,
            rules_dir: PathBuf::from("rules"),
            db_url: None,
            firewall_config: None,
            queue_capacity: 1000,
            worker_count: 2,
            session_idle_timeout_secs: 60,
            max_window_secs: 3600,
            emit_on_every_match: false,
            control_bind_addr: "127.0.0.1:8080".parse().unwrap(),
        }
    }
}

impl RuntimeConfig {
    /// Loads an optional TOML file, then overlays any CLI flags the
    /// operator actually passed. A missing `--config` file is not an
    /// error: defaults (overridden by CLI flags) are used as-is.
    pub fn resolve(cli: Cli) -> Result<RuntimeConfig> {
        let mut config = match &cli.config {
            Some(path) => load_toml_file(path)?,
            None => RuntimeConfig::default(),
        };

        if let Some(interface) = cli.interface {
            config.interface = Some(interface);
        }
        if let Some(rules_dir) = cli.rules_dir {
            config.rules_dir = rules_dir;
        }
        if let Some(db_url) = cli.db_url {
            config.db_url = Some(db_url);
        }
        if let Some(firewall_config) = cli.firewall_config {
            config.firewall_config = Some(firewall_config);
        }
        if let Some(queue_capacity) = cli.queue_capacity {
            config.queue_capacity = queue_capacity;
        }
        if let Some(workers) = cli.workers {
            config.worker_count = workers;
        }
        if let Some(bind) = cli.bind {
            config.control_bind_addr = bind;
        }

        Ok(config)
    }
}

fn load_toml_file(path: &std::path::Path) -> Result<RuntimeConfig> {
    let settings = config::Config::builder()
        .add_source(config::File::from(path))
        .build()
        .map_err(|e| NidsError::Config(format!("failed to load {path:?}: {e}")))?;
    settings
        .try_deserialize()
        .map_err(|e| NidsError::Config(format!("invalid configuration in {path:?}: {e}")))
}
