//! Configuration for vpcagentd.
//!
//! Loaded from a TOML file (default `/etc/vpcagent/vpcagent.conf`), then
//! overridden by command-line flags. Intervals and page size have floors
//! that [`AgentConfig::validate`] enforces by clamping.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;
use vpc_ovnutil::OVN_NBCTL_CMD;

use crate::error::{AgentError, AgentResult};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/vpcagent/vpcagent.conf";

/// Minimum model sync interval.
pub const MIN_SYNC_INTERVAL_SECS: u64 = 10;

/// Minimum list page size.
pub const MIN_LIST_BATCH_SIZE: usize = 20;

/// Minimum northbound re-check interval.
pub const MIN_RESYNC_INTERVAL_SECS: u64 = 60;

/// Orchestration API access.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL of the compute API, e.g. `https://region.example.com/api/v2/`
    #[serde(default)]
    pub base_url: String,

    /// Bearer token obtained by the external auth collaborator
    #[serde(default)]
    pub token: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_api_timeout")]
    pub timeout_secs: u64,

    /// Restrict listings to one region (empty: all)
    #[serde(default)]
    pub region: String,
}

/// Model sync loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,

    #[serde(default = "default_list_batch_size")]
    pub list_batch_size: usize,
}

/// Northbound database access and reconcile loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OvnConfig {
    /// Northbound address, e.g. `tcp:10.0.0.1:6641` (empty: local default)
    #[serde(default)]
    pub nb_db: String,

    #[serde(default = "default_ovn_nbctl")]
    pub ovn_nbctl: String,

    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    #[serde(default = "default_resync_interval")]
    pub resync_interval_secs: u64,
}

/// Complete vpcagentd configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub ovn: OvnConfig,

    /// Default log filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_api_timeout() -> u64 {
    30
}

fn default_sync_interval() -> u64 {
    MIN_SYNC_INTERVAL_SECS
}

fn default_list_batch_size() -> usize {
    1024
}

fn default_ovn_nbctl() -> String {
    OVN_NBCTL_CMD.to_string()
}

fn default_command_timeout() -> u64 {
    8
}

fn default_resync_interval() -> u64 {
    180
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            token: String::new(),
            timeout_secs: default_api_timeout(),
            region: String::new(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: default_sync_interval(),
            list_batch_size: default_list_batch_size(),
        }
    }
}

impl Default for OvnConfig {
    fn default() -> Self {
        Self {
            nb_db: String::new(),
            ovn_nbctl: default_ovn_nbctl(),
            command_timeout_secs: default_command_timeout(),
            resync_interval_secs: default_resync_interval(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            sync: SyncConfig::default(),
            ovn: OvnConfig::default(),
            log_level: default_log_level(),
        }
    }
}

/// VPC agent: syncs the orchestration API model into the OVN northbound DB
#[derive(Parser, Debug, Default)]
#[command(name = "vpcagentd")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Orchestration API base URL
    #[arg(long)]
    pub api_url: Option<String>,

    /// Orchestration API bearer token
    #[arg(long)]
    pub api_token: Option<String>,

    /// Region to list resources from
    #[arg(long)]
    pub region: Option<String>,

    /// Model sync interval in seconds (minimum 10)
    #[arg(long)]
    pub sync_interval_secs: Option<u64>,

    /// List page size (minimum 20)
    #[arg(long)]
    pub list_batch_size: Option<usize>,

    /// Northbound database address
    #[arg(long)]
    pub nb_db: Option<String>,

    /// Path to ovn-nbctl
    #[arg(long)]
    pub ovn_nbctl: Option<String>,

    /// ovn-nbctl timeout in seconds
    #[arg(long)]
    pub command_timeout_secs: Option<u64>,

    /// Northbound re-check interval in seconds (minimum 60)
    #[arg(long)]
    pub resync_interval_secs: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long)]
    pub log_level: Option<String>,
}

impl AgentConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> AgentResult<Self> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|e| {
                AgentError::invalid_config(path.display().to_string(), e.to_string())
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                eprintln!(
                    "vpcagentd: Config file {} not found, using defaults",
                    path.display()
                );
                Ok(Self::default())
            }
            Err(e) => Err(AgentError::invalid_config(
                path.display().to_string(),
                e.to_string(),
            )),
        }
    }

    /// Overrides file settings with command-line flags.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(v) = &cli.api_url {
            self.api.base_url = v.clone();
        }
        if let Some(v) = &cli.api_token {
            self.api.token = v.clone();
        }
        if let Some(v) = &cli.region {
            self.api.region = v.clone();
        }
        if let Some(v) = cli.sync_interval_secs {
            self.sync.sync_interval_secs = v;
        }
        if let Some(v) = cli.list_batch_size {
            self.sync.list_batch_size = v;
        }
        if let Some(v) = &cli.nb_db {
            self.ovn.nb_db = v.clone();
        }
        if let Some(v) = &cli.ovn_nbctl {
            self.ovn.ovn_nbctl = v.clone();
        }
        if let Some(v) = cli.command_timeout_secs {
            self.ovn.command_timeout_secs = v;
        }
        if let Some(v) = cli.resync_interval_secs {
            self.ovn.resync_interval_secs = v;
        }
        if let Some(v) = &cli.log_level {
            self.log_level = v.clone();
        }
    }

    /// Clamps values below their floors and rejects unusable settings.
    pub fn validate(&mut self) -> AgentResult<()> {
        if self.api.base_url.trim().is_empty() {
            return Err(AgentError::invalid_config("api.base_url", "must not be empty"));
        }
        if self.ovn.command_timeout_secs == 0 {
            return Err(AgentError::invalid_config(
                "ovn.command_timeout_secs",
                "must be > 0",
            ));
        }
        if self.sync.sync_interval_secs < MIN_SYNC_INTERVAL_SECS {
            warn!(
                configured = self.sync.sync_interval_secs,
                minimum = MIN_SYNC_INTERVAL_SECS,
                "sync_interval_secs below minimum, clamping"
            );
            self.sync.sync_interval_secs = MIN_SYNC_INTERVAL_SECS;
        }
        if self.sync.list_batch_size < MIN_LIST_BATCH_SIZE {
            warn!(
                configured = self.sync.list_batch_size,
                minimum = MIN_LIST_BATCH_SIZE,
                "list_batch_size below minimum, clamping"
            );
            self.sync.list_batch_size = MIN_LIST_BATCH_SIZE;
        }
        if self.ovn.resync_interval_secs < MIN_RESYNC_INTERVAL_SECS {
            warn!(
                configured = self.ovn.resync_interval_secs,
                minimum = MIN_RESYNC_INTERVAL_SECS,
                "resync_interval_secs below minimum, clamping"
            );
            self.ovn.resync_interval_secs = MIN_RESYNC_INTERVAL_SECS;
        }
        Ok(())
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync.sync_interval_secs)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.ovn.resync_interval_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.ovn.command_timeout_secs)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api.timeout_secs)
    }
}
