//! Node configuration
//!
//! Loaded from a TOML file; every field has a default so a bare file (or no
//! file at all) yields a runnable single-domain node.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::space::model::{AccessLatency, RetentionPolicy, VoInfo};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub space: SpaceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Domain name this nucleus answers to.
    #[serde(default = "default_domain")]
    pub domain: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            domain: default_domain(),
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Listen address for inbound tunnels; unset disables the listener.
    #[serde(default)]
    pub listen_addr: Option<String>,
    /// Peer addresses to dial at startup.
    #[serde(default)]
    pub peers: Vec<String>,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        TunnelConfig {
            listen_addr: None,
            peers: Vec::new(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_max_active")]
    pub max_active: usize,
    /// Queue discipline within a priority: true for FIFO, false for LIFO.
    #[serde(default = "default_fifo")]
    pub fifo: bool,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            max_active: default_max_active(),
            fifo: default_fifo(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpaceConfig {
    #[serde(default = "default_db_pool_size")]
    pub db_pool_size: usize,
    /// Expiry sweep period.
    #[serde(default = "default_expire_period_ms")]
    pub expire_period_ms: u64,
    /// Link-group telemetry refresh period.
    #[serde(default = "default_refresh_period_ms")]
    pub refresh_period_ms: u64,
    /// Lifetime applied to reservations created without one.
    #[serde(default = "default_lifetime_ms")]
    pub default_lifetime_ms: i64,
    /// Lifetime applied to file records the manager creates on its own.
    #[serde(default = "default_implicit_lifetime_ms")]
    pub implicit_lifetime_ms: i64,
    #[serde(default = "default_access_latency")]
    pub default_access_latency: AccessLatency,
    #[serde(default = "default_retention_policy")]
    pub default_retention_policy: RetentionPolicy,
    /// Create an implicit reservation for writes that carry no token.
    #[serde(default)]
    pub reserve_for_unsolicited_writes: bool,
    /// Drop file pledges whose lifetime passed without a transfer.
    #[serde(default = "default_true")]
    pub cleanup_expired_space_files: bool,
    /// Delete a file record once stored instead of counting it as used.
    #[serde(default)]
    pub delete_stored_file_record: bool,
    /// Refuse link-group selection when telemetry is stale; when off, stale
    /// figures are served as-is.
    #[serde(default)]
    pub require_cost_data: bool,
    /// Cell path of the cost-table provider; unset disables the refresher.
    #[serde(default)]
    pub cost_table_provider: Option<String>,
    #[serde(default)]
    pub link_groups: Vec<LinkGroupConfig>,
}

impl Default for SpaceConfig {
    fn default() -> Self {
        SpaceConfig {
            db_pool_size: default_db_pool_size(),
            expire_period_ms: default_expire_period_ms(),
            refresh_period_ms: default_refresh_period_ms(),
            default_lifetime_ms: default_lifetime_ms(),
            implicit_lifetime_ms: default_implicit_lifetime_ms(),
            default_access_latency: default_access_latency(),
            default_retention_policy: default_retention_policy(),
            reserve_for_unsolicited_writes: false,
            cleanup_expired_space_files: true,
            delete_stored_file_record: false,
            require_cost_data: false,
            cost_table_provider: None,
            link_groups: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkGroupConfig {
    pub name: String,
    /// Pools whose telemetry feeds this group's free space.
    #[serde(default)]
    pub pools: Vec<String>,
    /// Static free space, used until (or instead of) telemetry arrives.
    #[serde(default)]
    pub free_space: i64,
    #[serde(default = "default_true")]
    pub online_allowed: bool,
    #[serde(default = "default_true")]
    pub nearline_allowed: bool,
    #[serde(default = "default_true")]
    pub replica_allowed: bool,
    #[serde(default = "default_true")]
    pub output_allowed: bool,
    #[serde(default = "default_true")]
    pub custodial_allowed: bool,
    #[serde(default)]
    pub authorized: Vec<AuthorizedVo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizedVo {
    pub group: String,
    #[serde(default = "default_role")]
    pub role: String,
}

impl AuthorizedVo {
    pub fn to_vo_info(&self) -> VoInfo {
        VoInfo::new(self.group.clone(), self.role.clone())
    }
}

impl Config {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        use anyhow::Context;
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
    }
}

fn default_domain() -> String {
    "gridspace".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_max_active() -> usize {
    num_cpus::get()
}

fn default_fifo() -> bool {
    true
}

fn default_shutdown_grace_ms() -> u64 {
    10_000
}

fn default_db_pool_size() -> usize {
    4
}

fn default_expire_period_ms() -> u64 {
    60_000
}

fn default_refresh_period_ms() -> u64 {
    120_000
}

fn default_lifetime_ms() -> i64 {
    24 * 3600 * 1000
}

fn default_implicit_lifetime_ms() -> i64 {
    3_600_000
}

fn default_access_latency() -> AccessLatency {
    AccessLatency::Nearline
}

fn default_retention_policy() -> RetentionPolicy {
    RetentionPolicy::Custodial
}

fn default_true() -> bool {
    true
}

fn default_role() -> String {
    "*".to_string()
}
