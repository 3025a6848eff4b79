//! Configuration types for edge-shaper

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Leaf queueing discipline attached under every HTB class
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SqmMode {
    /// Flow-queue CoDel
    #[serde(rename = "fq_codel")]
    FqCodel,
    /// CAKE with four-tin diffserv classification
    #[default]
    #[serde(rename = "cake diffserv4")]
    CakeDiffserv4,
}

impl SqmMode {
    /// The argument string appended to emitted `qdisc add` commands
    pub fn as_tc_args(&self) -> &'static str {
        match self {
            SqmMode::FqCodel => "fq_codel",
            SqmMode::CakeDiffserv4 => "cake diffserv4",
        }
    }

    /// Whether per-tin stats are expected in qdisc dumps
    pub fn has_tins(&self) -> bool {
        matches!(self, SqmMode::CakeDiffserv4)
    }
}

impl fmt::Display for SqmMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tc_args())
    }
}

/// Time-series publisher endpoint settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeSeriesConfig {
    /// Write endpoint base URL (default: "http://localhost:8086")
    #[serde(default = "default_ts_url")]
    pub url: String,

    /// Target bucket
    #[serde(default = "default_ts_bucket")]
    pub bucket: String,

    /// Organization name
    #[serde(default)]
    pub org: String,

    /// API token (empty = unauthenticated)
    #[serde(default)]
    pub token: String,
}

impl Default for TimeSeriesConfig {
    fn default() -> Self {
        Self {
            url: default_ts_url(),
            bucket: default_ts_bucket(),
            org: String::new(),
            token: String::new(),
        }
    }
}

/// Main configuration for the shaper control plane
///
/// All fields are enumerated explicitly and unknown keys are rejected, so a
/// typo in a config file fails the load instead of silently applying
/// defaults.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Leaf qdisc: fq_codel or cake diffserv4
    #[serde(default)]
    pub sqm: SqmMode,

    /// Mbps available to the edge of this network, download direction
    #[serde(default = "default_upstream_mbps")]
    pub upstream_bandwidth_capacity_download_mbps: u64,

    /// Mbps available to the edge of this network, upload direction
    #[serde(default = "default_upstream_mbps")]
    pub upstream_bandwidth_capacity_upload_mbps: u64,

    /// Download cap for each generated parent node (default: 1000)
    #[serde(default = "default_upstream_mbps")]
    pub generated_pn_download_mbps: u64,

    /// Upload cap for each generated parent node (default: 1000)
    #[serde(default = "default_upstream_mbps")]
    pub generated_pn_upload_mbps: u64,

    /// Interface facing the subscribers (egress = download shaping)
    #[serde(default = "default_interface_a")]
    pub interface_a: String,

    /// Interface facing the upstream (egress = upload shaping)
    #[serde(default = "default_interface_b")]
    pub interface_b: String,

    /// When false, commands are logged but never executed (simulated run)
    #[serde(default = "default_true")]
    pub enable_actual_shell_commands: bool,

    /// Prefix every shell invocation with sudo
    #[serde(default)]
    pub run_shell_commands_as_sudo: bool,

    /// Override for queue/CPU discovery; 0 = auto-detect
    #[serde(default)]
    pub queues_available_override: usize,

    /// Bin-pack unparented circuits across CPU cores by weight instead of
    /// round-robin (inefficient past ~25k subscribers)
    #[serde(default = "default_true")]
    pub use_bin_packing_to_balance_cpu: bool,

    /// TCP overhead factor applied to plan rates so subscribers can reach
    /// their advertised speed on a speed test (default: 1.09)
    #[serde(default = "default_tcp_overhead_factor")]
    pub tcp_overhead_factor: f64,

    /// Extra cushion multiplier on top of plan rates (default: 1.0)
    #[serde(default = "default_bandwidth_overhead_factor")]
    pub bandwidth_overhead_factor: f64,

    /// Directory holding the cpumap/XDP toolchain
    /// (expects `src/xdp_iphash_to_cpu_cmdline`, `src/xdp_iphash_to_cpu`,
    /// `src/tc_classify` and `bin/xps_setup.sh` beneath it)
    #[serde(default = "default_xdp_dir")]
    pub xdp_tool_dir: PathBuf,

    /// Directory for on-disk snapshots (compiled structure, stats, last-run)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Time-series publisher settings
    #[serde(default)]
    pub time_series: TimeSeriesConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sqm: SqmMode::default(),
            upstream_bandwidth_capacity_download_mbps: default_upstream_mbps(),
            upstream_bandwidth_capacity_upload_mbps: default_upstream_mbps(),
            generated_pn_download_mbps: default_upstream_mbps(),
            generated_pn_upload_mbps: default_upstream_mbps(),
            interface_a: default_interface_a(),
            interface_b: default_interface_b(),
            enable_actual_shell_commands: true,
            run_shell_commands_as_sudo: false,
            queues_available_override: 0,
            use_bin_packing_to_balance_cpu: true,
            tcp_overhead_factor: default_tcp_overhead_factor(),
            bandwidth_overhead_factor: default_bandwidth_overhead_factor(),
            xdp_tool_dir: default_xdp_dir(),
            data_dir: default_data_dir(),
            time_series: TimeSeriesConfig::default(),
        }
    }
}

impl Config {
    /// Load and validate a configuration file (JSON)
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&raw).map_err(|e| Error::Config {
            message: format!("failed to parse {}: {}", path.display(), e),
            key: None,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints the serde layer cannot express
    pub fn validate(&self) -> Result<()> {
        if self.interface_a.is_empty() {
            return Err(Error::config_key("must not be empty", "interface_a"));
        }
        if self.interface_b.is_empty() {
            return Err(Error::config_key("must not be empty", "interface_b"));
        }
        if self.interface_a == self.interface_b {
            return Err(Error::config_key(
                "interface_a and interface_b must differ",
                "interface_b",
            ));
        }
        if self.upstream_bandwidth_capacity_download_mbps < 2
            || self.upstream_bandwidth_capacity_upload_mbps < 2
        {
            return Err(Error::config(
                "upstream capacity must be at least 2 Mbps in each direction",
            ));
        }
        if self.tcp_overhead_factor < 1.0 {
            return Err(Error::config_key(
                "must be >= 1.0",
                "tcp_overhead_factor",
            ));
        }
        if self.bandwidth_overhead_factor < 1.0 {
            return Err(Error::config_key(
                "must be >= 1.0",
                "bandwidth_overhead_factor",
            ));
        }
        Ok(())
    }

    /// The upstream capacity shaped on the given interface's direction
    pub fn upstream_mbps(&self, download: bool) -> u64 {
        if download {
            self.upstream_bandwidth_capacity_download_mbps
        } else {
            self.upstream_bandwidth_capacity_upload_mbps
        }
    }

    /// Combined overhead multiplier applied to every plan number at load
    pub fn overhead_factor(&self) -> f64 {
        self.tcp_overhead_factor * self.bandwidth_overhead_factor
    }

    /// Path of the per-IP XDP map tool
    pub fn xdp_cmdline_tool(&self) -> PathBuf {
        self.xdp_tool_dir.join("src/xdp_iphash_to_cpu_cmdline")
    }

    /// Path of the XDP program loader
    pub fn xdp_loader(&self) -> PathBuf {
        self.xdp_tool_dir.join("src/xdp_iphash_to_cpu")
    }

    /// Path of the egress tc classifier attach tool
    pub fn tc_classify_tool(&self) -> PathBuf {
        self.xdp_tool_dir.join("src/tc_classify")
    }

    /// Path of the XPS disable helper script
    pub fn xps_setup_script(&self) -> PathBuf {
        self.xdp_tool_dir.join("bin/xps_setup.sh")
    }
}

fn default_upstream_mbps() -> u64 {
    1000
}

fn default_interface_a() -> String {
    "eth1".to_string()
}

fn default_interface_b() -> String {
    "eth2".to_string()
}

fn default_true() -> bool {
    true
}

fn default_tcp_overhead_factor() -> f64 {
    1.09
}

fn default_bandwidth_overhead_factor() -> f64 {
    1.0
}

fn default_xdp_dir() -> PathBuf {
    PathBuf::from("./cpumap-pping")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_ts_url() -> String {
    "http://localhost:8086".to_string()
}

fn default_ts_bucket() -> String {
    "edge-shaper".to_string()
}
