//! Configuration options for the reassembly core.
//!
//! Follows `config.rs`'s `RuntimeConfig`/`ConnTrackConfig`/`MempoolConfig`
//! shape — per-field `#[serde(default = "...")]` values, a `load_config`
//! entry point that reads and parses a TOML file, and a `default_config`/
//! `Default` pair for demonstration/testing use. This module covers only the
//! keys the reassembly core owns; run-mode, interface, and classification-
//! table configuration belong to other parts of the engine and aren't
//! represented here.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

/// Loads a reassembly configuration file from `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> ReassemblyConfig {
    let config_str = fs::read_to_string(path).expect("ERROR: File read failed");
    let config: ReassemblyConfig = toml::from_str(&config_str).expect("Invalid config file");
    config
}

/// Returns a default configuration.
///
/// For demonstration and test purposes only. Equivalent to:
/// ```toml
/// reassembly_depth = 1_048_576
/// reassembly_memcap = 134_217_728
/// reassembly_toserver_chunk_size = 2560
/// reassembly_toclient_chunk_size = 2560
/// check_overlap_different_data = false
/// inline_mode = false
///
/// [os_policy]
///     "0.0.0.0/0" = "linux"
/// ```
pub fn default_config() -> ReassemblyConfig {
    ReassemblyConfig::default()
}

/* --------------------------------------------------------------------------------- */

/// Runtime configuration for the reassembly core.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ReassemblyConfig {
    /// Maximum bytes per direction accepted into reassembly before the
    /// stream is marked `DEPTH_REACHED`. `0` means unlimited. Defaults to
    /// `1_048_576` (1 MiB).
    #[serde(default = "default_reassembly_depth")]
    pub reassembly_depth: u32,

    /// Global byte cap across all segment payloads and records, shared by
    /// every flow on a worker. Defaults to `134_217_728` (128 MiB).
    #[serde(default = "default_reassembly_memcap")]
    pub reassembly_memcap: usize,

    /// Raw-matcher sliding-window size toward the server, in bytes.
    /// Defaults to `2560`.
    #[serde(default = "default_chunk_size")]
    pub reassembly_toserver_chunk_size: u32,

    /// Raw-matcher sliding-window size toward the client, in bytes.
    /// Defaults to `2560`.
    #[serde(default = "default_chunk_size")]
    pub reassembly_toclient_chunk_size: u32,

    /// Chunk size the app-layer reassembler accumulates before delivering a
    /// buffer to the parser. Defaults to `4096`.
    #[serde(default = "default_app_chunk_size")]
    pub app_chunk_size: usize,

    /// Minimum unacknowledged opposite-direction byte count that triggers
    /// raw reassembly outside of the other trigger conditions. Defaults to
    /// `2560` (matches the default chunk size).
    #[serde(default = "default_raw_check_min_len")]
    pub raw_check_min_len: u32,

    /// Enables the `OVERLAP_DIFFERENT_DATA` event. Defaults to `false`.
    #[serde(default = "default_check_overlap")]
    pub check_overlap_different_data: bool,

    /// Enables the inline (IPS) reassembly variants. Defaults to `false`.
    #[serde(default = "default_inline_mode")]
    pub inline_mode: bool,

    /// Target-OS overlap policy keyed by destination host or subnet
    /// (`os_policy.<host|subnet>`). TOML keys are IPv4/IPv6 addresses or
    /// CIDR subnets (e.g. `"10.0.0.0/8"`); the most specific (longest-
    /// prefix) match wins. A bare IP address is treated as a `/32`/`/128`
    /// subnet.
    #[serde(default = "default_os_policy_map")]
    pub os_policy: HashMap<String, OsPolicy>,

    /// Default policy applied when no `os_policy` entry matches the
    /// destination. Defaults to `OsPolicy::Linux`.
    #[serde(default = "default_os_policy")]
    pub default_os_policy: OsPolicy,
}

impl ReassemblyConfig {
    /// Builds the resolver used to map a destination address to an
    /// `OsPolicy`. Longest-prefix-match is the conventional rule for
    /// subnet-keyed overrides, matching how an IDS's host-os policy table
    /// is normally organized: most-specific subnet first.
    pub fn os_policy_table(&self) -> OsPolicyTable {
        let mut entries: Vec<(IpNet, OsPolicy)> = self
            .os_policy
            .iter()
            .filter_map(|(k, v)| parse_host_or_subnet(k).map(|net| (net, *v)))
            .collect();
        // Longest prefix first so the first match found is most specific.
        entries.sort_by_key(|(net, _)| std::cmp::Reverse(net.prefix_len()));
        OsPolicyTable {
            entries,
            default: self.default_os_policy,
        }
    }
}

fn parse_host_or_subnet(s: &str) -> Option<IpNet> {
    if let Ok(net) = IpNet::from_str(s) {
        return Some(net);
    }
    s.parse::<std::net::IpAddr>().ok().map(IpNet::from)
}

/// Resolves a destination address to a target-OS overlap policy.
#[derive(Debug, Clone)]
pub struct OsPolicyTable {
    entries: Vec<(IpNet, OsPolicy)>,
    default: OsPolicy,
}

impl OsPolicyTable {
    pub fn resolve(&self, addr: std::net::IpAddr) -> OsPolicy {
        self.entries
            .iter()
            .find(|(net, _)| net.contains(&addr))
            .map(|(_, policy)| *policy)
            .unwrap_or(self.default)
    }
}

/// Target-host TCP-stack overlap policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OsPolicy {
    Bsd,
    Hpux10,
    Hpux11,
    Irix,
    Windows,
    Windows2k3,
    OldLinux,
    Linux,
    Macos,
    Last,
    First,
    Vista,
    Solaris,
}

impl Default for OsPolicy {
    fn default() -> Self {
        OsPolicy::Linux
    }
}

fn default_reassembly_depth() -> u32 {
    1_048_576
}

fn default_reassembly_memcap() -> usize {
    134_217_728
}

fn default_chunk_size() -> u32 {
    2560
}

fn default_app_chunk_size() -> usize {
    4096
}

fn default_raw_check_min_len() -> u32 {
    2560
}

fn default_check_overlap() -> bool {
    false
}

fn default_inline_mode() -> bool {
    false
}

fn default_os_policy() -> OsPolicy {
    OsPolicy::Linux
}

fn default_os_policy_map() -> HashMap<String, OsPolicy> {
    HashMap::new()
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        ReassemblyConfig {
            reassembly_depth: default_reassembly_depth(),
            reassembly_memcap: default_reassembly_memcap(),
            reassembly_toserver_chunk_size: default_chunk_size(),
            reassembly_toclient_chunk_size: default_chunk_size(),
            app_chunk_size: default_app_chunk_size(),
            raw_check_min_len: default_raw_check_min_len(),
            check_overlap_different_data: default_check_overlap(),
            inline_mode: default_inline_mode(),
            os_policy: default_os_policy_map(),
            default_os_policy: default_os_policy(),
        }
    }
}
