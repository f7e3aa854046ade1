//! Run configuration loaded from a JSON file.
//!
//! The config file uses kebab-case keys (`api-token`, `ssh-key-path`, ...).
//! The struct is loaded once at startup and treated as read-only for the
//! rest of the run.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Run configuration for a bootstrap invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// DigitalOcean API bearer token.
    pub api_token: String,
    /// Path to the SSH public key file; a leading `~` resolves to the home
    /// directory.
    pub ssh_key_path: String,
    /// Directory that holds the CA and all issued certificates.
    pub cert_dir: PathBuf,
    /// Droplet size slug, e.g. `s-1vcpu-2gb`.
    pub size: String,
    /// In-cluster apiserver service IP, embedded in the apiserver
    /// certificate's SAN set.
    #[serde(default = "default_service_ip")]
    pub service_ip: IpAddr,
    /// Optional deadline for the node readiness poll, in seconds. Absent
    /// means the poll waits indefinitely.
    #[serde(default)]
    pub node_ready_timeout_secs: Option<u64>,
    /// Disable ssh host-key verification (`StrictHostKeyChecking=no`).
    ///
    /// Opt-in: trades man-in-the-middle protection for convenience on
    /// freshly provisioned hosts not yet in `known_hosts`.
    #[serde(default)]
    pub insecure_ssh: bool,
}

fn default_service_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 3, 0, 1))
}

impl Config {
    /// Load and validate configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let mut config: Config = serde_json::from_str(&data).map_err(|e| {
            Error::config(format!("failed to parse {}: {}", path.display(), e))
        })?;

        if config.api_token.is_empty() {
            return Err(Error::config("api-token must not be empty"));
        }
        if config.size.is_empty() {
            return Err(Error::config("size must not be empty"));
        }
        config.ssh_key_path = expand_tilde(&config.ssh_key_path)?;

        Ok(config)
    }

    /// Read the SSH public key this run identifies with, trimmed of
    /// surrounding whitespace.
    pub fn read_public_key(&self) -> Result<String> {
        let data = std::fs::read_to_string(&self.ssh_key_path).map_err(|e| {
            Error::config(format!(
                "failed to read SSH public key {}: {}",
                self.ssh_key_path, e
            ))
        })?;
        Ok(data.trim().to_string())
    }
}

/// Resolve a leading `~/` against the home directory.
fn expand_tilde(path: &str) -> Result<String> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| Error::config("could not determine home directory"))?;
            Ok(home.join(rest).to_string_lossy().into_owned())
        }
        None => Ok(path.to_string()),
    }
}
