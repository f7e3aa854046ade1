//! dokube - bootstraps a two-node CoreOS Kubernetes cluster on DigitalOcean
//!
//! dokube provisions a master and a worker droplet, stands up a single-node
//! etcd on the master, issues TLS certificates from a local CA, runs the
//! CoreOS install scripts remotely, and configures a local kubectl admin
//! context. Re-running the tool is safe: nodes are looked up by their
//! deterministic names, the CA is reused from disk, and the etcd endpoint is
//! probed before any launch.
//!
//! # Modules
//!
//! - [`config`] - Run configuration loaded from a JSON file
//! - [`pki`] - Certificate authority and leaf certificate issuance
//! - [`remote`] - Command execution and file transfer over ssh/scp
//! - [`provider`] - DigitalOcean API client and node provisioner
//! - [`bootstrap`] - The sequential cluster bootstrap orchestrator
//! - [`kubeconfig`] - Local kubectl admin context configuration
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod kubeconfig;
pub mod pki;
pub mod provider;
pub mod remote;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
