//! Cloud node provisioning against the DigitalOcean control plane.
//!
//! The [`Provisioner`] owns its API client and per-run caches of regions and
//! droplets - an explicit instance passed by reference, never process-wide
//! state. Node creation is idempotent: nodes are addressed by deterministic
//! name (`coreos-<role>-<ordinal>-<region>`), and an existing node is reused
//! unchanged unless a rebuild is forced.

mod digitalocean;

use std::fmt;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info};

pub use digitalocean::{
    DoClient, Droplet, DropletCreate, NetworkV4, Networks, Region, SshKey, DEFAULT_BASE_URL,
    DROPLET_IMAGE,
};

/// Interval between droplet readiness polls
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Droplet status value that ends the readiness poll
const STATUS_ACTIVE: &str = "active";

/// Provider errors
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The API answered outside the 2xx range
    #[error("API error: {status}: {body}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Response body, verbatim
        body: String,
    },

    /// HTTP transport failure
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// No available region offers the requested size
    #[error("no available region offers size {0}")]
    NoRegionForSize(String),

    /// A node has no public IPv4 attachment
    #[error("node {0} has no public IPv4 address")]
    NoPublicIpv4(String),

    /// A node reported an address that does not parse
    #[error("node {node} reported unparseable address {addr}")]
    InvalidAddress {
        /// Node name
        node: String,
        /// The offending address string
        addr: String,
    },

    /// The readiness poll exceeded its configured deadline
    #[error("node {node} not active after {waited_secs}s")]
    ReadyTimeout {
        /// Node name
        node: String,
        /// Seconds waited before giving up
        waited_secs: u64,
    },
}

/// Result type for provider operations
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Node role, determining its deterministic name and install script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    /// Control-plane node running etcd and the apiserver
    Master,
    /// Workload node
    Worker,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Master => write!(f, "master"),
            NodeRole::Worker => write!(f, "worker"),
        }
    }
}

/// Deterministic node name for a role, ordinal, and region.
pub fn node_name(role: NodeRole, ordinal: u32, region: &str) -> String {
    format!("coreos-{}-{}-{}", role, ordinal, region)
}

/// Provisions and caches compute nodes for one bootstrap run.
#[derive(Debug)]
pub struct Provisioner {
    client: DoClient,
    size: String,
    regions: Vec<Region>,
    droplets: Vec<Droplet>,
    poll_interval: Duration,
    ready_deadline: Option<Duration>,
}

impl Provisioner {
    /// Create a provisioner for the given droplet size.
    pub fn new(client: DoClient, size: impl Into<String>) -> Self {
        Self {
            client,
            size: size.into(),
            regions: Vec::new(),
            droplets: Vec::new(),
            poll_interval: POLL_INTERVAL,
            ready_deadline: None,
        }
    }

    /// Override the readiness poll interval (tests).
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Bound the readiness poll with a deadline. Without one the poll waits
    /// indefinitely.
    #[must_use]
    pub fn with_ready_deadline(mut self, deadline: Duration) -> Self {
        self.ready_deadline = Some(deadline);
        self
    }

    /// Snapshot regions and existing droplets.
    ///
    /// Must run before any name-based lookup; `ensure_node` trusts these
    /// caches for the create-or-reuse decision.
    pub async fn refresh(&mut self) -> Result<()> {
        self.regions = self.client.list_regions().await?;
        self.droplets = self.client.list_droplets().await?;
        debug!(
            regions = self.regions.len(),
            droplets = self.droplets.len(),
            "snapshotted provider state"
        );
        Ok(())
    }

    /// Cached regions from the last [`refresh`](Self::refresh).
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Cached droplets from the last [`refresh`](Self::refresh), plus any
    /// nodes created or rebuilt since.
    pub fn nodes(&self) -> &[Droplet] {
        &self.droplets
    }

    /// Resolve the id of the SSH key matching `public_key`, registering it
    /// if the provider does not know it yet.
    ///
    /// Matching is by exact byte equality of the public key material, not by
    /// fingerprint or name.
    pub async fn ensure_ssh_key(&self, public_key: &str) -> Result<u64> {
        let keys = self.client.list_keys().await?;
        if let Some(key) = keys.iter().find(|k| k.public_key == public_key) {
            info!(name = %key.name, fingerprint = %key.fingerprint, "using registered SSH key");
            return Ok(key.id);
        }

        let user = std::env::var("USER").unwrap_or_else(|_| "dokube".to_string());
        let key = self
            .client
            .create_key(&format!("{}'s key", user), public_key)
            .await?;
        info!(name = %key.name, fingerprint = %key.fingerprint, "registered new SSH key");
        Ok(key.id)
    }

    /// First available cached region offering the configured size.
    pub fn pick_region(&self) -> Result<&Region> {
        self.regions
            .iter()
            .find(|r| r.available && r.sizes.iter().any(|s| s == &self.size))
            .ok_or_else(|| ProviderError::NoRegionForSize(self.size.clone()))
    }

    /// Ensure the node for `role`/`ordinal` exists and is active.
    ///
    /// - No cached node of that name: create it and poll until `active`.
    /// - Cached node, no rebuild: return the cached record unchanged (the
    ///   caller re-derives the IP from it).
    /// - Cached node, `force_rebuild`: rebuild in place (same id, fresh
    ///   image) and poll until `active` again.
    pub async fn ensure_node(
        &mut self,
        ssh_key_id: u64,
        role: NodeRole,
        ordinal: u32,
        force_rebuild: bool,
    ) -> Result<Droplet> {
        let region = self.pick_region()?.slug.clone();
        let name = node_name(role, ordinal, &region);

        if let Some(existing) = self.droplets.iter().find(|d| d.name == name) {
            if !force_rebuild {
                info!(node = %name, id = existing.id, "reusing existing node");
                return Ok(existing.clone());
            }
            let id = existing.id;
            info!(node = %name, id, image = DROPLET_IMAGE, "rebuilding node in place");
            self.client.rebuild_droplet(id, DROPLET_IMAGE).await?;
            let node = self.wait_until_active(id, &name).await?;
            if let Some(slot) = self.droplets.iter_mut().find(|d| d.id == id) {
                *slot = node.clone();
            }
            return Ok(node);
        }

        info!(node = %name, region = %region, size = %self.size, "creating node");
        let request = DropletCreate::new(&name, &region, &self.size, ssh_key_id);
        let created = self.client.create_droplet(&request).await?;
        let node = self.wait_until_active(created.id, &name).await?;
        self.droplets.push(node.clone());
        Ok(node)
    }

    /// Poll the droplet by id until it reports `active`.
    async fn wait_until_active(&self, id: u64, name: &str) -> Result<Droplet> {
        let started = Instant::now();
        loop {
            let droplet = self.client.get_droplet(id).await?;
            if droplet.status == STATUS_ACTIVE {
                info!(node = %name, id, "node active");
                return Ok(droplet);
            }

            if let Some(deadline) = self.ready_deadline {
                if started.elapsed() >= deadline {
                    return Err(ProviderError::ReadyTimeout {
                        node: name.to_string(),
                        waited_secs: started.elapsed().as_secs(),
                    });
                }
            }

            debug!(node = %name, status = %droplet.status, "waiting for node");
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// The node's public IPv4 address. There is no fallback: a node without
    /// a public v4 attachment fails the run.
    pub fn public_ipv4(droplet: &Droplet) -> Result<Ipv4Addr> {
        let entry = droplet
            .networks
            .v4
            .iter()
            .find(|n| n.kind == "public")
            .ok_or_else(|| ProviderError::NoPublicIpv4(droplet.name.clone()))?;
        entry
            .ip_address
            .parse()
            .map_err(|_| ProviderError::InvalidAddress {
                node: droplet.name.clone(),
                addr: entry.ip_address.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn region_json(slug: &str, sizes: &[&str]) -> serde_json::Value {
        json!({
            "slug": slug,
            "name": slug.to_uppercase(),
            "sizes": sizes,
            "available": true,
        })
    }

    fn droplet_json(id: u64, name: &str, status: &str, public_ip: &str) -> serde_json::Value {
        json!({
            "id": id,
            "name": name,
            "status": status,
            "networks": {
                "v4": [
                    {"ip_address": "10.128.0.2", "type": "private"},
                    {"ip_address": public_ip, "type": "public"},
                ]
            },
        })
    }

    async fn provisioner(server: &MockServer, size: &str) -> Provisioner {
        let client = DoClient::new("test-token")
            .unwrap()
            .with_base_url(server.uri());
        Provisioner::new(client, size).with_poll_interval(Duration::from_millis(10))
    }

    #[test]
    fn node_names_are_deterministic() {
        assert_eq!(node_name(NodeRole::Master, 0, "nyc3"), "coreos-master-0-nyc3");
        assert_eq!(node_name(NodeRole::Worker, 2, "ams3"), "coreos-worker-2-ams3");
    }

    #[test]
    fn region_selection_picks_first_offering_the_size() {
        let client = DoClient::new("t").unwrap();
        let mut p = Provisioner::new(client, "s-2vcpu");
        p.regions = vec![
            serde_json::from_value(region_json("ams3", &["s-1vcpu"])).unwrap(),
            serde_json::from_value(region_json("nyc3", &["s-2vcpu"])).unwrap(),
        ];

        assert_eq!(p.pick_region().unwrap().slug, "nyc3");
    }

    #[test]
    fn region_selection_skips_unavailable_regions() {
        let mut p = Provisioner::new(DoClient::new("t").unwrap(), "s-2vcpu");
        let mut region: Region = serde_json::from_value(region_json("nyc3", &["s-2vcpu"])).unwrap();
        region.available = false;
        p.regions = vec![region];

        assert!(matches!(
            p.pick_region(),
            Err(ProviderError::NoRegionForSize(_))
        ));
    }

    #[test]
    fn public_ipv4_selects_the_public_attachment() {
        let droplet: Droplet =
            serde_json::from_value(droplet_json(1, "coreos-master-0-nyc3", "active", "203.0.113.7"))
                .unwrap();
        assert_eq!(
            Provisioner::public_ipv4(&droplet).unwrap(),
            "203.0.113.7".parse::<Ipv4Addr>().unwrap()
        );
    }

    #[test]
    fn public_ipv4_fails_without_public_attachment() {
        let droplet: Droplet = serde_json::from_value(json!({
            "id": 1,
            "name": "coreos-master-0-nyc3",
            "status": "active",
            "networks": {"v4": [{"ip_address": "10.128.0.2", "type": "private"}]},
        }))
        .unwrap();

        assert!(matches!(
            Provisioner::public_ipv4(&droplet),
            Err(ProviderError::NoPublicIpv4(_))
        ));
    }

    #[tokio::test]
    async fn ensure_ssh_key_matches_by_public_key_bytes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/account/keys"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ssh_keys": [
                    {"id": 1, "name": "other", "fingerprint": "aa:bb", "public_key": "ssh-rsa OTHER"},
                    {"id": 7, "name": "mine", "fingerprint": "cc:dd", "public_key": "ssh-rsa MINE user@host"},
                ]
            })))
            .mount(&server)
            .await;
        // A match must not register anything.
        Mock::given(method("POST"))
            .and(path("/account/keys"))
            .respond_with(ResponseTemplate::new(201))
            .expect(0)
            .mount(&server)
            .await;

        let p = provisioner(&server, "s-1vcpu-2gb").await;
        let id = p.ensure_ssh_key("ssh-rsa MINE user@host").await.unwrap();
        assert_eq!(id, 7);
    }

    #[tokio::test]
    async fn ensure_ssh_key_registers_when_absent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/account/keys"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"ssh_keys": []})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/account/keys"))
            .and(body_partial_json(json!({"public_key": "ssh-rsa NEW"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "ssh_key": {"id": 42, "name": "test's key", "fingerprint": "ee:ff", "public_key": "ssh-rsa NEW"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let p = provisioner(&server, "s-1vcpu-2gb").await;
        let id = p.ensure_ssh_key("ssh-rsa NEW").await.unwrap();
        assert_eq!(id, 42);
    }

    #[tokio::test]
    async fn ensure_node_creates_once_then_serves_from_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/regions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "regions": [region_json("nyc3", &["s-1vcpu-2gb"])]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/droplets"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"droplets": []})))
            .mount(&server)
            .await;
        // Exactly one creation request across both ensure_node calls.
        Mock::given(method("POST"))
            .and(path("/droplets"))
            .and(body_partial_json(json!({
                "name": "coreos-master-0-nyc3",
                "image": "coreos-stable",
                "ipv6": true,
                "private_networking": true,
            })))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({
                "droplet": droplet_json(99, "coreos-master-0-nyc3", "new", "203.0.113.7")
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/droplets/99"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "droplet": droplet_json(99, "coreos-master-0-nyc3", "active", "203.0.113.7")
            })))
            .mount(&server)
            .await;

        let mut p = provisioner(&server, "s-1vcpu-2gb").await;
        p.refresh().await.unwrap();

        let first = p.ensure_node(7, NodeRole::Master, 0, false).await.unwrap();
        assert_eq!(first.id, 99);
        assert_eq!(first.name, "coreos-master-0-nyc3");
        assert_eq!(first.status, "active");

        let second = p.ensure_node(7, NodeRole::Master, 0, false).await.unwrap();
        assert_eq!(second.id, first.id);
    }

    #[tokio::test]
    async fn ensure_node_polls_until_active() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/regions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "regions": [region_json("nyc3", &["s-1vcpu-2gb"])]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/droplets"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"droplets": []})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/droplets"))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({
                "droplet": droplet_json(5, "coreos-worker-0-nyc3", "new", "203.0.113.9")
            })))
            .mount(&server)
            .await;
        // First status fetch still "new", then "active".
        Mock::given(method("GET"))
            .and(path("/droplets/5"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "droplet": droplet_json(5, "coreos-worker-0-nyc3", "new", "203.0.113.9")
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/droplets/5"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "droplet": droplet_json(5, "coreos-worker-0-nyc3", "active", "203.0.113.9")
            })))
            .mount(&server)
            .await;

        let mut p = provisioner(&server, "s-1vcpu-2gb").await;
        p.refresh().await.unwrap();

        let node = p.ensure_node(7, NodeRole::Worker, 0, false).await.unwrap();
        assert_eq!(node.status, "active");
    }

    #[tokio::test]
    async fn ensure_node_rebuilds_in_place_when_forced() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/regions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "regions": [region_json("nyc3", &["s-1vcpu-2gb"])]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/droplets"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "droplets": [droplet_json(12, "coreos-master-0-nyc3", "active", "203.0.113.7")]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/droplets/12/actions"))
            .and(body_partial_json(json!({"type": "rebuild", "image": "coreos-stable"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"action": {"id": 1}})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/droplets/12"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "droplet": droplet_json(12, "coreos-master-0-nyc3", "active", "203.0.113.7")
            })))
            .mount(&server)
            .await;
        // Rebuild must never create a new droplet.
        Mock::given(method("POST"))
            .and(path("/droplets"))
            .respond_with(ResponseTemplate::new(202))
            .expect(0)
            .mount(&server)
            .await;

        let mut p = provisioner(&server, "s-1vcpu-2gb").await;
        p.refresh().await.unwrap();

        let node = p.ensure_node(7, NodeRole::Master, 0, true).await.unwrap();
        assert_eq!(node.id, 12);
    }

    #[tokio::test]
    async fn non_2xx_responses_are_hard_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/regions"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let mut p = provisioner(&server, "s-1vcpu-2gb").await;
        let result = p.refresh().await;
        match result {
            Err(ProviderError::Api { status, body }) => {
                assert_eq!(status, 500);
                assert_eq!(body, "boom");
            }
            other => panic!("expected Api error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn readiness_poll_honors_the_configured_deadline() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/regions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "regions": [region_json("nyc3", &["s-1vcpu-2gb"])]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/droplets"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"droplets": []})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/droplets"))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({
                "droplet": droplet_json(3, "coreos-master-0-nyc3", "new", "203.0.113.7")
            })))
            .mount(&server)
            .await;
        // Never becomes active.
        Mock::given(method("GET"))
            .and(path("/droplets/3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "droplet": droplet_json(3, "coreos-master-0-nyc3", "new", "203.0.113.7")
            })))
            .mount(&server)
            .await;

        let mut p = provisioner(&server, "s-1vcpu-2gb")
            .await
            .with_ready_deadline(Duration::from_millis(50));
        p.refresh().await.unwrap();

        let result = p.ensure_node(7, NodeRole::Master, 0, false).await;
        assert!(matches!(result, Err(ProviderError::ReadyTimeout { .. })));
    }
}
