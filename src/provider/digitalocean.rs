//! Typed DigitalOcean API client.
//!
//! Covers the three endpoint families the bootstrap needs: the SSH key
//! registry, region listing, and droplet lifecycle (create, get, rebuild).
//! Every request carries the bearer token; any non-2xx response is a hard
//! [`ProviderError::Api`] failure - there is no retry or backoff at this
//! layer.

use serde::{Deserialize, Serialize};

use super::{ProviderError, Result};

/// Production API root
pub const DEFAULT_BASE_URL: &str = "https://api.digitalocean.com/v2";

/// Base image every node is created from and rebuilt to
pub const DROPLET_IMAGE: &str = "coreos-stable";

/// An SSH key registered with the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshKey {
    /// Provider-assigned key id
    pub id: u64,
    /// Human-readable key name
    pub name: String,
    /// Key fingerprint
    pub fingerprint: String,
    /// The public key material
    pub public_key: String,
}

/// A datacenter region and the droplet sizes it offers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Region {
    /// Region slug, e.g. `nyc3`
    pub slug: String,
    /// Human-readable region name
    pub name: String,
    /// Size slugs available in this region
    pub sizes: Vec<String>,
    /// Whether new droplets can be created here
    pub available: bool,
}

/// An IPv4 attachment on a droplet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkV4 {
    /// The attached address
    pub ip_address: String,
    /// `public` or `private`
    #[serde(rename = "type")]
    pub kind: String,
}

/// Network attachments of a droplet.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Networks {
    /// IPv4 attachments
    #[serde(default)]
    pub v4: Vec<NetworkV4>,
}

/// A compute node in the provider's inventory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Droplet {
    /// Provider-assigned droplet id
    pub id: u64,
    /// Droplet name; dokube names are deterministic per role and region
    pub name: String,
    /// Lifecycle status; `new` until provisioning finishes, then `active`
    pub status: String,
    /// Network attachments
    #[serde(default)]
    pub networks: Networks,
}

/// Droplet creation request: fixed base image, IPv6 and private networking
/// on, no backups, volumes or tags.
#[derive(Debug, Clone, Serialize)]
pub struct DropletCreate {
    /// Droplet name
    pub name: String,
    /// Region slug
    pub region: String,
    /// Size slug
    pub size: String,
    /// Base image slug
    pub image: String,
    /// SSH key ids granted access
    pub ssh_keys: Vec<u64>,
    /// Automatic backups (always off)
    pub backups: bool,
    /// IPv6 networking (always on)
    pub ipv6: bool,
    /// Cloud-init user data (unused)
    pub user_data: Option<String>,
    /// Private networking (always on)
    pub private_networking: bool,
    /// Extra volumes (none)
    pub volumes: Vec<String>,
    /// Tags (none)
    pub tags: Vec<String>,
}

impl DropletCreate {
    /// Build the standard creation request for a named node.
    pub fn new(name: &str, region: &str, size: &str, ssh_key_id: u64) -> Self {
        Self {
            name: name.to_string(),
            region: region.to_string(),
            size: size.to_string(),
            image: DROPLET_IMAGE.to_string(),
            ssh_keys: vec![ssh_key_id],
            backups: false,
            ipv6: true,
            user_data: None,
            private_networking: true,
            volumes: Vec::new(),
            tags: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SshKeysResponse {
    ssh_keys: Vec<SshKey>,
}

#[derive(Debug, Deserialize)]
struct SshKeyResponse {
    ssh_key: SshKey,
}

#[derive(Debug, Deserialize)]
struct RegionsResponse {
    regions: Vec<Region>,
}

#[derive(Debug, Deserialize)]
struct DropletsResponse {
    droplets: Vec<Droplet>,
}

#[derive(Debug, Deserialize)]
struct DropletResponse {
    droplet: Droplet,
}

#[derive(Debug, Serialize)]
struct SshKeyCreate<'a> {
    name: &'a str,
    public_key: &'a str,
}

#[derive(Debug, Serialize)]
struct RebuildAction<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    image: &'a str,
}

/// DigitalOcean API client.
#[derive(Debug, Clone)]
pub struct DoClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl DoClient {
    /// Create a client against the production API.
    pub fn new(token: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
            token: token.into(),
        })
    }

    /// Set a custom base URL (for testing).
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::parse(resp).await
    }

    async fn post<T: serde::de::DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let resp = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        Self::parse(resp).await
    }

    async fn parse<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp.json().await?)
    }

    /// List all registered SSH keys.
    pub async fn list_keys(&self) -> Result<Vec<SshKey>> {
        let resp: SshKeysResponse = self.get("/account/keys").await?;
        Ok(resp.ssh_keys)
    }

    /// Register a new SSH key.
    pub async fn create_key(&self, name: &str, public_key: &str) -> Result<SshKey> {
        let resp: SshKeyResponse = self
            .post("/account/keys", &SshKeyCreate { name, public_key })
            .await?;
        Ok(resp.ssh_key)
    }

    /// List all regions.
    pub async fn list_regions(&self) -> Result<Vec<Region>> {
        let resp: RegionsResponse = self.get("/regions").await?;
        Ok(resp.regions)
    }

    /// List all existing droplets.
    pub async fn list_droplets(&self) -> Result<Vec<Droplet>> {
        let resp: DropletsResponse = self.get("/droplets").await?;
        Ok(resp.droplets)
    }

    /// Submit a droplet creation request.
    pub async fn create_droplet(&self, request: &DropletCreate) -> Result<Droplet> {
        let resp: DropletResponse = self.post("/droplets", request).await?;
        Ok(resp.droplet)
    }

    /// Fetch a droplet by id.
    pub async fn get_droplet(&self, id: u64) -> Result<Droplet> {
        let resp: DropletResponse = self.get(&format!("/droplets/{}", id)).await?;
        Ok(resp.droplet)
    }

    /// Rebuild an existing droplet in place from `image` (same id, new disk).
    pub async fn rebuild_droplet(&self, id: u64, image: &str) -> Result<()> {
        let _: serde_json::Value = self
            .post(
                &format!("/droplets/{}/actions", id),
                &RebuildAction {
                    kind: "rebuild",
                    image,
                },
            )
            .await?;
        Ok(())
    }
}
