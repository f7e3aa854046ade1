//! Cluster bootstrap orchestration.
//!
//! One strictly sequential run provisions the master, stands up etcd, deploys
//! certificates, launches the controller install script detached, provisions
//! the worker, runs its install script, joins the controller script, and
//! finally configures the local admin context. Any failing step aborts the
//! run; there is no rollback. A subsequent run resumes through the naturally
//! idempotent paths: named nodes, on-disk CA material, and the etcd probe.
//!
//! The only true concurrency is the detached controller script (an OS child
//! process) overlapping the worker sequence; it is joined before the admin
//! context is written.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use tracing::{debug, info};

use crate::config::Config;
use crate::kubeconfig;
use crate::pki::{CertificateAuthority, IssuedCertificate, SanConfig, LEAF_VALIDITY_DAYS};
use crate::provider::{DoClient, NodeRole, Provisioner};
use crate::remote::RemoteExecutor;
use crate::Result;

/// etcd client port, probed for presence and advertised to nodes
pub const ETCD_CLIENT_PORT: u16 = 2379;

/// Legacy etcd client port kept for older CoreOS units
pub const ETCD_LEGACY_CLIENT_PORT: u16 = 4001;

/// etcd peer port
pub const ETCD_PEER_PORT: u16 = 2380;

/// etcd container image launched on the master
pub const ETCD_IMAGE: &str = "quay.io/coreos/etcd:v2.3.7";

/// Remote directory certificate material is installed into
pub const REMOTE_CERT_DIR: &str = "/etc/kubernetes/ssl";

/// Controller install script location
pub const CONTROLLER_SCRIPT_URL: &str =
    "https://raw.githubusercontent.com/coreos/coreos-kubernetes/master/multi-node/generic/controller-install.sh";

/// Worker install script location
pub const WORKER_SCRIPT_URL: &str =
    "https://raw.githubusercontent.com/coreos/coreos-kubernetes/master/multi-node/generic/worker-install.sh";

/// Name used for the local kubectl cluster/context entries
pub const CONTEXT_NAME: &str = "dokube";

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Variable bindings injected into both install scripts, derived from the
/// master's public IP.
pub fn deployment_bindings(master_ip: Ipv4Addr) -> HashMap<String, String> {
    let mut bindings = HashMap::new();
    bindings.insert(
        "ETCD_ENDPOINTS".to_string(),
        format!("http://{}:{}", master_ip, ETCD_CLIENT_PORT),
    );
    bindings.insert(
        "CONTROLLER_ENDPOINT".to_string(),
        format!("https://{}", master_ip),
    );
    bindings
}

/// The fixed etcd launch command, parameterized by the master's own IP.
///
/// The IP serves as both advertise and listen host; listeners bind all
/// interfaces while advertise URLs carry the routable address.
pub fn etcd_launch_command(master_ip: Ipv4Addr) -> String {
    format!(
        "sudo docker run -d --net=host --name etcd {image} \
         --name etcd0 \
         --advertise-client-urls http://{ip}:{client},http://{ip}:{legacy} \
         --listen-client-urls http://0.0.0.0:{client},http://0.0.0.0:{legacy} \
         --initial-advertise-peer-urls http://{ip}:{peer} \
         --listen-peer-urls http://0.0.0.0:{peer} \
         --initial-cluster etcd0=http://{ip}:{peer} \
         --initial-cluster-state new",
        image = ETCD_IMAGE,
        ip = master_ip,
        client = ETCD_CLIENT_PORT,
        legacy = ETCD_LEGACY_CLIENT_PORT,
        peer = ETCD_PEER_PORT,
    )
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Drives one bootstrap run from provisioning to admin context.
#[derive(Debug)]
pub struct Bootstrapper {
    config: Config,
    provisioner: Provisioner,
    executor: RemoteExecutor,
    probe: reqwest::Client,
    force_rebuild: bool,
}

impl Bootstrapper {
    /// Build the orchestrator and its collaborators from the run config.
    pub fn new(config: Config, force_rebuild: bool) -> Result<Self> {
        let client = DoClient::new(config.api_token.clone())?;
        let mut provisioner = Provisioner::new(client, config.size.clone());
        if let Some(secs) = config.node_ready_timeout_secs {
            provisioner = provisioner.with_ready_deadline(Duration::from_secs(secs));
        }
        let executor = RemoteExecutor::new(config.insecure_ssh)?;
        let probe = reqwest::Client::builder().timeout(PROBE_TIMEOUT).build()?;

        Ok(Self {
            config,
            provisioner,
            executor,
            probe,
            force_rebuild,
        })
    }

    /// Run the full bootstrap sequence.
    pub async fn run(&mut self) -> Result<()> {
        println!("[Phase 1] Registering SSH key and snapshotting provider state...");
        let public_key = self.config.read_public_key()?;
        let ssh_key_id = self.provisioner.ensure_ssh_key(&public_key).await?;
        self.provisioner.refresh().await?;

        println!("[Phase 2] Ensuring cluster CA...");
        let ca = CertificateAuthority::create(&self.config.cert_dir)?;

        println!("[Phase 3] Ensuring master node...");
        let master = self
            .provisioner
            .ensure_node(ssh_key_id, NodeRole::Master, 0, self.force_rebuild)
            .await?;
        let master_ip = Provisioner::public_ipv4(&master)?;
        let master_host = master_ip.to_string();
        info!(node = %master.name, ip = %master_ip, "master ready");

        println!("[Phase 4] Ensuring etcd on master...");
        self.ensure_etcd(master_ip).await?;

        let bindings = deployment_bindings(master_ip);

        println!("[Phase 5] Deploying master certificates and launching controller install...");
        let san = SanConfig::ips(vec![self.config.service_ip, IpAddr::V4(master_ip)]);
        let apiserver = ca.issue("apiserver", Some(&san), LEAF_VALIDITY_DAYS)?;
        self.deploy_certificates(&master_host, &ca, &apiserver)
            .await?;
        let controller_script = self
            .executor
            .spawn_script(&master_host, CONTROLLER_SCRIPT_URL, &bindings)
            .await?;

        println!("[Phase 6] Ensuring worker node and running worker install...");
        let worker = self
            .provisioner
            .ensure_node(ssh_key_id, NodeRole::Worker, 0, self.force_rebuild)
            .await?;
        let worker_ip = Provisioner::public_ipv4(&worker)?;
        let worker_host = worker_ip.to_string();
        info!(node = %worker.name, ip = %worker_ip, "worker ready");

        let worker_identity = format!("worker-{}", worker.name);
        let worker_san = SanConfig::ips(vec![IpAddr::V4(worker_ip)]);
        let worker_cert = ca.issue(&worker_identity, Some(&worker_san), LEAF_VALIDITY_DAYS)?;
        self.deploy_certificates(&worker_host, &ca, &worker_cert)
            .await?;
        self.executor
            .run_script(&worker_host, WORKER_SCRIPT_URL, &bindings)
            .await?;

        println!("[Phase 7] Waiting for controller install to finish...");
        controller_script.join().await?;

        println!("[Phase 8] Configuring local admin context...");
        let admin = ca.issue("admin", None, LEAF_VALIDITY_DAYS)?;
        kubeconfig::configure_admin_context(
            CONTEXT_NAME,
            &format!("https://{}", master_ip),
            ca.cert_path(),
            &admin,
        )
        .await?;

        println!("\nCluster ready: https://{}", master_ip);
        Ok(())
    }

    /// Probe the master for a serving etcd; launch one if the probe fails.
    ///
    /// Absence and transient probe failure are deliberately conflated - any
    /// failure falls back to launching, so a redundant launch is possible.
    /// The cause is visible at debug level.
    async fn ensure_etcd(&self, master_ip: Ipv4Addr) -> Result<()> {
        let url = format!("http://{}:{}/version", master_ip, ETCD_CLIENT_PORT);
        match self.probe.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => {
                info!(ip = %master_ip, "etcd already serving, skipping launch");
                return Ok(());
            }
            Ok(resp) => debug!(status = %resp.status(), "etcd probe returned non-success"),
            Err(e) => debug!(error = %e, "etcd probe failed"),
        }

        info!(ip = %master_ip, "launching etcd container on master");
        self.executor
            .run(&master_ip.to_string(), &etcd_launch_command(master_ip))
            .await?;
        Ok(())
    }

    /// Install CA cert plus an issued key/cert pair into the node's
    /// well-known certificate directory, tightening ownership and key
    /// permissions afterwards.
    async fn deploy_certificates(
        &self,
        host: &str,
        ca: &CertificateAuthority,
        issued: &IssuedCertificate,
    ) -> Result<()> {
        let ca_name = file_name(ca.cert_path());
        let key_name = file_name(&issued.key_path);
        let cert_name = file_name(&issued.cert_path);

        self.executor
            .run(host, &format!("sudo mkdir -p {}", REMOTE_CERT_DIR))
            .await?;
        self.executor
            .copy_files(
                host,
                &[
                    ca.cert_path().to_path_buf(),
                    issued.key_path.clone(),
                    issued.cert_path.clone(),
                ],
            )
            .await?;
        self.executor
            .run(
                host,
                &format!(
                    "sudo mv {} {} {} {}/",
                    ca_name, key_name, cert_name, REMOTE_CERT_DIR
                ),
            )
            .await?;
        self.executor
            .run(
                host,
                &format!("sudo chmod 600 {}/{}", REMOTE_CERT_DIR, key_name),
            )
            .await?;
        self.executor
            .run(
                host,
                &format!(
                    "sudo chown root:root {dir}/{} {dir}/{} {dir}/{}",
                    ca_name,
                    key_name,
                    cert_name,
                    dir = REMOTE_CERT_DIR
                ),
            )
            .await?;
        Ok(())
    }
}
