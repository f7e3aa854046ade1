//! Local kubectl admin context configuration.
//!
//! Writes the cluster, credential, and context entries into whatever config
//! store kubectl uses, then activates the context. The entries point at the
//! master's HTTPS endpoint and authenticate with the CA plus the admin
//! key/certificate pair issued in the final bootstrap step.

use std::path::Path;

use tokio::process::Command;
use tracing::info;

use crate::pki::IssuedCertificate;
use crate::{Error, Result};

/// The four `kubectl config` invocations that install and activate the admin
/// context. Pure so the argument construction is testable.
pub fn admin_context_commands(
    cluster: &str,
    server: &str,
    ca_cert: &Path,
    admin: &IssuedCertificate,
) -> Vec<Vec<String>> {
    let user = format!("{}-admin", cluster);
    vec![
        vec![
            "config".to_string(),
            "set-cluster".to_string(),
            cluster.to_string(),
            format!("--server={}", server),
            format!("--certificate-authority={}", ca_cert.display()),
        ],
        vec![
            "config".to_string(),
            "set-credentials".to_string(),
            user.clone(),
            format!("--certificate-authority={}", ca_cert.display()),
            format!("--client-key={}", admin.key_path.display()),
            format!("--client-certificate={}", admin.cert_path.display()),
        ],
        vec![
            "config".to_string(),
            "set-context".to_string(),
            cluster.to_string(),
            format!("--cluster={}", cluster),
            format!("--user={}", user),
        ],
        vec![
            "config".to_string(),
            "use-context".to_string(),
            cluster.to_string(),
        ],
    ]
}

/// Configure and activate the local admin context for the cluster.
pub async fn configure_admin_context(
    cluster: &str,
    server: &str,
    ca_cert: &Path,
    admin: &IssuedCertificate,
) -> Result<()> {
    for args in admin_context_commands(cluster, server, ca_cert, admin) {
        let output = Command::new("kubectl").args(&args).output().await?;
        if !output.status.success() {
            return Err(Error::command_failed(
                format!("kubectl {}", args.join(" ")),
                String::from_utf8_lossy(&output.stderr),
            ));
        }
    }
    info!(cluster, server, "admin context configured");
    Ok(())
}
