//! Command execution and file transfer on cluster nodes over ssh/scp.
//!
//! Commands run as the `core` user (the CoreOS default). Asynchronous
//! execution detaches the ssh child process and hands back an [`ExecHandle`];
//! `join` consumes the handle, so joining twice is a compile error rather
//! than a caller discipline.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, info};

/// Remote user commands run as
pub const REMOTE_USER: &str = "core";

/// Fixed local staging path for rewritten install scripts, relative to the
/// system temp directory
pub const SCRIPT_FILE_NAME: &str = "install.sh";

/// Remote execution errors
#[derive(Debug, Error)]
pub enum RemoteError {
    /// A remote command exited non-zero
    #[error("command failed: {command} - {message}")]
    CommandFailed {
        /// The command that failed
        command: String,
        /// Captured stderr
        message: String,
    },

    /// A script references a variable with no bound value
    #[error("no value bound for script variable {0}")]
    UnboundVariable(String),

    /// Script fetch failed
    #[error("script fetch failed: {0}")]
    Fetch(#[from] reqwest::Error),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for remote operations
pub type Result<T> = std::result::Result<T, RemoteError>;

/// An in-flight detached remote command.
///
/// Held by the orchestrator while other work proceeds; `join` blocks until
/// the underlying process exits and returns its captured stdout. Joining
/// consumes the handle - there is exactly one owner and at most one join.
#[derive(Debug)]
pub struct ExecHandle {
    child: Child,
    command: String,
}

impl ExecHandle {
    /// Wait for the detached command to finish and return its stdout.
    pub async fn join(self) -> Result<String> {
        let output = self.child.wait_with_output().await?;
        if !output.status.success() {
            return Err(RemoteError::CommandFailed {
                command: self.command,
                message: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Executes commands and copies files on remote hosts.
#[derive(Debug, Clone)]
pub struct RemoteExecutor {
    user: String,
    insecure: bool,
    http: reqwest::Client,
}

impl RemoteExecutor {
    /// Create an executor for the `core` remote user.
    ///
    /// With `insecure` set, host-key verification is disabled
    /// (`StrictHostKeyChecking=no`) - required for freshly provisioned hosts
    /// that are not yet in `known_hosts`, at the cost of MITM protection.
    pub fn new(insecure: bool) -> Result<Self> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            user: REMOTE_USER.to_string(),
            insecure,
            http,
        })
    }

    fn ssh_options(&self) -> Vec<String> {
        if self.insecure {
            vec![
                "-o".to_string(),
                "StrictHostKeyChecking=no".to_string(),
                "-o".to_string(),
                "UserKnownHostsFile=/dev/null".to_string(),
            ]
        } else {
            Vec::new()
        }
    }

    fn ssh_args(&self, host: &str, command: &str) -> Vec<String> {
        let mut args = self.ssh_options();
        args.push(format!("{}@{}", self.user, host));
        args.push(command.to_string());
        args
    }

    /// Run `command` on `host` and return its stdout.
    pub async fn run(&self, host: &str, command: &str) -> Result<String> {
        debug!(host, command, "running remote command");
        let output = Command::new("ssh")
            .args(self.ssh_args(host, command))
            .output()
            .await?;

        if !output.status.success() {
            return Err(RemoteError::CommandFailed {
                command: format!("ssh {}@{} {}", self.user, host, command),
                message: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Start `command` on `host` detached, returning a handle to join later.
    pub async fn spawn(&self, host: &str, command: &str) -> Result<ExecHandle> {
        debug!(host, command, "spawning detached remote command");
        let child = Command::new("ssh")
            .args(self.ssh_args(host, command))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        Ok(ExecHandle {
            child,
            command: format!("ssh {}@{} {}", self.user, host, command),
        })
    }

    /// Copy local files into the remote user's home directory.
    pub async fn copy_files(&self, host: &str, paths: &[PathBuf]) -> Result<()> {
        let mut args = self.ssh_options();
        for path in paths {
            args.push(path.to_string_lossy().into_owned());
        }
        args.push(format!("{}@{}:", self.user, host));

        debug!(host, files = paths.len(), "copying files");
        let output = Command::new("scp").args(&args).output().await?;
        if !output.status.success() {
            return Err(RemoteError::CommandFailed {
                command: format!("scp {}", args.join(" ")),
                message: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(())
    }

    /// Fetch a script, bind its variables, and run it on `host` under sudo,
    /// blocking until it completes.
    pub async fn run_script(
        &self,
        host: &str,
        script_url: &str,
        bindings: &HashMap<String, String>,
    ) -> Result<String> {
        let command = self.stage_script(host, script_url, bindings).await?;
        self.run(host, &command).await
    }

    /// Fetch a script, bind its variables, and start it on `host` under sudo,
    /// returning a handle to join later.
    pub async fn spawn_script(
        &self,
        host: &str,
        script_url: &str,
        bindings: &HashMap<String, String>,
    ) -> Result<ExecHandle> {
        let command = self.stage_script(host, script_url, bindings).await?;
        self.spawn(host, &command).await
    }

    /// Fetch, rewrite, and copy a script to `host`; returns the remote
    /// command that executes it.
    ///
    /// Binding failures surface before anything touches the remote host.
    async fn stage_script(
        &self,
        host: &str,
        script_url: &str,
        bindings: &HashMap<String, String>,
    ) -> Result<String> {
        info!(host, url = script_url, "staging install script");
        let body = self
            .http
            .get(script_url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let script = bind_script_vars(&body, bindings)?;

        let local = std::env::temp_dir().join(SCRIPT_FILE_NAME);
        tokio::fs::write(&local, script).await?;
        self.copy_files(host, &[local]).await?;

        Ok(format!(
            "chmod +x {name} && sudo ./{name}",
            name = SCRIPT_FILE_NAME
        ))
    }
}

/// Rewrite every empty `export NAME=` line with the bound value for `NAME`.
///
/// Lines that already assign a value, and lines that are not exports, pass
/// through untouched. A declared variable with no binding is a configuration
/// error - the script must never reach the remote host half-bound.
pub fn bind_script_vars(script: &str, bindings: &HashMap<String, String>) -> Result<String> {
    let mut out = Vec::with_capacity(script.lines().count());
    for line in script.lines() {
        let trimmed = line.trim_start();
        if let Some(name) = trimmed
            .strip_prefix("export ")
            .and_then(|rest| rest.strip_suffix('='))
        {
            if !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                let value = bindings
                    .get(name)
                    .ok_or_else(|| RemoteError::UnboundVariable(name.to_string()))?;
                let indent = &line[..line.len() - trimmed.len()];
                out.push(format!("{}export {}={}", indent, name, value));
                continue;
            }
        }
        out.push(line.to_string());
    }
    Ok(out.join("\n"))
}
