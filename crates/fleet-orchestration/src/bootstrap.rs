//! Configuration-management enrollment

use crate::{Error, Result};
use async_trait::async_trait;
use remote_shell::Command;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};

/// What a node is enrolled with
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootstrapRequest {
    /// Address to connect to
    pub address: String,
    /// Node name, `hostname.subnetwork`
    pub node_name: String,
    /// Run list
    pub run_list: Vec<String>,
    /// Config-management environment
    pub environment: Option<String>,
    /// Login user
    pub ssh_user: String,
    /// Login port
    pub ssh_port: u16,
    /// Private key
    pub identity_file: Option<PathBuf>,
    /// Client version to install
    pub version: String,
    /// Bootstrap template
    pub distro: String,
}

/// The configuration-management server
#[async_trait]
pub trait ConfigManagement: Send + Sync {
    /// Whether a node of that name is registered
    async fn is_registered(&self, node_name: &str) -> Result<bool>;

    /// Remove the node and its client
    async fn deregister(&self, node_name: &str) -> Result<()>;

    /// Install the client on a server and enroll it
    async fn bootstrap(&self, request: &BootstrapRequest) -> Result<()>;
}

/// Drives the `knife` command-line client
#[derive(Debug, Clone, Default)]
pub struct KnifeCli {
    config: Option<PathBuf>,
}

impl KnifeCli {
    /// Use the default knife configuration, or `config` when given
    pub fn new(config: Option<PathBuf>) -> Self {
        Self { config }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new("knife");
        cmd.args(args);
        if let Some(config) = &self.config {
            cmd.arg("--config").arg(config);
        }
        cmd
    }

    /// Arguments of `knife bootstrap` for a request
    pub fn bootstrap_command(&self, request: &BootstrapRequest) -> Command {
        let mut cmd = self.command(&["bootstrap", request.address.as_str()]);
        cmd.arg("--node-name")
            .arg(&request.node_name)
            .arg("--ssh-user")
            .arg(&request.ssh_user)
            .arg("--ssh-port")
            .arg(request.ssh_port.to_string())
            .arg("--sudo")
            .arg("--bootstrap-version")
            .arg(&request.version)
            .arg("--distro")
            .arg(&request.distro);
        if let Some(identity) = &request.identity_file {
            cmd.arg("--identity-file").arg(identity);
        }
        if !request.run_list.is_empty() {
            cmd.arg("--run-list").arg(request.run_list.join(","));
        }
        if let Some(environment) = &request.environment {
            cmd.arg("--environment").arg(environment);
        }
        cmd
    }

    async fn status(cmd: &Command) -> Result<(i32, String)> {
        debug!("Running {}", cmd);
        let output = cmd.prepare().output().await?;
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Ok((output.status.code().unwrap_or(-1), stderr))
    }
}

#[async_trait]
impl ConfigManagement for KnifeCli {
    async fn is_registered(&self, node_name: &str) -> Result<bool> {
        let (code, _) = Self::status(&self.command(&["node", "show", node_name])).await?;
        Ok(code == 0)
    }

    async fn deregister(&self, node_name: &str) -> Result<()> {
        for kind in ["node", "client"] {
            let (code, stderr) = Self::status(&self.command(&[kind, "delete", node_name, "--yes"])).await?;
            if code != 0 {
                return Err(Error::bootstrap(
                    node_name,
                    format!("knife {} delete exited with {}: {}", kind, code, stderr),
                ));
            }
        }
        info!("Removed config-management node and client {}", node_name);
        Ok(())
    }

    async fn bootstrap(&self, request: &BootstrapRequest) -> Result<()> {
        info!("Bootstrapping {} at {}", request.node_name, request.address);
        let (code, stderr) = Self::status(&self.bootstrap_command(request)).await?;
        if code != 0 {
            return Err(Error::bootstrap(
                &request.node_name,
                format!("knife bootstrap exited with {}: {}", code, stderr),
            ));
        }
        Ok(())
    }
}

/// Does nothing; every node is unregistered
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopConfigManagement;

#[async_trait]
impl ConfigManagement for NoopConfigManagement {
    async fn is_registered(&self, _node_name: &str) -> Result<bool> {
        Ok(false)
    }

    async fn deregister(&self, node_name: &str) -> Result<()> {
        info!("(dry run) Would remove node and client {}", node_name);
        Ok(())
    }

    async fn bootstrap(&self, request: &BootstrapRequest) -> Result<()> {
        info!("(dry run) Would bootstrap {} at {}", request.node_name, request.address);
        Ok(())
    }
}

/// In-memory registrations, recording every call
#[derive(Debug, Default)]
pub struct RecordingConfigManagement {
    registered: Mutex<HashSet<String>>,
    failing: Mutex<HashSet<String>>,
    calls: Mutex<Vec<String>>,
}

impl RecordingConfigManagement {
    /// Nothing registered
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend `node_name` is already registered
    pub fn register(&self, node_name: impl Into<String>) {
        self.registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node_name.into());
    }

    /// Bootstrapping `node_name` fails
    pub fn fail_bootstrap(&self, node_name: impl Into<String>) {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node_name.into());
    }

    /// Whether `node_name` is registered
    pub fn is_known(&self, node_name: &str) -> bool {
        self.registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(node_name)
    }

    /// Calls so far, as `operation node`
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn record(&self, operation: &str, node_name: &str) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(format!("{} {}", operation, node_name));
    }
}

#[async_trait]
impl ConfigManagement for RecordingConfigManagement {
    async fn is_registered(&self, node_name: &str) -> Result<bool> {
        self.record("show", node_name);
        Ok(self.is_known(node_name))
    }

    async fn deregister(&self, node_name: &str) -> Result<()> {
        self.record("delete", node_name);
        self.registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(node_name);
        Ok(())
    }

    async fn bootstrap(&self, request: &BootstrapRequest) -> Result<()> {
        self.record("bootstrap", &request.node_name);
        let failing = self
            .failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&request.node_name);
        if failing {
            return Err(Error::bootstrap(&request.node_name, "bootstrap exited with 1"));
        }
        self.register(&request.node_name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_command() {
        let knife = KnifeCli::new(None);
        let cmd = knife.bootstrap_command(&BootstrapRequest {
            address: "10.0.0.5".into(),
            node_name: "ms101.dev".into(),
            run_list: vec!["role[mongo]".into(), "recipe[base]".into()],
            environment: Some("dev".into()),
            ssh_user: "ubuntu".into(),
            ssh_port: 22,
            identity_file: None,
            version: "11.12.4".into(),
            distro: "chef-full".into(),
        });
        let line = cmd.to_string();
        assert!(line.starts_with("knife bootstrap 10.0.0.5 --node-name ms101.dev"));
        assert!(line.contains("--run-list role[mongo],recipe[base]"));
        assert!(line.ends_with("--environment dev"));
    }

    #[smol_potat::test]
    async fn test_recording_double() {
        let cm = RecordingConfigManagement::new();
        cm.register("ms101.dev");
        assert!(cm.is_registered("ms101.dev").await.unwrap());
        cm.deregister("ms101.dev").await.unwrap();
        assert!(!cm.is_known("ms101.dev"));

        cm.fail_bootstrap("ms102.dev");
        let request = BootstrapRequest {
            node_name: "ms102.dev".into(),
            ..Default::default()
        };
        assert!(matches!(cm.bootstrap(&request).await, Err(Error::Bootstrap { .. })));
        assert_eq!(cm.calls(), vec!["show ms101.dev", "delete ms101.dev", "bootstrap ms102.dev"]);
    }
}
