//! ssh/scp transport using the system CLI

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::command::Command;
use crate::error::{Error, Result};
use crate::target::RemoteTarget;
use crate::RemoteShell;

/// SSH connection configuration for one host
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Server address or resolvable hostname
    host: String,
    /// Login user, ssh's default when unset
    user: Option<String>,
    /// Port, ssh's default when unset
    port: Option<u16>,
    /// Private key for the login
    identity_file: Option<PathBuf>,
    /// Raw options passed to both ssh and scp
    extra_args: Vec<String>,
}

impl SshConfig {
    /// Transport to `host` with the local user's defaults
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: None,
            port: None,
            identity_file: None,
            extra_args: Vec::new(),
        }
    }

    /// Set the SSH user
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Set the SSH port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Log in with this private key
    pub fn with_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_file = Some(path.into());
        self
    }

    /// Append a raw `ssh`/`scp` option
    pub fn with_extra_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    /// `user@host`, or the bare host
    fn host_string(&self) -> String {
        if let Some(user) = &self.user {
            format!("{}@{}", user, self.host)
        } else {
            self.host.clone()
        }
    }

    fn common_args(&self, cmd: &mut Command) {
        if let Some(identity) = &self.identity_file {
            cmd.arg("-i").arg(identity);
        }
        // Freshly launched hosts are never in known_hosts
        cmd.args(["-o", "StrictHostKeyChecking=no", "-o", "UserKnownHostsFile=/dev/null"]);
        cmd.args(["-o", "BatchMode=yes"]);
        for arg in &self.extra_args {
            cmd.arg(arg);
        }
    }

    /// `ssh ... host 'command'`
    pub fn ssh_command(&self, remote_command: &str) -> Command {
        let mut cmd = Command::new("ssh");
        if let Some(port) = self.port {
            cmd.arg("-p").arg(port.to_string());
        }
        self.common_args(&mut cmd);
        cmd.arg(self.host_string());
        cmd.arg(remote_command);
        cmd
    }

    /// `scp ... local host:remote_dir`
    pub fn scp_command(&self, local: &Path, remote_dir: &str) -> Command {
        let mut cmd = Command::new("scp");
        if let Some(port) = self.port {
            cmd.arg("-P").arg(port.to_string());
        }
        self.common_args(&mut cmd);
        cmd.arg(local);
        cmd.arg(format!("{}:{}", self.host_string(), remote_dir));
        cmd
    }
}

/// Format a program and arguments for execution by the remote shell
pub fn format_remote_command<S: AsRef<str>>(program: &str, args: &[S]) -> String {
    let args: Vec<String> = args.iter().map(|a| shell_escape(a.as_ref())).collect();
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{} {}", program, args.join(" "))
    }
}

/// Quote `s` for the remote shell when it contains metacharacters
pub fn shell_escape(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    if s.contains(|c: char| c.is_whitespace() || "\"'\\$`!*?<>|&;()[]{}".contains(c)) {
            format!("'{}'", s.replace('\'', "'\"'\"'"))
    } else {
        s.to_string()
    }
}

/// Remote shell backed by the system `ssh` and `scp` binaries
#[derive(Debug, Clone)]
pub struct SshTransport {
    user: String,
    port: u16,
    identity_file: Option<PathBuf>,
}

impl SshTransport {
    /// Create a transport logging in as `user`
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            port: 22,
            identity_file: None,
        }
    }

    /// Set the SSH port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Log in with this private key
    pub fn with_identity_file(mut self, path: Option<PathBuf>) -> Self {
        self.identity_file = path;
        self
    }

    /// Connection settings for one target
    pub fn config_for(&self, target: &RemoteTarget) -> SshConfig {
        let config = SshConfig::new(&target.address)
            .with_user(&self.user)
            .with_port(self.port);
        match &self.identity_file {
            Some(path) => config.with_identity_file(path),
            None => config,
        }
    }

    async fn status(cmd: &Command) -> Result<i32> {
        let program = cmd.get_program().to_string_lossy().to_string();
        let output = cmd
            .prepare()
            .output()
            .await
            .map_err(|e| Error::spawn_failed(&program, e.to_string()))?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines() {
            debug!("[{}] {}", program, line);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stderr.lines() {
            debug!("[{} stderr] {}", program, line);
        }
        // No code means the helper was killed by a signal
        Ok(output.status.code().unwrap_or(-1))
    }
}

#[async_trait]
impl RemoteShell for SshTransport {
    fn user(&self) -> &str {
        &self.user
    }

    fn port(&self) -> u16 {
        self.port
    }

    async fn upload(&self, local: &Path, target: &RemoteTarget, remote_dir: &str) -> Result<String> {
        let file = local
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_default();
        info!("SCP {} --> {}@{}:{}", file, self.user, target.fqdn, remote_dir);

        let cmd = self.config_for(target).scp_command(local, remote_dir);
        let code = Self::status(&cmd).await?;
        if code != 0 {
            return Err(Error::UploadFailed {
                file,
                host: target.fqdn.clone(),
                code,
            });
        }
        Ok(format!("{}/{}", remote_dir.trim_end_matches('/'), file))
    }

    async fn run(&self, target: &RemoteTarget, command: &str) -> Result<i32> {
        info!("COMMAND [{}] on {}", command, target.fqdn);
        let cmd = self.config_for(target).ssh_command(command);
        Self::status(&cmd).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> RemoteTarget {
        RemoteTarget::new("i-1", "10.0.0.5", "ms101.dev.ame1.example.com")
    }

    #[test]
    fn test_shell_escape() {
        assert_eq!(shell_escape("plain"), "plain");
        assert_eq!(shell_escape("two words"), "'two words'");
        assert_eq!(shell_escape("it's"), "'it'\"'\"'s'");
        assert_eq!(shell_escape(""), "''");
    }

    #[test]
    fn test_format_remote_command() {
        assert_eq!(format_remote_command::<&str>("uptime", &[]), "uptime");
        assert_eq!(
            format_remote_command("echo", &["a b", "c"]),
            "echo 'a b' c"
        );
    }

    #[test]
    fn test_ssh_command_shape() {
        let transport = SshTransport::new("ubuntu")
            .with_port(2222)
            .with_identity_file(Some(PathBuf::from("/keys/id")));
        let cmd = transport.config_for(&target()).ssh_command("uptime");
        let line = cmd.to_string();
        assert!(line.starts_with("ssh -p 2222 -i /keys/id"));
        assert!(line.ends_with("ubuntu@10.0.0.5 uptime"));
    }

    #[test]
    fn test_scp_command_shape() {
        let transport = SshTransport::new("ubuntu");
        let cmd = transport
            .config_for(&target())
            .scp_command(Path::new("/tmp/s/bs.vars"), "/home/ubuntu");
        let line = cmd.to_string();
        assert!(line.starts_with("scp -P 22"));
        assert!(line.ends_with("/tmp/s/bs.vars ubuntu@10.0.0.5:/home/ubuntu"));
    }
}
