//! Remote script execution for fleet
//!
//! Provisioning needs only three things from a remote host: copy a file
//! to it, run a command on it, and know when it accepts connections.
//! [`RemoteShell`] captures exactly that; [`SshTransport`] implements it
//! with the system `ssh`/`scp` binaries and [`RecordingShell`] records
//! calls without touching the network.

#![warn(missing_docs)]

pub mod command;
pub mod error;
pub mod probe;
pub mod recording;
pub mod ssh;
pub mod target;

pub use command::Command;
pub use error::{Error, Result};
pub use recording::{RecordingShell, ShellEvent};
pub use ssh::{SshConfig, SshTransport, format_remote_command, shell_escape};
pub use target::RemoteTarget;

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

/// Interval between readiness probes
pub const PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// Upload, run and readiness operations against remote hosts
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Login user
    fn user(&self) -> &str;

    /// Port probed for readiness
    fn port(&self) -> u16;

    /// Staging directory for uploads (the login user's home)
    fn home_dir(&self) -> String {
        format!("/home/{}", self.user())
    }

    /// Copy `local` into `remote_dir` on the target, returning the remote path
    async fn upload(&self, local: &Path, target: &RemoteTarget, remote_dir: &str) -> Result<String>;

    /// Run `command` on the target and return its exit status
    async fn run(&self, target: &RemoteTarget, command: &str) -> Result<i32>;

    /// Wait until the target accepts connections, up to `timeout`
    async fn reachable(&self, target: &RemoteTarget, timeout: Duration) -> bool {
        probe::wait_for_port(&target.address, self.port(), PROBE_INTERVAL, timeout)
            .await
            .is_ok()
    }
}
