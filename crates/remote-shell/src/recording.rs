//! A remote shell that only records what it was asked to do
//!
//! Used for dry runs and in tests.

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::info;

use crate::error::Result;
use crate::target::RemoteTarget;
use crate::RemoteShell;

/// One recorded interaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellEvent {
    /// A file upload
    Upload {
        /// Target id
        target: String,
        /// Local file
        local: PathBuf,
        /// Remote directory
        remote_dir: String,
    },
    /// A command execution
    Run {
        /// Target id
        target: String,
        /// Command line
        command: String,
    },
}

/// Records uploads and commands, returning configured exit codes
#[derive(Debug, Default)]
pub struct RecordingShell {
    user: String,
    events: Mutex<Vec<ShellEvent>>,
    failing: Mutex<Vec<(String, i32)>>,
    unreachable: Mutex<HashSet<String>>,
}

impl RecordingShell {
    /// A shell logging in as `user`
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            ..Default::default()
        }
    }

    /// Commands containing `needle` exit with `code`
    pub fn fail_matching(&self, needle: impl Into<String>, code: i32) {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((needle.into(), code));
    }

    /// Probes against `address` never succeed
    pub fn set_unreachable(&self, address: impl Into<String>) {
        self.unreachable
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address.into());
    }

    /// Everything recorded so far
    pub fn events(&self) -> Vec<ShellEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Commands run on one target, in order
    pub fn commands_for(&self, target_id: &str) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ShellEvent::Run { target, command } if target == target_id => Some(command),
                _ => None,
            })
            .collect()
    }

    fn record(&self, event: ShellEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

#[async_trait]
impl RemoteShell for RecordingShell {
    fn user(&self) -> &str {
        &self.user
    }

    fn port(&self) -> u16 {
        22
    }

    async fn upload(&self, local: &Path, target: &RemoteTarget, remote_dir: &str) -> Result<String> {
        info!("(recorded) SCP {} --> {}:{}", local.display(), target.fqdn, remote_dir);
        self.record(ShellEvent::Upload {
            target: target.id.clone(),
            local: local.to_path_buf(),
            remote_dir: remote_dir.to_string(),
        });
        let file = local
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_default();
        Ok(format!("{}/{}", remote_dir.trim_end_matches('/'), file))
    }

    async fn run(&self, target: &RemoteTarget, command: &str) -> Result<i32> {
        info!("(recorded) COMMAND [{}] on {}", command, target.fqdn);
        self.record(ShellEvent::Run {
            target: target.id.clone(),
            command: command.to_string(),
        });
        let failing = self.failing.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(failing
            .iter()
            .find(|(needle, _)| command.contains(needle.as_str()))
            .map(|(_, code)| *code)
            .unwrap_or(0))
    }

    async fn reachable(&self, target: &RemoteTarget, _timeout: Duration) -> bool {
        !self
            .unreachable
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&target.address)
    }
}
