//! Per-run state shared by concurrent phase work

use crate::provider::{ServerRecord, SnapshotRecord, VolumeRecord};
use indexmap::IndexMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{error, warn};

/// Everything the run knows about one server
#[derive(Debug, Clone, PartialEq)]
pub struct Association {
    /// The server as last observed
    pub server: ServerRecord,
    /// Short hostname
    pub hostname: String,
    /// `hostname.subnetwork.network.domain`
    pub fqdn: String,
    /// Config-management node name, `hostname.subnetwork`
    pub node_name: String,
    /// Snapshots selected for restore
    pub snapshots: Vec<SnapshotRecord>,
    /// Volumes created in this run, by device
    pub new_volumes: IndexMap<String, VolumeRecord>,
    /// Volumes superseded in this run, by device
    pub old_volumes: IndexMap<String, VolumeRecord>,
    /// Ids of volumes this run created for the server, recorded as soon as
    /// the provider hands them out
    pub created_volumes: Vec<String>,
}

impl Association {
    /// Associate a server with its identity
    pub fn new(server: ServerRecord, hostname: impl Into<String>, fqdn: impl Into<String>, node_name: impl Into<String>) -> Self {
        Self {
            server,
            hostname: hostname.into(),
            fqdn: fqdn.into(),
            node_name: node_name.into(),
            snapshots: Vec::new(),
            new_volumes: IndexMap::new(),
            old_volumes: IndexMap::new(),
            created_volumes: Vec::new(),
        }
    }

    /// Provider id of the server
    pub fn id(&self) -> &str {
        &self.server.id
    }
}

/// Association map keyed by server id
///
/// Each phase task owns one key; the lock only guards the map itself.
#[derive(Debug, Default)]
pub struct RunState {
    associations: Mutex<IndexMap<String, Association>>,
}

impl RunState {
    /// Empty state
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, IndexMap<String, Association>> {
        self.associations.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add or replace an association
    pub fn insert(&self, association: Association) {
        self.lock().insert(association.server.id.clone(), association);
    }

    /// Snapshot of one association
    pub fn get(&self, id: &str) -> Option<Association> {
        self.lock().get(id).cloned()
    }

    /// Mutate one association in place
    pub fn update<R>(&self, id: &str, f: impl FnOnce(&mut Association) -> R) -> Option<R> {
        self.lock().get_mut(id).map(f)
    }

    /// Drop a server from the run
    pub fn remove(&self, id: &str) -> Option<Association> {
        self.lock().shift_remove(id)
    }

    /// Server ids still in the run, in insertion order
    pub fn ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Every association, in insertion order
    pub fn all(&self) -> Vec<Association> {
        self.lock().values().cloned().collect()
    }

    /// Number of servers still in the run
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no server is left
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Severity of a summary entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Run continued unaffected
    Warning,
    /// A resource was dropped from the run
    Failure,
}

/// One issue replayed at exit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryEntry {
    /// Severity
    pub severity: Severity,
    /// Phase name, when raised by a phase
    pub phase: Option<String>,
    /// Resource id or fqdn
    pub resource: String,
    /// What happened
    pub message: String,
}

impl fmt::Display for SummaryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.severity {
            Severity::Warning => "WARN",
            Severity::Failure => "FAIL",
        };
        match &self.phase {
            Some(phase) => write!(f, "[{}] {} ({}): {}", level, self.resource, phase, self.message),
            None => write!(f, "[{}] {}: {}", level, self.resource, self.message),
        }
    }
}

/// Warnings and failures accumulated over a run
#[derive(Debug, Default)]
pub struct RunSummary {
    entries: Mutex<Vec<SummaryEntry>>,
}

impl RunSummary {
    /// Empty summary
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, entry: SummaryEntry) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }

    /// Log and record a warning
    pub fn warn(&self, resource: impl Into<String>, message: impl ToString) {
        let entry = SummaryEntry {
            severity: Severity::Warning,
            phase: None,
            resource: resource.into(),
            message: message.to_string(),
        };
        warn!("{}: {}", entry.resource, entry.message);
        self.push(entry);
    }

    /// Log and record a resource dropped by a phase
    pub fn fail(&self, phase: &str, resource: impl Into<String>, message: impl ToString) {
        let entry = SummaryEntry {
            severity: Severity::Failure,
            phase: Some(phase.to_string()),
            resource: resource.into(),
            message: message.to_string(),
        };
        error!("{} failed during {}: {}", entry.resource, phase, entry.message);
        self.push(entry);
    }

    /// Everything recorded, in order
    pub fn entries(&self) -> Vec<SummaryEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Recorded failures
    pub fn failures(&self) -> Vec<SummaryEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.severity == Severity::Failure)
            .collect()
    }

    /// Whether nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries();
        let failures = entries.iter().filter(|e| e.severity == Severity::Failure).count();
        writeln!(
            f,
            "Run summary: {} warning(s), {} failure(s)",
            entries.len() - failures,
            failures
        )?;
        for entry in &entries {
            writeln!(f, "  {}", entry)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{InstanceState, Lifecycle};

    fn server(id: &str) -> ServerRecord {
        ServerRecord {
            id: id.to_string(),
            state: InstanceState::Running,
            lifecycle: Lifecycle::OnDemand,
            image_id: "ami-1".to_string(),
            instance_type: "m5.large".to_string(),
            private_ip: Some("10.0.0.1".to_string()),
            public_ip: None,
            subnet_id: None,
            block_devices: Vec::new(),
            tags: Default::default(),
        }
    }

    #[test]
    fn test_update_and_remove() {
        let state = RunState::new();
        state.insert(Association::new(server("i-1"), "ms101", "ms101.dev.ame1.example.com", "ms101.dev"));
        state.insert(Association::new(server("i-2"), "ms102", "ms102.dev.ame1.example.com", "ms102.dev"));

        state.update("i-2", |a| a.hostname = "renamed".to_string());
        assert_eq!(state.get("i-2").unwrap().hostname, "renamed");
        assert!(state.update("i-9", |_| ()).is_none());

        state.remove("i-1");
        assert_eq!(state.ids(), vec!["i-2"]);
    }

    #[test]
    fn test_summary_render() {
        let summary = RunSummary::new();
        summary.warn("ms101", "instance type has no instance storage");
        summary.fail("tag", "vol-2", "create-tags failed");
        assert_eq!(summary.failures().len(), 1);
        let text = summary.to_string();
        assert!(text.starts_with("Run summary: 1 warning(s), 1 failure(s)"));
        assert!(text.contains("[FAIL] vol-2 (tag): create-tags failed"));
    }
}
