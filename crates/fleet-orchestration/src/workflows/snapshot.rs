//! Snapshots of servers' durable volumes
//!
//! Every snapshot of one run shares a `created` epoch and a random
//! `version`, so a restore can pick all devices of a server from the same
//! epoch.

use super::{Orchestrator, dropping, random_token, select_latest_snapshots};
use crate::{
    Result,
    naming::{hostname_from_name, node_name},
    phase::Phase,
    provider::{InstanceState, TagQuery},
    state::{Association, RunState},
    tags::SnapshotTags,
};
use chrono::{DateTime, Utc};
use fleet_config::{ConfigError, RunParams};
use indexmap::IndexMap;
use tracing::info;

const LOCATE: Phase = Phase::new(1, "locate");
const VOLUMES: Phase = Phase::new(2, "volumes");
const SNAPSHOT: Phase = Phase::new(3, "snapshot");

/// Snapshots taken by one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotReport {
    /// Epoch shared by every snapshot
    pub created: i64,
    /// Run version shared by every snapshot
    pub version: String,
    /// Snapshot ids
    pub snapshots: Vec<String>,
}

/// Completion of the newest snapshot epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotProgress {
    /// Snapshots in the epoch
    pub snapshots: usize,
    /// Quadratic mean of their completion percentages
    pub percent: u8,
}

/// Root mean square of completion percentages
pub fn quadratic_mean(values: &[u8]) -> u8 {
    if values.is_empty() {
        return 0;
    }
    let squares: f64 = values.iter().map(|v| f64::from(*v).powi(2)).sum();
    (squares / values.len() as f64).sqrt().round().min(100.0) as u8
}

impl Orchestrator {
    /// Snapshot every durable volume of the matching servers
    pub async fn snapshot(&self, params: &RunParams, filter: Option<&str>) -> Result<SnapshotReport> {
        let subnetwork = params.require_subnetwork().map_err(ConfigError::from)?;
        let runner = self.runner(params.batch_size);
        let servers = self
            .locate_servers(params, filter, &[InstanceState::Running, InstanceState::Stopped])
            .await?;

        let now = Utc::now();
        let run = SnapshotRun {
            orchestrator: self,
            subnetwork,
            created: now,
            version: random_token(5),
            cluster_size: servers.len(),
            state: RunState::new(),
        };
        for server in servers {
            let hostname = hostname_from_name(server.tag("Name").unwrap_or(&server.id)).to_string();
            let fqdn = server.fqdn().to_string();
            let node = node_name(&hostname, subnetwork);
            run.state.insert(Association::new(server, hostname, fqdn, node));
        }
        info!(
            "Run {}: snapshotting {} server(s) as version {}",
            self.run_id(),
            run.cluster_size,
            run.version
        );
        runner.check(LOCATE)?;
        let run = &run;

        runner
            .run(VOLUMES, run.state.ids(), |id| run.label(id), move |id| async move {
                dropping(&run.state, &id, run.volumes(&id)).await
            })
            .await?;

        let snapshots = runner
            .run(SNAPSHOT, run.state.ids(), |id| run.label(id), move |id| async move {
                dropping(&run.state, &id, run.snapshot(&id)).await
            })
            .await?
            .completed
            .into_iter()
            .flatten()
            .collect();

        Ok(SnapshotReport {
            created: run.created.timestamp(),
            version: run.version.clone(),
            snapshots,
        })
    }

    /// Completion of the newest snapshots of hosts matching `filter`
    pub async fn snapshot_progress(&self, params: &RunParams, filter: Option<&str>) -> Result<SnapshotProgress> {
        let subnetwork = params.require_subnetwork().map_err(ConfigError::from)?;
        let pattern = format!(
            "{}*.{}.{}.{}",
            filter.unwrap_or_default(),
            subnetwork,
            params.network,
            params.domain
        );
        let query = TagQuery::key_value("Name", &pattern);
        let query = &query;
        let client = self.client();
        let snapshots = client
            .call("describe-snapshots", move || client.provider().describe_snapshots(query))
            .await?;
        let latest = select_latest_snapshots(snapshots, None);
        let progress: Vec<u8> = latest.iter().map(|s| s.progress).collect();
        let progress = SnapshotProgress {
            snapshots: latest.len(),
            percent: quadratic_mean(&progress),
        };
        info!(
            "{} snapshot(s) tagged {}: {}% complete",
            progress.snapshots, pattern, progress.percent
        );
        Ok(progress)
    }
}

struct SnapshotRun<'a> {
    orchestrator: &'a Orchestrator,
    subnetwork: &'a str,
    created: DateTime<Utc>,
    version: String,
    cluster_size: usize,
    state: RunState,
}

impl SnapshotRun<'_> {
    fn label(&self, id: &str) -> String {
        self.state
            .get(id)
            .map(|a| a.fqdn)
            .unwrap_or_else(|| id.to_string())
    }

    /// Volumes that outlive the server, keyed by device
    async fn volumes(&self, id: &str) -> Result<()> {
        let Some(association) = self.state.get(id) else {
            return Ok(());
        };
        let client = self.orchestrator.client();
        let mut durable = IndexMap::new();
        for mapping in association.server.block_devices.iter().filter(|b| !b.delete_on_termination) {
            let volume_id = mapping.volume_id.as_str();
            if let Some(volume) = client
                .call("describe-volumes", move || client.provider().get_volume(volume_id))
                .await?
            {
                durable.insert(mapping.device.clone(), volume);
            }
        }
        if durable.is_empty() {
            self.orchestrator
                .summary()
                .warn(&association.fqdn, "has no durable volumes to snapshot");
        }
        self.state.update(id, |a| a.old_volumes = durable);
        Ok(())
    }

    async fn snapshot(&self, id: &str) -> Result<Vec<String>> {
        let Some(association) = self.state.get(id) else {
            return Ok(Vec::new());
        };
        let client = self.orchestrator.client();
        let stamp = self.created.format("%Y%m%d%H%M%S");
        let mut taken = Vec::new();
        for (device, volume) in &association.old_volumes {
            let description = format!("fleet_{}_{}", association.fqdn, stamp);
            let description = description.as_str();
            let volume_id = volume.id.as_str();
            let snapshot_id = client
                .call("create-snapshot", move || {
                    client.provider().create_snapshot(volume_id, description)
                })
                .await?;
            let tags = SnapshotTags {
                name: &association.fqdn,
                created: self.created.timestamp(),
                subnetwork: self.subnetwork,
                device: Some(volume.tag("device").unwrap_or(device)),
                cluster_size: self.cluster_size,
                version: &self.version,
                raid_device: volume.tag("raid_device"),
                raid_version: volume.tag("raid_version"),
            }
            .to_tags();
            client.tag(&snapshot_id, &tags).await?;
            info!("{}: snapshot {} of {} ({})", association.fqdn, snapshot_id, volume.id, device);
            taken.push(snapshot_id);
        }
        Ok(taken)
    }
}
