//! Restore servers' volumes from their newest snapshots
//!
//! Durable servers are stopped, their snapshotted devices are swapped for
//! volumes restored from the newest snapshot epoch, and they are started
//! again. Spot servers cannot be stopped: they are terminated and created
//! afresh through [`Orchestrator::create_servers`], which restores the same
//! snapshots onto the new servers.
//!
//! Superseded volumes are renamed with a `-old` suffix and only deleted
//! when asked to, after a confirmation. A server dropped mid-run loses the
//! restored volumes it is not attached to.

use super::{
    Orchestrator, STOP_TIMEOUT,
    create::{CREATE_REQUIRED_MIXINS, CreateOptions, VolumeSource},
    stack::stack_configs,
};
use crate::{
    Error, Result,
    confirm::require,
    image::ImageRequest,
    naming::{HostnamePattern, hostname_from_name, node_name},
    phase::Phase,
    provider::{InstanceState, Lifecycle, ServerRecord, Tags, VolumeRecord, VolumeState},
    state::{Association, RunState},
    tags,
};
use fleet_config::{ConfigError, ConfigResolver, RunParams, Selection};
use indexmap::IndexMap;
use std::collections::HashSet;
use std::future::Future;
use tracing::{info, warn};

const LOCATE: Phase = Phase::new(1, "locate");
const SNAPSHOTS: Phase = Phase::new(2, "snapshots");
const CREATE_VOLUMES: Phase = Phase::new(3, "create-volumes");
const WAIT_AVAILABLE: Phase = Phase::new(4, "wait-available");
const TAG: Phase = Phase::new(5, "tag");
const RENAME: Phase = Phase::new(6, "rename-old");
const STOP: Phase = Phase::new(7, "stop");
const TERMINATE_SPOT: Phase = Phase::new(8, "terminate-spot");
const RECREATE_SPOT: Phase = Phase::new(9, "recreate-spot");
const DETACH: Phase = Phase::new(10, "detach-old");
const ATTACH: Phase = Phase::new(11, "attach-new");
const START: Phase = Phase::new(12, "start");
const DELETE_OLD: Phase = Phase::new(13, "delete-old");

/// Which servers to restore
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreTarget {
    /// Servers whose hostname starts with this filter
    Hosts(String),
    /// Every server of a stack
    Stack(String),
}

/// How servers are restored
#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Servers to restore
    pub target: RestoreTarget,
    /// Subnetwork the snapshots were taken in (default: the target's)
    pub from: Option<String>,
    /// Only snapshots of this run version
    pub version: Option<String>,
    /// Recreate spot servers from the image they run now
    pub matching: bool,
    /// Delete superseded volumes
    pub delete_old: bool,
    /// Rename superseded volumes
    pub rename_old: bool,
    /// Options for recreating spot servers
    pub create: CreateOptions,
}

impl RestoreOptions {
    /// Restore `target` from its own subnetwork's newest snapshots
    pub fn new(target: RestoreTarget) -> Self {
        Self {
            target,
            from: None,
            version: None,
            matching: false,
            delete_old: false,
            rename_old: true,
            create: CreateOptions::default(),
        }
    }
}

/// What a restore changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// Durable servers restarted on restored volumes
    pub restored: Vec<String>,
    /// Spot servers created in place of terminated ones
    pub recreated: Vec<String>,
    /// Superseded volumes deleted
    pub deleted: Vec<String>,
}

impl Orchestrator {
    /// Restore the targeted servers from snapshots
    pub async fn restore(
        &self,
        resolver: &ConfigResolver,
        selection: &Selection,
        options: &RestoreOptions,
    ) -> Result<RestoreReport> {
        let base = match &options.target {
            RestoreTarget::Stack(stack) => selection.clone().with_stack(stack),
            RestoreTarget::Hosts(_) => selection.clone(),
        };
        let config = resolver.resolve(&base, &[])?;
        let params = &config.params;
        let subnetwork = params.require_subnetwork().map_err(ConfigError::from)?;
        let from = options.from.as_deref().unwrap_or(subnetwork);
        let runner = self.runner(params.batch_size);
        info!(
            "Run {}: restoring {:?} in {}.{} from snapshots of {}",
            self.run_id(),
            options.target,
            params.network,
            subnetwork,
            from
        );

        let servers = self.restore_targets(resolver, &base, params, &options.target).await?;
        let run = RestoreRun {
            orchestrator: self,
            params,
            subnetwork,
            from,
            options,
            state: RunState::new(),
        };
        for server in servers {
            let hostname = hostname_from_name(server.tag("Name").unwrap_or(&server.id)).to_string();
            let fqdn = server.fqdn().to_string();
            let node = node_name(&hostname, subnetwork);
            run.state.insert(Association::new(server, hostname, fqdn, node));
        }
        runner.check(LOCATE)?;
        let run = &run;

        runner
            .run(SNAPSHOTS, run.state.ids(), |id| run.label(id), move |id| async move {
                run.dropping(&id, run.find_snapshots(&id)).await
            })
            .await?;

        runner
            .run(CREATE_VOLUMES, run.ids(Lifecycle::OnDemand), |id| run.label(id), move |id| async move {
                run.dropping(&id, run.create_volumes(&id)).await
            })
            .await?;

        runner
            .run(WAIT_AVAILABLE, run.ids(Lifecycle::OnDemand), |id| run.label(id), move |id| async move {
                run.dropping(&id, run.wait_available(&id)).await
            })
            .await?;

        runner
            .run(TAG, run.ids(Lifecycle::OnDemand), |id| run.label(id), move |id| async move {
                run.dropping(&id, run.tag(&id)).await
            })
            .await?;

        if options.rename_old {
            runner
                .run(RENAME, run.state.ids(), |id| run.label(id), move |id| async move {
                    run.dropping(&id, run.rename(&id)).await
                })
                .await?;
        } else {
            runner.check(RENAME)?;
        }

        runner
            .run(STOP, run.ids(Lifecycle::OnDemand), |id| run.label(id), move |id| async move {
                run.dropping(&id, run.stop(&id)).await
            })
            .await?;

        let terminated = runner
            .run(TERMINATE_SPOT, run.ids(Lifecycle::Spot), |id| run.label(id), move |id| async move {
                run.terminate(&id).await
            })
            .await?
            .completed;

        let recreated = run.recreate(resolver, &base, &terminated).await?;
        runner.check(RECREATE_SPOT)?;

        runner
            .run(DETACH, run.state.ids(), |id| run.label(id), move |id| async move {
                run.dropping(&id, run.detach_old(&id)).await
            })
            .await?;

        runner
            .run(ATTACH, run.state.ids(), |id| run.label(id), move |id| async move {
                run.dropping(&id, run.attach_new(&id)).await
            })
            .await?;

        runner
            .run(START, run.state.ids(), |id| run.label(id), move |id| async move {
                run.dropping(&id, run.start(&id)).await
            })
            .await?;

        let mut report = RestoreReport {
            restored: run.state.all().into_iter().map(|a| a.fqdn).collect(),
            recreated,
            deleted: Vec::new(),
        };

        if options.delete_old {
            let old: Vec<VolumeRecord> = run
                .state
                .all()
                .iter()
                .chain(&terminated)
                .flat_map(|a| a.old_volumes.values().cloned())
                .collect();
            if !old.is_empty() {
                require(self.confirm(), &format!("Delete {} old volume(s)", old.len()))?;
                report.deleted = runner
                    .run(DELETE_OLD, old, |v| v.label(), move |v| async move { run.delete(v).await })
                    .await?
                    .completed;
            }
        } else {
            runner.check(DELETE_OLD)?;
        }

        info!(
            "Restored {} server(s), recreated {}, deleted {} old volume(s)",
            report.restored.len(),
            report.recreated.len(),
            report.deleted.len()
        );
        Ok(report)
    }

    /// Servers named by the target, running or stopped
    async fn restore_targets(
        &self,
        resolver: &ConfigResolver,
        base: &Selection,
        params: &RunParams,
        target: &RestoreTarget,
    ) -> Result<Vec<ServerRecord>> {
        let states = [InstanceState::Running, InstanceState::Stopped];
        let filter = match target {
            RestoreTarget::Hosts(filter) => return self.locate_servers(params, Some(filter), &states).await,
            RestoreTarget::Stack(stack) => stack,
        };

        let mut servers = Vec::new();
        let mut seen = HashSet::new();
        for config in stack_configs(resolver, base)? {
            let profile = config.params.profile.clone().unwrap_or_default();
            let hostname = config.params.require_hostname().map_err(ConfigError::from)?;
            let pattern = HostnamePattern::new(hostname, config.params.count.unwrap_or(1))?;
            match self.locate_servers(&config.params, Some(pattern.prefix()), &states).await {
                Ok(found) => servers.extend(found.into_iter().filter(|s| seen.insert(s.id.clone()))),
                Err(Error::NotFound(what)) => {
                    warn!("Profile {} of stack {} has no servers: {}", profile, filter, what);
                }
                Err(e) => return Err(e),
            }
        }
        if servers.is_empty() {
            return Err(Error::NotFound(format!("servers of stack {}", filter)));
        }
        Ok(servers)
    }
}

/// Everything one restore run shares between its phases
struct RestoreRun<'a> {
    orchestrator: &'a Orchestrator,
    params: &'a RunParams,
    subnetwork: &'a str,
    from: &'a str,
    options: &'a RestoreOptions,
    state: RunState,
}

impl RestoreRun<'_> {
    fn label(&self, id: &str) -> String {
        self.state
            .get(id)
            .map(|a| a.fqdn)
            .unwrap_or_else(|| id.to_string())
    }

    fn association(&self, id: &str) -> Result<Association> {
        self.state
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("server {} in this run", id)))
    }

    /// Drop a server whose work failed and delete the restored volumes it
    /// no longer uses
    async fn dropping<T>(&self, id: &str, work: impl Future<Output = Result<T>>) -> Result<T> {
        let result = work.await;
        if result.is_err() {
            let dropped = self.state.remove(id);
            if let Some(association) = dropped {
                self.orchestrator.discard_volumes(&association).await;
            }
        }
        result
    }

    fn ids(&self, lifecycle: Lifecycle) -> Vec<String> {
        self.state
            .all()
            .into_iter()
            .filter(|a| a.server.lifecycle == lifecycle)
            .map(|a| a.server.id)
            .collect()
    }

    /// Newest snapshots and the volumes they will replace
    async fn find_snapshots(&self, id: &str) -> Result<()> {
        let association = self.association(id)?;
        let source = tags::fqdn_in_subnetwork(&association.fqdn, self.subnetwork, self.from);
        let snapshots = self
            .orchestrator
            .latest_snapshots(&source, self.options.version.as_deref())
            .await?;

        let client = self.orchestrator.client();
        let mut old = IndexMap::new();
        for snapshot in &snapshots {
            let device = snapshot
                .tag("device")
                .ok_or_else(|| Error::resource(&snapshot.id, "snapshot has no device tag"))?;
            let Some(mapping) = association.server.block_devices.iter().find(|b| b.device == device) else {
                continue;
            };
            let volume_id = mapping.volume_id.as_str();
            if let Some(volume) = client
                .call("describe-volumes", move || client.provider().get_volume(volume_id))
                .await?
            {
                old.insert(device.to_string(), volume);
            }
        }
        info!(
            "{}: {} snapshot(s) replace {} volume(s)",
            association.fqdn,
            snapshots.len(),
            old.len()
        );
        self.state.update(id, |a| {
            a.snapshots = snapshots;
            a.old_volumes = old;
        });
        Ok(())
    }

    async fn create_volumes(&self, id: &str) -> Result<()> {
        let association = self.association(id)?;
        let availability_zone = association
            .old_volumes
            .values()
            .map(|v| v.availability_zone.as_str())
            .find(|az| !az.is_empty())
            .or(self.params.availability_zone.as_deref())
            .ok_or_else(|| Error::resource(&association.fqdn, "availability zone is unknown"))?;
        for snapshot in &association.snapshots {
            let device = snapshot
                .tag("device")
                .ok_or_else(|| Error::resource(&snapshot.id, "snapshot has no device tag"))?
                .to_string();
            let volume = self
                .orchestrator
                .volume_from_snapshot(snapshot, availability_zone)
                .await?;
            self.state.update(id, |a| {
                a.created_volumes.push(volume.id.clone());
                a.new_volumes.insert(device, volume);
            });
        }
        Ok(())
    }

    async fn wait_available(&self, id: &str) -> Result<()> {
        let association = self.association(id)?;
        let client = self.orchestrator.client();
        for (device, volume) in &association.new_volumes {
            let volume = client.wait_volume(&volume.id, VolumeState::Available).await?;
            self.state.update(id, |a| {
                a.new_volumes.insert(device.clone(), volume);
            });
        }
        Ok(())
    }

    /// Link restored volumes to their server; unchanged tags are not rewritten
    async fn tag(&self, id: &str) -> Result<()> {
        let association = self.association(id)?;
        let client = self.orchestrator.client();
        for (device, volume) in &association.new_volumes {
            let snapshot = association
                .snapshots
                .iter()
                .find(|s| s.tag("device") == Some(device.as_str()));
            let tags = tags::restored_volume_tags(
                &self.params.network,
                self.subnetwork,
                &association.fqdn,
                device,
                self.from,
                &association.fqdn,
                snapshot.and_then(|s| s.created()).unwrap_or_default(),
                snapshot.and_then(|s| s.tag("raid_device")),
            );
            if !tags::changes(&volume.tags, &tags) {
                continue;
            }
            client.tag(&volume.id, &tags).await?;
            self.state.update(id, |a| {
                if let Some(v) = a.new_volumes.get_mut(device) {
                    v.tags.extend(tags);
                }
            });
        }
        Ok(())
    }

    async fn rename(&self, id: &str) -> Result<()> {
        let association = self.association(id)?;
        let client = self.orchestrator.client();
        for volume in association.old_volumes.values() {
            let name = volume.tag("Name").unwrap_or(&association.fqdn);
            let renamed = tags::renamed(name);
            if renamed == name {
                continue;
            }
            let tags = Tags::from([("Name".to_string(), renamed)]);
            client.tag(&volume.id, &tags).await?;
            info!("Renamed {} to {}", volume.id, tags["Name"]);
        }
        Ok(())
    }

    async fn stop(&self, id: &str) -> Result<()> {
        let association = self.association(id)?;
        let client = self.orchestrator.client();
        if association.server.state != InstanceState::Stopped {
            let ids = [id.to_string()];
            let ids = &ids;
            client
                .call("stop-instances", move || client.provider().stop_instances(ids))
                .await?;
        }
        let what = format!("{} to be stopped", association.fqdn);
        let server = client
            .wait_for_within(
                &what,
                STOP_TIMEOUT,
                move || client.provider().get_server(id),
                |s| s.as_ref().is_some_and(|s| s.state == InstanceState::Stopped),
            )
            .await?
            .ok_or_else(|| Error::NotFound(format!("server {}", id)))?;
        info!("{} stopped", association.fqdn);
        self.state.update(id, |a| a.server = server);
        Ok(())
    }

    /// Terminate a spot server, handing its association to the recreate phase
    async fn terminate(&self, id: &str) -> Result<Association> {
        let association = self.association(id)?;
        self.orchestrator.terminate(id).await?;
        self.state.remove(id);
        Ok(association)
    }

    /// Create replacements for terminated spot servers, one run per profile
    ///
    /// A profile whose run fails is recorded and the others carry on.
    async fn recreate(
        &self,
        resolver: &ConfigResolver,
        base: &Selection,
        terminated: &[Association],
    ) -> Result<Vec<String>> {
        let mut groups: IndexMap<&str, Vec<&Association>> = IndexMap::new();
        for association in terminated {
            match association.server.tag("hosttype") {
                Some(profile) => groups.entry(profile).or_default().push(association),
                None => self.orchestrator.summary().fail(
                    RECREATE_SPOT.name,
                    &association.fqdn,
                    "has no hosttype tag; cannot be recreated",
                ),
            }
        }

        let sub = self.orchestrator.clone().with_checkpoint(None);
        let mut recreated = Vec::new();
        for (profile, group) in &groups {
            match self.recreate_group(&sub, resolver, base, profile, group).await {
                Ok(created) => recreated.extend(created.into_iter().map(|a| a.fqdn)),
                Err(e) => {
                    warn!("Recreating profile {} failed: {}", profile, e);
                    self.orchestrator.summary().fail(RECREATE_SPOT.name, *profile, &e);
                }
            }
        }

        if !terminated.is_empty() && recreated.is_empty() && self.state.is_empty() {
            return Err(Error::PhaseFailed {
                index: RECREATE_SPOT.index,
                name: RECREATE_SPOT.name.to_string(),
                failures: terminated.len(),
            });
        }
        Ok(recreated)
    }

    async fn recreate_group(
        &self,
        sub: &Orchestrator,
        resolver: &ConfigResolver,
        base: &Selection,
        profile: &str,
        group: &[&Association],
    ) -> Result<Vec<Association>> {
        let mut selection = base.clone().with_profile(profile);
        if let Some(stack) = group.first().and_then(|a| a.server.tag("stack")) {
            selection = selection.with_stack(stack);
        }
        let mut config = resolver.resolve(&selection, CREATE_REQUIRED_MIXINS)?;
        config.params.count = Some(group.len() as u32);

        let mut options = self.options.create.clone();
        options.volumes = VolumeSource::Snapshot {
            from: Some(self.from.to_string()),
            version: self.options.version.clone(),
        };
        if self.options.matching {
            options.image.image_id = group.first().map(|a| a.server.image_id.clone());
        } else if options.image == ImageRequest::default() {
            options.image.latest = true;
        }
        info!("Recreating {} spot server(s) of profile {}", group.len(), profile);
        sub.create_servers(&config, &options).await
    }

    async fn detach_old(&self, id: &str) -> Result<()> {
        let association = self.association(id)?;
        for volume in association.old_volumes.values() {
            self.orchestrator.detach(&volume.id, false).await?;
        }
        Ok(())
    }

    async fn attach_new(&self, id: &str) -> Result<()> {
        let association = self.association(id)?;
        for (device, volume) in &association.new_volumes {
            let volume = self.orchestrator.attach(id, &volume.id, device).await?;
            self.state.update(id, |a| {
                a.new_volumes.insert(device.clone(), volume);
            });
        }
        Ok(())
    }

    async fn start(&self, id: &str) -> Result<()> {
        let client = self.orchestrator.client();
        let ids = [id.to_string()];
        let ids = &ids;
        client
            .call("start-instances", move || client.provider().start_instances(ids))
            .await?;
        let server = client.wait_server(id, InstanceState::Running).await?;
        info!("{} is running on restored volumes", self.label(id));
        self.state.update(id, |a| a.server = server);
        Ok(())
    }

    /// Delete a superseded volume once it has come free
    async fn delete(&self, volume: VolumeRecord) -> Result<String> {
        let client = self.orchestrator.client();
        let id = volume.id.as_str();
        client.wait_volume(id, VolumeState::Available).await?;
        client
            .call("delete-volume", move || client.provider().delete_volume(id))
            .await?;
        client.wait_volume_deleted(id).await?;
        info!("Deleted {}", volume.label());
        Ok(volume.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = RestoreOptions::new(RestoreTarget::Hosts("ms".into()));
        assert!(options.rename_old);
        assert!(!options.delete_old);
        assert!(options.from.is_none());
    }
}
