//! Resource-lifecycle workflows
//!
//! Every workflow is a fixed sequence of [`Phase`](crate::phase::Phase)s
//! driven through a [`PhaseRunner`]. The [`Orchestrator`] carries the
//! collaborators all of them share: the retrying provider client, the
//! remote shell, the configuration-management server, the confirmation
//! prompt and the mixin registry.

pub mod create;
pub mod inventory;
pub mod restore;
pub mod server_delete;
pub mod snapshot;
pub mod stack;
pub mod volume_add;
pub mod volume_delete;

use crate::{
    Error, Result,
    bootstrap::ConfigManagement,
    confirm::{AssumeYes, Confirm},
    phase::PhaseRunner,
    provider::{
        CloudProvider, InstanceState, NewVolume, ServerRecord, SnapshotRecord, SubnetRecord, TagQuery,
        VolumeRecord, VolumeState,
    },
    retry::{RetryPolicy, RetryingProviderClient, WaitPolicy},
    state::{Association, RunState, RunSummary},
    tags,
};
use fleet_config::{ConfigError, ResolutionError, RunParams};
use fleet_mixins::{MixinRegistry, Renderer};
use rand::{Rng, distributions::Alphanumeric};
use remote_shell::RemoteShell;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// How long a server may take to accept remote-shell connections
pub const DEFAULT_REACHABLE_TIMEOUT: Duration = Duration::from_secs(600);

/// Cap on waiting for a durable server to stop before detaching volumes
pub const STOP_TIMEOUT: Duration = Duration::from_secs(1200);

/// Shared collaborators of every workflow
#[derive(Clone)]
pub struct Orchestrator {
    client: RetryingProviderClient,
    shell: Arc<dyn RemoteShell>,
    config_management: Arc<dyn ConfigManagement>,
    confirm: Arc<dyn Confirm>,
    registry: Arc<MixinRegistry>,
    renderer: Arc<Renderer>,
    summary: Arc<RunSummary>,
    checkpoint: Option<usize>,
    launch_policy: RetryPolicy,
    spot_policy: RetryPolicy,
    reachable_timeout: Duration,
    run_id: Uuid,
}

impl Orchestrator {
    /// Create an orchestrator
    ///
    /// Destructive actions are confirmed with [`AssumeYes`] until
    /// [`with_confirm`](Self::with_confirm) installs a real prompt.
    pub fn new(
        provider: Arc<dyn CloudProvider>,
        shell: Arc<dyn RemoteShell>,
        config_management: Arc<dyn ConfigManagement>,
        registry: MixinRegistry,
        renderer: Renderer,
    ) -> Self {
        Self {
            client: RetryingProviderClient::new(provider),
            shell,
            config_management,
            confirm: Arc::new(AssumeYes),
            registry: Arc::new(registry),
            renderer: Arc::new(renderer),
            summary: Arc::new(RunSummary::new()),
            checkpoint: None,
            launch_policy: RetryPolicy::launch(),
            spot_policy: RetryPolicy::spot(),
            reachable_timeout: DEFAULT_REACHABLE_TIMEOUT,
            run_id: Uuid::new_v4(),
        }
    }

    /// Ask before destroying anything
    pub fn with_confirm(mut self, confirm: Arc<dyn Confirm>) -> Self {
        self.confirm = confirm;
        self
    }

    /// Record warnings and failures into a summary owned by the caller
    pub fn with_summary(mut self, summary: Arc<RunSummary>) -> Self {
        self.summary = summary;
        self
    }

    /// Stop after the phase with this index
    pub fn with_checkpoint(mut self, checkpoint: Option<usize>) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    /// Use one retry policy for every provider call, launches included
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.client = self.client.with_policy(policy);
        self.launch_policy = policy;
        self.spot_policy = policy;
        self
    }

    /// Poll interval and cap of wait-for-state loops
    pub fn with_wait_policy(mut self, wait: WaitPolicy) -> Self {
        self.client = self.client.with_wait(wait);
        self
    }

    /// How long to wait for a new server's remote shell
    pub fn with_reachable_timeout(mut self, timeout: Duration) -> Self {
        self.reachable_timeout = timeout;
        self
    }

    /// The retrying provider client
    pub fn client(&self) -> &RetryingProviderClient {
        &self.client
    }

    /// The remote shell
    pub fn shell(&self) -> &dyn RemoteShell {
        self.shell.as_ref()
    }

    /// The configuration-management server
    pub fn config_management(&self) -> &dyn ConfigManagement {
        self.config_management.as_ref()
    }

    /// The confirmation prompt
    pub fn confirm(&self) -> &dyn Confirm {
        self.confirm.as_ref()
    }

    /// Registered mixins
    pub fn registry(&self) -> &MixinRegistry {
        &self.registry
    }

    /// Template renderer
    pub fn renderer(&self) -> &Renderer {
        &self.renderer
    }

    /// Warnings and failures of this run
    pub fn summary(&self) -> &Arc<RunSummary> {
        &self.summary
    }

    /// Identifier of this run, for logs
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// A phase runner bound to this run's summary and checkpoint
    pub fn runner(&self, batch_size: Option<usize>) -> PhaseRunner {
        PhaseRunner::new(self.summary.clone())
            .with_batch_size(batch_size)
            .with_checkpoint(self.checkpoint)
    }

    /// Servers named `network.subnetwork:<filter>*` in one of `states`
    ///
    /// Finding none is an error.
    pub async fn locate_servers(
        &self,
        params: &RunParams,
        filter: Option<&str>,
        states: &[InstanceState],
    ) -> Result<Vec<ServerRecord>> {
        let subnetwork = params.require_subnetwork().map_err(fleet_config::ConfigError::from)?;
        let pattern = tags::server_pattern(&params.network, subnetwork, filter.unwrap_or_default());
        let query = TagQuery::value(&pattern).in_states(states);
        let query = &query;
        let client = &self.client;
        let servers = client
            .call("describe-instances", move || client.provider().describe_servers(query))
            .await?;
        if servers.is_empty() {
            return Err(Error::NotFound(format!("servers tagged {}", pattern)));
        }
        info!("Located {} server(s) tagged {}", servers.len(), pattern);
        Ok(servers)
    }

    /// The subnet tagged `Name=network.subnetwork`
    pub async fn subnet(&self, network: &str, subnetwork: &str) -> Result<SubnetRecord> {
        let name = format!("{}.{}", network, subnetwork);
        let query = TagQuery::key_value("Name", &name);
        let query = &query;
        let client = &self.client;
        client
            .call("describe-subnets", move || client.provider().describe_subnets(query))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(format!("subnet tagged Name={}", name)))
    }

    /// Attach a volume and wait until it is in use
    pub async fn attach(&self, server_id: &str, volume_id: &str, device: &str) -> Result<VolumeRecord> {
        info!("Attaching {} to {} as {}", volume_id, server_id, device);
        let client = &self.client;
        client
            .call("attach-volume", move || {
                client.provider().attach_volume(server_id, volume_id, device)
            })
            .await?;
        client.wait_volume(volume_id, VolumeState::InUse).await
    }

    /// Detach a volume and wait until it is available
    pub async fn detach(&self, volume_id: &str, force: bool) -> Result<VolumeRecord> {
        info!("Detaching {}{}", volume_id, if force { " (forced)" } else { "" });
        let client = &self.client;
        client
            .call("detach-volume", move || client.provider().detach_volume(volume_id, force))
            .await?;
        client.wait_volume(volume_id, VolumeState::Available).await
    }

    /// Terminate a server and wait for it to go
    pub async fn terminate(&self, server_id: &str) -> Result<()> {
        info!("Terminating {}", server_id);
        let ids = [server_id.to_string()];
        let ids = &ids;
        let client = &self.client;
        client
            .call("terminate-instances", move || client.provider().terminate_instances(ids))
            .await?;
        client.wait_server(server_id, InstanceState::Terminated).await?;
        Ok(())
    }

    /// Snapshots named `fqdn` from the newest epoch, optionally of one version
    ///
    /// Finding none is an error.
    pub async fn latest_snapshots(&self, fqdn: &str, version: Option<&str>) -> Result<Vec<SnapshotRecord>> {
        let query = TagQuery::key_value("Name", fqdn);
        let query = &query;
        let client = &self.client;
        let snapshots = client
            .call("describe-snapshots", move || client.provider().describe_snapshots(query))
            .await?;
        let selected = select_latest_snapshots(snapshots, version);
        if selected.is_empty() {
            return Err(Error::NotFound(match version {
                Some(v) => format!("snapshots of {} with version {}", fqdn, v),
                None => format!("snapshots of {}", fqdn),
            }));
        }
        info!(
            "Selected {} snapshot(s) of {} created at {}",
            selected.len(),
            fqdn,
            selected[0].created().unwrap_or_default()
        );
        Ok(selected)
    }

    /// Start creating a volume from a snapshot
    pub async fn volume_from_snapshot(&self, snapshot: &SnapshotRecord, availability_zone: &str) -> Result<VolumeRecord> {
        let spec = NewVolume {
            availability_zone: availability_zone.to_string(),
            size: None,
            snapshot_id: Some(snapshot.id.clone()),
            volume_type: None,
            iops: None,
        };
        let spec = &spec;
        let client = &self.client;
        let volume = client
            .call("create-volume", move || client.provider().create_volume(spec))
            .await?;
        info!("Creating {} from {}", volume.id, snapshot.id);
        Ok(volume)
    }

    /// Terminate a server that is being dropped from the run, then delete
    /// the volumes created for it
    ///
    /// Cleanup failures are recorded as warnings; the failure that dropped
    /// the server is what gets reported.
    pub(crate) async fn destroy(&self, server_id: &str, association: Option<&Association>) {
        warn!("Destroying {} after a failure", server_id);
        if let Err(e) = self.terminate(server_id).await {
            self.summary
                .warn(server_id, format!("could not be destroyed: {}", e));
            return;
        }
        if let Some(association) = association {
            self.discard_volumes(association).await;
        }
    }

    /// Delete the volumes this run created for a server that left the run
    ///
    /// They carry the same `Name`/`fqdn`/`device` tags as a live server's
    /// volumes and would be found by the next lookup. Volumes still attached
    /// are left alone and reported.
    pub(crate) async fn discard_volumes(&self, association: &Association) {
        for volume_id in &association.created_volumes {
            if let Err(e) = self.discard_volume(volume_id, &association.fqdn).await {
                self.summary.warn(
                    volume_id,
                    format!("created for {} but could not be deleted: {}", association.fqdn, e),
                );
            }
        }
    }

    pub(crate) async fn discard_volume(&self, volume_id: &str, fqdn: &str) -> Result<()> {
        let client = &self.client;
        let volume = client
            .call("describe-volumes", move || client.provider().get_volume(volume_id))
            .await?;
        let Some(volume) = volume else {
            return Ok(());
        };
        match volume.state {
            VolumeState::Deleting | VolumeState::Deleted => return Ok(()),
            VolumeState::InUse => {
                self.summary.warn(
                    volume.label(),
                    format!("created for {} and still attached; left alone", fqdn),
                );
                return Ok(());
            }
            VolumeState::Creating => {
                client.wait_volume(volume_id, VolumeState::Available).await?;
            }
            VolumeState::Available | VolumeState::Error => {}
        }
        client
            .call("delete-volume", move || client.provider().delete_volume(volume_id))
            .await?;
        client.wait_volume_deleted(volume_id).await?;
        info!("Deleted {} created for {}", volume.label(), fqdn);
        Ok(())
    }
}

/// Variables available to `${..}` interpolation for a run
pub fn template_vars(params: &RunParams) -> HashMap<String, String> {
    let mut vars = HashMap::from([
        ("organization".to_string(), params.organization.clone()),
        ("domain".to_string(), params.domain.clone()),
        ("region".to_string(), params.region.clone()),
        ("network".to_string(), params.network.clone()),
        ("vpc".to_string(), params.network.clone()),
    ]);
    let optional = [
        ("subnetwork", &params.subnetwork),
        ("subnet", &params.subnetwork),
        ("environment", &params.environment),
        ("stack", &params.stack),
        ("profile", &params.profile),
    ];
    for (key, value) in optional {
        if let Some(value) = value {
            vars.insert(key.to_string(), value.clone());
        }
    }
    for (key, value) in &params.extra {
        if let Some(s) = value.as_str() {
            vars.entry(key.clone()).or_insert_with(|| s.to_string());
        }
    }
    vars
}

/// Drop a server from the run when its work fails
pub(crate) async fn dropping<T>(state: &RunState, id: &str, work: impl Future<Output = Result<T>>) -> Result<T> {
    let result = work.await;
    if result.is_err() {
        state.remove(id);
    }
    result
}

/// A required run parameter that is not set
pub(crate) fn missing(parameter: &str) -> Error {
    ConfigError::from(ResolutionError::MissingParameter(parameter.to_string())).into()
}

/// Snapshots of the newest `created` epoch
///
/// With a version only snapshots tagged with it are considered. Every
/// snapshot sharing the newest epoch is kept, one per device of a
/// multi-volume server.
pub fn select_latest_snapshots(snapshots: Vec<SnapshotRecord>, version: Option<&str>) -> Vec<SnapshotRecord> {
    let candidates: Vec<SnapshotRecord> = snapshots
        .into_iter()
        .filter(|s| version.is_none_or(|v| s.tag("version") == Some(v)))
        .filter(|s| s.created().is_some())
        .collect();
    let Some(latest) = candidates.iter().filter_map(SnapshotRecord::created).max() else {
        return Vec::new();
    };
    candidates
        .into_iter()
        .filter(|s| s.created() == Some(latest))
        .collect()
}

/// Fixed private address inside a subnet
///
/// `ip` gives the trailing octets (`15`, `"1.15"`) or a full address;
/// the leading octets come from the subnet's network address.
pub fn fixed_address(cidr: &str, ip: &Value) -> Option<String> {
    let wanted = match ip {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    let wanted: Vec<&str> = wanted.split('.').collect();
    if wanted.len() > 4 || wanted.iter().any(|o| o.parse::<u8>().is_err()) {
        return None;
    }
    let mut octets: Vec<&str> = cidr.split('/').next()?.split('.').collect();
    if octets.len() != 4 {
        return None;
    }
    octets.truncate(4 - wanted.len());
    octets.extend(wanted);
    Some(octets.join("."))
}

/// `len` random alphanumerics
pub fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_template_vars() {
        let params = RunParams {
            network: "ame1".into(),
            subnetwork: Some("dev".into()),
            domain: "example.com".into(),
            ..Default::default()
        };
        let vars = template_vars(&params);
        assert_eq!(vars["vpc"], "ame1");
        assert_eq!(vars["subnet"], "dev");
        assert!(!vars.contains_key("stack"));
    }

    fn snapshot(id: &str, created: i64, version: &str) -> SnapshotRecord {
        SnapshotRecord {
            id: id.into(),
            volume_id: format!("vol-{}", id),
            volume_size: 100,
            progress: 100,
            description: String::new(),
            tags: crate::provider::Tags::from([
                ("created".to_string(), created.to_string()),
                ("version".to_string(), version.to_string()),
            ]),
        }
    }

    #[test]
    fn test_latest_epoch_keeps_every_device() {
        let snapshots = vec![
            snapshot("s1", 100, "aaaaa"),
            snapshot("s2", 300, "bbbbb"),
            snapshot("s3", 200, "ccccc"),
            snapshot("s4", 300, "bbbbb"),
        ];
        let ids: Vec<String> = select_latest_snapshots(snapshots.clone(), None)
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec!["s2", "s4"]);

        let ids: Vec<String> = select_latest_snapshots(snapshots.clone(), Some("ccccc"))
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec!["s3"]);
        assert!(select_latest_snapshots(snapshots, Some("zzzzz")).is_empty());
    }

    #[test]
    fn test_fixed_address() {
        assert_eq!(fixed_address("10.20.4.0/24", &json!(15)).as_deref(), Some("10.20.4.15"));
        assert_eq!(fixed_address("10.20.0.0/16", &json!("4.15")).as_deref(), Some("10.20.4.15"));
        assert_eq!(fixed_address("10.20.0.0/16", &json!("10.30.1.2")).as_deref(), Some("10.30.1.2"));
        assert_eq!(fixed_address("10.20.0.0/16", &json!("x")), None);
        assert_eq!(fixed_address("10.20.0.0/16", &json!(null)), None);
    }

    #[test]
    fn test_random_token() {
        let token = random_token(5);
        assert_eq!(token.len(), 5);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
