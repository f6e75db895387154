//! Server creation
//!
//! | #  | phase          | unit     | a failed unit is      |
//! |----|----------------|----------|-----------------------|
//! | 1  | resolve        | run      | fatal                 |
//! | 2  | clean          | hostname | dropped               |
//! | 3  | launch         | run      | fatal                 |
//! | 4  | wait-running   | server   | destroyed and dropped |
//! | 5  | tag            | server   | destroyed and dropped |
//! | 6  | address        | server   | destroyed and dropped |
//! | 7  | volumes        | server   | destroyed and dropped |
//! | 8  | validate       | server   | destroyed and dropped |
//! | 9  | reachable      | server   | destroyed and dropped |
//! | 10 | pre-bootstrap  | server   | dropped               |
//! | 11 | bootstrap      | server   | dropped               |
//! | 12 | post-bootstrap | server   | dropped               |
//! | 13 | reboot         | server   | dropped               |
//!
//! Servers that fail once configuration management has touched them are
//! left running for inspection. A destroyed server's volumes created in this run are
//! deleted with it.

use super::{Orchestrator, dropping, fixed_address, missing, random_token, template_vars};
use crate::{
    Error, Result,
    bootstrap::BootstrapRequest,
    image::{ImageRequest, ImageScope, MatchProfile, select_image},
    naming::{HostnamePattern, hostname_from_name, node_name},
    phase::Phase,
    provider::{InstanceState, LaunchSpec, NewVolume, TagQuery, Tags, VolumeState},
    state::{Association, RunState},
    tags,
};
use fleet_config::{ConfigError, ConfigResolver, EffectiveConfig, RunParams, Selection, interpolate::interpolate};
use fleet_mixins::{
    ActionContext, ExecutionPlan, MixinSet, ServerContext, Stage,
    builtin::{AmiSpec, AptSpec, CloudConfMixin, VolumeSpec, resolve_tags, volume::device_path},
};
use remote_shell::RemoteTarget;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use tracing::{info, warn};

/// Mixins server creation cannot run without
pub const CREATE_REQUIRED_MIXINS: &[&str] = &["ami"];

const RESOLVE: Phase = Phase::new(1, "resolve");
const CLEAN: Phase = Phase::new(2, "clean");
const LAUNCH: Phase = Phase::new(3, "launch");
const WAIT_RUNNING: Phase = Phase::new(4, "wait-running");
const TAG: Phase = Phase::new(5, "tag");
const ADDRESS: Phase = Phase::new(6, "address");
const VOLUMES: Phase = Phase::new(7, "volumes");
const VALIDATE: Phase = Phase::new(8, "validate");
const REACHABLE: Phase = Phase::new(9, "reachable");
const PRE_BOOTSTRAP: Phase = Phase::new(10, "pre-bootstrap");
const BOOTSTRAP: Phase = Phase::new(11, "bootstrap");
const POST_BOOTSTRAP: Phase = Phase::new(12, "post-bootstrap");
const REBOOT: Phase = Phase::new(13, "reboot");

/// Where a new server's durable volumes come from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum VolumeSource {
    /// Fresh volumes laid out by the `volume` mixin
    #[default]
    New,
    /// Available volumes already named after the server
    Existing,
    /// The newest snapshots of the same host
    Snapshot {
        /// Subnetwork the snapshots were taken in (default: the target's)
        from: Option<String>,
        /// Only snapshots of this run version
        version: Option<String>,
    },
}

/// How servers are created
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Image selection
    pub image: ImageRequest,
    /// Sizes for EBS devices declared without one, in declaration order
    pub ebs_sizes: Vec<u32>,
    /// Volume source
    pub volumes: VolumeSource,
    /// Give every server a public address
    pub associate_address: bool,
    /// Stop before configuration management
    pub skip_bootstrap: bool,
    /// Launch on demand even when a spot price is configured
    pub on_demand: bool,
    /// Extra variables for mixin templates
    pub vars: Value,
}

/// Image family of another profile, for `--match`
pub fn match_profile(resolver: &ConfigResolver, selection: &Selection, profile: &str) -> Result<MatchProfile> {
    let config = resolver.resolve(&selection.clone().with_profile(profile), CREATE_REQUIRED_MIXINS)?;
    let params = &config.params;
    let hostname = params.require_hostname().map_err(ConfigError::from)?;
    let pattern = HostnamePattern::new(hostname, params.count.unwrap_or(1))?;
    let ami = AmiSpec::from_value(config.mixin("ami").unwrap_or(&Value::Null))?;
    let suffix = match &ami.suffix {
        Some(suffix) => interpolate(suffix, &template_vars(params))?,
        None => String::new(),
    };
    Ok(MatchProfile {
        profile: profile.to_string(),
        hostname_prefix: pattern.prefix().to_string(),
        suffix,
    })
}

/// `/dev/xvdb`.. mapped to `ephemeral0`..
fn ephemeral_mappings(devices: &[String]) -> Vec<(String, String)> {
    devices
        .iter()
        .enumerate()
        .map(|(n, device)| (device.clone(), format!("ephemeral{}", n)))
        .collect()
}

impl Orchestrator {
    /// Create the servers of one resolved profile
    ///
    /// Returns the servers that made it through every phase.
    pub async fn create_servers(&self, config: &EffectiveConfig, options: &CreateOptions) -> Result<Vec<Association>> {
        let params = &config.params;
        let subnetwork = params.require_subnetwork().map_err(ConfigError::from)?;
        let runner = self.runner(params.batch_size);
        info!(
            "Run {}: creating {} server(s) of profile {} in {}.{}",
            self.run_id(),
            params.count.unwrap_or(1),
            params.profile.as_deref().unwrap_or("-"),
            params.network,
            subnetwork
        );

        let mut mixins = self.registry().instantiate_all(config)?;
        let instance_type = params
            .instance_type
            .as_deref()
            .ok_or_else(|| missing("instance_type"))?;
        let volumes = self.prepare_volumes(&mut mixins, instance_type, &options.ebs_sizes).await?;
        let hostnames = self.free_hostnames(params, subnetwork).await?;
        let vars = template_vars(params);
        let ami = AmiSpec::from_value(mixins.data("ami"))?;
        let scope = ImageScope {
            network: &params.network,
            subnetwork,
        };
        let image_id = select_image(self.client(), &ami, &vars, &options.image, scope).await?;
        let user_data = self.user_data(&mixins, params)?;
        let subnet = self.subnet(&params.network, subnetwork).await?;
        let availability_zone = params
            .availability_zone
            .clone()
            .or_else(|| subnet.availability_zone.clone())
            .unwrap_or_default();
        let private_ip = match &params.ip_address {
            Some(ip) if hostnames.len() == 1 => fixed_address(&subnet.cidr_block, ip),
            Some(_) => {
                self.summary()
                    .warn("ip_address", format!("ignored for {} servers", hostnames.len()));
                None
            }
            None => None,
        };
        runner.check(RESOLVE)?;

        let run = CreateRun {
            orchestrator: self,
            params,
            subnetwork,
            options,
            mixins,
            volumes,
            vars,
            availability_zone,
            plan: ExecutionPlan::new(),
            state: RunState::new(),
        };
        let run = &run;

        let hostnames = runner
            .run(CLEAN, hostnames, |h| run.params.fqdn(h), move |h| run.clean(h))
            .await?
            .completed;

        let spot = params.spot_price.as_deref().filter(|_| !options.on_demand);
        let spec = LaunchSpec {
            image_id,
            instance_type: instance_type.to_string(),
            count: hostnames.len() as u32,
            subnet_id: Some(subnet.id.clone()),
            availability_zone: Some(run.availability_zone.clone()).filter(|az| !az.is_empty()),
            security_groups: params.security_groups.clone(),
            key_name: params.key_name.clone(),
            user_data,
            ebs_optimized: params.ebs_optimized,
            private_ip,
            ephemeral_devices: run
                .volumes
                .as_ref()
                .map(|v| ephemeral_mappings(&v.ephemeral_available))
                .unwrap_or_default(),
            client_token: random_token(4),
            launch_group: spot.map(|_| format!("{}:{}", params.network, subnetwork)),
        };
        let ids = self.launch(&spec, spot).await?;
        if ids.len() != hostnames.len() {
            self.summary().warn(
                subnetwork,
                format!("asked for {} server(s), got {}", hostnames.len(), ids.len()),
            );
        }
        runner.check(LAUNCH)?;

        let launched: Vec<(String, String)> = ids.into_iter().zip(hostnames).collect();
        runner
            .run(
                WAIT_RUNNING,
                launched,
                |(_, hostname)| run.params.fqdn(hostname),
                move |(id, hostname)| async move {
                    run.destroying(&id, run.wait_running(&id, hostname)).await
                },
            )
            .await?;

        runner
            .run(TAG, run.state.ids(), |id| run.label(id), move |id| async move {
                run.destroying(&id, run.tag(&id)).await
            })
            .await?;

        if options.associate_address {
            runner
                .run(ADDRESS, run.state.ids(), |id| run.label(id), move |id| async move {
                    run.destroying(&id, run.address(&id)).await
                })
                .await?;
        } else {
            runner.check(ADDRESS)?;
        }

        runner
            .run(VOLUMES, run.state.ids(), |id| run.label(id), move |id| async move {
                run.destroying(&id, run.attach_volumes(&id)).await
            })
            .await?;

        runner
            .run(VALIDATE, run.state.ids(), |id| run.label(id), move |id| async move {
                run.destroying(&id, run.validate(&id)).await
            })
            .await?;

        runner
            .run(REACHABLE, run.state.ids(), |id| run.label(id), move |id| async move {
                run.destroying(&id, run.reachable(&id)).await
            })
            .await?;

        runner
            .run(PRE_BOOTSTRAP, run.state.ids(), |id| run.label(id), move |id| async move {
                run.dropping(&id, run.execute(&id, Stage::BeforeBootstrap)).await
            })
            .await?;

        if options.skip_bootstrap {
            info!("Skipping bootstrap");
            runner.check(BOOTSTRAP)?;
        } else {
            runner
                .run(BOOTSTRAP, run.state.ids(), |id| run.label(id), move |id| async move {
                    run.dropping(&id, run.bootstrap(&id)).await
                })
                .await?;
        }

        runner
            .run(POST_BOOTSTRAP, run.state.ids(), |id| run.label(id), move |id| async move {
                run.dropping(&id, run.execute(&id, Stage::AfterBootstrap)).await
            })
            .await?;

        runner
            .run(REBOOT, run.state.ids(), |id| run.label(id), move |id| async move {
                run.dropping(&id, run.reboot(&id)).await
            })
            .await?;

        let created = run.state.all();
        info!(
            "Created {} server(s): {}",
            created.len(),
            created.iter().map(|a| a.fqdn.as_str()).collect::<Vec<_>>().join(", ")
        );
        Ok(created)
    }

    /// Typed `volume` data with sizes and instance storage filled in
    async fn prepare_volumes(
        &self,
        mixins: &mut MixinSet,
        instance_type: &str,
        sizes: &[u32],
    ) -> Result<Option<VolumeSpec>> {
        if mixins.get("volume").is_none() {
            if !sizes.is_empty() {
                self.summary().warn("volume", "EBS sizes given but no volume mixin is defined");
            }
            return Ok(None);
        }

        let mut spec = VolumeSpec::from_value(mixins.data("volume"))?;
        let duplicates = spec.duplicate_mounts();
        if !duplicates.is_empty() {
            return Err(fleet_mixins::Error::Invalid(
                duplicates
                    .into_iter()
                    .map(|(mount, n)| format!("volume: mount point {} declared {} times", mount, n))
                    .collect(),
            )
            .into());
        }
        let leftovers = spec.apply_sizes(sizes)?;
        if !leftovers.is_empty() {
            self.summary()
                .warn("volume", format!("unused EBS size(s): {:?}", leftovers));
        }

        let client = self.client();
        let available = client
            .call("describe-instance-types", move || {
                client.provider().instance_store_volumes(instance_type)
            })
            .await?;
        if !spec.ephemeral.is_empty() && available == 0 {
            self.summary().warn(
                instance_type,
                "ephemeral devices are declared but the instance type has no instance storage",
            );
        }
        spec.set_ephemeral_available(available as usize);

        if let Some(mixin) = mixins.get_mut("volume") {
            let filled = spec.to_value();
            mixin.configure(&mut |data| {
                if let (Value::Object(data), Value::Object(filled)) = (data, &filled) {
                    for (key, value) in filled {
                        data.insert(key.clone(), value.clone());
                    }
                }
            });
        }
        Ok(Some(spec))
    }

    /// Hostnames for this run, skipping numbers taken by live servers
    async fn free_hostnames(&self, params: &RunParams, subnetwork: &str) -> Result<Vec<String>> {
        let hostname = params.require_hostname().map_err(ConfigError::from)?;
        let count = params.count.unwrap_or(1).max(1);
        let pattern = HostnamePattern::new(hostname, count)?;
        let query = TagQuery::key_value(
            "Name",
            tags::server_pattern(&params.network, subnetwork, pattern.prefix()),
        )
        .in_states(&[
            InstanceState::Pending,
            InstanceState::Running,
            InstanceState::Stopping,
            InstanceState::Stopped,
        ]);
        let query = &query;
        let client = self.client();
        let servers = client
            .call("describe-instances", move || client.provider().describe_servers(query))
            .await?;
        let taken: Vec<String> = servers
            .iter()
            .filter_map(|s| s.tag("Name"))
            .map(|name| hostname_from_name(name).to_string())
            .collect();

        if !pattern.is_numbered() && taken.iter().any(|h| h == hostname) {
            return Err(Error::resource(params.fqdn(hostname), "a server with this hostname already exists"));
        }
        let hostnames = pattern.hostnames(count, &taken);
        info!("Hostnames for this run: {}", hostnames.join(", "));
        Ok(hostnames)
    }

    /// Instance user-data from `cloudconf` and `apt`
    fn user_data(&self, mixins: &MixinSet, params: &RunParams) -> Result<Option<String>> {
        let apt = match mixins.data("apt") {
            Value::Null => None,
            data => Some(AptSpec::from_value(data)?),
        };
        if mixins.get("cloudconf").is_none() && apt.is_none() {
            return Ok(None);
        }
        let cloudconf = CloudConfMixin::new(mixins.data("cloudconf").clone())?.with_apt(apt.as_ref());
        Ok(Some(cloudconf.user_data(self.renderer(), params)?))
    }

    /// Launch on demand, or through spot requests when `price` is given
    async fn launch(&self, spec: &LaunchSpec, price: Option<&str>) -> Result<Vec<String>> {
        let client = self.client();
        match price {
            Some(price) => {
                info!("Requesting {} spot instance(s) at {}", spec.count, price);
                client
                    .retry("request-spot-instances", self.spot_policy, move || {
                        self.spot_attempt(spec, price)
                    })
                    .await
            }
            None => {
                info!(
                    "Launching {} {} instance(s) from {}",
                    spec.count, spec.instance_type, spec.image_id
                );
                client
                    .retry("run-instances", self.launch_policy, move || {
                        client.provider().run_instances(spec)
                    })
                    .await
            }
        }
    }

    /// One spot request; unfulfilled requests are cancelled before retrying
    async fn spot_attempt(&self, spec: &LaunchSpec, price: &str) -> Result<Vec<String>> {
        let client = self.client();
        let requests = client.provider().request_spot_instances(spec, price).await?;
        match client.wait_spot_fulfilled(&requests).await {
            Ok(ids) => Ok(ids),
            Err(e) => {
                warn!("Spot request(s) {} not fulfilled: {}", requests.join(", "), e);
                if let Err(cancel) = client.provider().cancel_spot_requests(&requests).await {
                    self.summary()
                        .warn(requests.join(","), format!("could not be cancelled: {}", cancel));
                }
                Err(Error::provider("request-spot-instances", e, true))
            }
        }
    }
}

/// Everything one create run shares between its phases
struct CreateRun<'a> {
    orchestrator: &'a Orchestrator,
    params: &'a RunParams,
    subnetwork: &'a str,
    options: &'a CreateOptions,
    mixins: MixinSet,
    volumes: Option<VolumeSpec>,
    vars: HashMap<String, String>,
    availability_zone: String,
    plan: ExecutionPlan,
    state: RunState,
}

impl CreateRun<'_> {
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

    /// Drop and terminate a server whose work failed, with the volumes
    /// created for it
    async fn destroying(&self, id: &str, work: impl Future<Output = Result<()>>) -> Result<()> {
        let result = work.await;
        if result.is_err() {
            let association = self.state.remove(id);
            self.orchestrator.destroy(id, association.as_ref()).await;
        }
        result
    }

    /// Drop a server whose work failed, leaving it running
    async fn dropping(&self, id: &str, work: impl Future<Output = Result<()>>) -> Result<()> {
        dropping(&self.state, id, work).await
    }

    async fn clean(&self, hostname: String) -> Result<String> {
        let node = node_name(&hostname, self.subnetwork);
        let cm = self.orchestrator.config_management();
        if cm.is_registered(&node).await? {
            warn!("Removing stale config-management registration {}", node);
            cm.deregister(&node).await?;
        }
        Ok(hostname)
    }

    async fn wait_running(&self, id: &str, hostname: String) -> Result<()> {
        let server = self
            .orchestrator
            .client()
            .wait_server(id, InstanceState::Running)
            .await?;
        let fqdn = self.params.fqdn(&hostname);
        let node = node_name(&hostname, self.subnetwork);
        info!("{} is running as {}", fqdn, id);
        self.state.insert(Association::new(server, hostname, fqdn, node));
        Ok(())
    }

    async fn tag(&self, id: &str) -> Result<()> {
        let association = self.association(id)?;
        let mut vars = self.vars.clone();
        vars.insert("hostname".to_string(), association.hostname.clone());
        vars.insert("fqdn".to_string(), association.fqdn.clone());
        let user: Tags = resolve_tags(self.mixins.data("tag"), &vars)?.into_iter().collect();
        let tags = tags::server_tags(self.params, self.subnetwork, &association.hostname, &user);
        self.orchestrator.client().tag(id, &tags).await?;
        self.state.update(id, |a| a.server.tags.extend(tags));
        Ok(())
    }

    async fn address(&self, id: &str) -> Result<()> {
        let client = self.orchestrator.client();
        let address = client
            .call("associate-address", move || client.provider().associate_new_address(id))
            .await?;
        info!("{} reachable at {}", self.label(id), address);
        self.state.update(id, |a| a.server.public_ip = Some(address));
        Ok(())
    }

    async fn attach_volumes(&self, id: &str) -> Result<()> {
        let association = self.association(id)?;
        match &self.options.volumes {
            VolumeSource::New => self.new_volumes(&association).await,
            VolumeSource::Existing => self.existing_volumes(&association).await,
            VolumeSource::Snapshot { from, version } => {
                self.restored_volumes(&association, from.as_deref(), version.as_deref())
                    .await
            }
        }
    }

    async fn new_volumes(&self, association: &Association) -> Result<()> {
        let Some(spec) = &self.volumes else {
            return Ok(());
        };
        let client = self.orchestrator.client();
        for (key, device) in &spec.ebs {
            let path = device_path(key);
            let new = NewVolume {
                availability_zone: self.availability_zone.clone(),
                size: device.size,
                snapshot_id: None,
                volume_type: device.volume_type.clone(),
                iops: device.iops,
            };
            let new = &new;
            let volume = client
                .call("create-volume", move || client.provider().create_volume(new))
                .await?;
            self.created(association.id(), &volume.id);
            client.wait_volume(&volume.id, VolumeState::Available).await?;
            let tags = tags::volume_tags(
                self.params,
                self.subnetwork,
                &association.fqdn,
                &path,
                device.temp,
                device.raid_device.as_deref(),
            );
            client.tag(&volume.id, &tags).await?;
            let volume = self.orchestrator.attach(association.id(), &volume.id, &path).await?;
            if device.temp {
                let (server, device) = (association.id(), path.as_str());
                client
                    .call("modify-instance-attribute", move || {
                        client.provider().set_delete_on_termination(server, device)
                    })
                    .await?;
            }
            self.state.update(association.id(), |a| {
                a.new_volumes.insert(path, volume);
            });
        }
        Ok(())
    }

    fn created(&self, id: &str, volume_id: &str) {
        self.state.update(id, |a| a.created_volumes.push(volume_id.to_string()));
    }

    async fn existing_volumes(&self, association: &Association) -> Result<()> {
        let wanted: Vec<String> = self
            .volumes
            .as_ref()
            .map(|spec| spec.ebs.keys().map(String::as_str).map(device_path).collect())
            .unwrap_or_default();
        let query = TagQuery::key_value("Name", &association.fqdn);
        let query = &query;
        let client = self.orchestrator.client();
        let found = client
            .call("describe-volumes", move || client.provider().describe_volumes(query))
            .await?;
        let summary = self.orchestrator.summary();
        for volume in found {
            let Some(device) = volume.tag("device").map(str::to_string) else {
                summary.warn(&volume.id, "has no device tag; left alone");
                continue;
            };
            if !wanted.contains(&device) {
                summary.warn(volume.label(), "device is not declared by the volume mixin; left alone");
                continue;
            }
            if volume.state != VolumeState::Available {
                summary.warn(volume.label(), format!("is {:?}; left alone", volume.state));
                continue;
            }
            let volume = self.orchestrator.attach(association.id(), &volume.id, &device).await?;
            self.state.update(association.id(), |a| {
                a.new_volumes.insert(device, volume);
            });
        }
        Ok(())
    }

    async fn restored_volumes(&self, association: &Association, from: Option<&str>, version: Option<&str>) -> Result<()> {
        let from = from.unwrap_or(self.subnetwork);
        let source = tags::fqdn_in_subnetwork(&association.fqdn, self.subnetwork, from);
        let snapshots = self.orchestrator.latest_snapshots(&source, version).await?;
        let client = self.orchestrator.client();
        for snapshot in snapshots {
            let device = snapshot
                .tag("device")
                .map(str::to_string)
                .ok_or_else(|| Error::resource(&snapshot.id, "snapshot has no device tag"))?;
            let volume = self
                .orchestrator
                .volume_from_snapshot(&snapshot, &self.availability_zone)
                .await?;
            self.created(association.id(), &volume.id);
            client.wait_volume(&volume.id, VolumeState::Available).await?;
            let tags = tags::restored_volume_tags(
                &self.params.network,
                self.subnetwork,
                &association.fqdn,
                &device,
                from,
                &association.fqdn,
                snapshot.created().unwrap_or_default(),
                snapshot.tag("raid_device"),
            );
            client.tag(&volume.id, &tags).await?;
            let volume = self.orchestrator.attach(association.id(), &volume.id, &device).await?;
            self.state.update(association.id(), |a| {
                a.snapshots.push(snapshot);
                a.new_volumes.insert(device, volume);
            });
        }
        Ok(())
    }

    /// Durable devices attached; leftover scratch volumes reported
    async fn validate(&self, id: &str) -> Result<()> {
        let association = self.association(id)?;
        let Some(spec) = &self.volumes else {
            return Ok(());
        };
        let client = self.orchestrator.client();
        let server = client
            .call("describe-instances", move || client.provider().get_server(id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("server {}", id)))?;

        let attached: Vec<&str> = server.block_devices.iter().map(|b| b.device.as_str()).collect();
        let absent: Vec<String> = spec
            .durable_ebs()
            .map(|(key, _)| device_path(key))
            .filter(|device| !attached.contains(&device.as_str()))
            .collect();
        if !absent.is_empty() {
            return Err(Error::resource(
                &association.fqdn,
                format!("durable volume(s) not attached: {}", absent.join(", ")),
            ));
        }

        let query = TagQuery::key_value("Name", format!("*-{}", association.fqdn));
        let query = &query;
        let leftovers = client
            .call("describe-volumes", move || client.provider().describe_volumes(query))
            .await?;
        for volume in leftovers.iter().filter(|v| v.state == VolumeState::Available) {
            self.orchestrator
                .summary()
                .warn(&association.fqdn, format!("leftover temp volume {}", volume.label()));
        }

        self.state.update(id, |a| a.server = server);
        Ok(())
    }

    fn server_context(&self, id: &str) -> Result<ServerContext> {
        let association = self.association(id)?;
        let address = association
            .server
            .address()
            .ok_or_else(|| Error::resource(&association.fqdn, "server has no address"))?;
        Ok(ServerContext::new(id, &association.hostname, &association.fqdn, address))
    }

    async fn reachable(&self, id: &str) -> Result<()> {
        let target = self.server_context(id)?;
        let shell = self.orchestrator.shell();
        let timeout = self.orchestrator.reachable_timeout;
        let remote = RemoteTarget::new(&target.id, &target.address, &target.fqdn);
        if !shell.reachable(&remote, timeout).await {
            return Err(Error::Timeout {
                what: format!("{} to accept connections on port {}", target.fqdn, shell.port()),
                seconds: timeout.as_secs(),
            });
        }
        info!("{} is reachable", target.fqdn);
        Ok(())
    }

    /// Run one stage of mixin actions; actions are scheduled on first use
    async fn execute(&self, id: &str, stage: Stage) -> Result<()> {
        let target = self.server_context(id)?;
        if stage == Stage::BeforeBootstrap {
            let cx = ActionContext {
                plan: &self.plan,
                renderer: self.orchestrator.renderer(),
                params: self.params,
                vars: &self.options.vars,
            };
            let scheduled = self.mixins.schedule_all(&cx, &target)?;
            info!("{}: {} mixin action(s) scheduled", target.fqdn, scheduled);
        }
        let ran = self
            .plan
            .execute(stage, self.orchestrator.shell(), &target)
            .await?;
        info!("{}: ran {} action(s) {}", target.fqdn, ran, stage);
        Ok(())
    }

    async fn bootstrap(&self, id: &str) -> Result<()> {
        let association = self.association(id)?;
        let address = association
            .server
            .address()
            .ok_or_else(|| Error::resource(&association.fqdn, "server has no address"))?;
        let request = BootstrapRequest {
            address: address.to_string(),
            node_name: association.node_name.clone(),
            run_list: self.params.run_list.clone(),
            environment: self.params.environment.clone(),
            ssh_user: self.params.ssh_user.clone(),
            ssh_port: self.params.ssh_port,
            identity_file: self.params.identity_file.clone(),
            version: self.params.bootstrap_version.clone(),
            distro: self.params.distro.clone(),
        };
        self.orchestrator.config_management().bootstrap(&request).await
    }

    async fn reboot(&self, id: &str) -> Result<()> {
        let client = self.orchestrator.client();
        let ids = [id.to_string()];
        let ids = &ids;
        client
            .call("reboot-instances", move || client.provider().reboot_instances(ids))
            .await?;
        let server = client.wait_server(id, InstanceState::Running).await?;
        info!("{} rebooted", self.label(id));
        self.state.update(id, |a| a.server = server);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ephemeral_mappings() {
        let devices = vec!["/dev/xvdb".to_string(), "/dev/xvdc".to_string()];
        assert_eq!(
            ephemeral_mappings(&devices),
            vec![
                ("/dev/xvdb".to_string(), "ephemeral0".to_string()),
                ("/dev/xvdc".to_string(), "ephemeral1".to_string()),
            ]
        );
    }

    #[test]
    fn test_default_options() {
        let options = CreateOptions::default();
        assert_eq!(options.volumes, VolumeSource::New);
        assert!(!options.skip_bootstrap);
        assert!(options.vars.is_null());
    }
}
