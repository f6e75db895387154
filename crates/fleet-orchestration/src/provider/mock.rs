//! In-memory provider for dry runs and tests
//!
//! Launches, stops, detaches and volume creation first report a
//! transitional state; the next observation of the resource reports the
//! settled one. Failures can be injected per operation or per resource.

use super::{
    BlockDevice, CloudProvider, ImageRecord, InstanceState, LaunchSpec, Lifecycle, NewVolume,
    ServerRecord, SnapshotRecord, SpotRequestRecord, SpotState, SubnetRecord, Tags, TagQuery,
    VolumeRecord, VolumeState,
};
use crate::{Error, Result};
use async_trait::async_trait;
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::info;

struct Injected {
    operation: String,
    remaining: u32,
    transient: bool,
}

#[derive(Default)]
struct MockState {
    servers: IndexMap<String, ServerRecord>,
    volumes: IndexMap<String, VolumeRecord>,
    snapshots: IndexMap<String, SnapshotRecord>,
    images: IndexMap<String, ImageRecord>,
    subnets: IndexMap<String, SubnetRecord>,
    spot_requests: IndexMap<String, (SpotRequestRecord, LaunchSpec)>,
    server_transitions: HashMap<String, InstanceState>,
    volume_transitions: HashMap<String, VolumeState>,
    instance_store: HashMap<String, u32>,
    injected: Vec<Injected>,
    failing_tags: HashSet<String>,
    calls: Vec<String>,
    next_id: u64,
}

impl MockState {
    fn id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{:08x}", prefix, self.next_id)
    }

    fn check(&mut self, operation: &str) -> Result<()> {
        self.calls.push(operation.to_string());
        if let Some(pos) = self
            .injected
            .iter()
            .position(|i| i.operation == operation && i.remaining > 0)
        {
            let injected = &mut self.injected[pos];
            injected.remaining -= 1;
            return Err(Error::provider(operation, "injected failure", injected.transient));
        }
        Ok(())
    }

    fn settle_server(&mut self, id: &str) {
        if let Some(state) = self.server_transitions.remove(id) {
            if let Some(server) = self.servers.get_mut(id) {
                server.state = state;
            }
        }
    }

    fn settle_volume(&mut self, id: &str) {
        if let Some(state) = self.volume_transitions.remove(id) {
            if state == VolumeState::Deleted {
                self.volumes.shift_remove(id);
            } else if let Some(volume) = self.volumes.get_mut(id) {
                volume.state = state;
            }
        }
    }

    fn server_mut(&mut self, operation: &str, id: &str) -> Result<&mut ServerRecord> {
        self.servers
            .get_mut(id)
            .ok_or_else(|| Error::provider(operation, format!("unknown instance {}", id), false))
    }

    fn volume_mut(&mut self, operation: &str, id: &str) -> Result<&mut VolumeRecord> {
        self.volumes
            .get_mut(id)
            .ok_or_else(|| Error::provider(operation, format!("unknown volume {}", id), false))
    }

    fn launch(&mut self, spec: &LaunchSpec, lifecycle: Lifecycle) -> String {
        let id = self.id("i");
        let root = self.id("vol");
        let octet = self.servers.len() + 10;
        let private_ip = spec
            .private_ip
            .clone()
            .unwrap_or_else(|| format!("10.0.{}.{}", octet / 250, octet % 250));
        self.volumes.insert(
            root.clone(),
            VolumeRecord {
                id: root.clone(),
                state: VolumeState::InUse,
                size: 8,
                availability_zone: spec.availability_zone.clone().unwrap_or_default(),
                snapshot_id: None,
                attached_to: Some(id.clone()),
                attached_device: Some("/dev/sda1".to_string()),
                delete_on_termination: true,
                tags: Tags::new(),
            },
        );
        self.servers.insert(
            id.clone(),
            ServerRecord {
                id: id.clone(),
                state: InstanceState::Pending,
                lifecycle,
                image_id: spec.image_id.clone(),
                instance_type: spec.instance_type.clone(),
                private_ip: Some(private_ip),
                public_ip: None,
                subnet_id: spec.subnet_id.clone(),
                block_devices: vec![BlockDevice {
                    device: "/dev/sda1".to_string(),
                    volume_id: root,
                    delete_on_termination: true,
                }],
                tags: Tags::new(),
            },
        );
        self.server_transitions.insert(id.clone(), InstanceState::Running);
        id
    }

    fn detach(&mut self, volume_id: &str) {
        if let Some(volume) = self.volumes.get_mut(volume_id) {
            if let Some(server_id) = volume.attached_to.take() {
                volume.attached_device = None;
                if let Some(server) = self.servers.get_mut(&server_id) {
                    server.block_devices.retain(|b| b.volume_id != volume_id);
                }
            }
            self.volume_transitions
                .insert(volume_id.to_string(), VolumeState::Available);
        }
    }
}

/// In-memory [`CloudProvider`]
#[derive(Default)]
pub struct MockProvider {
    state: Mutex<MockState>,
}

impl MockProvider {
    /// An empty account
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed a server
    pub fn add_server(&self, server: ServerRecord) {
        self.lock().servers.insert(server.id.clone(), server);
    }

    /// Seed a volume
    pub fn add_volume(&self, volume: VolumeRecord) {
        let mut state = self.lock();
        if let (Some(server_id), Some(device)) = (&volume.attached_to, &volume.attached_device) {
            if let Some(server) = state.servers.get_mut(server_id) {
                server.block_devices.push(BlockDevice {
                    device: device.clone(),
                    volume_id: volume.id.clone(),
                    delete_on_termination: volume.delete_on_termination,
                });
            }
        }
        state.volumes.insert(volume.id.clone(), volume);
    }

    /// Seed a snapshot
    pub fn add_snapshot(&self, snapshot: SnapshotRecord) {
        self.lock().snapshots.insert(snapshot.id.clone(), snapshot);
    }

    /// Seed an image
    pub fn add_image(&self, image: ImageRecord) {
        self.lock().images.insert(image.id.clone(), image);
    }

    /// Seed a subnet
    pub fn add_subnet(&self, subnet: SubnetRecord) {
        self.lock().subnets.insert(subnet.id.clone(), subnet);
    }

    /// Instance-store volume count of an instance type
    pub fn set_instance_store(&self, instance_type: impl Into<String>, count: u32) {
        self.lock().instance_store.insert(instance_type.into(), count);
    }

    /// The next `times` calls of `operation` fail
    pub fn fail_next(&self, operation: impl Into<String>, times: u32, transient: bool) {
        self.lock().injected.push(Injected {
            operation: operation.into(),
            remaining: times,
            transient,
        });
    }

    /// Every tag write against `resource_id` fails transiently
    pub fn fail_tags_for(&self, resource_id: impl Into<String>) {
        self.lock().failing_tags.insert(resource_id.into());
    }

    /// Operations called so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Number of calls of one operation
    pub fn call_count(&self, operation: &str) -> usize {
        self.lock().calls.iter().filter(|c| *c == operation).count()
    }

    /// Current servers, without settling transitions
    pub fn servers(&self) -> Vec<ServerRecord> {
        self.lock().servers.values().cloned().collect()
    }

    /// Current volumes, without settling transitions
    pub fn volumes(&self) -> Vec<VolumeRecord> {
        self.lock().volumes.values().cloned().collect()
    }

    /// Current snapshots
    pub fn snapshots(&self) -> Vec<SnapshotRecord> {
        self.lock().snapshots.values().cloned().collect()
    }

    /// One volume, without settling transitions
    pub fn volume(&self, id: &str) -> Option<VolumeRecord> {
        self.lock().volumes.get(id).cloned()
    }

    /// One server, without settling transitions
    pub fn server(&self, id: &str) -> Option<ServerRecord> {
        self.lock().servers.get(id).cloned()
    }
}

#[async_trait]
impl CloudProvider for MockProvider {
    async fn describe_servers(&self, query: &TagQuery) -> Result<Vec<ServerRecord>> {
        let mut state = self.lock();
        state.check("describe-instances")?;
        let ids: Vec<String> = state.servers.keys().cloned().collect();
        for id in &ids {
            state.settle_server(id);
        }
        Ok(state
            .servers
            .values()
            .filter(|s| query.accepts_state(s.state) && query.matches(&s.tags))
            .cloned()
            .collect())
    }

    async fn get_server(&self, id: &str) -> Result<Option<ServerRecord>> {
        let mut state = self.lock();
        state.check("describe-instances")?;
        state.settle_server(id);
        Ok(state.servers.get(id).cloned())
    }

    async fn run_instances(&self, spec: &LaunchSpec) -> Result<Vec<String>> {
        let mut state = self.lock();
        state.check("run-instances")?;
        let ids: Vec<String> = (0..spec.count.max(1))
            .map(|_| state.launch(spec, Lifecycle::OnDemand))
            .collect();
        info!("(mock) Launched {} instance(s) from {}", ids.len(), spec.image_id);
        Ok(ids)
    }

    async fn request_spot_instances(&self, spec: &LaunchSpec, price: &str) -> Result<Vec<String>> {
        let mut state = self.lock();
        state.check("request-spot-instances")?;
        let mut ids = Vec::new();
        for _ in 0..spec.count.max(1) {
            let id = state.id("sir");
            state.spot_requests.insert(
                id.clone(),
                (
                    SpotRequestRecord {
                        id: id.clone(),
                        state: SpotState::Open,
                        instance_id: None,
                    },
                    spec.clone(),
                ),
            );
            ids.push(id);
        }
        info!("(mock) Requested {} spot instance(s) at {}", ids.len(), price);
        Ok(ids)
    }

    async fn describe_spot_requests(&self, ids: &[String]) -> Result<Vec<SpotRequestRecord>> {
        let mut state = self.lock();
        state.check("describe-spot-instance-requests")?;
        let mut found = Vec::new();
        for id in ids {
            let Some((request, spec)) = state.spot_requests.get(id).cloned() else {
                continue;
            };
            let request = if request.state == SpotState::Open {
                let instance = state.launch(&spec, Lifecycle::Spot);
                let fulfilled = SpotRequestRecord {
                    id: id.clone(),
                    state: SpotState::Active,
                    instance_id: Some(instance),
                };
                state
                    .spot_requests
                    .insert(id.clone(), (fulfilled.clone(), spec));
                fulfilled
            } else {
                request
            };
            found.push(request);
        }
        Ok(found)
    }

    async fn cancel_spot_requests(&self, ids: &[String]) -> Result<()> {
        let mut state = self.lock();
        state.check("cancel-spot-instance-requests")?;
        for id in ids {
            if let Some((request, _)) = state.spot_requests.get_mut(id) {
                request.state = SpotState::Cancelled;
            }
        }
        Ok(())
    }

    async fn start_instances(&self, ids: &[String]) -> Result<()> {
        let mut state = self.lock();
        state.check("start-instances")?;
        for id in ids {
            state.server_mut("start-instances", id)?.state = InstanceState::Pending;
            state.server_transitions.insert(id.clone(), InstanceState::Running);
        }
        Ok(())
    }

    async fn stop_instances(&self, ids: &[String]) -> Result<()> {
        let mut state = self.lock();
        state.check("stop-instances")?;
        for id in ids {
            let server = state.server_mut("stop-instances", id)?;
            if server.lifecycle == Lifecycle::Spot {
                return Err(Error::provider(
                    "stop-instances",
                    format!("spot instance {} cannot be stopped", id),
                    false,
                ));
            }
            server.state = InstanceState::Stopping;
            state.server_transitions.insert(id.clone(), InstanceState::Stopped);
        }
        Ok(())
    }

    async fn reboot_instances(&self, ids: &[String]) -> Result<()> {
        let mut state = self.lock();
        state.check("reboot-instances")?;
        for id in ids {
            state.server_mut("reboot-instances", id)?;
        }
        Ok(())
    }

    async fn terminate_instances(&self, ids: &[String]) -> Result<()> {
        let mut state = self.lock();
        state.check("terminate-instances")?;
        for id in ids {
            let server = state.server_mut("terminate-instances", id)?;
            server.state = InstanceState::ShuttingDown;
            let devices = std::mem::take(&mut server.block_devices);
            state.server_transitions.insert(id.clone(), InstanceState::Terminated);
            for device in devices {
                if device.delete_on_termination {
                    state.volumes.shift_remove(&device.volume_id);
                } else {
                    state.detach(&device.volume_id);
                }
            }
        }
        Ok(())
    }

    async fn instance_store_volumes(&self, instance_type: &str) -> Result<u32> {
        let mut state = self.lock();
        state.check("describe-instance-types")?;
        Ok(state.instance_store.get(instance_type).copied().unwrap_or(0))
    }

    async fn create_volume(&self, spec: &NewVolume) -> Result<VolumeRecord> {
        let mut state = self.lock();
        state.check("create-volume")?;
        let size = match (&spec.snapshot_id, spec.size) {
            (_, Some(size)) => size,
            (Some(snapshot), None) => state
                .snapshots
                .get(snapshot)
                .map(|s| s.volume_size)
                .ok_or_else(|| {
                    Error::provider("create-volume", format!("unknown snapshot {}", snapshot), false)
                })?,
            (None, None) => {
                return Err(Error::provider("create-volume", "size or snapshot required", false));
            }
        };
        let id = state.id("vol");
        let volume = VolumeRecord {
            id: id.clone(),
            state: VolumeState::Creating,
            size,
            availability_zone: spec.availability_zone.clone(),
            snapshot_id: spec.snapshot_id.clone(),
            attached_to: None,
            attached_device: None,
            delete_on_termination: false,
            tags: Tags::new(),
        };
        state.volumes.insert(id.clone(), volume.clone());
        state.volume_transitions.insert(id, VolumeState::Available);
        Ok(volume)
    }

    async fn get_volume(&self, id: &str) -> Result<Option<VolumeRecord>> {
        let mut state = self.lock();
        state.check("describe-volumes")?;
        state.settle_volume(id);
        Ok(state.volumes.get(id).cloned())
    }

    async fn describe_volumes(&self, query: &TagQuery) -> Result<Vec<VolumeRecord>> {
        let mut state = self.lock();
        state.check("describe-volumes")?;
        let ids: Vec<String> = state.volumes.keys().cloned().collect();
        for id in &ids {
            state.settle_volume(id);
        }
        Ok(state
            .volumes
            .values()
            .filter(|v| query.matches(&v.tags))
            .cloned()
            .collect())
    }

    async fn attach_volume(&self, instance_id: &str, volume_id: &str, device: &str) -> Result<()> {
        let mut state = self.lock();
        state.check("attach-volume")?;
        state.server_mut("attach-volume", instance_id)?;
        let volume = state.volume_mut("attach-volume", volume_id)?;
        if volume.state != VolumeState::Available {
            return Err(Error::provider(
                "attach-volume",
                format!("volume {} is not available", volume_id),
                true,
            ));
        }
        volume.state = VolumeState::InUse;
        volume.attached_to = Some(instance_id.to_string());
        volume.attached_device = Some(device.to_string());
        let delete_on_termination = volume.delete_on_termination;
        state
            .server_mut("attach-volume", instance_id)?
            .block_devices
            .push(BlockDevice {
                device: device.to_string(),
                volume_id: volume_id.to_string(),
                delete_on_termination,
            });
        Ok(())
    }

    async fn detach_volume(&self, volume_id: &str, _force: bool) -> Result<()> {
        let mut state = self.lock();
        state.check("detach-volume")?;
        state.volume_mut("detach-volume", volume_id)?;
        state.detach(volume_id);
        Ok(())
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<()> {
        let mut state = self.lock();
        state.check("delete-volume")?;
        let volume = state.volume_mut("delete-volume", volume_id)?;
        if volume.state == VolumeState::InUse {
            return Err(Error::provider(
                "delete-volume",
                format!("volume {} is in use", volume_id),
                false,
            ));
        }
        volume.state = VolumeState::Deleting;
        state
            .volume_transitions
            .insert(volume_id.to_string(), VolumeState::Deleted);
        Ok(())
    }

    async fn set_delete_on_termination(&self, instance_id: &str, device: &str) -> Result<()> {
        let mut state = self.lock();
        state.check("modify-instance-attribute")?;
        let server = state.server_mut("modify-instance-attribute", instance_id)?;
        let Some(mapping) = server.block_devices.iter_mut().find(|b| b.device == device) else {
            return Err(Error::provider(
                "modify-instance-attribute",
                format!("{} has no device {}", instance_id, device),
                false,
            ));
        };
        mapping.delete_on_termination = true;
        let volume_id = mapping.volume_id.clone();
        if let Some(volume) = state.volumes.get_mut(&volume_id) {
            volume.delete_on_termination = true;
        }
        Ok(())
    }

    async fn create_snapshot(&self, volume_id: &str, description: &str) -> Result<String> {
        let mut state = self.lock();
        state.check("create-snapshot")?;
        let size = state.volume_mut("create-snapshot", volume_id)?.size;
        let id = state.id("snap");
        state.snapshots.insert(
            id.clone(),
            SnapshotRecord {
                id: id.clone(),
                volume_id: volume_id.to_string(),
                volume_size: size,
                progress: 100,
                description: description.to_string(),
                tags: Tags::new(),
            },
        );
        Ok(id)
    }

    async fn describe_snapshots(&self, query: &TagQuery) -> Result<Vec<SnapshotRecord>> {
        let mut state = self.lock();
        state.check("describe-snapshots")?;
        Ok(state
            .snapshots
            .values()
            .filter(|s| query.matches(&s.tags))
            .cloned()
            .collect())
    }

    async fn describe_images(&self, query: &TagQuery) -> Result<Vec<ImageRecord>> {
        let mut state = self.lock();
        state.check("describe-images")?;
        Ok(state
            .images
            .values()
            .filter(|i| query.matches(&i.tags))
            .cloned()
            .collect())
    }

    async fn get_image(&self, id: &str) -> Result<Option<ImageRecord>> {
        let mut state = self.lock();
        state.check("describe-images")?;
        Ok(state.images.get(id).cloned())
    }

    async fn describe_subnets(&self, query: &TagQuery) -> Result<Vec<SubnetRecord>> {
        let mut state = self.lock();
        state.check("describe-subnets")?;
        Ok(state
            .subnets
            .values()
            .filter(|s| query.matches(&s.tags))
            .cloned()
            .collect())
    }

    async fn associate_new_address(&self, instance_id: &str) -> Result<String> {
        let mut state = self.lock();
        state.check("associate-address")?;
        let n = state.next_id;
        let address = format!("203.0.113.{}", n % 250 + 1);
        state.next_id += 1;
        state.server_mut("associate-address", instance_id)?.public_ip = Some(address.clone());
        Ok(address)
    }

    async fn create_tags(&self, resource_id: &str, tags: &Tags) -> Result<()> {
        let mut guard = self.lock();
        let state = &mut *guard;
        state.check("create-tags")?;
        if state.failing_tags.contains(resource_id) {
            return Err(Error::provider(
                "create-tags",
                format!("tagging {} failed", resource_id),
                true,
            ));
        }
        let target = if let Some(s) = state.servers.get_mut(resource_id) {
            &mut s.tags
        } else if let Some(v) = state.volumes.get_mut(resource_id) {
            &mut v.tags
        } else if let Some(s) = state.snapshots.get_mut(resource_id) {
            &mut s.tags
        } else if let Some(i) = state.images.get_mut(resource_id) {
            &mut i.tags
        } else if let Some(s) = state.subnets.get_mut(resource_id) {
            &mut s.tags
        } else {
            return Err(Error::provider(
                "create-tags",
                format!("unknown resource {}", resource_id),
                false,
            ));
        };
        target.extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[smol_potat::test]
    async fn test_transitions_settle_on_observation() {
        let provider = MockProvider::new();
        let ids = provider
            .run_instances(&LaunchSpec {
                image_id: "ami-1".into(),
                count: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(provider.server(&ids[0]).unwrap().state, InstanceState::Pending);
        let server = provider.get_server(&ids[0]).await.unwrap().unwrap();
        assert_eq!(server.state, InstanceState::Running);
        assert_eq!(server.block_devices.len(), 1);
    }

    #[smol_potat::test]
    async fn test_injected_failures_run_out() {
        let provider = MockProvider::new();
        provider.fail_next("describe-volumes", 1, true);
        let err = provider.describe_volumes(&TagQuery::default()).await.unwrap_err();
        assert!(err.is_transient());
        assert!(provider.describe_volumes(&TagQuery::default()).await.is_ok());
        assert_eq!(provider.call_count("describe-volumes"), 2);
    }

    #[smol_potat::test]
    async fn test_terminate_keeps_durable_volumes() {
        let provider = MockProvider::new();
        let ids = provider
            .run_instances(&LaunchSpec {
                image_id: "ami-1".into(),
                count: 1,
                ..Default::default()
            })
            .await
            .unwrap();
        let volume = provider
            .create_volume(&NewVolume {
                availability_zone: "us-east-1a".into(),
                size: Some(10),
                ..Default::default()
            })
            .await
            .unwrap();
        provider.get_volume(&volume.id).await.unwrap();
        provider.attach_volume(&ids[0], &volume.id, "/dev/sdf").await.unwrap();
        provider.terminate_instances(&ids).await.unwrap();

        assert_eq!(provider.volumes().len(), 1);
        let kept = provider.get_volume(&volume.id).await.unwrap().unwrap();
        assert_eq!(kept.state, VolumeState::Available);
        assert!(kept.attached_to.is_none());
    }
}
