//! Adding volumes to a running server
//!
//! `create` makes one new volume at a free device, formats and mounts it.
//! `attach` brings back the available volumes named after the server at
//! the devices their `device` tag records; those keep their filesystem.

use super::Orchestrator;
use crate::{
    Error, Result,
    provider::{InstanceState, NewVolume, ServerRecord, TagQuery, Tags, VolumeRecord, VolumeState},
    tags,
};
use fleet_config::{ConfigError, EffectiveConfig};
use fleet_mixins::builtin::{
    VolumeSpec,
    volume::{Device, device_path},
};
use remote_shell::RemoteTarget;
use serde_json::Value;
use tracing::{info, warn};

/// Devices handed out to added volumes, in order
const FREE_DEVICES: std::ops::RangeInclusive<char> = 'f'..='p';

/// How to add a volume
#[derive(Debug, Clone, Default)]
pub struct VolumeCreateOptions {
    /// Host the volume is for
    pub hostname: String,
    /// Size in GiB
    pub size: u32,
    /// Scratch volume, deleted with the server
    pub temp: bool,
    /// Device to attach at (`sdg` or `/dev/sdg`); the first free one otherwise
    pub device: Option<String>,
    /// Mount point overriding the declared or default one
    pub mount: Option<String>,
    /// Attach only
    pub skip_mount: bool,
}

/// Kernel name of a provider device: `/dev/sdf` is `/dev/xvdf`
pub fn kernel_device(device: &str) -> String {
    match device.strip_prefix("/dev/sd") {
        Some(rest) => format!("/dev/xvd{}", rest),
        None => device.to_string(),
    }
}

/// `/ebs` for the first device, `/ebs<letter>` for the others
pub fn default_mount(device: &str) -> String {
    match device.strip_prefix("/dev/sd") {
        Some("f") | None => "/ebs".to_string(),
        Some(letter) => format!("/ebs{}", letter),
    }
}

/// Shell commands that mount a device, formatting it first if asked
pub fn mount_commands(device: &str, mount: &str, filesystem: &str, format: bool) -> Vec<String> {
    let kernel = kernel_device(device);
    let mut commands = Vec::new();
    if format {
        commands.push(format!("sudo mkfs.{} -q {}", filesystem, kernel));
    }
    commands.push(format!("sudo mkdir -p {}", mount));
    commands.push(format!("sudo mount -t {} {} {}", filesystem, kernel, mount));
    commands.push(format!(
        "echo '{} {} {} defaults,nofail 0 2' | sudo tee -a /etc/fstab > /dev/null",
        kernel, mount, filesystem
    ));
    commands
}

/// First device of `/dev/sdf`..`/dev/sdp` the server does not use
pub fn free_device(server: &ServerRecord) -> Option<String> {
    FREE_DEVICES
        .map(|letter| format!("/dev/sd{}", letter))
        .find(|device| !server.block_devices.iter().any(|b| &b.device == device))
}

fn declared<'a>(spec: &'a VolumeSpec, device: &str) -> Option<&'a Device> {
    spec.ebs
        .iter()
        .find(|(key, _)| device_path(key) == device)
        .map(|(_, d)| d)
}

impl Orchestrator {
    /// Create a volume for a running server, attach it and mount it
    ///
    /// A device declared by the `volume` mixin lends its mount point, type
    /// and filesystem. A volume that cannot be attached is deleted again.
    pub async fn create_volume(&self, config: &EffectiveConfig, options: &VolumeCreateOptions) -> Result<VolumeRecord> {
        let params = &config.params;
        let subnetwork = params.require_subnetwork().map_err(ConfigError::from)?;
        if options.size == 0 {
            return Err(ConfigError::ValidationError("a volume size is required".to_string()).into());
        }
        let fqdn = params.fqdn(&options.hostname);
        let server = self.running_server(&fqdn).await?;
        let spec = VolumeSpec::from_value(config.mixin("volume").unwrap_or(&Value::Null))?;

        let device = match &options.device {
            Some(device) => {
                let device = device_path(device);
                if server.block_devices.iter().any(|b| b.device == device) {
                    return Err(Error::resource(&fqdn, format!("{} is already in use", device)));
                }
                device
            }
            None => free_device(&server)
                .ok_or_else(|| Error::resource(&fqdn, "no free device left"))?,
        };
        let layout = declared(&spec, &device).cloned().unwrap_or_default();

        let availability_zone = match &params.availability_zone {
            Some(az) => az.clone(),
            None => self
                .subnet(&params.network, subnetwork)
                .await?
                .availability_zone
                .unwrap_or_default(),
        };
        let new = NewVolume {
            availability_zone,
            size: Some(options.size),
            snapshot_id: None,
            volume_type: layout.volume_type.clone(),
            iops: layout.iops,
        };
        let new = &new;
        let client = self.client();
        let volume = client
            .call("create-volume", move || client.provider().create_volume(new))
            .await?;
        info!("Creating {} ({} GiB) for {} at {}", volume.id, options.size, fqdn, device);

        let tags = tags::volume_tags(params, subnetwork, &fqdn, &device, options.temp, None);
        let attached = match self.place_volume(&server, &volume.id, &device, &tags, options.temp).await {
            Ok(attached) => attached,
            Err(e) => {
                if let Err(cleanup) = self.discard_volume(&volume.id, &fqdn).await {
                    self.summary()
                        .warn(&volume.id, format!("created for {} but could not be deleted: {}", fqdn, cleanup));
                }
                return Err(e);
            }
        };

        if options.skip_mount {
            info!("Attached {} to {}; not mounted", attached.label(), fqdn);
        } else {
            let mount = options
                .mount
                .clone()
                .or_else(|| layout.mount_point().map(str::to_string))
                .unwrap_or_else(|| default_mount(&device));
            let commands = mount_commands(&device, &mount, layout.filesystem(), true);
            self.mount(&server, &commands).await?;
            info!("Mounted {} at {} on {}", attached.label(), mount, fqdn);
        }
        Ok(attached)
    }

    /// Attach the available volumes named after a running server
    ///
    /// Every volume must carry a `device` tag declared by the `volume`
    /// mixin. Finding none is an error.
    pub async fn attach_volumes(&self, config: &EffectiveConfig, hostname: &str, skip_mount: bool) -> Result<Vec<VolumeRecord>> {
        let params = &config.params;
        let fqdn = params.fqdn(hostname);
        let server = self.running_server(&fqdn).await?;
        let spec = VolumeSpec::from_value(config.mixin("volume").unwrap_or(&Value::Null))?;

        let query = TagQuery::key_value("Name", &fqdn);
        let query = &query;
        let client = self.client();
        let found: Vec<VolumeRecord> = client
            .call("describe-volumes", move || client.provider().describe_volumes(query))
            .await?
            .into_iter()
            .filter(|v| v.state == VolumeState::Available)
            .collect();
        if found.is_empty() {
            return Err(Error::NotFound(format!("available volumes named {}", fqdn)));
        }

        let mut placed = Vec::new();
        for volume in &found {
            let device = volume
                .tag("device")
                .ok_or_else(|| Error::resource(volume.label(), "has no device tag"))?;
            let layout = declared(&spec, device).ok_or_else(|| {
                Error::resource(volume.label(), format!("{} is not declared by the volume mixin", device))
            })?;
            placed.push((volume, device.to_string(), layout));
        }

        let mut attached = Vec::new();
        for (volume, device, layout) in placed {
            let volume = self.attach(&server.id, &volume.id, &device).await?;
            if !skip_mount {
                let mount = layout
                    .mount_point()
                    .map(str::to_string)
                    .unwrap_or_else(|| default_mount(&device));
                let commands = mount_commands(&device, &mount, layout.filesystem(), false);
                self.mount(&server, &commands).await?;
                info!("Mounted {} at {} on {}", volume.label(), mount, fqdn);
            }
            attached.push(volume);
        }
        Ok(attached)
    }

    async fn running_server(&self, fqdn: &str) -> Result<ServerRecord> {
        let query = TagQuery::key_value("fqdn", fqdn).in_states(&[InstanceState::Running]);
        let query = &query;
        let client = self.client();
        client
            .call("describe-instances", move || client.provider().describe_servers(query))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(format!("running server {}", fqdn)))
    }

    /// Wait for a new volume, tag it and attach it
    async fn place_volume(
        &self,
        server: &ServerRecord,
        volume_id: &str,
        device: &str,
        tags: &Tags,
        temp: bool,
    ) -> Result<VolumeRecord> {
        let client = self.client();
        client.wait_volume(volume_id, VolumeState::Available).await?;
        client.tag(volume_id, tags).await?;
        let volume = self.attach(&server.id, volume_id, device).await?;
        if temp {
            let server_id = server.id.as_str();
            client
                .call("modify-instance-attribute", move || {
                    client.provider().set_delete_on_termination(server_id, device)
                })
                .await?;
        }
        Ok(volume)
    }

    async fn mount(&self, server: &ServerRecord, commands: &[String]) -> Result<()> {
        let fqdn = server.fqdn();
        let address = server
            .address()
            .ok_or_else(|| Error::resource(fqdn, "server has no address"))?;
        let target = RemoteTarget::new(&server.id, address, fqdn);
        let shell = self.shell();
        if !shell.reachable(&target, self.reachable_timeout).await {
            return Err(Error::Timeout {
                what: format!("{} to accept connections on port {}", fqdn, shell.port()),
                seconds: self.reachable_timeout.as_secs(),
            });
        }
        for command in commands {
            let code = shell.run(&target, command).await?;
            if code != 0 {
                warn!("Exit status {} for command [{}] on {}", code, command, fqdn);
                return Err(Error::resource(fqdn, format!("'{}' exited with {}", command, code)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{BlockDevice, Lifecycle};
    use fleet_mixins::builtin::volume::DEFAULT_FORMAT;

    fn server(devices: &[&str]) -> ServerRecord {
        ServerRecord {
            id: "i-1".into(),
            state: InstanceState::Running,
            lifecycle: Lifecycle::default(),
            image_id: "ami-1".into(),
            instance_type: "m5.large".into(),
            private_ip: Some("10.0.0.10".into()),
            public_ip: None,
            subnet_id: None,
            block_devices: devices
                .iter()
                .map(|d| BlockDevice {
                    device: d.to_string(),
                    volume_id: format!("vol-{}", d.len()),
                    delete_on_termination: false,
                })
                .collect(),
            tags: Tags::new(),
        }
    }

    #[test]
    fn test_free_device() {
        assert_eq!(free_device(&server(&["/dev/sda1"])).as_deref(), Some("/dev/sdf"));
        assert_eq!(
            free_device(&server(&["/dev/sda1", "/dev/sdf", "/dev/sdg"])).as_deref(),
            Some("/dev/sdh")
        );
        let full: Vec<String> = FREE_DEVICES.map(|l| format!("/dev/sd{}", l)).collect();
        let full: Vec<&str> = full.iter().map(String::as_str).collect();
        assert_eq!(free_device(&server(&full)), None);
    }

    #[test]
    fn test_mount_layout() {
        assert_eq!(kernel_device("/dev/sdg"), "/dev/xvdg");
        assert_eq!(kernel_device("/dev/nvme1n1"), "/dev/nvme1n1");
        assert_eq!(default_mount("/dev/sdf"), "/ebs");
        assert_eq!(default_mount("/dev/sdh"), "/ebsh");

        let commands = mount_commands("/dev/sdg", "/scratch", DEFAULT_FORMAT, true);
        assert_eq!(commands[0], "sudo mkfs.ext4 -q /dev/xvdg");
        assert_eq!(commands[2], "sudo mount -t ext4 /dev/xvdg /scratch");
        assert!(commands[3].contains("/dev/xvdg /scratch ext4"));

        let commands = mount_commands("/dev/sdf", "/ebs", "xfs", false);
        assert!(commands.iter().all(|c| !c.contains("mkfs")));
        assert_eq!(commands.len(), 3);
    }
}
