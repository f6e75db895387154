//! Volume deletion
//!
//! Volumes are picked by id or by the fqdn of the server they belong to.
//! Attached volumes are only touched with `detach`; every detach and
//! every deletion is confirmed on its own.

use super::Orchestrator;
use crate::{
    Error, Result,
    provider::{InstanceState, TagQuery, VolumeRecord, VolumeState},
    tags,
};
use fleet_config::{ConfigError, RunParams};
use fleet_mixins::builtin::volume::device_path;
use std::collections::HashSet;
use tracing::info;

/// Which volumes to delete and how
#[derive(Debug, Clone, Default)]
pub struct VolumeDeleteOptions {
    /// One volume by id
    pub volume_id: Option<String>,
    /// Volumes of this host
    pub hostname: Option<String>,
    /// Only these devices (`sdf` or `/dev/sdf`)
    pub devices: Vec<String>,
    /// Detach attached volumes first
    pub detach: bool,
    /// Force the detach
    pub force_detach: bool,
}

impl VolumeDeleteOptions {
    fn wants_device(&self, volume: &VolumeRecord) -> bool {
        if self.devices.is_empty() {
            return true;
        }
        let device = volume.tag("device").or(volume.attached_device.as_deref());
        device.is_some_and(|d| self.devices.iter().any(|wanted| device_path(wanted) == d))
    }
}

impl Orchestrator {
    /// Delete volumes, returning the ids deleted
    pub async fn delete_volumes(&self, params: &RunParams, options: &VolumeDeleteOptions) -> Result<Vec<String>> {
        let volumes = self.volumes_to_delete(params, options).await?;

        let attached: Vec<String> = volumes
            .iter()
            .filter(|v| v.state == VolumeState::InUse)
            .map(VolumeRecord::label)
            .collect();
        if !attached.is_empty() && !options.detach {
            return Err(Error::resource(
                attached.join(", "),
                "attached; detach them first (--detach)",
            ));
        }

        let client = self.client();
        let mut deleted = Vec::new();
        for volume in volumes {
            let label = volume.label();
            if volume.state == VolumeState::InUse {
                let server = volume.attached_to.as_deref().unwrap_or("?");
                if !self.confirm().confirm(&format!("Detach {} from {}", label, server)) {
                    self.summary().warn(&label, "kept: detach declined");
                    continue;
                }
                self.detach(&volume.id, options.force_detach).await?;
            }
            if !self.confirm().confirm(&format!("Delete {}", label)) {
                self.summary().warn(&label, "kept: deletion declined");
                continue;
            }
            let id = volume.id.as_str();
            client
                .call("delete-volume", move || client.provider().delete_volume(id))
                .await?;
            client.wait_volume_deleted(id).await?;
            info!("Deleted {}", label);
            deleted.push(volume.id);
        }
        Ok(deleted)
    }

    async fn volumes_to_delete(&self, params: &RunParams, options: &VolumeDeleteOptions) -> Result<Vec<VolumeRecord>> {
        let client = self.client();
        let fqdn = options.hostname.as_deref().map(|h| params.fqdn(h));

        let volumes = match (&options.volume_id, &fqdn) {
            (Some(id), _) => {
                let id = id.as_str();
                let volume = client
                    .call("describe-volumes", move || client.provider().get_volume(id))
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("volume {}", id)))?;
                if let Some(fqdn) = &fqdn {
                    let name = volume.tag("Name").unwrap_or_default();
                    if name != fqdn.as_str() && name != tags::renamed(fqdn) {
                        return Err(Error::resource(
                            volume.label(),
                            format!("does not belong to {}", fqdn),
                        ));
                    }
                }
                if !options.wants_device(&volume) {
                    return Err(Error::resource(
                        volume.label(),
                        format!("is not one of the devices {}", options.devices.join(", ")),
                    ));
                }
                vec![volume]
            }
            (None, Some(fqdn)) => self.host_volumes(params, fqdn, options).await?,
            (None, None) => {
                return Err(ConfigError::ValidationError(
                    "a volume id or a hostname is required".to_string(),
                )
                .into());
            }
        };

        if volumes.is_empty() {
            return Err(Error::NotFound(format!(
                "volumes of {}",
                fqdn.as_deref().unwrap_or_default()
            )));
        }
        Ok(volumes)
    }

    /// Durable volumes attached to the host plus volumes named after it
    async fn host_volumes(&self, params: &RunParams, fqdn: &str, options: &VolumeDeleteOptions) -> Result<Vec<VolumeRecord>> {
        let client = self.client();
        let mut seen = HashSet::new();
        let mut found = Vec::new();

        let query = TagQuery::key_value("fqdn", fqdn).in_states(&[
            InstanceState::Pending,
            InstanceState::Running,
            InstanceState::Stopping,
            InstanceState::Stopped,
        ]);
        let query = &query;
        let servers = client
            .call("describe-instances", move || client.provider().describe_servers(query))
            .await?;
        for server in &servers {
            for mapping in server.block_devices.iter().filter(|b| !b.delete_on_termination) {
                let volume_id = mapping.volume_id.as_str();
                if let Some(volume) = client
                    .call("describe-volumes", move || client.provider().get_volume(volume_id))
                    .await?
                {
                    if seen.insert(volume.id.clone()) {
                        found.push(volume);
                    }
                }
            }
        }

        let query = TagQuery::key_value("Name", fqdn);
        let query = &query;
        let named = client
            .call("describe-volumes", move || client.provider().describe_volumes(query))
            .await?;
        found.extend(named.into_iter().filter(|v| seen.insert(v.id.clone())));

        let selected: Vec<VolumeRecord> = found.into_iter().filter(|v| options.wants_device(v)).collect();
        info!(
            "{} volume(s) of {} in {}",
            selected.len(),
            fqdn,
            params.network
        );
        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Tags;

    fn volume(device: Option<&str>, attached: Option<&str>) -> VolumeRecord {
        let mut tags = Tags::new();
        if let Some(device) = device {
            tags.insert("device".into(), device.into());
        }
        VolumeRecord {
            id: "vol-1".into(),
            state: VolumeState::Available,
            size: 100,
            availability_zone: "us-east-1a".into(),
            snapshot_id: None,
            attached_to: None,
            attached_device: attached.map(str::to_string),
            delete_on_termination: false,
            tags,
        }
    }

    #[test]
    fn test_device_filter() {
        let options = VolumeDeleteOptions {
            devices: vec!["sdf".into()],
            ..Default::default()
        };
        assert!(options.wants_device(&volume(Some("/dev/sdf"), None)));
        assert!(options.wants_device(&volume(None, Some("/dev/sdf"))));
        assert!(!options.wants_device(&volume(Some("/dev/sdg"), None)));
        assert!(!options.wants_device(&volume(None, None)));
        assert!(VolumeDeleteOptions::default().wants_device(&volume(None, None)));
    }
}
