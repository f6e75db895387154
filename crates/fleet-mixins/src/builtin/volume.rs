//! Block-device layout (`volume` mixin)
//!
//! ```yaml
//! volume:
//!   ebs:
//!     /dev/sdf: { mount: /ebs, size: 200, raid_device: md0 }
//!     /dev/sdg: { mount: /scratch, temp: true }
//!   ephemeral:
//!     /dev/xvdb: { mount: /mnt }
//!   raid:
//!     md0: { mount: /data, level: 0 }
//!   bind:
//!     /var/lib/app: { mount: /data/app }
//!   swap: { size: 4096 }
//! ```

use crate::{
    Error, Result,
    manifest::ActionKind,
    mixin::{ActionContext, Mixin, MixinCore, ServerContext},
};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

const MANIFEST: &str = include_str!("../../templates/volume/mixin.yaml");
const SCHEMA: &str = include_str!("../../templates/volume/schema.yaml");
const TEMPLATES: &[(&str, &str)] = &[
    ("bs-volumes", include_str!("../../templates/volume/bs-volumes.hbs")),
    ("bs-ebs-functions", include_str!("../../templates/volume/bs-ebs-functions.hbs")),
    ("bs-ephemeral-functions", include_str!("../../templates/volume/bs-ephemeral-functions.hbs")),
    ("bs-swap-functions", include_str!("../../templates/volume/bs-swap-functions.hbs")),
    ("bs-bind-functions", include_str!("../../templates/volume/bs-bind-functions.hbs")),
    ("bs_volume_init", include_str!("../../templates/volume/bs_volume_init.hbs")),
];

/// Default filesystem
pub const DEFAULT_FORMAT: &str = "ext4";

/// Alternative mount description
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MountDetail {
    /// Mount point
    pub dir: Option<String>,
    /// Mount options
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<String>,
}

/// One block device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Device {
    /// Mount point
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mount: Option<String>,
    /// Mount description used when `mount` is absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mount_detail: Option<MountDetail>,
    /// Filesystem
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// Size in GiB (EBS) or MiB (swap)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u32>,
    /// Provider volume type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_type: Option<String>,
    /// Provisioned iops
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iops: Option<u32>,
    /// Scratch volume, deleted with the instance
    pub temp: bool,
    /// Raid array this device belongs to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raid_device: Option<String>,
    /// Raid level, for raid entries
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<u8>,
}

impl Device {
    /// Mount point from `mount` or `mount_detail.dir`
    pub fn mount_point(&self) -> Option<&str> {
        self.mount
            .as_deref()
            .or_else(|| self.mount_detail.as_ref().and_then(|d| d.dir.as_deref()))
    }

    /// Filesystem, `ext4` when unset
    pub fn filesystem(&self) -> &str {
        self.format.as_deref().unwrap_or(DEFAULT_FORMAT)
    }
}

/// Typed view of `volume` data
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeSpec {
    /// Network block devices by device path
    pub ebs: IndexMap<String, Device>,
    /// Instance-store devices
    pub ephemeral: IndexMap<String, Device>,
    /// Software raid arrays
    pub raid: IndexMap<String, Device>,
    /// Bind mounts keyed by source directory
    pub bind: IndexMap<String, Device>,
    /// Swap file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub swap: Option<Device>,
    /// Instance-store devices offered by the instance type
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ephemeral_available: Vec<String>,
}

/// `sdf` and `_dev_sdf` spellings both mean `/dev/sdf`
pub fn device_path(key: &str) -> String {
    let path = key.replace('_', "/");
    if path.starts_with('/') {
        path
    } else {
        format!("/dev/{}", path)
    }
}

/// Parse `--ebs 200,300`
pub fn parse_ebs_sizes(raw: &str) -> Result<Vec<u32>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u32>().map_err(|_| {
                Error::Invalid(vec![format!("volume: '{}' is not a volume size", s)])
            })
        })
        .collect()
}

impl VolumeSpec {
    /// Parse from merged data
    pub fn from_value(data: &Value) -> Result<Self> {
        super::typed("volume", data)
    }

    /// Any device of any kind declared
    pub fn is_empty(&self) -> bool {
        self.ebs.is_empty()
            && self.ephemeral.is_empty()
            && self.raid.is_empty()
            && self.bind.is_empty()
            && self.swap.is_none()
    }

    /// Mount point of a device of any kind
    pub fn mount(&self, device: &str) -> Option<&str> {
        [&self.ebs, &self.ephemeral, &self.raid, &self.bind]
            .into_iter()
            .find_map(|devices| devices.get(device))
            .and_then(Device::mount_point)
    }

    /// Filesystem of an EBS or ephemeral device
    pub fn format(&self, device: &str) -> Option<&str> {
        self.ebs
            .get(device)
            .or_else(|| self.ephemeral.get(device))
            .map(Device::filesystem)
    }

    /// Every mount point, in ephemeral, ebs, raid, bind order
    pub fn mounts(&self) -> Vec<&str> {
        [&self.ephemeral, &self.ebs, &self.raid, &self.bind]
            .into_iter()
            .flat_map(|devices| devices.values().filter_map(Device::mount_point))
            .collect()
    }

    /// Mount points declared more than once, with their counts
    pub fn duplicate_mounts(&self) -> Vec<(String, usize)> {
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for mount in self.mounts() {
            *counts.entry(mount).or_default() += 1;
        }
        counts
            .into_iter()
            .filter(|(_, n)| *n > 1)
            .map(|(m, n)| (m.to_string(), n))
            .collect()
    }

    /// Devices that do not outlive the instance
    pub fn temp_devices(&self) -> Vec<&str> {
        self.ephemeral
            .keys()
            .map(String::as_str)
            .chain(
                self.ebs
                    .iter()
                    .filter(|(_, d)| d.temp)
                    .map(|(k, _)| k.as_str()),
            )
            .collect()
    }

    /// EBS devices that survive the instance
    pub fn durable_ebs(&self) -> impl Iterator<Item = (&String, &Device)> {
        self.ebs.iter().filter(|(_, d)| !d.temp)
    }

    /// EBS devices belonging to a raid array
    pub fn raid_members(&self, raid_device: &str) -> Vec<&str> {
        self.ebs
            .iter()
            .filter(|(_, d)| d.raid_device.as_deref() == Some(raid_device))
            .map(|(k, _)| k.as_str())
            .collect()
    }

    /// Fill missing EBS sizes in declaration order
    ///
    /// Returns the sizes that were left over.
    pub fn apply_sizes(&mut self, sizes: &[u32]) -> Result<Vec<u32>> {
        let mut remaining = sizes.iter().copied();
        for (device, info) in self.ebs.iter_mut() {
            if info.size.is_some() {
                continue;
            }
            info.size = Some(remaining.next().ok_or_else(|| {
                Error::Invalid(vec![format!("volume: not enough sizes given for {}", device)])
            })?);
        }
        Ok(remaining.collect())
    }

    /// Record the instance-store devices an instance type offers
    pub fn set_ephemeral_available(&mut self, count: usize) {
        self.ephemeral_available = if count > 1 {
            ('b'..='z')
                .take(count)
                .map(|letter| format!("/dev/xvd{}", letter))
                .collect()
        } else {
            Vec::new()
        };
    }

    /// Back to plain data
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Built-in `volume` mixin
pub struct VolumeMixin {
    core: MixinCore,
}

impl VolumeMixin {
    /// Create from merged data
    pub fn new(data: Value) -> Result<Self> {
        Ok(Self {
            core: MixinCore::embedded("volume", data, MANIFEST, Some(SCHEMA), TEMPLATES)?,
        })
    }

    /// Typed data
    pub fn spec(&self) -> Result<VolumeSpec> {
        VolumeSpec::from_value(&self.core.data)
    }
}

impl Mixin for VolumeMixin {
    fn core(&self) -> &MixinCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut MixinCore {
        &mut self.core
    }

    fn validate(&self) -> Vec<String> {
        let mut problems = self.core.schema_violations();
        if !problems.is_empty() {
            return problems;
        }
        match self.spec() {
            Ok(spec) => {
                for (mount, count) in spec.duplicate_mounts() {
                    problems.push(format!("volume: duplicated mount {}: {} times", mount, count));
                }
                for (device, info) in &spec.ebs {
                    if let Some(raid) = &info.raid_device {
                        if !spec.raid.is_empty() && !spec.raid.contains_key(raid) {
                            problems.push(format!(
                                "volume: {} belongs to undefined raid '{}'",
                                device, raid
                            ));
                        }
                    }
                }
            }
            Err(e) => problems.push(e.to_string()),
        }
        problems
    }

    fn schedule(&self, cx: &ActionContext<'_>, target: &ServerContext) -> Result<usize> {
        let spec = self.spec()?;
        if spec.is_empty() {
            return Ok(0);
        }

        let mut templates = vec!["bs-volumes"];
        if !spec.ebs.is_empty() {
            templates.push("bs-ebs-functions");
        }
        if !spec.ephemeral.is_empty() {
            templates.push("bs-ephemeral-functions");
        }
        if spec.swap.is_some() {
            templates.push("bs-swap-functions");
        }
        if !spec.bind.is_empty() {
            templates.push("bs-bind-functions");
        }
        for template in &templates {
            self.core.action(cx, ActionKind::Install, target, template)?;
        }

        self.core
            .action(cx, ActionKind::Install, target, "bs_volume_init")?
            .on_complete(|path| {
                let file = path.rsplit('/').next().unwrap_or(path);
                vec![
                    format!("sudo update-rc.d {} defaults 01", file),
                    "sudo service bs_volume_init start".to_string(),
                ]
            });
        Ok(templates.len() + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec() -> VolumeSpec {
        VolumeSpec::from_value(&json!({
            "ebs": {
                "/dev/sdf": {"mount": "/ebs", "raid_device": "md0"},
                "/dev/sdg": {"mount_detail": {"dir": "/ebsg"}, "format": "xfs"},
                "/dev/sdh": {"mount": "/scratch", "temp": true, "size": 50}
            },
            "ephemeral": {"/dev/xvdb": {"mount": "/mnt"}},
            "bind": {"/var/lib/app": {"mount": "/ebs"}}
        }))
        .unwrap()
    }

    #[test]
    fn test_mounts_and_formats() {
        let spec = spec();
        assert_eq!(spec.mount("/dev/sdg"), Some("/ebsg"));
        assert_eq!(spec.format("/dev/sdf"), Some("ext4"));
        assert_eq!(spec.format("/dev/sdg"), Some("xfs"));
        assert_eq!(spec.format("/dev/nope"), None);
        assert_eq!(spec.duplicate_mounts(), vec![("/ebs".to_string(), 2)]);
    }

    #[test]
    fn test_temp_and_raid_devices() {
        let spec = spec();
        assert_eq!(spec.temp_devices(), vec!["/dev/xvdb", "/dev/sdh"]);
        assert_eq!(spec.raid_members("md0"), vec!["/dev/sdf"]);
        assert_eq!(spec.durable_ebs().count(), 2);
    }

    #[test]
    fn test_apply_sizes_in_declaration_order() {
        let mut spec = spec();
        let left = spec.apply_sizes(&[200, 300, 400]).unwrap();
        assert_eq!(spec.ebs["/dev/sdf"].size, Some(200));
        assert_eq!(spec.ebs["/dev/sdg"].size, Some(300));
        assert_eq!(spec.ebs["/dev/sdh"].size, Some(50));
        assert_eq!(left, vec![400]);

        let mut spec = self::spec();
        assert!(spec.apply_sizes(&[10]).is_err());
    }

    #[test]
    fn test_parse_sizes_and_device_paths() {
        assert_eq!(parse_ebs_sizes("200, 300").unwrap(), vec![200, 300]);
        assert!(parse_ebs_sizes("200,big").is_err());
        assert_eq!(device_path("_dev_sdf"), "/dev/sdf");
        assert_eq!(device_path("sdf"), "/dev/sdf");
    }

    #[test]
    fn test_ephemeral_available() {
        let mut spec = VolumeSpec::default();
        spec.set_ephemeral_available(2);
        assert_eq!(spec.ephemeral_available, vec!["/dev/xvdb", "/dev/xvdc"]);
        spec.set_ephemeral_available(1);
        assert!(spec.ephemeral_available.is_empty());
    }

    #[test]
    fn test_validate_reports_duplicates() {
        let mixin = VolumeMixin::new(spec().to_value()).unwrap();
        let problems = mixin.validate();
        assert_eq!(problems, vec!["volume: duplicated mount /ebs: 2 times".to_string()]);
    }
}
