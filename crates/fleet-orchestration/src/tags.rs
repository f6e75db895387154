//! Tag sets written to servers, volumes and snapshots
//!
//! Tags are the only record linking resources together, so their keys
//! and value formats stay stable:
//!
//! | key                 | value                                   |
//! |---------------------|-----------------------------------------|
//! | `Name`              | `network.subnetwork:hostname` (servers) |
//! | `fqdn`              | `hostname.subnetwork.network.domain`    |
//! | `vpc` / `subnet`    | network and subnetwork ids              |
//! | `device`            | device a volume is attached as          |
//! | `created`           | unix epoch                              |
//! | `vol_from_snapshot` | subnetwork a restored volume came from  |
//! | `raid`              | `yes` for raid members                  |

use crate::provider::Tags;
use fleet_config::RunParams;

/// Suffix appended to the `Name` of superseded volumes
pub const RENAMED_SUFFIX: &str = "-old";

/// `network.subnetwork:hostname`
pub fn server_name(network: &str, subnetwork: &str, hostname: &str) -> String {
    format!("{}.{}:{}", network, subnetwork, hostname)
}

/// Tag-value pattern for servers whose hostname starts with `prefix`
pub fn server_pattern(network: &str, subnetwork: &str, prefix: &str) -> String {
    let mut pattern = server_name(network, subnetwork, prefix);
    if !pattern.ends_with('*') {
        pattern.push('*');
    }
    pattern
}

/// Identity tags of a newly launched server, user tags merged last
pub fn server_tags(params: &RunParams, subnetwork: &str, hostname: &str, user: &Tags) -> Tags {
    let mut tags = Tags::new();
    tags.insert("Name".into(), server_name(&params.network, subnetwork, hostname));
    tags.insert("fqdn".into(), params.fqdn(hostname));
    tags.insert("vpc".into(), params.network.clone());
    tags.insert("subnet".into(), subnetwork.to_string());
    if let Some(profile) = &params.profile {
        tags.insert("hosttype".into(), profile.clone());
    }
    if let Some(stack) = &params.stack {
        tags.insert("stack".into(), stack.clone());
    }
    tags.extend(user.iter().map(|(k, v)| (k.clone(), v.clone())));
    tags
}

/// Tags of a volume created for a server
///
/// Scratch volumes are named after their device so they never match an
/// fqdn lookup.
pub fn volume_tags(
    params: &RunParams,
    subnetwork: &str,
    fqdn: &str,
    device: &str,
    temp: bool,
    raid_device: Option<&str>,
) -> Tags {
    let mut tags = Tags::new();
    let name = if temp {
        format!("{}-{}", device, fqdn)
    } else {
        fqdn.to_string()
    };
    tags.insert("Name".into(), name);
    tags.insert("subnet".into(), subnetwork.to_string());
    tags.insert("vpc".into(), params.network.clone());
    tags.insert("device".into(), device.to_string());
    if let Some(raid) = raid_device {
        tags.insert("raid".into(), "yes".into());
        tags.insert("raid_device".into(), raid.to_string());
    }
    tags
}

/// Tag naming the server a restored volume belongs to, as already found on
/// live infrastructure
pub const OWNER_TAG: &str = "bs-owner";

/// Tags of a volume restored from a snapshot
#[allow(clippy::too_many_arguments)]
pub fn restored_volume_tags(
    network: &str,
    subnetwork: &str,
    fqdn: &str,
    device: &str,
    from_subnetwork: &str,
    owner: &str,
    created: i64,
    raid_device: Option<&str>,
) -> Tags {
    let mut tags = Tags::new();
    tags.insert("Name".into(), fqdn.to_string());
    tags.insert("fqdn".into(), fqdn.to_string());
    tags.insert(OWNER_TAG.into(), owner.to_string());
    tags.insert("vol_from_snapshot".into(), from_subnetwork.to_string());
    tags.insert("subnet".into(), subnetwork.to_string());
    tags.insert("vpc".into(), network.to_string());
    tags.insert("device".into(), device.to_string());
    tags.insert("created".into(), created.to_string());
    if let Some(raid) = raid_device {
        tags.insert("raid".into(), "yes".into());
        tags.insert("raid_device".into(), raid.to_string());
    }
    tags
}

/// Tags of a snapshot taken in one epoch
pub struct SnapshotTags<'a> {
    /// `Name` of the source volume
    pub name: &'a str,
    /// Epoch shared by every snapshot of the run
    pub created: i64,
    /// Subnetwork of the source server
    pub subnetwork: &'a str,
    /// Device the source volume was attached as
    pub device: Option<&'a str>,
    /// Number of servers snapshotted in this run
    pub cluster_size: usize,
    /// Random run version
    pub version: &'a str,
    /// Raid device of the source volume
    pub raid_device: Option<&'a str>,
    /// Raid version of the source volume
    pub raid_version: Option<&'a str>,
}

impl SnapshotTags<'_> {
    /// Render as tags
    pub fn to_tags(&self) -> Tags {
        let mut tags = Tags::new();
        tags.insert("Name".into(), self.name.to_string());
        tags.insert("created".into(), self.created.to_string());
        tags.insert("subnet".into(), self.subnetwork.to_string());
        tags.insert("cluster_size".into(), self.cluster_size.to_string());
        tags.insert("version".into(), self.version.to_string());
        if let Some(device) = self.device {
            tags.insert("device".into(), device.to_string());
        }
        if let Some(raid) = self.raid_device {
            tags.insert("raid".into(), "yes".into());
            tags.insert("raid_device".into(), raid.to_string());
        }
        if let Some(raid_version) = self.raid_version {
            tags.insert("raid_version".into(), raid_version.to_string());
        }
        tags
    }
}

/// `Name` of a superseded volume
pub fn renamed(name: &str) -> String {
    if name.ends_with(RENAMED_SUFFIX) {
        name.to_string()
    } else {
        format!("{}{}", name, RENAMED_SUFFIX)
    }
}

/// `fqdn` of the same host in another subnetwork
pub fn fqdn_in_subnetwork(fqdn: &str, subnetwork: &str, from: &str) -> String {
    match fqdn.split_once('.') {
        Some((host, rest)) => match rest.split_once('.') {
            Some((current, tail)) if current == subnetwork => format!("{}.{}.{}", host, from, tail),
            _ => fqdn.to_string(),
        },
        None => fqdn.to_string(),
    }
}

/// Whether applying `tags` would change `current`
pub fn changes(current: &Tags, tags: &Tags) -> bool {
    tags.iter().any(|(k, v)| current.get(k) != Some(v))
}
