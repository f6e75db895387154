//! Cloud provider collaborator
//!
//! The orchestrator only sees [`CloudProvider`]: the operations it calls on
//! instances, spot requests, volumes, snapshots, images, subnets, addresses
//! and tags. Tags are the only durable record; every lookup is a tag query.

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

mod aws;
mod mock;

pub use aws::AwsCliProvider;
pub use mock::MockProvider;

/// Resource tags
pub type Tags = BTreeMap<String, String>;

/// Compute instance state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    /// Launching
    Pending,
    /// Up
    Running,
    /// Shutting down for a stop
    Stopping,
    /// Stopped, volumes can be swapped
    Stopped,
    /// Shutting down for termination
    ShuttingDown,
    /// Gone
    Terminated,
}

impl InstanceState {
    /// Provider spelling
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
            InstanceState::ShuttingDown => "shutting-down",
            InstanceState::Terminated => "terminated",
        }
    }

    /// Parse the provider spelling
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => InstanceState::Pending,
            "running" => InstanceState::Running,
            "stopping" => InstanceState::Stopping,
            "stopped" => InstanceState::Stopped,
            "shutting-down" => InstanceState::ShuttingDown,
            "terminated" => InstanceState::Terminated,
            _ => return None,
        })
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether an instance can be stopped or only destroyed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Lifecycle {
    /// Durable: stop, swap volumes, start
    #[default]
    OnDemand,
    /// Ephemeral: destroy and recreate
    Spot,
}

/// One block-device mapping of an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDevice {
    /// Device name
    pub device: String,
    /// Attached volume
    pub volume_id: String,
    /// Deleted with the instance
    pub delete_on_termination: bool,
}

/// A compute instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRecord {
    /// Instance id
    pub id: String,
    /// Current state
    pub state: InstanceState,
    /// Spot or on-demand
    pub lifecycle: Lifecycle,
    /// Image launched from
    pub image_id: String,
    /// Instance size
    pub instance_type: String,
    /// Private address
    pub private_ip: Option<String>,
    /// Public address
    pub public_ip: Option<String>,
    /// Subnet id
    pub subnet_id: Option<String>,
    /// Block-device mappings
    pub block_devices: Vec<BlockDevice>,
    /// Tags
    pub tags: Tags,
}

impl ServerRecord {
    /// Value of a tag
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    /// The `fqdn` tag, falling back to the id
    pub fn fqdn(&self) -> &str {
        self.tag("fqdn").unwrap_or(&self.id)
    }

    /// Address to reach the server at
    pub fn address(&self) -> Option<&str> {
        self.private_ip.as_deref().or(self.public_ip.as_deref())
    }
}

/// Block volume state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VolumeState {
    /// Being created
    Creating,
    /// Ready, not attached
    Available,
    /// Attached
    InUse,
    /// Being deleted
    Deleting,
    /// Gone
    Deleted,
    /// Failed
    Error,
}

impl VolumeState {
    /// Parse the provider spelling
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "creating" => VolumeState::Creating,
            "available" => VolumeState::Available,
            "in-use" => VolumeState::InUse,
            "deleting" => VolumeState::Deleting,
            "deleted" => VolumeState::Deleted,
            "error" => VolumeState::Error,
            _ => return None,
        })
    }
}

/// A block volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeRecord {
    /// Volume id
    pub id: String,
    /// Current state
    pub state: VolumeState,
    /// Size in GiB
    pub size: u32,
    /// Availability zone
    pub availability_zone: String,
    /// Snapshot it was created from
    pub snapshot_id: Option<String>,
    /// Instance it is attached to
    pub attached_to: Option<String>,
    /// Device it is attached as
    pub attached_device: Option<String>,
    /// Deleted with the instance
    pub delete_on_termination: bool,
    /// Tags
    pub tags: Tags,
}

impl VolumeRecord {
    /// Value of a tag
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    /// `Name` plus device, for messages
    pub fn label(&self) -> String {
        match (self.tag("Name"), self.tag("device")) {
            (Some(name), Some(device)) => format!("{} {} mounted on {}", self.id, name, device),
            (Some(name), None) => format!("{} {}", self.id, name),
            _ => self.id.clone(),
        }
    }
}

/// A volume snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// Snapshot id
    pub id: String,
    /// Source volume
    pub volume_id: String,
    /// Source volume size in GiB
    pub volume_size: u32,
    /// Completion percentage
    pub progress: u8,
    /// Free-form description
    pub description: String,
    /// Tags
    pub tags: Tags,
}

impl SnapshotRecord {
    /// Value of a tag
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    /// The `created` tag as an epoch
    pub fn created(&self) -> Option<i64> {
        self.tag("created").and_then(|c| c.parse().ok())
    }
}

/// A machine image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Image id
    pub id: String,
    /// Image name
    pub name: String,
    /// Tags
    pub tags: Tags,
}

/// A subnet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubnetRecord {
    /// Subnet id
    pub id: String,
    /// Address block
    pub cidr_block: String,
    /// Availability zone
    pub availability_zone: Option<String>,
    /// Tags
    pub tags: Tags,
}

/// Spot request state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpotState {
    /// Waiting for capacity
    Open,
    /// Fulfilled
    Active,
    /// Closed by the provider
    Closed,
    /// Cancelled
    Cancelled,
    /// Failed
    Failed,
}

/// A spot instance request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpotRequestRecord {
    /// Request id
    pub id: String,
    /// Current state
    pub state: SpotState,
    /// Instance once fulfilled
    pub instance_id: Option<String>,
}

/// Everything needed to launch instances
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LaunchSpec {
    /// Image to launch
    pub image_id: String,
    /// Instance size
    pub instance_type: String,
    /// Number of instances
    pub count: u32,
    /// Subnet id
    pub subnet_id: Option<String>,
    /// Availability zone
    pub availability_zone: Option<String>,
    /// Security group ids
    pub security_groups: Vec<String>,
    /// Key pair
    pub key_name: Option<String>,
    /// Instance user-data
    pub user_data: Option<String>,
    /// EBS-optimized I/O
    pub ebs_optimized: bool,
    /// Fixed private address (single instance only)
    pub private_ip: Option<String>,
    /// Instance-store mappings as `(device, virtual name)`
    pub ephemeral_devices: Vec<(String, String)>,
    /// Idempotency token
    pub client_token: String,
    /// Spot launch group
    pub launch_group: Option<String>,
}

/// Parameters of a new volume
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewVolume {
    /// Availability zone
    pub availability_zone: String,
    /// Size in GiB (taken from the snapshot when absent)
    pub size: Option<u32>,
    /// Snapshot to restore
    pub snapshot_id: Option<String>,
    /// Volume type
    pub volume_type: Option<String>,
    /// Provisioned IOPS
    pub iops: Option<u32>,
}

/// A tag-value query
///
/// Matches resources having at least one tag whose value matches any of
/// `values` (`*` wildcards allowed), optionally restricted to instance
/// states.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagQuery {
    /// Tag-value patterns
    pub values: Vec<String>,
    /// Restrict to keys (any key when empty)
    pub keys: Vec<String>,
    /// Instance states (instances only; any state when empty)
    pub states: Vec<InstanceState>,
}

impl TagQuery {
    /// Match a tag value
    pub fn value(pattern: impl Into<String>) -> Self {
        Self {
            values: vec![pattern.into()],
            ..Default::default()
        }
    }

    /// Match a value under a specific key
    pub fn key_value(key: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            values: vec![pattern.into()],
            keys: vec![key.into()],
            states: Vec::new(),
        }
    }

    /// Restrict to instance states
    pub fn in_states(mut self, states: &[InstanceState]) -> Self {
        self.states = states.to_vec();
        self
    }

    /// Whether `tags` satisfy the value part of the query
    pub fn matches(&self, tags: &Tags) -> bool {
        if self.values.is_empty() {
            return true;
        }
        let patterns: Vec<glob::Pattern> = self
            .values
            .iter()
            .filter_map(|v| glob::Pattern::new(v).ok())
            .collect();
        tags.iter()
            .filter(|(k, _)| self.keys.is_empty() || self.keys.contains(k))
            .any(|(_, value)| patterns.iter().any(|p| p.matches(value)))
    }

    /// Whether an instance in `state` satisfies the state part
    pub fn accepts_state(&self, state: InstanceState) -> bool {
        self.states.is_empty() || self.states.contains(&state)
    }
}

/// Operations the orchestrator calls on the cloud provider
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Instances matching a tag query
    async fn describe_servers(&self, query: &TagQuery) -> Result<Vec<ServerRecord>>;

    /// One instance by id
    async fn get_server(&self, id: &str) -> Result<Option<ServerRecord>>;

    /// Launch on-demand instances, returning their ids
    async fn run_instances(&self, spec: &LaunchSpec) -> Result<Vec<String>>;

    /// Request spot instances, returning request ids
    async fn request_spot_instances(&self, spec: &LaunchSpec, price: &str) -> Result<Vec<String>>;

    /// Current state of spot requests
    async fn describe_spot_requests(&self, ids: &[String]) -> Result<Vec<SpotRequestRecord>>;

    /// Cancel spot requests
    async fn cancel_spot_requests(&self, ids: &[String]) -> Result<()>;

    /// Start stopped instances
    async fn start_instances(&self, ids: &[String]) -> Result<()>;

    /// Stop running instances
    async fn stop_instances(&self, ids: &[String]) -> Result<()>;

    /// Reboot instances
    async fn reboot_instances(&self, ids: &[String]) -> Result<()>;

    /// Terminate instances
    async fn terminate_instances(&self, ids: &[String]) -> Result<()>;

    /// Instance-store volume count of an instance type
    async fn instance_store_volumes(&self, instance_type: &str) -> Result<u32>;

    /// Create a volume
    async fn create_volume(&self, spec: &NewVolume) -> Result<VolumeRecord>;

    /// One volume by id
    async fn get_volume(&self, id: &str) -> Result<Option<VolumeRecord>>;

    /// Volumes matching a tag query
    async fn describe_volumes(&self, query: &TagQuery) -> Result<Vec<VolumeRecord>>;

    /// Attach a volume
    async fn attach_volume(&self, instance_id: &str, volume_id: &str, device: &str) -> Result<()>;

    /// Detach a volume
    async fn detach_volume(&self, volume_id: &str, force: bool) -> Result<()>;

    /// Delete a volume
    async fn delete_volume(&self, volume_id: &str) -> Result<()>;

    /// Mark an attached device delete-on-termination
    async fn set_delete_on_termination(&self, instance_id: &str, device: &str) -> Result<()>;

    /// Start a snapshot, returning its id
    async fn create_snapshot(&self, volume_id: &str, description: &str) -> Result<String>;

    /// Snapshots matching a tag query
    async fn describe_snapshots(&self, query: &TagQuery) -> Result<Vec<SnapshotRecord>>;

    /// Images matching a tag query
    async fn describe_images(&self, query: &TagQuery) -> Result<Vec<ImageRecord>>;

    /// One image by id
    async fn get_image(&self, id: &str) -> Result<Option<ImageRecord>>;

    /// Subnets matching a tag query
    async fn describe_subnets(&self, query: &TagQuery) -> Result<Vec<SubnetRecord>>;

    /// Allocate a public address and associate it, returning the address
    async fn associate_new_address(&self, instance_id: &str) -> Result<String>;

    /// Create or overwrite tags
    async fn create_tags(&self, resource_id: &str, tags: &Tags) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_tag_query_wildcards() {
        let t = tags(&[("Name", "ame1.dev:ms101"), ("fqdn", "ms101.dev.ame1.example.com")]);
        assert!(TagQuery::value("ame1.dev:ms*").matches(&t));
        assert!(TagQuery::value("ms101.dev.ame1.example.com").matches(&t));
        assert!(!TagQuery::value("ame1.prd:*").matches(&t));
        assert!(!TagQuery::key_value("Name", "ms101.dev.*").matches(&t));
        assert!(TagQuery::default().matches(&Tags::new()));
    }

    #[test]
    fn test_state_filter() {
        let q = TagQuery::value("*").in_states(&[InstanceState::Running]);
        assert!(q.accepts_state(InstanceState::Running));
        assert!(!q.accepts_state(InstanceState::Stopped));
        assert_eq!(InstanceState::parse("shutting-down"), Some(InstanceState::ShuttingDown));
    }
}
