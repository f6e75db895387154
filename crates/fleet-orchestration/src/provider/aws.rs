//! Provider backed by the `aws` command-line client

use super::{
    BlockDevice, CloudProvider, ImageRecord, InstanceState, LaunchSpec, Lifecycle, NewVolume,
    ServerRecord, SnapshotRecord, SpotRequestRecord, SpotState, SubnetRecord, Tags, TagQuery,
    VolumeRecord, VolumeState,
};
use crate::{Error, Result};
use async_trait::async_trait;
use remote_shell::Command;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::debug;

/// Error codes worth another attempt
const TRANSIENT_CODES: &[&str] = &[
    "RequestLimitExceeded",
    "Throttling",
    "InsufficientInstanceCapacity",
    "ServiceUnavailable",
    "Unavailable",
    "InternalError",
    "IncorrectState",
    "InvalidInstanceID.NotFound",
    "InvalidVolume.NotFound",
];

/// Drives `aws ec2 ... --output json`
#[derive(Debug, Clone, Default)]
pub struct AwsCliProvider {
    region: Option<String>,
    profile: Option<String>,
}

impl AwsCliProvider {
    /// Create a provider for a region and credentials profile
    pub fn new(region: Option<String>, profile: Option<String>) -> Self {
        Self { region, profile }
    }

    fn command(&self, operation: &str) -> Command {
        let mut cmd = Command::new("aws");
        cmd.arg("ec2").arg(operation).arg("--output").arg("json");
        if let Some(region) = &self.region {
            cmd.arg("--region").arg(region);
        }
        if let Some(profile) = &self.profile {
            cmd.arg("--profile").arg(profile);
        }
        cmd
    }

    async fn exec(&self, operation: &str, cmd: &Command) -> Result<Value> {
        debug!("Running {}", cmd);
        let output = cmd
            .prepare()
            .output()
            .await
            .map_err(|e| Error::provider(operation, format!("failed to run aws: {}", e), false))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(Error::provider(operation, &stderr, is_transient(&stderr)));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&stdout)?)
    }

    async fn query<T: DeserializeOwned>(&self, operation: &str, cmd: &Command) -> Result<T> {
        let value = self.exec(operation, cmd).await?;
        serde_json::from_value(value).map_err(|e| Error::provider(operation, e, false))
    }
}

/// Whether an error message from the CLI names a retryable condition
pub fn is_transient(stderr: &str) -> bool {
    TRANSIENT_CODES.iter().any(|code| stderr.contains(code))
}

/// Render a tag query as `--filters` arguments
pub fn filters(query: &TagQuery) -> Vec<String> {
    let mut filters = Vec::new();
    if !query.values.is_empty() {
        let values = query.values.join(",");
        if query.keys.is_empty() {
            filters.push(format!("Name=tag-value,Values={}", values));
        } else {
            for key in &query.keys {
                filters.push(format!("Name=tag:{},Values={}", key, values));
            }
        }
    }
    if !query.states.is_empty() {
        let states: Vec<&str> = query.states.iter().map(|s| s.as_str()).collect();
        filters.push(format!("Name=instance-state-name,Values={}", states.join(",")));
    }
    filters
}

fn with_filters(cmd: &mut Command, query: &TagQuery) {
    let filters = filters(query);
    if !filters.is_empty() {
        cmd.arg("--filters").args(filters);
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AwsTag {
    key: String,
    value: String,
}

fn tags(raw: Vec<AwsTag>) -> Tags {
    raw.into_iter().map(|t| (t.key, t.value)).collect()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AwsState {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AwsEbs {
    volume_id: String,
    #[serde(default)]
    delete_on_termination: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AwsMapping {
    device_name: String,
    ebs: Option<AwsEbs>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AwsInstance {
    instance_id: String,
    state: AwsState,
    #[serde(default)]
    instance_lifecycle: Option<String>,
    #[serde(default)]
    image_id: String,
    #[serde(default)]
    instance_type: String,
    private_ip_address: Option<String>,
    public_ip_address: Option<String>,
    subnet_id: Option<String>,
    #[serde(default)]
    block_device_mappings: Vec<AwsMapping>,
    #[serde(default)]
    tags: Vec<AwsTag>,
}

impl From<AwsInstance> for ServerRecord {
    fn from(i: AwsInstance) -> Self {
        ServerRecord {
            id: i.instance_id,
            state: InstanceState::parse(&i.state.name).unwrap_or(InstanceState::Pending),
            lifecycle: match i.instance_lifecycle.as_deref() {
                Some("spot") => Lifecycle::Spot,
                _ => Lifecycle::OnDemand,
            },
            image_id: i.image_id,
            instance_type: i.instance_type,
            private_ip: i.private_ip_address,
            public_ip: i.public_ip_address,
            subnet_id: i.subnet_id,
            block_devices: i
                .block_device_mappings
                .into_iter()
                .filter_map(|m| {
                    m.ebs.map(|ebs| BlockDevice {
                        device: m.device_name,
                        volume_id: ebs.volume_id,
                        delete_on_termination: ebs.delete_on_termination,
                    })
                })
                .collect(),
            tags: tags(i.tags),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reservation {
    #[serde(default)]
    instances: Vec<AwsInstance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstances {
    #[serde(default)]
    reservations: Vec<Reservation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RunInstances {
    instances: Vec<AwsInstance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AwsAttachment {
    instance_id: String,
    device: String,
    #[serde(default)]
    delete_on_termination: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AwsVolume {
    volume_id: String,
    state: String,
    size: u32,
    availability_zone: String,
    snapshot_id: Option<String>,
    #[serde(default)]
    attachments: Vec<AwsAttachment>,
    #[serde(default)]
    tags: Vec<AwsTag>,
}

impl From<AwsVolume> for VolumeRecord {
    fn from(v: AwsVolume) -> Self {
        let attachment = v.attachments.into_iter().next();
        VolumeRecord {
            id: v.volume_id,
            state: VolumeState::parse(&v.state).unwrap_or(VolumeState::Error),
            size: v.size,
            availability_zone: v.availability_zone,
            snapshot_id: v.snapshot_id.filter(|s| !s.is_empty()),
            delete_on_termination: attachment.as_ref().is_some_and(|a| a.delete_on_termination),
            attached_to: attachment.as_ref().map(|a| a.instance_id.clone()),
            attached_device: attachment.map(|a| a.device),
            tags: tags(v.tags),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeVolumes {
    volumes: Vec<AwsVolume>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AwsSnapshot {
    snapshot_id: String,
    #[serde(default)]
    volume_id: String,
    volume_size: u32,
    #[serde(default)]
    progress: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    tags: Vec<AwsTag>,
}

impl From<AwsSnapshot> for SnapshotRecord {
    fn from(s: AwsSnapshot) -> Self {
        SnapshotRecord {
            id: s.snapshot_id,
            volume_id: s.volume_id,
            volume_size: s.volume_size,
            progress: s.progress.trim_end_matches('%').parse().unwrap_or(0),
            description: s.description,
            tags: tags(s.tags),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeSnapshots {
    snapshots: Vec<AwsSnapshot>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AwsImage {
    image_id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    tags: Vec<AwsTag>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeImages {
    images: Vec<AwsImage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AwsSubnet {
    subnet_id: String,
    cidr_block: String,
    availability_zone: Option<String>,
    #[serde(default)]
    tags: Vec<AwsTag>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeSubnets {
    subnets: Vec<AwsSubnet>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AwsSpotRequest {
    spot_instance_request_id: String,
    state: String,
    instance_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SpotRequests {
    spot_instance_requests: Vec<AwsSpotRequest>,
}

fn spot_state(s: &str) -> SpotState {
    match s {
        "open" => SpotState::Open,
        "active" => SpotState::Active,
        "closed" => SpotState::Closed,
        "cancelled" => SpotState::Cancelled,
        _ => SpotState::Failed,
    }
}

fn launch_json(spec: &LaunchSpec) -> Value {
    let mut launch = json!({
        "ImageId": spec.image_id,
        "InstanceType": spec.instance_type,
        "EbsOptimized": spec.ebs_optimized,
    });
    if let Some(subnet) = &spec.subnet_id {
        launch["SubnetId"] = json!(subnet);
    }
    if !spec.security_groups.is_empty() {
        launch["SecurityGroupIds"] = json!(spec.security_groups);
    }
    if let Some(key) = &spec.key_name {
        launch["KeyName"] = json!(key);
    }
    if let Some(az) = &spec.availability_zone {
        launch["Placement"] = json!({"AvailabilityZone": az});
    }
    if !spec.ephemeral_devices.is_empty() {
        launch["BlockDeviceMappings"] = block_mappings(spec);
    }
    launch
}

fn block_mappings(spec: &LaunchSpec) -> Value {
    Value::Array(
        spec.ephemeral_devices
            .iter()
            .map(|(device, virtual_name)| json!({"DeviceName": device, "VirtualName": virtual_name}))
            .collect(),
    )
}

fn tag_json(tags: &Tags) -> String {
    let list: Vec<Value> = tags
        .iter()
        .map(|(k, v)| json!({"Key": k, "Value": v}))
        .collect();
    Value::Array(list).to_string()
}

#[async_trait]
impl CloudProvider for AwsCliProvider {
    async fn describe_servers(&self, query: &TagQuery) -> Result<Vec<ServerRecord>> {
        let mut cmd = self.command("describe-instances");
        with_filters(&mut cmd, query);
        let found: DescribeInstances = self.query("describe-instances", &cmd).await?;
        Ok(found
            .reservations
            .into_iter()
            .flat_map(|r| r.instances)
            .map(ServerRecord::from)
            .collect())
    }

    async fn get_server(&self, id: &str) -> Result<Option<ServerRecord>> {
        let mut cmd = self.command("describe-instances");
        cmd.arg("--instance-ids").arg(id);
        let found: DescribeInstances = self.query("describe-instances", &cmd).await?;
        Ok(found
            .reservations
            .into_iter()
            .flat_map(|r| r.instances)
            .map(ServerRecord::from)
            .next())
    }

    async fn run_instances(&self, spec: &LaunchSpec) -> Result<Vec<String>> {
        let mut cmd = self.command("run-instances");
        cmd.arg("--image-id")
            .arg(&spec.image_id)
            .arg("--instance-type")
            .arg(&spec.instance_type)
            .arg("--count")
            .arg(spec.count.to_string())
            .arg("--client-token")
            .arg(&spec.client_token);
        if let Some(subnet) = &spec.subnet_id {
            cmd.arg("--subnet-id").arg(subnet);
        }
        if !spec.security_groups.is_empty() {
            cmd.arg("--security-group-ids").args(&spec.security_groups);
        }
        if let Some(key) = &spec.key_name {
            cmd.arg("--key-name").arg(key);
        }
        if let Some(user_data) = &spec.user_data {
            cmd.arg("--user-data").arg(user_data);
        }
        if spec.ebs_optimized {
            cmd.arg("--ebs-optimized");
        }
        if let Some(ip) = &spec.private_ip {
            cmd.arg("--private-ip-address").arg(ip);
        }
        if let Some(az) = &spec.availability_zone {
            cmd.arg("--placement").arg(format!("AvailabilityZone={}", az));
        }
        if !spec.ephemeral_devices.is_empty() {
            cmd.arg("--block-device-mappings").arg(block_mappings(spec).to_string());
        }
        let launched: RunInstances = self.query("run-instances", &cmd).await?;
        Ok(launched.instances.into_iter().map(|i| i.instance_id).collect())
    }

    async fn request_spot_instances(&self, spec: &LaunchSpec, price: &str) -> Result<Vec<String>> {
        let mut launch = launch_json(spec);
        if let Some(user_data) = &spec.user_data {
            launch["UserData"] = json!(user_data);
        }
        let mut cmd = self.command("request-spot-instances");
        cmd.arg("--spot-price")
            .arg(price)
            .arg("--instance-count")
            .arg(spec.count.to_string())
            .arg("--client-token")
            .arg(&spec.client_token)
            .arg("--launch-specification")
            .arg(launch.to_string());
        if let Some(group) = &spec.launch_group {
            cmd.arg("--launch-group").arg(group);
        }
        let requests: SpotRequests = self.query("request-spot-instances", &cmd).await?;
        Ok(requests
            .spot_instance_requests
            .into_iter()
            .map(|r| r.spot_instance_request_id)
            .collect())
    }

    async fn describe_spot_requests(&self, ids: &[String]) -> Result<Vec<SpotRequestRecord>> {
        let mut cmd = self.command("describe-spot-instance-requests");
        cmd.arg("--spot-instance-request-ids").args(ids);
        let requests: SpotRequests = self.query("describe-spot-instance-requests", &cmd).await?;
        Ok(requests
            .spot_instance_requests
            .into_iter()
            .map(|r| SpotRequestRecord {
                state: spot_state(&r.state),
                id: r.spot_instance_request_id,
                instance_id: r.instance_id,
            })
            .collect())
    }

    async fn cancel_spot_requests(&self, ids: &[String]) -> Result<()> {
        let mut cmd = self.command("cancel-spot-instance-requests");
        cmd.arg("--spot-instance-request-ids").args(ids);
        self.exec("cancel-spot-instance-requests", &cmd).await?;
        Ok(())
    }

    async fn start_instances(&self, ids: &[String]) -> Result<()> {
        let mut cmd = self.command("start-instances");
        cmd.arg("--instance-ids").args(ids);
        self.exec("start-instances", &cmd).await?;
        Ok(())
    }

    async fn stop_instances(&self, ids: &[String]) -> Result<()> {
        let mut cmd = self.command("stop-instances");
        cmd.arg("--instance-ids").args(ids);
        self.exec("stop-instances", &cmd).await?;
        Ok(())
    }

    async fn reboot_instances(&self, ids: &[String]) -> Result<()> {
        let mut cmd = self.command("reboot-instances");
        cmd.arg("--instance-ids").args(ids);
        self.exec("reboot-instances", &cmd).await?;
        Ok(())
    }

    async fn terminate_instances(&self, ids: &[String]) -> Result<()> {
        let mut cmd = self.command("terminate-instances");
        cmd.arg("--instance-ids").args(ids);
        self.exec("terminate-instances", &cmd).await?;
        Ok(())
    }

    async fn instance_store_volumes(&self, instance_type: &str) -> Result<u32> {
        let mut cmd = self.command("describe-instance-types");
        cmd.arg("--instance-types").arg(instance_type);
        let value = self.exec("describe-instance-types", &cmd).await?;
        let count = value
            .pointer("/InstanceTypes/0/InstanceStorageInfo/Disks")
            .and_then(Value::as_array)
            .map(|disks| {
                disks
                    .iter()
                    .filter_map(|d| d.get("Count").and_then(Value::as_u64))
                    .sum::<u64>()
            })
            .unwrap_or(0);
        Ok(count as u32)
    }

    async fn create_volume(&self, spec: &NewVolume) -> Result<VolumeRecord> {
        let mut cmd = self.command("create-volume");
        cmd.arg("--availability-zone").arg(&spec.availability_zone);
        if let Some(size) = spec.size {
            cmd.arg("--size").arg(size.to_string());
        }
        if let Some(snapshot) = &spec.snapshot_id {
            cmd.arg("--snapshot-id").arg(snapshot);
        }
        if let Some(kind) = &spec.volume_type {
            cmd.arg("--volume-type").arg(kind);
        }
        if let Some(iops) = spec.iops {
            cmd.arg("--iops").arg(iops.to_string());
        }
        let volume: AwsVolume = self.query("create-volume", &cmd).await?;
        Ok(volume.into())
    }

    async fn get_volume(&self, id: &str) -> Result<Option<VolumeRecord>> {
        let mut cmd = self.command("describe-volumes");
        cmd.arg("--volume-ids").arg(id);
        match self.query::<DescribeVolumes>("describe-volumes", &cmd).await {
            Ok(found) => Ok(found.volumes.into_iter().map(VolumeRecord::from).next()),
            Err(Error::Provider { message, .. }) if message.contains("InvalidVolume.NotFound") => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn describe_volumes(&self, query: &TagQuery) -> Result<Vec<VolumeRecord>> {
        let mut cmd = self.command("describe-volumes");
        with_filters(&mut cmd, query);
        let found: DescribeVolumes = self.query("describe-volumes", &cmd).await?;
        Ok(found.volumes.into_iter().map(VolumeRecord::from).collect())
    }

    async fn attach_volume(&self, instance_id: &str, volume_id: &str, device: &str) -> Result<()> {
        let mut cmd = self.command("attach-volume");
        cmd.arg("--instance-id")
            .arg(instance_id)
            .arg("--volume-id")
            .arg(volume_id)
            .arg("--device")
            .arg(device);
        self.exec("attach-volume", &cmd).await?;
        Ok(())
    }

    async fn detach_volume(&self, volume_id: &str, force: bool) -> Result<()> {
        let mut cmd = self.command("detach-volume");
        cmd.arg("--volume-id").arg(volume_id);
        if force {
            cmd.arg("--force");
        }
        self.exec("detach-volume", &cmd).await?;
        Ok(())
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<()> {
        let mut cmd = self.command("delete-volume");
        cmd.arg("--volume-id").arg(volume_id);
        self.exec("delete-volume", &cmd).await?;
        Ok(())
    }

    async fn set_delete_on_termination(&self, instance_id: &str, device: &str) -> Result<()> {
        let mapping = json!([{"DeviceName": device, "Ebs": {"DeleteOnTermination": true}}]);
        let mut cmd = self.command("modify-instance-attribute");
        cmd.arg("--instance-id")
            .arg(instance_id)
            .arg("--block-device-mappings")
            .arg(mapping.to_string());
        self.exec("modify-instance-attribute", &cmd).await?;
        Ok(())
    }

    async fn create_snapshot(&self, volume_id: &str, description: &str) -> Result<String> {
        let mut cmd = self.command("create-snapshot");
        cmd.arg("--volume-id")
            .arg(volume_id)
            .arg("--description")
            .arg(description);
        let snapshot: AwsSnapshot = self.query("create-snapshot", &cmd).await?;
        Ok(snapshot.snapshot_id)
    }

    async fn describe_snapshots(&self, query: &TagQuery) -> Result<Vec<SnapshotRecord>> {
        let mut cmd = self.command("describe-snapshots");
        cmd.arg("--owner-ids").arg("self");
        with_filters(&mut cmd, query);
        let found: DescribeSnapshots = self.query("describe-snapshots", &cmd).await?;
        Ok(found.snapshots.into_iter().map(SnapshotRecord::from).collect())
    }

    async fn describe_images(&self, query: &TagQuery) -> Result<Vec<ImageRecord>> {
        let mut cmd = self.command("describe-images");
        cmd.arg("--owners").arg("self");
        with_filters(&mut cmd, query);
        let found: DescribeImages = self.query("describe-images", &cmd).await?;
        Ok(found
            .images
            .into_iter()
            .map(|i| ImageRecord {
                id: i.image_id,
                name: i.name,
                tags: tags(i.tags),
            })
            .collect())
    }

    async fn get_image(&self, id: &str) -> Result<Option<ImageRecord>> {
        let mut cmd = self.command("describe-images");
        cmd.arg("--image-ids").arg(id);
        let found: DescribeImages = self.query("describe-images", &cmd).await?;
        Ok(found.images.into_iter().next().map(|i| ImageRecord {
            id: i.image_id,
            name: i.name,
            tags: tags(i.tags),
        }))
    }

    async fn describe_subnets(&self, query: &TagQuery) -> Result<Vec<SubnetRecord>> {
        let mut cmd = self.command("describe-subnets");
        with_filters(&mut cmd, query);
        let found: DescribeSubnets = self.query("describe-subnets", &cmd).await?;
        Ok(found
            .subnets
            .into_iter()
            .map(|s| SubnetRecord {
                id: s.subnet_id,
                cidr_block: s.cidr_block,
                availability_zone: s.availability_zone,
                tags: tags(s.tags),
            })
            .collect())
    }

    async fn associate_new_address(&self, instance_id: &str) -> Result<String> {
        let mut cmd = self.command("allocate-address");
        cmd.arg("--domain").arg("vpc");
        let allocated = self.exec("allocate-address", &cmd).await?;
        let (Some(allocation), Some(ip)) = (
            allocated.get("AllocationId").and_then(Value::as_str),
            allocated.get("PublicIp").and_then(Value::as_str),
        ) else {
            return Err(Error::provider("allocate-address", "no address in response", false));
        };

        let mut cmd = self.command("associate-address");
        cmd.arg("--instance-id")
            .arg(instance_id)
            .arg("--allocation-id")
            .arg(allocation);
        self.exec("associate-address", &cmd).await?;
        Ok(ip.to_string())
    }

    async fn create_tags(&self, resource_id: &str, tags: &Tags) -> Result<()> {
        let mut cmd = self.command("create-tags");
        cmd.arg("--resources")
            .arg(resource_id)
            .arg("--tags")
            .arg(tag_json(tags));
        self.exec("create-tags", &cmd).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filters() {
        let query = TagQuery::value("ame1.dev:ms*").in_states(&[InstanceState::Running]);
        assert_eq!(
            filters(&query),
            vec![
                "Name=tag-value,Values=ame1.dev:ms*".to_string(),
                "Name=instance-state-name,Values=running".to_string(),
            ]
        );
        assert_eq!(
            filters(&TagQuery::key_value("fqdn", "a.b")),
            vec!["Name=tag:fqdn,Values=a.b".to_string()]
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(is_transient(
            "An error occurred (RequestLimitExceeded) when calling the DescribeInstances operation"
        ));
        assert!(!is_transient("An error occurred (InvalidParameterValue)"));
    }

    #[test]
    fn test_instance_parsing() {
        let raw = json!({
            "Reservations": [{"Instances": [{
                "InstanceId": "i-1",
                "State": {"Name": "running"},
                "InstanceLifecycle": "spot",
                "ImageId": "ami-1",
                "InstanceType": "m5.large",
                "PrivateIpAddress": "10.0.0.5",
                "BlockDeviceMappings": [
                    {"DeviceName": "/dev/sdf", "Ebs": {"VolumeId": "vol-1", "DeleteOnTermination": false}}
                ],
                "Tags": [{"Key": "fqdn", "Value": "ms101.dev.ame1.example.com"}]
            }]}]
        });
        let parsed: DescribeInstances = serde_json::from_value(raw).unwrap();
        let server: ServerRecord = parsed.reservations.into_iter().next().unwrap().instances.into_iter().next().unwrap().into();
        assert_eq!(server.lifecycle, Lifecycle::Spot);
        assert_eq!(server.state, InstanceState::Running);
        assert_eq!(server.fqdn(), "ms101.dev.ame1.example.com");
        assert_eq!(server.block_devices[0].volume_id, "vol-1");
    }

    #[test]
    fn test_snapshot_progress_parsing() {
        let raw = json!({"SnapshotId": "snap-1", "VolumeSize": 100, "Progress": "42%"});
        let snapshot: SnapshotRecord = serde_json::from_value::<AwsSnapshot>(raw).unwrap().into();
        assert_eq!(snapshot.progress, 42);
    }
}
