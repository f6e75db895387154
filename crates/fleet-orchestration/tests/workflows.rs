//! Workflow tests against the in-memory provider

use fleet_config::{ConfigResolver, OverrideSet, Selection, parser};
use fleet_mixins::{MixinRegistry, Renderer};
use fleet_orchestration::{
    CreateOptions, Error, ErrorClass, Orchestrator, RecordingConfigManagement, RestoreOptions,
    RestoreTarget, RetryPolicy, ScriptedConfirm, VolumeCreateOptions, VolumeDeleteOptions,
    WaitPolicy,
    provider::{
        CloudProvider, InstanceState, Lifecycle, MockProvider, ServerRecord, SnapshotRecord,
        SubnetRecord, Tags, VolumeRecord, VolumeState,
    },
    workflows::create::CREATE_REQUIRED_MIXINS,
};
use remote_shell::RecordingShell;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const INVENTORY: &str = r#"
organizations:
  acme:
    domain: example.com
regions:
  us-east-1:
    networks:
      ame1:
        mixins:
          ami: { base: ami-base }
        subnets:
          dev:
            availability_zone: us-east-1a
stacks:
  cluster:
    profiles:
      ms: { count: 2 }
      web:
profiles:
  ms:
    hostname: "ms1%02d"
    instance_type: m3.large
    count: 3
    run_list: ["role[mongo]"]
    mixins:
      volume:
        ebs:
          sdf: { mount: /data, size: 50 }
  web:
    hostname: "web%02d"
    instance_type: t3.small
"#;

struct Harness {
    provider: Arc<MockProvider>,
    shell: Arc<RecordingShell>,
    cm: Arc<RecordingConfigManagement>,
    confirm: Arc<ScriptedConfirm>,
    scripts: TempDir,
    resolver: ConfigResolver,
}

impl Harness {
    fn new(answers: &[bool]) -> Self {
        let provider = Arc::new(MockProvider::new());
        provider.add_subnet(SubnetRecord {
            id: "subnet-1".into(),
            cidr_block: "10.0.0.0/16".into(),
            availability_zone: Some("us-east-1a".into()),
            tags: Tags::from([("Name".to_string(), "ame1.dev".to_string())]),
        });
        let tree = parser::parse_str(INVENTORY).unwrap();
        Self {
            provider,
            shell: Arc::new(RecordingShell::new("ubuntu")),
            cm: Arc::new(RecordingConfigManagement::new()),
            confirm: Arc::new(ScriptedConfirm::new(answers.iter().copied())),
            scripts: TempDir::new().unwrap(),
            resolver: ConfigResolver::new(&tree, &OverrideSet::new()).unwrap(),
        }
    }

    fn orchestrator(&self, checkpoint: Option<usize>) -> Orchestrator {
        Orchestrator::new(
            self.provider.clone(),
            self.shell.clone(),
            self.cm.clone(),
            MixinRegistry::with_builtins().unwrap(),
            Renderer::new(self.scripts.path()),
        )
        .with_confirm(self.confirm.clone())
        .with_checkpoint(checkpoint)
        .with_retry_policy(RetryPolicy::standard().immediate())
        .with_wait_policy(WaitPolicy::new(Duration::ZERO, Duration::from_secs(5)))
    }

    fn selection(&self) -> Selection {
        Selection::parse_target("ame1.dev").unwrap()
    }

    fn params(&self) -> fleet_config::RunParams {
        self.resolver.resolve(&self.selection(), &[]).unwrap().params
    }

    /// A running server `hostname` with a durable volume per device
    fn seed_server(&self, id: &str, hostname: &str, profile: &str, lifecycle: Lifecycle, devices: &[&str]) {
        let fqdn = fqdn(hostname);
        self.provider.add_server(ServerRecord {
            id: id.into(),
            state: InstanceState::Running,
            lifecycle,
            image_id: "ami-old".into(),
            instance_type: "m3.large".into(),
            private_ip: Some("10.0.1.5".into()),
            public_ip: None,
            subnet_id: Some("subnet-1".into()),
            block_devices: Vec::new(),
            tags: Tags::from([
                ("Name".to_string(), format!("ame1.dev:{}", hostname)),
                ("fqdn".to_string(), fqdn.clone()),
                ("hosttype".to_string(), profile.to_string()),
            ]),
        });
        for device in devices {
            self.provider.add_volume(VolumeRecord {
                id: old_volume(id, device),
                state: VolumeState::InUse,
                size: 50,
                availability_zone: "us-east-1a".into(),
                snapshot_id: None,
                attached_to: Some(id.into()),
                attached_device: Some(device.to_string()),
                delete_on_termination: false,
                tags: Tags::from([
                    ("Name".to_string(), fqdn.clone()),
                    ("device".to_string(), device.to_string()),
                ]),
            });
        }
    }

    fn seed_snapshot(&self, id: &str, hostname: &str, device: &str, created: i64) {
        self.provider.add_snapshot(SnapshotRecord {
            id: id.into(),
            volume_id: "vol-gone".into(),
            volume_size: 50,
            progress: 100,
            description: String::new(),
            tags: Tags::from([
                ("Name".to_string(), fqdn(hostname)),
                ("created".to_string(), created.to_string()),
                ("device".to_string(), device.to_string()),
                ("version".to_string(), "abcde".to_string()),
            ]),
        });
    }

    /// Volume attached to a server as `device`, settling transitions first
    async fn attached(&self, server_id: &str, device: &str) -> Option<VolumeRecord> {
        let server = self.provider.get_server(server_id).await.unwrap()?;
        let mapping = server.block_devices.iter().find(|b| b.device == device)?;
        self.provider.get_volume(&mapping.volume_id).await.unwrap()
    }
}

fn fqdn(hostname: &str) -> String {
    format!("{}.dev.ame1.example.com", hostname)
}

fn old_volume(server_id: &str, device: &str) -> String {
    format!("vol-{}{}", server_id, device.replace('/', "-"))
}

#[smol_potat::test]
async fn test_create_runs_every_phase() {
    let h = Harness::new(&[]);
    let config = h
        .resolver
        .resolve(&h.selection().with_profile("ms"), CREATE_REQUIRED_MIXINS)
        .unwrap();
    let created = h
        .orchestrator(None)
        .create_servers(&config, &CreateOptions::default())
        .await
        .unwrap();

    let names: Vec<&str> = created.iter().map(|a| a.fqdn.as_str()).collect();
    assert_eq!(
        names,
        vec![fqdn("ms101"), fqdn("ms102"), fqdn("ms103")]
    );
    for association in &created {
        let server = h.provider.get_server(association.id()).await.unwrap().unwrap();
        assert_eq!(server.state, InstanceState::Running);
        assert_eq!(server.image_id, "ami-base");
        assert_eq!(server.tag("Name"), Some(format!("ame1.dev:{}", association.hostname).as_str()));
        assert_eq!(server.tag("hosttype"), Some("ms"));

        let data = h.attached(association.id(), "/dev/sdf").await.unwrap();
        assert_eq!(data.size, 50);
        assert_eq!(data.tag("Name"), Some(association.fqdn.as_str()));
        assert_eq!(data.tag("device"), Some("/dev/sdf"));

        assert!(!h.shell.commands_for(association.id()).is_empty());
    }
    assert!(h.cm.is_known("ms101.dev"));
    assert!(h.cm.calls().contains(&"bootstrap ms103.dev".to_string()));
}

#[smol_potat::test]
async fn test_create_stops_at_checkpoint() {
    let h = Harness::new(&[]);
    let config = h
        .resolver
        .resolve(&h.selection().with_profile("ms"), CREATE_REQUIRED_MIXINS)
        .unwrap();
    let err = h
        .orchestrator(Some(3))
        .create_servers(&config, &CreateOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Checkpoint { index: 3, .. }));
    assert_eq!(h.provider.servers().len(), 3);
    assert_eq!(h.provider.call_count("create-tags"), 0);
    assert!(h.cm.calls().iter().all(|c| !c.starts_with("bootstrap")));
}

#[smol_potat::test]
async fn test_stack_create_uses_stack_counts() {
    let h = Harness::new(&[]);
    let created = h
        .orchestrator(None)
        .create_stack(&h.resolver, &h.selection().with_stack("cluster"), &CreateOptions::default())
        .await
        .unwrap();

    let mut names: Vec<String> = created.into_iter().map(|a| a.hostname).collect();
    names.sort();
    assert_eq!(names, vec!["ms101", "ms102", "web01"]);
}

#[smol_potat::test]
async fn test_restore_picks_newest_epoch() {
    let h = Harness::new(&[]);
    h.seed_server("i-a", "ms101", "ms", Lifecycle::OnDemand, &["/dev/sdf", "/dev/sdg"]);
    h.seed_snapshot("snap-1", "ms101", "/dev/sdf", 100);
    h.seed_snapshot("snap-2", "ms101", "/dev/sdf", 200);
    h.seed_snapshot("snap-3", "ms101", "/dev/sdf", 300);
    h.seed_snapshot("snap-4", "ms101", "/dev/sdg", 300);

    let options = RestoreOptions::new(RestoreTarget::Hosts("ms101".into()));
    let report = h
        .orchestrator(None)
        .restore(&h.resolver, &h.selection(), &options)
        .await
        .unwrap();
    assert_eq!(report.restored, vec![fqdn("ms101")]);

    let sdf = h.attached("i-a", "/dev/sdf").await.unwrap();
    let sdg = h.attached("i-a", "/dev/sdg").await.unwrap();
    assert_eq!(sdf.snapshot_id.as_deref(), Some("snap-3"));
    assert_eq!(sdg.snapshot_id.as_deref(), Some("snap-4"));
    assert_eq!(sdf.tag("created"), Some("300"));
    assert_eq!(sdf.tag("vol_from_snapshot"), Some("dev"));
    assert_eq!(sdf.tag("bs-owner"), Some(fqdn("ms101").as_str()));

    let old = h.provider.get_volume(&old_volume("i-a", "/dev/sdf")).await.unwrap().unwrap();
    assert_eq!(old.state, VolumeState::Available);
    assert_eq!(old.tag("Name"), Some(format!("{}-old", fqdn("ms101")).as_str()));
    assert_eq!(
        h.provider.get_server("i-a").await.unwrap().unwrap().state,
        InstanceState::Running
    );
}

#[smol_potat::test]
async fn test_restore_checkpoint_leaves_new_volumes_untouched() {
    let h = Harness::new(&[]);
    h.seed_server("i-a", "ms101", "ms", Lifecycle::OnDemand, &["/dev/sdf"]);
    h.seed_snapshot("snap-1", "ms101", "/dev/sdf", 100);

    let options = RestoreOptions::new(RestoreTarget::Hosts("ms".into()));
    let err = h
        .orchestrator(Some(3))
        .restore(&h.resolver, &h.selection(), &options)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Checkpoint { index: 3, .. }));

    assert_eq!(h.provider.call_count("create-tags"), 0);
    assert_eq!(h.provider.call_count("attach-volume"), 0);
    assert_eq!(h.provider.call_count("stop-instances"), 0);
    let restored: Vec<VolumeRecord> = h
        .provider
        .volumes()
        .into_iter()
        .filter(|v| v.snapshot_id.as_deref() == Some("snap-1"))
        .collect();
    assert_eq!(restored.len(), 1);
    assert!(restored[0].tags.is_empty());
    assert!(restored[0].attached_to.is_none());
}

#[smol_potat::test]
async fn test_tag_failure_drops_only_that_server() {
    let h = Harness::new(&[]);
    for (id, host) in [("i-a", "ms101"), ("i-b", "ms102"), ("i-c", "ms103")] {
        h.seed_server(id, host, "ms", Lifecycle::OnDemand, &["/dev/sdf"]);
        h.seed_snapshot(&format!("snap-{}", host), host, "/dev/sdf", 100);
    }
    h.provider.fail_tags_for(old_volume("i-b", "/dev/sdf"));

    let orchestrator = h.orchestrator(None);
    let options = RestoreOptions::new(RestoreTarget::Hosts("ms".into()));
    let report = orchestrator
        .restore(&h.resolver, &h.selection(), &options)
        .await
        .unwrap();

    assert_eq!(report.restored, vec![fqdn("ms101"), fqdn("ms103")]);
    let failures = orchestrator.summary().failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].resource, fqdn("ms102"));
    assert_eq!(failures[0].phase.as_deref(), Some("rename-old"));

    // B was never stopped and keeps its original volume
    let b = h.provider.get_server("i-b").await.unwrap().unwrap();
    assert_eq!(b.state, InstanceState::Running);
    assert_eq!(
        h.attached("i-b", "/dev/sdf").await.unwrap().id,
        old_volume("i-b", "/dev/sdf")
    );
    assert!(h.attached("i-a", "/dev/sdf").await.unwrap().snapshot_id.is_some());

    // The volume restored for B would otherwise be found by its fqdn
    assert!(
        h.provider
            .volumes()
            .iter()
            .all(|v| v.snapshot_id.as_deref() != Some("snap-ms102"))
    );
    let named_b: Vec<String> = h
        .provider
        .volumes()
        .into_iter()
        .filter(|v| v.tag("Name") == Some(fqdn("ms102").as_str()))
        .map(|v| v.id)
        .collect();
    assert!(named_b.is_empty(), "unexpected volumes named after ms102: {:?}", named_b);
}

#[smol_potat::test]
async fn test_unreachable_server_is_destroyed_with_its_volumes() {
    let h = Harness::new(&[]);
    // first launched server, ms101
    h.shell.set_unreachable("10.0.0.10");
    let config = h
        .resolver
        .resolve(&h.selection().with_profile("ms"), CREATE_REQUIRED_MIXINS)
        .unwrap();
    let orchestrator = h.orchestrator(None);
    let created = orchestrator
        .create_servers(&config, &CreateOptions::default())
        .await
        .unwrap();

    let names: Vec<&str> = created.iter().map(|a| a.hostname.as_str()).collect();
    assert_eq!(names, vec!["ms102", "ms103"]);
    let failures = orchestrator.summary().failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].phase.as_deref(), Some("reachable"));

    let dropped = h
        .provider
        .servers()
        .into_iter()
        .find(|s| s.tag("fqdn") == Some(fqdn("ms101").as_str()))
        .unwrap();
    assert_eq!(dropped.state, InstanceState::Terminated);
    for volume in h.provider.volumes() {
        assert_ne!(volume.tag("Name"), Some(fqdn("ms101").as_str()), "{} left behind", volume.id);
    }
    for association in &created {
        let data = h.attached(association.id(), "/dev/sdf").await.unwrap();
        assert_eq!(data.tag("Name"), Some(association.fqdn.as_str()));
    }
}

#[smol_potat::test]
async fn test_restore_recreates_spot_servers() {
    let h = Harness::new(&[true]);
    h.seed_server("i-spot", "web01", "web", Lifecycle::Spot, &["/dev/sdf"]);
    h.seed_snapshot("snap-web", "web01", "/dev/sdf", 100);

    let mut options = RestoreOptions::new(RestoreTarget::Hosts("web".into()));
    options.matching = true;
    options.delete_old = true;
    let report = h
        .orchestrator(None)
        .restore(&h.resolver, &h.selection(), &options)
        .await
        .unwrap();

    assert!(report.restored.is_empty());
    assert_eq!(report.recreated, vec![fqdn("web01")]);
    assert_eq!(report.deleted, vec![old_volume("i-spot", "/dev/sdf")]);
    assert_eq!(h.confirm.prompts(), vec!["Delete 1 old volume(s)"]);
    assert_eq!(
        h.provider.get_server("i-spot").await.unwrap().unwrap().state,
        InstanceState::Terminated
    );

    let replacement = h
        .provider
        .servers()
        .into_iter()
        .find(|s| s.id != "i-spot")
        .unwrap();
    assert_eq!(replacement.image_id, "ami-old");
    let data = h.attached(&replacement.id, "/dev/sdf").await.unwrap();
    assert_eq!(data.snapshot_id.as_deref(), Some("snap-web"));
}

#[smol_potat::test]
async fn test_snapshot_tags_one_epoch() {
    let h = Harness::new(&[]);
    h.seed_server("i-a", "ms101", "ms", Lifecycle::OnDemand, &["/dev/sdf"]);
    h.seed_server("i-b", "ms102", "ms", Lifecycle::OnDemand, &["/dev/sdf", "/dev/sdg"]);

    let orchestrator = h.orchestrator(None);
    let params = h.params();
    let report = orchestrator.snapshot(&params, Some("ms")).await.unwrap();
    assert_eq!(report.snapshots.len(), 3);
    assert_eq!(report.version.len(), 5);

    for snapshot in h.provider.snapshots() {
        assert_eq!(snapshot.created(), Some(report.created));
        assert_eq!(snapshot.tag("version"), Some(report.version.as_str()));
        assert_eq!(snapshot.tag("cluster_size"), Some("2"));
        assert!(snapshot.tag("device").is_some());
    }

    let progress = orchestrator.snapshot_progress(&params, Some("ms")).await.unwrap();
    assert_eq!(progress.snapshots, 3);
    assert_eq!(progress.percent, 100);
}

#[smol_potat::test]
async fn test_retagging_is_stable() {
    let h = Harness::new(&[]);
    h.seed_server("i-a", "ms101", "ms", Lifecycle::OnDemand, &[]);
    let client = h.orchestrator(None).client().clone();
    let tags = Tags::from([("fqdn".to_string(), fqdn("ms101")), ("subnet".to_string(), "dev".to_string())]);

    client.tag("i-a", &tags).await.unwrap();
    let first = h.provider.server("i-a").unwrap().tags;
    client.tag("i-a", &tags).await.unwrap();
    assert_eq!(h.provider.server("i-a").unwrap().tags, first);
}

#[smol_potat::test]
async fn test_attached_volumes_need_detach() {
    let h = Harness::new(&[true, true]);
    h.seed_server("i-a", "ms101", "ms", Lifecycle::OnDemand, &["/dev/sdf"]);
    let params = h.params();
    let volume = old_volume("i-a", "/dev/sdf");

    let mut options = VolumeDeleteOptions {
        hostname: Some("ms101".into()),
        ..Default::default()
    };
    let err = h.orchestrator(None).delete_volumes(&params, &options).await.unwrap_err();
    assert!(matches!(err, Error::Resource { .. }));
    assert!(h.provider.volume(&volume).is_some());
    assert!(h.confirm.prompts().is_empty());

    options.detach = true;
    let deleted = h.orchestrator(None).delete_volumes(&params, &options).await.unwrap();
    assert_eq!(deleted, vec![volume.clone()]);
    assert!(h.provider.volume(&volume).is_none());
    assert_eq!(h.confirm.prompts().len(), 2);
}

#[smol_potat::test]
async fn test_server_delete_asks_twice() {
    let h = Harness::new(&[true, false]);
    h.seed_server("i-a", "ms101", "ms", Lifecycle::OnDemand, &[]);
    h.seed_server("i-b", "ms102", "ms", Lifecycle::OnDemand, &[]);
    let params = h.params();

    let err = h.orchestrator(None).delete_servers(&params, Some("ms")).await.unwrap_err();
    assert!(matches!(err, Error::Declined(_)));
    assert_eq!(h.provider.call_count("terminate-instances"), 0);
    assert_eq!(
        h.confirm.prompts(),
        vec!["Delete 2 server(s)", "Really terminate 2 server(s)"]
    );
}

#[smol_potat::test]
async fn test_server_delete_deregisters_nodes() {
    let h = Harness::new(&[true, true]);
    h.seed_server("i-a", "ms101", "ms", Lifecycle::OnDemand, &[]);
    h.seed_server("i-b", "ms102", "ms", Lifecycle::OnDemand, &[]);
    h.cm.register("ms101.dev");
    let params = h.params();

    let deleted = h.orchestrator(None).delete_servers(&params, Some("ms")).await.unwrap();
    assert_eq!(deleted, vec![fqdn("ms101"), fqdn("ms102")]);
    assert!(!h.cm.is_known("ms101.dev"));
    assert!(h.cm.calls().contains(&"delete ms102.dev".to_string()));
    for server in h.provider.servers() {
        assert_eq!(server.state, InstanceState::Terminated);
    }
}

#[smol_potat::test]
async fn test_volume_create_formats_and_mounts_next_device() {
    let h = Harness::new(&[]);
    h.seed_server("i-a", "ms101", "ms", Lifecycle::OnDemand, &["/dev/sdf"]);
    let config = h.resolver.resolve(&h.selection().with_profile("ms"), &[]).unwrap();

    let options = VolumeCreateOptions {
        hostname: "ms101".into(),
        size: 20,
        ..Default::default()
    };
    let volume = h.orchestrator(None).create_volume(&config, &options).await.unwrap();
    assert_eq!(volume.size, 20);
    assert_eq!(volume.attached_to.as_deref(), Some("i-a"));
    assert_eq!(volume.attached_device.as_deref(), Some("/dev/sdg"));
    assert_eq!(volume.tag("Name"), Some(fqdn("ms101").as_str()));
    assert_eq!(volume.tag("device"), Some("/dev/sdg"));
    assert!(!volume.delete_on_termination);

    let commands = h.shell.commands_for("i-a");
    assert_eq!(
        commands[..3],
        [
            "sudo mkfs.ext4 -q /dev/xvdg".to_string(),
            "sudo mkdir -p /ebsg".to_string(),
            "sudo mount -t ext4 /dev/xvdg /ebsg".to_string(),
        ]
    );
    assert!(commands[3].contains("/etc/fstab"));
}

#[smol_potat::test]
async fn test_temp_volume_goes_with_the_server() {
    let h = Harness::new(&[]);
    h.seed_server("i-a", "ms101", "ms", Lifecycle::OnDemand, &["/dev/sdf"]);
    let config = h.resolver.resolve(&h.selection().with_profile("ms"), &[]).unwrap();

    let options = VolumeCreateOptions {
        hostname: "ms101".into(),
        size: 10,
        temp: true,
        device: Some("sdh".into()),
        mount: Some("/scratch".into()),
        ..Default::default()
    };
    let volume = h.orchestrator(None).create_volume(&config, &options).await.unwrap();
    let volume = h.provider.volume(&volume.id).unwrap();
    assert!(volume.delete_on_termination);
    assert_eq!(volume.tag("Name"), Some(format!("/dev/sdh-{}", fqdn("ms101")).as_str()));
    assert!(
        h.shell
            .commands_for("i-a")
            .contains(&"sudo mount -t ext4 /dev/xvdh /scratch".to_string())
    );

    h.orchestrator(None).terminate("i-a").await.unwrap();
    assert!(h.provider.volume(&volume.id).is_none());
}

#[smol_potat::test]
async fn test_volume_create_refuses_used_device() {
    let h = Harness::new(&[]);
    h.seed_server("i-a", "ms101", "ms", Lifecycle::OnDemand, &["/dev/sdf"]);
    let config = h.resolver.resolve(&h.selection().with_profile("ms"), &[]).unwrap();

    let options = VolumeCreateOptions {
        hostname: "ms101".into(),
        size: 20,
        device: Some("sdf".into()),
        ..Default::default()
    };
    let err = h.orchestrator(None).create_volume(&config, &options).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::PerResource);
    assert_eq!(h.provider.call_count("create-volume"), 0);

    let missing = VolumeCreateOptions {
        hostname: "ms109".into(),
        size: 20,
        ..Default::default()
    };
    let err = h.orchestrator(None).create_volume(&config, &missing).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[smol_potat::test]
async fn test_unattachable_volume_is_deleted_again() {
    let h = Harness::new(&[]);
    h.seed_server("i-a", "ms101", "ms", Lifecycle::OnDemand, &["/dev/sdf"]);
    h.provider.fail_next("attach-volume", 1, false);
    let config = h.resolver.resolve(&h.selection().with_profile("ms"), &[]).unwrap();

    let options = VolumeCreateOptions {
        hostname: "ms101".into(),
        size: 20,
        ..Default::default()
    };
    assert!(h.orchestrator(None).create_volume(&config, &options).await.is_err());
    assert_eq!(h.provider.call_count("delete-volume"), 1);
    let left: Vec<String> = h.provider.volumes().into_iter().map(|v| v.id).collect();
    assert_eq!(left, vec![old_volume("i-a", "/dev/sdf")]);
    assert!(h.shell.commands_for("i-a").is_empty());
}

#[smol_potat::test]
async fn test_attach_mounts_declared_volumes_without_formatting() {
    let h = Harness::new(&[]);
    h.seed_server("i-a", "ms101", "ms", Lifecycle::OnDemand, &[]);
    h.provider.add_volume(VolumeRecord {
        id: "vol-kept".into(),
        state: VolumeState::Available,
        size: 50,
        availability_zone: "us-east-1a".into(),
        snapshot_id: None,
        attached_to: None,
        attached_device: None,
        delete_on_termination: false,
        tags: Tags::from([
            ("Name".to_string(), fqdn("ms101")),
            ("device".to_string(), "/dev/sdf".to_string()),
        ]),
    });
    let config = h.resolver.resolve(&h.selection().with_profile("ms"), &[]).unwrap();

    let attached = h
        .orchestrator(None)
        .attach_volumes(&config, "ms101", false)
        .await
        .unwrap();
    assert_eq!(attached.len(), 1);
    assert_eq!(h.attached("i-a", "/dev/sdf").await.unwrap().id, "vol-kept");
    let commands = h.shell.commands_for("i-a");
    assert!(commands.contains(&"sudo mount -t ext4 /dev/xvdf /data".to_string()));
    assert!(commands.iter().all(|c| !c.contains("mkfs")));

    let err = h
        .orchestrator(None)
        .attach_volumes(&config, "ms101", false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[smol_potat::test]
async fn test_attach_rejects_undeclared_device() {
    let h = Harness::new(&[]);
    h.seed_server("i-a", "ms101", "ms", Lifecycle::OnDemand, &[]);
    h.provider.add_volume(VolumeRecord {
        id: "vol-stray".into(),
        state: VolumeState::Available,
        size: 50,
        availability_zone: "us-east-1a".into(),
        snapshot_id: None,
        attached_to: None,
        attached_device: None,
        delete_on_termination: false,
        tags: Tags::from([
            ("Name".to_string(), fqdn("ms101")),
            ("device".to_string(), "/dev/sdk".to_string()),
        ]),
    });
    let config = h.resolver.resolve(&h.selection().with_profile("ms"), &[]).unwrap();

    let err = h
        .orchestrator(None)
        .attach_volumes(&config, "ms101", true)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Resource { .. }));
    assert_eq!(h.provider.call_count("attach-volume"), 0);
}

#[smol_potat::test]
async fn test_list_servers_by_prefix() {
    let h = Harness::new(&[]);
    h.seed_server("i-b", "ms102", "ms", Lifecycle::OnDemand, &[]);
    h.seed_server("i-a", "ms101", "ms", Lifecycle::OnDemand, &[]);
    h.seed_server("i-c", "web01", "web", Lifecycle::OnDemand, &[]);
    let scope = [("ame1".to_string(), "dev".to_string())];

    let servers = h.orchestrator(None).list_servers(&scope, Some("ms")).await.unwrap();
    let names: Vec<&str> = servers.iter().map(|s| s.fqdn()).collect();
    assert_eq!(names, vec![fqdn("ms101"), fqdn("ms102")]);

    let all = h.orchestrator(None).list_servers(&scope, None).await.unwrap();
    assert_eq!(all.len(), 3);

    let err = h.orchestrator(None).list_servers(&scope, Some("db")).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Resolution);
}

#[smol_potat::test]
async fn test_show_server_with_volumes() {
    let h = Harness::new(&[]);
    h.seed_server("i-a", "ms101", "ms", Lifecycle::OnDemand, &["/dev/sdf", "/dev/sdg"]);
    let params = h.params();

    let details = h.orchestrator(None).show_server(&params, "ms101").await.unwrap();
    assert_eq!(details.server.id, "i-a");
    let volumes: Vec<&str> = details.volumes.iter().map(|v| v.id.as_str()).collect();
    assert_eq!(
        volumes,
        vec![old_volume("i-a", "/dev/sdf"), old_volume("i-a", "/dev/sdg")]
    );

    let err = h.orchestrator(None).show_server(&params, "ms109").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}
