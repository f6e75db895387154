//! Registry and scheduling tests against a recording remote shell

use fleet_config::{EffectiveConfig, RunParams};
use fleet_mixins::{
    ActionContext, Error, ExecutionPlan, Mixin, MixinRegistry, MixinSource, Renderer,
    ServerContext, Stage,
};
use remote_shell::RecordingShell;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::Path;
use tempfile::TempDir;

fn config(mixins: Value) -> EffectiveConfig {
    let params = RunParams {
        network: "ame1".to_string(),
        subnetwork: Some("dev".to_string()),
        domain: "example.com".to_string(),
        ..RunParams::default()
    };
    let mixins: BTreeMap<String, Value> = serde_json::from_value(mixins).unwrap();
    EffectiveConfig::new(params, mixins)
}

fn server() -> ServerContext {
    ServerContext::new("i-0abc", "ms101", "ms101.dev.ame1.example.com", "10.1.2.3")
}

fn write(dir: &Path, rel: &str, content: &str) {
    let path = dir.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

#[test]
fn test_user_directory_shadows_builtin() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "var/mixin.yaml",
        "files:\n  env.sh:\n    action: install\n    dir: /opt/env\n",
    );
    write(dir.path(), "var/templates/env.sh.hbs", "export SITE={{data.SITE}}\n");
    write(dir.path(), "custom/templates/hello.hbs", "echo hello\n");

    let mut registry = MixinRegistry::with_builtins().unwrap();
    let loaded = registry.load_dir(dir.path()).unwrap();
    assert_eq!(loaded, vec!["custom", "var"]);
    assert_eq!(
        registry.source("var"),
        Some(&MixinSource::Directory(dir.path().join("var")))
    );
    // Shadowing keeps the original slot
    assert_eq!(&registry.names()[..3], &["volume", "var", "hooks"]);

    let var = registry.instantiate("var", json!({"SITE": "lab"})).unwrap();
    assert!(var.core().templates.contains_key("env.sh"));
    assert!(!var.core().templates.contains_key("bs.vars"));
}

#[test]
fn test_all_validation_problems_are_reported() {
    let registry = MixinRegistry::with_builtins().unwrap();
    let config = config(json!({
        "volume": {
            "ebs": {
                "/dev/sdf": {"mount": "/data"},
                "/dev/sdg": {"mount": "/data"}
            }
        },
        "ssh_keys": {"keys": ["garbage"]},
        "hooks": {"before_bootstrap": "not a list"}
    }));

    let Err(Error::Invalid(problems)) = registry.instantiate_all(&config) else {
        panic!("expected validation failure");
    };
    assert_eq!(problems.len(), 3, "{:?}", problems);
    assert!(problems.iter().any(|p| p.starts_with("volume: duplicated mount /data")));
    assert!(problems.iter().any(|p| p.starts_with("ssh_keys: ")));
    assert!(problems.iter().any(|p| p.starts_with("hooks: ")));
}

#[smol_potat::test]
async fn test_stages_execute_in_mixin_order() {
    let scripts = TempDir::new().unwrap();
    let registry = MixinRegistry::with_builtins().unwrap();
    let config = config(json!({
        "hooks": {"before_chef": ["touch /tmp/a"], "after_bootstrap": ["touch /tmp/b"]},
        "var": {"SITE": "lab"},
        "volume": {"ebs": {"/dev/sdf": {"mount": "/data", "size": 100}}},
        "chef": {"env": "dev"}
    }));
    let set = registry.instantiate_all(&config).unwrap();
    assert_eq!(set.names(), vec!["volume", "var", "hooks", "chef"]);

    let plan = ExecutionPlan::new();
    let renderer = Renderer::new(scripts.path());
    let vars = Value::Null;
    let cx = ActionContext {
        plan: &plan,
        renderer: &renderer,
        params: &config.params,
        vars: &vars,
    };
    let target = server();
    let scheduled = set.schedule_all(&cx, &target).unwrap();
    assert_eq!(scheduled, 6);
    assert_eq!(
        plan.pending_templates(Stage::BeforeBootstrap, "i-0abc"),
        vec!["bs-volumes", "bs-ebs-functions", "bs_volume_init", "bs.vars", "before_bootstrap"]
    );

    let vars_file = std::fs::read_to_string(scripts.path().join("i-0abc/bs.vars")).unwrap();
    assert!(vars_file.contains("HOSTNAME=\"ms101\""));
    assert!(vars_file.contains("SITE=\"lab\""));

    let shell = RecordingShell::new("ubuntu");
    let ran = plan.execute(Stage::BeforeBootstrap, &shell, &target).await.unwrap();
    assert_eq!(ran, 5);
    let commands = shell.commands_for("i-0abc");
    assert_eq!(
        commands[0],
        "sudo install -g root -m 644 -o root -t /usr/local/lib/bs /home/ubuntu/bs-volumes"
    );
    assert!(commands.contains(&"sudo update-rc.d bs_volume_init defaults 01".to_string()));
    assert!(commands.contains(&"sudo service bs_volume_init start".to_string()));
    assert_eq!(
        commands.last().unwrap(),
        "sudo -uroot \"/home/ubuntu/bs_hooks_before_bootstrap\""
    );

    // After-bootstrap work stays queued until its stage
    assert_eq!(plan.pending(Stage::AfterBootstrap, "i-0abc"), 1);
}

#[smol_potat::test]
async fn test_failed_hook_surfaces_exit_status() {
    let scripts = TempDir::new().unwrap();
    let registry = MixinRegistry::with_builtins().unwrap();
    let config = config(json!({"hooks": {"after_bootstrap": ["false"]}}));
    let set = registry.instantiate_all(&config).unwrap();

    let plan = ExecutionPlan::new();
    let renderer = Renderer::new(scripts.path());
    let vars = Value::Null;
    let cx = ActionContext {
        plan: &plan,
        renderer: &renderer,
        params: &config.params,
        vars: &vars,
    };
    let target = server();
    set.schedule_all(&cx, &target).unwrap();

    let shell = RecordingShell::new("ubuntu");
    shell.fail_matching("bs_hooks_after_bootstrap", 2);
    let err = plan
        .execute(Stage::AfterBootstrap, &shell, &target)
        .await
        .unwrap_err();
    match err {
        Error::CommandFailed { code, target, .. } => {
            assert_eq!(code, 2);
            assert_eq!(target, "ms101.dev.ame1.example.com");
        }
        other => panic!("unexpected error: {other}"),
    }
}
