//! Integration tests for fleet-config

use fleet_config::{
    ConfigError, ConfigResolver, OverrideSet, ResolutionError, Selection, parser,
};
use serde_json::json;
use std::io::Write;
use tempfile::NamedTempFile;

const INVENTORY: &str = r#"
organizations:
  acme:
    domain: example.com
    env:
      prod:
        mixins:
          tag: { env: production }
          hooks:
            before_bootstrap: ["echo prod"]
    mixins:
      tag: { owner: ops, env: none }
      hooks:
        before_bootstrap: ["echo org"]
      volume:
        ebs:
          sdf: { size: 100, volume_type: gp2 }
regions:
  us-east-1:
    key_name: acme-us
    networks:
      ame1:
        mixins:
          ami: { prefix: "ubuntu-", base: trusty }
        subnets:
          dev:
            environment: prod
            mixins:
              hooks:
                before_bootstrap: ["echo subnet"]
          qa: {}
stacks:
  cluster:
    mixins:
      volume:
        ebs:
          sdf: { size: 200 }
    profiles:
      ms: { count: 2 }
      rs:
profiles:
  ms:
    hostname: "ms1%02d"
    instance_type: m3.large
    run_list: ["role[base]"]
    mixins:
      ami: { suffix: "-ms" }
      hooks:
        before_bootstrap: ["echo profile"]
  rs:
    hostname: "rs1%02d"
"#;

fn resolver(overrides: &str) -> ConfigResolver {
    let tree = parser::parse_str(INVENTORY).unwrap();
    let overrides = OverrideSet::parse(overrides).unwrap();
    ConfigResolver::new(&tree, &overrides).unwrap()
}

fn selection() -> Selection {
    Selection::parse_target("ame1.dev")
        .unwrap()
        .with_stack("cluster")
        .with_profile("ms")
}

#[test]
fn test_resolution_is_deterministic() {
    let resolver = resolver("");
    let first = resolver.resolve(&selection(), &["volume"]).unwrap();
    let second = resolver.resolve(&selection(), &["volume"]).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.to_yaml().unwrap(), second.to_yaml().unwrap());
}

#[test]
fn test_more_specific_scalar_wins() {
    let config = resolver("").resolve(&selection(), &[]).unwrap();
    // Environment overrides organization
    assert_eq!(config.mixin("tag"), Some(&json!({"owner": "ops", "env": "production"})));
    // Stack overrides organization, untouched keys survive
    assert_eq!(
        config.mixin("volume"),
        Some(&json!({"ebs": {"sdf": {"size": 200, "volume_type": "gp2"}}}))
    );
}

#[test]
fn test_sequences_accumulate_in_scope_order() {
    let config = resolver("").resolve(&selection(), &[]).unwrap();
    assert_eq!(
        config.mixin("hooks"),
        Some(&json!({
            "before_bootstrap": ["echo org", "echo prod", "echo subnet", "echo profile"]
        }))
    );
}

#[test]
fn test_mappings_merge_across_scopes() {
    let config = resolver("").resolve(&selection(), &[]).unwrap();
    assert_eq!(
        config.mixin("ami"),
        Some(&json!({"prefix": "ubuntu-", "base": "trusty", "suffix": "-ms"}))
    );
    assert_eq!(config.params.key_name.as_deref(), Some("acme-us"));
    assert_eq!(config.params.environment.as_deref(), Some("prod"));
    assert_eq!(config.params.run_list, vec!["role[base]".to_string()]);
}

#[test]
fn test_overrides_take_precedence() {
    let config = resolver("%ami/suffix=-hvm;/profiles/ms/instance_type=c4.xlarge;%tag/env=[a, b]")
        .resolve(&selection(), &[])
        .unwrap();
    assert_eq!(config.mixin("ami").and_then(|a| a.get("suffix")), Some(&json!("-hvm")));
    assert_eq!(config.params.instance_type.as_deref(), Some("c4.xlarge"));
    // Scalar replaced by a sequence: later wins
    assert_eq!(config.mixin("tag").and_then(|t| t.get("env")), Some(&json!(["a", "b"])));
}

#[test]
fn test_override_creates_missing_mixin() {
    let config = resolver("%apt/packages=[htop]").resolve(&selection(), &["apt"]).unwrap();
    assert_eq!(config.mixin("apt"), Some(&json!({"packages": ["htop"]})));
}

#[test]
fn test_required_mixin_missing() {
    let err = resolver("")
        .resolve(&Selection::parse_target("ame1.qa").unwrap(), &["ami", "cloudconf"])
        .unwrap_err();
    match err {
        ConfigError::Resolution(ResolutionError::MissingMixin(name)) => assert_eq!(name, "cloudconf"),
        other => panic!("expected missing mixin, got {:?}", other),
    }
}

#[test]
fn test_subnetwork_without_environment() {
    let config = resolver("")
        .resolve(&Selection::parse_target("ame1.qa").unwrap(), &[])
        .unwrap();
    assert_eq!(config.params.environment, None);
    assert_eq!(config.mixin("tag"), Some(&json!({"owner": "ops", "env": "none"})));
}

#[test]
fn test_explicit_environment_must_exist() {
    let sel = Selection::parse_target("ame1.qa").unwrap().with_environment("stage");
    assert!(matches!(
        resolver("").resolve(&sel, &[]).unwrap_err(),
        ConfigError::Resolution(ResolutionError::EnvironmentNotFound(_))
    ));
}

#[test]
fn test_stack_profiles_from_file() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(INVENTORY.as_bytes()).unwrap();
    let tree = parser::parse_file(file.path()).unwrap();
    let profiles = tree.stack_profiles("cluster").unwrap();
    assert_eq!(profiles, vec![("ms".to_string(), Some(2)), ("rs".to_string(), None)]);
}
