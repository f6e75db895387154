//! `mixin.yaml` manifests
//!
//! ```yaml
//! files:
//!   bs_volume_init:
//!     outfile: bs_volume_init
//!     action: install
//!     run_at: before_bootstrap
//!     dir: /etc/init.d
//!     mode: "755"
//! ```

use crate::{Error, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// When scheduled actions run relative to bootstrap
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// After the server is reachable, before bootstrap
    #[default]
    #[serde(alias = "before_chef")]
    BeforeBootstrap,
    /// After bootstrap completed
    #[serde(alias = "after_chef")]
    AfterBootstrap,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::BeforeBootstrap => f.write_str("before_bootstrap"),
            Stage::AfterBootstrap => f.write_str("after_bootstrap"),
        }
    }
}

/// What happens to a rendered file on the server
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Upload and place the file
    Install,
    /// Install, then execute it
    #[default]
    Run,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::Install => f.write_str("install"),
            ActionKind::Run => f.write_str("run"),
        }
    }
}

fn default_mode() -> String {
    "755".to_string()
}

fn default_root() -> String {
    "root".to_string()
}

/// How one template is rendered and placed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSpec {
    /// Rendered file name (defaults to the template name)
    #[serde(default)]
    pub outfile: Option<String>,
    /// Install or run
    #[serde(default)]
    pub action: ActionKind,
    /// Stage the action belongs to
    #[serde(default, alias = "run-at")]
    pub run_at: Stage,
    /// Destination directory; stays in the login user's home when unset
    #[serde(default)]
    pub dir: Option<String>,
    /// File mode passed to `install`
    #[serde(default = "default_mode")]
    pub mode: String,
    /// File owner
    #[serde(default = "default_root")]
    pub owner: String,
    /// File group
    #[serde(default = "default_root")]
    pub group: String,
    /// User the script runs as
    #[serde(default = "default_root", alias = "run-as")]
    pub run_as: String,
    /// A non-zero exit is logged instead of failing the server
    #[serde(default)]
    pub tolerate_failure: bool,
}

impl Default for FileSpec {
    fn default() -> Self {
        Self {
            outfile: None,
            action: ActionKind::default(),
            run_at: Stage::default(),
            dir: None,
            mode: default_mode(),
            owner: default_root(),
            group: default_root(),
            run_as: default_root(),
            tolerate_failure: false,
        }
    }
}

impl FileSpec {
    /// Rendered file name for `template`
    pub fn outfile_for<'a>(&'a self, template: &'a str) -> &'a str {
        self.outfile.as_deref().unwrap_or(template)
    }
}

/// Parsed `mixin.yaml`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MixinManifest {
    /// File specs keyed by template name, in declaration order
    #[serde(default)]
    pub files: IndexMap<String, FileSpec>,
}

impl MixinManifest {
    /// Parse a manifest from YAML
    pub fn parse(content: &str, origin: &Path) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content).map_err(|e| Error::Parse {
            path: origin.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Load `mixin.yaml` from a mixin directory
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join("mixin.yaml");
        let content = std::fs::read_to_string(&path)?;
        Self::parse(&content, &path)
    }

    /// Spec for `template`, defaults when the manifest does not list it
    pub fn file(&self, template: &str) -> FileSpec {
        self.files.get(template).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_and_aliases() {
        let manifest = MixinManifest::parse(
            r#"
files:
  init:
    run-at: after_chef
    run-as: deploy
  helpers:
    action: install
    dir: /usr/local/lib
    mode: "644"
"#,
            Path::new("mixin.yaml"),
        )
        .unwrap();

        let init = manifest.file("init");
        assert_eq!(init.run_at, Stage::AfterBootstrap);
        assert_eq!(init.run_as, "deploy");
        assert_eq!(init.action, ActionKind::Run);
        assert_eq!(init.mode, "755");
        assert_eq!(init.outfile_for("init"), "init");

        let helpers = manifest.file("helpers");
        assert_eq!(helpers.action, ActionKind::Install);
        assert_eq!(helpers.run_at, Stage::BeforeBootstrap);
        assert_eq!(helpers.dir.as_deref(), Some("/usr/local/lib"));

        assert_eq!(manifest.file("unlisted"), FileSpec::default());
        let names: Vec<_> = manifest.files.keys().collect();
        assert_eq!(names, vec!["init", "helpers"]);
    }

    #[test]
    fn test_bad_manifest_names_file() {
        let err = MixinManifest::parse("files: [1, 2", Path::new("/m/mixin.yaml")).unwrap_err();
        assert!(err.to_string().contains("/m/mixin.yaml"));
    }
}
