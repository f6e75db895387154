//! Configuration resolution
//!
//! Walks the scope hierarchy in fixed precedence order (organization,
//! region, network, environment, subnetwork, stack, profile, overrides)
//! and merges every contribution with the rules in [`crate::merge`].

use crate::{
    ConfigError, ResolutionError, Result,
    merge::{merge_all, merge_into},
    overrides::OverrideSet,
    scope::{ScopeNode, ScopeTree},
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Which scopes a run targets
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Selection {
    /// Network id
    pub network: String,
    /// Subnetwork id
    pub subnetwork: Option<String>,
    /// Explicit environment (otherwise taken from the subnetwork)
    pub environment: Option<String>,
    /// Stack id
    pub stack: Option<String>,
    /// Profile id
    pub profile: Option<String>,
}

impl Selection {
    /// Select a network
    pub fn new(network: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            ..Default::default()
        }
    }

    /// Parse a `NETWORK.SUBNETWORK` target
    pub fn parse_target(target: &str) -> Result<Self> {
        match target.split_once('.') {
            Some((network, subnet)) if !network.is_empty() && !subnet.is_empty() => {
                Ok(Self::new(network).with_subnetwork(subnet))
            }
            None if !target.is_empty() => Ok(Self::new(target)),
            _ => Err(ConfigError::ValidationError(format!(
                "expected NETWORK.SUBNETWORK, got '{}'",
                target
            ))),
        }
    }

    /// Set the subnetwork
    pub fn with_subnetwork(mut self, subnetwork: impl Into<String>) -> Self {
        self.subnetwork = Some(subnetwork.into());
        self
    }

    /// Set the environment
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    /// Set the stack
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Set the profile
    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = Some(profile.into());
        self
    }
}

fn default_ssh_user() -> String {
    "ubuntu".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_bootstrap_version() -> String {
    "11.12.4".to_string()
}

fn default_distro() -> String {
    "chef-full".to_string()
}

/// Top-level run parameters, flattened from every scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunParams {
    /// Active organization
    #[serde(default)]
    pub organization: String,
    /// Organization domain
    #[serde(default)]
    pub domain: String,
    /// Region holding the network
    #[serde(default)]
    pub region: String,
    /// Network id
    #[serde(default)]
    pub network: String,
    /// Subnetwork id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnetwork: Option<String>,
    /// Environment id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    /// Stack id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    /// Profile id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    /// Hostname pattern (one `%d`-style placeholder allowed)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Instance size
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,
    /// Number of servers to provision
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    /// Worker-pool size per phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    /// Configuration-management run list
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub run_list: Vec<String>,
    /// Last octet(s) of a fixed private address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<Value>,
    /// Availability zone
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability_zone: Option<String>,
    /// Security group ids
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub security_groups: Vec<String>,
    /// Maximum spot price; requests spot capacity when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spot_price: Option<String>,
    /// Request EBS-optimized instances
    #[serde(default)]
    pub ebs_optimized: bool,
    /// Provider key pair name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_name: Option<String>,
    /// Remote shell user
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    /// Remote shell port
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    /// Private key for the remote shell
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<PathBuf>,
    /// Configuration-management agent version
    #[serde(default = "default_bootstrap_version")]
    pub bootstrap_version: String,
    /// Bootstrap template name
    #[serde(default = "default_distro")]
    pub distro: String,
    /// Any other parameter, kept for templates
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for RunParams {
    fn default() -> Self {
        Self {
            organization: String::new(),
            domain: String::new(),
            region: String::new(),
            network: String::new(),
            subnetwork: None,
            environment: None,
            stack: None,
            profile: None,
            hostname: None,
            instance_type: None,
            count: None,
            batch_size: None,
            run_list: Vec::new(),
            ip_address: None,
            availability_zone: None,
            security_groups: Vec::new(),
            spot_price: None,
            ebs_optimized: false,
            key_name: None,
            ssh_user: default_ssh_user(),
            ssh_port: default_ssh_port(),
            identity_file: None,
            bootstrap_version: default_bootstrap_version(),
            distro: default_distro(),
            extra: Map::new(),
        }
    }
}

impl RunParams {
    /// The subnetwork, or a resolution error
    pub fn require_subnetwork(&self) -> std::result::Result<&str, ResolutionError> {
        self.subnetwork
            .as_deref()
            .ok_or_else(|| ResolutionError::MissingParameter("subnetwork".to_string()))
    }

    /// The hostname pattern, or a resolution error
    pub fn require_hostname(&self) -> std::result::Result<&str, ResolutionError> {
        self.hostname
            .as_deref()
            .ok_or_else(|| ResolutionError::MissingParameter("hostname".to_string()))
    }

    /// `hostname.subnetwork.network.domain`
    pub fn fqdn(&self, hostname: &str) -> String {
        format!(
            "{}.{}.{}.{}",
            hostname,
            self.subnetwork.as_deref().unwrap_or_default(),
            self.network,
            self.domain
        )
    }
}

/// The fully merged configuration for one invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectiveConfig {
    /// Flattened run parameters
    pub params: RunParams,
    mixins: BTreeMap<String, Value>,
}

impl EffectiveConfig {
    /// Assemble directly from parts
    pub fn new(params: RunParams, mixins: BTreeMap<String, Value>) -> Self {
        Self { params, mixins }
    }

    /// Merged data for a mixin
    pub fn mixin(&self, name: &str) -> Option<&Value> {
        self.mixins.get(name)
    }

    /// Merged data for a mixin, deserialized
    pub fn mixin_as<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        self.mixins
            .get(name)
            .map(|v| {
                serde_json::from_value(v.clone()).map_err(|e| {
                    ConfigError::ValidationError(format!("mixin '{}': {}", name, e))
                })
            })
            .transpose()
    }

    /// True when some scope contributed data for `name`
    pub fn has_mixin(&self, name: &str) -> bool {
        self.mixins.contains_key(name)
    }

    /// Every mixin with data, sorted by name
    pub fn mixins(&self) -> &BTreeMap<String, Value> {
        &self.mixins
    }

    /// Render as YAML
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

/// Builds [`EffectiveConfig`] values from an inventory and overrides
#[derive(Debug, Clone)]
pub struct ConfigResolver {
    tree: ScopeTree,
    mixin_overlay: Map<String, Value>,
    defaults: Map<String, Value>,
    cli_params: Map<String, Value>,
}

impl ConfigResolver {
    /// Apply document overrides to `tree` and prepare mixin overrides
    pub fn new(tree: &ScopeTree, overrides: &OverrideSet) -> Result<Self> {
        let tree = if overrides.is_empty() {
            tree.clone()
        } else {
            tree.with_overrides(overrides)?
        };
        Ok(Self {
            tree,
            mixin_overlay: overrides.mixin_overlay(),
            defaults: Map::new(),
            cli_params: Map::new(),
        })
    }

    /// Parameters below every scope (tool settings)
    pub fn with_defaults(mut self, defaults: Map<String, Value>) -> Self {
        self.defaults = defaults;
        self
    }

    /// Parameters from command-line flags; they win over every scope
    pub fn with_cli_params(mut self, params: Map<String, Value>) -> Self {
        self.cli_params = params;
        self
    }

    /// The inventory with document overrides applied
    pub fn tree(&self) -> &ScopeTree {
        &self.tree
    }

    /// Applicable scope nodes, lowest precedence first
    pub fn scopes(&self, selection: &Selection) -> Result<Vec<ScopeNode<'_>>> {
        let tree = &self.tree;
        let mut scopes = vec![tree.organization()?];

        let (region, network) = tree
            .region_and_network(&selection.network)
            .ok_or_else(|| ResolutionError::NetworkNotFound(selection.network.clone()))?;
        scopes.push(region);
        scopes.push(network);

        let subnet = match &selection.subnetwork {
            Some(id) => Some(tree.subnetwork(&selection.network, id).ok_or_else(|| {
                ResolutionError::SubnetworkNotFound {
                    network: selection.network.clone(),
                    subnetwork: id.clone(),
                }
            })?),
            None => None,
        };

        if let Some(env) = self.environment_scope(selection, subnet.as_ref())? {
            scopes.push(env);
        }
        if let Some(subnet) = subnet {
            scopes.push(subnet);
        }
        if let Some(id) = &selection.stack {
            scopes.push(
                tree.stack(id)
                    .ok_or_else(|| ResolutionError::StackNotFound(id.clone()))?,
            );
        }
        if let Some(id) = &selection.profile {
            scopes.push(
                tree.profile(id)
                    .ok_or_else(|| ResolutionError::ProfileNotFound(id.clone()))?,
            );
        }
        Ok(scopes)
    }

    fn environment_scope<'a>(
        &'a self,
        selection: &Selection,
        subnet: Option<&ScopeNode<'a>>,
    ) -> Result<Option<ScopeNode<'a>>> {
        if let Some(id) = &selection.environment {
            return self
                .tree
                .environment(id)
                .map(Some)
                .ok_or_else(|| ResolutionError::EnvironmentNotFound(id.clone()).into());
        }
        let implied = subnet
            .and_then(|s| s.get("environment"))
            .and_then(Value::as_str);
        match implied {
            Some(id) => {
                let env = self.tree.environment(id);
                if env.is_none() {
                    warn!("Subnetwork names environment '{}' which is not defined", id);
                }
                Ok(env)
            }
            None => Ok(None),
        }
    }

    /// Merged data for one mixin, or `None` when no scope defines it
    pub fn mixin_data(&self, selection: &Selection, mixin: &str) -> Result<Option<Value>> {
        let scopes = self.scopes(selection)?;
        Ok(self.merge_mixin(&scopes, mixin))
    }

    fn merge_mixin(&self, scopes: &[ScopeNode<'_>], mixin: &str) -> Option<Value> {
        let contributions = scopes
            .iter()
            .filter_map(|scope| {
                scope.mixin(mixin).map(|data| {
                    debug!("Mixin '{}' contributed by {} '{}'", mixin, scope.level, scope.key);
                    data.clone()
                })
            })
            .chain(self.mixin_overlay.get(mixin).cloned());
        merge_all(contributions)
    }

    /// Resolve the effective configuration
    ///
    /// Every name in `required` must be contributed by some scope.
    pub fn resolve(&self, selection: &Selection, required: &[&str]) -> Result<EffectiveConfig> {
        let scopes = self.scopes(selection)?;

        let mut names: BTreeSet<&str> = scopes.iter().flat_map(|s| s.mixin_names()).collect();
        names.extend(self.mixin_overlay.keys().map(String::as_str));
        names.extend(required.iter().copied());

        let mut mixins = BTreeMap::new();
        for name in names {
            match self.merge_mixin(&scopes, name) {
                Some(data) => {
                    mixins.insert(name.to_string(), data);
                }
                None if required.contains(&name) => {
                    return Err(ResolutionError::MissingMixin(name.to_string()).into());
                }
                None => {}
            }
        }

        let params = self.resolve_params(selection, &scopes)?;
        Ok(EffectiveConfig { params, mixins })
    }

    fn resolve_params(&self, selection: &Selection, scopes: &[ScopeNode<'_>]) -> Result<RunParams> {
        let mut merged = Value::Object(self.defaults.clone());
        for scope in scopes {
            merge_into(&mut merged, Value::Object(scope.params()));
        }
        merge_into(&mut merged, Value::Object(self.cli_params.clone()));

        let Value::Object(mut map) = merged else {
            return Err(ConfigError::ValidationError(
                "run parameters must be a mapping".to_string(),
            ));
        };

        // Identity comes from the selection, never from scope data
        let environment = scopes
            .iter()
            .find(|s| s.level == crate::ScopeLevel::Environment)
            .map(|s| s.key.to_string());
        let identity = [
            ("organization", Some(scopes[0].key.to_string())),
            ("region", Some(scopes[1].key.to_string())),
            ("network", Some(selection.network.clone())),
            ("subnetwork", selection.subnetwork.clone()),
            ("environment", environment),
            ("stack", selection.stack.clone()),
            ("profile", selection.profile.clone()),
        ];
        for (key, value) in identity {
            match value {
                Some(v) => map.insert(key.to_string(), Value::String(v)),
                None => map.remove(key),
            };
        }

        serde_json::from_value(Value::Object(map))
            .map_err(|e| ConfigError::ValidationError(format!("run parameters: {}", e)))
    }
}
