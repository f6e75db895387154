//! The validated, layered inventory
//!
//! Scopes never link to their parents structurally. A network is found by
//! scanning regions, a subnetwork through its network, a profile by key.
//! Inheritance is computed by the resolver walking these lookups in order.

use crate::{ConfigError, ResolutionError, Result, overrides::OverrideSet, parser};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;

/// One level of the inventory hierarchy, in precedence order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeLevel {
    /// Organization
    Organization,
    /// Cloud region
    Region,
    /// Network (VPC)
    Network,
    /// Environment defined by the organization
    Environment,
    /// Subnetwork inside a network
    Subnetwork,
    /// Deployment stack
    Stack,
    /// Server profile
    Profile,
    /// Command-line overrides
    Override,
}

impl fmt::Display for ScopeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScopeLevel::Organization => "organization",
            ScopeLevel::Region => "region",
            ScopeLevel::Network => "network",
            ScopeLevel::Environment => "environment",
            ScopeLevel::Subnetwork => "subnetwork",
            ScopeLevel::Stack => "stack",
            ScopeLevel::Profile => "profile",
            ScopeLevel::Override => "override",
        };
        f.write_str(name)
    }
}

impl ScopeLevel {
    /// Keys that hold child scopes or mixins rather than run parameters
    fn structural_keys(self) -> &'static [&'static str] {
        match self {
            ScopeLevel::Organization => &["mixins", "env"],
            ScopeLevel::Region => &["mixins", "networks"],
            ScopeLevel::Network => &["mixins", "subnets"],
            ScopeLevel::Stack => &["mixins", "profiles"],
            _ => &["mixins"],
        }
    }
}

/// A borrowed view of one scope node
#[derive(Debug, Clone, Copy)]
pub struct ScopeNode<'a> {
    /// Hierarchy level
    pub level: ScopeLevel,
    /// Identifying key of the node
    pub key: &'a str,
    /// The node's mapping
    pub data: &'a Map<String, Value>,
}

impl<'a> ScopeNode<'a> {
    /// The data block this node contributes for `mixin`
    pub fn mixin(&self, mixin: &str) -> Option<&'a Value> {
        self.data
            .get("mixins")
            .and_then(Value::as_object)
            .and_then(|m| m.get(mixin))
    }

    /// Names of the mixins attached to this node
    pub fn mixin_names(&self) -> Vec<&'a str> {
        self.data
            .get("mixins")
            .and_then(Value::as_object)
            .map(|m| m.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Plain value lookup
    pub fn get(&self, key: &str) -> Option<&'a Value> {
        self.data.get(key)
    }

    /// Run parameters defined directly on this node
    pub fn params(&self) -> Map<String, Value> {
        let structural = self.level.structural_keys();
        self.data
            .iter()
            .filter(|(k, _)| !structural.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// The parsed and schema-validated inventory
#[derive(Debug, Clone, PartialEq)]
pub struct ScopeTree {
    document: Value,
}

impl ScopeTree {
    /// Validate a document and wrap it
    pub fn from_value(document: Value) -> Result<Self> {
        parser::validate_document(&document)?;
        Ok(Self { document })
    }

    /// The raw document
    pub fn document(&self) -> &Value {
        &self.document
    }

    /// A copy of this tree with `/path` overrides applied and re-validated
    pub fn with_overrides(&self, overrides: &OverrideSet) -> Result<Self> {
        let mut document = self.document.clone();
        overrides.apply_to_document(&mut document)?;
        ScopeTree::from_value(document)
    }

    fn section(&self, key: &str) -> Option<&Map<String, Value>> {
        self.document.get(key).and_then(Value::as_object)
    }

    /// The active organization (the first one defined)
    pub fn organization(&self) -> std::result::Result<ScopeNode<'_>, ResolutionError> {
        self.section("organizations")
            .and_then(|orgs| orgs.iter().next())
            .and_then(|(key, v)| {
                v.as_object().map(|data| ScopeNode {
                    level: ScopeLevel::Organization,
                    key,
                    data,
                })
            })
            .ok_or(ResolutionError::NoOrganization)
    }

    /// The organization's domain
    pub fn domain(&self) -> Option<&str> {
        self.organization()
            .ok()
            .and_then(|org| org.get("domain"))
            .and_then(Value::as_str)
    }

    /// Find the region holding `network_id` and the network itself
    pub fn region_and_network(&self, network_id: &str) -> Option<(ScopeNode<'_>, ScopeNode<'_>)> {
        let regions = self.section("regions")?;
        for (region_key, region) in regions {
            let Some(region_data) = region.as_object() else {
                continue;
            };
            let network = region_data
                .get("networks")
                .and_then(Value::as_object)
                .and_then(|nets| nets.get_key_value(network_id));
            if let Some((network_key, Value::Object(network_data))) = network {
                return Some((
                    ScopeNode {
                        level: ScopeLevel::Region,
                        key: region_key,
                        data: region_data,
                    },
                    ScopeNode {
                        level: ScopeLevel::Network,
                        key: network_key,
                        data: network_data,
                    },
                ));
            }
        }
        None
    }

    /// Find a subnetwork through its network
    pub fn subnetwork(&self, network_id: &str, subnetwork_id: &str) -> Option<ScopeNode<'_>> {
        let (_, network) = self.region_and_network(network_id)?;
        let (key, value) = network
            .get("subnets")
            .and_then(Value::as_object)?
            .get_key_value(subnetwork_id)?;
        value.as_object().map(|data| ScopeNode {
            level: ScopeLevel::Subnetwork,
            key,
            data,
        })
    }

    /// Environment defined on the active organization
    pub fn environment(&self, id: &str) -> Option<ScopeNode<'_>> {
        let org = self.organization().ok()?;
        let (key, value) = org
            .get("env")
            .and_then(Value::as_object)?
            .get_key_value(id)?;
        value.as_object().map(|data| ScopeNode {
            level: ScopeLevel::Environment,
            key,
            data,
        })
    }

    /// Stack by key
    pub fn stack(&self, id: &str) -> Option<ScopeNode<'_>> {
        self.keyed(ScopeLevel::Stack, "stacks", id)
    }

    /// Profile by key
    pub fn profile(&self, id: &str) -> Option<ScopeNode<'_>> {
        self.keyed(ScopeLevel::Profile, "profiles", id)
    }

    fn keyed(&self, level: ScopeLevel, section: &str, id: &str) -> Option<ScopeNode<'_>> {
        let (key, value) = self.section(section)?.get_key_value(id)?;
        value.as_object().map(|data| ScopeNode { level, key, data })
    }

    /// Profiles of a stack with their instance counts, in document order
    pub fn stack_profiles(&self, stack_id: &str) -> Result<Vec<(String, Option<u32>)>> {
        let stack = self
            .stack(stack_id)
            .ok_or_else(|| ResolutionError::StackNotFound(stack_id.to_string()))?;
        let Some(profiles) = stack.get("profiles").and_then(Value::as_object) else {
            return Ok(Vec::new());
        };
        profiles
            .iter()
            .map(|(name, info)| {
                if self.profile(name).is_none() {
                    return Err(ConfigError::from(ResolutionError::ProfileNotFound(
                        name.clone(),
                    )));
                }
                let count = info
                    .get("count")
                    .and_then(Value::as_u64)
                    .map(|c| c as u32);
                Ok((name.clone(), count))
            })
            .collect()
    }

    /// Every `(region, network, subnetwork)` triple in the inventory
    pub fn subnetworks(&self) -> Vec<(String, String, String)> {
        let mut out = Vec::new();
        let Some(regions) = self.section("regions") else {
            return out;
        };
        for (region, data) in regions {
            let Some(networks) = data.get("networks").and_then(Value::as_object) else {
                continue;
            };
            for (network, net) in networks {
                if let Some(subnets) = net.get("subnets").and_then(Value::as_object) {
                    for subnet in subnets.keys() {
                        out.push((region.clone(), network.clone(), subnet.clone()));
                    }
                }
            }
        }
        out
    }

    /// `(network, subnetwork)` pairs whose subnetwork names `environment`
    pub fn subnetworks_in_environment(&self, environment: &str) -> Vec<(String, String)> {
        self.subnetworks()
            .into_iter()
            .filter(|(_, network, subnetwork)| {
                self.subnetwork(network, subnetwork)
                    .and_then(|node| node.get("environment"))
                    .and_then(Value::as_str)
                    == Some(environment)
            })
            .map(|(_, network, subnetwork)| (network, subnetwork))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_str;

    const INVENTORY: &str = r#"
organizations:
  acme:
    domain: example.com
    env:
      prod:
        mixins:
          chef: { env: production }
regions:
  us-east-1:
    networks:
      ame1:
        subnets:
          dev: { environment: prod }
  eu-west-1:
    networks:
      euw1:
        subnets:
          qa: {}
stacks:
  cluster:
    profiles:
      ms: { count: 1 }
      rs:
profiles:
  ms: { hostname: "ms1%02d" }
  rs: { hostname: "rs1%02d", count: 3 }
"#;

    #[test]
    fn test_region_and_network_scans_regions() {
        let tree = parse_str(INVENTORY).unwrap();
        let (region, network) = tree.region_and_network("euw1").unwrap();
        assert_eq!(region.key, "eu-west-1");
        assert_eq!(network.key, "euw1");
        assert!(tree.region_and_network("nope").is_none());
    }

    #[test]
    fn test_subnetwork_lookup() {
        let tree = parse_str(INVENTORY).unwrap();
        let subnet = tree.subnetwork("ame1", "dev").unwrap();
        assert_eq!(subnet.level, ScopeLevel::Subnetwork);
        assert_eq!(subnet.params().get("environment"), Some(&Value::from("prod")));
        assert!(tree.subnetwork("ame1", "qa").is_none());
        assert!(tree.subnetwork("missing", "dev").is_none());
    }

    #[test]
    fn test_stack_profiles_keep_document_order() {
        let tree = parse_str(INVENTORY).unwrap();
        let profiles = tree.stack_profiles("cluster").unwrap();
        assert_eq!(
            profiles,
            vec![("ms".to_string(), Some(1)), ("rs".to_string(), None)]
        );
    }

    #[test]
    fn test_environment_and_domain() {
        let tree = parse_str(INVENTORY).unwrap();
        assert_eq!(tree.domain(), Some("example.com"));
        let env = tree.environment("prod").unwrap();
        assert!(env.mixin("chef").is_some());
        assert_eq!(tree.subnetworks().len(), 2);
    }

    #[test]
    fn test_subnetworks_in_environment() {
        let tree = parse_str(INVENTORY).unwrap();
        assert_eq!(
            tree.subnetworks_in_environment("prod"),
            vec![("ame1".to_string(), "dev".to_string())]
        );
        assert!(tree.subnetworks_in_environment("staging").is_empty());
    }
}
