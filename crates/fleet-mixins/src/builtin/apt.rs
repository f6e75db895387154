//! Package sources for cloud-config (`apt` mixin)

use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Typed view of `apt` data
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AptSpec {
    /// Repository lines
    pub sources: Vec<String>,
    /// Packages to install at first boot
    pub packages: Vec<String>,
}

impl AptSpec {
    /// Parse from merged data
    pub fn from_value(data: &Value) -> Result<Self> {
        super::typed("apt", data)
    }

    /// The `apt_sources` / `packages` cloud-config fragment
    pub fn cloud_config(&self) -> String {
        let mut conf = String::new();
        if !self.sources.is_empty() {
            conf.push_str("apt_sources:\n");
            for repo in &self.sources {
                conf.push_str(&format!(" - source: \"{}\"\n", repo));
            }
        }
        if !self.packages.is_empty() {
            conf.push_str("packages:\n");
            for pkg in &self.packages {
                conf.push_str(&format!(" - {}\n", pkg));
            }
        }
        conf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cloud_config_fragment() {
        let spec = AptSpec::from_value(&json!({
            "sources": ["deb http://repo trusty main"],
            "packages": ["htop", "jq"]
        }))
        .unwrap();
        assert_eq!(
            spec.cloud_config(),
            "apt_sources:\n - source: \"deb http://repo trusty main\"\npackages:\n - htop\n - jq\n"
        );
        assert_eq!(AptSpec::default().cloud_config(), "");
    }
}
