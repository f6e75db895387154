//! Image naming and selection (`ami` mixin)

use crate::Result;
use fleet_config::interpolate::interpolate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Typed view of `ami` data
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AmiSpec {
    /// Name prefix
    pub prefix: Option<String>,
    /// Name body
    pub body: Option<String>,
    /// Source revision
    pub git_hash: Option<String>,
    /// Name suffix
    pub suffix: Option<String>,
    /// Image id to launch from when no other selection applies
    pub base: Option<String>,
    /// Launch the image another profile's running servers use
    #[serde(rename = "match")]
    pub match_profile: Option<String>,
    /// Pick the newest image named by this spec
    pub latest: bool,
}

impl AmiSpec {
    /// Parse from merged data
    pub fn from_value(data: &Value) -> Result<Self> {
        super::typed("ami", data)
    }

    /// `prefix + body + git_hash + suffix`, each part interpolated
    pub fn image_name(&self, vars: &HashMap<String, String>) -> Result<String> {
        let mut name = String::new();
        for part in [&self.prefix, &self.body, &self.git_hash, &self.suffix]
            .into_iter()
            .flatten()
        {
            name.push_str(&interpolate(part, vars)?);
        }
        Ok(name)
    }

    /// Prefix used when searching for the newest matching image
    pub fn search_prefix(&self, vars: &HashMap<String, String>) -> Result<String> {
        match &self.prefix {
            Some(prefix) => Ok(interpolate(prefix, vars)?),
            None => self.image_name(vars),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_image_name_concatenates_parts() {
        let spec = AmiSpec::from_value(&json!({
            "prefix": "ubuntu-${release}-",
            "body": "base",
            "suffix": "-hvm"
        }))
        .unwrap();
        let vars = HashMap::from([("release".to_string(), "trusty".to_string())]);
        assert_eq!(spec.image_name(&vars).unwrap(), "ubuntu-trusty-base-hvm");
        assert_eq!(spec.search_prefix(&vars).unwrap(), "ubuntu-trusty-");
    }

    #[test]
    fn test_match_and_base() {
        let spec = AmiSpec::from_value(&json!({"base": "ami-123", "match": "master"})).unwrap();
        assert_eq!(spec.base.as_deref(), Some("ami-123"));
        assert_eq!(spec.match_profile.as_deref(), Some("master"));
        assert_eq!(spec.image_name(&HashMap::new()).unwrap(), "");
    }
}
