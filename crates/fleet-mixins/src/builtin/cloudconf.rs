//! Instance user-data (`cloudconf` mixin)

use crate::{
    Result,
    builtin::apt::AptSpec,
    mixin::{ActionContext, Mixin, MixinCore, ServerContext},
    render::Renderer,
};
use fleet_config::RunParams;
use serde_json::{Value, json};
use std::path::PathBuf;

const TEMPLATE: &str = include_str!("../../templates/cloudconf/cloud-config.hbs");
const OUTFILE: &str = "bs_cloud_conf";

/// Built-in `cloudconf` mixin
pub struct CloudConfMixin {
    core: MixinCore,
}

impl CloudConfMixin {
    /// Create from merged data
    pub fn new(data: Value) -> Result<Self> {
        let data = if data.is_null() { json!({}) } else { data };
        Ok(Self {
            core: MixinCore::embedded("cloudconf", data, "", None, &[("cloud-config", TEMPLATE)])?,
        })
    }

    /// Embed the `apt` fragment
    pub fn with_apt(mut self, apt: Option<&AptSpec>) -> Self {
        if let Some(apt) = apt {
            let fragment = apt.cloud_config();
            self.configure(&mut |data| {
                if let Value::Object(map) = data {
                    map.insert("apt_config".to_string(), Value::String(fragment.clone()));
                }
            });
        }
        self
    }

    /// Render user-data into the script directory, returning the file
    pub fn build(&self, renderer: &Renderer, params: &RunParams) -> Result<PathBuf> {
        let context = json!({
            "data": self.core.data,
            "params": params,
            "target": Value::Null,
            "vars": Value::Null,
        });
        renderer.cook("cloud-config", TEMPLATE, &context, None, OUTFILE, true)
    }

    /// Rendered user-data text
    pub fn user_data(&self, renderer: &Renderer, params: &RunParams) -> Result<String> {
        let path = self.build(renderer, params)?;
        Ok(std::fs::read_to_string(path)?)
    }
}

impl Mixin for CloudConfMixin {
    fn core(&self) -> &MixinCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut MixinCore {
        &mut self.core
    }

    // User-data is consumed at launch, never on a running server
    fn schedule(&self, _cx: &ActionContext<'_>, _target: &ServerContext) -> Result<usize> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_user_data_embeds_apt() {
        let dir = TempDir::new().unwrap();
        let renderer = Renderer::new(dir.path());
        let apt = AptSpec {
            sources: Vec::new(),
            packages: vec!["htop".to_string()],
        };
        let mixin = CloudConfMixin::new(json!({"runcmd": ["touch /tmp/booted"]}))
            .unwrap()
            .with_apt(Some(&apt));

        let text = mixin.user_data(&renderer, &RunParams::default()).unwrap();
        assert!(text.starts_with("#cloud-config\n"));
        assert!(text.contains("packages:\n - htop\n"));
        assert!(text.contains(" - touch /tmp/booted"));
        assert!(dir.path().join("bs_cloud_conf").is_file());
    }
}
