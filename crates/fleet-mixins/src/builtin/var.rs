//! Server environment file (`var` mixin)
//!
//! Writes `/etc/bs.vars` with `VPCNAME`, `DOMAINNAME`, `HOSTNAME`, `FQDN`
//! and every key of the mixin data.

use crate::{
    Result,
    manifest::ActionKind,
    mixin::{ActionContext, Mixin, MixinCore, ServerContext},
};
use serde_json::Value;

const MANIFEST: &str = include_str!("../../templates/var/mixin.yaml");
const TEMPLATES: &[(&str, &str)] = &[("bs.vars", include_str!("../../templates/var/bs.vars.hbs"))];

/// Built-in `var` mixin
pub struct VarMixin {
    core: MixinCore,
}

impl VarMixin {
    /// Create from merged data
    pub fn new(data: Value) -> Result<Self> {
        Ok(Self {
            core: MixinCore::embedded("var", data, MANIFEST, None, TEMPLATES)?,
        })
    }
}

impl Mixin for VarMixin {
    fn core(&self) -> &MixinCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut MixinCore {
        &mut self.core
    }

    fn validate(&self) -> Vec<String> {
        match &self.core.data {
            Value::Object(map) => map
                .iter()
                .filter(|(_, v)| v.is_object() || v.is_array())
                .map(|(k, _)| format!("var: {} must be a scalar", k))
                .collect(),
            Value::Null => Vec::new(),
            _ => vec!["var: data must be a mapping".to_string()],
        }
    }

    fn schedule(&self, cx: &ActionContext<'_>, target: &ServerContext) -> Result<usize> {
        self.core.action(cx, ActionKind::Install, target, "bs.vars")?;
        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validate_scalars_only() {
        assert!(VarMixin::new(json!({"A": 1, "B": "x"})).unwrap().validate().is_empty());
        assert_eq!(
            VarMixin::new(json!({"A": [1]})).unwrap().validate(),
            vec!["var: A must be a scalar".to_string()]
        );
    }
}
