//! Per-stage commands (`hooks` mixin)

use crate::{
    Result,
    manifest::ActionKind,
    mixin::{ActionContext, Mixin, MixinCore, ServerContext},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const MANIFEST: &str = include_str!("../../templates/hooks/mixin.yaml");
const TEMPLATES: &[(&str, &str)] = &[
    ("before_bootstrap", include_str!("../../templates/hooks/before_bootstrap.hbs")),
    ("after_bootstrap", include_str!("../../templates/hooks/after_bootstrap.hbs")),
];

/// Typed view of `hooks` data
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HooksSpec {
    /// Commands run once the server is reachable
    #[serde(alias = "before_chef")]
    pub before_bootstrap: Vec<String>,
    /// Commands run after bootstrap
    #[serde(alias = "after_chef")]
    pub after_bootstrap: Vec<String>,
}

/// Built-in `hooks` mixin
pub struct HooksMixin {
    core: MixinCore,
    spec: HooksSpec,
}

impl HooksMixin {
    /// Create from merged data; stage aliases are normalized
    pub fn new(data: Value) -> Result<Self> {
        let spec: HooksSpec = super::typed("hooks", &data)?;
        let data = serde_json::to_value(&spec).unwrap_or(Value::Null);
        Ok(Self {
            core: MixinCore::embedded("hooks", data, MANIFEST, None, TEMPLATES)?,
            spec,
        })
    }
}

impl Mixin for HooksMixin {
    fn core(&self) -> &MixinCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut MixinCore {
        &mut self.core
    }

    fn schedule(&self, cx: &ActionContext<'_>, target: &ServerContext) -> Result<usize> {
        let mut scheduled = 0;
        for (template, commands) in [
            ("before_bootstrap", &self.spec.before_bootstrap),
            ("after_bootstrap", &self.spec.after_bootstrap),
        ] {
            if !commands.is_empty() {
                self.core.action(cx, ActionKind::Run, target, template)?;
                scheduled += 1;
            }
        }
        Ok(scheduled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_aliases_normalized() {
        let mixin = HooksMixin::new(json!({"before_chef": ["echo hi"]})).unwrap();
        assert_eq!(mixin.data(), &json!({"before_bootstrap": ["echo hi"], "after_bootstrap": []}));
    }

    #[test]
    fn test_rejects_non_list() {
        assert!(HooksMixin::new(json!({"before_bootstrap": "echo"})).is_err());
    }
}
