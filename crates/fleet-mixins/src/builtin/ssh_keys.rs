//! Extra authorized keys (`ssh_keys` mixin)

use crate::{
    Result,
    manifest::ActionKind,
    mixin::{ActionContext, Mixin, MixinCore, ServerContext},
};
use serde_json::Value;

const MANIFEST: &str = include_str!("../../templates/ssh_keys/mixin.yaml");
const SCHEMA: &str = r#"
type: object
properties:
  user: { type: string }
  keys:
    type: array
    items: { type: string, pattern: "^(ssh-|ecdsa-)" }
"#;
const TEMPLATES: &[(&str, &str)] = &[(
    "authorize_ssh_keys",
    include_str!("../../templates/ssh_keys/authorize_ssh_keys.hbs"),
)];

/// Built-in `ssh_keys` mixin
pub struct SshKeysMixin {
    core: MixinCore,
}

impl SshKeysMixin {
    /// Create from merged data
    pub fn new(data: Value) -> Result<Self> {
        Ok(Self {
            core: MixinCore::embedded("ssh_keys", data, MANIFEST, Some(SCHEMA), TEMPLATES)?,
        })
    }

    fn has_keys(&self) -> bool {
        self.core
            .data
            .get("keys")
            .and_then(Value::as_array)
            .is_some_and(|keys| !keys.is_empty())
    }
}

impl Mixin for SshKeysMixin {
    fn core(&self) -> &MixinCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut MixinCore {
        &mut self.core
    }

    fn schedule(&self, cx: &ActionContext<'_>, target: &ServerContext) -> Result<usize> {
        if !self.has_keys() {
            return Ok(0);
        }
        self.core
            .action(cx, ActionKind::Run, target, "authorize_ssh_keys")?;
        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_schema_rejects_garbage_keys() {
        let ok = SshKeysMixin::new(json!({"keys": ["ssh-ed25519 AAAA ops"]})).unwrap();
        assert!(ok.validate().is_empty());
        assert!(ok.has_keys());

        let bad = SshKeysMixin::new(json!({"keys": ["not a key"]})).unwrap();
        assert_eq!(bad.validate().len(), 1);
    }
}
