//! Built-in mixins
//!
//! | name        | behavior                                            |
//! |-------------|-----------------------------------------------------|
//! | `volume`    | partitions, formats and mounts block devices        |
//! | `var`       | writes `/etc/bs.vars`                               |
//! | `hooks`     | runs commands before and after bootstrap            |
//! | `ssh_keys`  | authorizes extra keys                               |
//! | `cloudconf` | renders instance user-data                          |
//! | `ami`       | image naming and selection (data only)              |
//! | `tag`       | user tags (data only)                               |
//! | `apt`       | package sources folded into user-data (data only)   |

use crate::{DataMixin, Error, Mixin, MixinRegistry, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;

pub mod ami;
pub mod apt;
pub mod cloudconf;
pub mod hooks;
pub mod ssh_keys;
pub mod tag;
pub mod var;
pub mod volume;

pub use ami::AmiSpec;
pub use apt::AptSpec;
pub use cloudconf::CloudConfMixin;
pub use hooks::{HooksMixin, HooksSpec};
pub use ssh_keys::SshKeysMixin;
pub use tag::resolve_tags;
pub use var::VarMixin;
pub use volume::{Device, VolumeMixin, VolumeSpec};

/// Deserialize mixin data; an absent mixin yields the default
pub(crate) fn typed<T: DeserializeOwned + Default>(mixin: &str, data: &Value) -> Result<T> {
    if data.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(data.clone()).map_err(|e| Error::Invalid(vec![format!("{}: {}", mixin, e)]))
}

fn boxed<M: Mixin + 'static>(mixin: Result<M>) -> Result<Box<dyn Mixin>> {
    Ok(Box::new(mixin?))
}

/// Register every built-in mixin
pub fn register_builtins(registry: &mut MixinRegistry) -> Result<()> {
    registry.register("volume", |data| boxed(VolumeMixin::new(data)))?;
    registry.register("var", |data| boxed(VarMixin::new(data)))?;
    registry.register("hooks", |data| boxed(HooksMixin::new(data)))?;
    registry.register("ssh_keys", |data| boxed(SshKeysMixin::new(data)))?;
    registry.register("cloudconf", |data| boxed(CloudConfMixin::new(data)))?;
    // Typed parsing doubles as validation for the data-only mixins
    registry.register("ami", |data| {
        AmiSpec::from_value(&data)?;
        Ok(Box::new(DataMixin::new("ami", data)))
    })?;
    registry.register("apt", |data| {
        AptSpec::from_value(&data)?;
        Ok(Box::new(DataMixin::new("apt", data)))
    })?;
    registry.register("tag", |data| {
        if !data.is_null() && !data.is_object() {
            return Err(Error::Invalid(vec!["tag: data must be a mapping".to_string()]));
        }
        Ok(Box::new(DataMixin::new("tag", data)))
    })?;
    Ok(())
}
