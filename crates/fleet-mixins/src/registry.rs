//! Mixin registry and per-run mixin sets

use crate::{
    DataMixin, Error, Result, ScriptMixin,
    builtin::register_builtins,
    mixin::{ActionContext, Mixin, ServerContext},
};
use fleet_config::EffectiveConfig;
use indexmap::IndexMap;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Builds a mixin bound to its merged data
pub type MixinFactory = Box<dyn Fn(Value) -> Result<Box<dyn Mixin>> + Send + Sync>;

/// Where a registered mixin comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MixinSource {
    /// Compiled into this crate
    Builtin,
    /// Loaded from a user mixin directory
    Directory(PathBuf),
}

struct Registration {
    source: MixinSource,
    factory: MixinFactory,
}

/// Maps mixin names to factories
///
/// Registration order is kept and doubles as scheduling order.
#[derive(Default)]
pub struct MixinRegistry {
    mixins: IndexMap<String, Registration>,
}

impl MixinRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding every built-in mixin
    pub fn with_builtins() -> Result<Self> {
        let mut registry = Self::new();
        register_builtins(&mut registry)?;
        Ok(registry)
    }

    /// Register a built-in factory
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> Result<()>
    where
        F: Fn(Value) -> Result<Box<dyn Mixin>> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.mixins.contains_key(&name) {
            return Err(Error::AlreadyRegistered(name));
        }
        self.mixins.insert(
            name,
            Registration {
                source: MixinSource::Builtin,
                factory: Box::new(factory),
            },
        );
        Ok(())
    }

    /// Register every subdirectory of `root` as a mixin named after it
    ///
    /// Directory mixins shadow anything registered earlier under the
    /// same name. Returns the names loaded.
    pub fn load_dir(&mut self, root: &Path) -> Result<Vec<String>> {
        let mut dirs = std::fs::read_dir(root)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect::<Vec<_>>();
        dirs.sort();

        let mut loaded = Vec::new();
        for dir in dirs {
            let Some(name) = dir.file_name().map(|n| n.to_string_lossy().to_string()) else {
                continue;
            };
            if let Some(previous) = self.mixins.get(&name) {
                info!(
                    "Mixin '{}' from {} shadows {}",
                    name,
                    dir.display(),
                    describe(&previous.source)
                );
            }

            let factory_name = name.clone();
            let factory_dir = dir.clone();
            self.mixins.insert(
                name.clone(),
                Registration {
                    source: MixinSource::Directory(dir),
                    factory: Box::new(move |data| {
                        Ok(Box::new(ScriptMixin::load(&factory_name, data, &factory_dir)?))
                    }),
                },
            );
            loaded.push(name);
        }
        debug!("Loaded {} mixin(s) from {}", loaded.len(), root.display());
        Ok(loaded)
    }

    /// Registered names in registration order
    pub fn names(&self) -> Vec<&str> {
        self.mixins.keys().map(String::as_str).collect()
    }

    /// Origin of a registered mixin
    pub fn source(&self, name: &str) -> Option<&MixinSource> {
        self.mixins.get(name).map(|r| &r.source)
    }

    /// Check if a mixin is registered
    pub fn has(&self, name: &str) -> bool {
        self.mixins.contains_key(name)
    }

    /// Bind `data` to the mixin registered as `name`
    ///
    /// Unregistered names become data-only mixins.
    pub fn instantiate(&self, name: &str, data: Value) -> Result<Box<dyn Mixin>> {
        match self.mixins.get(name) {
            Some(registration) => (registration.factory)(data),
            None => {
                debug!("No implementation for mixin '{}', treating as data-only", name);
                Ok(Box::new(DataMixin::new(name, data)))
            }
        }
    }

    /// Instantiate and validate every mixin of a resolved configuration
    ///
    /// All problems across all mixins are reported together.
    pub fn instantiate_all(&self, config: &EffectiveConfig) -> Result<MixinSet> {
        let mut problems = Vec::new();
        let mut built = Vec::new();

        for (name, data) in config.mixins() {
            match self.instantiate(name, data.clone()) {
                Ok(mixin) => {
                    problems.extend(mixin.validate());
                    built.push((name.clone(), mixin));
                }
                Err(Error::Invalid(found)) => problems.extend(found),
                Err(e) => problems.push(format!("{}: {}", name, e)),
            }
        }
        if !problems.is_empty() {
            return Err(Error::Invalid(problems));
        }

        // Registered mixins first, in registration order
        built.sort_by_key(|(name, _)| self.mixins.get_index_of(name).unwrap_or(usize::MAX));
        Ok(MixinSet {
            mixins: built.into_iter().collect(),
        })
    }
}

fn describe(source: &MixinSource) -> String {
    match source {
        MixinSource::Builtin => "the built-in".to_string(),
        MixinSource::Directory(dir) => dir.display().to_string(),
    }
}

/// The mixins of one run, bound to their data
#[derive(Default)]
pub struct MixinSet {
    mixins: IndexMap<String, Box<dyn Mixin>>,
}

impl MixinSet {
    /// Get a mixin by name
    pub fn get(&self, name: &str) -> Option<&dyn Mixin> {
        self.mixins.get(name).map(|m| m.as_ref())
    }

    /// Get a mixin by name, mutably
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Box<dyn Mixin>> {
        self.mixins.get_mut(name)
    }

    /// Merged data of a mixin, `Null` when absent
    pub fn data(&self, name: &str) -> &Value {
        static NULL: Value = Value::Null;
        self.mixins.get(name).map(|m| m.data()).unwrap_or(&NULL)
    }

    /// Add or replace a mixin
    pub fn insert(&mut self, mixin: Box<dyn Mixin>) {
        self.mixins.insert(mixin.name().to_string(), mixin);
    }

    /// Mixins in scheduling order
    pub fn iter(&self) -> impl Iterator<Item = &dyn Mixin> {
        self.mixins.values().map(|m| m.as_ref())
    }

    /// Mixin names in scheduling order
    pub fn names(&self) -> Vec<&str> {
        self.mixins.keys().map(String::as_str).collect()
    }

    /// Schedule every mixin's actions for `target`
    pub fn schedule_all(&self, cx: &ActionContext<'_>, target: &ServerContext) -> Result<usize> {
        let mut total = 0;
        for mixin in self.mixins.values() {
            let scheduled = mixin.schedule(cx, target)?;
            if scheduled > 0 {
                debug!("Mixin '{}' scheduled {} action(s) for {}", mixin.name(), scheduled, target.fqdn);
            }
            total += scheduled;
        }
        Ok(total)
    }
}
