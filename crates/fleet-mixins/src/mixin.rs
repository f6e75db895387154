//! The mixin capability interface

use crate::{
    Error, Result,
    manifest::{ActionKind, MixinManifest},
    plan::{ActionHandle, ExecutionPlan, ScheduledAction},
    render::Renderer,
};
use fleet_config::{RunParams, parser};
use indexmap::IndexMap;
use remote_shell::RemoteTarget;
use serde::Serialize;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A server as seen by templates and actions
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerContext {
    /// Provider id
    pub id: String,
    /// Short hostname
    pub hostname: String,
    /// `hostname.subnetwork.network.domain`
    pub fqdn: String,
    /// Address the remote shell connects to
    pub address: String,
}

impl ServerContext {
    /// Create a context
    pub fn new(
        id: impl Into<String>,
        hostname: impl Into<String>,
        fqdn: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            hostname: hostname.into(),
            fqdn: fqdn.into(),
            address: address.into(),
        }
    }

    /// The remote-shell view of this server
    pub fn remote(&self) -> RemoteTarget {
        RemoteTarget::new(&self.id, &self.address, &self.fqdn)
    }
}

/// Everything a mixin needs to schedule actions for one run
pub struct ActionContext<'a> {
    /// The run's plan
    pub plan: &'a ExecutionPlan,
    /// Template renderer
    pub renderer: &'a Renderer,
    /// Resolved run parameters
    pub params: &'a RunParams,
    /// Extra template variables
    pub vars: &'a Value,
}

/// State shared by every mixin implementation
#[derive(Debug, Clone, Default)]
pub struct MixinCore {
    /// Mixin name
    pub name: String,
    /// Merged data
    pub data: Value,
    /// File specs
    pub manifest: MixinManifest,
    /// Schema for `data`
    pub schema: Option<Value>,
    /// Template sources by name
    pub templates: IndexMap<String, String>,
    /// Directory the mixin was loaded from
    pub base_dir: Option<PathBuf>,
}

impl MixinCore {
    /// A data-only core
    pub fn data_only(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
            ..Default::default()
        }
    }

    /// Load manifest, schema and templates from a mixin directory
    ///
    /// A missing or broken manifest or schema is only a warning.
    pub fn from_dir(name: impl Into<String>, data: Value, dir: &Path) -> Result<Self> {
        let name = name.into();
        let manifest = MixinManifest::load(dir).unwrap_or_else(|e| {
            warn!("Unable to load mixin.yaml for mixin '{}': {}", name, e);
            MixinManifest::default()
        });

        let schema_path = dir.join("schema.yaml");
        let schema = if schema_path.is_file() {
            match parser::read_file(&schema_path).and_then(|s| parser::parse_yaml(&s)) {
                Ok(schema) => Some(schema),
                Err(e) => {
                    warn!("Unable to load schema for mixin '{}': {}", name, e);
                    None
                }
            }
        } else {
            None
        };

        let mut templates = IndexMap::new();
        let template_dir = dir.join("templates");
        if template_dir.is_dir() {
            let mut entries = std::fs::read_dir(&template_dir)?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_file())
                .collect::<Vec<_>>();
            entries.sort();
            for path in entries {
                let Some(file) = path.file_name().map(|f| f.to_string_lossy().to_string()) else {
                    continue;
                };
                let key = file.strip_suffix(".hbs").unwrap_or(&file).to_string();
                templates.insert(key, std::fs::read_to_string(&path)?);
            }
        }
        debug!(
            "Loaded mixin '{}' from {} ({} template(s))",
            name,
            dir.display(),
            templates.len()
        );

        Ok(Self {
            name,
            data,
            manifest,
            schema,
            templates,
            base_dir: Some(dir.to_path_buf()),
        })
    }

    /// Built-in core from embedded manifest, schema and templates
    pub fn embedded(
        name: impl Into<String>,
        data: Value,
        manifest: &str,
        schema: Option<&str>,
        templates: &[(&str, &str)],
    ) -> Result<Self> {
        let name = name.into();
        let origin = PathBuf::from(format!("<builtin {}>/mixin.yaml", name));
        let manifest = MixinManifest::parse(manifest, &origin)?;
        let schema = schema
            .map(|s| {
                parser::parse_yaml(s).map_err(|e| Error::Parse {
                    path: PathBuf::from(format!("<builtin {}>/schema.yaml", name)),
                    reason: e.to_string(),
                })
            })
            .transpose()?;
        Ok(Self {
            name,
            data,
            manifest,
            schema,
            templates: templates
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            base_dir: None,
        })
    }

    /// Schema violations of the current data, prefixed with the mixin name
    pub fn schema_violations(&self) -> Vec<String> {
        match &self.schema {
            Some(schema) => parser::validate_against(schema, &self.data)
                .into_iter()
                .map(|v| format!("{}: {}", self.name, v))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Render `template` for `target` and record it in the plan
    pub fn action<'p>(
        &self,
        cx: &ActionContext<'p>,
        kind: ActionKind,
        target: &ServerContext,
        template: &str,
    ) -> Result<ActionHandle<'p>> {
        let source = self
            .templates
            .get(template)
            .ok_or_else(|| Error::TemplateNotFound {
                mixin: self.name.clone(),
                template: template.to_string(),
            })?;
        let spec = self.manifest.file(template);
        let context = json!({
            "data": self.data,
            "params": cx.params,
            "target": target,
            "vars": cx.vars,
        });
        let local = cx.renderer.cook(
            template,
            source,
            &context,
            Some(&target.id),
            spec.outfile_for(template),
            true,
        )?;
        Ok(cx
            .plan
            .schedule(&target.id, ScheduledAction::new(&self.name, template, kind, spec, local)))
    }
}

/// Capability interface of every mixin
pub trait Mixin: Send + Sync {
    /// Shared state
    fn core(&self) -> &MixinCore;

    /// Shared state, mutably
    fn core_mut(&mut self) -> &mut MixinCore;

    /// Mixin name
    fn name(&self) -> &str {
        &self.core().name
    }

    /// Merged data
    fn data(&self) -> &Value {
        &self.core().data
    }

    /// True when the mixin only contributes data
    fn is_data_only(&self) -> bool {
        self.core().templates.is_empty()
    }

    /// Scoped mutation of the mixin's data before use
    fn configure(&mut self, f: &mut dyn FnMut(&mut Value)) {
        f(&mut self.core_mut().data)
    }

    /// Problems with the current data; empty when valid
    fn validate(&self) -> Vec<String> {
        self.core().schema_violations()
    }

    /// Record this mixin's actions for one server
    ///
    /// The default schedules every manifest entry that has a template.
    fn schedule(&self, cx: &ActionContext<'_>, target: &ServerContext) -> Result<usize> {
        let core = self.core();
        let mut scheduled = 0;
        for (template, spec) in &core.manifest.files {
            if core.templates.contains_key(template) {
                core.action(cx, spec.action, target, template)?;
                scheduled += 1;
            }
        }
        Ok(scheduled)
    }
}

/// A mixin that only carries data
#[derive(Debug, Clone)]
pub struct DataMixin {
    core: MixinCore,
}

impl DataMixin {
    /// Wrap data under `name`
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            core: MixinCore::data_only(name, data),
        }
    }
}

impl Mixin for DataMixin {
    fn core(&self) -> &MixinCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut MixinCore {
        &mut self.core
    }

    fn schedule(&self, _cx: &ActionContext<'_>, _target: &ServerContext) -> Result<usize> {
        Ok(0)
    }
}

/// A mixin loaded from a user directory
#[derive(Debug, Clone)]
pub struct ScriptMixin {
    core: MixinCore,
}

impl ScriptMixin {
    /// Load from `dir`
    pub fn load(name: impl Into<String>, data: Value, dir: &Path) -> Result<Self> {
        Ok(Self {
            core: MixinCore::from_dir(name, data, dir)?,
        })
    }
}

impl Mixin for ScriptMixin {
    fn core(&self) -> &MixinCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut MixinCore {
        &mut self.core
    }
}
