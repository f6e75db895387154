//! Everything a command needs before it can run a workflow

use crate::{GlobalArgs, prompt::TerminalConfirm};
use anyhow::{Context as _, Result, anyhow};
use fleet_config::{ConfigResolver, OverrideSet, RunParams, ScopeTree, Selection, Settings, parser};
use fleet_mixins::{MixinRegistry, Renderer};
use fleet_orchestration::{
    AssumeYes, AwsCliProvider, CloudProvider, ConfigManagement, Confirm, KnifeCli, MockProvider,
    NoopConfigManagement, Orchestrator, RunSummary,
    provider::{SubnetRecord, Tags},
};
use remote_shell::{RecordingShell, RemoteShell, SshTransport};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Settings, inventory and global flags of one invocation
pub struct Context {
    /// Global flags
    pub global: GlobalArgs,
    /// Tool settings
    pub settings: Settings,
    tree: ScopeTree,
    overrides: OverrideSet,
    summary: Arc<RunSummary>,
}

impl Context {
    /// Read settings and the inventory named by them or by `--inventory`
    pub fn load(global: GlobalArgs, summary: Arc<RunSummary>) -> Result<Self> {
        let settings = Settings::load(global.settings.as_deref())?;
        let inventory = global
            .inventory
            .clone()
            .or_else(|| settings.inventory.clone())
            .ok_or_else(|| anyhow!("No inventory given: pass --inventory or set `inventory` in the settings"))?;
        debug!("Reading inventory {}", inventory.display());
        let tree = parser::parse_file(&inventory)
            .with_context(|| format!("Failed to load inventory {}", inventory.display()))?;
        let overrides = OverrideSet::parse_all(&global.overrides)?;
        Ok(Self {
            global,
            settings,
            tree,
            overrides,
            summary,
        })
    }

    /// Parse a `NETWORK.SUBNETWORK` target
    pub fn selection(&self, target: &str) -> Result<Selection> {
        Ok(Selection::parse_target(target)?)
    }

    /// A resolver over the inventory, with `params` taking precedence over every scope
    pub fn resolver(&self, mut params: Map<String, Value>) -> Result<ConfigResolver> {
        if let Some(batch_size) = self.global.batch_size {
            params.insert("batch_size".into(), Value::from(batch_size));
        }
        Ok(ConfigResolver::new(&self.tree, &self.overrides)?
            .with_defaults(self.settings.to_params())
            .with_cli_params(params))
    }

    /// An orchestrator for a run resolved to `params`
    pub fn orchestrator(&self, params: &RunParams) -> Result<Orchestrator> {
        let (provider, shell, config_management) = if self.global.dry_run {
            self.dry_run_collaborators(params)
        } else {
            self.live_collaborators(params)
        };

        let mut registry = MixinRegistry::with_builtins()?;
        for dir in &self.settings.mixin_dirs {
            let loaded = registry
                .load_dir(dir)
                .with_context(|| format!("Failed to load mixins from {}", dir.display()))?;
            debug!("Loaded mixins {} from {}", loaded.join(", "), dir.display());
        }

        let confirm: Arc<dyn Confirm> = if self.global.yes {
            Arc::new(AssumeYes)
        } else {
            Arc::new(TerminalConfirm)
        };

        Ok(Orchestrator::new(provider, shell, config_management, registry, Renderer::new(self.script_dir()))
            .with_summary(self.summary.clone())
            .with_confirm(confirm)
            .with_checkpoint(self.global.checkpoint))
    }

    fn live_collaborators(
        &self,
        params: &RunParams,
    ) -> (Arc<dyn CloudProvider>, Arc<dyn RemoteShell>, Arc<dyn ConfigManagement>) {
        let region = Some(params.region.clone()).filter(|r| !r.is_empty());
        let provider = AwsCliProvider::new(region, self.settings.provider.profile.clone());
        let shell = SshTransport::new(&params.ssh_user)
            .with_port(params.ssh_port)
            .with_identity_file(params.identity_file.clone());
        (
            Arc::new(provider),
            Arc::new(shell),
            Arc::new(KnifeCli::new(self.global.knife_config.clone())),
        )
    }

    /// In-memory provider holding the selected subnet, recorded shell, no enrollment
    fn dry_run_collaborators(
        &self,
        params: &RunParams,
    ) -> (Arc<dyn CloudProvider>, Arc<dyn RemoteShell>, Arc<dyn ConfigManagement>) {
        info!("Dry run: no cloud resources will be touched");
        let provider = MockProvider::new();
        if let Some(subnetwork) = &params.subnetwork {
            provider.add_subnet(SubnetRecord {
                id: "subnet-dryrun".into(),
                cidr_block: "10.0.0.0/16".into(),
                availability_zone: params.availability_zone.clone(),
                tags: Tags::from([("Name".to_string(), format!("{}.{}", params.network, subnetwork))]),
            });
        }
        (
            Arc::new(provider),
            Arc::new(RecordingShell::new(&params.ssh_user)),
            Arc::new(NoopConfigManagement),
        )
    }

    fn script_dir(&self) -> PathBuf {
        self.settings
            .script_dir
            .clone()
            .or_else(|| dirs::cache_dir().map(|dir| dir.join("fleet").join("scripts")))
            .unwrap_or_else(|| std::env::temp_dir().join("fleet-scripts"))
    }
}
