use crate::context::Context;
use anyhow::{Result, bail};
use clap::{Args, Subcommand};
use fleet_config::{ConfigError, ConfigResolver, Selection, overrides::parse_literal};
use fleet_orchestration::{
    CreateOptions, Error, VolumeSource, match_profile, workflows::create::CREATE_REQUIRED_MIXINS,
};
use serde_json::{Map, Value};
use tracing::info;

#[derive(Subcommand)]
pub enum ServerCommands {
    /// Launch and bootstrap servers of a profile
    Create {
        /// NETWORK.SUBNETWORK
        target: String,

        /// Profile to create
        #[arg(short, long)]
        profile: String,

        #[command(flatten)]
        create: CreateArgs,
    },

    /// Terminate servers and remove their config-management nodes
    Delete {
        /// NETWORK.SUBNETWORK
        target: String,

        /// Hostname prefix of the servers to delete
        filter: Option<String>,
    },

    /// List running and stopped servers
    List {
        /// NETWORK.SUBNETWORK, or the hostname prefix with --env
        #[arg(required_unless_present = "env")]
        target: Option<String>,

        /// Hostname prefix
        filter: Option<String>,

        /// List every subnetwork of this environment instead of one target
        #[arg(short, long, conflicts_with = "filter")]
        env: Option<String>,
    },

    /// Print one server and its volumes as JSON
    Show {
        /// NETWORK.SUBNETWORK
        target: String,

        /// Hostname
        hostname: String,
    },
}

/// Flags shared by server and stack creation
#[derive(Args, Debug, Clone, Default)]
pub struct CreateArgs {
    /// Number of servers
    #[arg(short = 'n', long)]
    pub count: Option<u32>,

    /// Hostname or hostname pattern such as 'web%02d'
    #[arg(long)]
    pub hostname: Option<String>,

    /// Instance type
    #[arg(long)]
    pub instance_type: Option<String>,

    /// Environment (default: the subnetwork's)
    #[arg(short, long)]
    pub environment: Option<String>,

    /// Launch this image id
    #[arg(long)]
    pub image: Option<String>,

    /// Launch the newest image of the ami family
    #[arg(long)]
    pub latest: bool,

    /// Launch the image family another profile's servers run
    #[arg(long = "match", value_name = "PROFILE")]
    pub match_profile: Option<String>,

    /// Image name prefix overriding the ami mixin's
    #[arg(long)]
    pub prefix: Option<String>,

    /// Sizes in GB for EBS devices declared without one, in declaration order
    #[arg(long, value_delimiter = ',')]
    pub ebs: Vec<u32>,

    /// Create volumes from the newest snapshots instead of empty ones
    #[arg(long, conflicts_with = "existing")]
    pub restore: bool,

    /// Subnetwork whose snapshots to restore (default: the target's)
    #[arg(long, value_name = "SUBNETWORK", requires = "restore")]
    pub from: Option<String>,

    /// Only snapshots of this run version
    #[arg(long, requires = "restore")]
    pub snapshot_version: Option<String>,

    /// Attach the existing volumes named after each server
    #[arg(long)]
    pub existing: bool,

    /// Give every server a public address
    #[arg(long)]
    pub associate_address: bool,

    /// Stop before configuration management
    #[arg(long)]
    pub skip_bootstrap: bool,

    /// Launch on demand even when a spot price is configured
    #[arg(long)]
    pub on_demand: bool,

    /// Extra template variable
    #[arg(long = "var", value_name = "KEY=VALUE")]
    pub vars: Vec<String>,
}

impl CreateArgs {
    /// Run parameters given as flags
    pub fn params(&self) -> Map<String, Value> {
        let mut params = Map::new();
        if let Some(count) = self.count {
            params.insert("count".into(), Value::from(count));
        }
        if let Some(hostname) = &self.hostname {
            params.insert("hostname".into(), Value::from(hostname.as_str()));
        }
        if let Some(instance_type) = &self.instance_type {
            params.insert("instance_type".into(), Value::from(instance_type.as_str()));
        }
        params
    }

    /// Apply `--environment` to a selection
    pub fn select(&self, selection: Selection) -> Selection {
        match &self.environment {
            Some(environment) => selection.with_environment(environment),
            None => selection,
        }
    }

    /// Workflow options for these flags
    pub fn options(&self, resolver: &ConfigResolver, selection: &Selection) -> Result<CreateOptions> {
        let mut options = CreateOptions {
            ebs_sizes: self.ebs.clone(),
            associate_address: self.associate_address,
            skip_bootstrap: self.skip_bootstrap,
            on_demand: self.on_demand,
            vars: self.vars()?,
            ..Default::default()
        };
        options.image.image_id = self.image.clone();
        options.image.latest = self.latest;
        options.image.prefix = self.prefix.clone();
        if let Some(profile) = &self.match_profile {
            options.image.matching = Some(match_profile(resolver, selection, profile)?);
        }
        options.volumes = if self.restore {
            VolumeSource::Snapshot {
                from: self.from.clone(),
                version: self.snapshot_version.clone(),
            }
        } else if self.existing {
            VolumeSource::Existing
        } else {
            VolumeSource::New
        };
        Ok(options)
    }

    fn vars(&self) -> Result<Value> {
        let mut vars = Map::new();
        for entry in &self.vars {
            let Some((key, value)) = entry.split_once('=') else {
                bail!("--var expects KEY=VALUE, got '{}'", entry);
            };
            vars.insert(key.trim().to_string(), parse_literal(value.trim()));
        }
        Ok(Value::Object(vars))
    }
}

pub async fn run(context: &Context, command: ServerCommands) -> Result<()> {
    match command {
        ServerCommands::Create {
            target,
            profile,
            create,
        } => {
            let selection = create.select(context.selection(&target)?.with_profile(&profile));
            let resolver = context.resolver(create.params())?;
            let config = resolver.resolve(&selection, CREATE_REQUIRED_MIXINS)?;
            let options = create.options(&resolver, &selection)?;
            let orchestrator = context.orchestrator(&config.params)?;

            let created = orchestrator.create_servers(&config, &options).await?;
            info!("Created {} server(s) of profile {}", created.len(), profile);
            super::print_servers(&created);
            Ok(())
        }
        ServerCommands::Delete { target, filter } => {
            let selection = context.selection(&target)?;
            let config = context.resolver(Map::new())?.resolve(&selection, &[])?;
            let orchestrator = context.orchestrator(&config.params)?;

            let deleted = orchestrator.delete_servers(&config.params, filter.as_deref()).await?;
            for fqdn in deleted {
                println!("deleted {}", fqdn);
            }
            Ok(())
        }
        ServerCommands::List { target, filter, env } => {
            let resolver = context.resolver(Map::new())?;
            let filter = if env.is_some() { target.clone() } else { filter };
            let subnetworks = match (&env, &target) {
                (Some(environment), _) => resolver.tree().subnetworks_in_environment(environment),
                (None, Some(target)) => {
                    let selection = context.selection(target)?;
                    let params = resolver.resolve(&selection, &[])?.params;
                    let subnetwork = params.require_subnetwork().map_err(ConfigError::from)?;
                    vec![(params.network.clone(), subnetwork.to_string())]
                }
                (None, None) => bail!("a target or --env is required"),
            };
            let Some((network, subnetwork)) = subnetworks.first() else {
                return Err(Error::NotFound(format!(
                    "subnetworks of environment {}",
                    env.as_deref().unwrap_or_default()
                ))
                .into());
            };
            let selection = context.selection(&format!("{}.{}", network, subnetwork))?;
            let params = resolver.resolve(&selection, &[])?.params;
            let orchestrator = context.orchestrator(&params)?;

            let servers = orchestrator.list_servers(&subnetworks, filter.as_deref()).await?;
            for server in &servers {
                println!(
                    "{:<40} {:<16} {:<12} {}",
                    server.fqdn(),
                    server.private_ip.as_deref().unwrap_or("-"),
                    server.instance_type,
                    server.state
                );
            }
            Ok(())
        }
        ServerCommands::Show { target, hostname } => {
            let selection = context.selection(&target)?;
            let params = context.resolver(Map::new())?.resolve(&selection, &[])?.params;
            let orchestrator = context.orchestrator(&params)?;

            let details = orchestrator.show_server(&params, &hostname).await?;
            println!("{}", serde_json::to_string_pretty(&details)?);
            Ok(())
        }
    }
}
