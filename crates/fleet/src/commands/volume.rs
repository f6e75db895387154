use crate::context::Context;
use anyhow::Result;
use clap::Subcommand;
use fleet_config::EffectiveConfig;
use fleet_orchestration::{Orchestrator, VolumeCreateOptions, VolumeDeleteOptions};
use serde_json::Map;
use tracing::debug;

#[derive(Subcommand)]
pub enum VolumeCommands {
    /// Create a volume for a running server, attach it and mount it
    Create {
        /// NETWORK.SUBNETWORK
        target: String,

        /// Hostname
        hostname: String,

        /// Size in GB of a volume kept when the server goes
        #[arg(short, long, value_name = "SIZE", required_unless_present = "temp", conflicts_with = "temp")]
        perm: Option<u32>,

        /// Size in GB of a volume deleted with the server
        #[arg(short, long, value_name = "SIZE")]
        temp: Option<u32>,

        /// Device, e.g. 'sdg' (default: the first free one from sdf)
        #[arg(long)]
        device: Option<String>,

        /// Mount point (default: the declared one, else /ebs or /ebs<letter>)
        #[arg(long)]
        mount: Option<String>,

        /// Profile whose volume mixin applies (default: the server's hosttype)
        #[arg(long)]
        profile: Option<String>,

        /// Attach without formatting or mounting
        #[arg(long)]
        no_mount: bool,
    },

    /// Attach the available volumes named after a running server
    Attach {
        /// NETWORK.SUBNETWORK
        target: String,

        /// Hostname
        hostname: String,

        /// Profile whose volume mixin applies (default: the server's hosttype)
        #[arg(long)]
        profile: Option<String>,

        /// Attach without mounting
        #[arg(long)]
        no_mount: bool,
    },

    /// Delete volumes by id or by the host they belong to
    Delete {
        /// NETWORK.SUBNETWORK
        target: String,

        /// Volume id
        #[arg(long = "id", required_unless_present = "hostname")]
        volume_id: Option<String>,

        /// Hostname whose volumes to delete
        #[arg(long)]
        hostname: Option<String>,

        /// Only these devices, e.g. 'sdf,sdg'
        #[arg(long = "device", value_delimiter = ',')]
        devices: Vec<String>,

        /// Detach attached volumes first
        #[arg(long)]
        detach: bool,

        /// Force the detach
        #[arg(long, requires = "detach")]
        force_detach: bool,
    },
}

/// Configuration of a host's profile and an orchestrator for its subnetwork
async fn host_config(
    context: &Context,
    target: &str,
    hostname: &str,
    profile: Option<String>,
) -> Result<(EffectiveConfig, Orchestrator)> {
    let selection = context.selection(target)?;
    let resolver = context.resolver(Map::new())?;
    let params = resolver.resolve(&selection, &[])?.params;
    let orchestrator = context.orchestrator(&params)?;
    let profile = match profile {
        Some(profile) => Some(profile),
        None => orchestrator
            .show_server(&params, hostname)
            .await?
            .server
            .tag("hosttype")
            .map(str::to_string),
    };
    let config = match profile {
        Some(profile) => {
            debug!("Using the volume mixin of profile {}", profile);
            resolver.resolve(&selection.with_profile(&profile), &[])?
        }
        None => resolver.resolve(&selection, &[])?,
    };
    Ok((config, orchestrator))
}

pub async fn run(context: &Context, command: VolumeCommands) -> Result<()> {
    match command {
        VolumeCommands::Create {
            target,
            hostname,
            perm,
            temp,
            device,
            mount,
            profile,
            no_mount,
        } => {
            let (config, orchestrator) = host_config(context, &target, &hostname, profile).await?;
            let options = VolumeCreateOptions {
                hostname,
                size: perm.or(temp).unwrap_or_default(),
                temp: temp.is_some(),
                device,
                mount,
                skip_mount: no_mount,
            };

            let volume = orchestrator.create_volume(&config, &options).await?;
            println!(
                "created {} at {}",
                volume.label(),
                volume.attached_device.as_deref().unwrap_or("-")
            );
            Ok(())
        }
        VolumeCommands::Attach {
            target,
            hostname,
            profile,
            no_mount,
        } => {
            let (config, orchestrator) = host_config(context, &target, &hostname, profile).await?;
            for volume in orchestrator.attach_volumes(&config, &hostname, no_mount).await? {
                println!(
                    "attached {} at {}",
                    volume.label(),
                    volume.attached_device.as_deref().unwrap_or("-")
                );
            }
            Ok(())
        }
        VolumeCommands::Delete {
            target,
            volume_id,
            hostname,
            devices,
            detach,
            force_detach,
        } => {
            let selection = context.selection(&target)?;
            let params = context.resolver(Map::new())?.resolve(&selection, &[])?.params;
            let orchestrator = context.orchestrator(&params)?;
            let options = VolumeDeleteOptions {
                volume_id,
                hostname,
                devices,
                detach,
                force_detach,
            };

            for id in orchestrator.delete_volumes(&params, &options).await? {
                println!("deleted {}", id);
            }
            Ok(())
        }
    }
}
