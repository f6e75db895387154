use crate::context::Context;
use anyhow::Result;
use clap::Subcommand;
use serde_json::Map;

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration of a selection
    Show {
        /// NETWORK.SUBNETWORK
        target: String,

        /// Profile
        #[arg(short, long)]
        profile: Option<String>,

        /// Stack
        #[arg(short, long)]
        stack: Option<String>,

        /// Environment (default: the subnetwork's)
        #[arg(short, long)]
        environment: Option<String>,

        /// Print JSON instead of YAML
        #[arg(long)]
        json: bool,
    },

    /// Check the inventory and list its subnetworks
    Validate,
}

pub fn run(context: &Context, command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Show {
            target,
            profile,
            stack,
            environment,
            json,
        } => {
            let mut selection = context.selection(&target)?;
            selection.profile = profile;
            selection.stack = stack;
            selection.environment = environment;
            let config = context.resolver(Map::new())?.resolve(&selection, &[])?;
            if json {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                print!("{}", config.to_yaml()?);
            }
            Ok(())
        }
        ConfigCommands::Validate => {
            let resolver = context.resolver(Map::new())?;
            let tree = resolver.tree();
            let organization = tree.organization()?;
            println!("✓ Inventory valid");
            println!("  Organization: {} ({})", organization.key, tree.domain().unwrap_or("-"));
            let subnetworks = tree.subnetworks();
            println!("  Subnetworks: {}", subnetworks.len());
            for (region, network, subnetwork) in subnetworks {
                println!("    {}.{} ({})", network, subnetwork, region);
            }
            Ok(())
        }
    }
}
