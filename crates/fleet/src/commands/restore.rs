use crate::context::Context;
use anyhow::Result;
use clap::Args;
use fleet_orchestration::{RestoreOptions, RestoreTarget};
use serde_json::Map;

#[derive(Args)]
pub struct RestoreArgs {
    /// NETWORK.SUBNETWORK
    target: String,

    /// Restore servers whose hostname starts with this prefix
    #[arg(long, required_unless_present = "stack", conflicts_with = "stack")]
    hosts: Option<String>,

    /// Restore every server of a stack
    #[arg(long)]
    stack: Option<String>,

    /// Subnetwork the snapshots were taken in (default: the target's)
    #[arg(long, value_name = "SUBNETWORK")]
    from: Option<String>,

    /// Only snapshots of this run version
    #[arg(long)]
    version: Option<String>,

    /// Recreate spot servers from the image they run now
    #[arg(long = "match")]
    matching: bool,

    /// Delete the superseded volumes
    #[arg(long)]
    delete: bool,

    /// Keep the superseded volumes' names
    #[arg(long)]
    no_rename: bool,
}

impl RestoreArgs {
    fn options(&self) -> RestoreOptions {
        let target = match (&self.hosts, &self.stack) {
            (_, Some(stack)) => RestoreTarget::Stack(stack.clone()),
            (hosts, None) => RestoreTarget::Hosts(hosts.clone().unwrap_or_default()),
        };
        let mut options = RestoreOptions::new(target);
        options.from = self.from.clone();
        options.version = self.version.clone();
        options.matching = self.matching;
        options.delete_old = self.delete;
        options.rename_old = !self.no_rename;
        options
    }
}

pub async fn run(context: &Context, args: RestoreArgs) -> Result<()> {
    let selection = context.selection(&args.target)?;
    let resolver = context.resolver(Map::new())?;
    let params = resolver.resolve(&selection, &[])?.params;
    let orchestrator = context.orchestrator(&params)?;

    let report = orchestrator.restore(&resolver, &selection, &args.options()).await?;
    for fqdn in &report.restored {
        println!("restored  {}", fqdn);
    }
    for fqdn in &report.recreated {
        println!("recreated {}", fqdn);
    }
    for volume in &report.deleted {
        println!("deleted   {}", volume);
    }
    Ok(())
}
