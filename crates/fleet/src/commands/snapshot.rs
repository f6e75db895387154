use crate::context::Context;
use anyhow::Result;
use clap::Args;
use serde_json::Map;

#[derive(Args)]
pub struct SnapshotArgs {
    /// NETWORK.SUBNETWORK
    target: String,

    /// Hostname prefix of the servers to snapshot
    filter: Option<String>,

    /// Report completion of the newest snapshots instead of taking new ones
    #[arg(long)]
    progress: bool,
}

pub async fn run(context: &Context, args: SnapshotArgs) -> Result<()> {
    let selection = context.selection(&args.target)?;
    let params = context.resolver(Map::new())?.resolve(&selection, &[])?.params;
    let orchestrator = context.orchestrator(&params)?;
    let filter = args.filter.as_deref();

    if args.progress {
        let progress = orchestrator.snapshot_progress(&params, filter).await?;
        println!("{} snapshot(s), {}% complete", progress.snapshots, progress.percent);
        return Ok(());
    }

    let report = orchestrator.snapshot(&params, filter).await?;
    println!(
        "{} snapshot(s) created at {} as version {}",
        report.snapshots.len(),
        report.created,
        report.version
    );
    for id in &report.snapshots {
        println!("  {}", id);
    }
    Ok(())
}
