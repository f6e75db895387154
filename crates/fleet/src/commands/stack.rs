use super::server::CreateArgs;
use crate::context::Context;
use anyhow::Result;
use clap::Subcommand;
use tracing::info;

#[derive(Subcommand)]
pub enum StackCommands {
    /// Create every profile of a stack
    Create {
        /// NETWORK.SUBNETWORK
        target: String,

        /// Stack to create
        #[arg(short, long)]
        stack: String,

        #[command(flatten)]
        create: CreateArgs,
    },
}

pub async fn run(context: &Context, command: StackCommands) -> Result<()> {
    match command {
        StackCommands::Create { target, stack, create } => {
            let selection = create.select(context.selection(&target)?.with_stack(&stack));
            let resolver = context.resolver(create.params())?;
            let params = resolver.resolve(&selection, &[])?.params;
            let options = create.options(&resolver, &selection)?;
            let orchestrator = context.orchestrator(&params)?;

            let created = orchestrator.create_stack(&resolver, &selection, &options).await?;
            info!("Created {} server(s) for stack {}", created.len(), stack);
            super::print_servers(&created);
            Ok(())
        }
    }
}
