//! `fleet` provisions servers, stacks and their volumes from an inventory

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

mod commands;
mod context;
mod exit;
mod prompt;

use context::Context;
use fleet_orchestration::RunSummary;

#[derive(Parser)]
#[command(name = "fleet")]
#[command(about = "Fleet - provision cloud servers from a scoped inventory")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Options every command accepts
#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Settings file
    #[arg(long, global = true)]
    pub settings: Option<PathBuf>,

    /// Inventory file (default: from settings)
    #[arg(short, long, global = true)]
    pub inventory: Option<PathBuf>,

    /// Overrides: '/path/to/key=value' or '%mixin/key=value', ';'-separated
    #[arg(short = 'o', long = "override", global = true)]
    pub overrides: Vec<String>,

    /// Print debug output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Route provider calls to an in-memory provider and record remote commands
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Assume yes for every confirmation
    #[arg(short, long, global = true)]
    pub yes: bool,

    /// Stop after the phase with this number
    #[arg(long, global = true)]
    pub checkpoint: Option<usize>,

    /// Servers handled concurrently per phase
    #[arg(long, global = true)]
    pub batch_size: Option<usize>,

    /// knife configuration file
    #[arg(long, global = true)]
    pub knife_config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage servers
    Server {
        #[command(subcommand)]
        command: commands::server::ServerCommands,
    },

    /// Manage stacks
    Stack {
        #[command(subcommand)]
        command: commands::stack::StackCommands,
    },

    /// Restore servers' volumes from snapshots
    Restore(commands::restore::RestoreArgs),

    /// Snapshot servers' durable volumes
    Snapshot(commands::snapshot::SnapshotArgs),

    /// Manage volumes
    Volume {
        #[command(subcommand)]
        command: commands::volume::VolumeCommands,
    },

    /// Inspect the inventory
    Config {
        #[command(subcommand)]
        command: commands::config::ConfigCommands,
    },
}

fn init_tracing(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(level)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.global.verbose);

    let summary = Arc::new(RunSummary::new());
    let result = smol::block_on(async {
        let context = Context::load(cli.global.clone(), summary.clone())?;
        match cli.command {
            Commands::Server { command } => commands::server::run(&context, command).await,
            Commands::Stack { command } => commands::stack::run(&context, command).await,
            Commands::Restore(args) => commands::restore::run(&context, args).await,
            Commands::Snapshot(args) => commands::snapshot::run(&context, args).await,
            Commands::Volume { command } => commands::volume::run(&context, command).await,
            Commands::Config { command } => commands::config::run(&context, command),
        }
    });

    if !summary.is_empty() {
        eprintln!("{}", summary);
    }
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = exit::exit_code(&e);
            if code == exit::USER_ABORT {
                info!("{}", e);
            } else {
                error!("{:#}", e);
            }
            ExitCode::from(code)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commands::{server::ServerCommands, volume::VolumeCommands};

    #[test]
    fn test_server_create_flags() {
        let cli = Cli::try_parse_from([
            "fleet", "server", "create", "ame1.dev", "-p", "ms", "-n", "2", "--ebs", "50,100", "--checkpoint", "3",
        ])
        .unwrap();
        assert_eq!(cli.global.checkpoint, Some(3));
        let Commands::Server {
            command: ServerCommands::Create { target, profile, create },
        } = cli.command
        else {
            panic!("expected server create");
        };
        assert_eq!(target, "ame1.dev");
        assert_eq!(profile, "ms");
        assert_eq!(create.count, Some(2));
        assert_eq!(create.ebs, vec![50, 100]);
    }

    #[test]
    fn test_restore_needs_one_target() {
        assert!(Cli::try_parse_from(["fleet", "restore", "ame1.dev"]).is_err());
        assert!(Cli::try_parse_from(["fleet", "restore", "ame1.dev", "--hosts", "ms", "--stack", "db"]).is_err());
        assert!(Cli::try_parse_from(["fleet", "restore", "ame1.dev", "--stack", "db", "--delete"]).is_ok());
    }

    #[test]
    fn test_volume_create_needs_one_size() {
        assert!(Cli::try_parse_from(["fleet", "volume", "create", "ame1.dev", "ms101"]).is_err());
        assert!(
            Cli::try_parse_from(["fleet", "volume", "create", "ame1.dev", "ms101", "-p", "50", "-t", "10"]).is_err()
        );
        let cli = Cli::try_parse_from(["fleet", "volume", "create", "ame1.dev", "ms101", "--temp", "10"]).unwrap();
        let Commands::Volume {
            command: VolumeCommands::Create { perm, temp, .. },
        } = cli.command
        else {
            panic!("expected volume create");
        };
        assert_eq!((perm, temp), (None, Some(10)));
        assert!(Cli::try_parse_from(["fleet", "volume", "attach", "ame1.dev", "ms101", "--no-mount"]).is_ok());
    }

    #[test]
    fn test_server_list_target_or_env() {
        assert!(Cli::try_parse_from(["fleet", "server", "list"]).is_err());
        assert!(Cli::try_parse_from(["fleet", "server", "list", "ame1.dev", "ms"]).is_ok());
        let cli = Cli::try_parse_from(["fleet", "server", "list", "-e", "prod", "ms"]).unwrap();
        let Commands::Server {
            command: ServerCommands::List { target, filter, env },
        } = cli.command
        else {
            panic!("expected server list");
        };
        assert_eq!(target.as_deref(), Some("ms"));
        assert_eq!(filter, None);
        assert_eq!(env.as_deref(), Some("prod"));
        assert!(Cli::try_parse_from(["fleet", "server", "show", "ame1.dev", "ms101"]).is_ok());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["fleet", "snapshot", "ame1.dev", "ms", "--dry-run", "-y"]).unwrap();
        assert!(cli.global.dry_run);
        assert!(cli.global.yes);
    }
}
