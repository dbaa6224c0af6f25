use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cli;
mod preview;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create or update the preview environment of a branch
    #[command(visible_alias = "p")]
    Provision(cli::provision::ProvisionArgs),
    /// Delete one preview environment
    #[command(visible_alias = "rm")]
    Delete(cli::delete::DeleteArgs),
    /// Delete stale preview environments and orphaned certificates and load balancers
    Sweep {
        /// Only log what would be deleted
        #[arg(long)]
        dry_run: bool,
    },
    /// Show the environment name, namespaces and domains a branch maps to
    Name {
        branch: String,
    },
    /// Check configuration for errors and unused options
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Provision(args) => cli::provision::provision(args).await,
        Commands::Delete(args) => cli::delete::delete(args).await,
        Commands::Sweep { dry_run } => cli::sweep::sweep(dry_run).await,
        Commands::Name { branch } => cli::check::show_name(&branch),
        Commands::CheckConfig => cli::check::check_config(),
    }
}
