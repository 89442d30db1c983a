use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use harvest_sync::{HarvestConfig, HarvestRuntime, Startup, SyncOp, TriggerResult};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "harvest-cli")]
#[command(about = "Commenter harvest command-line interface")]
struct Cli {
    /// Discard any saved snapshot and start from the current feed.
    #[arg(long, global = true)]
    reinit: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one harvest cycle.
    Cycle,
    Status,
    /// Clear the cooldown and move the watermark to the newest post.
    Reset,
    Serve,
    FlushPrimary,
    FlushArchive,
    ArchivePrimary,
    Backup,
    /// Bulk-load an append log into the buffer tier.
    IngestLog { path: Option<PathBuf> },
    /// Extract profiles for explicit identities.
    Harvest {
        #[arg(required = true)]
        identities: Vec<String>,
    },
    /// Extract profiles for the accounts suggested as similar to one identity.
    HarvestSimilar { identity: String },
    /// Extract profiles for the identities listed in a file, one per line.
    HarvestFile { path: PathBuf },
    Query {
        #[arg(required = true)]
        identities: Vec<String>,
        /// Report presence only.
        #[arg(long)]
        found: bool,
    },
    Stats,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("harvest=info".parse()?))
        .init();

    let cli = Cli::parse();
    let startup = if cli.reinit {
        Startup::Reinitialize
    } else {
        Startup::Resume
    };
    let runtime = HarvestRuntime::from_config(HarvestConfig::load()?, startup).await?;
    info!(data_dir = %runtime.config.data_dir.display(), ?startup, "harvest runtime ready");
    let controller = runtime.controller.clone();

    match cli.command.unwrap_or(Commands::Cycle) {
        Commands::Cycle => {
            let result = controller.run_now().await;
            print_json(&result)?;
            if let TriggerResult::Failed { error } = result {
                anyhow::bail!("cycle failed: {error}");
            }
        }
        Commands::Status => print_json(&controller.status().await?)?,
        Commands::Reset => print_json(&controller.reset_cooldown().await?)?,
        Commands::Serve => {
            controller.start().await?;
            harvest_web::serve(runtime).await?;
        }
        Commands::FlushPrimary => print_json(&controller.sync(SyncOp::FlushPrimary).await?)?,
        Commands::FlushArchive => print_json(&controller.sync(SyncOp::FlushArchive).await?)?,
        Commands::ArchivePrimary => print_json(&controller.sync(SyncOp::ArchivePrimary).await?)?,
        Commands::Backup => print_json(&controller.sync(SyncOp::Backup).await?)?,
        Commands::IngestLog { path } => {
            print_json(&controller.load_log(path.as_deref()).await?)?
        }
        Commands::Harvest { identities } => {
            print_json(&controller.harvest_accounts(identities).await?)?
        }
        Commands::HarvestSimilar { identity } => {
            print_json(&controller.harvest_similar(&identity).await?)?
        }
        Commands::HarvestFile { path } => {
            print_json(&controller.harvest_accounts_file(&path).await?)?
        }
        Commands::Query { identities, found } => {
            let identities = identities
                .into_iter()
                .map(|i| i.trim().to_string())
                .filter(|i| !i.is_empty())
                .collect::<BTreeSet<_>>();
            if found {
                print_json(&controller.query_found(&identities).await?)?
            } else {
                print_json(&controller.query(&identities).await?)?
            }
        }
        Commands::Stats => print_json(&controller.stats().await?)?,
    }

    Ok(())
}
