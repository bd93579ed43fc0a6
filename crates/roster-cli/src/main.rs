use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use roster_sync::{SyncConfig, SyncRuntime};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "roster-cli")]
#[command(about = "Employee schedule sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync now and record it in the run log.
    Sync,
    /// Apply database migrations to the target database.
    Migrate,
    /// Start the scheduler and the admin HTTP API.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("roster_sync=info".parse().context("log directive")?)
                .add_directive("roster_web=info".parse().context("log directive")?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Sync => {
            let entry = roster_sync::run_sync_once_from_env().await?;
            let run = &entry.run;
            println!(
                "sync complete: log_id={} run_id={} total={} updated={} inserted={} unchanged={}",
                entry.id, run.run_id, run.total, run.updated, run.inserted, run.unchanged
            );
            for line in &run.details_updated {
                println!("updated  {line}");
            }
            for line in &run.details_inserted {
                println!("inserted {line}");
            }
        }
        Commands::Migrate => {
            let runtime = SyncRuntime::connect(SyncConfig::from_env()?).await?;
            runtime.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve => roster_web::serve_from_env().await?,
    }

    Ok(())
}
