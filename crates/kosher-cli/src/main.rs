use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kosher_sync::{summary_json, PipelineConfig, PipelineRuntime};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "kosher-cli")]
#[command(about = "Kosher restaurant directory ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// One extraction pass over the agency directory.
    Scrape {
        /// Resume at this listing page.
        #[arg(long, default_value_t = 1)]
        start_page: u32,
    },
    /// One quota-bounded hours refresh run.
    Refresh,
    /// Run scrape and refresh on their cron schedules until interrupted.
    Schedule,
    /// Print the canonical form of an hours string.
    Hours { text: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("kosher_sync=info".parse()?)
                .add_directive("kosher_adapters=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Scrape { start_page: 1 }) {
        Commands::Scrape { start_page } => {
            let runtime = PipelineRuntime::from_config(PipelineConfig::from_env()).await?;
            let summary = runtime.scrape_pipeline().run_from(start_page).await?;
            println!("{}", summary_json(&summary)?);
        }
        Commands::Refresh => {
            let runtime = PipelineRuntime::from_config(PipelineConfig::from_env()).await?;
            let summary = runtime.refresh_scheduler()?.run_once().await?;
            println!("{}", summary_json(&summary)?);
        }
        Commands::Schedule => {
            let mut config = PipelineConfig::from_env();
            config.scheduler_enabled = true;
            let runtime = Arc::new(PipelineRuntime::from_config(config).await?);
            let mut sched = runtime
                .maybe_build_scheduler()
                .await?
                .context("scheduler was not built")?;
            sched.start().await.context("starting scheduler")?;
            info!(
                scrape_cron = %runtime.config().scrape_cron,
                refresh_cron = %runtime.config().refresh_cron,
                "scheduler running"
            );
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Hours { text } => match kosher_core::normalize_hours(&text) {
            Some(canonical) => println!("{canonical}"),
            None => anyhow::bail!("could not parse hours: {text}"),
        },
    }

    Ok(())
}
