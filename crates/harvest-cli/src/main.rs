use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use harvest_core::BatchStatus;
use harvest_sync::{build_scheduler, maybe_build_scheduler, status_message, HarvestRuntime};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "harvest")]
#[command(about = "Company harvest command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// One fresh harvest run.
    Run,
    /// Relaunch the latest failed run of the last day, or run fresh.
    Recover,
    /// Run the cron triggers until Ctrl-C.
    Schedule,
    /// REST trigger surface, plus cron triggers when HARVEST_SCHEDULER_ENABLED is set.
    Serve,
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("harvest=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let runtime = HarvestRuntime::from_env().await?;
            let status = runtime.coordinator.run_now().await?;
            println!("{}", status_message(status));
            if status != BatchStatus::Completed {
                bail!("harvest run ended {status}");
            }
        }
        Commands::Recover => {
            let runtime = HarvestRuntime::from_env().await?;
            match runtime.coordinator.recover_or_run().await {
                Some(execution) => println!("{}", status_message(execution.status)),
                None => bail!("recover-or-run did not launch a run"),
            }
        }
        Commands::Schedule => {
            let runtime = HarvestRuntime::from_env().await?;
            let mut sched = build_scheduler(
                runtime.coordinator.clone(),
                &runtime.config.run_cron,
                &runtime.config.recover_cron,
            )
            .await?;
            sched.start().await.context("starting scheduler")?;
            info!(
                run_cron = %runtime.config.run_cron,
                recover_cron = %runtime.config.recover_cron,
                "scheduler running; Ctrl-C to stop"
            );
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            runtime.stop_signal().request_stop();
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Serve => {
            let runtime = HarvestRuntime::from_env().await?;
            let mut sched = maybe_build_scheduler(&runtime.config, runtime.coordinator.clone()).await?;
            if let Some(sched) = &sched {
                sched.start().await.context("starting scheduler")?;
            }
            harvest_web::serve(&runtime).await?;
            if let Some(sched) = sched.as_mut() {
                if let Err(err) = sched.shutdown().await {
                    warn!(error = %err, "scheduler did not shut down cleanly");
                }
            }
        }
        Commands::Migrate => {
            harvest_sync::migrate_from_env().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
