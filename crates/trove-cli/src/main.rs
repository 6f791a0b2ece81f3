use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use trove_core::TriggeredBy;
use trove_ingest::{
    build_daily_report, maybe_build_scheduler, AppConfig, CronRunner, FixedOffsetClock,
    HttpIngestionClient, IngestParams, IngestService,
};
use trove_storage::PgStore;
use trove_web::AppState;

#[derive(Debug, Parser)]
#[command(name = "trove-cli")]
#[command(about = "Trove command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion pass for a content kind.
    Ingest {
        #[arg(long, default_value = "image")]
        mode: String,
        /// Comma-separated explicit queries; synthesized when omitted.
        #[arg(long)]
        q: Option<String>,
        #[arg(long, default_value_t = 20)]
        per: usize,
        #[arg(long, default_value_t = 1)]
        pages: usize,
        #[arg(long)]
        days: Option<u32>,
        #[arg(long)]
        dry: bool,
    },
    /// Run one named cron job (`images`, `videos`, ..., or `nightly`).
    Cron { name: String },
    /// Serve the web API, with the scheduler when enabled.
    Serve,
    /// Print yesterday's rollup as JSON.
    Report,
    /// Apply store DDL.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = AppConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Ingest {
            mode,
            q,
            per,
            pages,
            days,
            dry,
        } => {
            let state = AppState::from_config(config).await?;
            let service = IngestService::new(
                state.config.clone(),
                state.content.clone(),
                state.http.clone(),
                state.dictionary.clone(),
            );
            let summary = service
                .run(&IngestParams {
                    mode,
                    per,
                    pages,
                    days,
                    q,
                    count: None,
                    dry,
                    playlist: None,
                    channel: None,
                    subreddit: None,
                })
                .await?;
            println!(
                "ingest complete: mode={} scanned={} unique={} inserted={} updated={} failed_calls={}",
                summary.mode,
                summary.scanned,
                summary.unique,
                summary.inserted,
                summary.updated,
                summary.failed_calls
            );
        }
        Commands::Cron { name } => {
            let state = AppState::from_config(config).await?;
            let runner = CronRunner::new(
                state.config.clone(),
                state.journal.clone(),
                Arc::new(HttpIngestionClient::new(state.http.clone())),
                state.dictionary.clone(),
            );
            let outcome = runner.run_job(&name, TriggeredBy::Manual, None).await;
            match &outcome.error {
                Some(error) => println!("cron {}: {} ({error})", outcome.name, outcome.status.as_str()),
                None => println!("cron {}: {}", outcome.name, outcome.status.as_str()),
            }
        }
        Commands::Serve => {
            let state = AppState::from_config(config.clone()).await?;
            let runner = Arc::new(CronRunner::new(
                state.config.clone(),
                state.journal.clone(),
                Arc::new(HttpIngestionClient::new(state.http.clone())),
                state.dictionary.clone(),
            ));
            if let Some(sched) = maybe_build_scheduler(&config, runner).await? {
                sched
                    .start()
                    .await
                    .map_err(|e| anyhow::anyhow!("starting scheduler: {e}"))?;
            }
            trove_web::serve(state, trove_web::port_from_env()).await?;
        }
        Commands::Report => {
            let state = AppState::from_config(config.clone()).await?;
            let clock = FixedOffsetClock::parse(&config.report_timezone)?;
            let report = build_daily_report(
                state.content.as_ref(),
                state.journal.as_ref(),
                state.usage.as_ref(),
                &clock,
                Utc::now(),
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url).await?;
            store.migrate().await?;
            println!("store migrations applied");
        }
    }

    Ok(())
}
