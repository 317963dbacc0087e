mod config;
mod error;
mod layers;
mod pipeline;
mod run;
mod scheduler;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use dotenvy::dotenv;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::{AdapterConfig, PipelineConfig};
use crate::layers::delivery::{test_digest, FileOutbox, MailClient};
use crate::layers::discovery::OpenAlexClient;
use crate::layers::llm::OpenAiClient;
use crate::layers::retry::TokioDelay;
use crate::pipeline::Pipeline;
use crate::run::RunHistory;
use crate::scheduler::{daily_window, DailySchedule, RunScheduler};

#[derive(Parser, Debug)]
#[command(name = "paper-digest", version, about = "Daily relevance-filtered paper digest")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the pipeline once and exit.
    Run(RunArgs),
    /// Stay up and run once a day at the configured time.
    Daemon {
        #[arg(long, help = "Also run once right away for the default window")]
        run_immediately: bool,
    },
    /// Send a fixed test message through the configured mailer.
    SendTest,
    /// List past runs from the history file, newest last.
    History {
        #[arg(long, default_value_t = 20, help = "How many runs to show")]
        limit: usize,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(long, help = "First publication date (YYYY-MM-DD)")]
    from: Option<NaiveDate>,
    #[arg(long, help = "Last publication date (YYYY-MM-DD), defaults to yesterday")]
    to: Option<NaiveDate>,
    #[arg(long, help = "Days to look back when --from is not given")]
    days_back: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // 0. Load Configuration
    dotenv().ok();

    // Auto-create .env if it doesn't exist (copy from .env.example)
    if !std::path::Path::new(".env").exists() && std::path::Path::new(".env.example").exists() {
        std::fs::copy(".env.example", ".env")?;
        dotenv().ok();
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    let cli = Cli::parse();
    let adapters = AdapterConfig::from_env().context("invalid adapter configuration")?;
    let mailer: Arc<dyn MailClient> = Arc::new(FileOutbox::new(&adapters.outbox_dir));

    match cli.command {
        Commands::SendTest => {
            mailer.send(&test_digest()).await.context("test message failed")?;
            info!("Test message delivered to {:?}", adapters.outbox_dir);
        }
        Commands::History { limit } => {
            let records = RunHistory::new(&adapters.history_path).load().await?;
            if records.is_empty() {
                println!("No runs recorded in {:?}", adapters.history_path);
            }
            for record in records.iter().skip(records.len().saturating_sub(limit)) {
                println!("{}", record.summary());
            }
        }
        Commands::Run(args) => {
            let config = PipelineConfig::from_env().context("invalid pipeline configuration")?;
            let scheduler = build_scheduler(&config, &adapters, mailer)?;

            let today = config.timezone.today();
            let default = daily_window(today, args.days_back.unwrap_or(config.days_back));
            let from = args.from.unwrap_or(default.from);
            let to = args.to.unwrap_or(default.to);

            let record = scheduler.trigger_range(from, to).await?;
            info!("{}", record.summary());
            if record.failed() {
                bail!(
                    "run {} failed: {}",
                    record.run_id(),
                    record.terminal_error().unwrap_or("unknown error")
                );
            }
        }
        Commands::Daemon { run_immediately } => {
            let config = PipelineConfig::from_env().context("invalid pipeline configuration")?;
            let scheduler = build_scheduler(&config, &adapters, mailer)?;

            let schedule = DailySchedule {
                at: config.trigger_time,
                days_back: config.days_back,
                zone: config.timezone,
                run_immediately,
            };
            let mut daily = {
                let scheduler = scheduler.clone();
                tokio::spawn(async move { scheduler.run_daily(schedule).await })
            };

            let stopped_early = tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    res?;
                    false
                }
                res = &mut daily => {
                    res.context("daily schedule crashed")?;
                    true
                }
            };
            if stopped_early {
                bail!("daily schedule stopped unexpectedly");
            }
            scheduler.shutdown();
            daily.await?;

            match scheduler.last_run() {
                Some(record) => info!("Stopped in state {:?}; last run: {}", scheduler.state(), record.summary()),
                None => info!("Stopped in state {:?}; no runs this session", scheduler.state()),
            }
        }
    }

    Ok(())
}

fn build_scheduler(
    config: &PipelineConfig,
    adapters: &AdapterConfig,
    mailer: Arc<dyn MailClient>,
) -> Result<Arc<RunScheduler>> {
    info!(
        "Keywords: {:?}, thresholds: relevance {} / summarize {}",
        config.research_keywords, config.relevance_threshold, config.summarize_threshold
    );
    let source = Arc::new(OpenAlexClient::new(
        adapters.openalex_api_url.clone(),
        adapters.openalex_email.clone(),
        adapters.http_timeout,
    ));
    let llm = Arc::new(OpenAiClient::new(adapters.llm_settings()?));
    let pipeline = Arc::new(Pipeline::new(config, source, llm, Arc::new(TokioDelay), mailer));
    Ok(Arc::new(RunScheduler::new(
        pipeline,
        Some(RunHistory::new(&adapters.history_path)),
    )))
}
