//! Signalforge CLI
//!
//! Submits single tasks through the pipeline and reports budget status.

use anyhow::Context;
use clap::{Parser, Subcommand};
use llm::remote::OpenAiCompatClient;
use llm::RemoteLlmConfig;
use signalforge::config::{ConfigLoader, SignalforgeConfig};
use signalforge::{
    BudgetLedger, BudgetStatus, JsonlUsageLog, Task, TaskPayload, TaskPipeline, TaskType,
    UsageRecorder,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "signalforge")]
#[command(about = "Signalforge - budgeted AI task orchestration", long_about = None)]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Load configuration from this file instead of the user/project locations
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit one task and print its outcome
    Submit {
        /// Task type: content, sentiment, hashtags, schedule
        task_type: TaskType,
        #[arg(long)]
        topic: Option<String>,
        #[arg(long)]
        text: Option<String>,
        #[arg(short, long)]
        platform: Option<String>,
        #[arg(long)]
        tone: Option<String>,
        /// Print the full outcome as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show daily and lifetime budget status
    Budget {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => {
            let mut config = ConfigLoader::load_from_path(path).await?;
            config.resolve_env_vars();
            config.apply_env_overrides(|key| std::env::var(key).ok());
            config.validate()?;
            config
        }
        None => ConfigLoader::new().load().await?,
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Submit {
            task_type,
            topic,
            text,
            platform,
            tone,
            json,
        } => {
            let payload = TaskPayload {
                topic,
                text,
                platform,
                tone,
                ..Default::default()
            };
            handle_submit(config, Task::new(task_type, payload), json).await
        }
        Commands::Budget { json } => handle_budget(config, json).await,
    }
}

async fn seeded_ledger(config: &SignalforgeConfig) -> anyhow::Result<(BudgetLedger, Option<Arc<JsonlUsageLog>>)> {
    let Some(path) = config.usage.log_path.as_ref() else {
        return Ok((BudgetLedger::new(config.budget.clone()), None));
    };

    let log = Arc::new(JsonlUsageLog::new(path));
    let totals = log
        .load_totals(chrono::Utc::now().date_naive())
        .await
        .with_context(|| format!("reading usage log {}", path))?;
    info!(
        path = %path,
        daily_tokens = totals.daily_tokens,
        lifetime_tokens = totals.lifetime_tokens,
        "Seeded budget from usage log"
    );
    let ledger = BudgetLedger::with_totals(
        config.budget.clone(),
        totals.daily_tokens,
        totals.lifetime_tokens,
    );
    Ok((ledger, Some(log)))
}

async fn handle_submit(config: SignalforgeConfig, task: Task, json: bool) -> anyhow::Result<()> {
    let provider_config = match config.provider.api_key.clone() {
        Some(key) => RemoteLlmConfig::new(key, &config.provider.base_url, &config.provider.model),
        None => RemoteLlmConfig::from_env(
            &config.provider.api_key_env,
            &config.provider.base_url,
            &config.provider.model,
        )?,
    }
    .with_timeout(Duration::from_secs(config.provider.request_timeout_secs));
    let provider = Arc::new(OpenAiCompatClient::new(provider_config)?);

    let (ledger, log) = seeded_ledger(&config).await?;
    let mut builder = TaskPipeline::builder()
        .config(config)
        .provider(provider)
        .ledger(ledger);
    if let Some(log) = log {
        builder = builder.recorder(log as Arc<dyn UsageRecorder>);
    }
    let pipeline = builder.build()?;

    let outcome = pipeline.submit(task).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        println!("Status: {}", outcome.status);
        println!("Result: {}", serde_json::to_string_pretty(&outcome.result)?);
        println!("Tokens: {}", outcome.tokens_used);
        if let Some(diagnostics) = &outcome.diagnostics {
            println!("Diagnostics: {}", diagnostics);
        }
        println!("{}", pipeline.budget_status().message());
    }
    Ok(())
}

async fn handle_budget(config: SignalforgeConfig, json: bool) -> anyhow::Result<()> {
    let (ledger, _) = seeded_ledger(&config).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&ledger.snapshot())?);
        return Ok(());
    }

    let rows: [(&str, BudgetStatus); 2] = [
        ("daily", ledger.status()),
        ("lifetime", ledger.lifetime_status()),
    ];
    println!("{:<10} {:>12} {:>12} {:>12}  {}", "Scope", "Used", "Limit", "Remaining", "Status");
    println!("{}", "-".repeat(72));
    for (scope, status) in rows {
        let limit = if status.limit == 0 {
            "unlimited".to_string()
        } else {
            status.limit.to_string()
        };
        let remaining = if status.limit == 0 {
            "-".to_string()
        } else {
            status.remaining.to_string()
        };
        println!(
            "{:<10} {:>12} {:>12} {:>12}  {}",
            scope,
            status.used,
            limit,
            remaining,
            status.message()
        );
    }
    Ok(())
}
