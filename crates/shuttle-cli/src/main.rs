use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use shuttle_core::app::ReaperLoop;
use shuttle_core::config::DEFAULT_CONFIG_FILE;
use shuttle_core::domain::{ItemId, NewWorkItem, WorkerId};
use shuttle_core::typed::ExecutorFactories;
use shuttle_core::{App, ShuttleConfig, WorkerGroup};

#[derive(Parser)]
#[command(name = "shuttle")]
#[command(version, about = "Durable lease-based work queue and workflow engine")]
struct Cli {
    /// Config file; defaults apply when it does not exist
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Log as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run worker loops and the recovery ticker until Ctrl-C
    Run {
        #[arg(short, long, default_value = "1")]
        workers: usize,
    },
    /// Submit a root task (`workflow:<name>` starts a workflow)
    Submit {
        task_type: String,
        /// JSON input
        #[arg(short, long, default_value = "{}")]
        input: String,
        #[arg(long)]
        max_tries: Option<u32>,
    },
    /// Show the status of a task
    Status { id: String },
    /// Run one recovery sweep over expired leases
    Recover,
    /// List registered workflows
    Workflows,
    /// Show item counts per status
    Counts,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: &Path) -> Result<ShuttleConfig> {
    let mut config = ShuttleConfig::load_or_default(path)
        .with_context(|| format!("failed to load config {}", path.display()))?;
    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = load_config(&cli.config)?;
    let app = Arc::new(
        App::from_config(&config, &ExecutorFactories::builtin())
            .context("failed to initialise shuttle")?,
    );

    match cli.command {
        Commands::Run { workers } => {
            let base = config
                .worker
                .id
                .clone()
                .map(WorkerId::new)
                .unwrap_or_else(WorkerId::generate);
            tracing::info!(
                worker = %base,
                workers,
                database = %config.database.path.display(),
                "starting workers"
            );
            let group = WorkerGroup::spawn(Arc::clone(&app), &base, workers);

            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for ctrl-c")?;
            tracing::info!("shutdown requested, finishing in-flight items");
            group.shutdown_and_join().await;
        }
        Commands::Submit {
            task_type,
            input,
            max_tries,
        } => {
            let input: serde_json::Value =
                serde_json::from_str(&input).context("--input is not valid JSON")?;
            let item = NewWorkItem::task(task_type, input)
                .with_max_tries(max_tries.unwrap_or(config.worker.default_max_tries));
            let item = app.submit_item(item).await?;
            println!("{}", item.id);
        }
        Commands::Status { id } => {
            let id = ItemId::from_str(&id)?;
            let Some(status) = app.status(id).await? else {
                bail!("no work item {id}");
            };
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Recover => {
            let report = ReaperLoop::new(Arc::clone(&app)).sweep().await?;
            println!(
                "reset: {}, exhausted: {}",
                report.reset.len(),
                report.exhausted.len()
            );
        }
        Commands::Workflows => {
            for workflow in app.workflows.list_all() {
                let steps: Vec<&str> = workflow.steps.iter().map(|s| s.name()).collect();
                println!(
                    "{:<24} {:<22} max_iterations={} steps={}",
                    workflow.name,
                    workflow.coordination_type.as_str(),
                    workflow.max_iterations,
                    steps.join(" -> ")
                );
            }
        }
        Commands::Counts => {
            let counts = app.store.counts_by_status().await?;
            println!("{}", serde_json::to_string_pretty(&counts)?);
        }
    }

    Ok(())
}
