mod dry_run;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::{CommandFactory, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use goalflow_core::config::{AppConfig, TaskDefaults};
use goalflow_core::goal::Goal;
use goalflow_core::types::Priority;
use goalflow_core::workflow::Workflow;
use goalflow_engine::templates::{self, TemplateKind};
use goalflow_engine::Orchestrator;

#[derive(Parser)]
#[command(name = "goalflow", version, about = "Goal-driven workflow orchestration engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "goalflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a workflow from a template and run it against dry-run agents
    Run {
        /// Template: arbitrage, yield_optimization, portfolio_rebalance,
        /// sentiment_trading, generic
        template: TemplateKind,
        /// Goal description
        #[arg(long, short)]
        description: String,
        /// Metric the goal optimises
        #[arg(long, default_value = "score")]
        target_metric: String,
        /// Value of the metric that counts as success
        #[arg(long, default_value_t = 1.0)]
        target_value: f64,
        /// Goal constraint as key=value (value parsed as JSON, else string)
        #[arg(long = "constraint", value_parser = parse_constraint)]
        constraints: Vec<(String, serde_json::Value)>,
        /// Goal priority (low, normal, high, critical)
        #[arg(long, default_value = "normal")]
        priority: Priority,
        /// Owner recorded on the workflow
        #[arg(long, default_value = "cli")]
        user: String,
        /// Simulated latency of each dry-run agent call
        #[arg(long, default_value_t = 50)]
        latency_ms: u64,
        /// Cron schedule to attach (6 fields, seconds first)
        #[arg(long)]
        schedule: Option<String>,
    },
    /// List workflow templates and their task graphs
    Templates,
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

fn parse_constraint(s: &str) -> Result<(String, serde_json::Value), String> {
    let (key, raw) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", s))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty constraint key in '{}'", s));
    }
    let value = serde_json::from_str(raw.trim())
        .unwrap_or_else(|_| serde_json::Value::String(raw.trim().to_string()));
    Ok((key.to_string(), value))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "goalflow", &mut std::io::stdout());
        return Ok(());
    }

    let loaded = if cli.config.exists() {
        Some(AppConfig::load(&cli.config)?)
    } else {
        None
    };
    let config = loaded.clone().unwrap_or_default();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log.filter)),
        )
        .with_target(false)
        .init();

    if loaded.is_none() {
        warn!(path = %cli.config.display(), "Config file not found, using defaults");
    }

    match cli.command {
        Commands::Completions { .. } => unreachable!("handled before config load"),
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Templates => print_templates(&config.tasks),
        Commands::Run {
            template,
            description,
            target_metric,
            target_value,
            constraints,
            priority,
            user,
            latency_ms,
            schedule,
        } => {
            let goal = Goal::new(description, target_metric, target_value)
                .with_constraints(constraints.into_iter().collect())
                .with_priority(priority);
            let mut workflow = templates::build(template, goal, &user, &config.tasks);
            if let Some(expr) = schedule {
                workflow = workflow.with_schedule(expr)?;
                if let Some(next) = workflow.next_run_after(Utc::now()) {
                    info!(next_run = %next, "Schedule attached; this run starts now");
                }
            }
            run_workflow(config, template, workflow, Duration::from_millis(latency_ms)).await?;
        }
    }

    Ok(())
}

async fn run_workflow(
    config: AppConfig,
    template: TemplateKind,
    workflow: Workflow,
    latency: Duration,
) -> anyhow::Result<()> {
    let registry = dry_run::registry_for(&workflow, latency);
    info!(template = %template, tasks = workflow.tasks.len(), "Running template with dry-run agents");

    let orchestrator = Orchestrator::new(config, registry);
    orchestrator.start().await;

    let id = orchestrator.submit_workflow(workflow).await?;
    let status = tokio::select! {
        status = orchestrator.wait_for_workflow(&id) => status?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling workflow");
            orchestrator.cancel_workflow(&id).await?;
            orchestrator.wait_for_workflow(&id).await?
        }
    };
    orchestrator.stop().await;
    info!(workflow_id = %id, status = %status, "Run finished");

    let report = orchestrator
        .get_workflow_status(&id)
        .await
        .context("workflow disappeared from the orchestrator")?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn print_templates(defaults: &TaskDefaults) {
    for kind in TemplateKind::ALL {
        let workflow = templates::build(kind, Goal::new("example", "score", 1.0), "cli", defaults);
        println!("{:<20} {}", kind.name(), kind.description());
        for task in &workflow.tasks {
            let deps: Vec<&str> = task.dependencies.iter().map(|d| d.as_str()).collect();
            if deps.is_empty() {
                println!("    {:<22} [{}]", task.id.as_str(), task.agent_type);
            } else {
                println!(
                    "    {:<22} [{}] after {}",
                    task.id.as_str(),
                    task.agent_type,
                    deps.join(", ")
                );
            }
        }
        println!();
    }
}
