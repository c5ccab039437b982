// crates/arborcli/src/main.rs

mod plan;

use anyhow::{Context, Result};
use arborcore::{BusMessage, LogLevel, WorkflowEvent};
use arborruntime::{tree, EventTree, FlowRuntime, RuntimeConfig};
use clap::{Parser, Subcommand};
use plan::PlanSpec;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "arbor")]
#[command(about = "Arbor workflow tree CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow plan
    Run {
        /// Path to workflow plan JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Path to runtime config JSON file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,

        /// Print the exported tree after the run
        #[arg(long)]
        tree: bool,
    },

    /// Validate a workflow plan
    Validate {
        /// Path to workflow plan JSON file
        file: PathBuf,
    },

    /// Create a new example plan
    Init {
        /// Output file path
        #[arg(short, long, default_value = "plan.json")]
        output: PathBuf,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            config,
            verbose,
            tree,
        } => {
            init_tracing(verbose);
            run_plan(file, config, tree).await?;
        }

        Commands::Validate { file } => {
            validate_plan(file)?;
        }

        Commands::Init { output } => {
            create_example_plan(output)?;
        }
    }

    Ok(())
}

fn load_plan(file: &Path) -> Result<PlanSpec> {
    let json = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read plan {}", file.display()))?;
    PlanSpec::from_json(&json).with_context(|| format!("invalid plan {}", file.display()))
}

fn load_config(config: Option<PathBuf>) -> Result<RuntimeConfig> {
    let Some(path) = config else {
        return Ok(RuntimeConfig::default());
    };
    let json = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config = RuntimeConfig::from_json(&json)?;
    tracing::debug!(?config, "Loaded runtime config from {}", path.display());
    Ok(config)
}

async fn run_plan(file: PathBuf, config: Option<PathBuf>, print_tree: bool) -> Result<()> {
    println!("🚀 Loading plan from: {}", file.display());

    let plan = load_plan(&file)?;
    let config = load_config(config)?;

    println!("📋 Workflow: {}", plan.name);
    println!("   Workflows: {}", plan.workflow_count());
    println!("   Steps: {}", plan.steps.len());
    println!();

    let root = plan.build()?;
    let runtime = FlowRuntime::with_config(config);

    // Subscribe before running so nothing is missed
    let mut messages = runtime.subscribe_events();
    let event_task = tokio::spawn(async move {
        while let Ok(message) = messages.recv().await {
            print_message(&message);
        }
    });

    let result = runtime.execute(&root).await;

    // Wait for events to finish printing
    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    event_task.abort();

    println!();
    println!("📊 Execution Summary:");
    println!("   Root: {} ({})", root.name(), root.status());
    for child in root.children() {
        println!("   • {} ({})", child.name(), child.status());
    }

    if print_tree {
        let export = EventTree::new(root.node().clone()).export()?;
        println!();
        println!("🌳 Tree:");
        println!("{}", serde_json::to_string_pretty(&export)?);
    }

    match result {
        Ok(output) => {
            println!();
            println!("📤 Output: {}", serde_json::to_string(&output)?);
            Ok(())
        }
        Err(error) => {
            if let Some(captured) = error.as_workflow_error() {
                println!();
                println!("🧾 State at failure:");
                for (key, value) in &captured.state {
                    println!("   {}: {}", key, serde_json::to_string(value)?);
                }
                println!("   Logs captured: {}", captured.logs.len());
            }
            Err(error.into())
        }
    }
}

fn print_message(message: &BusMessage) {
    match message {
        BusMessage::Log(entry) => match entry.level {
            LogLevel::Warn => println!("     ⚠️  [{}] {}", entry.workflow_id, entry.message),
            LogLevel::Error => println!("     ❌ [{}] {}", entry.workflow_id, entry.message),
            LogLevel::Info => println!("     ℹ️  [{}] {}", entry.workflow_id, entry.message),
            LogLevel::Debug => {}
        },
        BusMessage::Event(event) => match event {
            WorkflowEvent::ChildAttached { parent_id, child_name, .. } => {
                println!("  🔗 {} attached under {}", child_name, parent_id);
            }
            WorkflowEvent::StepStart { node_id, step } => {
                println!("  ⚡ [{}] Starting step: {}", node_id, step);
            }
            WorkflowEvent::StepEnd { node_id, step, duration_ms } => {
                println!("  ✅ [{}] Step {} completed in {}ms", node_id, step, duration_ms);
            }
            WorkflowEvent::TaskStart { node_id, task } => {
                println!("▶️  [{}] Task started: {}", node_id, task);
            }
            WorkflowEvent::TaskEnd { node_id, task, duration_ms } => {
                println!("✨ [{}] Task {} completed in {}ms", node_id, task, duration_ms);
            }
            WorkflowEvent::Error { node_id, error } => {
                println!("  💥 [{}] {}", node_id, error.message);
            }
            WorkflowEvent::ReflectionStart { node_id, level, attempt } => {
                println!("  🤔 [{}] Reflecting on attempt {} ({})", node_id, attempt, level);
            }
            WorkflowEvent::ReflectionEnd { node_id, should_retry, reason } => {
                let verdict = if *should_retry { "retry" } else { "give up" };
                println!("  🔁 [{}] Reflection: {} ({})", node_id, verdict, reason);
            }
            _ => {}
        },
        BusMessage::StateUpdated { node_id, state } => {
            println!("  📸 [{}] State captured ({} fields)", node_id, state.len());
        }
        BusMessage::TreeChanged { .. } => {}
    }
}

fn validate_plan(file: PathBuf) -> Result<()> {
    println!("🔍 Validating plan: {}", file.display());

    let plan = load_plan(&file)?;
    let root = plan.build()?;
    let violations = tree::validate_tree(&root);

    if !violations.is_empty() {
        println!("❌ Tree is inconsistent:");
        for violation in &violations {
            println!("   • {}", violation);
        }
        anyhow::bail!("{} tree violations", violations.len());
    }

    println!("✅ Plan is valid:");
    println!("   Name: {}", plan.name);
    println!("   Workflows: {}", plan.workflow_count());

    Ok(())
}

fn create_example_plan(output: PathBuf) -> Result<()> {
    let json = serde_json::to_string_pretty(&PlanSpec::example())?;
    std::fs::write(&output, json)?;

    println!("✨ Created example plan: {}", output.display());
    println!();
    println!("Run it with:");
    println!("  arbor run --file {} --tree", output.display());

    Ok(())
}
