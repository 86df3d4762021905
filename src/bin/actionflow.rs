//! actionflow Admin CLI
//!
//! Offline tooling for workflow definition files: validate them, summarize
//! them, and dry-run actions against an in-memory engine.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use actionflow::{
    ActionId, DefinitionContents, EngineConfig, FunctionRegistry, InMemoryStorage, TransitionOutcome,
    WorkflowDefinition, WorkflowEngine,
};
use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use serde_json::{Map, Value};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "actionflow")]
#[command(about = "actionflow CLI - validate, inspect and simulate workflow definitions")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Engine configuration file (defaults to ./actionflow.{toml,json,yaml} when present)
    #[arg(long, env = "ACTIONFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that a definition file parses and is well formed
    Validate {
        /// Definition JSON file
        file: PathBuf,
    },

    /// Summarize steps, actions, screens and referenced functions
    Inspect {
        /// Definition JSON file
        file: PathBuf,
    },

    /// Run actions against a fresh in-memory entry
    ///
    /// Every referenced hook is a no-op and every referenced condition
    /// passes unless listed with --deny.
    Simulate {
        /// Definition JSON file
        file: PathBuf,

        /// Action ids to perform, in order
        actions: Vec<String>,

        /// Input passed to every action, as key=value (repeatable)
        #[arg(long = "input", short = 'i')]
        inputs: Vec<String>,

        /// Condition function that should fail (repeatable)
        #[arg(long)]
        deny: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    dotenv().ok();

    let cli = Cli::parse();
    let config = EngineConfig::load(cli.config.as_deref())?;

    // Initialize logging: RUST_LOG wins, then --verbose, then the config
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) if cli.verbose => EnvFilter::new("debug"),
        Err(_) => EnvFilter::new(&config.log_level),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Validate { file } => validate(&file),
        Commands::Inspect { file } => inspect(&file, &config),
        Commands::Simulate { file, actions, inputs, deny } => {
            simulate(&file, config, &actions, &inputs, &deny).await
        }
    }
}

/// Read a definition file
///
/// Accepts either a full definition (`{"id", "name", "contents"}`) or bare
/// contents, in which case the file stem becomes the id and name.
fn load_definition(path: &Path) -> Result<WorkflowDefinition> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let value: Value = serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;

    let definition = if value.get("contents").is_some() {
        serde_json::from_value::<WorkflowDefinition>(value)?
    } else {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("workflow")
            .to_string();
        let contents: DefinitionContents = serde_json::from_value(value)?;
        WorkflowDefinition::new(stem.clone(), stem, contents)
    };
    debug!(path = %path.display(), id = %definition.id, "definition loaded");
    Ok(definition)
}

fn contents_of(definition: &WorkflowDefinition) -> Result<&DefinitionContents> {
    definition
        .contents
        .as_ref()
        .ok_or_else(|| anyhow!("definition '{}' has no contents", definition.name))
}

fn validate(path: &Path) -> Result<()> {
    let definition = load_definition(path)?;
    let contents = contents_of(&definition)?;
    if let Err(reason) = contents.validate() {
        error!("❌ {}: {}", path.display(), reason);
        return Err(anyhow!("invalid definition: {}", reason));
    }

    println!("✅ {} is valid", path.display());
    println!("   Steps: {}", contents.step_count());
    println!("   Initial actions: {}", contents.initial_actions.len());
    println!("   Splits: {}", contents.splits.len());
    println!("   Joins: {}", contents.joins.len());
    Ok(())
}

fn inspect(path: &Path, config: &EngineConfig) -> Result<()> {
    let definition = load_definition(path)?;
    let contents = contents_of(&definition)?;

    println!("\n📋 Workflow: {} ({})", definition.name, definition.id);
    println!("=====================================");
    println!("Steps: {}", WorkflowEngine::get_step_num(contents));

    for step in &contents.steps {
        println!("🔧 Step {}: {}", step.id, step.name);
        for action in &step.actions {
            let targets: Vec<String> = action
                .results
                .iter()
                .map(|result| match (&result.step, &result.split, &result.join) {
                    (_, Some(split), _) => format!("split:{}", split),
                    (_, _, Some(join)) => format!("join:{}", join),
                    (Some(step), _, _) => format!("step:{}", step),
                    _ => "-".to_string(),
                })
                .collect();
            println!("   Action {}: {} -> [{}]", action.id, action.name, targets.join(", "));
        }
    }

    let screens = WorkflowEngine::get_screens(contents);
    println!("\nScreens ({})", screens.len());
    for screen in screens {
        println!("   {}", screen);
    }

    let registry = FunctionRegistry::with_config(config);
    let mut functions: Vec<String> = contents
        .function_refs()
        .into_iter()
        .map(|f| registry.resolve_name(&f.name))
        .collect();
    functions.sort();
    functions.dedup();
    println!("\nFunctions ({})", functions.len());
    for function in functions {
        println!("   {}", function);
    }
    println!();
    Ok(())
}

fn parse_inputs(pairs: &[String]) -> Result<Map<String, Value>> {
    let mut inputs = Map::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("input '{}' is not key=value", pair))?;
        // Numbers, booleans and JSON literals keep their type; anything else is a string
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        inputs.insert(key.to_string(), value);
    }
    Ok(inputs)
}

/// Registry that accepts every function a definition references
fn permissive_registry(contents: &DefinitionContents, config: &EngineConfig, deny: &[String]) -> FunctionRegistry {
    let mut registry = FunctionRegistry::with_config(config);
    let denied: Arc<HashSet<String>> = Arc::new(deny.iter().map(|name| registry.resolve_name(name)).collect());

    for function in contents.function_refs() {
        let name = registry.resolve_name(&function.name);
        let hook_name = name.clone();
        let denied = denied.clone();
        let predicate_name = name.clone();
        registry
            .register_hook_fn(&name, move |_| {
                info!(function = %hook_name, "hook called");
                Ok(())
            })
            .register_predicate_fn(&name, move |_| Ok(!denied.contains(&predicate_name)));
    }
    registry
}

async fn simulate(
    path: &Path,
    config: EngineConfig,
    actions: &[String],
    inputs: &[String],
    deny: &[String],
) -> Result<()> {
    let definition = load_definition(path)?;
    let registry = permissive_registry(contents_of(&definition)?, &config, deny);
    let inputs = parse_inputs(inputs)?;

    let engine = WorkflowEngine::new(Arc::new(InMemoryStorage::default()), Arc::new(registry)).with_config(config);
    let definition = engine.save_definition(definition).await?;
    let entry = engine.create_instance(&definition.id).await?;

    println!("\n🚀 Simulating '{}' (entry {})", definition.name, entry.id);
    println!("=====================================");
    report("initialize", engine.initialize(entry.id).await?);
    print_position(&engine, entry.id).await?;

    for action in actions {
        let action_id = ActionId::from(action.as_str());
        match engine.do_action(entry.id, &action_id, inputs.clone()).await {
            Ok(outcome) => report(&format!("action {}", action_id), outcome),
            Err(e) => {
                error!("❌ action {} failed: {}", action_id, e);
                return Err(e.into());
            }
        }
        print_position(&engine, entry.id).await?;
    }

    let history = engine.get_history_steps(entry.id).await?;
    println!("\n📜 History ({})", history.len());
    for step in history {
        println!("   step {} [{}] via action {}", step.step_id, step.status, step.action_id);
    }
    Ok(())
}

fn report(label: &str, outcome: TransitionOutcome) {
    match outcome {
        TransitionOutcome::Completed(transition) => {
            println!("\n✅ {}: {} new step(s)", label, transition.created.len());
        }
        TransitionOutcome::HookFailed { transition, error } => {
            println!("\n⚠️  {}: {} new step(s), but a hook failed: {}", label, transition.created.len(), error);
        }
    }
}

async fn print_position(engine: &WorkflowEngine, entry_id: Uuid) -> Result<()> {
    println!("   State: {}", engine.get_entry_state(entry_id).await?);
    for step in engine.get_current_steps(entry_id).await? {
        println!("   Current step {} [{}]", step.step_id, step.status);
    }
    let available: Vec<String> = engine
        .get_available_actions(entry_id)
        .await?
        .into_iter()
        .map(|action| format!("{} ({})", action.id, action.name))
        .collect();
    println!("   Available: {}", if available.is_empty() { "-".to_string() } else { available.join(", ") });
    Ok(())
}
