use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};
use serde_json::{Map, Value};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use leadflow::config::Config;
use leadflow::engine::{LeadEvent, Scheduler, TriggerDispatcher, WakeupProcessor};
use leadflow::storage::{ExecutionState, Lead, SqliteStorage};

#[derive(Parser)]
#[command(name = "leadflow")]
#[command(about = "Durable outreach workflow engine", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server (API + wake-up processor)
    Server {
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Manage workflows
    Workflows {
        #[command(subcommand)]
        action: WorkflowActions,
    },
    /// Manage leads
    Leads {
        #[command(subcommand)]
        action: LeadActions,
    },
    /// Manually start a workflow for a lead
    Trigger {
        /// Workflow ID
        workflow: String,
        /// Lead ID
        lead: String,
        /// JSON object merged over the lead's variables
        #[arg(short, long)]
        input: Option<String>,
        /// Variable assignments (key=value)
        #[arg(short = 'v', long = "var", value_parser = parse_var)]
        vars: Vec<(String, String)>,
    },
    /// Emit lead events
    Events {
        #[command(subcommand)]
        action: EventActions,
    },
    /// Inspect and control executions
    Executions {
        #[command(subcommand)]
        action: ExecutionActions,
    },
    /// Process due wake-ups once and exit
    Tick,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

#[derive(Subcommand)]
enum WorkflowActions {
    /// Create or update a workflow from a YAML/JSON file
    Create {
        /// Path to workflow file
        file: String,
    },
    /// List all workflows
    List,
    /// Show workflow details
    Show {
        /// Workflow ID
        id: String,
    },
    /// Validate a workflow file without saving it
    Validate {
        /// Path to workflow file
        file: String,
    },
    /// Allow new executions to start
    Activate {
        /// Workflow ID
        id: String,
    },
    /// Stop new executions from starting
    Deactivate {
        /// Workflow ID
        id: String,
    },
}

#[derive(Subcommand)]
enum LeadActions {
    /// Create or replace a lead
    Set {
        /// Lead ID
        id: String,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        name: Option<String>,
        /// Attribute assignments (key=value, values parsed as JSON when possible)
        #[arg(short, long = "attr", value_parser = parse_var)]
        attrs: Vec<(String, String)>,
    },
}

#[derive(Subcommand)]
enum EventActions {
    /// Dispatch an event to every matching active workflow
    Emit {
        /// Event type, e.g. lead.created
        event_type: String,
        /// Lead ID
        lead: String,
        /// JSON payload
        #[arg(short, long)]
        payload: Option<String>,
    },
}

#[derive(Subcommand)]
enum ExecutionActions {
    /// List executions of a workflow
    List {
        /// Workflow ID
        workflow: String,
    },
    /// Show an execution record
    Show { workflow: String, lead: String },
    /// Cancel an execution
    Cancel { workflow: String, lead: String },
    /// Show archived runs of an execution
    Runs { workflow: String, lead: String },
}

fn parse_var(s: &str) -> std::result::Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("Invalid variable format '{}'. Expected key=value", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "leadflow=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = Config::load();

    match cli.command {
        Commands::Server { port } => cmd_server(&config, port).await?,
        Commands::Workflows { action } => match action {
            WorkflowActions::Create { file } => cmd_workflows_create(&config, &file).await?,
            WorkflowActions::List => cmd_workflows_list(&config).await?,
            WorkflowActions::Show { id } => cmd_workflows_show(&config, &id).await?,
            WorkflowActions::Validate { file } => cmd_workflows_validate(&file)?,
            WorkflowActions::Activate { id } => cmd_workflows_set_active(&config, &id, true).await?,
            WorkflowActions::Deactivate { id } => {
                cmd_workflows_set_active(&config, &id, false).await?
            }
        },
        Commands::Leads { action } => match action {
            LeadActions::Set {
                id,
                email,
                name,
                attrs,
            } => cmd_leads_set(&config, id, email, name, &attrs).await?,
        },
        Commands::Trigger {
            workflow,
            lead,
            input,
            vars,
        } => cmd_trigger(&config, &workflow, &lead, input.as_deref(), &vars).await?,
        Commands::Events { action } => match action {
            EventActions::Emit {
                event_type,
                lead,
                payload,
            } => cmd_events_emit(&config, &event_type, &lead, payload.as_deref()).await?,
        },
        Commands::Executions { action } => match action {
            ExecutionActions::List { workflow } => cmd_executions_list(&config, &workflow).await?,
            ExecutionActions::Show { workflow, lead } => {
                cmd_executions_show(&config, &workflow, &lead).await?
            }
            ExecutionActions::Cancel { workflow, lead } => {
                cmd_executions_cancel(&config, &workflow, &lead).await?
            }
            ExecutionActions::Runs { workflow, lead } => {
                cmd_executions_runs(&config, &workflow, &lead).await?
            }
        },
        Commands::Tick => cmd_tick(&config).await?,
        Commands::Completions { shell } => {
            cmd_completions(shell)?;
        }
    }

    Ok(())
}

/// Shell completion variants
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum CompletionShell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Elvish,
}

impl From<CompletionShell> for Shell {
    fn from(shell: CompletionShell) -> Self {
        match shell {
            CompletionShell::Bash => Shell::Bash,
            CompletionShell::Zsh => Shell::Zsh,
            CompletionShell::Fish => Shell::Fish,
            CompletionShell::PowerShell => Shell::PowerShell,
            CompletionShell::Elvish => Shell::Elvish,
        }
    }
}

/// Generate shell completions
fn cmd_completions(shell: CompletionShell) -> anyhow::Result<()> {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    let shell: Shell = shell.into();
    generate(shell, &mut cmd, name, &mut std::io::stdout());
    Ok(())
}

// ============================================================================
// Workflow Commands
// ============================================================================

async fn cmd_workflows_create(config: &Config, file: &str) -> anyhow::Result<()> {
    use leadflow::workflow::{parse_workflow_file, validate_workflow};
    use std::path::Path;

    let path = Path::new(file);
    if !path.exists() {
        anyhow::bail!("File not found: {}", file);
    }

    let workflow = parse_workflow_file(path)?;
    validate_workflow(&workflow)?;

    let storage = get_storage(config)?;
    let stored = storage.save_workflow(&workflow).await?;

    println!(
        "✓ Workflow '{}' saved (version {})",
        stored.id(),
        stored.version()
    );
    println!();
    println!("  Nodes: {}", workflow.nodes.len());
    println!("  Edges: {}", workflow.edges.len());
    println!("  Active: {}", if stored.is_active() { "yes" } else { "no" });

    Ok(())
}

async fn cmd_workflows_list(config: &Config) -> anyhow::Result<()> {
    let storage = get_storage(config)?;
    let workflows = storage.list_workflows().await?;

    if workflows.is_empty() {
        println!("No workflows found.");
        println!();
        println!("Create one with: leadflow workflows create <file.yaml>");
        return Ok(());
    }

    println!(
        "{:<30} {:<8} {:<8} {:<20}",
        "ID", "VERSION", "ACTIVE", "UPDATED"
    );
    println!("{}", "-".repeat(68));

    for wf in workflows {
        println!(
            "{:<30} {:<8} {:<8} {:<20}",
            wf.id(),
            wf.version(),
            if wf.is_active() { "yes" } else { "no" },
            wf.updated_at.format("%Y-%m-%d %H:%M")
        );
    }

    Ok(())
}

async fn cmd_workflows_show(config: &Config, id: &str) -> anyhow::Result<()> {
    let storage = get_storage(config)?;
    let stored = storage
        .get_workflow(id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Workflow not found: {}", id))?;
    let workflow = &stored.definition;

    println!("Workflow: {} ({})", workflow.id, workflow.name);
    println!("Version: {}", workflow.version);
    println!("Active: {}", workflow.is_active);
    println!();
    println!("Nodes:");
    for node in &workflow.nodes {
        println!("  - {} [{}]", node.id, node.node_type());
    }
    println!();
    println!("Edges:");
    for edge in &workflow.edges {
        match &edge.handle {
            Some(handle) => println!("  - {} -> {} ({})", edge.source, edge.target, handle),
            None => println!("  - {} -> {}", edge.source, edge.target),
        }
    }

    let versions = storage.list_workflow_versions(id).await?;
    if versions.len() > 1 {
        println!();
        println!("Versions:");
        for v in versions {
            println!("  - v{} ({})", v.version, v.created_at.format("%Y-%m-%d %H:%M"));
        }
    }

    Ok(())
}

fn cmd_workflows_validate(file: &str) -> anyhow::Result<()> {
    use leadflow::workflow::{parse_workflow_file, validate_workflow};
    use std::path::Path;

    let path = Path::new(file);
    if !path.exists() {
        anyhow::bail!("File not found: {}", file);
    }

    let workflow = parse_workflow_file(path)?;
    if let Err(e) = validate_workflow(&workflow) {
        println!("✗ Workflow '{}' is invalid:", workflow.id);
        for violation in &e.violations {
            println!("  - {}", violation);
        }
        anyhow::bail!("{} violation(s)", e.violations.len());
    }

    println!("✓ Workflow '{}' is valid", workflow.id);
    println!();
    println!("  Nodes: {}", workflow.nodes.len());
    println!("  Edges: {}", workflow.edges.len());

    Ok(())
}

async fn cmd_workflows_set_active(config: &Config, id: &str, active: bool) -> anyhow::Result<()> {
    let storage = get_storage(config)?;
    storage.set_workflow_active(id, active).await?;
    println!(
        "✓ Workflow '{}' {}",
        id,
        if active { "activated" } else { "deactivated" }
    );
    Ok(())
}

// ============================================================================
// Lead, Trigger & Event Commands
// ============================================================================

async fn cmd_leads_set(
    config: &Config,
    id: String,
    email: Option<String>,
    name: Option<String>,
    attrs: &[(String, String)],
) -> anyhow::Result<()> {
    let storage = get_storage(config)?;
    let lead = Lead {
        id,
        email,
        name,
        attributes: vars_to_map(attrs),
    };
    storage.upsert_lead(&lead).await?;
    println!("✓ Lead '{}' saved", lead.id);
    Ok(())
}

async fn cmd_trigger(
    config: &Config,
    workflow: &str,
    lead: &str,
    input: Option<&str>,
    vars: &[(String, String)],
) -> anyhow::Result<()> {
    let mut variables = match input {
        Some(raw) => parse_object(raw, "input")?,
        None => Map::new(),
    };
    variables.extend(vars_to_map(vars));

    let dispatcher = TriggerDispatcher::new(build_scheduler(config)?);
    let execution = dispatcher.trigger_manual(workflow, lead, variables).await?;
    print_execution(&execution);
    Ok(())
}

async fn cmd_events_emit(
    config: &Config,
    event_type: &str,
    lead: &str,
    payload: Option<&str>,
) -> anyhow::Result<()> {
    let payload = match payload {
        Some(raw) => Value::Object(parse_object(raw, "payload")?),
        None => Value::Object(Map::new()),
    };

    let dispatcher = TriggerDispatcher::new(build_scheduler(config)?);
    let started = dispatcher
        .dispatch(&LeadEvent::new(event_type, lead, payload))
        .await?;

    if started.is_empty() {
        println!("No active workflow matched '{}'.", event_type);
        return Ok(());
    }
    for execution in &started {
        print_execution(execution);
        println!();
    }
    Ok(())
}

// ============================================================================
// Execution Commands
// ============================================================================

async fn cmd_executions_list(config: &Config, workflow: &str) -> anyhow::Result<()> {
    let storage = get_storage(config)?;
    let executions = storage.list_executions(workflow).await?;

    if executions.is_empty() {
        println!("No executions found for workflow '{}'.", workflow);
        return Ok(());
    }

    println!(
        "{:<24} {:<10} {:<20} {:<20}",
        "LEAD", "STATUS", "NODE", "UPDATED"
    );
    println!("{}", "-".repeat(76));
    for e in executions {
        println!(
            "{:<24} {:<10} {:<20} {:<20}",
            e.lead_id,
            e.status,
            e.current_node,
            e.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

async fn cmd_executions_show(config: &Config, workflow: &str, lead: &str) -> anyhow::Result<()> {
    let storage = get_storage(config)?;
    let execution = storage
        .get_execution(workflow, lead)
        .await?
        .ok_or_else(|| anyhow::anyhow!("No execution for '{}' / '{}'", workflow, lead))?;
    println!("{}", serde_json::to_string_pretty(&execution)?);
    Ok(())
}

async fn cmd_executions_cancel(config: &Config, workflow: &str, lead: &str) -> anyhow::Result<()> {
    let scheduler = build_scheduler(config)?;
    let execution = scheduler.cancel(workflow, lead).await?;
    print_execution(&execution);
    Ok(())
}

async fn cmd_executions_runs(config: &Config, workflow: &str, lead: &str) -> anyhow::Result<()> {
    let storage = get_storage(config)?;
    let runs = storage.list_runs(workflow, lead).await?;

    if runs.is_empty() {
        println!("No archived runs.");
        return Ok(());
    }
    for run in runs {
        println!(
            "{}  {:<10} v{}  node={}  archived {}",
            run.run_id,
            run.status,
            run.workflow_version,
            run.current_node,
            run.archived_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

async fn cmd_tick(config: &Config) -> anyhow::Result<()> {
    let processor = WakeupProcessor::new(build_scheduler(config)?).with_config(&config.engine);
    let handled = processor.process_due_wakeups(chrono::Utc::now()).await?;
    println!("Processed {} due wake-up(s)", handled);
    Ok(())
}

// ============================================================================
// Server Commands
// ============================================================================

async fn cmd_server(config: &Config, port: Option<u16>) -> anyhow::Result<()> {
    use leadflow::api::{create_router, AppState};

    leadflow::metrics::init_metrics();

    let scheduler = build_scheduler(config)?;
    let mut processor = WakeupProcessor::new(scheduler.clone()).with_config(&config.engine);
    processor.start().await?;

    let app = create_router(AppState::new(scheduler));

    let port = port.unwrap_or(config.server.port);
    let addr = format!("{}:{}", config.server.host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    println!("leadflow server running on http://{}", addr);
    println!();
    println!("Database: {}", config.database_path().display());
    println!("Email provider: {}", config.email.provider);
    println!();
    println!("API endpoints:");
    println!("  GET  /api/health");
    println!("  GET  /api/workflows");
    println!("  POST /api/workflows");
    println!("  GET  /api/workflows/{{id}}");
    println!("  POST /api/workflows/{{id}}/activate | deactivate");
    println!("  GET  /api/workflows/{{id}}/executions");
    println!("  POST /api/workflows/{{id}}/executions");
    println!("  GET  /api/workflows/{{id}}/executions/{{lead_id}}");
    println!("  POST /api/workflows/{{id}}/executions/{{lead_id}}/cancel");
    println!("  GET  /api/workflows/{{id}}/executions/{{lead_id}}/runs");
    println!("  POST /api/events");
    println!("  PUT  /api/leads/{{id}}");
    println!("  GET  /metrics");
    println!();
    println!("Press Ctrl+C to stop");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    processor.stop().await?;

    println!("Server stopped.");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl+C: {}", e);
        return;
    }
    println!("\nShutting down gracefully...");
}

// ============================================================================
// Helpers
// ============================================================================

fn get_storage(config: &Config) -> anyhow::Result<SqliteStorage> {
    Ok(SqliteStorage::open(&config.database_path())?)
}

fn build_scheduler(config: &Config) -> anyhow::Result<Scheduler> {
    let storage = get_storage(config)?;
    let email = leadflow::nodes::email_sender_from_config(&config.email)?;
    Ok(Scheduler::new(storage, email).with_max_steps(config.engine.max_steps_per_invocation))
}

fn parse_object(raw: &str, what: &str) -> anyhow::Result<Map<String, Value>> {
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(map) => Ok(map),
        _ => anyhow::bail!("{} must be a JSON object", what),
    }
}

/// `key=value` pairs; values that parse as JSON keep their type.
fn vars_to_map(vars: &[(String, String)]) -> Map<String, Value> {
    vars.iter()
        .map(|(k, v)| {
            let value = serde_json::from_str(v).unwrap_or_else(|_| Value::String(v.clone()));
            (k.clone(), value)
        })
        .collect()
}

fn print_execution(execution: &ExecutionState) {
    println!(
        "Execution {} / {}: {}",
        execution.workflow_id, execution.lead_id, execution.status
    );
    println!("  Run: {}", execution.run_id);
    println!("  Node: {}", execution.current_node);
    if let Some(wake_at) = execution.next_wake_at {
        println!("  Wakes at: {}", wake_at.to_rfc3339());
    }
    for entry in execution.history() {
        let node_type = entry
            .node_type
            .map(|t| t.to_string())
            .unwrap_or_else(|| "?".to_string());
        match &entry.error {
            Some(error) => println!("  ✗ {} [{}] {}", entry.node_id, node_type, error),
            None => println!("  ✓ {} [{}]", entry.node_id, node_type),
        }
    }
}
