use anyhow::Result;
use clap::{Parser, Subcommand};
use conductor::artifacts::ArtifactStore;
use conductor::audit::AuditLog;
use conductor::cmd::{self, App};
use conductor::cmd::logs::LogsCommands;
use conductor::cmd::permissions::PermissionsCommands;
use conductor::config::ConfigStore;
use conductor::errors::OrchestratorError;
use conductor::orchestrator::PlanManager;
use conductor::permissions::PermissionEngine;
use conductor::plan::PlanStore;
use conductor::tools::ToolRegistry;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(version, about = "Autonomous execution orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Directory holding PLANS, ARTIFACTS, and logs
    #[arg(long, default_value = ".", global = true)]
    pub data_dir: PathBuf,

    /// Directory holding YAML configuration files
    #[arg(long, default_value = "config", global = true)]
    pub config_dir: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create, list, show, and delete plans
    Plan {
        #[command(subcommand)]
        command: PlanCommands,
    },
    /// Execute a plan to completion
    Run {
        plan_id: String,
        /// Park low-risk approval-gated steps instead of auto-running them
        #[arg(long)]
        no_auto_approve: bool,
        /// Print the dependency waves without executing anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Approve or reject a step waiting at an approval gate
    Approve {
        plan_id: String,
        step_id: String,
        /// yes or no
        #[arg(default_value = "yes")]
        decision: String,
    },
    /// Request cancellation of a running plan
    Stop { plan_id: String },
    /// Inspect the audit journal
    Logs {
        #[command(subcommand)]
        command: Option<LogsCommands>,
    },
    /// Inspect and toggle permission rules
    Permissions {
        #[command(subcommand)]
        command: Option<PermissionsCommands>,
    },
}

#[derive(Subcommand)]
pub enum PlanCommands {
    /// Generate a plan from an objective
    Create {
        title: String,
        #[arg(short, long, default_value = "")]
        description: String,
        #[arg(short, long)]
        objective: String,
        /// Context entries as key=value pairs
        #[arg(short, long)]
        context: Vec<String>,
    },
    List {
        #[arg(long)]
        status: Option<String>,
    },
    Show { plan_id: String },
    Status { plan_id: String },
    Delete { plan_id: String },
}

fn build_app(cli: &Cli) -> Result<App> {
    let config = ConfigStore::new(&cli.config_dir)?;
    let settings = config.config();

    let filter = if cli.verbose || settings.system.debug_mode {
        "debug".to_string()
    } else {
        settings.system.log_level.clone()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let audit = Arc::new(AuditLog::new(&cli.data_dir.join("logs"))?);
    let permissions_file = cli.config_dir.join("permissions.yaml");
    let permissions = if permissions_file.exists() {
        Arc::new(PermissionEngine::from_file(&permissions_file, audit.clone()))
    } else {
        Arc::new(PermissionEngine::with_defaults(audit.clone()))
    };
    let artifacts = Arc::new(ArtifactStore::new(&cli.data_dir.join("ARTIFACTS"))?);
    let registry = Arc::new(ToolRegistry::with_builtins());
    let store = Arc::new(PlanStore::new(&cli.data_dir.join("PLANS"))?);

    let manager = PlanManager::new(
        store,
        registry,
        permissions.clone(),
        artifacts,
        audit.clone(),
    )
    .with_scheduler_settings(settings.scheduler);

    Ok(App {
        audit,
        permissions,
        manager,
    })
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let exit_code = match run(&cli).await {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("{} {err:#}", console::style("error:").red().bold());
            match err.downcast_ref::<OrchestratorError>() {
                Some(orchestrator_err) => orchestrator_err.exit_code(),
                None => 2,
            }
        }
    };
    std::process::exit(exit_code);
}

async fn run(cli: &Cli) -> Result<()> {
    let app = build_app(cli)?;

    match &cli.command {
        Commands::Plan { command } => match command {
            PlanCommands::Create {
                title,
                description,
                objective,
                context,
            } => cmd::plan::cmd_plan_create(&app, title, description, objective, context).await,
            PlanCommands::List { status } => cmd::plan::cmd_plan_list(&app, status.as_deref()),
            PlanCommands::Show { plan_id } => cmd::plan::cmd_plan_show(&app, plan_id),
            PlanCommands::Status { plan_id } => cmd::plan::cmd_plan_status(&app, plan_id).await,
            PlanCommands::Delete { plan_id } => cmd::plan::cmd_plan_delete(&app, plan_id).await,
        },
        Commands::Run {
            plan_id,
            no_auto_approve,
            dry_run,
        } => cmd::run::cmd_run(&app, plan_id, !no_auto_approve, *dry_run).await,
        Commands::Approve {
            plan_id,
            step_id,
            decision,
        } => cmd::run::cmd_approve(&app, plan_id, step_id, decision).await,
        Commands::Stop { plan_id } => cmd::run::cmd_stop(&app, plan_id).await,
        Commands::Logs { command } => cmd::logs::cmd_logs(&app, command),
        Commands::Permissions { command } => cmd::permissions::cmd_permissions(&app, command),
    }
}
