//! GT-017: CLI subcommands: init, validate, plan, apply, destroy, status.
//!
//! Exit codes: 0 when the stack converged (or the plan is clean), 1 when an
//! apply left operations failed or skipped, 2 when the run could not start.

use crate::core::error::GantryError;
use crate::core::executor::{self, AbortSignal, ApplyConfig};
use crate::core::parser;
use crate::core::planner::{self, PlanContext};
use crate::core::resolver::ReferenceResolver;
use crate::core::settings::{Settings, SETTINGS_FILE};
use crate::core::state::{self, StateStore, IN_PROGRESS_MARKER};
use crate::core::types::{ApplyReport, ExecutionPlan, OperationStatus, ResourceGraph};
use crate::provider::{LocalCloud, ProviderRegistry};
use crate::secrets::{EnvSource, FileSource, SealingStore, SecretStore, SecretVault};
use crate::stack::FileStackResolver;
use clap::{Args, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new gantry project
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Validate declaration files without calling any provider
    Validate {
        /// Declaration files of one stack
        #[arg(short, long = "file", default_value = "gantry.yaml")]
        files: Vec<PathBuf>,
    },

    /// Show the execution plan (desired vs recorded state)
    Plan {
        #[command(flatten)]
        target: Target,

        /// Skip asking providers whether recorded resources still exist
        #[arg(long)]
        no_refresh: bool,
    },

    /// Converge the stack to its declaration
    Apply {
        #[command(flatten)]
        target: Target,

        /// Maximum provider operations in flight
        #[arg(short, long)]
        parallelism: Option<usize>,

        /// Skip asking providers whether recorded resources still exist
        #[arg(long)]
        no_refresh: bool,
    },

    /// Delete every recorded resource of the stack
    Destroy {
        #[command(flatten)]
        target: Target,

        /// Maximum provider operations in flight
        #[arg(short, long)]
        parallelism: Option<usize>,
    },

    /// Show recorded resources per stack
    Status {
        /// State directory
        #[arg(long)]
        state_dir: Option<PathBuf>,

        /// Show only this stack
        #[arg(long)]
        stack: Option<String>,
    },
}

/// Where a command reads its declaration and keeps its state.
#[derive(Args, Debug, Clone)]
pub struct Target {
    /// Declaration files of one stack
    #[arg(short, long = "file", default_value = "gantry.yaml")]
    pub files: Vec<PathBuf>,

    /// State directory shared by every stack
    #[arg(long)]
    pub state_dir: Option<PathBuf>,

    /// Directory of the local provider's persisted resources
    #[arg(long)]
    pub cloud_dir: Option<PathBuf>,

    /// YAML file of secret values (default: GANTRY_SECRET_* env vars)
    #[arg(long)]
    pub secrets: Option<PathBuf>,
}

/// CLI failure, carrying its exit code.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Nothing was applied.
    #[error("{0}")]
    Setup(String),

    /// Provider calls were made but the stack did not converge.
    #[error("{0}")]
    Partial(String),
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Setup(_) => 2,
            Self::Partial(_) => 1,
        }
    }
}

impl From<GantryError> for CliError {
    fn from(e: GantryError) -> Self {
        if e.is_setup() {
            Self::Setup(e.to_string())
        } else {
            Self::Partial(e.to_string())
        }
    }
}

/// Dispatch a CLI command.
pub async fn dispatch(cmd: Commands) -> Result<(), CliError> {
    match cmd {
        Commands::Init { path } => cmd_init(&path),
        Commands::Validate { files } => cmd_validate(&files),
        Commands::Plan { target, no_refresh } => {
            let plan = cmd_plan(&target, no_refresh).await?;
            plan_outcome(&plan)
        }
        Commands::Apply {
            target,
            parallelism,
            no_refresh,
        } => {
            let report = cmd_apply(&target, parallelism, no_refresh, false).await?;
            apply_outcome(&report)
        }
        Commands::Destroy { target, parallelism } => {
            let report = cmd_apply(&target, parallelism, false, true).await?;
            apply_outcome(&report)
        }
        Commands::Status { state_dir, stack } => cmd_status(state_dir.as_deref(), stack.as_deref()).await,
    }
}

const TEMPLATE: &str = r#"version: "1.0"
name: my-stack
description: "Managed by gantry"

params: {}

# alias: system id of another stack whose exports this stack reads
stacks: {}

resources:
  - type: http_api
    logicalName: api
    properties:
      name: my-api
      protocol_type: HTTP

  - type: apigw_stage
    logicalName: stage
    properties:
      api_id: "{{ref.api.id}}"
      name: v1
      auto_deploy: true

exports:
  apiEndpoint: "{{ref.api.api_endpoint}}"

policy:
  parallelism: 4
  refresh: true
"#;

fn cmd_init(path: &Path) -> Result<(), CliError> {
    let config_path = path.join("gantry.yaml");
    if config_path.exists() {
        return Err(CliError::Setup(format!("{} already exists", config_path.display())));
    }

    let state_dir = path.join(crate::core::settings::DEFAULT_STATE_DIR);
    std::fs::create_dir_all(&state_dir)
        .map_err(|e| CliError::Setup(format!("cannot create state dir: {}", e)))?;
    std::fs::write(&config_path, TEMPLATE)
        .map_err(|e| CliError::Setup(format!("cannot write {}: {}", config_path.display(), e)))?;

    let settings_path = path.join(SETTINGS_FILE);
    if !settings_path.exists() {
        let settings = format!(
            "# Project defaults. CLI flags take precedence.\n\
             # state_dir = \"state\"\n\
             # cloud_dir = \".gantry/cloud\"\n\
             # secrets_file = \"secrets.yaml\"\n\
             # parallelism = 4\n\
             \n\
             # Keys secret fingerprints in state. Keep it out of the state directory.\n\
             fingerprint_salt = \"{}\"\n",
            uuid::Uuid::new_v4().simple()
        );
        std::fs::write(&settings_path, settings)
            .map_err(|e| CliError::Setup(format!("cannot write {}: {}", settings_path.display(), e)))?;
    }

    println!("Initialized gantry project at {}", path.display());
    println!("  Created: {}", config_path.display());
    println!("  Created: {}", settings_path.display());
    println!("  Created: {}/", state_dir.display());
    Ok(())
}

fn cmd_validate(files: &[PathBuf]) -> Result<(), CliError> {
    let decls = files
        .iter()
        .map(|p| parser::parse_declaration_file(p))
        .collect::<Result<Vec<_>, _>>()?;
    let merged = parser::merge_declarations(decls)?;
    let errors = parser::validate_declaration(&merged);

    if !errors.is_empty() {
        for e in &errors {
            eprintln!("  ERROR: {}", e);
        }
        return Err(CliError::Setup(format!("{} validation error(s)", errors.len())));
    }
    // Duplicates and cycles are only detected on a bound graph.
    let graph = parser::load_declaration_files(files)?;
    println!(
        "OK: {} ({} resources, {} exports)",
        graph.name,
        graph.resources.len(),
        graph.exports.len()
    );
    Ok(())
}

/// Project directory: the first declaration file's directory.
fn project_dir(files: &[PathBuf]) -> PathBuf {
    files
        .first()
        .and_then(|f| f.parent())
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Everything one plan or apply run needs.
struct Session {
    graph: ResourceGraph,
    settings: Settings,
    state: Arc<StateStore>,
    providers: ProviderRegistry,
    resolver: Arc<ReferenceResolver>,
}

impl Session {
    fn open(target: &Target, destroy: bool) -> Result<Self, GantryError> {
        let settings = Settings::discover(&project_dir(&target.files))?;
        let declared = parser::load_declaration_files(&target.files)?;
        let graph = if destroy {
            ResourceGraph::empty(&declared.name, declared.policy.clone())
        } else {
            declared
        };

        let state_root = settings.state_dir(target.state_dir.as_deref());
        let state = Arc::new(StateStore::open(&state_root, &graph.name)?);

        let cloud_dir = settings.cloud_dir(target.cloud_dir.as_deref());
        let cloud = Arc::new(LocalCloud::open(&cloud_dir)?);
        let providers = ProviderRegistry::uniform(cloud);

        if settings.fingerprint_salt.is_none() {
            tracing::warn!("no fingerprint_salt in {}, secret fingerprints are unsalted", SETTINGS_FILE);
        }
        let vault = SecretVault::salted(settings.fingerprint_salt());
        let secrets: Arc<dyn SecretStore> = match settings.secrets_file(target.secrets.as_deref()) {
            Some(path) => Arc::new(SealingStore::new(vault, FileSource::open(&path)?)),
            None => Arc::new(SealingStore::new(vault, EnvSource::default())),
        };
        let stacks = Arc::new(FileStackResolver::new(state_root));
        let resolver = Arc::new(ReferenceResolver::new(&graph, stacks, secrets).with_providers(providers.clone()));

        tracing::debug!(
            stack = %graph.name,
            resources = graph.resources.len(),
            state = %state.dir().map(|d| d.display().to_string()).unwrap_or_default(),
            "session opened"
        );
        Ok(Self {
            graph,
            settings,
            state,
            providers,
            resolver,
        })
    }

    async fn plan(&self, refresh: bool) -> Result<ExecutionPlan, GantryError> {
        planner::plan(&PlanContext {
            graph: &self.graph,
            state: &self.state,
            providers: &self.providers,
            resolver: &self.resolver,
            refresh,
        })
        .await
    }
}

async fn cmd_plan(target: &Target, no_refresh: bool) -> Result<ExecutionPlan, CliError> {
    let session = Session::open(target, false)?;
    let refresh = session.settings.refresh(no_refresh, &session.graph.policy);
    let plan = session.plan(refresh).await?;
    print!("{}", planner::render_plan(&plan));
    Ok(plan)
}

/// A plan with unresolvable operations cannot be applied cleanly.
fn plan_outcome(plan: &ExecutionPlan) -> Result<(), CliError> {
    match plan.blocked().count() {
        0 => Ok(()),
        n => Err(CliError::Setup(format!("{} operation(s) have unresolved inputs", n))),
    }
}

async fn cmd_apply(
    target: &Target,
    parallelism: Option<usize>,
    no_refresh: bool,
    destroy: bool,
) -> Result<ApplyReport, CliError> {
    let session = Session::open(target, destroy)?;
    let policy = session.graph.policy.clone();
    let refresh = session.settings.refresh(no_refresh, &policy);
    let plan = session.plan(refresh).await?;
    print!("{}", planner::render_plan(&plan));

    if plan.is_noop() {
        println!("\nNo changes. {} is up to date.", plan.stack);
    }

    let abort = AbortSignal::new();
    let watcher = {
        let abort = abort.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, waiting for in-flight operations");
                abort.abort();
            }
        })
    };

    let Session {
        graph,
        settings,
        state,
        providers,
        resolver,
    } = session;
    let cfg = ApplyConfig {
        graph: Arc::new(graph),
        state,
        providers,
        resolver,
        parallelism: settings.parallelism(parallelism, &policy),
        abort,
        journal: policy.journal,
    };
    let result = executor::apply(&cfg, &plan).await;
    watcher.abort();
    let report = result?;
    print_report(&report);
    Ok(report)
}

fn print_report(report: &ApplyReport) {
    if report.operations.is_empty() {
        return;
    }
    println!();
    for op in &report.operations {
        let detail = match &op.status {
            OperationStatus::Converged => format!("{} ({:.2}s)", op.applied, op.duration_seconds),
            OperationStatus::Failed { cause } => format!("{} after {} attempt(s): {}", op.planned, op.attempts, cause),
            OperationStatus::Skipped { reason } => reason.to_string(),
        };
        println!("  [{}] {} {}", op.status, op.key, detail);
    }

    let converged = report.converged().count();
    let failed = report.failed().count();
    let skipped = report.skipped().count();
    println!(
        "\nApply {}: {} converged, {} failed, {} skipped ({:.1}s)",
        if report.is_converged() { "complete" } else { "incomplete" },
        converged,
        failed,
        skipped,
        report.total_duration.as_secs_f64()
    );
    if report.cancelled {
        println!("Apply was interrupted; re-run to resume.");
    }
}

fn apply_outcome(report: &ApplyReport) -> Result<(), CliError> {
    if report.is_converged() {
        return Ok(());
    }
    Err(CliError::Partial(format!(
        "{}: {} operation(s) failed, {} skipped",
        report.stack,
        report.failed().count(),
        report.skipped().count()
    )))
}

async fn cmd_status(state_dir: Option<&Path>, stack: Option<&str>) -> Result<(), CliError> {
    let settings = Settings::discover(Path::new("."))?;
    let root = settings.state_dir(state_dir);
    let stacks = match stack {
        Some(s) => vec![s.to_string()],
        None => state::list_stacks(&root).map_err(CliError::Setup)?,
    };

    if stacks.is_empty() {
        println!("No stacks found in {}", root.display());
        return Ok(());
    }

    for name in &stacks {
        for line in stack_status(&root, name).await? {
            println!("{}", line);
        }
    }
    Ok(())
}

async fn stack_status(root: &Path, stack: &str) -> Result<Vec<String>, CliError> {
    let dir = state::stack_dir(root, stack);
    let store = StateStore::open(root, stack)?;
    let records = store.snapshot().await;

    let mut lines = Vec::with_capacity(records.len() + 2);
    let running = if dir.join(IN_PROGRESS_MARKER).exists() {
        " [apply in progress]"
    } else {
        ""
    };
    lines.push(format!("Stack: {} ({} resources){}", stack, records.len(), running));
    for record in records.values() {
        lines.push(format!(
            "  {:<40} {:<24} {}",
            record.key().to_string(),
            record.provider_id,
            record.applied_at.as_deref().unwrap_or("-")
        ));
    }
    if let Some(exports) = store.exports()? {
        for (name, value) in &exports {
            lines.push(format!("  export {} = {}", name, value));
        }
    }
    Ok(lines)
}
