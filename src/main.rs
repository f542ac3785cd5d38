// hrflow - command line front end for the HR workflow engine
//
// Every invocation restores the engine from the snapshot file, runs one
// command, waits for any integration dispatches it started and writes the
// snapshot back.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;
use uuid::Uuid;

use hr_workflow_engine::config::{ConfigManager, ConfigPaths, EngineConfig, LogLevel};
use hr_workflow_engine::exception::{ExceptionFilter, NewException, Severity, WorkflowException};
use hr_workflow_engine::integration::{
    HttpProvider, IntegrationProvider, IntegrationType, ProviderRegistry, RetryPolicies,
    RetryPolicy, SimulatedProvider, SimulatedReply,
};
use hr_workflow_engine::template::{
    load_template_file, AssigneeRole, StepDefinition, StepType, TemplateDraft, TemplateRef,
    WorkflowType,
};
use hr_workflow_engine::workflow::{
    StepStatus, StepUpdate, WorkflowEvent, WorkflowFilter, WorkflowStatus, WorkflowView,
};
use hr_workflow_engine::{FileStateStore, StateStore, WorkflowError, WorkflowService};

/// hrflow - employee lifecycle workflow engine
#[derive(Parser)]
#[command(name = "hrflow")]
#[command(about = "Run onboarding, offboarding and other employee lifecycle workflows")]
#[command(version)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration directory
    #[arg(long, global = true, env = "HRFLOW_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Print engine events as they happen
    #[arg(long, global = true)]
    events: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List stored templates
    Templates,
    /// Load template definitions from a directory
    Load {
        /// Directory to scan; defaults to the configured templates directory
        dir: Option<PathBuf>,
    },
    /// Validate a template file without storing it
    Validate { file: PathBuf },
    /// Check the engine configuration
    CheckConfig,
    /// Start a workflow for an employee
    Initiate {
        employee: String,
        /// Template name or id
        template: String,
        #[arg(long, default_value = "hr-admin")]
        by: String,
    },
    /// Show a workflow and its steps
    Show { workflow: Uuid },
    /// List workflows
    List {
        #[arg(long)]
        employee: Option<String>,
        #[arg(long)]
        status: Option<WorkflowStatus>,
    },
    /// Start a step
    Start { step: Uuid },
    /// Complete a step
    Complete {
        step: Uuid,
        #[arg(long, default_value = "hr-admin")]
        by: String,
    },
    /// Skip a step
    Skip {
        step: Uuid,
        #[arg(long)]
        reason: String,
        #[arg(long, default_value = "hr-admin")]
        by: String,
    },
    /// Assign a step to a person
    Assign { step: Uuid, assignee: String },
    /// Re-dispatch an in-progress integration step
    Dispatch { step: Uuid },
    /// Cancel a workflow
    Cancel {
        workflow: Uuid,
        #[arg(long, default_value = "hr-admin")]
        by: String,
    },
    /// Put a workflow on hold
    Hold { workflow: Uuid },
    /// Resume an on-hold workflow
    Resume { workflow: Uuid },
    /// Recompute workflow progress
    Progress { workflow: Uuid },
    /// Move a workflow to its next stage
    Advance { workflow: Uuid },
    /// List exceptions
    Exceptions {
        #[arg(long)]
        workflow: Option<Uuid>,
        /// Include resolved exceptions
        #[arg(long)]
        all: bool,
    },
    /// Flag a problem on a workflow
    Raise {
        workflow: Uuid,
        title: String,
        #[arg(long)]
        step: Option<Uuid>,
        #[arg(long, default_value = "medium")]
        severity: Severity,
        #[arg(long, default_value = "hr-admin")]
        by: String,
    },
    /// Resolve an exception
    Resolve {
        exception: Uuid,
        #[arg(long)]
        notes: Option<String>,
        #[arg(long, default_value = "hr-admin")]
        by: String,
    },
    /// Organisation-wide summary
    Dashboard,
    /// Run a standard onboarding end to end against simulated providers
    Demo,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = run(args).await {
        match e.downcast_ref::<WorkflowError>() {
            Some(err) => eprintln!("Error [{}]: {}", err.kind().as_str(), err),
            None => eprintln!("Error: {:#}", e),
        }
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let config_dir = match &args.config_dir {
        Some(dir) => dir.clone(),
        None => ConfigPaths::default_config_dir()?,
    };
    let mut manager = ConfigManager::with_config_dir(&config_dir).await?;
    manager.apply_overrides(|name| std::env::var(name).ok());

    let _guard = init_logging(args.verbose, manager.config())?;
    tracing::debug!("Using configuration directory {:?}", manager.config_dir());

    match &args.command {
        Command::Demo => return run_demo(args.events).await,
        Command::CheckConfig => return check_config(&manager),
        Command::Validate { file } => return validate_file(file),
        _ => {}
    }

    let providers = build_providers(manager.config());
    let (service, receiver) =
        WorkflowService::with_event_reporting(providers, manager.config().retry.clone());
    let printer = spawn_event_printer(receiver, args.events);

    let store = FileStateStore::new(manager.state_file())?;
    if !service.load_from(&store).await? {
        let templates_dir = manager.templates_dir();
        if templates_dir.is_dir() {
            let report = service.load_templates(&templates_dir).await?;
            tracing::info!("Loaded {} templates into a fresh state", report.loaded.len());
        }
    }

    let mutated = run_command(&service, &manager, args.command).await;
    service.drain_background().await;
    if matches!(mutated, Ok(true)) {
        service
            .save_to(&store)
            .await
            .with_context(|| format!("Failed to save state to {}", store.path().display()))?;
    }

    drop(service);
    let _ = printer.await;
    mutated.map(|_| ())
}

/// Run one command; returns whether state may have changed
async fn run_command(service: &WorkflowService, manager: &ConfigManager, command: Command) -> Result<bool> {
    match command {
        Command::Templates => {
            let templates = service.list_templates().await;
            if templates.is_empty() {
                println!("No templates stored. Load some with: hrflow load <dir>");
            }
            for template in templates {
                println!(
                    "  {} v{} [{}] {} - {} steps",
                    template.name,
                    template.version,
                    template.status,
                    template.workflow_type,
                    template.steps.len()
                );
                println!("    id: {}", template.id);
            }
            Ok(false)
        }
        Command::Load { dir } => {
            let dir = dir.unwrap_or_else(|| manager.templates_dir());
            let report = service.load_templates(&dir).await?;
            for template in &report.loaded {
                println!("  ✓ {} ({} steps)", template.name, template.steps.len());
            }
            for (path, reason) in &report.failures {
                println!("  ✗ {}: {}", path.display(), reason);
            }
            Ok(!report.loaded.is_empty())
        }
        Command::Initiate { employee, template, by } => {
            let view = service
                .initiate_workflow(&employee, &TemplateRef::parse(&template), &by)
                .await?;
            println!("Initiated workflow {}", view.workflow.id);
            print_view(&service.get_workflow(view.workflow.id).await?);
            Ok(true)
        }
        Command::Show { workflow } => {
            print_view(&service.get_workflow(workflow).await?);
            let records = service.list_integrations(workflow).await?;
            if !records.is_empty() {
                println!("\n  Integrations:");
                for record in records {
                    println!(
                        "    {} {} retries={}/{} {}",
                        record.integration_type,
                        record.status,
                        record.retry_count,
                        record.max_retries,
                        record.error_message.unwrap_or_default()
                    );
                }
            }
            Ok(false)
        }
        Command::List { employee, status } => {
            let filter = WorkflowFilter {
                employee_id: employee,
                status,
                ..WorkflowFilter::default()
            };
            for workflow in service.list_workflows(&filter).await {
                println!(
                    "  {} {} [{}] {}% stage={} employee={}",
                    workflow.id,
                    workflow.name,
                    workflow.status,
                    workflow.progress,
                    workflow.current_stage,
                    workflow.employee_id
                );
            }
            Ok(false)
        }
        Command::Start { step } => {
            print_update("Started", &service.start_step(step).await?);
            Ok(true)
        }
        Command::Complete { step, by } => {
            print_update("Completed", &service.complete_step(step, &by).await?);
            Ok(true)
        }
        Command::Skip { step, reason, by } => {
            print_update("Skipped", &service.skip_step(step, &by, &reason).await?);
            Ok(true)
        }
        Command::Assign { step, assignee } => {
            let step = service.assign_step(step, &assignee).await?;
            println!("Assigned '{}' to {}", step.name, assignee);
            Ok(true)
        }
        Command::Dispatch { step } => {
            let current = service.get_step(step).await?;
            let binding = current
                .integration
                .with_context(|| format!("Step '{}' has no integration binding", current.key))?;
            let report = service
                .dispatch(step, binding.integration_type, None)
                .await?;
            println!(
                "Dispatch {:?} after {} attempt(s)",
                report.status, report.attempts
            );
            Ok(true)
        }
        Command::Cancel { workflow, by } => {
            let workflow = service.cancel_workflow(workflow, &by).await?;
            println!("Workflow {} is {}", workflow.id, workflow.status);
            Ok(true)
        }
        Command::Hold { workflow } => {
            let workflow = service.hold_workflow(workflow).await?;
            println!("Workflow {} is {}", workflow.id, workflow.status);
            Ok(true)
        }
        Command::Resume { workflow } => {
            let workflow = service.resume_workflow(workflow).await?;
            println!("Workflow {} is {}", workflow.id, workflow.status);
            Ok(true)
        }
        Command::Progress { workflow } => {
            let progress = service.check_workflow_progress(workflow).await?;
            println!(
                "{}% [{}] stage={} completed={} skipped={} in-progress={} pending={} failed={} blocked={}",
                progress.progress,
                progress.status,
                progress.current_stage,
                progress.completed,
                progress.skipped,
                progress.in_progress,
                progress.pending,
                progress.failed,
                progress.blocked
            );
            Ok(true)
        }
        Command::Advance { workflow } => {
            let advance = service.advance_stage(workflow).await?;
            if advance.advanced {
                println!("Advanced from '{}' to '{}'", advance.previous_stage, advance.current_stage);
            } else {
                println!("Still in stage '{}'", advance.current_stage);
            }
            Ok(advance.advanced)
        }
        Command::Exceptions { workflow, all } => {
            let mut filter = if all {
                ExceptionFilter::default()
            } else {
                ExceptionFilter::open()
            };
            filter.workflow_id = workflow;
            let exceptions = service.list_exceptions(&filter).await;
            if exceptions.is_empty() {
                println!("No exceptions");
            }
            for exception in &exceptions {
                print_exception(exception);
            }
            Ok(false)
        }
        Command::Raise { workflow, title, step, severity, by } => {
            let mut new = NewException::manual(workflow, severity, title, by);
            if let Some(step) = step {
                new = new.for_step(step);
            }
            print_exception(&service.raise_exception(new).await?);
            Ok(true)
        }
        Command::Resolve { exception, notes, by } => {
            print_exception(&service.resolve_exception(exception, &by, notes).await?);
            Ok(true)
        }
        Command::Dashboard => {
            let dashboard = service.dashboard(Utc::now()).await;
            println!("Workflows: {}", dashboard.total_workflows);
            println!(
                "  active={} on-hold={} completed={} cancelled={}",
                dashboard.active, dashboard.on_hold, dashboard.completed, dashboard.cancelled
            );
            println!(
                "  overdue workflows={} overdue steps={}",
                dashboard.overdue_workflows, dashboard.overdue_steps
            );
            for (workflow_type, count) in &dashboard.live_by_type {
                println!("  {}: {}", workflow_type, count);
            }
            let backlog = service.exception_backlog().await;
            println!("Open exceptions: {}", backlog.total_open);
            for (severity, count) in backlog.by_severity.iter().rev() {
                println!("  {}: {}", severity, count);
            }
            Ok(false)
        }
        Command::Demo | Command::CheckConfig | Command::Validate { .. } => Ok(false),
    }
}

fn check_config(manager: &ConfigManager) -> Result<()> {
    let result = manager.validate();
    println!("Configuration: {}", manager.config_file().display());
    for error in &result.errors {
        println!("  ✗ {}", error);
    }
    for warning in &result.warnings {
        println!("  ! {}", warning);
    }
    if !result.is_valid {
        anyhow::bail!("Configuration has {} error(s)", result.errors.len());
    }
    println!("  ✓ valid");
    Ok(())
}

fn validate_file(file: &Path) -> Result<()> {
    let draft = load_template_file(file)?;
    println!("✓ {} ({} steps) is valid", draft.name, draft.steps.len());
    Ok(())
}

/// Live HTTP providers where an endpoint is configured, simulated ones elsewhere
fn build_providers(config: &EngineConfig) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    for integration_type in IntegrationType::ALL {
        let provider: Arc<dyn IntegrationProvider> = match config.providers.for_type(integration_type) {
            Some(endpoint) => Arc::new(HttpProvider::new(integration_type, endpoint)),
            None => {
                tracing::debug!("No endpoint for {}; using the simulated provider", integration_type);
                Arc::new(SimulatedProvider::new(integration_type))
            }
        };
        registry.register(provider);
    }
    registry
}

fn spawn_event_printer(
    mut receiver: mpsc::UnboundedReceiver<WorkflowEvent>,
    enabled: bool,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            if !enabled {
                continue;
            }
            match serde_json::to_string(&event) {
                Ok(line) => println!("  · {}", line),
                Err(e) => tracing::warn!("Failed to render event: {}", e),
            }
        }
    })
}

fn print_view(view: &WorkflowView) {
    let workflow = &view.workflow;
    println!(
        "{} for {} [{}] {}% stage={}",
        workflow.name, workflow.employee_id, workflow.status, workflow.progress, workflow.current_stage
    );
    let eligible: Vec<Uuid> = view.eligible_steps().iter().map(|s| s.id).collect();
    for step in &view.steps {
        let marker = match step.status {
            StepStatus::Completed => "✓",
            StepStatus::Skipped => "-",
            StepStatus::InProgress => "→",
            StepStatus::Failed => "✗",
            StepStatus::Blocked => "#",
            StepStatus::Pending if eligible.contains(&step.id) => "○",
            StepStatus::Pending => " ",
        };
        println!(
            "  {} {:<2} {:<28} {:<12} {:<12} {}",
            marker, step.order, step.name, step.stage, step.status, step.id
        );
    }
}

fn print_update(verb: &str, update: &StepUpdate) {
    if update.changed {
        println!("{} '{}' ({}%)", verb, update.step.name, update.progress);
    } else {
        println!("'{}' was already {}", update.step.name, update.step.status);
    }
    if update.workflow_status == WorkflowStatus::Completed {
        println!("✓ Workflow completed");
    }
}

fn print_exception(exception: &WorkflowException) {
    println!(
        "  {} [{}] {} {}: {}",
        exception.id, exception.severity, exception.status, exception.exception_type, exception.title
    );
    if !exception.description.is_empty() {
        println!("      {}", exception.description);
    }
}

/// Standard onboarding against simulated providers, in memory
async fn run_demo(show_events: bool) -> Result<()> {
    let background_check = Arc::new(
        SimulatedProvider::new(IntegrationType::BackgroundCheck).with_script([
            SimulatedReply::Fail("Provider busy".to_string()),
            SimulatedReply::Fail("Provider busy".to_string()),
        ]),
    );
    let providers = ProviderRegistry::new()
        .with(Arc::new(SimulatedProvider::new(IntegrationType::Docusign)))
        .with(background_check.clone());
    let policies = RetryPolicies::uniform(RetryPolicy {
        base_delay: std::time::Duration::from_millis(50),
        attempt_timeout: std::time::Duration::from_secs(2),
        ..RetryPolicy::default()
    });

    let (service, receiver) = WorkflowService::with_event_reporting(providers, policies);
    let printer = spawn_event_printer(receiver, show_events);

    service.create_template(demo_template()).await?;
    let view = service
        .initiate_workflow("emp-demo", &TemplateRef::from("standard-onboarding"), "hr-demo")
        .await?;
    let id = view.workflow.id;
    let step = |key: &str| -> Result<Uuid> {
        view.step(key)
            .map(|s| s.id)
            .with_context(|| format!("Demo template has no step '{}'", key))
    };
    println!("Initiated {}\n", id);

    service.complete_step(step("send-offer")?, "hr-demo").await?;
    println!("Offer sent; signature and background check run automatically");
    service.drain_background().await;
    println!(
        "Background check needed {} attempts\n",
        background_check.calls()
    );

    service.complete_step(step("provision-laptop")?, "it-demo").await?;
    service
        .skip_step(step("benefits-enrollment")?, "hr-demo", "Employee waived benefits")
        .await?;
    while service.advance_stage(id).await?.advanced {}
    service.start_step(step("manager-welcome")?).await?;
    service.complete_step(step("manager-welcome")?, "mgr-demo").await?;

    let progress = service.check_workflow_progress(id).await?;
    print_view(&service.get_workflow(id).await?);
    println!("\nFinal: {}% [{}]", progress.progress, progress.status);

    drop(service);
    let _ = printer.await;
    Ok(())
}

fn demo_template() -> TemplateDraft {
    TemplateDraft::new(
        "standard-onboarding",
        WorkflowType::Onboarding,
        vec![
            StepDefinition::new("send-offer", 1, "Send offer letter", StepType::Document, AssigneeRole::Hr)
                .in_stage("pre-boarding"),
            StepDefinition::new("sign-offer", 2, "Collect offer signature", StepType::Integration, AssigneeRole::Employee)
                .in_stage("pre-boarding")
                .depends_on("send-offer")
                .auto_triggered()
                .with_integration(IntegrationType::Docusign, serde_json::json!({"envelope": "offer-letter"})),
            StepDefinition::new("background-check", 3, "Background check", StepType::Integration, AssigneeRole::Hr)
                .in_stage("pre-boarding")
                .depends_on("sign-offer")
                .auto_triggered()
                .with_integration(IntegrationType::BackgroundCheck, serde_json::json!({"package": "standard"})),
            StepDefinition::new("provision-laptop", 4, "Provision laptop", StepType::Manual, AssigneeRole::It)
                .in_stage("day-1")
                .depends_on("background-check"),
            StepDefinition::new("benefits-enrollment", 5, "Benefits enrollment", StepType::Document, AssigneeRole::Employee)
                .in_stage("day-1")
                .depends_on("sign-offer")
                .optional(),
            StepDefinition::new("manager-welcome", 6, "Manager welcome", StepType::Approval, AssigneeRole::Manager)
                .in_stage("week-1")
                .depends_on("provision-laptop"),
        ],
    )
}

/// Initialize logging from configuration and verbosity
fn init_logging(verbose: bool, config: &EngineConfig) -> Result<Option<WorkerGuard>> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let log_level = if verbose { LogLevel::Debug } else { config.log_level };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("hr_workflow_engine={},hrflow={}", log_level, log_level).into());

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "hrflow.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    Ok(guard)
}
