use anyhow::{Context, Result};
use stageline::cli::commands::{HistoryCommand, RunCommand, ValidateCommand};
use stageline::cli::output::*;
use stageline::cli::{Cli, Command};
use stageline::core::config::PipelineConfig;
use stageline::core::{EnvironmentContext, Run, RunStatus};
use stageline::execution::{AbortHandle, PipelineExecutor, StageLogWriter};
use stageline::notify::ReportNotifier;
use stageline::persistence::RunStore;
use stageline::runner::{CommandRunner, ProcessRunner};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::from_args();

    // Initialize logging; RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("{}", e))
        .context("Failed to set logging subscriber")?;

    // Execute command
    match &cli.command {
        Command::Run(cmd) => run_pipeline(cmd, &cli).await,
        Command::Validate(cmd) => validate_pipeline(cmd),
        Command::History(cmd) => show_history(cmd, &cli).await,
    }
}

async fn open_store(cli: &Cli) -> Result<Arc<dyn RunStore>> {
    #[cfg(feature = "sqlite")]
    {
        use stageline::persistence::SqliteRunStore;
        let store = match &cli.db {
            Some(path) => SqliteRunStore::at(path).await?,
            None => SqliteRunStore::with_default_path().await?,
        };
        Ok(Arc::new(store))
    }
    #[cfg(not(feature = "sqlite"))]
    {
        if cli.db.is_some() {
            tracing::warn!("Built without sqlite support; history is kept in memory");
        }
        Ok(Arc::new(stageline::persistence::InMemoryRunStore::new()))
    }
}

fn exit_code(status: RunStatus) -> ExitCode {
    match status {
        RunStatus::Succeeded => ExitCode::SUCCESS,
        RunStatus::Failed => ExitCode::from(1),
        RunStatus::Unstable => ExitCode::from(2),
        RunStatus::Aborted => ExitCode::from(130),
    }
}

async fn run_pipeline(cmd: &RunCommand, cli: &Cli) -> Result<ExitCode> {
    // Load pipeline config
    let config = load_config(&cmd.file)?;
    println!("{} Loaded pipeline: {}", INFO, style(&config.name).bold());

    let pipeline = config.to_pipeline().context("Invalid pipeline")?;
    let credentials = config.credential_store();
    for (key, _) in &cmd.vars {
        println!("{} Variable override: {}", INFO, style(key).cyan());
    }

    let runner = Arc::new(ProcessRunner::new());
    let notifier =
        ReportNotifier::from_config(&config.notify, runner.clone() as Arc<dyn CommandRunner>)
            .context("Invalid notify section")?;

    let engine = PipelineExecutor::new(runner)
        .with_notifier(Arc::new(notifier))
        .with_log_writer(StageLogWriter::new(&cmd.log_dir));
    let engine = if cmd.no_history {
        engine
    } else {
        engine.with_store(open_store(cli).await.context("Failed to open run history")?)
    };

    // Set up event handler for console output
    engine.add_event_handler(|event| {
        if let Some(line) = format_execution_event(&event) {
            println!("{}", line);
        }
    });

    // Ctrl-C aborts the run; running commands are killed
    let abort = AbortHandle::new();
    let on_ctrl_c = abort.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n{} Abort requested, stopping after cleanup...", STOP);
            on_ctrl_c.abort();
        }
    });

    println!();
    let run = match config.resolve_environment(&cmd.vars) {
        Ok(ctx) => {
            engine
                .execute_with_abort(&pipeline, &ctx, &credentials, &abort)
                .await
        }
        Err(e) => engine.fail_before_start(&pipeline, e).await,
    };

    print_run(&run, cmd.show_output);
    if !cmd.no_history {
        println!(
            "\n{} Run saved to history (ID: {})",
            INFO,
            style(run.id).dim()
        );
    }

    Ok(exit_code(run.status()))
}

fn load_config(path: &Path) -> Result<PipelineConfig> {
    PipelineConfig::from_file(path)
        .with_context(|| format!("Failed to load pipeline config {}", path.display()))
}

fn print_run(run: &Run, show_output: bool) {
    println!();
    println!("{}", format_run_report(run, show_output));
    if let Some(duration) = run.duration() {
        println!("  {}", style(format!("took {}", format_duration(duration))).dim());
    }
}

fn validate_pipeline(cmd: &ValidateCommand) -> Result<ExitCode> {
    println!("{} Validating pipeline...", INFO);

    let result = load_config(&cmd.file).and_then(|config| {
        // Unset environment references get placeholders so templates can be checked
        let ctx = config.resolve_environment_with(
            &|name| std::env::var(name).ok().or_else(|| Some(format!("${}", name))),
            &cmd.vars,
        )?;
        let ctx = with_run_placeholders(&ctx);
        let pipeline = config.to_pipeline()?;
        pipeline.preflight(&ctx, &config.credential_store())?;
        Ok((config, pipeline))
    });

    match result {
        Ok((config, pipeline)) => {
            println!("{} Pipeline configuration is valid!", CHECK);
            println!("  Name: {}", style(&config.name).bold());
            println!("  Stages: {}", style(pipeline.stages.len()).cyan());
            for stage in &pipeline.stages {
                let actions: Vec<_> = stage.actions.iter().map(|a| a.kind.name()).collect();
                println!(
                    "    {} {} {}",
                    style(&stage.name).bold(),
                    style(format!("when {}", stage.guard.describe())).dim(),
                    style(actions.join(", ")).cyan()
                );
            }
            println!("  Credentials: {}", style(config.credentials.len()).cyan());

            if cmd.json {
                let json = serde_json::to_string_pretty(&config)?;
                println!("\n{}", json);
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            error!("{:#}", e);
            println!("{} Validation failed:", CROSS);
            println!("  {}", style(format!("{:#}", e)).red());
            Ok(ExitCode::from(1))
        }
    }
}

/// Values the executor adds at run start
fn with_run_placeholders(ctx: &EnvironmentContext) -> EnvironmentContext {
    let mut extra = Vec::new();
    for key in ["RUN_ID", "BUILD_NUMBER"] {
        if !ctx.contains(key) {
            extra.push((key.to_string(), format!("${}", key)));
        }
    }
    ctx.with_overrides(extra)
}

async fn show_history(cmd: &HistoryCommand, cli: &Cli) -> Result<ExitCode> {
    let store = open_store(cli).await?;

    // If specific run ID is requested
    if let Some(run_id) = &cmd.run_id {
        let run_id = uuid::Uuid::parse_str(run_id).context("Invalid run ID format")?;
        match store.load_run(run_id).await? {
            Some(run) if cmd.json => println!("{}", serde_json::to_string_pretty(&run)?),
            Some(run) => {
                println!("{} Run {}", INFO, style(run.id).cyan());
                if let Some(number) = run.build_number {
                    println!("  Build: #{}", number);
                }
                println!("  Started: {}", style(run.started_at.to_rfc3339()).dim());
                print_run(&run, false);
            }
            None => {
                println!("{} Run not found", WARN);
                return Ok(ExitCode::from(1));
            }
        }
        return Ok(ExitCode::SUCCESS);
    }

    let runs = store.list_runs(cmd.pipeline.as_deref(), cmd.limit).await?;

    if cmd.json {
        let data = serde_json::json!({ "runs": runs });
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(ExitCode::SUCCESS);
    }

    if runs.is_empty() {
        println!("{} No runs found", INFO);
        return Ok(ExitCode::SUCCESS);
    }

    println!("{} Run history (showing latest {}):", INFO, cmd.limit);
    for summary in &runs {
        println!("  {}", format_run_summary(summary));
    }

    Ok(ExitCode::SUCCESS)
}
