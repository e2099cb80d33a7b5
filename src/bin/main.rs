use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use run_orchestrator::model::ModelSystemBuilder;
use run_orchestrator::remote::serve;
use run_orchestrator::{
    ModelSystemDocument, ModuleRegistry, OrchestratorConfig, RunController, RunEvent, RunName,
    RunPhase, create_run,
};

#[derive(Parser)]
#[command(name = "run-orchestrator")]
#[command(about = "Validate, schedule and execute model system runs")]
struct Cli {
    /// Configuration file (defaults to the usual lookup locations)
    #[arg(long, global = true, env = "RUN_ORCHESTRATOR_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Worker process entry point; launched by a remote host
    Client {
        /// Socket the host is listening on
        #[arg(long)]
        pipe: PathBuf,
    },
    /// Execute a model system document and stream its events
    Run {
        /// Model system document (JSON)
        document: PathBuf,
        /// Run name (defaults to the document's file stem)
        #[arg(long)]
        name: Option<String>,
        /// Run directory (defaults to <projects>/<model system>/<run name>)
        #[arg(long)]
        directory: Option<PathBuf>,
        /// Execute in a separate worker process
        #[arg(long, default_value_t = false)]
        remote: bool,
        /// Clear the run directory first
        #[arg(long, default_value_t = false)]
        overwrite: bool,
        /// Start after this many seconds
        #[arg(long)]
        delay_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout of a worker is relayed to its host; keep logs on stderr
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("run_orchestrator=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => OrchestratorConfig::load_from(path)
            .with_context(|| format!("Unable to load configuration {}", path.display()))?,
        None => OrchestratorConfig::load()?,
    };
    let builder: Arc<dyn ModelSystemBuilder> = Arc::new(ModuleRegistry::with_builtins());

    match cli.command {
        Commands::Client { pipe } => {
            serve(&pipe, builder, Arc::new(config)).await?;
        }
        Commands::Run {
            document,
            name,
            directory,
            remote,
            overwrite,
            delay_secs,
        } => {
            let text = std::fs::read_to_string(&document)
                .with_context(|| format!("Unable to read {}", document.display()))?;
            let model_system = ModelSystemDocument::from_text(&text)
                .with_context(|| format!("{} is not a model system document", document.display()))?;

            let name = name.unwrap_or_else(|| {
                document
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "run".to_string())
            });
            let mut config = config;
            if remote {
                config.run_in_separate_process = true;
            }
            let directory =
                directory.unwrap_or_else(|| config.run_directory(&model_system.root.name, &name));
            let config = Arc::new(config);

            let run = create_run(
                config.clone(),
                builder,
                RunName::new(name),
                directory,
                model_system,
                overwrite,
            )?;
            let (events_tx, mut events) = tokio::sync::mpsc::unbounded_channel();
            run.subscribe(Arc::new(move |event: &RunEvent| {
                let _ = events_tx.send(event.clone());
            }));

            let controller = RunController::new(&config);
            match delay_secs {
                Some(secs) => {
                    let start = Utc::now() + chrono::Duration::seconds(secs as i64);
                    info!("Run `{}` will start at {}", run.name(), start);
                    controller.execute_delayed_run(run.clone(), start);
                }
                None => controller.execute_run(run.clone(), false),
            }

            loop {
                tokio::select! {
                    Some(event) = events.recv() => {
                        report(&event);
                        if event.is_terminal() {
                            break;
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        warn!("Interrupted; cancelling run `{}`", run.name());
                        controller.cancel_run(run.as_ref());
                        // a run still waiting in the queue finishes without an event
                        if run.phase().is_terminal() {
                            break;
                        }
                    }
                }
            }

            if run.phase() != RunPhase::Completed {
                bail!("Run `{}` ended in {}", run.name(), run.phase().as_str());
            }
        }
    }

    Ok(())
}

fn report(event: &RunEvent) {
    match event {
        RunEvent::ValidationStarting => info!("Validating model system"),
        RunEvent::RunStarted => info!("Model system running"),
        RunEvent::Message(text) => info!("{}", text),
        RunEvent::ModelSystemSaved(_) => info!("Model system saved an updated copy of itself"),
        RunEvent::ValidationError(errors) | RunEvent::RuntimeValidationError(errors) => {
            for e in errors {
                error!("{}", e);
            }
        }
        RunEvent::RuntimeError(e) => {
            error!("{}", e);
            if let Some(trace) = &e.stack_trace {
                error!("{}", trace);
            }
        }
        RunEvent::Completed => info!("Run completed"),
        RunEvent::Cancelled => warn!("Run cancelled"),
    }
}
