//! The worker process's main loop: connect to the host, run what it asks
//! for, and report back until told to exit.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::client::RemoteClientRun;
use super::protocol::{ClientMessage, HostMessage, RunRequest, ValidationStage};
use crate::config::OrchestratorConfig;
use crate::error::ErrorWithPath;
use crate::model::{ModelSystemBuilder, ReportChange};
use crate::run::{Run, RunEvent};

/// Serve one host connection on `pipe` until the host kills the run or
/// goes away.
pub async fn serve(
    pipe: &Path,
    builder: Arc<dyn ModelSystemBuilder>,
    config: Arc<OrchestratorConfig>,
) -> anyhow::Result<()> {
    let stream = UnixStream::connect(pipe)
        .await
        .with_context(|| format!("Unable to connect to host at {}", pipe.display()))?;
    info!("Connected to host at {}", pipe.display());
    let (mut reader, mut writer) = stream.into_split();

    // one writer task keeps frames from interleaving
    let (outgoing, mut queue) = mpsc::unbounded_channel::<ClientMessage>();
    let writer_task = tokio::spawn(async move {
        while let Some(message) = queue.recv().await {
            if let Err(e) = message.write_to(&mut writer).await {
                warn!("Unable to write to host: {}", e);
                break;
            }
            if message == ClientMessage::Exiting {
                break;
            }
        }
    });

    let _ = outgoing.send(ClientMessage::Ready);
    let heartbeat = spawn_heartbeat(outgoing.clone(), config.heartbeat_interval());

    let mut session = ClientSession {
        run: None,
        outgoing: outgoing.clone(),
        builder,
        config,
    };

    loop {
        let message = match HostMessage::read_from(&mut reader).await {
            Ok(message) => message,
            Err(e) if e.is_disconnect() => {
                info!("Host closed the channel");
                break;
            }
            Err(e) => {
                warn!("Unreadable message from host: {}", e);
                let _ = outgoing.send(ClientMessage::RuntimeError(e.to_string()));
                break;
            }
        };
        debug!("Host sent {:?}", message.opcode());

        match message {
            HostMessage::Heartbeat => {}
            HostMessage::RunModelSystem(request) => session.run_model_system(request),
            HostMessage::CancelModelRun => {
                if let Some(run) = &session.run {
                    run.exit_request();
                }
            }
            HostMessage::KillModelRun => break,
            HostMessage::RequestProgress => {
                let message = match &session.run {
                    Some(run) => ClientMessage::Progress {
                        progress: run.poll_progress(),
                        reports: run.poll_progress_reports(),
                    },
                    None => ClientMessage::Progress {
                        progress: 0.0,
                        reports: Vec::new(),
                    },
                };
                let _ = outgoing.send(message);
            }
            HostMessage::RequestStatus => {
                let status = session.run.as_ref().map(|r| r.poll_status_message()).unwrap_or_default();
                let _ = outgoing.send(ClientMessage::Status(status));
            }
        }
    }

    session.stop().await;
    heartbeat.abort();
    let _ = outgoing.send(ClientMessage::Exiting);
    if let Err(e) = writer_task.await {
        debug!("Writer task ended abnormally: {}", e);
    }
    Ok(())
}

struct ClientSession {
    run: Option<Arc<RemoteClientRun>>,
    outgoing: mpsc::UnboundedSender<ClientMessage>,
    builder: Arc<dyn ModelSystemBuilder>,
    config: Arc<OrchestratorConfig>,
}

impl ClientSession {
    fn run_model_system(&mut self, request: RunRequest) {
        if self.run.is_some() {
            let _ = self.outgoing.send(ClientMessage::RuntimeError(
                "A model system is already running in this worker".to_string(),
            ));
            return;
        }

        let config = match OrchestratorConfig::from_reference(&request.config) {
            Ok(config) => Arc::new(config),
            Err(e) => {
                warn!("Unable to load configuration `{}`: {:#}", request.config, e);
                let _ = self.outgoing.send(ClientMessage::RuntimeError(format!(
                    "Unable to load configuration `{}`; using the worker's own",
                    request.config
                )));
                self.config.clone()
            }
        };

        info!("Running model system for `{}`", request.run_name);
        let run = RemoteClientRun::new(
            request.run_name,
            request.run_directory,
            &request.model_system,
            self.builder.clone(),
            config,
        )
        .overwrite(request.overwrite);

        let outgoing = self.outgoing.clone();
        run.subscribe(Arc::new(move |event: &RunEvent| {
            if let Some(message) = report(event) {
                let _ = outgoing.send(message);
            }
        }));
        let outgoing = self.outgoing.clone();
        run.observe_reports(Arc::new(move |change: &ReportChange| {
            let _ = outgoing.send(report_change(change));
        }));

        let run = Arc::new(run);
        if let Err(e) = run.start() {
            let _ = self
                .outgoing
                .send(ClientMessage::ErrorWhenRunning(ErrorWithPath::unattributed(e.to_string())));
        }
        self.run = Some(run);
    }

    /// Stop the run, if any, and wait for it to settle.
    async fn stop(&mut self) {
        let Some(run) = self.run.take() else {
            return;
        };
        run.terminate_run();
        let settle = self.config.termination_grace_period() + Duration::from_secs(1);
        let waited = tokio::task::spawn_blocking(move || run.wait_timeout(settle)).await;
        if !matches!(waited, Ok(true)) {
            warn!("Run did not settle within {:?}", settle);
        }
    }
}

/// The message, if any, a run event becomes on the wire.
fn report(event: &RunEvent) -> Option<ClientMessage> {
    match event {
        RunEvent::ValidationError(errors) => Some(ClientMessage::ErrorValidating {
            stage: ValidationStage::Structural,
            errors: errors.clone(),
        }),
        RunEvent::RuntimeValidationError(errors) => Some(ClientMessage::ErrorValidating {
            stage: ValidationStage::Runtime,
            errors: errors.clone(),
        }),
        RunEvent::RuntimeError(error) => Some(ClientMessage::ErrorWhenRunning(error.clone())),
        RunEvent::Completed => Some(ClientMessage::Finished),
        RunEvent::ModelSystemSaved(text) => Some(ClientMessage::ModelSystemResult(text.clone())),
        RunEvent::Message(text) => {
            // stdout is relayed to the host line by line
            println!("{}", text);
            None
        }
        RunEvent::ValidationStarting | RunEvent::RunStarted | RunEvent::Cancelled => None,
    }
}

fn report_change(change: &ReportChange) -> ClientMessage {
    match change {
        ReportChange::Created { name, colour } => ClientMessage::ReportCreated {
            name: name.clone(),
            colour: *colour,
        },
        ReportChange::Removed(name) => ClientMessage::ReportRemoved(name.clone()),
        ReportChange::Cleared => ClientMessage::ReportsCleared,
    }
}

fn spawn_heartbeat(outgoing: mpsc::UnboundedSender<ClientMessage>, period: Duration) -> JoinHandle<()> {
    let period = period.max(Duration::from_millis(10));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if outgoing.send(ClientMessage::Heartbeat).is_err() {
                break;
            }
        }
    })
}
