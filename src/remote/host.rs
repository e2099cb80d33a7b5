//! Host side of a remote run: spawns a worker process and drives it over a
//! Unix domain socket.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{Context, bail};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::UnixListener;
use tokio::net::unix::OwnedWriteHalf;
use tokio::process::{Child, Command};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::protocol::{ClientMessage, HostMessage, RunRequest, ValidationStage};
use crate::config::OrchestratorConfig;
use crate::error::{ErrorWithPath, ProtocolError, RunError};
use crate::model::{ModelSystemDocument, ProgressReport, ProgressReports};
use crate::run::{Run, RunCore, RunEvent, RunPhase};
use crate::types::{Colour, RunName};

/// A run executed by a separate worker process.
pub struct RemoteHostRun {
    shared: Arc<HostShared>,
    handle: Handle,
    model_system: String,
    overwrite: bool,
}

/// State shared between the caller-facing run and its background tasks.
pub(crate) struct HostShared {
    core: Arc<RunCore>,
    config: Arc<OrchestratorConfig>,
    channel: PathBuf,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    child: tokio::sync::Mutex<Option<Child>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    progress: AtomicU32,
    status: Mutex<String>,
    /// Mirror of the worker's named reports.
    reports: ProgressReports,
    kill_requested: AtomicBool,
    /// Wakes a host still waiting for its worker to connect.
    kill_signal: Notify,
}

impl RemoteHostRun {
    /// Prepare a remote run. Nothing is spawned until [`Run::start`].
    pub fn new(
        name: RunName,
        run_directory: impl Into<PathBuf>,
        document: ModelSystemDocument,
        config: Arc<OrchestratorConfig>,
        handle: Handle,
    ) -> Result<Self, RunError> {
        let model_system = document.to_text()?;
        let core = Arc::new(RunCore::new(name, run_directory));
        let channel = std::env::temp_dir().join(format!("run-orchestrator-{}.sock", Uuid::new_v4()));
        Ok(Self {
            shared: Arc::new(HostShared::new(core, config, channel)),
            handle,
            model_system,
            overwrite: false,
        })
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Socket the worker connects to.
    pub fn channel(&self) -> &Path {
        &self.shared.channel
    }

    fn send_detached(&self, message: HostMessage) {
        let shared = self.shared.clone();
        self.handle.spawn(async move {
            if let Err(e) = shared.send(&message).await {
                debug!("Unable to send {:?} to worker: {}", message.opcode(), e);
            }
        });
    }

    fn is_live(&self) -> bool {
        self.core().is_started() && !self.core().is_finished()
    }

    fn request_kill(&self) {
        self.shared.kill_requested.store(true, Ordering::SeqCst);
        self.shared.kill_signal.notify_one();
        self.send_detached(HostMessage::KillModelRun);
    }
}

impl Run for RemoteHostRun {
    fn core(&self) -> &RunCore {
        &self.shared.core
    }

    fn runs_remotely(&self) -> bool {
        true
    }

    fn start(&self) -> Result<(), RunError> {
        self.core().try_begin()?;
        let request = RunRequest {
            config: self.shared.config.reference(),
            run_name: self.name().clone(),
            run_directory: self.run_directory().to_path_buf(),
            overwrite: self.overwrite,
            model_system: self.model_system.clone(),
        };
        let shared = self.shared.clone();
        let driver = self.handle.spawn(async move { shared.drive(request).await });
        *self.shared.driver.lock() = Some(driver);
        Ok(())
    }

    fn exit_request(&self) -> bool {
        if self.is_live() {
            self.request_kill();
        }
        true
    }

    fn deep_exit_request(&self) -> bool {
        self.exit_request()
    }

    fn terminate_run(&self) {
        if self.core().cancel_unstarted() || self.core().is_finished() {
            return;
        }
        self.request_kill();

        let shared = self.shared.clone();
        let grace = shared.config.termination_grace_period();
        self.handle.spawn(async move {
            tokio::time::sleep(grace).await;
            if shared.core.is_finished() {
                return;
            }
            warn!(
                "Remote run `{}` did not stop within {:?}; killing its worker",
                shared.core.name(),
                grace
            );
            if let Some(child) = shared.child.lock().await.as_mut() {
                if let Err(e) = child.start_kill() {
                    warn!("Unable to kill worker process: {}", e);
                }
            }
            shared.core.finish(RunEvent::Cancelled);
            if let Some(driver) = shared.driver.lock().take() {
                driver.abort();
            }
            shared.remove_channel();
        });
    }

    fn poll_progress(&self) -> f32 {
        if self.is_live() {
            self.send_detached(HostMessage::RequestProgress);
        }
        f32::from_bits(self.shared.progress.load(Ordering::SeqCst))
    }

    fn poll_status_message(&self) -> String {
        if self.is_live() {
            self.send_detached(HostMessage::RequestStatus);
        }
        self.shared.status.lock().clone()
    }

    fn poll_colour(&self) -> Colour {
        Colour::DEFAULT
    }

    /// Values are as of the last progress reply; polling asks for a fresh one.
    fn poll_progress_reports(&self) -> Vec<ProgressReport> {
        if self.is_live() {
            self.send_detached(HostMessage::RequestProgress);
        }
        self.shared.reports.snapshot()
    }
}

impl HostShared {
    pub(crate) fn new(core: Arc<RunCore>, config: Arc<OrchestratorConfig>, channel: PathBuf) -> Self {
        Self {
            core,
            config,
            channel,
            writer: tokio::sync::Mutex::new(None),
            child: tokio::sync::Mutex::new(None),
            driver: Mutex::new(None),
            progress: AtomicU32::new(0f32.to_bits()),
            status: Mutex::new(String::new()),
            reports: ProgressReports::new(),
            kill_requested: AtomicBool::new(false),
            kill_signal: Notify::new(),
        }
    }

    async fn drive(self: Arc<Self>, request: RunRequest) {
        self.core.set_phase(RunPhase::Validating);
        self.core.emit(RunEvent::ValidationStarting);

        if let Err(e) = self.session(request).await {
            let event = if self.kill_requested.load(Ordering::SeqCst) {
                RunEvent::Cancelled
            } else {
                error!("Remote run `{}` failed: {:#}", self.core.name(), e);
                RunEvent::RuntimeError(ErrorWithPath::unattributed(format!("{:#}", e)))
            };
            self.core.finish(event);
        }
        self.shutdown().await;
    }

    async fn session(self: &Arc<Self>, request: RunRequest) -> anyhow::Result<()> {
        // stale socket left by a crashed host
        let _ = std::fs::remove_file(&self.channel);
        let listener = UnixListener::bind(&self.channel)
            .with_context(|| format!("Unable to bind {}", self.channel.display()))?;

        if self.config.launch_client {
            self.launch_client().await?;
        } else {
            info!(
                "Waiting for a worker to connect on {} for run `{}`",
                self.channel.display(),
                self.core.name()
            );
        }

        let accepted = tokio::select! {
            accepted = timeout(self.config.connect_timeout(), listener.accept()) => accepted,
            _ = self.kill_signal.notified() => {
                info!("Run `{}` cancelled before its worker connected", self.core.name());
                self.core.finish(RunEvent::Cancelled);
                return Ok(());
            }
        };
        let stream = match accepted {
            Ok(accepted) => accepted.context("Failed to accept worker connection")?.0,
            Err(_) => bail!("Worker did not connect within {:?}", self.config.connect_timeout()),
        };
        let (mut reader, writer) = stream.into_split();
        *self.writer.lock().await = Some(writer);
        if self.kill_requested.load(Ordering::SeqCst) {
            self.core.finish(RunEvent::Cancelled);
            return Ok(());
        }

        self.send(&HostMessage::RunModelSystem(request)).await?;
        self.core.set_phase(RunPhase::Running);
        self.core.emit(RunEvent::RunStarted);

        let heartbeat = self.spawn_heartbeat();
        let outcome = self.listen(&mut reader).await;
        heartbeat.abort();
        outcome
    }

    async fn launch_client(self: &Arc<Self>) -> anyhow::Result<()> {
        let exe = self.config.client_executable()?;
        info!("Launching worker {} for run `{}`", exe.display(), self.core.name());

        let mut child = self.client_command(&exe).spawn().map_err(|source| RunError::Spawn {
            name: self.core.name().to_string(),
            source,
        })?;

        if let Some(stdout) = child.stdout.take() {
            self.forward_output(stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            self.forward_output(stderr);
        }
        *self.child.lock().await = Some(child);
        Ok(())
    }

    /// `<exe> client --pipe <channel> [--config <file>]`, so the worker runs
    /// with the host's heartbeat settings.
    fn client_command(&self, exe: &Path) -> Command {
        let mut cmd = Command::new(exe);
        cmd.arg("client").arg("--pipe").arg(&self.channel);
        if let Some(source) = &self.config.source {
            cmd.arg("--config").arg(source);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Relay a worker output stream as `Message` events, line by line.
    fn forward_output<R>(self: &Arc<Self>, stream: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let shared = self.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                shared.core.emit(RunEvent::Message(line));
            }
        });
    }

    fn spawn_heartbeat(self: &Arc<Self>) -> JoinHandle<()> {
        let shared = self.clone();
        let period = self.config.heartbeat_interval().max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if shared.send(&HostMessage::Heartbeat).await.is_err() {
                    break;
                }
            }
        })
    }

    async fn send(&self, message: &HostMessage) -> Result<(), ProtocolError> {
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(writer) => message.write_to(writer).await,
            None => Ok(()),
        }
    }

    /// Read client messages until a terminal outcome has been delivered.
    ///
    /// Fails when the channel breaks, the client stays silent for longer
    /// than the liveness timeout, or the client exits early.
    pub(crate) async fn listen<R: AsyncRead + Unpin>(&self, reader: &mut R) -> anyhow::Result<()> {
        let liveness = self.config.liveness_timeout();
        loop {
            let message = match timeout(liveness, ClientMessage::read_from(reader)).await {
                Err(_) => bail!("Worker sent nothing for {:?}", liveness),
                Ok(Err(e)) if e.is_disconnect() => {
                    bail!("Worker disconnected before finishing the model system")
                }
                Ok(Err(e)) => return Err(e).context("Unreadable message from worker"),
                Ok(Ok(message)) => message,
            };

            let terminal = message.is_terminal();
            match message {
                ClientMessage::Heartbeat | ClientMessage::Ready => {}
                ClientMessage::Progress { progress, reports } => {
                    self.progress.store(progress.to_bits(), Ordering::SeqCst);
                    self.reports.record(&reports);
                }
                ClientMessage::ReportCreated { name, colour } => self.reports.mirror(name, colour),
                ClientMessage::ReportRemoved(name) => {
                    self.reports.remove(&name);
                }
                ClientMessage::ReportsCleared => self.reports.clear(),
                ClientMessage::Status(status) => *self.status.lock() = status,
                ClientMessage::ModelSystemResult(text) => {
                    self.core.emit(RunEvent::ModelSystemSaved(text));
                }
                ClientMessage::RuntimeError(message) => {
                    warn!("Worker for `{}` reported: {}", self.core.name(), message);
                    self.core.emit(RunEvent::Message(message));
                }
                ClientMessage::Exiting => {
                    if self.kill_requested.load(Ordering::SeqCst) {
                        self.core.finish(RunEvent::Cancelled);
                        return Ok(());
                    }
                    bail!("Worker exited before finishing the model system");
                }
                ClientMessage::Finished => {
                    self.core.finish(RunEvent::Completed);
                }
                ClientMessage::ErrorWhenRunning(error) => {
                    self.core.finish(RunEvent::RuntimeError(error));
                }
                ClientMessage::ErrorValidating { stage, errors } => {
                    let event = match stage {
                        ValidationStage::Structural => RunEvent::ValidationError(errors),
                        ValidationStage::Runtime => RunEvent::RuntimeValidationError(errors),
                    };
                    self.core.finish(event);
                }
            }
            if terminal {
                return Ok(());
            }
        }
    }

    /// Ask the worker to exit, reap it, and release the channel.
    async fn shutdown(&self) {
        if let Err(e) = self.send(&HostMessage::KillModelRun).await {
            debug!("Worker for `{}` already gone: {}", self.core.name(), e);
        }

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            let grace = self.config.termination_grace_period();
            match timeout(grace, child.wait()).await {
                Ok(Ok(status)) => debug!("Worker for `{}` exited with {}", self.core.name(), status),
                Ok(Err(e)) => warn!("Unable to wait for worker: {}", e),
                Err(_) => {
                    warn!("Worker for `{}` did not exit within {:?}; killing it", self.core.name(), grace);
                    if let Err(e) = child.kill().await {
                        warn!("Unable to kill worker process: {}", e);
                    }
                }
            }
        }

        self.writer.lock().await.take();
        self.remove_channel();
    }

    fn remove_channel(&self) {
        if let Err(e) = std::fs::remove_file(&self.channel) {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!("Unable to remove {}: {}", self.channel.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn shared(liveness_ms: u64) -> (Arc<HostShared>, Arc<Mutex<Vec<RunEvent>>>) {
        let config = OrchestratorConfig {
            liveness_timeout_ms: liveness_ms,
            ..Default::default()
        };
        let core = Arc::new(RunCore::new(RunName::new("remote"), "/tmp/remote"));
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        core.subscribe(Arc::new(move |e: &RunEvent| sink.lock().push(e.clone())));
        core.try_begin().unwrap();
        let shared = HostShared::new(core, Arc::new(config), PathBuf::from("/tmp/unused.sock"));
        (Arc::new(shared), events)
    }

    #[tokio::test]
    async fn test_listen_caches_progress_until_finished() {
        let (host, events) = shared(5_000);
        let (mut client, mut reader) = duplex(4096);
        for message in [
            ClientMessage::Ready,
            ClientMessage::ReportCreated {
                name: "Skims".into(),
                colour: Colour(9, 9, 9),
            },
            ClientMessage::ReportCreated {
                name: "Transit".into(),
                colour: Colour::DEFAULT,
            },
            ClientMessage::ReportRemoved("Transit".into()),
            ClientMessage::Progress {
                progress: 0.5,
                reports: vec![ProgressReport {
                    name: "Skims".into(),
                    progress: 0.25,
                    colour: Colour(9, 9, 9),
                }],
            },
            ClientMessage::Status("Mode choice".into()),
            ClientMessage::RuntimeError("unexpected opcode".into()),
            ClientMessage::Finished,
        ] {
            message.write_to(&mut client).await.unwrap();
        }

        host.listen(&mut reader).await.unwrap();
        assert_eq!(f32::from_bits(host.progress.load(Ordering::SeqCst)), 0.5);
        assert_eq!(
            host.reports.snapshot(),
            vec![ProgressReport {
                name: "Skims".into(),
                progress: 0.25,
                colour: Colour(9, 9, 9),
            }]
        );
        assert_eq!(*host.status.lock(), "Mode choice");
        assert_eq!(host.core.phase(), RunPhase::Completed);
        assert_eq!(
            *events.lock(),
            vec![RunEvent::Message("unexpected opcode".into()), RunEvent::Completed]
        );
    }

    #[tokio::test]
    async fn test_listen_maps_validation_stage() {
        let (host, events) = shared(5_000);
        let (mut client, mut reader) = duplex(4096);
        ClientMessage::ErrorValidating {
            stage: ValidationStage::Runtime,
            errors: vec![ErrorWithPath::new(Some(vec![0].into()), "negative")],
        }
        .write_to(&mut client)
        .await
        .unwrap();

        host.listen(&mut reader).await.unwrap();
        assert!(matches!(
            events.lock().as_slice(),
            [RunEvent::RuntimeValidationError(errors)] if errors.len() == 1
        ));
    }

    #[tokio::test]
    async fn test_listen_fails_on_disconnect() {
        let (host, _events) = shared(5_000);
        let (mut client, mut reader) = duplex(4096);
        ClientMessage::Heartbeat.write_to(&mut client).await.unwrap();
        drop(client);

        let err = host.listen(&mut reader).await.unwrap_err();
        assert!(err.to_string().contains("disconnected"));
        assert!(!host.core.is_finished());
    }

    #[tokio::test]
    async fn test_listen_times_out_silent_worker() {
        let (host, _events) = shared(50);
        let (_client, mut reader) = duplex(4096);

        let err = host.listen(&mut reader).await.unwrap_err();
        assert!(err.to_string().contains("sent nothing"));
    }

    #[tokio::test]
    async fn test_cleared_reports_leave_mirror_empty() {
        let (host, _events) = shared(5_000);
        let (mut client, mut reader) = duplex(4096);
        for message in [
            ClientMessage::ReportCreated {
                name: "Skims".into(),
                colour: Colour::DEFAULT,
            },
            ClientMessage::ReportsCleared,
            ClientMessage::Finished,
        ] {
            message.write_to(&mut client).await.unwrap();
        }

        host.listen(&mut reader).await.unwrap();
        assert!(host.reports.is_empty());
    }

    #[tokio::test]
    async fn test_exit_after_kill_is_cancelled() {
        let (host, events) = shared(5_000);
        host.kill_requested.store(true, Ordering::SeqCst);
        let (mut client, mut reader) = duplex(4096);
        ClientMessage::Exiting.write_to(&mut client).await.unwrap();

        host.listen(&mut reader).await.unwrap();
        assert_eq!(*events.lock(), vec![RunEvent::Cancelled]);
    }

    #[tokio::test]
    async fn test_unstarted_remote_run_cancels_silently() {
        let run = RemoteHostRun::new(
            RunName::new("queued"),
            "/tmp/queued",
            ModelSystemDocument::new(crate::model::ModelSystemStructure::new("Wait", "Delay")),
            Arc::new(OrchestratorConfig::default()),
            Handle::current(),
        )
        .unwrap();

        run.terminate_run();
        assert_eq!(run.phase(), RunPhase::Cancelled);
        assert!(run.wait_timeout(Duration::from_millis(10)));
        assert!(run.exit_request());
        assert_eq!(run.poll_progress(), 0.0);
    }
    #[test]
    fn test_client_command_forwards_config_file() {
        let config = OrchestratorConfig {
            source: Some(PathBuf::from("/etc/run-orchestrator/config.json")),
            ..Default::default()
        };
        let core = Arc::new(RunCore::new(RunName::new("remote"), "/tmp/remote"));
        let host = HostShared::new(core, Arc::new(config), PathBuf::from("/tmp/worker.sock"));

        let cmd = host.client_command(Path::new("/usr/bin/run-orchestrator"));
        let args: Vec<_> = cmd.as_std().get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            vec!["client", "--pipe", "/tmp/worker.sock", "--config", "/etc/run-orchestrator/config.json"]
        );
    }

    #[test]
    fn test_client_command_without_config_file() {
        let core = Arc::new(RunCore::new(RunName::new("remote"), "/tmp/remote"));
        let host = HostShared::new(core, Arc::default(), PathBuf::from("/tmp/worker.sock"));

        let cmd = host.client_command(Path::new("run-orchestrator"));
        assert_eq!(cmd.as_std().get_args().count(), 3);
    }
}
