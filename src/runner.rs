//! Process supervision.
//!
//! A `Supervisor` owns at most one child process for one logical `Service`.
//! It spawns the child, classifies its output line by line, records the pid in
//! the settings store and publishes state changes on the notification bus.
//! Each child gets a monitor task that owns the `Child`, receives lines from
//! the stdout/stderr readers and observes the exit.

use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::bus::NotificationBus;
use crate::config::{MissingFields, ServerConfig};
use crate::events::Notification;
use crate::output::{sanitize_text, HealthClassifier, LineClass, LogBuffer, LogLine, StreamKind};
use crate::process::{ProcessSpec, ServiceProcessHandle, ServiceState};
use crate::signal::{wait_for_exit, OsProcess, ProcessHandle, TerminateError};
use crate::store::ConfigStore;

// Output still buffered in the pipes when the child exits.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

/// A backend process the desktop shell can run.
pub trait Service: Send + Sync + 'static {
    /// Logical name; prefixes bus events and the persisted pid key.
    fn name(&self) -> &str;
    /// Command line for the next start, derived from current settings.
    fn command(&self, server: &ServerConfig) -> ProcessSpec;
    fn classifier(&self) -> &dyn HealthClassifier;
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Give up on a start that has not printed the success marker by then.
    /// `None` waits indefinitely; a first boot may take long.
    pub startup_timeout: Option<Duration>,
    /// Grace period between the termination request and a forced kill.
    pub stop_timeout: Duration,
    /// Lines of recent output kept for diagnostics.
    pub max_log_lines: usize,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            startup_timeout: None,
            stop_timeout: Duration::from_secs(5),
            max_log_lines: 200,
        }
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("{service} cannot start while {state}")]
    InvalidState { service: String, state: ServiceState },
    #[error(transparent)]
    Config(#[from] MissingFields),
    #[error("failed to launch {service}: {source}")]
    Spawn {
        service: String,
        #[source]
        source: std::io::Error,
    },
    /// The child reported a fatal error or exited; the message is user-facing.
    #[error("{0}")]
    Failed(String),
    #[error("{service} did not report ready within {timeout:?}")]
    StartupTimeout { service: String, timeout: Duration },
    #[error(transparent)]
    Terminate(#[from] TerminateError),
    #[error("{service} (pid {pid}) did not exit after being killed")]
    StopTimeout { service: String, pid: u32 },
}

/// How a `start()` call ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started { pid: u32 },
    /// The application began shutting down while the child was starting.
    Cancelled,
}

struct Shared {
    state: ServiceState,
    last_error: Option<String>,
    child_pid: Option<u32>,
    exited: Option<watch::Receiver<bool>>,
    logs: LogBuffer,
}

struct Core<S> {
    service: S,
    store: Arc<ConfigStore>,
    bus: NotificationBus,
    options: SupervisorOptions,
    shared: Mutex<Shared>,
}

type ReadySender = Option<oneshot::Sender<Result<u32, SupervisorError>>>;

/// Supervises one logical service. Clones share the same child.
pub struct Supervisor<S: Service> {
    core: Arc<Core<S>>,
    shutdown: watch::Receiver<bool>,
}

impl<S: Service> Clone for Supervisor<S> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<S: Service> Supervisor<S> {
    pub fn new(
        service: S,
        store: Arc<ConfigStore>,
        bus: NotificationBus,
        options: SupervisorOptions,
    ) -> Self {
        let logs = LogBuffer::new(options.max_log_lines);
        let core = Core {
            service,
            store,
            bus,
            options,
            shared: Mutex::new(Shared {
                state: ServiceState::Stopped,
                last_error: None,
                child_pid: None,
                exited: None,
                logs,
            }),
        };
        // Without a shutdown source a start is never cancelled.
        let (_, shutdown) = watch::channel(false);
        Self {
            core: Arc::new(core),
            shutdown,
        }
    }

    /// Aborts in-flight starts once `shutdown` turns true.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn name(&self) -> &str {
        self.core.service.name()
    }

    pub fn state(&self) -> ServiceState {
        self.core.lock().state
    }

    pub fn last_error(&self) -> Option<String> {
        self.core.lock().last_error.clone()
    }

    /// True only while the child is up *and* its pid is still recorded, so an
    /// externally killed server is noticed on the next query.
    pub fn running(&self) -> bool {
        self.state() == ServiceState::Running && self.core.store.pid(self.name()).is_some()
    }

    pub fn handle(&self) -> ServiceProcessHandle {
        ServiceProcessHandle {
            logical_name: self.name().to_string(),
            pid: self.core.store.pid(self.name()),
            running: self.running(),
            state: self.state(),
            last_error: self.last_error(),
        }
    }

    pub fn recent_output(&self) -> Vec<LogLine> {
        self.core.lock().logs.iter().cloned().collect()
    }

    /// Launches the child and waits until it prints its success marker.
    ///
    /// Settings are re-read on every call, so edits apply on the next start.
    pub async fn start(&self) -> Result<StartOutcome, SupervisorError> {
        let core = &self.core;
        let name = core.service.name().to_string();
        let previous = {
            let shared = core.lock();
            if !shared.state.can_start() {
                return Err(SupervisorError::InvalidState {
                    service: name,
                    state: shared.state,
                });
            }
            shared.child_pid.zip(shared.exited.clone())
        };
        // A child that failed is signalled but may still be shutting down.
        if let Some((pid, exited)) = previous {
            debug!(service = %name, pid, "waiting for previous child to exit");
            if !self.await_child_exit(pid, exited).await {
                return Err(SupervisorError::StopTimeout { service: name, pid });
            }
        }
        if let Err(missing) = core.store.validate() {
            error!(service = %name, error = %missing, "refusing to start with incomplete settings");
            core.lock().last_error = Some(missing.to_string());
            core.bus.notify(&Notification::ServiceStopped {
                service: name,
                error: Some(missing.to_string()),
            });
            return Err(missing.into());
        }

        let spec = core.service.command(&core.store.server());
        {
            let mut shared = core.lock();
            if !shared.state.can_start() || shared.child_pid.is_some() {
                return Err(SupervisorError::InvalidState {
                    service: name,
                    state: shared.state,
                });
            }
            shared.state = ServiceState::Starting;
            shared.last_error = None;
            shared.logs.clear();
        }
        info!(service = %name, command = %spec.display(), "starting service");

        let spawned = spawn_child(&spec).and_then(|child| match child.id() {
            Some(pid) => Ok((child, pid)),
            None => Err(std::io::Error::other("child exited before its pid was read")),
        });
        let (mut child, pid) = match spawned {
            Ok(spawned) => spawned,
            Err(source) => {
                core.fail(format!("failed to launch {}: {}", name, source));
                return Err(SupervisorError::Spawn {
                    service: name,
                    source,
                });
            }
        };
        core.store.set_pid(&name, pid);

        let (line_tx, line_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(read_stream(StreamKind::Stdout, stdout, line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(read_stream(StreamKind::Stderr, stderr, line_tx));
        }
        let (exit_tx, exit_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = oneshot::channel();
        {
            let mut shared = core.lock();
            shared.child_pid = Some(pid);
            shared.exited = Some(exit_rx);
        }
        debug!(service = %name, pid, "child spawned");
        tokio::spawn(monitor(core.clone(), child, pid, line_rx, ready_tx, exit_tx));

        self.await_ready(ready_rx, pid).await
    }

    async fn await_ready(
        &self,
        ready_rx: oneshot::Receiver<Result<u32, SupervisorError>>,
        pid: u32,
    ) -> Result<StartOutcome, SupervisorError> {
        let name = self.name().to_string();
        let ready = async {
            ready_rx.await.unwrap_or_else(|_| {
                Err(SupervisorError::Failed(format!("{} monitor stopped unexpectedly", name)))
            })
        };
        let ready = async {
            match self.core.options.startup_timeout {
                Some(timeout) => match tokio::time::timeout(timeout, ready).await {
                    Ok(result) => result,
                    Err(_) => {
                        self.core.fail(format!(
                            "{} did not report ready within {:?}",
                            name, timeout
                        ));
                        Err(SupervisorError::StartupTimeout {
                            service: name.clone(),
                            timeout,
                        })
                    }
                },
                None => ready.await,
            }
        };

        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            result = ready => result.map(|pid| StartOutcome::Started { pid }),
            _ = cancelled(&mut shutdown) => {
                info!(service = %self.name(), pid, "start cancelled by shutdown");
                if let Err(err) = self.kill(false).await {
                    debug!(service = %self.name(), error = %err, "cleanup after cancelled start failed");
                }
                Ok(StartOutcome::Cancelled)
            }
        }
    }

    /// Stops the service and waits for the OS to confirm the exit.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        self.kill(true).await
    }

    /// Stops the service if it is running, then starts it again.
    ///
    /// The stop is confirmed before the new child is spawned, so the stopped
    /// notification always precedes the next started one.
    pub async fn restart(&self) -> Result<StartOutcome, SupervisorError> {
        if self.state() == ServiceState::Running {
            self.stop().await?;
        }
        self.start().await
    }

    /// Terminates the recorded pid and clears it from the store.
    ///
    /// A process that is already gone is not an error. Other failures are
    /// only returned when `report_errors` is set.
    pub async fn kill(&self, report_errors: bool) -> Result<(), SupervisorError> {
        let core = &self.core;
        let name = core.service.name();
        let (previous, own_pid, exited) = {
            let mut shared = core.lock();
            let previous = shared.state;
            if matches!(previous, ServiceState::Starting | ServiceState::Running) {
                shared.state = ServiceState::Stopping;
            }
            (previous, shared.child_pid, shared.exited.clone())
        };

        let terminated = match core.terminate_recorded(report_errors) {
            Ok(Some(pid)) => Some(pid),
            Ok(None) => own_pid.filter(|pid| OsProcess::new(*pid).is_alive()).and_then(|pid| {
                debug!(service = %name, pid, "no pid recorded, terminating own child");
                OsProcess::new(pid).terminate().ok().map(|_| pid)
            }),
            Err(err) => {
                let mut shared = core.lock();
                if shared.state == ServiceState::Stopping {
                    shared.state = previous;
                }
                return Err(err);
            }
        };

        let Some(pid) = terminated else {
            let mut shared = core.lock();
            if shared.state == ServiceState::Stopping {
                // Nothing could be signalled; a child that already exited has
                // been moved to `Stopped` by its monitor.
                shared.state = previous;
            }
            return Ok(());
        };
        let confirmed = match exited.filter(|_| own_pid == Some(pid)) {
            Some(exited) => self.await_child_exit(pid, exited).await,
            None => await_os_exit(pid, core.options.stop_timeout).await,
        };
        if confirmed {
            info!(service = %name, pid, "service stopped");
            Ok(())
        } else if report_errors {
            Err(SupervisorError::StopTimeout {
                service: name.to_string(),
                pid,
            })
        } else {
            warn!(service = %name, pid, "process did not exit after kill");
            Ok(())
        }
    }

    async fn await_child_exit(&self, pid: u32, mut exited: watch::Receiver<bool>) -> bool {
        let timeout = self.core.options.stop_timeout;
        if tokio::time::timeout(timeout, exited.wait_for(|done| *done))
            .await
            .is_ok()
        {
            return true;
        }
        warn!(service = %self.name(), pid, "service ignored termination request, forcing");
        let _ = OsProcess::new(pid).force_kill();
        tokio::time::timeout(timeout, exited.wait_for(|done| *done))
            .await
            .is_ok()
    }
}

impl<S: Service> Core<S> {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Moves a starting or running service to `Errored`, kills it without
    /// reporting kill failures and publishes one stopped notification.
    fn fail(&self, message: String) -> bool {
        let name = self.service.name();
        {
            let mut shared = self.lock();
            if !matches!(shared.state, ServiceState::Starting | ServiceState::Running) {
                return false;
            }
            shared.state = ServiceState::Errored;
            shared.last_error = Some(message.clone());
        }
        error!(service = %name, error = %message, "service failed");
        if let Err(err) = self.terminate_recorded(false) {
            debug!(service = %name, error = %err, "ignoring kill failure after error");
        }
        self.bus.notify(&Notification::ServiceStopped {
            service: name.to_string(),
            error: Some(message),
        });
        true
    }

    // Signals the pid recorded in the store. Returns the pid when a
    // termination request was delivered.
    fn terminate_recorded(&self, report_errors: bool) -> Result<Option<u32>, SupervisorError> {
        let name = self.service.name();
        let Some(pid) = self.store.pid(name) else {
            debug!(service = %name, "no pid recorded, nothing to kill");
            return Ok(None);
        };
        match OsProcess::new(pid).terminate() {
            Ok(_) => {
                self.store.clear_pid(name);
                debug!(service = %name, pid, "termination requested");
                Ok(Some(pid))
            }
            Err(TerminateError::NotFound(_)) => {
                self.store.clear_pid(name);
                debug!(service = %name, pid, "recorded process already gone");
                Ok(None)
            }
            Err(err) if report_errors => Err(err.into()),
            Err(err) => {
                warn!(service = %name, pid, error = %err, "failed to kill service");
                Ok(None)
            }
        }
    }

    fn on_line(&self, pid: u32, stream: StreamKind, line: String, ready_tx: &mut ReadySender) {
        let name = self.service.name();
        match stream {
            StreamKind::Stdout => debug!(service = %name, "{}", line),
            StreamKind::Stderr => warn!(service = %name, "{}", line),
        }
        let class = self.service.classifier().classify(stream, &line);
        self.lock().logs.push(LogLine {
            text: line.clone(),
            stream,
        });
        self.bus.notify(&Notification::ServiceLog {
            service: name.to_string(),
            stream,
            line: line.clone(),
        });

        match class {
            LineClass::Ready => {
                {
                    let mut shared = self.lock();
                    if shared.state != ServiceState::Starting {
                        return;
                    }
                    shared.state = ServiceState::Running;
                }
                self.store.set_pid(name, pid);
                info!(service = %name, pid, "service is ready");
                self.bus.notify(&Notification::ServiceStarted {
                    service: name.to_string(),
                    pid,
                });
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(Ok(pid));
                }
            }
            LineClass::Critical(pattern) => {
                let message = format!(
                    "{} reported a critical error ({}): {}",
                    name,
                    pattern,
                    sanitize_text(&line).trim()
                );
                if self.fail(message.clone()) {
                    if let Some(tx) = ready_tx.take() {
                        let _ = tx.send(Err(SupervisorError::Failed(message)));
                    }
                }
            }
            LineClass::Error | LineClass::Info => {}
        }
    }

    fn on_exit(&self, pid: u32, status: std::io::Result<ExitStatus>, ready_tx: &mut ReadySender) {
        let name = self.service.name();
        let outcome = match &status {
            Ok(status) => status.to_string(),
            Err(err) => err.to_string(),
        };
        let previous = {
            let mut shared = self.lock();
            if shared.child_pid != Some(pid) {
                debug!(service = %name, pid, status = %outcome, "earlier child reaped");
                return;
            }
            shared.child_pid = None;
            shared.exited = None;
            shared.state
        };
        match previous {
            ServiceState::Starting => {
                let message = format!("{} exited before it was ready ({})", name, outcome);
                if self.fail(message.clone()) {
                    if let Some(tx) = ready_tx.take() {
                        let _ = tx.send(Err(SupervisorError::Failed(message)));
                    }
                }
            }
            ServiceState::Running | ServiceState::Stopping => {
                if previous == ServiceState::Running {
                    info!(service = %name, pid, status = %outcome, "service exited on its own");
                } else {
                    debug!(service = %name, pid, status = %outcome, "service exited");
                }
                self.lock().state = ServiceState::Stopped;
                if self.store.pid(name) == Some(pid) {
                    self.store.clear_pid(name);
                }
                self.bus.notify(&Notification::ServiceStopped {
                    service: name.to_string(),
                    error: None,
                });
            }
            ServiceState::Errored | ServiceState::Stopped => {
                debug!(service = %name, pid, status = %outcome, "child reaped");
            }
        }
    }
}

async fn monitor<S: Service>(
    core: Arc<Core<S>>,
    mut child: Child,
    pid: u32,
    mut lines: mpsc::UnboundedReceiver<(StreamKind, String)>,
    ready_tx: oneshot::Sender<Result<u32, SupervisorError>>,
    exit_tx: watch::Sender<bool>,
) {
    let mut ready_tx = Some(ready_tx);
    let mut lines_open = true;
    let status = loop {
        tokio::select! {
            line = lines.recv(), if lines_open => match line {
                Some((stream, line)) => core.on_line(pid, stream, line, &mut ready_tx),
                None => lines_open = false,
            },
            status = child.wait() => break status,
        }
    };
    if lines_open {
        let _ = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while let Some((stream, line)) = lines.recv().await {
                core.on_line(pid, stream, line, &mut ready_tx);
            }
        })
        .await;
    }
    core.on_exit(pid, status, &mut ready_tx);
    let _ = exit_tx.send(true);
}

fn spawn_child(spec: &ProcessSpec) -> std::io::Result<Child> {
    let mut command = Command::new(&spec.cmd);
    command.args(&spec.args);
    if let Some(cwd) = &spec.cwd {
        command.current_dir(cwd);
    }
    if !spec.env.is_empty() {
        command.envs(&spec.env);
    }
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    command.kill_on_drop(true);

    #[cfg(windows)]
    {
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        command.creation_flags(CREATE_NO_WINDOW);
    }

    #[cfg(unix)]
    unsafe {
        command.pre_exec(|| {
            let _ = libc::setpgid(0, 0);
            Ok(())
        });
    }

    command.spawn()
}

async fn read_stream<R>(
    stream: StreamKind,
    reader: R,
    tx: mpsc::UnboundedSender<(StreamKind, String)>,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send((stream, line)).is_err() {
            break;
        }
    }
}

async fn await_os_exit(pid: u32, timeout: Duration) -> bool {
    let process = OsProcess::new(pid);
    if wait_for_exit(&process, timeout).await {
        return true;
    }
    let _ = process.force_kill();
    wait_for_exit(&process, timeout).await
}

// Resolves once the shutdown flag is set; never if the sender is gone.
async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}
