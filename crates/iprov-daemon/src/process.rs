//! Supervised helper processes
//!
//! A [`ProcessSpec`] describes one external executable. [`ProcessSpec::start`]
//! registers it with a [`ProcessRegistry`] and spawns a supervising task that
//! owns the `Child`:
//!
//! 1. launch the executable and wait (bounded) for the OS to report a pid;
//! 2. dispatch every non-empty stdout/stderr line to the output handler as an
//!    [`OutputLine`], while watching for exit and control messages;
//! 3. on exit, call the `on_stop` hook and decide whether to restart.
//!
//! A process that exits on its own with a status code is not restarted.
//! Restarts follow a [`ProcessHandle::restart`] request or a kill by a signal
//! the supervisor did not send, and are paced by [`Backoff`]. After
//! [`ProcessHandle::stop`] nothing is restarted.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};

use crate::backoff::{Backoff, BackoffPolicy};
use iprov_core::events::{OutputLine, StopCause, StopInfo};
use iprov_core::prelude::*;

/// Attempts made while waiting for the OS to report a pid
const PID_POLL_ATTEMPTS: u32 = 5;
const PID_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Upper bound on reading leftover output after the process exited
const DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

static NEXT_PROCESS_ID: AtomicU64 = AtomicU64::new(1);

/// Handler receiving each output line of a supervised process
pub type OutputHandler = Box<dyn FnMut(OutputLine) + Send>;

/// Hook called every time the supervised process ends
pub type StopHook = Box<dyn FnMut(&StopInfo) + Send>;

/// Registry that owns every supervised process of the provider
pub trait ProcessRegistry: Send + Sync {
    fn register(&self, handle: ProcessHandle);

    /// Remove `name` if it still refers to the supervisor with `id`
    fn unregister(&self, name: &str, id: u64);

    fn is_shutting_down(&self) -> bool;
}

/// Observable supervisor state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Starting,
    Running { pid: u32 },
    /// Between instances, waiting out the backoff delay
    Restarting,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlMsg {
    Stop,
    Restart,
}

// ─────────────────────────────────────────────────────────
// ProcessSpec
// ─────────────────────────────────────────────────────────

/// Description of a process to supervise
pub struct ProcessSpec {
    name: String,
    binary: PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
    working_dir: Option<PathBuf>,
    on_output: Option<OutputHandler>,
    on_stop: Option<StopHook>,
    no_restart: bool,
    no_wait: bool,
    backoff: BackoffPolicy,
}

impl ProcessSpec {
    pub fn new(name: impl Into<String>, binary: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            binary: binary.into(),
            args: Vec::new(),
            env: Vec::new(),
            working_dir: None,
            on_output: None,
            on_stop: None,
            no_restart: false,
            no_wait: false,
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn on_output(mut self, handler: impl FnMut(OutputLine) + Send + 'static) -> Self {
        self.on_output = Some(Box::new(handler));
        self
    }

    pub fn on_stop(mut self, hook: impl FnMut(&StopInfo) + Send + 'static) -> Self {
        self.on_stop = Some(Box::new(hook));
        self
    }

    /// Never restart, whatever the exit cause
    pub fn no_restart(mut self) -> Self {
        self.no_restart = true;
        self
    }

    /// Restart without waiting out the backoff delay
    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    pub fn backoff(mut self, policy: BackoffPolicy) -> Self {
        self.backoff = policy;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Begin supervising immediately.
    ///
    /// Fails with [`Error::BinaryMissing`] (fatal) if the executable cannot be
    /// found, and refuses to start while the registry is shutting down.
    pub fn start(self, registry: Arc<dyn ProcessRegistry>) -> Result<ProcessHandle> {
        let binary = resolve_binary(&self.binary)?;

        if registry.is_shutting_down() {
            return Err(Error::process(format!(
                "not starting '{}': provider is shutting down",
                self.name
            )));
        }

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ProcessState::Starting);

        let handle = ProcessHandle {
            id: NEXT_PROCESS_ID.fetch_add(1, Ordering::Relaxed),
            name: Arc::from(self.name.as_str()),
            control_tx,
            state_rx,
        };
        registry.register(handle.clone());

        info!("Supervising '{}': {} {}", self.name, binary.display(), self.args.join(" "));

        let supervisor = Supervisor {
            id: handle.id,
            spec: self,
            binary,
            control_rx,
            state_tx,
            registry,
        };
        tokio::spawn(supervisor.run());

        Ok(handle)
    }
}

/// Locate `binary`, searching `PATH` for bare command names
pub fn resolve_binary(binary: &Path) -> Result<PathBuf> {
    if binary.components().count() > 1 || binary.is_absolute() {
        return if binary.exists() {
            Ok(binary.to_path_buf())
        } else {
            Err(Error::binary_missing(binary))
        };
    }
    which::which(binary).map_err(|_| Error::binary_missing(binary))
}

// ─────────────────────────────────────────────────────────
// ProcessHandle
// ─────────────────────────────────────────────────────────

/// Cloneable control handle for a supervised process
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    id: u64,
    name: Arc<str>,
    control_tx: mpsc::UnboundedSender<ControlMsg>,
    state_rx: watch::Receiver<ProcessState>,
}

impl ProcessHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request termination. No restart follows. No-op once terminated.
    pub fn stop(&self) {
        if self.is_terminated() {
            return;
        }
        debug!("Stop requested for '{}'", self.name);
        let _ = self.control_tx.send(ControlMsg::Stop);
    }

    /// Kill the current instance and start a fresh one
    pub fn restart(&self) {
        if self.is_terminated() {
            return;
        }
        debug!("Restart requested for '{}'", self.name);
        let _ = self.control_tx.send(ControlMsg::Restart);
    }

    pub fn state(&self) -> ProcessState {
        *self.state_rx.borrow()
    }

    pub fn pid(&self) -> Option<u32> {
        match self.state() {
            ProcessState::Running { pid } => Some(pid),
            _ => None,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == ProcessState::Terminated
    }

    /// Wait until supervision has ended
    pub async fn wait_terminated(&self) {
        let mut rx = self.state_rx.clone();
        // A dropped sender also means the supervisor is gone
        let _ = rx.wait_for(|s| *s == ProcessState::Terminated).await;
    }

    /// Wait until an instance reports a pid; `None` if supervision ended first
    pub async fn wait_running(&self) -> Option<u32> {
        let mut rx = self.state_rx.clone();
        let state = rx
            .wait_for(|s| matches!(s, ProcessState::Running { .. } | ProcessState::Terminated))
            .await
            .ok()
            .map(|s| *s)?;
        match state {
            ProcessState::Running { pid } => Some(pid),
            _ => None,
        }
    }
}

// ─────────────────────────────────────────────────────────
// Supervising task
// ─────────────────────────────────────────────────────────

struct Supervisor {
    id: u64,
    spec: ProcessSpec,
    binary: PathBuf,
    control_rx: mpsc::UnboundedReceiver<ControlMsg>,
    state_tx: watch::Sender<ProcessState>,
    registry: Arc<dyn ProcessRegistry>,
}

/// Outcome of one instance
enum Instance {
    /// Never got running; supervision ends
    LaunchFailed,
    Ended(StopCause),
}

impl Supervisor {
    async fn run(mut self) {
        let mut backoff = Backoff::new(self.spec.backoff);
        let name = self.spec.name.clone();

        loop {
            backoff.mark_start();
            self.state_tx.send_replace(ProcessState::Starting);

            let (cause, pid) = match self.run_instance().await {
                (Instance::LaunchFailed, _) => break,
                (Instance::Ended(cause), pid) => (cause, pid),
            };

            backoff.mark_end();
            self.state_tx.send_replace(ProcessState::Restarting);

            if let Some(hook) = self.spec.on_stop.as_mut() {
                hook(&StopInfo {
                    name: name.clone(),
                    pid,
                    cause,
                });
            }

            match cause {
                StopCause::Stopped => {
                    info!("'{}' stopped", name);
                    break;
                }
                StopCause::Exited(code) => {
                    info!("'{}' exited with code {}; not restarting", name, code);
                    break;
                }
                StopCause::Restart | StopCause::Signaled => {}
            }

            if self.spec.no_restart {
                debug!("'{}' ended; restart disabled", name);
                break;
            }

            if !self.spec.no_wait {
                tokio::select! {
                    _ = backoff.wait() => {}
                    msg = self.control_rx.recv() => {
                        if matches!(msg, Some(ControlMsg::Stop) | None) {
                            info!("'{}' stopped during backoff", name);
                            break;
                        }
                    }
                }
            }

            if self.registry.is_shutting_down() {
                debug!("'{}' not restarting: shutting down", name);
                break;
            }

            info!("Restarting '{}'", name);
        }

        self.registry.unregister(&name, self.id);
        self.state_tx.send_replace(ProcessState::Terminated);
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(&self.spec.args)
            .envs(self.spec.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.spec.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    async fn run_instance(&mut self) -> (Instance, Option<u32>) {
        let name = self.spec.name.clone();

        let mut child = match self.command().spawn() {
            Ok(child) => child,
            Err(e) => {
                error!("Failed to launch '{}': {}", name, e);
                return (Instance::LaunchFailed, None);
            }
        };

        let Some(pid) = wait_for_pid(&mut child, &name).await else {
            return (Instance::LaunchFailed, None);
        };
        info!("'{}' running with PID {}", name, pid);
        self.state_tx.send_replace(ProcessState::Running { pid });

        let mut stdout = child.stdout.take().map(|s| BufReader::new(s).lines());
        let mut stderr = child.stderr.take().map(|s| BufReader::new(s).lines());

        let cause = loop {
            tokio::select! {
                biased;

                msg = self.control_rx.recv() => {
                    let cause = match msg {
                        Some(ControlMsg::Restart) => StopCause::Restart,
                        Some(ControlMsg::Stop) | None => StopCause::Stopped,
                    };
                    kill(&mut child, &name).await;
                    break cause;
                }
                line = next_line(&mut stdout), if stdout.is_some() => match line {
                    Some(line) => self.dispatch(OutputLine::Stdout(line)),
                    None => stdout = None,
                },
                line = next_line(&mut stderr), if stderr.is_some() => match line {
                    Some(line) => self.dispatch(OutputLine::Stderr(line)),
                    None => stderr = None,
                },
                status = child.wait() => {
                    break classify_exit(status, &name);
                }
            }
        };

        // Pick up lines written just before exit
        let _ = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while let Some(line) = next_line(&mut stdout).await {
                self.dispatch(OutputLine::Stdout(line));
            }
            while let Some(line) = next_line(&mut stderr).await {
                self.dispatch(OutputLine::Stderr(line));
            }
        })
        .await;

        (Instance::Ended(cause), Some(pid))
    }

    fn dispatch(&mut self, line: OutputLine) {
        if line.text().is_empty() {
            return;
        }
        match self.spec.on_output.as_mut() {
            Some(handler) => handler(line),
            None => match &line {
                OutputLine::Stdout(text) => debug!("[{}] {}", self.spec.name, text),
                OutputLine::Stderr(text) => debug!("[{}:err] {}", self.spec.name, text),
            },
        }
    }
}

async fn wait_for_pid(child: &mut Child, name: &str) -> Option<u32> {
    for _ in 0..PID_POLL_ATTEMPTS {
        match child.try_wait() {
            Ok(Some(status)) => {
                warn!("'{}' exited during startup ({}); giving up", name, status);
                return None;
            }
            Err(e) => {
                error!("'{}' status unavailable during startup: {}", name, e);
                return None;
            }
            Ok(None) => {}
        }
        if let Some(pid) = child.id() {
            return Some(pid);
        }
        tokio::time::sleep(PID_POLL_INTERVAL).await;
    }
    warn!("'{}' never reported a pid; giving up", name);
    None
}

async fn next_line<R>(lines: &mut Option<Lines<R>>) -> Option<String>
where
    R: AsyncBufRead + Unpin,
{
    match lines.as_mut()?.next_line().await {
        Ok(Some(line)) => Some(line),
        Ok(None) | Err(_) => {
            *lines = None;
            None
        }
    }
}

async fn kill(child: &mut Child, name: &str) {
    if let Err(e) = child.kill().await {
        warn!("Failed to kill '{}': {}", name, e);
    }
}

fn classify_exit(status: std::io::Result<ExitStatus>, name: &str) -> StopCause {
    match status {
        Ok(status) => match status.code() {
            Some(code) => StopCause::Exited(code),
            None => {
                warn!("'{}' killed by signal", name);
                StopCause::Signaled
            }
        },
        Err(e) => {
            error!("Error waiting for '{}': {}", name, e);
            StopCause::Exited(-1)
        }
    }
}
