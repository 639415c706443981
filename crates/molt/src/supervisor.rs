//! Process lifecycle: role dispatch, the parent watchdog, the worker child,
//! and the short-lived upgrade trigger.
//!
//! One binary plays all three roles. The parent binds the TCP listeners,
//! spawns a child that inherits them, and supervises it; the child rebuilds
//! its listeners from the inherited fds and runs the business logic; the
//! trigger reads the parent's pid file, delivers SIGUSR2, and exits.
//!
//! Signal conventions:
//!
//! - `SIGINT` / `SIGTERM` — graceful shutdown (cooperative drain, then kill)
//! - `SIGUSR2` — hot upgrade (spawn a replacement child on the same
//!   listeners, retire the old one once the new one reports ready)

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::process::Child;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::child::{ChildCmd, CONTROL_READ_FD, CONTROL_WRITE_FD};
use crate::error::{MoltError, PipeError};
use crate::protocol::{self, ControlFrame, TcpFdMap};

/// Unexpected child exits tolerated before the parent gives up.
pub const DEFAULT_REBOOT_BUDGET: i32 = 3;

/// The runtime role selected by command-line flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Parent,
    Child,
    UpgradeTrigger,
}

/// Supervisor configuration. Flag names are configurable so the supervisor
/// can coexist with whatever surface the host binary already exposes.
pub struct Supervisor {
    child_flag: String,
    upgrade_flag: String,
    bootstrap_flag: String,
    bootstrap_log_dir: PathBuf,
    pid_file: PathBuf,
    reboot_budget: i32,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new(
            "child",
            "upgrade",
            "bootstrap_args",
            "bootstrapLogs",
            "daemonPID",
        )
    }
}

impl Supervisor {
    /// Create a supervisor with explicit flag names and paths.
    pub fn new(
        child_flag: impl Into<String>,
        upgrade_flag: impl Into<String>,
        bootstrap_flag: impl Into<String>,
        bootstrap_log_dir: impl Into<PathBuf>,
        pid_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            child_flag: child_flag.into(),
            upgrade_flag: upgrade_flag.into(),
            bootstrap_flag: bootstrap_flag.into(),
            bootstrap_log_dir: bootstrap_log_dir.into(),
            pid_file: pid_file.into(),
            reboot_budget: DEFAULT_REBOOT_BUDGET,
        }
    }

    /// Override the crash-restart budget. The `--reboot_times=<n>` flag on
    /// the parent's command line takes precedence over this value.
    pub fn with_reboot_budget(mut self, budget: i32) -> Self {
        self.reboot_budget = budget;
        self
    }

    fn role_of(&self, args: &[String]) -> Role {
        let child = format!("--{}", self.child_flag);
        let upgrade = format!("--{}", self.upgrade_flag);
        if args.iter().any(|arg| *arg == child) {
            Role::Child
        } else if args.iter().any(|arg| *arg == upgrade) {
            Role::UpgradeTrigger
        } else {
            Role::Parent
        }
    }

    /// Run whichever role the command line selects.
    ///
    /// `tcp_ports` maps logical listener names to the ports the parent binds;
    /// `logical` is the business logic, invoked only in the child role. The
    /// callback must send exactly one readiness verdict through the oneshot
    /// sender and should return promptly once the token is cancelled.
    pub async fn bootstrap<F, Fut>(
        &self,
        tcp_ports: HashMap<String, u16>,
        logical: F,
    ) -> Result<(), MoltError>
    where
        F: FnOnce(TcpFdMap, oneshot::Sender<bool>, CancellationToken) -> Fut,
        Fut: Future<Output = ()>,
    {
        let args: Vec<String> = std::env::args().collect();
        match self.role_of(&args) {
            Role::Child => self.run_child(logical).await,
            Role::UpgradeTrigger => self.run_upgrade(),
            Role::Parent => self.run_parent(tcp_ports).await,
        }
    }

    /// Worker child: rebuild the control channel and the fd map, then hand
    /// control to the business logic.
    async fn run_child<F, Fut>(&self, logical: F) -> Result<(), MoltError>
    where
        F: FnOnce(TcpFdMap, oneshot::Sender<bool>, CancellationToken) -> Fut,
        Fut: Future<Output = ()>,
    {
        let args: Vec<String> = std::env::args().collect();
        let payload = bootstrap_payload(&args, &self.bootstrap_flag)
            .filter(|raw| !raw.is_empty())
            .ok_or_else(|| {
                error!("bootstrap argument is empty");
                MoltError::config("bootstrap argument is empty")
            })?;
        let tcp_fds = protocol::decode_fd_map(&payload)?;

        let cmd = Arc::new(ChildCmd::from_raw_fds(CONTROL_READ_FD, CONTROL_WRITE_FD)?);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (verdict_tx, verdict_rx) = oneshot::channel();
        let exit = CancellationToken::new();

        let handshake = tokio::spawn(child_handshake(
            cmd.clone(),
            ready_rx,
            verdict_tx,
            exit.clone(),
        ));

        logical(tcp_fds, ready_tx, exit).await;

        // The readiness verdict must reach the wire before any other
        // upstream frame, even when the business logic returns immediately.
        let _ = verdict_rx.await;

        // Drain acknowledgment; the parent falls back to kill if it is lost.
        if let Err(err) = cmd.write(ControlFrame::Exit.as_bytes()).await {
            warn!(%err, "could not acknowledge drain");
        }
        handshake.abort();
        let _ = handshake.await;
        cmd.close().await;
        Ok(())
    }

    /// Upgrade trigger: signal the running parent and exit. Fire and forget,
    /// failures are reported but never retried.
    fn run_upgrade(&self) -> Result<(), MoltError> {
        let raw = std::fs::read_to_string(&self.pid_file).map_err(|err| {
            error!(%err, pid_file = %self.pid_file.display(), "could not read pid file");
            MoltError::Io(err)
        })?;
        let pid = parse_pid(&raw).ok_or_else(|| {
            error!(%raw, "pid file does not hold a decimal pid");
            MoltError::config(format!("invalid pid file contents: {raw:?}"))
        })?;

        // SAFETY: sending a signal to a pid is memory-safe.
        if unsafe { libc::kill(pid, libc::SIGUSR2) } != 0 {
            let err = io::Error::last_os_error();
            error!(%err, pid, "could not signal supervisor");
            return Err(MoltError::Io(err));
        }
        info!(pid, "upgrade signal delivered");
        Ok(())
    }

    /// Parent watchdog: bind listeners, spawn the first child, then react to
    /// signals and child exits until shutdown.
    async fn run_parent(&self, tcp_ports: HashMap<String, u16>) -> Result<(), MoltError> {
        let orig_args: Vec<String> = std::env::args().collect();
        let reboot_budget = parse_reboot_budget(&orig_args, self.reboot_budget);

        std::fs::write(&self.pid_file, std::process::id().to_string())?;
        let _ = std::fs::remove_dir_all(&self.bootstrap_log_dir);
        std::fs::create_dir_all(&self.bootstrap_log_dir)?;

        // Stable ordering keeps the child fd layout reproducible run to run.
        let mut ports: Vec<(String, u16)> = tcp_ports.into_iter().collect();
        ports.sort();
        let mut listeners = Vec::with_capacity(ports.len());
        for (name, port) in ports {
            let listener = std::net::TcpListener::bind(("0.0.0.0", port)).map_err(|source| {
                error!(%name, port, %source, "listener bind failed");
                MoltError::Bind {
                    name: name.clone(),
                    port,
                    source,
                }
            })?;
            info!(%name, port, "listener bound");
            listeners.push((name, listener));
        }

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            child_flag: self.child_flag.clone(),
            bootstrap_flag: self.bootstrap_flag.clone(),
            orig_args,
            listeners,
            killed: AtomicBool::new(false),
            upgrading: AtomicBool::new(false),
            state: Mutex::new(State {
                current: None,
                reboot_budget,
            }),
            events: events_tx,
        });

        match replace(shared.clone()).await? {
            ReplaceOutcome::Installed => {}
            ReplaceOutcome::NotReady => {
                warn!("initial child failed to become ready; nothing to supervise");
                return Ok(());
            }
        }

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigusr2 = signal(SignalKind::user_defined2())?;
        // Subscribed so their default disposition cannot kill the parent.
        let mut sighup = signal(SignalKind::hangup())?;
        let mut sigquit = signal(SignalKind::quit())?;

        loop {
            let wake = tokio::select! {
                _ = sigint.recv() => Wake::Shutdown,
                _ = sigterm.recv() => Wake::Shutdown,
                _ = sigusr2.recv() => Wake::Upgrade,
                _ = sighup.recv() => Wake::Ignored("SIGHUP"),
                _ = sigquit.recv() => Wake::Ignored("SIGQUIT"),
                event = events.recv() => match event {
                    // The sender lives in `shared`, so the channel stays open.
                    None => Wake::Shutdown,
                    Some(SupervisorEvent::ChildCrashed { pid }) => Wake::Crashed(pid),
                },
            };

            match wake {
                Wake::Ignored(name) => {
                    info!(signal = name, "ignoring signal");
                }

                Wake::Shutdown => {
                    info!("shutdown requested");
                    shared.killed.store(true, Ordering::SeqCst);
                    let mut state = shared.state.lock().await;
                    if let Some(current) = state.current.take() {
                        retire_and_reap(current).await;
                    }
                    break;
                }

                Wake::Upgrade => {
                    if shared
                        .upgrading
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                        .is_err()
                    {
                        warn!("upgrade already in progress");
                        continue;
                    }
                    info!("hot upgrade requested");
                    match replace(shared.clone()).await {
                        Ok(ReplaceOutcome::Installed) => info!("upgrade complete"),
                        Ok(ReplaceOutcome::NotReady) => {
                            warn!("replacement child not ready; keeping current child");
                            shared.upgrading.store(false, Ordering::SeqCst);
                        }
                        Err(err) => {
                            error!(%err, "upgrade failed");
                            shared.upgrading.store(false, Ordering::SeqCst);
                            return Err(err);
                        }
                    }
                }

                Wake::Crashed(pid) => {
                    let mut state = shared.state.lock().await;
                    let current_pid = state.current.as_ref().and_then(|c| c.cmd.id());
                    if pid.is_none() || current_pid != pid {
                        info!(?pid, "stale crash notice for an already-replaced child");
                        continue;
                    }
                    if let Some(current) = state.current.take() {
                        let _ = current.watcher.await;
                        current.cmd.close().await;
                    }
                    state.reboot_budget -= 1;
                    if state.reboot_budget < 0 {
                        error!("crash-restart budget exhausted");
                        return Err(MoltError::RebootBudgetExhausted);
                    }
                    warn!(remaining = state.reboot_budget, "restarting child after crash");
                    drop(state);
                    match replace(shared.clone()).await {
                        Ok(ReplaceOutcome::Installed) => {}
                        Ok(ReplaceOutcome::NotReady) => {
                            error!("restarted child failed to become ready");
                            return Err(MoltError::ChildNotReady);
                        }
                        Err(err) => {
                            error!(%err, "restart after crash failed");
                            return Err(err);
                        }
                    }
                }
            }
        }

        info!("supervisor exited");
        Ok(())
    }
}

enum Wake {
    Shutdown,
    Upgrade,
    Crashed(Option<u32>),
    Ignored(&'static str),
}

enum SupervisorEvent {
    ChildCrashed { pid: Option<u32> },
}

enum ReplaceOutcome {
    Installed,
    NotReady,
}

struct CurrentChild {
    cmd: Arc<ChildCmd>,
    watcher: JoinHandle<()>,
}

struct State {
    current: Option<CurrentChild>,
    reboot_budget: i32,
}

struct Shared {
    child_flag: String,
    bootstrap_flag: String,
    orig_args: Vec<String>,
    listeners: Vec<(String, std::net::TcpListener)>,
    killed: AtomicBool,
    upgrading: AtomicBool,
    state: Mutex<State>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
}

/// Spawn a replacement child and install it as current once it reports
/// ready. Initial spawn, hot upgrade, and crash restart all come through
/// here; the state mutex keeps replacements from overlapping.
async fn replace(shared: Arc<Shared>) -> Result<ReplaceOutcome, MoltError> {
    let mut state = shared.state.lock().await;

    let program = shared.orig_args[0].clone();
    let mut cmd = ChildCmd::new(&program, &shared.orig_args[1..])?;
    cmd.arg(format!("--{}", shared.child_flag));

    let mut fd_map = TcpFdMap::new();
    for (name, listener) in &shared.listeners {
        fd_map.insert(name.clone(), cmd.add_file(listener.as_raw_fd()));
    }
    cmd.arg(format!(
        "--{}={}",
        shared.bootstrap_flag,
        protocol::encode_fd_map(&fd_map)?
    ));

    let mut process = cmd.start()?;
    let cmd = Arc::new(cmd);
    let pid = cmd.id();
    info!(?pid, "child started");

    // Readiness is observed on the new child's own control channel.
    let ready = match await_ready(&cmd).await {
        Ok(ready) => ready,
        Err(err) => {
            error!(%err, ?pid, "readiness handshake failed");
            discard(&cmd, &mut process).await;
            return Err(err.into());
        }
    };
    if !ready {
        warn!(?pid, "child did not become ready");
        discard(&cmd, &mut process).await;
        return Ok(ReplaceOutcome::NotReady);
    }
    info!(?pid, "child ready");

    if let Some(old) = state.current.take() {
        retire_and_reap(old).await;
    }
    // A cold upgrade has no previous child whose wait clears the flag.
    shared.upgrading.store(false, Ordering::SeqCst);

    let watcher = tokio::spawn(watch_child(shared.clone(), cmd.clone(), process));
    state.current = Some(CurrentChild { cmd, watcher });
    Ok(ReplaceOutcome::Installed)
}

/// Read the child's startup verdict. Unrecognized frames are skipped; end of
/// file before a verdict means the child died during startup.
async fn await_ready(cmd: &ChildCmd) -> Result<bool, PipeError> {
    let mut decision = None;
    cmd.read(|frame| match ControlFrame::parse(frame) {
        Some(ControlFrame::ReadyOk) => {
            decision = Some(true);
            false
        }
        Some(ControlFrame::ReadyError) => {
            decision = Some(false);
            false
        }
        _ => true,
    })
    .await?;
    Ok(decision.unwrap_or(false))
}

/// Tear down a child that never became ready.
async fn discard(cmd: &Arc<ChildCmd>, process: &mut Child) {
    if let Err(err) = cmd.kill() {
        warn!(%err, "could not kill discarded child");
    }
    let _ = process.wait().await;
    cmd.close().await;
}

/// Cooperative drain followed by the hard fallback, then reap.
async fn retire_and_reap(old: CurrentChild) {
    let pid = old.cmd.id();
    info!(?pid, "asking child to drain");
    if let Err(err) = old.cmd.write(ControlFrame::Exit.as_bytes()).await {
        warn!(%err, "could not deliver exit request");
    }
    // Wait for the drain acknowledgment; the pipe closing on the child's
    // exit ends this wait too.
    if let Err(err) = old
        .cmd
        .read(|frame| ControlFrame::parse(frame) != Some(ControlFrame::Exit))
        .await
    {
        warn!(%err, "error while awaiting drain acknowledgment");
    }
    if let Err(err) = old.cmd.kill() {
        warn!(%err, "could not kill retired child");
    }
    let _ = old.watcher.await;
    old.cmd.close().await;
}

/// Wait on a child and route its exit: an upgrade retirement and a planned
/// shutdown end here; anything else is a crash reported to the event loop.
async fn watch_child(shared: Arc<Shared>, cmd: Arc<ChildCmd>, mut process: Child) {
    let pid = cmd.id();
    let status = process.wait().await;

    if shared
        .upgrading
        .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
    {
        info!(?pid, "previous child retired after upgrade");
        return;
    }
    if shared.killed.load(Ordering::SeqCst) {
        info!(?pid, "child exited during shutdown");
        return;
    }
    match status {
        Ok(status) => error!(?pid, %status, "child exited unexpectedly"),
        Err(err) => error!(?pid, %err, "wait on child failed"),
    }
    let _ = shared.events.send(SupervisorEvent::ChildCrashed { pid });
}

/// Helper task on the child side: forward the readiness verdict upstream,
/// then watch for the parent's exit request.
async fn child_handshake(
    cmd: Arc<ChildCmd>,
    ready: oneshot::Receiver<bool>,
    verdict: oneshot::Sender<()>,
    exit: CancellationToken,
) {
    let ok = ready.await.unwrap_or(false);
    if !ok {
        warn!("business logic failed to start");
        if let Err(err) = cmd.write(ControlFrame::ReadyError.as_bytes()).await {
            error!(%err, "could not report startup failure");
        }
        let _ = verdict.send(());
        return;
    }
    let report = cmd.write(ControlFrame::ReadyOk.as_bytes()).await;
    let _ = verdict.send(());
    if let Err(err) = report {
        error!(%err, "could not report readiness");
        exit.cancel();
        return;
    }
    info!("worker serving");

    // Exit request, or EOF when the parent goes away, both mean drain.
    let outcome = cmd
        .read(|frame| ControlFrame::parse(frame) != Some(ControlFrame::Exit))
        .await;
    if let Err(err) = outcome {
        warn!(%err, "control channel failed, draining");
    }
    exit.cancel();
}

fn bootstrap_payload(args: &[String], flag: &str) -> Option<String> {
    let prefix = format!("--{flag}=");
    args.iter()
        .find_map(|arg| arg.strip_prefix(&prefix))
        .map(str::to_string)
}

fn parse_reboot_budget(args: &[String], default: i32) -> i32 {
    args.iter()
        .find_map(|arg| arg.strip_prefix("--reboot_times="))
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

fn parse_pid(raw: &str) -> Option<libc::pid_t> {
    raw.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn role_defaults_to_parent() {
        let sup = Supervisor::default();
        assert_eq!(sup.role_of(&args(&["server"])), Role::Parent);
        assert_eq!(
            sup.role_of(&args(&["server", "--verbose", "--port=80"])),
            Role::Parent
        );
    }

    #[test]
    fn role_precedence_is_child_then_upgrade() {
        let sup = Supervisor::default();
        assert_eq!(sup.role_of(&args(&["server", "--child"])), Role::Child);
        assert_eq!(
            sup.role_of(&args(&["server", "--upgrade"])),
            Role::UpgradeTrigger
        );
        assert_eq!(
            sup.role_of(&args(&["server", "--upgrade", "--child"])),
            Role::Child
        );
    }

    #[test]
    fn role_flags_are_configurable() {
        let sup = Supervisor::new("worker", "reload", "boot", "logs", "pid");
        assert_eq!(sup.role_of(&args(&["server", "--worker"])), Role::Child);
        assert_eq!(
            sup.role_of(&args(&["server", "--reload"])),
            Role::UpgradeTrigger
        );
        // The default names mean nothing to this supervisor.
        assert_eq!(sup.role_of(&args(&["server", "--child"])), Role::Parent);
    }

    #[test]
    fn bootstrap_payload_extracts_the_flag_value() {
        let list = args(&["server", "--child", r#"--bootstrap_args={"web":5}"#]);
        assert_eq!(
            bootstrap_payload(&list, "bootstrap_args").as_deref(),
            Some(r#"{"web":5}"#)
        );
        assert_eq!(bootstrap_payload(&list, "other"), None);
        // Present but empty is still extracted; the caller rejects it.
        let empty = args(&["server", "--bootstrap_args="]);
        assert_eq!(bootstrap_payload(&empty, "bootstrap_args").as_deref(), Some(""));
    }

    #[test]
    fn reboot_budget_flag_overrides_the_default() {
        assert_eq!(parse_reboot_budget(&args(&["server"]), 3), 3);
        assert_eq!(
            parse_reboot_budget(&args(&["server", "--reboot_times=0"]), 3),
            0
        );
        assert_eq!(
            parse_reboot_budget(&args(&["server", "--reboot_times=7"]), 3),
            7
        );
        // Garbage falls back to the configured default.
        assert_eq!(
            parse_reboot_budget(&args(&["server", "--reboot_times=many"]), 3),
            3
        );
    }

    #[test]
    fn with_reboot_budget_overrides_the_default() {
        let sup = Supervisor::default().with_reboot_budget(0);
        assert_eq!(sup.reboot_budget, 0);
        assert_eq!(Supervisor::default().reboot_budget, DEFAULT_REBOOT_BUDGET);
    }

    #[test]
    fn pid_files_hold_a_decimal_pid() {
        assert_eq!(parse_pid("1234"), Some(1234));
        assert_eq!(parse_pid("1234\n"), Some(1234));
        assert_eq!(parse_pid("  98  "), Some(98));
        assert_eq!(parse_pid("pid"), None);
        assert_eq!(parse_pid(""), None);
    }
}
