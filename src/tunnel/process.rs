//! Tunnel client process supervision.
//!
//! [`TunnelProcessManager::start`] spawns the tunnel binary against a local
//! port and watches its combined stdout/stderr line by line for the public
//! quick-tunnel URL. The first match wins; later matches are ignored.
//!
//! ## Lifecycle
//!
//! ```text
//! NotStarted ──start()──▶ Starting ──URL seen──▶ Connected
//!                             │
//!                             ├─ exit before URL ─▶ Failed (TunnelStartup)
//!                             └─ no URL in time ──▶ Failed (TunnelTimeout, process killed)
//! ```
//!
//! `Failed` is terminal for that attempt; nothing retries automatically.
//!
//! The child is owned by a small supervisor task. The manager only keeps a
//! kill channel and an exit watch, so `stop()` can interrupt a start that is
//! still waiting for its URL. On Unix the child runs in its own process group
//! and signals go to the whole group.

use std::process::Stdio;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::config::TunnelConfig;
use crate::error::TunnelError;

/// Captured output kept for diagnostics (64 KB).
const MAX_CAPTURED_OUTPUT: usize = 64 * 1024;

/// Extra time allowed for the supervisor to reap the child after a kill.
const REAP_GRACE: Duration = Duration::from_secs(2);

static TUNNEL_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https://([a-z0-9-]+)\.trycloudflare\.com").expect("static regex")
});

/// Find the first quick-tunnel URL in `text`.
pub fn find_tunnel_url(text: &str) -> Option<&str> {
    TUNNEL_URL
        .captures_iter(text)
        .find(|c| &c[1] != "api")
        .and_then(|c| c.get(0))
        .map(|m| m.as_str())
}

/// Observable state of the supervised child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessState {
    Running,
    /// Exit code, `None` when terminated by a signal.
    Exited(Option<i32>),
}

/// The currently held process.
struct TunnelHandle {
    generation: u64,
    pid: Option<u32>,
    port: u16,
    url: Option<String>,
    /// Send the grace period; zero means SIGKILL immediately.
    kill_tx: Option<oneshot::Sender<Duration>>,
    exit_rx: watch::Receiver<ProcessState>,
}

impl TunnelHandle {
    /// Ask the supervisor to terminate the child and wait until it is reaped.
    async fn terminate(mut self, grace: Duration) {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(grace);
        }
        let wait = self
            .exit_rx
            .wait_for(|s| matches!(s, ProcessState::Exited(_)));
        if tokio::time::timeout(grace + REAP_GRACE, wait).await.is_err() {
            warn!(pid = ?self.pid, "Tunnel process did not exit in time");
        }
    }
}

/// How the URL discovery loop ended.
enum StartOutcome {
    Url(String),
    Exited(Option<i32>),
    TimedOut,
}

#[derive(Default)]
struct ManagerState {
    handle: Option<TunnelHandle>,
    next_generation: u64,
}

/// Spawns and supervises the tunnel client. Holds at most one process.
#[derive(Clone)]
pub struct TunnelProcessManager {
    config: TunnelConfig,
    startup_timeout: Duration,
    state: Arc<Mutex<ManagerState>>,
}

impl TunnelProcessManager {
    pub fn new(config: TunnelConfig) -> Self {
        let startup_timeout = config.startup_timeout();
        Self {
            config,
            startup_timeout,
            state: Arc::new(Mutex::new(ManagerState::default())),
        }
    }

    /// Override the URL discovery window.
    #[must_use]
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True iff a process handle is held, whether or not a URL was found.
    pub fn is_running(&self) -> bool {
        self.lock().handle.is_some()
    }

    /// Public URL of the held process, once discovered.
    pub fn url(&self) -> Option<String> {
        self.lock().handle.as_ref().and_then(|h| h.url.clone())
    }

    /// Local port the held process forwards to.
    pub fn port(&self) -> Option<u16> {
        self.lock().handle.as_ref().map(|h| h.port)
    }

    /// Spawn the tunnel against `http://localhost:<local_port>` and resolve
    /// with the first public URL it reports.
    pub async fn start(&self, local_port: u16) -> Result<String, TunnelError> {
        // At most one process: replace whatever is still held.
        let previous = self.lock().handle.take();
        if let Some(previous) = previous {
            warn!(port = previous.port, "Replacing running tunnel process");
            previous.terminate(self.config.stop_timeout()).await;
        }

        let program = self.config.binary();
        let args = self.config.args_for_port(local_port);
        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(TunnelError::Spawn)?;
        let pid = child.id();
        info!(pid = ?pid, port = local_port, program = %program.display(), "Tunnel process spawned");

        let (line_tx, mut line_rx) = mpsc::channel::<String>(256);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, line_tx.clone()));
        }
        drop(line_tx);

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, mut exit_rx) = watch::channel(ProcessState::Running);
        tokio::spawn(supervise(child, pid, kill_rx, exit_tx));

        let generation = {
            let mut state = self.lock();
            state.next_generation += 1;
            let generation = state.next_generation;
            state.handle = Some(TunnelHandle {
                generation,
                pid,
                port: local_port,
                url: None,
                kill_tx: Some(kill_tx),
                exit_rx: exit_rx.clone(),
            });
            generation
        };

        let mut captured = String::new();
        let mut output_open = true;
        let deadline = tokio::time::sleep(self.startup_timeout);
        tokio::pin!(deadline);

        let outcome = loop {
            tokio::select! {
                biased;
                line = line_rx.recv(), if output_open => {
                    let Some(line) = line else {
                        // Both pipes closed; the exit watch reports the rest.
                        output_open = false;
                        continue;
                    };
                    debug!(pid = ?pid, "tunnel: {line}");
                    if let Some(url) = find_tunnel_url(&line) {
                        break StartOutcome::Url(url.to_string());
                    }
                    append_capped(&mut captured, &line);
                }
                changed = exit_rx.changed() => {
                    let state = *exit_rx.borrow();
                    match state {
                        ProcessState::Exited(code) => break StartOutcome::Exited(code),
                        ProcessState::Running if changed.is_ok() => {}
                        ProcessState::Running => break StartOutcome::Exited(None),
                    }
                }
                () = &mut deadline => break StartOutcome::TimedOut,
            }
        };

        match outcome {
            StartOutcome::Url(url) => {
                self.record_url(generation, &url);
                tokio::spawn(drain_output(pid, line_rx));
                info!(url = %url, "Tunnel connected");
                Ok(url)
            }
            StartOutcome::Exited(code) => {
                // Pick up whatever the pipes still hold.
                while let Ok(Some(line)) =
                    tokio::time::timeout(Duration::from_millis(200), line_rx.recv()).await
                {
                    append_capped(&mut captured, &line);
                }
                self.release(generation);
                warn!(pid = ?pid, code = ?code, output = %captured, "Tunnel exited before reporting a URL");
                Err(TunnelError::TunnelStartup {
                    code,
                    output: captured,
                })
            }
            StartOutcome::TimedOut => {
                let secs = self.startup_timeout.as_secs();
                warn!(pid = ?pid, secs, "Tunnel URL discovery timed out, killing process");
                if let Some(handle) = self.release(generation) {
                    handle.terminate(Duration::ZERO).await;
                }
                Err(TunnelError::TunnelTimeout { secs })
            }
        }
    }

    /// Terminate the held process, if any. Safe to call repeatedly.
    pub async fn stop(&self) {
        let handle = self.lock().handle.take();
        if let Some(handle) = handle {
            info!(pid = ?handle.pid, "Stopping tunnel process");
            handle.terminate(self.config.stop_timeout()).await;
        }
    }

    fn record_url(&self, generation: u64, url: &str) {
        if let Some(handle) = self
            .lock()
            .handle
            .as_mut()
            .filter(|h| h.generation == generation)
        {
            handle.url = Some(url.to_string());
        }
    }

    /// Remove the handle if it still belongs to `generation`.
    fn release(&self, generation: u64) -> Option<TunnelHandle> {
        let mut state = self.lock();
        if state
            .handle
            .as_ref()
            .is_some_and(|h| h.generation == generation)
        {
            state.handle.take()
        } else {
            None
        }
    }
}

fn append_capped(captured: &mut String, line: &str) {
    if captured.len() + line.len() < MAX_CAPTURED_OUTPUT {
        captured.push_str(line);
        captured.push('\n');
    }
}

async fn forward_lines(reader: impl AsyncRead + Unpin, tx: mpsc::Sender<String>) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(line).await.is_err() {
            break;
        }
    }
}

/// Keep reading after the URL is known so the child never blocks on a full pipe.
async fn drain_output(pid: Option<u32>, mut rx: mpsc::Receiver<String>) {
    while let Some(line) = rx.recv().await {
        debug!(pid = ?pid, "tunnel: {line}");
    }
}

/// Own the child until it exits or a kill request arrives.
async fn supervise(
    mut child: Child,
    pid: Option<u32>,
    kill_rx: oneshot::Receiver<Duration>,
    exit_tx: watch::Sender<ProcessState>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        grace = kill_rx => {
            // A dropped sender means the manager is gone; kill outright.
            terminate_child(&mut child, pid, grace.unwrap_or(Duration::ZERO)).await
        }
    };
    let code = match status {
        Ok(s) => s.code(),
        Err(e) => {
            warn!(pid = ?pid, "Tunnel wait error: {e}");
            None
        }
    };
    info!(pid = ?pid, code = ?code, "Tunnel process exited");
    let _ = exit_tx.send(ProcessState::Exited(code));
}

async fn terminate_child(
    child: &mut Child,
    pid: Option<u32>,
    grace: Duration,
) -> std::io::Result<std::process::ExitStatus> {
    if !grace.is_zero() {
        signal_group(pid, GroupSignal::Terminate);
        if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
            return status;
        }
        warn!(pid = ?pid, "Tunnel ignored SIGTERM, killing");
    }
    signal_group(pid, GroupSignal::Kill);
    let _ = child.start_kill();
    child.wait().await
}

#[derive(Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, sig: GroupSignal) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    let sig = match sig {
        GroupSignal::Terminate => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    let _ = killpg(Pid::from_raw(pid), sig);
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _sig: GroupSignal) {}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh_manager(script: &str) -> TunnelProcessManager {
        let config = TunnelConfig {
            binary_path: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            startup_timeout_secs: 10,
            stop_timeout_secs: 1,
        };
        TunnelProcessManager::new(config)
    }

    #[test]
    fn url_pattern_matches_quick_tunnel_only() {
        let line = "2024-01-01 INF |  https://gentle-river-42.trycloudflare.com  |";
        assert_eq!(
            find_tunnel_url(line),
            Some("https://gentle-river-42.trycloudflare.com")
        );
        assert_eq!(find_tunnel_url("https://example.com"), None);
        assert_eq!(find_tunnel_url("http://a-b.trycloudflare.com"), None);
        assert_eq!(find_tunnel_url("see https://api.trycloudflare.com/tunnel"), None);
    }

    #[tokio::test]
    async fn resolves_first_url_once() {
        let manager = sh_manager(
            "echo 'starting'; \
             echo 'https://first-one.trycloudflare.com'; \
             echo 'https://second-one.trycloudflare.com' >&2; \
             exec sleep 30",
        );
        let url = manager.start(8080).await.unwrap();
        assert_eq!(url, "https://first-one.trycloudflare.com");
        assert!(manager.is_running());
        assert_eq!(manager.url().as_deref(), Some("https://first-one.trycloudflare.com"));
        assert_eq!(manager.port(), Some(8080));
        manager.stop().await;
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn url_on_stderr_is_found() {
        let manager = sh_manager("echo 'https://err-side.trycloudflare.com' >&2; exec sleep 30");
        let url = manager.start(1).await.unwrap();
        assert_eq!(url, "https://err-side.trycloudflare.com");
        manager.stop().await;
    }

    #[tokio::test]
    async fn port_is_substituted_into_args() {
        let config = TunnelConfig {
            binary_path: "/bin/sh".to_string(),
            args: vec![
                "-c".to_string(),
                "echo \"https://port-$0.trycloudflare.com\"; exec sleep 30".to_string(),
                "{port}".to_string(),
            ],
            startup_timeout_secs: 10,
            stop_timeout_secs: 1,
        };
        let manager = TunnelProcessManager::new(config);
        let url = manager.start(4321).await.unwrap();
        assert_eq!(url, "https://port-4321.trycloudflare.com");
        manager.stop().await;
    }

    #[tokio::test]
    async fn early_exit_reports_code_and_output() {
        let manager = sh_manager("echo 'failed to connect'; echo 'bad creds' >&2; exit 3");
        let err = manager.start(8080).await.unwrap_err();
        match err {
            TunnelError::TunnelStartup { code, output } => {
                assert_eq!(code, Some(3));
                assert!(output.contains("failed to connect"));
                assert!(output.contains("bad creds"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn silent_process_times_out_and_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let script = format!("echo $$ > {}; exec sleep 30", pid_file.display());
        let manager = sh_manager(&script).with_startup_timeout(Duration::from_secs(1));

        let err = manager.start(8080).await.unwrap_err();
        assert!(matches!(err, TunnelError::TunnelTimeout { .. }));
        assert!(!manager.is_running());

        let pid: i32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        let alive = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok();
        assert!(!alive, "tunnel process {pid} survived the timeout");
    }

    #[tokio::test]
    async fn spawn_failure_is_immediate() {
        let config = TunnelConfig {
            binary_path: "/nonexistent/cloudflared".to_string(),
            ..TunnelConfig::default()
        };
        let manager = TunnelProcessManager::new(config);
        let err = manager.start(8080).await.unwrap_err();
        assert!(matches!(err, TunnelError::Spawn(_)));
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let manager = sh_manager("exec sleep 30");
        manager.stop().await;
        assert!(!manager.is_running());
        manager.stop().await;
    }

    #[tokio::test]
    async fn stop_interrupts_pending_start() {
        let manager = sh_manager("exec sleep 30");
        let starter = manager.clone();
        let pending = tokio::spawn(async move { starter.start(8080).await });
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(manager.is_running());
        manager.stop().await;
        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, TunnelError::TunnelStartup { .. }));
        assert!(!manager.is_running());
    }
}
