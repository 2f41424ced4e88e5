//! Tunnel lifecycle supervision.
//!
//! One helper child per backend hostname. A tunnel is reference counted by
//! the connections using it, torn down after an idle grace period, and
//! restarted with bounded linear backoff if the helper dies while connections
//! are still attached. All waiters for the same hostname observe a single
//! launch outcome through a shared watch channel.
//!
//! Lock discipline: every field of every tunnel state is guarded by the one
//! manager mutex, and the guard is never held across process spawns, dials,
//! or timer waits. Spawned tasks re-look the state up by hostname when they
//! fire, so a task that outlives its tunnel simply finds nothing to do. Each
//! launch carries a generation number and may only mutate the state (or
//! release the state's port) while its generation is still current.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::error::TunnelError;
use crate::tunnel::hostname::derive_tunnel_hostname;
use crate::tunnel::port_pool::PortPool;

/// Per-attempt timeout for one readiness dial.
const PROBE_DIAL_TIMEOUT: Duration = Duration::from_millis(500);

/// Pause between readiness dial attempts.
const PROBE_RETRY_DELAY: Duration = Duration::from_millis(300);

/// Grace between SIGTERM and SIGKILL when stopping a child.
const CHILD_STOP_GRACE: Duration = Duration::from_secs(2);

/// Tunable settings for the tunnel manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub idle_timeout: Duration,
    pub startup_timeout: Duration,
    pub restart_backoff: Duration,
    pub max_restarts: u32,
    pub port_range_start: u16,
    pub port_range_end: u16,
}

impl From<&crate::config::Config> for ManagerConfig {
    fn from(cfg: &crate::config::Config) -> Self {
        Self {
            idle_timeout: cfg.idle_timeout,
            startup_timeout: cfg.startup_timeout,
            restart_backoff: cfg.restart_backoff,
            max_restarts: cfg.max_restarts,
            port_range_start: cfg.port_range_start,
            port_range_end: cfg.port_range_end,
        }
    }
}

/// Spawns the helper process that carries traffic for one backend hostname.
///
/// Production uses [`CloudflaredSpawner`]; tests substitute scripted helpers.
pub trait TunnelSpawner: Send + Sync {
    fn spawn(&self, hostname: &str, port: u16) -> io::Result<Child>;
}

/// Runs `cloudflared access tcp` for the derived hostname on a loopback port.
pub struct CloudflaredSpawner {
    program: PathBuf,
}

impl CloudflaredSpawner {
    pub fn new() -> Self {
        Self {
            program: PathBuf::from("cloudflared"),
        }
    }

    pub fn with_program(program: PathBuf) -> Self {
        Self { program }
    }
}

impl Default for CloudflaredSpawner {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelSpawner for CloudflaredSpawner {
    fn spawn(&self, hostname: &str, port: u16) -> io::Result<Child> {
        Command::new(&self.program)
            .args(["access", "tcp", "--hostname", hostname, "--url"])
            .arg(format!("localhost:{port}"))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
    }
}

/// Supervision state for one backend hostname.
struct TunnelState {
    hostname: String,
    /// Connections currently attached to this tunnel.
    ref_count: usize,
    /// Loopback port reserved for the helper, kept across restarts.
    port: Option<u16>,
    /// Whether a helper child currently exists.
    child_running: bool,
    /// Cancels the child's exit watcher, which kills and reaps the child.
    cancel: Option<watch::Sender<bool>>,
    /// Handle to the exit watcher, awaited by the stop routine.
    exit_watcher: Option<JoinHandle<()>>,
    /// Broadcast of the in-flight (or last) launch outcome.
    ready: Option<watch::Receiver<bool>>,
    /// Last start or exit error; readable once `ready` fires.
    start_error: Option<TunnelError>,
    /// Pending idle teardown, armed only while `ref_count == 0`.
    idle_timer: Option<JoinHandle<()>>,
    /// Consecutive failed launches since the last successful ready.
    restart_attempts: u32,
    /// Monotonic launch identity.
    launch_gen: u64,
}

impl TunnelState {
    fn new(hostname: String) -> Self {
        Self {
            hostname,
            ref_count: 0,
            port: None,
            child_running: false,
            cancel: None,
            exit_watcher: None,
            ready: None,
            start_error: None,
            idle_timer: None,
            restart_attempts: 0,
            launch_gen: 0,
        }
    }

    /// Arm a fresh ready signal and hand back its sender and generation.
    fn begin_launch(&mut self) -> (watch::Sender<bool>, u64) {
        let (tx, rx) = watch::channel(false);
        self.ready = Some(rx);
        self.launch_gen += 1;
        (tx, self.launch_gen)
    }
}

struct ManagerInner {
    closed: bool,
    nodes: HashMap<String, TunnelState>,
}

/// Tracks tunnels per backend hostname and manages their lifecycles.
pub struct TunnelManager {
    inner: Mutex<ManagerInner>,
    ports: PortPool,
    spawner: Box<dyn TunnelSpawner>,
    cfg: ManagerConfig,
}

impl TunnelManager {
    pub fn new(cfg: ManagerConfig) -> Self {
        Self::with_spawner(cfg, Box::new(CloudflaredSpawner::new()))
    }

    pub fn with_spawner(cfg: ManagerConfig, spawner: Box<dyn TunnelSpawner>) -> Self {
        Self {
            inner: Mutex::new(ManagerInner {
                closed: false,
                nodes: HashMap::new(),
            }),
            ports: PortPool::new(cfg.port_range_start, cfg.port_range_end),
            spawner,
            cfg,
        }
    }

    /// Ensure a tunnel for the given SNI is running and return its local port.
    ///
    /// Increments the tunnel's reference count; the caller must pair this
    /// with [`TunnelManager::release`]. Failure paths release internally.
    pub async fn get_or_start(self: &Arc<Self>, sni: &str) -> Result<u16, TunnelError> {
        let hostname = derive_tunnel_hostname(sni)?;

        let ready = {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return Err(TunnelError::ManagerClosed);
            }
            let state = inner
                .nodes
                .entry(hostname.clone())
                .or_insert_with(|| TunnelState::new(hostname.clone()));
            state.ref_count += 1;

            if let Some(timer) = state.idle_timer.take() {
                timer.abort();
            }

            let exhausted = matches!(state.start_error, Some(TunnelError::ExhaustedRestarts(_)));
            if !state.child_running && state.ready.is_none() && !exhausted {
                let (tx, gen) = state.begin_launch();
                let manager = Arc::clone(self);
                let host = hostname.clone();
                tokio::spawn(async move {
                    manager.launch(host, gen, tx).await;
                });
            }
            state.ready.clone()
        };

        if let Some(mut rx) = ready {
            // Wakes on success, on failure, and if the launch is superseded;
            // the outcome is read from the state either way.
            let _ = rx.wait_for(|done| *done).await;
        }

        let outcome = {
            let inner = self.inner.lock().await;
            match inner.nodes.get(&hostname) {
                Some(state) => (state.start_error.clone(), state.port),
                None => (Some(TunnelError::Stopped), None),
            }
        };

        match outcome {
            (Some(err), _) => {
                self.release(sni).await;
                Err(err)
            }
            (None, Some(port)) => Ok(port),
            (None, None) => {
                self.release(sni).await;
                Err(TunnelError::StartupFailed(format!(
                    "no port assigned for {hostname}"
                )))
            }
        }
    }

    /// Drop one reference to the tunnel; the last reference arms the idle
    /// teardown timer.
    pub async fn release(self: &Arc<Self>, sni: &str) {
        let Ok(hostname) = derive_tunnel_hostname(sni) else {
            return;
        };

        let mut inner = self.inner.lock().await;
        let Some(state) = inner.nodes.get_mut(&hostname) else {
            return;
        };

        if state.ref_count > 0 {
            state.ref_count -= 1;
        }

        if state.ref_count == 0 && state.idle_timer.is_none() {
            let manager = Arc::clone(self);
            let host = hostname.clone();
            let idle = self.cfg.idle_timeout;
            state.idle_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(idle).await;
                manager.stop_tunnel(&host, false).await;
            }));
        }
    }

    /// Stop every tunnel and refuse further allocations.
    ///
    /// Waits up to `grace` for all helpers to be reaped; stops still in
    /// flight after that are left to finish on their own.
    pub async fn shutdown(self: &Arc<Self>, grace: Duration) {
        let hostnames: Vec<String> = {
            let mut inner = self.inner.lock().await;
            inner.closed = true;
            inner.nodes.keys().cloned().collect()
        };
        if hostnames.is_empty() {
            return;
        }

        info!(tunnels = hostnames.len(), "shutting down tunnel manager");
        let mut stops = JoinSet::new();
        for hostname in hostnames {
            let manager = Arc::clone(self);
            stops.spawn(async move {
                manager.stop_tunnel(&hostname, true).await;
            });
        }

        let drain = async {
            while stops.join_next().await.is_some() {}
        };
        if timeout(grace, drain).await.is_err() {
            warn!("shutdown grace elapsed with tunnel helpers still stopping");
        }
    }

    /// Launch task: reserve a port if needed, spawn the helper, wait for the
    /// loopback port to accept, then hand the child to an exit watcher.
    async fn launch(self: Arc<Self>, hostname: String, gen: u64, ready: watch::Sender<bool>) {
        let existing_port = {
            let inner = self.inner.lock().await;
            inner.nodes.get(&hostname).and_then(|s| s.port)
        };

        let port = match existing_port {
            Some(port) => port,
            None => {
                let port = match self.ports.reserve().await {
                    Ok(port) => port,
                    Err(err) => {
                        error!(hostname = %hostname, error = %err, "port reservation failed");
                        self.fail_launch(&hostname, gen, TunnelError::StartupFailed(err.to_string()))
                            .await;
                        let _ = ready.send(true);
                        return;
                    }
                };
                let stored = {
                    let mut inner = self.inner.lock().await;
                    match inner.nodes.get_mut(&hostname) {
                        Some(state) if state.launch_gen == gen => {
                            state.port = Some(port);
                            true
                        }
                        _ => false,
                    }
                };
                if !stored {
                    // Superseded before the reservation landed.
                    self.ports.release(port).await;
                    let _ = ready.send(true);
                    return;
                }
                port
            }
        };

        info!(hostname = %hostname, port, "starting tunnel helper");

        let mut child = match self.spawner.spawn(&hostname, port) {
            Ok(child) => child,
            Err(err) => {
                error!(hostname = %hostname, port, error = %err, "tunnel helper spawn failed");
                let owned = self
                    .fail_launch(&hostname, gen, TunnelError::StartupFailed(err.to_string()))
                    .await;
                if owned {
                    self.ports.release(port).await;
                }
                let _ = ready.send(true);
                return;
            }
        };

        if let Some(stdout) = child.stdout.take() {
            pump_child_output(hostname.clone(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            pump_child_output(hostname.clone(), "stderr", stderr);
        }

        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let superseded = {
            let mut inner = self.inner.lock().await;
            match inner.nodes.get_mut(&hostname) {
                Some(state) if state.launch_gen == gen => {
                    state.child_running = true;
                    state.cancel = Some(cancel_tx);
                    state.start_error = None;
                    false
                }
                _ => true,
            }
        };
        if superseded {
            // A stop or shutdown overtook this launch while the child was
            // being spawned; it owns the state, we own the orphan child.
            stop_child(&mut child).await;
            let _ = ready.send(true);
            return;
        }

        if let Err(err) = self.wait_for_port(port, &mut cancel_rx).await {
            warn!(hostname = %hostname, port, error = %err, "tunnel helper did not become ready");
            stop_child(&mut child).await;
            let owned = self.fail_launch(&hostname, gen, err).await;
            if owned {
                self.ports.release(port).await;
            }
            let _ = ready.send(true);
            return;
        }

        info!(hostname = %hostname, port, "tunnel ready");

        {
            let mut inner = self.inner.lock().await;
            if let Some(state) = inner.nodes.get_mut(&hostname) {
                if state.launch_gen == gen {
                    state.restart_attempts = 0;
                }
            }
        }
        let _ = ready.send(true);

        let watcher = tokio::spawn(Arc::clone(&self).watch_child(
            hostname.clone(),
            gen,
            child,
            cancel_rx,
        ));
        let mut inner = self.inner.lock().await;
        if let Some(state) = inner.nodes.get_mut(&hostname) {
            if state.launch_gen == gen {
                state.exit_watcher = Some(watcher);
            }
        }
    }

    /// Record a launch failure. Returns whether this launch still owned the
    /// state (and with it the duty to release the reserved port).
    ///
    /// A failure inside a restart sequence keeps the sequence going with
    /// linear backoff until the cap, so a helper that keeps dying before it
    /// is reachable is bounded the same way as one that dies afterwards.
    async fn fail_launch(self: &Arc<Self>, hostname: &str, gen: u64, err: TunnelError) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(state) = inner.nodes.get_mut(hostname) else {
            return false;
        };
        if state.launch_gen != gen {
            return false;
        }

        state.child_running = false;
        state.cancel = None;
        state.exit_watcher = None;
        state.port = None;
        state.ready = None;
        state.start_error = Some(err.clone());

        if state.restart_attempts > 0 && state.ref_count > 0 {
            state.restart_attempts += 1;
            let attempts = state.restart_attempts;
            if attempts > self.cfg.max_restarts {
                error!(
                    hostname = %hostname,
                    attempts,
                    "tunnel keeps failing with connections attached, giving up"
                );
                state.start_error = Some(TunnelError::ExhaustedRestarts(err.to_string()));
            } else {
                self.schedule_relaunch(state, attempts);
            }
        }
        true
    }

    /// Arm a fresh ready signal and fire a relaunch after linear backoff.
    /// Caller holds the manager lock.
    fn schedule_relaunch(self: &Arc<Self>, state: &mut TunnelState, attempts: u32) {
        let backoff = self.cfg.restart_backoff * attempts;
        info!(
            hostname = %state.hostname,
            active = state.ref_count,
            attempts,
            backoff_ms = backoff.as_millis() as u64,
            "restarting tunnel helper"
        );
        let (tx, next_gen) = state.begin_launch();
        let manager = Arc::clone(self);
        let host = state.hostname.clone();
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            manager.launch(host, next_gen, tx).await;
        });
    }

    /// Dial the helper's loopback port until it accepts, the startup deadline
    /// passes, or the launch is cancelled.
    async fn wait_for_port(
        &self,
        port: u16,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), TunnelError> {
        let deadline = tokio::time::Instant::now() + self.cfg.startup_timeout;
        loop {
            match timeout(PROBE_DIAL_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await {
                Ok(Ok(_probe)) => return Ok(()),
                Ok(Err(_)) | Err(_) => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(TunnelError::StartupFailed(format!(
                    "timeout waiting for 127.0.0.1:{port}"
                )));
            }
            tokio::select! {
                _ = tokio::time::sleep(PROBE_RETRY_DELAY) => {}
                // A closed channel means the state dropped this launch, which
                // is cancellation by another name.
                _ = cancel.wait_for(|cancelled| *cancelled) => {
                    return Err(TunnelError::Stopped);
                }
            }
        }
    }

    /// Exit watcher: owns the child until it exits on its own or the tunnel
    /// is cancelled. Only this task kills or reaps the child.
    async fn watch_child(
        self: Arc<Self>,
        hostname: String,
        gen: u64,
        mut child: Child,
        mut cancel: watch::Receiver<bool>,
    ) {
        tokio::select! {
            status = child.wait() => {
                let detail = match status {
                    Ok(status) => status.to_string(),
                    Err(err) => err.to_string(),
                };
                info!(hostname = %hostname, status = %detail, "tunnel helper exited");
                self.handle_exit(&hostname, gen, detail).await;
            }
            _ = async { let _ = cancel.wait_for(|cancelled| *cancelled).await; } => {
                stop_child(&mut child).await;
            }
        }
    }

    /// React to a child that exited on its own: record the failure and, while
    /// connections are attached, schedule a relaunch with linear backoff up
    /// to the restart cap.
    async fn handle_exit(self: &Arc<Self>, hostname: &str, gen: u64, detail: String) {
        let mut inner = self.inner.lock().await;
        let Some(state) = inner.nodes.get_mut(hostname) else {
            return;
        };
        if state.launch_gen != gen {
            // A stop already took this child over; nothing left to do here.
            return;
        }

        let active = state.ref_count;
        state.child_running = false;
        state.cancel = None;
        state.exit_watcher = None;
        state.ready = None;
        state.start_error = Some(TunnelError::Exited(detail.clone()));
        state.restart_attempts += 1;
        let attempts = state.restart_attempts;

        if active == 0 {
            // Idle: the armed teardown timer reclaims the port.
            return;
        }

        if attempts > self.cfg.max_restarts {
            error!(
                hostname = %hostname,
                attempts,
                "tunnel keeps exiting with connections attached, giving up"
            );
            state.start_error = Some(TunnelError::ExhaustedRestarts(detail));
            return;
        }

        self.schedule_relaunch(state, attempts);
    }

    /// Stop routine shared by idle teardown and shutdown.
    ///
    /// Without `force` this re-validates that the tunnel is still unused, so
    /// an idle timer that fires after a revival does nothing.
    async fn stop_tunnel(self: &Arc<Self>, hostname: &str, force: bool) {
        let (cancel, watcher, port) = {
            let mut inner = self.inner.lock().await;
            let Some(state) = inner.nodes.get_mut(hostname) else {
                return;
            };
            if state.ref_count > 0 && !force {
                return;
            }
            let cancel = state.cancel.take();
            let watcher = state.exit_watcher.take();
            let port = state.port.take();
            state.child_running = false;
            state.ready = None;
            state.start_error = Some(TunnelError::Stopped);
            state.idle_timer = None;
            state.restart_attempts = 0;
            state.launch_gen += 1;
            (cancel, watcher, port)
        };

        if cancel.is_some() || port.is_some() {
            info!(hostname = %hostname, force, "stopping tunnel helper");
        }
        if let Some(cancel) = cancel {
            let _ = cancel.send(true);
        }
        if let Some(watcher) = watcher {
            // The watcher terms the child, waits out the grace, kills, reaps.
            let _ = watcher.await;
        }
        if let Some(port) = port {
            self.ports.release(port).await;
        }
    }

    #[cfg(test)]
    async fn node_snapshot(&self, hostname: &str) -> Option<(usize, Option<u16>, bool, u32)> {
        let inner = self.inner.lock().await;
        inner
            .nodes
            .get(hostname)
            .map(|s| (s.ref_count, s.port, s.child_running, s.restart_attempts))
    }
}

/// SIGTERM, a short grace, then SIGKILL-and-reap.
async fn stop_child(child: &mut Child) {
    if let Some(pid) = child.id() {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        if timeout(CHILD_STOP_GRACE, child.wait()).await.is_ok() {
            return;
        }
    }
    let _ = child.kill().await;
}

/// Forward one helper output stream to the log, line by line.
fn pump_child_output<R>(hostname: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => info!(hostname = %hostname, stream, "{line}"),
                Ok(None) => break,
                Err(err) => {
                    debug!(hostname = %hostname, stream, error = %err, "helper output stream error");
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    /// Test double for the cloudflared helper: spawns a `sleep` child and,
    /// depending on the mode, serves the tunnel port from a side task so
    /// readiness probes succeed without the real binary.
    struct FakeSpawner {
        /// Lifetime handed to `sleep`; short values simulate crashing helpers.
        child_lifetime: &'static str,
        serve: ServeMode,
        spawns: Arc<AtomicUsize>,
    }

    #[derive(Clone, Copy)]
    enum ServeMode {
        /// Keep the port served for the whole test.
        Always,
        /// Serve a single probe on the first spawn, nothing afterwards.
        FirstProbeOnly,
        /// Never listen; every readiness probe times out.
        Never,
    }

    impl FakeSpawner {
        fn new(child_lifetime: &'static str, serve: ServeMode) -> Self {
            Self {
                child_lifetime,
                serve,
                spawns: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn spawn_counter(&self) -> Arc<AtomicUsize> {
            Arc::clone(&self.spawns)
        }
    }

    impl TunnelSpawner for FakeSpawner {
        fn spawn(&self, _hostname: &str, port: u16) -> io::Result<Child> {
            let spawn_index = self.spawns.fetch_add(1, Ordering::SeqCst);
            let child = Command::new("sleep")
                .arg(self.child_lifetime)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()?;
            match self.serve {
                ServeMode::Always => {
                    tokio::spawn(async move {
                        let Ok(listener) = TcpListener::bind(("127.0.0.1", port)).await else {
                            return;
                        };
                        while listener.accept().await.is_ok() {}
                    });
                }
                ServeMode::FirstProbeOnly if spawn_index == 0 => {
                    tokio::spawn(async move {
                        let Ok(listener) = TcpListener::bind(("127.0.0.1", port)).await else {
                            return;
                        };
                        let _ = listener.accept().await;
                    });
                }
                _ => {}
            }
            Ok(child)
        }
    }

    struct BrokenSpawner;

    impl TunnelSpawner for BrokenSpawner {
        fn spawn(&self, _hostname: &str, _port: u16) -> io::Result<Child> {
            Err(io::Error::new(io::ErrorKind::NotFound, "no such helper"))
        }
    }

    fn test_config(range: (u16, u16)) -> ManagerConfig {
        ManagerConfig {
            idle_timeout: Duration::from_millis(200),
            startup_timeout: Duration::from_millis(500),
            restart_backoff: Duration::from_millis(50),
            max_restarts: 2,
            port_range_start: range.0,
            port_range_end: range.1,
        }
    }

    fn manager(
        range: (u16, u16),
        spawner: impl TunnelSpawner + 'static,
    ) -> (Arc<TunnelManager>, ManagerConfig) {
        let cfg = test_config(range);
        (
            Arc::new(TunnelManager::with_spawner(cfg.clone(), Box::new(spawner))),
            cfg,
        )
    }

    #[tokio::test]
    async fn test_get_or_start_reuses_running_tunnel() {
        let spawner = FakeSpawner::new("60", ServeMode::Always);
        let spawns = spawner.spawn_counter();
        let (mgr, _) = manager((21200, 21209), spawner);

        let first = mgr.get_or_start("db.example.link").await.unwrap();
        let second = mgr.get_or_start("db.example.link").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(spawns.load(Ordering::SeqCst), 1);

        let (refs, port, running, _) = mgr.node_snapshot("cft-db.example.link").await.unwrap();
        assert_eq!(refs, 2);
        assert_eq!(port, Some(first));
        assert!(running);

        mgr.release("db.example.link").await;
        mgr.release("db.example.link").await;
        mgr.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_quick_revival_keeps_tunnel() {
        let spawner = FakeSpawner::new("60", ServeMode::Always);
        let spawns = spawner.spawn_counter();
        let (mgr, _) = manager((21210, 21219), spawner);

        let first = mgr.get_or_start("db.example.link").await.unwrap();
        mgr.release("db.example.link").await;

        // Come back well inside the idle window.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = mgr.get_or_start("db.example.link").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(
            spawns.load(Ordering::SeqCst),
            1,
            "revival must not launch a second helper"
        );

        mgr.release("db.example.link").await;
        mgr.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_idle_teardown_then_fresh_launch() {
        let spawner = FakeSpawner::new("60", ServeMode::Always);
        let spawns = spawner.spawn_counter();
        let (mgr, cfg) = manager((21220, 21229), spawner);

        mgr.get_or_start("db.example.link").await.unwrap();
        mgr.release("db.example.link").await;

        tokio::time::sleep(cfg.idle_timeout + Duration::from_millis(300)).await;
        let (_, port, running, _) = mgr.node_snapshot("cft-db.example.link").await.unwrap();
        assert!(!running, "idle tunnel should have been stopped");
        assert!(port.is_none(), "stopped tunnel must not hold a port");

        // The hostname is usable again and goes through a fresh launch.
        mgr.get_or_start("db.example.link").await.unwrap();
        assert_eq!(spawns.load(Ordering::SeqCst), 2);
        let (_, _, running, attempts) = mgr.node_snapshot("cft-db.example.link").await.unwrap();
        assert!(running);
        assert_eq!(attempts, 0);

        mgr.release("db.example.link").await;
        mgr.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_startup_failure_releases_port() {
        // Child runs but nothing ever listens, so readiness times out.
        let (mgr, _) = manager((21230, 21230), FakeSpawner::new("60", ServeMode::Never));

        let err = mgr.get_or_start("db.example.link").await.unwrap_err();
        assert!(matches!(err, TunnelError::StartupFailed(_)));

        let (refs, port, _, _) = mgr.node_snapshot("cft-db.example.link").await.unwrap();
        assert_eq!(refs, 0, "failed start must not leak a reference");
        assert!(port.is_none());

        // The single pool port must have been released.
        assert_eq!(mgr.ports.reserve().await.unwrap(), 21230);
        mgr.ports.release(21230).await;
        mgr.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_spawn_failure_surfaces() {
        let (mgr, _) = manager((21240, 21249), BrokenSpawner);

        let err = mgr.get_or_start("db.example.link").await.unwrap_err();
        assert!(matches!(err, TunnelError::StartupFailed(_)));
        mgr.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_invalid_sni_is_rejected() {
        let (mgr, _) = manager((21250, 21259), FakeSpawner::new("60", ServeMode::Always));
        let err = mgr.get_or_start("no-dots").await.unwrap_err();
        assert!(matches!(err, TunnelError::InvalidSni { .. }));
        mgr.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_closed_manager_refuses_requests() {
        let (mgr, _) = manager((21260, 21269), FakeSpawner::new("60", ServeMode::Always));
        mgr.shutdown(Duration::from_secs(5)).await;

        let err = mgr.get_or_start("db.example.link").await.unwrap_err();
        assert!(matches!(err, TunnelError::ManagerClosed));
    }

    #[tokio::test]
    async fn test_restarts_exhaust_with_attached_connections() {
        // The first helper becomes ready and dies; every relaunch fails its
        // readiness probe. With a connection still attached the manager keeps
        // retrying with backoff until the cap, then fails fast.
        let (mgr, cfg) = manager(
            (21270, 21279),
            FakeSpawner::new("0.2", ServeMode::FirstProbeOnly),
        );

        mgr.get_or_start("db.example.link").await.unwrap();

        // Worst case: child lifetime, then per attempt backoff + probe
        // deadline. Give the whole sequence generous headroom.
        let per_attempt = cfg.startup_timeout + cfg.restart_backoff * (cfg.max_restarts + 1);
        tokio::time::sleep(Duration::from_millis(300) + per_attempt * (cfg.max_restarts + 2))
            .await;

        let err = mgr.get_or_start("db.example.link").await.unwrap_err();
        assert!(
            matches!(err, TunnelError::ExhaustedRestarts(_)),
            "expected exhausted restarts, got {err:?}"
        );

        mgr.release("db.example.link").await;
        mgr.release("db.example.link").await;
        mgr.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_running_tunnels() {
        let (mgr, _) = manager((21280, 21289), FakeSpawner::new("60", ServeMode::Always));

        mgr.get_or_start("db.example.link").await.unwrap();
        mgr.shutdown(Duration::from_secs(5)).await;

        let (_, port, running, _) = mgr.node_snapshot("cft-db.example.link").await.unwrap();
        assert!(!running);
        assert!(port.is_none(), "shutdown must return the port to the pool");
    }
}
