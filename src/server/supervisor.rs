//! Child-process supervision: spawn, stop, restart, status, and stderr
//! capture for the managed fleet.
//!
//! Each record owns at most one live OS process. While Running, a stdin
//! writer (inside the multiplexer), a stdout reader task, and a stderr reader
//! task exist exclusively for that record; every transition away from Running
//! tears all three down and terminally resolves the record's pending calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use super::mux::Multiplexer;
use super::{ServerState, StderrBuffer};
use crate::config::{RestartPolicy, ServerConfig, resolve_env_vars};
use crate::error::GatewayError;
use crate::telemetry::GatewayMetrics;

/// How often the exit watcher and stop paths poll for child exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Ceiling for policy-driven restart backoff.
const RESTART_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Deadline for the protocol-level shutdown request during graceful stop.
const SHUTDOWN_CALL_TIMEOUT: Duration = Duration::from_secs(2);

/// Live process attachments, present exactly while the record is Running
/// (or briefly Starting).
struct ChildRuntime {
    child: Arc<tokio::sync::Mutex<Child>>,
    mux: Arc<Multiplexer>,
    cancel: CancellationToken,
}

/// One supervised child record: static config plus runtime status.
pub struct ManagedServer {
    pub config: ServerConfig,
    metrics: GatewayMetrics,
    state: Mutex<ServerState>,
    restart_count: AtomicU32,
    consecutive_failures: AtomicU32,
    last_start: Mutex<Option<Instant>>,
    last_restart_unix: Mutex<Option<u64>>,
    health: Mutex<(bool, String)>,
    stderr: Arc<Mutex<StderrBuffer>>,
    runtime: tokio::sync::Mutex<Option<ChildRuntime>>,
    /// Serialises admin mutations (start/stop/restart/delete) on this record.
    pub admin_lock: tokio::sync::Mutex<()>,
}

/// Status snapshot exposed by the admin endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatusSnapshot {
    pub id: String,
    pub state: String,
    pub is_running: bool,
    pub healthy: bool,
    pub health_message: String,
    pub restart_count: u32,
    pub uptime_seconds: u64,
    pub consecutive_failures: u32,
    pub last_restart_unix: Option<u64>,
    pub has_oom_marker: bool,
    pub port: Option<u16>,
}

impl std::fmt::Debug for ManagedServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedServer")
            .field("id", &self.config.id)
            .finish()
    }
}

impl ManagedServer {
    fn new(config: ServerConfig, metrics: GatewayMetrics) -> Self {
        let stderr_capacity = config.stderr_capacity;
        ManagedServer {
            config,
            metrics,
            state: Mutex::new(ServerState::Stopped),
            restart_count: AtomicU32::new(0),
            consecutive_failures: AtomicU32::new(0),
            last_start: Mutex::new(None),
            last_restart_unix: Mutex::new(None),
            health: Mutex::new((false, "not started".to_string())),
            stderr: Arc::new(Mutex::new(StderrBuffer::new(stderr_capacity))),
            runtime: tokio::sync::Mutex::new(None),
            admin_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn state(&self) -> ServerState {
        *self.state.lock().expect("state lock poisoned")
    }

    fn set_state(&self, state: ServerState) {
        *self.state.lock().expect("state lock poisoned") = state;
        self.metrics
            .server_status
            .set(&[&self.config.id], state.gauge_value());
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count.load(Ordering::SeqCst)
    }

    /// Record one unhealthy observation; returns the consecutive count.
    pub fn mark_unhealthy(&self, message: &str) -> u32 {
        *self.health.lock().expect("health lock poisoned") = (false, message.to_string());
        self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn mark_healthy(&self) {
        *self.health.lock().expect("health lock poisoned") = (true, "ok".to_string());
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    /// OS process id of the running child, if any.
    pub async fn pid(&self) -> Option<u32> {
        let runtime = self.runtime.lock().await;
        match runtime.as_ref() {
            Some(rt) => rt.child.lock().await.id(),
            None => None,
        }
    }

    /// Whether the OS process is currently alive.
    pub async fn is_alive(&self) -> bool {
        let runtime = self.runtime.lock().await;
        match runtime.as_ref() {
            Some(rt) => matches!(rt.child.lock().await.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Multiplexer handle for the running child.
    pub async fn mux(&self) -> crate::Result<Arc<Multiplexer>> {
        let runtime = self.runtime.lock().await;
        runtime
            .as_ref()
            .map(|rt| rt.mux.clone())
            .ok_or_else(|| {
                GatewayError::InvalidState(self.config.id.clone(), "server is not running".into())
            })
    }

    /// Last `n` stderr lines, oldest first.
    pub fn tail_stderr(&self, n: usize) -> Vec<String> {
        self.stderr.lock().expect("stderr lock poisoned").tail(n)
    }

    fn uptime_seconds(&self) -> u64 {
        if self.state() != ServerState::Running {
            return 0;
        }
        self.last_start
            .lock()
            .expect("last_start lock poisoned")
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> ServerStatusSnapshot {
        let state = self.state();
        let uptime = self.uptime_seconds();
        self.metrics
            .server_uptime_seconds
            .set(&[&self.config.id], uptime as f64);
        let (healthy, health_message) = self.health.lock().expect("health lock poisoned").clone();
        ServerStatusSnapshot {
            id: self.config.id.clone(),
            state: state.as_str().to_string(),
            is_running: state == ServerState::Running,
            healthy,
            health_message,
            restart_count: self.restart_count(),
            uptime_seconds: uptime,
            consecutive_failures: self.consecutive_failures.load(Ordering::SeqCst),
            last_restart_unix: *self
                .last_restart_unix
                .lock()
                .expect("last_restart lock poisoned"),
            has_oom_marker: self.stderr.lock().expect("stderr lock poisoned").marker_seen(),
            port: self.config.port,
        }
    }
}

/// Supervisor over the fleet of child records.
///
/// The health monitor drives restarts through this interface only; no
/// back-reference from supervisor to monitor exists.
pub struct Supervisor {
    servers: RwLock<HashMap<String, Arc<ManagedServer>>>,
    /// Process-wide monotone JSON-RPC request id counter, shared by every
    /// child's multiplexer.
    next_request_id: Arc<AtomicU64>,
    metrics: GatewayMetrics,
}

impl Supervisor {
    pub fn new(metrics: GatewayMetrics) -> Arc<Self> {
        Arc::new(Supervisor {
            servers: RwLock::new(HashMap::new()),
            next_request_id: Arc::new(AtomicU64::new(1)),
            metrics,
        })
    }

    /// Register a record without starting it.
    pub fn insert(&self, config: ServerConfig) -> crate::Result<Arc<ManagedServer>> {
        let mut servers = self.servers.write().expect("servers lock poisoned");
        if servers.contains_key(&config.id) {
            return Err(GatewayError::DuplicateId(config.id));
        }
        let record = Arc::new(ManagedServer::new(config, self.metrics.clone()));
        servers.insert(record.config.id.clone(), record.clone());
        Ok(record)
    }

    pub fn get(&self, id: &str) -> crate::Result<Arc<ManagedServer>> {
        self.servers
            .read()
            .expect("servers lock poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(id.to_string()))
    }

    pub fn records(&self) -> Vec<Arc<ManagedServer>> {
        self.servers
            .read()
            .expect("servers lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn list(&self) -> Vec<ServerStatusSnapshot> {
        let mut snapshots: Vec<ServerStatusSnapshot> =
            self.records().iter().map(|r| r.snapshot()).collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    pub fn status(&self, id: &str) -> crate::Result<ServerStatusSnapshot> {
        Ok(self.get(id)?.snapshot())
    }

    /// Stop (if running) and remove a record.
    pub async fn remove(&self, id: &str) -> crate::Result<()> {
        let record = self.get(id)?;
        let _ = self.stop_record(&record, true).await;
        self.servers
            .write()
            .expect("servers lock poisoned")
            .remove(id);
        Ok(())
    }

    /// Spawn the configured command and transition Stopped → Starting →
    /// Running once the process is observed alive.
    pub async fn start(&self, id: &str) -> crate::Result<()> {
        let record = self.get(id)?;
        self.start_record(&record).await
    }

    async fn start_record(&self, record: &Arc<ManagedServer>) -> crate::Result<()> {
        if record.state() == ServerState::Running {
            return Err(GatewayError::InvalidState(
                record.config.id.clone(),
                "server is already running".into(),
            ));
        }
        record.set_state(ServerState::Starting);
        let id = record.config.id.clone();
        tracing::info!(server = %id, command = %record.config.command, "spawning MCP server");

        let mut child = match spawn_child(&record.config) {
            Ok(child) => child,
            Err(e) => {
                record.set_state(ServerState::Error);
                self.metrics.errors_total.inc(&[&id, "io_error"], 1.0);
                return Err(e);
            }
        };

        let (stdin, stdout, stderr) =
            match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
                (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
                _ => {
                    let _ = child.kill().await;
                    record.set_state(ServerState::Error);
                    return Err(GatewayError::Io(id, "failed to open stdio pipes".to_string()));
                }
            };

        let cancel = CancellationToken::new();
        let mux = Arc::new(Multiplexer::new(
            id.clone(),
            stdin,
            self.next_request_id.clone(),
        ));
        tokio::spawn(mux.clone().read_loop(stdout, cancel.child_token()));
        spawn_stderr_drain(
            stderr,
            id.clone(),
            record.config.stderr_markers.clone(),
            record.stderr.clone(),
            cancel.child_token(),
        );

        // The process must be observed alive before the record goes Running.
        if let Ok(Some(status)) = child.try_wait() {
            cancel.cancel();
            record.set_state(ServerState::Error);
            self.metrics.errors_total.inc(&[&id, "io_error"], 1.0);
            return Err(GatewayError::Io(
                id,
                format!("child exited immediately with {status}"),
            ));
        }

        let child = Arc::new(tokio::sync::Mutex::new(child));
        spawn_exit_watcher(record.clone(), mux.clone(), child.clone(), cancel.child_token());

        *record.runtime.lock().await = Some(ChildRuntime {
            child,
            mux,
            cancel,
        });
        *record.last_start.lock().expect("last_start lock poisoned") = Some(Instant::now());
        record.set_state(ServerState::Running);
        tracing::info!(server = %record.config.id, "server running");
        Ok(())
    }

    /// Stop a record. Graceful stop sends the protocol shutdown request,
    /// waits up to the grace window, then escalates to a kill; `force` kills
    /// immediately.
    pub async fn stop(&self, id: &str, force: bool) -> crate::Result<()> {
        let record = self.get(id)?;
        self.stop_record(&record, force).await
    }

    async fn stop_record(&self, record: &Arc<ManagedServer>, force: bool) -> crate::Result<()> {
        let Some(rt) = record.runtime.lock().await.take() else {
            return Err(GatewayError::InvalidState(
                record.config.id.clone(),
                "server is not running".into(),
            ));
        };
        let id = &record.config.id;
        tracing::info!(server = %id, force, "stopping server");

        if !force {
            // Protocol-level graceful termination, then wait out the grace
            // window before escalating.
            let _ = rt.mux.call("shutdown", None, SHUTDOWN_CALL_TIMEOUT).await;
            let _ = rt.mux.notify("exit", None).await;
            let grace = Duration::from_secs(record.config.grace_period_secs);
            let deadline = Instant::now() + grace;
            loop {
                if !matches!(rt.child.lock().await.try_wait(), Ok(None)) {
                    break;
                }
                if Instant::now() >= deadline {
                    tracing::warn!(server = %id, "grace window elapsed, killing");
                    break;
                }
                tokio::time::sleep(EXIT_POLL_INTERVAL).await;
            }
        }

        rt.cancel.cancel();
        {
            let mut child = rt.child.lock().await;
            if matches!(child.try_wait(), Ok(None)) {
                let _ = child.kill().await;
            }
        }
        rt.mux.fail_all_pending("server stopped");
        record.set_state(ServerState::Stopped);
        tracing::info!(server = %record.config.id, "server stopped");
        Ok(())
    }

    /// Stop-then-start, incrementing the restart counter labelled by reason.
    pub async fn restart(&self, id: &str, reason: &str) -> crate::Result<()> {
        let record = self.get(id)?;
        self.restart_record(&record, reason).await
    }

    async fn restart_record(&self, record: &Arc<ManagedServer>, reason: &str) -> crate::Result<()> {
        let id = record.config.id.clone();
        tracing::info!(server = %id, reason, "restarting server");
        record.set_state(ServerState::Restarting);
        let _ = self.stop_record(record, false).await;
        match self.start_record(record).await {
            Ok(()) => {
                record.restart_count.fetch_add(1, Ordering::SeqCst);
                *record
                    .last_restart_unix
                    .lock()
                    .expect("last_restart lock poisoned") = Some(unix_now());
                self.metrics
                    .server_restarts_total
                    .inc(&[&id, reason], 1.0);
                Ok(())
            }
            Err(e) => {
                record.set_state(ServerState::Error);
                self.metrics
                    .errors_total
                    .inc(&[&id, "restart_failed"], 1.0);
                Err(e)
            }
        }
    }

    /// Policy-gated restart used by the health monitor. Sleeps the policy
    /// backoff (`base × 2^attempt`, capped) before re-spawning. Returns
    /// whether a restart was attempted.
    pub async fn restart_with_policy(&self, id: &str, reason: &str) -> crate::Result<bool> {
        let record = self.get(id)?;
        if record.state() == ServerState::Restarting {
            return Ok(false);
        }
        let restart = &record.config.restart;
        let attempt = record.restart_count();
        if restart.policy == RestartPolicy::No {
            tracing::debug!(server = %id, "restart policy forbids automatic restart");
            return Ok(false);
        }
        if !may_auto_restart(restart.policy, attempt, restart.max_restarts) {
            tracing::warn!(
                server = %id,
                restart_count = attempt,
                "restart budget exhausted"
            );
            record.set_state(ServerState::Error);
            return Ok(false);
        }
        // Claim the record before sleeping so the monitor's next tick does
        // not schedule a second restart.
        record.set_state(ServerState::Restarting);
        let delay = restart_backoff(Duration::from_secs(restart.base_delay_secs), attempt);
        tracing::info!(server = %id, delay_secs = delay.as_secs(), "backing off before restart");
        tokio::time::sleep(delay).await;
        self.restart_record(&record, reason).await?;
        Ok(true)
    }

    /// Stop every record; used on gateway shutdown.
    pub async fn shutdown_all(&self) {
        for record in self.records() {
            if record.state() == ServerState::Running {
                let _ = self.stop_record(&record, false).await;
            }
        }
    }
}

/// Whether the policy permits an automatic restart at this attempt count.
fn may_auto_restart(policy: RestartPolicy, restart_count: u32, max_restarts: u32) -> bool {
    match policy {
        RestartPolicy::No => false,
        RestartPolicy::OnFailure | RestartPolicy::Always => restart_count < max_restarts,
    }
}

/// `base × 2^attempt`, capped.
fn restart_backoff(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(16));
    std::cmp::min(base.saturating_mul(factor), RESTART_BACKOFF_MAX)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Spawn the configured command with resolved env in the install directory,
/// all three stdio streams piped.
fn spawn_child(config: &ServerConfig) -> crate::Result<Child> {
    let mut cmd = Command::new(&config.command);
    if !config.args.is_empty() {
        cmd.args(&config.args);
    }
    if !config.env.is_empty() {
        cmd.envs(resolve_env_vars(&config.env));
    }
    if let Some(ref dir) = config.install_path {
        cmd.current_dir(dir);
    }
    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    cmd.spawn()
        .map_err(|e| GatewayError::Io(config.id.clone(), e.to_string()))
}

/// Drain stderr into the ring buffer, scanning for configured markers.
fn spawn_stderr_drain(
    stderr: tokio::process::ChildStderr,
    id: String,
    markers: Vec<String>,
    buffer: Arc<Mutex<StderrBuffer>>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            tracing::debug!(server = %id, line = %line, "server stderr");
                            buffer.lock().expect("stderr lock poisoned").push(line, &markers);
                        }
                        Ok(None) | Err(_) => break,
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    });
}

/// Watch for unexpected child exit: resolve pending calls with a transport
/// error and flip the record to Error. A stop()-initiated exit cancels this
/// watcher first, so clean stops land in Stopped instead.
fn spawn_exit_watcher(
    record: Arc<ManagedServer>,
    mux: Arc<Multiplexer>,
    child: Arc<tokio::sync::Mutex<Child>>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(EXIT_POLL_INTERVAL) => {
                    let exited = !matches!(child.lock().await.try_wait(), Ok(None));
                    if exited {
                        tracing::warn!(server = %record.config.id, "server process exited unexpectedly");
                        mux.fail_all_pending("child exited");
                        if matches!(record.state(), ServerState::Running | ServerState::Starting) {
                            record.set_state(ServerState::Error);
                        }
                        return;
                    }
                }
                _ = cancel.cancelled() => return,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RestartConfig;
    use crate::telemetry::TelemetryRegistry;
    use std::collections::HashMap as StdHashMap;

    fn test_metrics() -> GatewayMetrics {
        GatewayMetrics::new(&TelemetryRegistry::new())
    }

    fn cat_config(id: &str) -> ServerConfig {
        ServerConfig {
            id: id.to_string(),
            enabled: true,
            command: "cat".to_string(),
            args: vec![],
            env: StdHashMap::new(),
            install_path: None,
            port: None,
            probe_url: None,
            restart: RestartConfig::default(),
            stderr_markers: vec!["cuda out of memory".to_string()],
            grace_period_secs: 1,
            call_timeout_secs: 5,
            stream_timeout_secs: 30,
            stderr_capacity: 100,
        }
    }

    #[tokio::test]
    async fn test_start_and_stop_lifecycle() {
        let supervisor = Supervisor::new(test_metrics());
        supervisor.insert(cat_config("demo")).unwrap();

        supervisor.start("demo").await.unwrap();
        let record = supervisor.get("demo").unwrap();
        assert_eq!(record.state(), ServerState::Running);
        assert!(record.is_alive().await);

        supervisor.stop("demo", true).await.unwrap();
        assert_eq!(record.state(), ServerState::Stopped);
        assert!(!record.is_alive().await);
    }

    #[tokio::test]
    async fn test_start_running_server_is_invalid() {
        let supervisor = Supervisor::new(test_metrics());
        supervisor.insert(cat_config("demo")).unwrap();
        supervisor.start("demo").await.unwrap();

        let err = supervisor.start("demo").await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidState(_, _)));

        supervisor.stop("demo", true).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_stopped_server_is_invalid() {
        let supervisor = Supervisor::new(test_metrics());
        supervisor.insert(cat_config("demo")).unwrap();
        let err = supervisor.stop("demo", false).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidState(_, _)));
    }

    #[tokio::test]
    async fn test_spawn_failure_sets_error_state() {
        let supervisor = Supervisor::new(test_metrics());
        let mut config = cat_config("bad");
        config.command = "/this/command/does/not/exist-fmcp".to_string();
        supervisor.insert(config).unwrap();

        let err = supervisor.start("bad").await.unwrap_err();
        assert!(matches!(err, GatewayError::Io(_, _)));
        assert_eq!(supervisor.get("bad").unwrap().state(), ServerState::Error);
    }

    #[tokio::test]
    async fn test_restart_increments_counter() {
        let supervisor = Supervisor::new(test_metrics());
        supervisor.insert(cat_config("demo")).unwrap();
        supervisor.start("demo").await.unwrap();

        supervisor.restart("demo", "manual").await.unwrap();
        let record = supervisor.get("demo").unwrap();
        assert_eq!(record.restart_count(), 1);
        assert_eq!(record.state(), ServerState::Running);
        assert!(record.snapshot().last_restart_unix.is_some());

        supervisor.stop("demo", true).await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let supervisor = Supervisor::new(test_metrics());
        supervisor.insert(cat_config("demo")).unwrap();
        let err = supervisor.insert(cat_config("demo")).unwrap_err();
        assert!(matches!(err, GatewayError::DuplicateId(_)));
    }

    #[tokio::test]
    async fn test_unknown_id_not_found() {
        let supervisor = Supervisor::new(test_metrics());
        assert!(matches!(
            supervisor.status("ghost"),
            Err(GatewayError::NotFound(_))
        ));
        assert!(matches!(
            supervisor.stop("ghost", false).await,
            Err(GatewayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_stderr_capture_and_tail() {
        let supervisor = Supervisor::new(test_metrics());
        let mut config = cat_config("noisy");
        config.command = "sh".to_string();
        config.args = vec![
            "-c".to_string(),
            "echo first line >&2; echo second line >&2; cat".to_string(),
        ];
        supervisor.insert(config).unwrap();
        supervisor.start("noisy").await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        let record = supervisor.get("noisy").unwrap();
        let tail = record.tail_stderr(1);
        assert_eq!(tail, vec!["second line"]);
        assert_eq!(record.tail_stderr(10).len(), 2);

        supervisor.stop("noisy", true).await.unwrap();
    }

    #[tokio::test]
    async fn test_oom_marker_in_snapshot() {
        let supervisor = Supervisor::new(test_metrics());
        let mut config = cat_config("oom");
        config.command = "sh".to_string();
        config.args = vec![
            "-c".to_string(),
            "echo 'RuntimeError: CUDA out of memory' >&2; cat".to_string(),
        ];
        supervisor.insert(config).unwrap();
        supervisor.start("oom").await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(supervisor.status("oom").unwrap().has_oom_marker);

        supervisor.stop("oom", true).await.unwrap();
    }

    #[tokio::test]
    async fn test_unexpected_exit_flips_to_error() {
        let supervisor = Supervisor::new(test_metrics());
        supervisor.insert(cat_config("demo")).unwrap();
        supervisor.start("demo").await.unwrap();
        let record = supervisor.get("demo").unwrap();

        // Kill the child out from under the supervisor.
        {
            let runtime = record.runtime.lock().await;
            let rt = runtime.as_ref().unwrap();
            rt.child.lock().await.kill().await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(record.state(), ServerState::Error);
    }

    #[tokio::test]
    async fn test_restart_with_policy_no_is_refused() {
        let supervisor = Supervisor::new(test_metrics());
        let mut config = cat_config("fixed");
        config.restart.policy = RestartPolicy::No;
        supervisor.insert(config).unwrap();
        supervisor.start("fixed").await.unwrap();

        let attempted = supervisor
            .restart_with_policy("fixed", "health_check_failure")
            .await
            .unwrap();
        assert!(!attempted);
        assert_eq!(supervisor.get("fixed").unwrap().restart_count(), 0);
    }

    #[test]
    fn test_may_auto_restart_budget() {
        assert!(may_auto_restart(RestartPolicy::OnFailure, 0, 3));
        assert!(may_auto_restart(RestartPolicy::OnFailure, 2, 3));
        assert!(!may_auto_restart(RestartPolicy::OnFailure, 3, 3));
        assert!(!may_auto_restart(RestartPolicy::No, 0, 3));
        assert!(may_auto_restart(RestartPolicy::Always, 1, 3));
    }

    #[test]
    fn test_restart_backoff_sequence() {
        let base = Duration::from_secs(1);
        assert_eq!(restart_backoff(base, 0), Duration::from_secs(1));
        assert_eq!(restart_backoff(base, 1), Duration::from_secs(2));
        assert_eq!(restart_backoff(base, 2), Duration::from_secs(4));
        assert_eq!(restart_backoff(base, 10), RESTART_BACKOFF_MAX);
    }

    #[tokio::test]
    async fn test_snapshot_shape() {
        let supervisor = Supervisor::new(test_metrics());
        let mut config = cat_config("snap");
        config.port = Some(4010);
        supervisor.insert(config).unwrap();

        let snap = supervisor.status("snap").unwrap();
        assert_eq!(snap.id, "snap");
        assert_eq!(snap.state, "stopped");
        assert!(!snap.is_running);
        assert_eq!(snap.restart_count, 0);
        assert_eq!(snap.uptime_seconds, 0);
        assert_eq!(snap.port, Some(4010));
        assert!(!snap.has_oom_marker);
    }

    #[tokio::test]
    async fn test_remove_stops_and_deletes() {
        let supervisor = Supervisor::new(test_metrics());
        supervisor.insert(cat_config("gone")).unwrap();
        supervisor.start("gone").await.unwrap();

        supervisor.remove("gone").await.unwrap();
        assert!(matches!(
            supervisor.get("gone"),
            Err(GatewayError::NotFound(_))
        ));
    }
}
