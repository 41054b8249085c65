//! One managed service: the child process tree, its output capture pipeline,
//! and the crash-retry state machine.
//!
//! A `ServiceInstance` is single-use with respect to stopping: `stop()`
//! cancels a one-shot token that the retry loop selects on, and a stopped
//! instance can never be restarted. Re-enabling or restarting a service means
//! building a fresh instance with a fresh token; the supervisor owns that.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{Read as _, Seek as _, SeekFrom, Write as _};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc as tokio_mpsc;
use tokio_util::sync::CancellationToken;

use crate::sm::config::ServiceSpec;
use crate::sm::events::sm_event;
use crate::sm::platform;

pub const LOG_BUFFER_SIZE: usize = 10 * 1024;
pub const SUBSCRIBER_CAPACITY: usize = 100;
pub(crate) const RESTART_DELAY: Duration = Duration::from_secs(5);
const STOP_GRACE: Duration = Duration::from_secs(5);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Invoked on every child exit (success included, so the supervisor can clear
/// notification suppression): (name, consecutive_failures, exit_code, error).
pub type ExitCallback = Arc<dyn Fn(&str, u32, i32, Option<String>) + Send + Sync>;

/// Fixed-capacity byte FIFO. Holds the most recent `capacity` bytes written.
pub struct RingBuffer {
    data: Vec<u8>,
    capacity: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn write(&mut self, bytes: &[u8]) {
        if bytes.len() >= self.capacity {
            self.data.clear();
            self.data.extend_from_slice(&bytes[bytes.len() - self.capacity..]);
            return;
        }
        let overflow = (self.data.len() + bytes.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            self.data.drain(..overflow);
        }
        self.data.extend_from_slice(bytes);
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.clone()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

/// Fans lines out to per-subscriber bounded channels. A slow subscriber loses
/// lines rather than blocking the producer.
pub struct Broadcaster {
    inner: Mutex<BroadcasterInner>,
}

struct BroadcasterInner {
    next_id: u64,
    subscribers: HashMap<u64, tokio_mpsc::Sender<String>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BroadcasterInner {
                next_id: 0,
                subscribers: HashMap::new(),
            }),
        }
    }

    pub fn subscribe(&self) -> (SubscriberId, tokio_mpsc::Receiver<String>) {
        let (tx, rx) = tokio_mpsc::channel(SUBSCRIBER_CAPACITY);
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.insert(id, tx);
        (SubscriberId(id), rx)
    }

    /// Idempotent: unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriberId) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.subscribers.remove(&id.0);
    }

    pub fn broadcast(&self, line: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.subscribers.retain(|_, tx| {
            match tx.try_send(line.to_string()) {
                Ok(()) => true,
                // Full channel: drop the line for this subscriber only.
                Err(tokio_mpsc::error::TrySendError::Full(_)) => true,
                Err(tokio_mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// All sinks for one output stream: append-only log file, bounded in-memory
/// tail, and live subscribers.
pub struct StreamSink {
    file: Mutex<Option<fs::File>>,
    ring: Mutex<RingBuffer>,
    hub: Broadcaster,
    write_failed: AtomicBool,
}

impl StreamSink {
    fn new() -> Self {
        Self {
            file: Mutex::new(None),
            ring: Mutex::new(RingBuffer::new(LOG_BUFFER_SIZE)),
            hub: Broadcaster::new(),
            write_failed: AtomicBool::new(false),
        }
    }

    fn attach_file(&self, f: fs::File) {
        *self.file.lock().unwrap_or_else(|p| p.into_inner()) = Some(f);
        self.write_failed.store(false, Ordering::Relaxed);
    }

    fn close_file(&self) {
        let mut guard = self.file.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(f) = guard.take() {
            let _ = f.sync_data();
        }
    }

    fn publish_line(&self, line: &str) {
        let mut chunk = String::with_capacity(line.len() + 1);
        chunk.push_str(line);
        chunk.push('\n');
        self.publish_raw(&chunk);
    }

    fn publish_raw(&self, chunk: &str) {
        {
            let mut guard = self.file.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(f) = guard.as_mut() {
                if let Err(e) = f.write_all(chunk.as_bytes()) {
                    if !self.write_failed.swap(true, Ordering::Relaxed) {
                        sm_event("log", None, format!("log file write failed err={e}"));
                    }
                }
            }
        }
        self.ring
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .write(chunk.as_bytes());
        self.hub.broadcast(chunk);
    }

    fn read(&self) -> Vec<u8> {
        self.ring.lock().unwrap_or_else(|p| p.into_inner()).contents()
    }

    fn preload(&self, bytes: &[u8]) {
        self.ring
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .write(bytes);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct ExitRecord {
    pub started_at: DateTime<Utc>,
    pub exit_code: i32,
    pub duration: Duration,
}

struct RuntimeState {
    phase: Phase,
    pid: Option<u32>,
    started_at: Option<DateTime<Utc>>,
    started_mono: Option<Instant>,
    restarts: u64,
    consecutive_failures: u32,
    last_exit: Option<ExitRecord>,
}

/// Serializable status snapshot, consumed by the HTTP surface.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub name: String,
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub uptime_ms: u64,
    pub restarts: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_time: Option<DateTime<Utc>>,
    pub last_exit_code: i32,
    pub last_duration_ms: u64,
    pub consecutive_failures: u32,
}

pub struct ServiceInstance {
    self_ref: Weak<ServiceInstance>,
    name: String,
    spec: RwLock<ServiceSpec>,
    state: Mutex<RuntimeState>,
    stdout: Arc<StreamSink>,
    stderr: Arc<StreamSink>,
    stop: CancellationToken,
    lifecycle: tokio::sync::Mutex<()>,
    exit_cb: RwLock<Option<ExitCallback>>,
    /// Handle onto the live child's process tree (process group / job
    /// object); replaced on every spawn, released once the tree is dead.
    tree: Mutex<Option<platform::TreeHandle>>,
    logs_dir: PathBuf,
    restart_delay: Duration,
}

impl ServiceInstance {
    pub fn new(spec: ServiceSpec) -> Arc<Self> {
        Self::with_logs_dir(spec, PathBuf::from("logs"))
    }

    pub fn with_logs_dir(spec: ServiceSpec, logs_dir: PathBuf) -> Arc<Self> {
        Self::with_settings(spec, logs_dir, RESTART_DELAY)
    }

    pub(crate) fn with_settings(
        spec: ServiceSpec,
        logs_dir: PathBuf,
        restart_delay: Duration,
    ) -> Arc<Self> {
        let instance = Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            name: spec.name.clone(),
            spec: RwLock::new(spec),
            state: Mutex::new(RuntimeState {
                phase: Phase::Idle,
                pid: None,
                started_at: None,
                started_mono: None,
                restarts: 0,
                consecutive_failures: 0,
                last_exit: None,
            }),
            stdout: Arc::new(StreamSink::new()),
            stderr: Arc::new(StreamSink::new()),
            stop: CancellationToken::new(),
            lifecycle: tokio::sync::Mutex::new(()),
            exit_cb: RwLock::new(None),
            tree: Mutex::new(None),
            logs_dir,
            restart_delay,
        });
        instance.preload_existing_logs();
        instance
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> ServiceSpec {
        self.spec.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Swap the spec reference (env, command, ...) used on the next start.
    /// Material changes go through eviction instead; this only services the
    /// non-material refresh path.
    pub fn update_spec(&self, spec: ServiceSpec) {
        *self.spec.write().unwrap_or_else(|p| p.into_inner()) = spec;
    }

    pub fn set_exit_callback(&self, cb: ExitCallback) {
        *self.exit_cb.write().unwrap_or_else(|p| p.into_inner()) = Some(cb);
    }

    pub fn is_running(&self) -> bool {
        let st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        matches!(st.phase, Phase::Starting | Phase::Running | Phase::Stopping)
    }

    /// True once `stop()` has been requested; such an instance can never run
    /// again and must be replaced.
    pub fn stop_requested(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn status(&self) -> ServiceStatus {
        let st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let running = matches!(st.phase, Phase::Starting | Phase::Running | Phase::Stopping);
        ServiceStatus {
            name: self.name.clone(),
            running,
            pid: st.pid,
            uptime_ms: st
                .started_mono
                .map(|t| t.elapsed().as_millis() as u64)
                .unwrap_or(0),
            restarts: st.restarts,
            started_at: st.started_at,
            last_run_time: st.last_exit.as_ref().map(|e| e.started_at),
            last_exit_code: st.last_exit.as_ref().map(|e| e.exit_code).unwrap_or(0),
            last_duration_ms: st
                .last_exit
                .as_ref()
                .map(|e| e.duration.as_millis() as u64)
                .unwrap_or(0),
            consecutive_failures: st.consecutive_failures,
        }
    }

    pub fn subscribe_stdout(&self) -> (SubscriberId, tokio_mpsc::Receiver<String>) {
        self.stdout.hub.subscribe()
    }

    pub fn subscribe_stderr(&self) -> (SubscriberId, tokio_mpsc::Receiver<String>) {
        self.stderr.hub.subscribe()
    }

    pub fn unsubscribe_stdout(&self, id: SubscriberId) {
        self.stdout.hub.unsubscribe(id);
    }

    pub fn unsubscribe_stderr(&self, id: SubscriberId) {
        self.stderr.hub.unsubscribe(id);
    }

    pub fn read_stdout(&self) -> Vec<u8> {
        self.stdout.read()
    }

    pub fn read_stderr(&self) -> Vec<u8> {
        self.stderr.read()
    }

    /// Append a timestamped notice to the stderr sinks (file, tail buffer,
    /// subscribers). Used by the scheduler for overlap skips.
    pub fn write_stderr_event(&self, msg: &str) {
        let line = format!("[{}] {msg}\n", Local::now().format("%Y-%m-%d %H:%M:%S"));
        self.stderr.publish_raw(&line);
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        let _guard = self.lifecycle.lock().await;
        self.start_locked().await
    }

    /// Idempotent: signals the one-shot stop token first, then tears down any
    /// live process tree. Safe on a never-started instance, safe to repeat.
    pub async fn stop(&self) -> anyhow::Result<()> {
        let _guard = self.lifecycle.lock().await;
        self.stop.cancel();

        let pid = {
            let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
            match (st.phase, st.pid) {
                (Phase::Starting | Phase::Running, Some(pid)) => {
                    st.phase = Phase::Stopping;
                    pid
                }
                _ => return Ok(()),
            }
        };

        self.log_lifecycle_event(&format!("stopping service '{}' (pid {pid})", self.name));
        let term_result = {
            let mut tree = self.tree.lock().unwrap_or_else(|p| p.into_inner());
            tree.as_mut().map(|t| t.terminate()).unwrap_or(Ok(()))
        };
        if let Err(e) = term_result {
            sm_event(
                "stop",
                Some(&self.name),
                format!("term_signal_failed err={e}; escalating to kill"),
            );
        }

        if self.wait_for_exit(STOP_GRACE).await {
            self.release_tree();
            sm_event("stop", Some(&self.name), "outcome=stopped_gracefully");
            return Ok(());
        }

        let kill_result = {
            let mut tree = self.tree.lock().unwrap_or_else(|p| p.into_inner());
            tree.as_mut().map(|t| t.kill()).unwrap_or(Ok(()))
        };
        kill_result?;
        self.wait_for_exit(Duration::from_secs(2)).await;
        self.release_tree();
        sm_event("stop", Some(&self.name), "outcome=force_killed");
        Ok(())
    }

    /// Drop the tree handle once the tree is confirmed (or forced) dead.
    fn release_tree(&self) {
        let _ = self.tree.lock().unwrap_or_else(|p| p.into_inner()).take();
    }

    async fn wait_for_exit(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let exited = {
                let st = self.state.lock().unwrap_or_else(|p| p.into_inner());
                st.phase == Phase::Stopped
            };
            let tree_alive = {
                let tree = self.tree.lock().unwrap_or_else(|p| p.into_inner());
                tree.as_ref().map(|t| t.alive()).unwrap_or(false)
            };
            if exited && !tree_alive {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
    }

    async fn start_locked(&self) -> anyhow::Result<()> {
        if self.stop.is_cancelled() {
            anyhow::bail!(
                "service {} has been stopped; a fresh instance is required to run it again",
                self.name
            );
        }
        {
            let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
            if matches!(st.phase, Phase::Starting | Phase::Running | Phase::Stopping) {
                anyhow::bail!("service {} is already running", self.name);
            }
            st.phase = Phase::Starting;
        }

        match self.spawn_child().await {
            Ok(()) => Ok(()),
            Err(e) => {
                let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
                st.phase = Phase::Stopped;
                st.pid = None;
                Err(e)
            }
        }
    }

    async fn spawn_child(&self) -> anyhow::Result<()> {
        let Some(me) = self.self_ref.upgrade() else {
            anyhow::bail!("service {} is being torn down", self.name);
        };
        let spec = self.spec();

        let parts = shell_words::split(&spec.command)
            .map_err(|e| anyhow::anyhow!("service {}: failed to parse command: {e}", self.name))?;
        if parts.is_empty() {
            anyhow::bail!("service {}: empty command", self.name);
        }

        let env = resolve_env(&spec)?;

        fs::create_dir_all(&self.logs_dir).map_err(|e| {
            anyhow::anyhow!(
                "failed to create logs directory {}: {e}",
                self.logs_dir.display()
            )
        })?;
        let stdout_file = open_append(&self.log_path("stdout"))?;
        let stderr_file = open_append(&self.log_path("stderr"))?;

        let mut cmd = tokio::process::Command::new(&parts[0]);
        cmd.args(&parts[1..])
            .env_clear()
            .envs(&env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = spec.workdir.as_deref() {
            cmd.current_dir(dir);
        }
        platform::prepare_command(&mut cmd);

        let mut child = cmd
            .spawn()
            .map_err(|e| anyhow::anyhow!("failed to start service {}: {e}", self.name))?;
        let pid = child
            .id()
            .ok_or_else(|| anyhow::anyhow!("service {}: spawned child has no pid", self.name))?;
        let stdout_pipe = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("service {}: missing stdout pipe", self.name))?;
        let stderr_pipe = child
            .stderr
            .take()
            .ok_or_else(|| anyhow::anyhow!("service {}: missing stderr pipe", self.name))?;

        // Replacing the previous run's handle also sweeps up any of its
        // stragglers on platforms where releasing the handle kills the tree.
        {
            let mut tree = self.tree.lock().unwrap_or_else(|p| p.into_inner());
            *tree = Some(platform::attach_tree(pid, &child));
        }

        {
            let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
            st.phase = Phase::Running;
            st.pid = Some(pid);
            st.started_at = Some(Utc::now());
            st.started_mono = Some(Instant::now());
        }
        self.stdout.attach_file(stdout_file);
        self.stderr.attach_file(stderr_file);

        let kind = if spec.is_scheduled() { "scheduled" } else { "continuous" };
        self.log_lifecycle_event(&format!(
            "starting {kind} service '{}' (pid {pid})",
            self.name
        ));

        let out_sink = Arc::clone(&self.stdout);
        tokio::spawn(async move { pump_stream(out_sink, stdout_pipe).await });
        let err_sink = Arc::clone(&self.stderr);
        tokio::spawn(async move { pump_stream(err_sink, stderr_pipe).await });

        tokio::spawn(Self::monitor(me, child));

        Ok(())
    }

    fn monitor(
        self: Arc<Self>,
        mut child: tokio::process::Child,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(async move {
        let run_started = Utc::now();
        let t0 = Instant::now();
        let wait_result = child.wait().await;
        let duration = t0.elapsed();

        let (exit_code, err_msg) = match wait_result {
            Ok(status) => (status.code().unwrap_or(-1), None),
            Err(e) => (-1, Some(format!("wait failed: {e}"))),
        };

        let consecutive = {
            let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
            st.phase = Phase::Stopped;
            st.pid = None;
            st.started_mono = None;
            st.last_exit = Some(ExitRecord {
                started_at: run_started,
                exit_code,
                duration,
            });
            if exit_code == 0 {
                st.consecutive_failures = 0;
            } else {
                st.consecutive_failures += 1;
            }
            st.consecutive_failures
        };

        let scheduled = {
            let spec = self.spec.read().unwrap_or_else(|p| p.into_inner());
            spec.is_scheduled()
        };
        let kind = if scheduled { "scheduled" } else { "continuous" };
        self.log_lifecycle_event(&format!(
            "service '{}' ({kind}) exited with code {exit_code} (duration {} ms)",
            self.name,
            duration.as_millis()
        ));

        // The callback fires on every exit and outside our own lock.
        let cb = {
            let guard = self.exit_cb.read().unwrap_or_else(|p| p.into_inner());
            guard.clone()
        };
        if let Some(cb) = cb {
            cb(&self.name, consecutive, exit_code, err_msg);
        }

        self.stdout.close_file();
        self.stderr.close_file();

        // Scheduled runs end here; the cron scheduler owns the next firing.
        if scheduled {
            return;
        }
        if exit_code == 0 {
            sm_event(
                "service",
                Some(&self.name),
                "exited successfully; not restarting",
            );
            return;
        }

        self.retry_loop(exit_code).await;
        })
    }

    /// Crash-retry loop for continuous services. The wait is
    /// "restart_delay or stop token, whichever first" so an eviction during
    /// the backoff window aborts the pending restart.
    async fn retry_loop(&self, first_exit_code: i32) {
        let mut exit_code = first_exit_code;
        loop {
            if self.stop.is_cancelled() {
                return;
            }
            {
                let spec = self.spec.read().unwrap_or_else(|p| p.into_inner());
                if !spec.is_enabled() {
                    sm_event("service", Some(&self.name), "disabled; not restarting");
                    return;
                }
            }

            sm_event(
                "service",
                Some(&self.name),
                format!(
                    "exited with code {exit_code}; restarting in {} ms",
                    self.restart_delay.as_millis()
                ),
            );

            tokio::select! {
                _ = tokio::time::sleep(self.restart_delay) => {}
                _ = self.stop.cancelled() => return,
            }
            if self.stop.is_cancelled() {
                return;
            }
            {
                let spec = self.spec.read().unwrap_or_else(|p| p.into_inner());
                if !spec.is_enabled() {
                    sm_event("service", Some(&self.name), "disabled; not restarting");
                    return;
                }
            }

            {
                let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
                st.restarts += 1;
            }

            match self.start().await {
                // A new monitor task owns the child now.
                Ok(()) => return,
                Err(e) => {
                    sm_event(
                        "service",
                        Some(&self.name),
                        format!("restart failed err={e}"),
                    );
                    exit_code = -1;
                }
            }
        }
    }

    fn log_path(&self, stream: &str) -> PathBuf {
        self.logs_dir.join(format!("{}-{stream}.log", self.name))
    }

    /// Write a supervisor-originated line to both streams, mirroring what the
    /// child would see in its logs.
    fn log_lifecycle_event(&self, msg: &str) {
        let line = format!(
            "[servicemaster][{}] {msg}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S")
        );
        self.stdout.publish_raw(&line);
        self.stderr.publish_raw(&line);
    }

    /// Seed the in-memory tails from any logs a previous incarnation left on
    /// disk, so subscribers get history immediately after a recreate.
    fn preload_existing_logs(&self) {
        for (stream, sink) in [("stdout", &self.stdout), ("stderr", &self.stderr)] {
            if let Some(tail) = read_tail(&self.log_path(stream), LOG_BUFFER_SIZE) {
                sink.preload(&tail);
            }
        }
    }
}

async fn pump_stream<R>(sink: Arc<StreamSink>, pipe: R)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(pipe).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        sink.publish_line(&line);
    }
}

fn open_append(path: &Path) -> anyhow::Result<fs::File> {
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| anyhow::anyhow!("failed to open log file {}: {e}", path.display()))
}

fn read_tail(path: &Path, max: usize) -> Option<Vec<u8>> {
    let mut f = fs::File::open(path).ok()?;
    let len = f.metadata().ok()?.len();
    if len == 0 {
        return None;
    }
    let offset = len.saturating_sub(max as u64);
    f.seek(SeekFrom::Start(offset)).ok()?;
    let mut buf = Vec::with_capacity(len.min(max as u64) as usize);
    f.read_to_end(&mut buf).ok()?;
    if buf.is_empty() { None } else { Some(buf) }
}

/// Child environment: parent env, overlaid with `<workdir>/.env`, overlaid
/// with the spec's env map. Later layers win.
fn resolve_env(spec: &ServiceSpec) -> anyhow::Result<BTreeMap<String, String>> {
    let mut env: BTreeMap<String, String> = std::env::vars().collect();

    if let Some(dir) = spec.workdir.as_deref() {
        let dotenv = Path::new(dir).join(".env");
        if dotenv.is_file() {
            let iter = dotenvy::from_path_iter(&dotenv).map_err(|e| {
                anyhow::anyhow!("failed to read .env at {}: {e}", dotenv.display())
            })?;
            for item in iter {
                let (k, v) = item.map_err(|e| {
                    anyhow::anyhow!("failed to parse .env at {}: {e}", dotenv.display())
                })?;
                env.insert(k, v);
            }
        }
    }

    for (k, v) in &spec.env {
        env.insert(k.clone(), v.clone());
    }
    Ok(env)
}
