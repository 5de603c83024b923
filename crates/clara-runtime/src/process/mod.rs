//! Lifecycle of a single model subprocess.
//!
//! A [`Process`] owns one configured model: it spawns the subprocess on
//! demand, gates requests on readiness, enforces the concurrency limit,
//! evicts itself when idle and tears the subprocess down on request.
//!
//! State transitions (`Stopped → Starting → Ready → Stopping → Stopped`,
//! with `Failed` as a re-startable stopped substate and `Shutdown` as the
//! terminal state) are published on a watch channel. Exactly one task
//! drives a transition at a time, serialized by the transition mutex;
//! everyone else observes through the channel. All long-running work
//! (start driver, exit monitor, TTL watcher) happens in spawned tasks, so
//! a caller that gives up waiting never leaves the process half-moved.

pub mod health;
pub mod ports;
pub mod shutdown;
pub(crate) mod stream;

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::Serialize;
use tokio::process::Child;
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore, TryAcquireError, watch};
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, warn};

use clara_core::{ModelConfig, ProxyError};

use crate::command::{spawn_log_readers, spawn_model_command, substitute_port};
use crate::logmux::{LogLevel, LogMux, PROXY_SOURCE};
use crate::settings::RuntimeSettings;

/// Observable lifecycle state of a model subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Stopped,
    Starting,
    Ready,
    Stopping,
    /// Stopped after a failed start or an unexpected exit; the error is
    /// kept until the next start attempt.
    Failed,
    /// Terminal; all further operations fail.
    Shutdown,
}

impl ProcessState {
    /// True for states that occupy resources (Starting or Ready).
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Ready)
    }

    /// True when a start attempt may begin from this state.
    #[must_use]
    pub const fn can_start(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Stopping => "stopping",
            Self::Failed => "failed",
            Self::Shutdown => "shutdown",
        };
        f.write_str(label)
    }
}

/// How a stop is carried out. A small closed set, not an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Drain in-flight requests (bounded by the stop timeout), SIGTERM,
    /// escalate to SIGKILL.
    Graceful,
    /// Hard-kill at once, no drain.
    Immediate,
    /// Hard-kill and move to the terminal state.
    Shutdown,
}

/// What to do when the concurrency limit is saturated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionMode {
    /// Wait FIFO for a slot.
    Queue,
    /// Fail immediately with `TooManyRequests`.
    Reject,
}

/// An admitted request: the upstream base URL plus the RAII slot.
///
/// The guard must live as long as the forwarded response body; dropping
/// it releases the concurrency slot and refreshes the idle clock.
pub struct Ticket {
    upstream: String,
    model: String,
    guard: RequestGuard,
}

impl fmt::Debug for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ticket")
            .field("upstream", &self.upstream)
            .field("model", &self.model)
            .finish()
    }
}

impl Ticket {
    /// Upstream base URL, e.g. `http://127.0.0.1:8101`.
    #[must_use]
    pub fn upstream(&self) -> &str {
        &self.upstream
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    #[must_use]
    pub fn into_parts(self) -> (String, RequestGuard) {
        (self.upstream, self.guard)
    }
}

/// RAII in-flight slot. Decrements the counter, touches the idle clock
/// and wakes drain waiters on drop.
pub struct RequestGuard {
    inner: Arc<Inner>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.inner.touch();
        self.inner.drained.notify_waiters();
    }
}

/// Lifecycle manager for one model subprocess. Cheap to clone; clones
/// share the same underlying process.
#[derive(Clone)]
pub struct Process {
    inner: Arc<Inner>,
}

struct Inner {
    id: String,
    config: ModelConfig,
    assigned_port: u16,
    settings: RuntimeSettings,
    state_tx: watch::Sender<ProcessState>,
    /// Serializes state transitions (one driver at a time). Held across
    /// the drain and kill phases of a stop.
    transition: Mutex<()>,
    child: StdMutex<ChildState>,
    in_flight: AtomicUsize,
    drained: Notify,
    slots: Option<Arc<Semaphore>>,
    last_activity: StdMutex<Instant>,
    /// Manager-wide wakeup, pinged on every transition.
    lifecycle: Arc<Notify>,
    logs: Arc<LogMux>,
}

struct ChildState {
    child: Option<Child>,
    pid: Option<u32>,
    port: u16,
    upstream: Option<String>,
    last_error: Option<String>,
    /// Bumped on every spawn; background tasks from older starts bail
    /// out when it no longer matches.
    generation: u64,
}

impl Process {
    #[must_use]
    pub fn new(
        id: String,
        config: ModelConfig,
        assigned_port: u16,
        settings: RuntimeSettings,
        logs: Arc<LogMux>,
        lifecycle: Arc<Notify>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ProcessState::Stopped);
        let slots = match config.concurrency_limit {
            0 => None,
            n => Some(Arc::new(Semaphore::new(n))),
        };
        Self {
            inner: Arc::new(Inner {
                id,
                config,
                assigned_port,
                settings,
                state_tx,
                transition: Mutex::new(()),
                child: StdMutex::new(ChildState {
                    child: None,
                    pid: None,
                    port: 0,
                    upstream: None,
                    last_error: None,
                    generation: 0,
                }),
                in_flight: AtomicUsize::new(0),
                drained: Notify::new(),
                slots,
                last_activity: StdMutex::new(Instant::now()),
                lifecycle,
                logs,
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    #[must_use]
    pub fn config(&self) -> &ModelConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn assigned_port(&self) -> u16 {
        self.inner.assigned_port
    }

    #[must_use]
    pub fn state(&self) -> ProcessState {
        self.inner.state()
    }

    /// Port actually bound by the current subprocess, if one is running.
    #[must_use]
    pub fn current_port(&self) -> Option<u16> {
        let child = self.inner.child.lock().unwrap();
        (child.port != 0).then_some(child.port)
    }

    /// Error recorded by the most recent failed start or unexpected exit.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.inner.child.lock().unwrap().last_error.clone()
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// True when both handles refer to the same underlying process.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Ensure the subprocess is Ready and reserve an in-flight slot.
    ///
    /// Starts the subprocess if it is stopped. At most one start attempt
    /// is made per call; if that attempt fails the error surfaces as
    /// `Unavailable` and the caller (the client) decides about retries.
    ///
    /// # Errors
    ///
    /// `Unavailable` when the subprocess cannot be made Ready in time,
    /// `TooManyRequests` under `AdmissionMode::Reject` at the limit,
    /// `Gone` after shutdown.
    pub async fn acquire(&self, mode: AdmissionMode) -> Result<Ticket, ProxyError> {
        let inner = &self.inner;
        inner.touch();
        let deadline =
            Instant::now() + inner.settings.health_check_timeout + inner.settings.stop_timeout;
        let mut rx = inner.state_tx.subscribe();
        let mut triggered = false;

        loop {
            let state = *rx.borrow_and_update();
            match state {
                ProcessState::Shutdown => return Err(ProxyError::Gone(inner.id.clone())),
                ProcessState::Ready => {
                    if let Some(ticket) = try_admit(inner, mode).await? {
                        return Ok(ticket);
                    }
                    // Lost Ready between observation and admission; the
                    // watch already carries the newer state.
                }
                ProcessState::Starting => {
                    triggered = true;
                    inner.wait_for_change(&mut rx, deadline).await?;
                }
                ProcessState::Stopping => {
                    inner.wait_for_change(&mut rx, deadline).await?;
                }
                ProcessState::Stopped | ProcessState::Failed => {
                    if triggered {
                        return Err(inner.unavailable());
                    }
                    triggered = true;
                    spawn_start_driver(inner);
                    inner.wait_for_change(&mut rx, deadline).await?;
                }
            }
        }
    }

    /// Start the subprocess and wait until it is Ready.
    ///
    /// Idempotent: returns immediately when already Ready.
    ///
    /// # Errors
    ///
    /// `Unavailable` when the start attempt fails or times out, `Gone`
    /// after shutdown.
    pub async fn start(&self) -> Result<(), ProxyError> {
        let inner = &self.inner;
        let deadline =
            Instant::now() + inner.settings.health_check_timeout + inner.settings.stop_timeout;
        let mut rx = inner.state_tx.subscribe();
        let mut triggered = false;

        loop {
            let state = *rx.borrow_and_update();
            match state {
                ProcessState::Ready => return Ok(()),
                ProcessState::Shutdown => return Err(ProxyError::Gone(inner.id.clone())),
                ProcessState::Starting => {
                    triggered = true;
                    inner.wait_for_change(&mut rx, deadline).await?;
                }
                ProcessState::Stopping => {
                    inner.wait_for_change(&mut rx, deadline).await?;
                }
                ProcessState::Stopped | ProcessState::Failed => {
                    if triggered {
                        return Err(inner.unavailable());
                    }
                    triggered = true;
                    spawn_start_driver(inner);
                    inner.wait_for_change(&mut rx, deadline).await?;
                }
            }
        }
    }

    /// Stop the subprocess. No-op when nothing is running, except that
    /// `StopMode::Shutdown` always latches the terminal state.
    pub async fn stop(&self, mode: StopMode) {
        self.inner.stop(mode).await;
    }

    /// Hard-kill and latch the terminal state.
    pub async fn shutdown(&self) {
        self.inner.stop(StopMode::Shutdown).await;
    }

    /// Wait until the state satisfies `predicate`, bounded by `wait`.
    ///
    /// Returns the first matching state, or `None` on timeout.
    pub async fn wait_for_state(
        &self,
        predicate: impl Fn(ProcessState) -> bool,
        wait: Duration,
    ) -> Option<ProcessState> {
        let mut rx = self.inner.state_tx.subscribe();
        timeout(wait, async {
            loop {
                let state = *rx.borrow_and_update();
                if predicate(state) {
                    return state;
                }
                if rx.changed().await.is_err() {
                    return state;
                }
            }
        })
        .await
        .ok()
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("assigned_port", &self.inner.assigned_port)
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn state(&self) -> ProcessState {
        *self.state_tx.borrow()
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    fn set_state(&self, state: ProcessState) {
        self.state_tx.send_replace(state);
        self.lifecycle.notify_waiters();
    }

    fn unavailable(&self) -> ProxyError {
        ProxyError::Unavailable {
            model: self.id.clone(),
            reason: self
                .child
                .lock()
                .unwrap()
                .last_error
                .clone()
                .unwrap_or_else(|| "failed to start".to_string()),
        }
    }

    async fn wait_for_change(
        &self,
        rx: &mut watch::Receiver<ProcessState>,
        deadline: Instant,
    ) -> Result<(), ProxyError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(self.unavailable());
        }
        match timeout(remaining, rx.changed()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ProxyError::Gone(self.id.clone())),
            Err(_) => Err(self.unavailable()),
        }
    }

    async fn stop(&self, mode: StopMode) {
        let _transition = self.transition.lock().await;
        let state = self.state();
        if state == ProcessState::Shutdown {
            return;
        }
        if !state.is_active() {
            if mode == StopMode::Shutdown {
                self.set_state(ProcessState::Shutdown);
            }
            return;
        }

        self.set_state(ProcessState::Stopping);
        self.logs
            .append(PROXY_SOURCE, LogLevel::Info, format!("stopping {}", self.id));
        info!(model = %self.id, ?mode, "stopping subprocess");

        if mode == StopMode::Graceful {
            self.wait_for_drain().await;
        }

        let child = {
            let mut child = self.child.lock().unwrap();
            child.pid = None;
            child.port = 0;
            child.upstream = None;
            child.child.take()
        };
        if let Some(child) = child {
            let result = match mode {
                StopMode::Graceful => {
                    shutdown::shutdown_child(child, self.settings.stop_timeout).await
                }
                StopMode::Immediate | StopMode::Shutdown => shutdown::kill_now(child).await,
            };
            if let Err(e) = result {
                warn!(model = %self.id, error = %e, "error while stopping subprocess");
            }
        }

        self.set_state(match mode {
            StopMode::Shutdown => ProcessState::Shutdown,
            _ => ProcessState::Stopped,
        });
        debug!(model = %self.id, "subprocess stopped");
    }

    async fn wait_for_drain(&self) {
        let deadline = Instant::now() + self.settings.stop_timeout;
        loop {
            let notified = self.drained.notified();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(model = %self.id, in_flight = self.in_flight.load(Ordering::SeqCst),
                    "stop timeout elapsed with requests in flight");
                return;
            }
            let _ = timeout(remaining, notified).await;
        }
    }

    /// Wait for the subprocess to come up, aborting early when it exits.
    async fn await_readiness(&self, upstream: &str) -> Result<(), String> {
        if self.config.probe_disabled() {
            if self.config.start_delay > 0 {
                sleep(Duration::from_secs(self.config.start_delay)).await;
            }
            return Ok(());
        }

        let probe_url = format!("{upstream}{}", self.config.check_endpoint);
        let mut rx = self.state_tx.subscribe();
        let left_starting = async {
            loop {
                if *rx.borrow_and_update() != ProcessState::Starting {
                    break;
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        };

        tokio::select! {
            res = health::wait_until_healthy(&probe_url, self.settings.health_check_timeout) => {
                res.map_err(|e| e.to_string())
            }
            () = left_starting => Err("subprocess exited during startup".to_string()),
        }
    }

    /// Record a failure that happened before the subprocess existed.
    fn record_start_failure(&self, reason: String) {
        warn!(model = %self.id, %reason, "start failed");
        self.logs.append(
            PROXY_SOURCE,
            LogLevel::Error,
            format!("{} failed to start: {reason}", self.id),
        );
        self.child.lock().unwrap().last_error = Some(reason);
        self.set_state(ProcessState::Failed);
    }

    async fn handle_unexpected_exit(&self, generation: u64, status: std::process::ExitStatus) {
        let _transition = self.transition.lock().await;
        if self.child.lock().unwrap().generation != generation {
            return;
        }
        let state = self.state();
        if !state.is_active() {
            return;
        }

        let reason = format!("subprocess exited unexpectedly ({status})");
        warn!(model = %self.id, %status, "subprocess exited unexpectedly");
        self.logs
            .append(PROXY_SOURCE, LogLevel::Warn, format!("{}: {reason}", self.id));
        {
            let mut child = self.child.lock().unwrap();
            child.port = 0;
            child.upstream = None;
            child.last_error = Some(reason);
        }
        // A crash while Ready is an ordinary stop; a crash while Starting
        // is a failed start.
        self.set_state(if state == ProcessState::Ready {
            ProcessState::Stopped
        } else {
            ProcessState::Failed
        });
    }
}

/// Reserve a slot while the process is Ready.
///
/// Returns `Ok(None)` when the process left Ready between observation and
/// admission; the caller re-reads the state.
async fn try_admit(inner: &Arc<Inner>, mode: AdmissionMode) -> Result<Option<Ticket>, ProxyError> {
    let permit = match (&inner.slots, mode) {
        (Some(slots), AdmissionMode::Queue) => match Arc::clone(slots).acquire_owned().await {
            Ok(permit) => Some(permit),
            Err(_) => return Err(ProxyError::Gone(inner.id.clone())),
        },
        (Some(slots), AdmissionMode::Reject) => match Arc::clone(slots).try_acquire_owned() {
            Ok(permit) => Some(permit),
            Err(TryAcquireError::NoPermits) => {
                return Err(ProxyError::TooManyRequests(inner.id.clone()));
            }
            Err(TryAcquireError::Closed) => {
                return Err(ProxyError::Gone(inner.id.clone()));
            }
        },
        (None, _) => None,
    };

    // The slot only counts while the state is still Ready; the transition
    // lock makes the check-and-increment atomic against concurrent stops.
    let _transition = inner.transition.lock().await;
    if inner.state() != ProcessState::Ready {
        return Ok(None);
    }
    let upstream = {
        let child = inner.child.lock().unwrap();
        let Some(upstream) = child.upstream.clone() else {
            return Ok(None);
        };
        upstream
    };
    inner.in_flight.fetch_add(1, Ordering::SeqCst);
    inner.touch();
    Ok(Some(Ticket {
        upstream,
        model: inner.id.clone(),
        guard: RequestGuard {
            inner: Arc::clone(inner),
            _permit: permit,
        },
    }))
}

fn spawn_start_driver(inner: &Arc<Inner>) {
    let inner = Arc::clone(inner);
    tokio::spawn(run_start(inner));
}

async fn run_start(inner: Arc<Inner>) {
    // Phase 1: spawn, under the transition lock.
    let (generation, port, upstream) = {
        let _transition = inner.transition.lock().await;
        if !inner.state().can_start() {
            return;
        }

        let port = match ports::find_available(inner.assigned_port, ports::PORT_SEARCH_WINDOW) {
            Ok(port) => port,
            Err(e) => {
                inner.record_start_failure(format!("no free port: {e}"));
                return;
            }
        };
        let cmd_line = substitute_port(&inner.config.cmd_template, port);
        let upstream = substitute_port(&inner.config.proxy_url, port);

        let mut child = match spawn_model_command(&cmd_line, &inner.config.env) {
            Ok(child) => child,
            Err(e) => {
                inner.record_start_failure(e.to_string());
                return;
            }
        };
        let pid = child.id();
        spawn_log_readers(&mut child, &inner.id, &inner.logs);

        let generation = {
            let mut state = inner.child.lock().unwrap();
            state.generation += 1;
            state.child = Some(child);
            state.pid = pid;
            state.port = port;
            state.upstream = Some(upstream.clone());
            state.last_error = None;
            state.generation
        };

        inner.set_state(ProcessState::Starting);
        inner.logs.append(
            PROXY_SOURCE,
            LogLevel::Info,
            format!("starting {} on port {port}", inner.id),
        );
        info!(model = %inner.id, port, pid = ?pid, "subprocess spawned");

        spawn_exit_monitor(&inner, generation);
        (generation, port, upstream)
    };

    // Phase 2: health gate, without the lock.
    let health = inner.await_readiness(&upstream).await;

    // Phase 3: publish the outcome, under the lock again.
    let _transition = inner.transition.lock().await;
    if inner.child.lock().unwrap().generation != generation
        || inner.state() != ProcessState::Starting
    {
        // A stop, shutdown or crash won the race.
        return;
    }

    match health {
        Ok(()) => {
            inner.touch();
            inner.set_state(ProcessState::Ready);
            inner.logs.append(
                PROXY_SOURCE,
                LogLevel::Info,
                format!("{} is ready on port {port}", inner.id),
            );
            info!(model = %inner.id, port, "subprocess ready");
            if inner.config.ttl > 0 {
                spawn_ttl_watcher(&inner, generation);
            }
        }
        Err(reason) => {
            warn!(model = %inner.id, %reason, "start failed");
            inner.set_state(ProcessState::Stopping);
            let child = {
                let mut state = inner.child.lock().unwrap();
                state.pid = None;
                state.port = 0;
                state.upstream = None;
                state.last_error = Some(reason.clone());
                state.child.take()
            };
            if let Some(child) = child {
                let _ = shutdown::kill_now(child).await;
            }
            inner.set_state(ProcessState::Failed);
            inner.logs.append(
                PROXY_SOURCE,
                LogLevel::Error,
                format!("{} failed to start: {reason}", inner.id),
            );
        }
    }
}

fn spawn_exit_monitor(inner: &Arc<Inner>, generation: u64) {
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        loop {
            sleep(Duration::from_millis(250)).await;
            let status = {
                let mut state = inner.child.lock().unwrap();
                if state.generation != generation {
                    return;
                }
                let Some(child) = state.child.as_mut() else {
                    // A stop took the handle; nothing left to watch.
                    return;
                };
                match child.try_wait() {
                    Ok(Some(status)) => {
                        state.child = None;
                        state.pid = None;
                        Some(status)
                    }
                    Ok(None) => None,
                    Err(e) => {
                        warn!(model = %inner.id, error = %e, "error polling subprocess");
                        None
                    }
                }
            };
            if let Some(status) = status {
                inner.handle_unexpected_exit(generation, status).await;
                return;
            }
        }
    });
}

fn spawn_ttl_watcher(inner: &Arc<Inner>, generation: u64) {
    let ttl = Duration::from_secs(inner.config.ttl);
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        loop {
            if inner.child.lock().unwrap().generation != generation
                || inner.state() != ProcessState::Ready
            {
                return;
            }
            if inner.in_flight.load(Ordering::SeqCst) > 0 {
                sleep(Duration::from_secs(1).min(ttl)).await;
                continue;
            }
            let idle = inner.last_activity.lock().unwrap().elapsed();
            if idle >= ttl {
                info!(model = %inner.id, idle_secs = idle.as_secs(), "idle TTL expired, evicting");
                inner.logs.append(
                    PROXY_SOURCE,
                    LogLevel::Info,
                    format!("stopping {} after {}s idle", inner.id, idle.as_secs()),
                );
                inner.stop(StopMode::Graceful).await;
                return;
            }
            sleep(ttl - idle).await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn model(cmd: &str) -> ModelConfig {
        ModelConfig {
            cmd_template: cmd.to_string(),
            proxy_url: "http://127.0.0.1:${PORT}".to_string(),
            check_endpoint: "none".to_string(),
            ttl: 0,
            unlisted: false,
            concurrency_limit: 0,
            start_delay: 0,
            env: BTreeMap::new(),
        }
    }

    fn settings() -> RuntimeSettings {
        RuntimeSettings {
            health_check_timeout: Duration::from_secs(3),
            stop_timeout: Duration::from_secs(3),
            exclusion_timeout: Duration::from_secs(3),
        }
    }

    fn process_with(config: ModelConfig, port: u16) -> Process {
        Process::new(
            "m1".to_string(),
            config,
            port,
            settings(),
            Arc::new(LogMux::new()),
            Arc::new(Notify::new()),
        )
    }

    fn process(cmd: &str, port: u16) -> Process {
        process_with(model(cmd), port)
    }

    #[tokio::test]
    async fn starts_and_stops_a_subprocess() {
        let process = process("sleep 30", 24100);
        assert_eq!(process.state(), ProcessState::Stopped);

        process.start().await.unwrap();
        assert_eq!(process.state(), ProcessState::Ready);
        assert!(process.current_port().is_some());

        process.stop(StopMode::Graceful).await;
        assert_eq!(process.state(), ProcessState::Stopped);
        assert_eq!(process.current_port(), None);
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let process = process("sleep 30", 24110);
        process.start().await.unwrap();
        let port = process.current_port();
        process.start().await.unwrap();
        assert_eq!(process.current_port(), port);
        process.shutdown().await;
    }

    #[tokio::test]
    async fn failed_spawn_records_error() {
        let process = process("/nonexistent/binary-for-test --port ${PORT}", 24120);
        let err = process.start().await.unwrap_err();
        assert!(matches!(err, ProxyError::Unavailable { .. }));
        assert_eq!(process.state(), ProcessState::Failed);
        assert!(process.last_error().is_some());
    }

    #[tokio::test]
    async fn acquire_admits_and_releases() {
        let process = process("sleep 30", 24130);
        let ticket = process.acquire(AdmissionMode::Queue).await.unwrap();
        assert_eq!(process.state(), ProcessState::Ready);
        assert_eq!(process.in_flight(), 1);
        assert!(ticket.upstream().starts_with("http://127.0.0.1:"));

        drop(ticket);
        assert_eq!(process.in_flight(), 0);
        process.shutdown().await;
    }

    #[tokio::test]
    async fn reject_mode_enforces_concurrency_limit() {
        let mut config = model("sleep 30");
        config.concurrency_limit = 1;
        let process = process_with(config, 24140);

        let first = process.acquire(AdmissionMode::Reject).await.unwrap();
        let second = process.acquire(AdmissionMode::Reject).await;
        assert!(matches!(second, Err(ProxyError::TooManyRequests(_))));

        drop(first);
        let third = process.acquire(AdmissionMode::Reject).await;
        assert!(third.is_ok());
        process.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_is_terminal() {
        let process = process("sleep 30", 24150);
        process.start().await.unwrap();
        process.shutdown().await;
        assert_eq!(process.state(), ProcessState::Shutdown);

        let err = process.acquire(AdmissionMode::Queue).await.unwrap_err();
        assert!(matches!(err, ProxyError::Gone(_)));
    }

    #[tokio::test]
    async fn unexpected_exit_while_ready_returns_to_stopped() {
        let process = process("sh -c 'sleep 1'", 24160);
        process.start().await.unwrap();
        assert_eq!(process.state(), ProcessState::Ready);

        // The subprocess exits on its own; the monitor must notice.
        let state = process
            .wait_for_state(
                |s| s == ProcessState::Stopped,
                Duration::from_secs(5),
            )
            .await;
        assert_eq!(state, Some(ProcessState::Stopped));
        assert!(process.last_error().unwrap().contains("exited unexpectedly"));
    }

    #[tokio::test]
    async fn ttl_evicts_idle_process() {
        let mut config = model("sleep 30");
        config.ttl = 1;
        let process = process_with(config, 24170);

        let ticket = process.acquire(AdmissionMode::Queue).await.unwrap();
        drop(ticket);
        assert_eq!(process.state(), ProcessState::Ready);

        let state = process
            .wait_for_state(
                |s| s == ProcessState::Stopped,
                Duration::from_secs(5),
            )
            .await;
        assert_eq!(state, Some(ProcessState::Stopped));
    }
}
