use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::encoder::{CaptureSettings, EncoderExit, EncoderLauncher, EncoderProcess};
use crate::retention::RetentionEngine;
use crate::segment::StreamTag;

/// Window over which rapid restarts are counted before escalating to a
/// warning, mirroring the restart history the operator cares about.
const RAPID_RESTART_WINDOW: StdDuration = StdDuration::from_secs(5 * 60);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("invalid session transition: cannot {action} while {from}")]
    InvalidTransition {
        from: SessionState,
        action: &'static str,
    },
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;

/// Lifecycle of one encoder session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Stopping,
    CrashedBackoff,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Stopping => "stopping",
            SessionState::CrashedBackoff => "crashed_backoff",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Operator-facing view of one stream session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub tag: StreamTag,
    pub state: SessionState,
    pub retained: usize,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
    pub next_index: u64,
    pub restarts: u32,
}

/// Tunables for the restart/backoff/stop behavior.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorPolicy {
    /// Fixed delay before re-launching after a crash or unexpected exit.
    pub restart_delay: StdDuration,
    /// How long a graceful stop may take before the forceful kill.
    pub stop_grace: StdDuration,
    /// Restarts within the rapid window that trigger an escalation warning.
    pub rapid_restart_warn_threshold: u32,
    /// Mirror non-matching encoder diagnostics into the log.
    pub verbose_passthrough: bool,
}

struct SharedState {
    state: Mutex<SessionState>,
    restarts: AtomicU32,
    restart_history: Mutex<VecDeque<DateTime<Utc>>>,
}

impl SharedState {
    fn set(&self, next: SessionState) {
        *self.state.lock().unwrap() = next;
    }

    fn get(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    /// Records a restart and returns how many happened inside the rapid
    /// window.
    fn record_restart(&self) -> u32 {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        let mut history = self.restart_history.lock().unwrap();
        let now = Utc::now();
        history.push_back(now);
        let window = Duration::from_std(RAPID_RESTART_WINDOW).unwrap_or_else(|_| Duration::zero());
        while history
            .front()
            .map(|timestamp| *timestamp < now - window)
            .unwrap_or(false)
        {
            history.pop_front();
        }
        history.len() as u32
    }
}

/// Spawns the external encoder for one stream tag, watches its diagnostic
/// output for segment-open hints, and restarts it under a fixed-delay policy
/// unless the stop was intentional.
pub struct EncoderSupervisor {
    tag: StreamTag,
    launcher: Arc<dyn EncoderLauncher>,
    engine: Arc<RetentionEngine>,
    settings: CaptureSettings,
    policy: SupervisorPolicy,
    shared: Arc<SharedState>,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for EncoderSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncoderSupervisor")
            .field("tag", &self.tag)
            .field("state", &self.state())
            .finish()
    }
}

impl EncoderSupervisor {
    pub fn new(
        launcher: Arc<dyn EncoderLauncher>,
        engine: Arc<RetentionEngine>,
        settings: CaptureSettings,
        policy: SupervisorPolicy,
    ) -> Self {
        Self {
            tag: engine.tag(),
            launcher,
            engine,
            settings,
            policy,
            shared: Arc::new(SharedState {
                state: Mutex::new(SessionState::Idle),
                restarts: AtomicU32::new(0),
                restart_history: Mutex::new(VecDeque::new()),
            }),
            stop_tx: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn tag(&self) -> StreamTag {
        self.tag
    }

    pub fn state(&self) -> SessionState {
        self.shared.get()
    }

    pub fn status(&self) -> SessionStatus {
        let snapshot = self.engine.snapshot();
        SessionStatus {
            tag: self.tag,
            state: self.state(),
            retained: snapshot.len(),
            oldest: snapshot.oldest().map(|segment| segment.created_at),
            newest: snapshot.newest().map(|segment| segment.created_at),
            next_index: self.engine.allocate_next_index(),
            restarts: self.shared.restarts.load(Ordering::SeqCst),
        }
    }

    /// Begins the session. Valid only from `Idle`.
    pub fn start(&self) -> SupervisorResult<()> {
        {
            let mut state = self.shared.state.lock().unwrap();
            if *state != SessionState::Idle {
                return Err(SupervisorError::InvalidTransition {
                    from: *state,
                    action: "start",
                });
            }
            *state = SessionState::Starting;
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        *self.stop_tx.lock().unwrap() = Some(stop_tx);
        let session = Session {
            tag: self.tag,
            launcher: Arc::clone(&self.launcher),
            engine: Arc::clone(&self.engine),
            settings: self.settings.clone(),
            policy: self.policy,
            shared: Arc::clone(&self.shared),
        };
        let handle = tokio::spawn(session.run(stop_rx));
        *self.task.lock().unwrap() = Some(handle);
        info!(tag = %self.tag, "encoder session started");
        Ok(())
    }

    /// Requests a graceful stop and waits for the session to reach `Idle`.
    /// Valid from any non-`Idle` state.
    pub async fn stop(&self) -> SupervisorResult<()> {
        let stop_tx = self.stop_tx.lock().unwrap().take();
        let Some(stop_tx) = stop_tx else {
            return Err(SupervisorError::InvalidTransition {
                from: self.state(),
                action: "stop",
            });
        };
        let _ = stop_tx.send(true);
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!(tag = %self.tag, "encoder session stopped");
        Ok(())
    }
}

struct Session {
    tag: StreamTag,
    launcher: Arc<dyn EncoderLauncher>,
    engine: Arc<RetentionEngine>,
    settings: CaptureSettings,
    policy: SupervisorPolicy,
    shared: Arc<SharedState>,
}

impl Session {
    async fn run(self, mut stop_rx: watch::Receiver<bool>) {
        let segment_open =
            Regex::new(r"Opening '([^']+\.ts)'").expect("segment-open pattern is valid");
        loop {
            if *stop_rx.borrow() {
                self.shared.set(SessionState::Idle);
                return;
            }
            self.shared.set(SessionState::Starting);

            let mut settings = self.settings.clone();
            settings.start_index = self.engine.allocate_next_index();
            let invocation = settings.invocation();
            debug!(tag = %self.tag, command = %invocation.command_line(), "launching encoder");

            let mut process = match self.launcher.launch(&invocation).await {
                Ok(process) => process,
                Err(error) => {
                    warn!(tag = %self.tag, %error, "encoder spawn failed");
                    self.enter_backoff();
                    if wait_or_stop(self.policy.restart_delay, &mut stop_rx).await {
                        self.shared.set(SessionState::Idle);
                        return;
                    }
                    continue;
                }
            };
            self.shared.set(SessionState::Running);
            info!(tag = %self.tag, pid = ?process.pid(), start_index = settings.start_index, "encoder running");

            let exit = match self
                .observe(process.as_mut(), &segment_open, &mut stop_rx)
                .await
            {
                Observation::StopRequested => {
                    self.shutdown(process.as_mut()).await;
                    self.shared.set(SessionState::Idle);
                    return;
                }
                Observation::Exited(exit) => exit,
            };

            // Exit code zero or an unknown code while the session was still
            // marked running counts as an unexpected stop: the camera may
            // simply have reconnected, so the restart path is the same.
            warn!(tag = %self.tag, %exit, "encoder exited unexpectedly");
            self.enter_backoff();
            if wait_or_stop(self.policy.restart_delay, &mut stop_rx).await {
                self.shared.set(SessionState::Idle);
                return;
            }
        }
    }

    /// Drives one running process: forwards segment-open hints to the
    /// retention engine until the diagnostic stream closes or a stop lands.
    async fn observe(
        &self,
        process: &mut dyn EncoderProcess,
        segment_open: &Regex,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> Observation {
        loop {
            tokio::select! {
                line = process.next_diagnostic_line() => match line {
                    Some(line) => self.inspect_line(&line, segment_open),
                    None => {
                        // A process can close its diagnostic stream and then
                        // hang, so the exit wait must stay interruptible.
                        let exit = tokio::select! {
                            result = process.wait() => {
                                result.unwrap_or(EncoderExit { code: None })
                            }
                            _ = stop_rx.changed() => return Observation::StopRequested,
                        };
                        return Observation::Exited(exit);
                    }
                },
                _ = stop_rx.changed() => return Observation::StopRequested,
            }
        }
    }

    fn inspect_line(&self, line: &str, segment_open: &Regex) {
        if segment_open.is_match(line) {
            // Best-effort fast path; the periodic sweep is the backstop.
            let engine = Arc::clone(&self.engine);
            let tag = self.tag;
            tokio::spawn(async move {
                if let Err(error) = engine.reconcile().await {
                    warn!(%tag, %error, "segment-open reconcile failed");
                }
            });
        } else if self.policy.verbose_passthrough {
            debug!(tag = %self.tag, "{line}");
        }
    }

    async fn shutdown(&self, process: &mut dyn EncoderProcess) {
        self.shared.set(SessionState::Stopping);
        if let Err(error) = process.terminate() {
            warn!(tag = %self.tag, %error, "graceful terminate failed");
        }
        match timeout(self.policy.stop_grace, process.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!(tag = %self.tag, "stop grace period elapsed; killing encoder");
                if let Err(error) = process.kill().await {
                    warn!(tag = %self.tag, %error, "forceful kill failed");
                }
                let _ = process.wait().await;
            }
        }
    }

    fn enter_backoff(&self) {
        self.shared.set(SessionState::CrashedBackoff);
        let rapid = self.shared.record_restart();
        if rapid > self.policy.rapid_restart_warn_threshold {
            warn!(
                tag = %self.tag,
                restarts_in_window = rapid,
                "encoder is crash-looping"
            );
        }
    }
}

enum Observation {
    StopRequested,
    Exited(EncoderExit),
}

/// Sleeps through the backoff delay, returning `true` if a stop request
/// interrupted it.
async fn wait_or_stop(delay: StdDuration, stop_rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = sleep(delay) => false,
        _ = stop_rx.changed() => true,
    }
}
