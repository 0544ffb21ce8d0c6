use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio::time::{sleep, Instant};
use vigia_core::{
    CaptureSettings, EncoderExit, EncoderInvocation, EncoderLauncher, EncoderProcess,
    EncoderSupervisor, RetentionEngine, RetentionPolicy, SegmentStore, SessionState, StreamTag,
    SupervisorPolicy,
};

/// What one launched process should do: fail to spawn, emit some diagnostic
/// lines and exit, keep running until terminated, shrug off the graceful
/// terminate, or close its diagnostic stream while staying alive.
enum Script {
    SpawnFailure,
    Exit { code: i32, lines: Vec<String> },
    Linger { lines: Vec<String> },
    IgnoresTermination,
    ClosesDiagnosticsEarly,
}

struct ScriptedProcess {
    lines: VecDeque<String>,
    exit: EncoderExit,
    /// `wait()` blocks until terminated or killed.
    stays_alive: bool,
    /// The diagnostic stream stays open after the scripted lines drain.
    holds_diagnostics_open: bool,
    ignores_terminate: bool,
    exited: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ScriptedProcess {
    fn lingering(lines: Vec<String>) -> Self {
        Self {
            lines: lines.into(),
            exit: EncoderExit { code: Some(0) },
            stays_alive: true,
            holds_diagnostics_open: true,
            ignores_terminate: false,
            exited: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    fn mark_exited(&self) {
        self.exited.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }
}

#[async_trait]
impl EncoderProcess for ScriptedProcess {
    fn pid(&self) -> Option<u32> {
        Some(4242)
    }

    async fn next_diagnostic_line(&mut self) -> Option<String> {
        if let Some(line) = self.lines.pop_front() {
            return Some(line);
        }
        while self.holds_diagnostics_open && !self.exited.load(Ordering::SeqCst) {
            self.notify.notified().await;
        }
        None
    }

    async fn wait(&mut self) -> io::Result<EncoderExit> {
        while self.stays_alive && !self.exited.load(Ordering::SeqCst) {
            self.notify.notified().await;
        }
        Ok(self.exit)
    }

    fn terminate(&mut self) -> io::Result<()> {
        if !self.ignores_terminate {
            self.mark_exited();
        }
        Ok(())
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.mark_exited();
        Ok(())
    }
}

struct ScriptedLauncher {
    scripts: Mutex<VecDeque<Script>>,
    launches: Arc<AtomicU32>,
}

#[async_trait]
impl EncoderLauncher for ScriptedLauncher {
    async fn launch(
        &self,
        _invocation: &EncoderInvocation,
    ) -> io::Result<Box<dyn EncoderProcess>> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Script::Linger { lines: Vec::new() });
        match script {
            Script::SpawnFailure => Err(io::Error::new(
                io::ErrorKind::NotFound,
                "encoder binary not found",
            )),
            Script::Exit { code, lines } => Ok(Box::new(ScriptedProcess {
                lines: lines.into(),
                exit: EncoderExit { code: Some(code) },
                stays_alive: false,
                holds_diagnostics_open: false,
                ignores_terminate: false,
                exited: Arc::new(AtomicBool::new(false)),
                notify: Arc::new(Notify::new()),
            })),
            Script::Linger { lines } => Ok(Box::new(ScriptedProcess::lingering(lines))),
            Script::IgnoresTermination => Ok(Box::new(ScriptedProcess {
                ignores_terminate: true,
                ..ScriptedProcess::lingering(Vec::new())
            })),
            Script::ClosesDiagnosticsEarly => Ok(Box::new(ScriptedProcess {
                holds_diagnostics_open: false,
                ..ScriptedProcess::lingering(Vec::new())
            })),
        }
    }
}

const RESTART_DELAY: StdDuration = StdDuration::from_secs(5);
const STOP_GRACE: StdDuration = StdDuration::from_secs(2);

fn fixture(
    root: &std::path::Path,
    scripts: Vec<Script>,
) -> (Arc<RetentionEngine>, EncoderSupervisor, Arc<AtomicU32>) {
    let store = SegmentStore::new(root, StreamTag::Dvr);
    let engine = Arc::new(RetentionEngine::new(
        store,
        RetentionPolicy::from_count(StdDuration::from_secs(2), 16),
    ));
    let launches = Arc::new(AtomicU32::new(0));
    let launcher = Arc::new(ScriptedLauncher {
        scripts: Mutex::new(scripts.into()),
        launches: Arc::clone(&launches),
    });
    let settings = CaptureSettings {
        program: "ffmpeg".into(),
        source_url: "rtsp://camera/stream".into(),
        transport: "udp".into(),
        log_level: "warning".into(),
        segment_duration: StdDuration::from_secs(2),
        list_size: 16,
        segment_pattern: engine.store().directory().join("dvr_%d.ts"),
        playlist_path: engine.store().playlist_path(),
        start_index: 0,
        encoder_deletes_segments: false,
    };
    let policy = SupervisorPolicy {
        restart_delay: RESTART_DELAY,
        stop_grace: STOP_GRACE,
        rapid_restart_warn_threshold: 3,
        verbose_passthrough: false,
    };
    let supervisor = EncoderSupervisor::new(launcher, Arc::clone(&engine), settings, policy);
    (engine, supervisor, launches)
}

async fn eventually(mut check: impl FnMut() -> bool, what: &str) {
    for _ in 0..2000 {
        if check() {
            return;
        }
        sleep(StdDuration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test(start_paused = true)]
async fn relaunches_after_a_crash_once_the_delay_elapses() {
    let dir = TempDir::new().unwrap();
    let (_engine, supervisor, launches) = fixture(
        dir.path(),
        vec![
            Script::Exit {
                code: 1,
                lines: Vec::new(),
            },
            Script::Linger { lines: Vec::new() },
        ],
    );

    let started = Instant::now();
    supervisor.start().unwrap();
    eventually(
        || launches.load(Ordering::SeqCst) == 2,
        "second encoder launch",
    )
    .await;
    assert!(
        started.elapsed() >= RESTART_DELAY,
        "relaunch happened before the backoff delay"
    );

    eventually(|| supervisor.state() == SessionState::Running, "running state").await;
    assert_eq!(supervisor.status().restarts, 1);
    supervisor.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn stop_terminates_the_encoder_and_suppresses_the_restart() {
    let dir = TempDir::new().unwrap();
    let (_engine, supervisor, launches) =
        fixture(dir.path(), vec![Script::Linger { lines: Vec::new() }]);

    supervisor.start().unwrap();
    eventually(|| supervisor.state() == SessionState::Running, "running state").await;
    supervisor.stop().await.unwrap();

    assert_eq!(supervisor.state(), SessionState::Idle);
    assert_eq!(launches.load(Ordering::SeqCst), 1);

    // No relaunch sneaks in after the session has wound down.
    sleep(StdDuration::from_secs(60)).await;
    assert_eq!(launches.load(Ordering::SeqCst), 1);
    assert_eq!(supervisor.state(), SessionState::Idle);

    // A second stop has nothing to stop.
    assert!(supervisor.stop().await.is_err());
}

#[tokio::test(start_paused = true)]
async fn stop_escalates_to_kill_when_the_grace_period_elapses() {
    let dir = TempDir::new().unwrap();
    let (_engine, supervisor, launches) =
        fixture(dir.path(), vec![Script::IgnoresTermination]);

    supervisor.start().unwrap();
    eventually(|| supervisor.state() == SessionState::Running, "running state").await;

    let stop_requested = Instant::now();
    supervisor.stop().await.unwrap();
    assert!(
        stop_requested.elapsed() >= STOP_GRACE,
        "kill fired before the grace period elapsed"
    );
    assert_eq!(supervisor.state(), SessionState::Idle);
    assert_eq!(launches.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn stop_lands_even_when_the_diagnostic_stream_closed_first() {
    let dir = TempDir::new().unwrap();
    let (_engine, supervisor, launches) =
        fixture(dir.path(), vec![Script::ClosesDiagnosticsEarly]);

    supervisor.start().unwrap();
    eventually(|| supervisor.state() == SessionState::Running, "running state").await;
    supervisor.stop().await.unwrap();
    assert_eq!(supervisor.state(), SessionState::Idle);
    assert_eq!(launches.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn spawn_failure_backs_off_and_recovers() {
    let dir = TempDir::new().unwrap();
    let (_engine, supervisor, launches) = fixture(
        dir.path(),
        vec![Script::SpawnFailure, Script::Linger { lines: Vec::new() }],
    );

    supervisor.start().unwrap();
    eventually(|| supervisor.state() == SessionState::Running, "recovery").await;
    assert_eq!(launches.load(Ordering::SeqCst), 2);
    assert_eq!(supervisor.status().restarts, 1);
    supervisor.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn start_is_rejected_while_a_session_is_active() {
    let dir = TempDir::new().unwrap();
    let (_engine, supervisor, _launches) =
        fixture(dir.path(), vec![Script::Linger { lines: Vec::new() }]);

    supervisor.start().unwrap();
    eventually(|| supervisor.state() == SessionState::Running, "running state").await;
    assert!(supervisor.start().is_err());
    supervisor.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn segment_open_diagnostics_drive_a_reconcile() {
    let dir = TempDir::new().unwrap();
    let store = SegmentStore::new(dir.path(), StreamTag::Dvr);
    store.ensure_dir().await.unwrap();
    tokio::fs::write(store.segment_path(0), b"segment-data")
        .await
        .unwrap();

    let (engine, supervisor, _launches) = fixture(
        dir.path(),
        vec![Script::Linger {
            lines: vec!["[hls @ 0x5601] Opening 'dvr_0.ts' for writing".to_string()],
        }],
    );

    supervisor.start().unwrap();
    eventually(|| engine.snapshot().len() == 1, "reconcile from diagnostics").await;
    assert!(engine.store().playlist_path().exists());
    supervisor.stop().await.unwrap();
}
