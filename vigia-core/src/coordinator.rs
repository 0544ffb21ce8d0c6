use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::VigiaConfig;
use crate::encoder::{CaptureSettings, EncoderLauncher};
use crate::retention::{ReconcileReport, RetentionEngine, RetentionPolicy, RetentionResult};
use crate::segment::StreamTag;
use crate::store::SegmentStore;
use crate::supervisor::{EncoderSupervisor, SessionStatus, SupervisorPolicy, SupervisorResult};

/// Everything one stream tag owns: store subdirectory, retention engine,
/// manifest, supervisor, and the periodic reconcile backstop. Nothing here
/// is shared with the other tag.
pub struct StreamPipeline {
    tag: StreamTag,
    engine: Arc<RetentionEngine>,
    supervisor: EncoderSupervisor,
    reconcile_interval: StdDuration,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl StreamPipeline {
    fn new(
        engine: Arc<RetentionEngine>,
        supervisor: EncoderSupervisor,
        reconcile_interval: StdDuration,
    ) -> Self {
        Self {
            tag: engine.tag(),
            engine,
            supervisor,
            reconcile_interval,
            timer: Mutex::new(None),
        }
    }

    pub fn tag(&self) -> StreamTag {
        self.tag
    }

    pub fn engine(&self) -> &Arc<RetentionEngine> {
        &self.engine
    }

    pub fn status(&self) -> SessionStatus {
        self.supervisor.status()
    }

    fn start(&self) -> SupervisorResult<()> {
        self.supervisor.start()?;
        let engine = Arc::clone(&self.engine);
        let interval = self.reconcile_interval;
        let tag = self.tag;
        let timer = tokio::spawn(async move {
            // The timer-driven sweep guarantees eventual consistency even
            // when every diagnostic-line hint is missed.
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(error) = engine.reconcile().await {
                    warn!(%tag, %error, "periodic reconcile failed");
                }
            }
        });
        *self.timer.lock().unwrap() = Some(timer);
        Ok(())
    }

    async fn stop(&self) -> SupervisorResult<()> {
        if let Some(timer) = self.timer.lock().unwrap().take() {
            timer.abort();
        }
        self.supervisor.stop().await
    }
}

/// Derives the two independent retention pipelines (long-window DVR,
/// short-window live) from one camera source and keeps their state fully
/// isolated: only the source address and transport are shared.
pub struct DualOutputCoordinator {
    dvr: StreamPipeline,
    live: StreamPipeline,
    source: String,
}

impl DualOutputCoordinator {
    pub fn new(config: &VigiaConfig, launcher: Arc<dyn EncoderLauncher>) -> Self {
        let recordings = config.recordings_dir();

        let dvr_policy = RetentionPolicy::from_age(
            StdDuration::from_secs(config.dvr.segment_duration_secs),
            StdDuration::from_secs(config.dvr.max_age_hours * 3600),
        );
        let live_policy = RetentionPolicy::from_count(
            StdDuration::from_secs(config.live.segment_duration_secs),
            config.live.window_segments,
        );

        let supervisor_policy = SupervisorPolicy {
            restart_delay: StdDuration::from_secs(config.restart.delay_seconds),
            stop_grace: StdDuration::from_secs(config.restart.stop_grace_seconds),
            rapid_restart_warn_threshold: config.restart.rapid_restart_warn_threshold,
            verbose_passthrough: config.encoder.verbose_passthrough,
        };

        let dvr = Self::build_pipeline(
            config,
            Arc::clone(&launcher),
            SegmentStore::new(&recordings, StreamTag::Dvr),
            dvr_policy,
            supervisor_policy,
            config.dvr.encoder_deletes_segments,
            StdDuration::from_secs(config.dvr.reconcile_interval_minutes * 60),
        );
        let live = Self::build_pipeline(
            config,
            launcher,
            SegmentStore::new(&recordings, StreamTag::Live),
            live_policy,
            supervisor_policy,
            config.live.encoder_deletes_segments,
            StdDuration::from_secs(config.live.reconcile_interval_secs),
        );

        Self {
            dvr,
            live,
            source: config.camera.redacted_url(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_pipeline(
        config: &VigiaConfig,
        launcher: Arc<dyn EncoderLauncher>,
        store: SegmentStore,
        policy: RetentionPolicy,
        supervisor_policy: SupervisorPolicy,
        encoder_deletes_segments: bool,
        reconcile_interval: StdDuration,
    ) -> StreamPipeline {
        let settings = CaptureSettings {
            program: PathBuf::from(&config.encoder.ffmpeg_path),
            source_url: config.camera.rtsp_url.clone(),
            transport: config.camera.transport.clone(),
            log_level: config.encoder.log_level.clone(),
            segment_duration: policy.segment_duration(),
            list_size: policy.max_segments(),
            segment_pattern: store.directory().join(store.naming().encoder_pattern()),
            playlist_path: store.playlist_path(),
            start_index: 0,
            encoder_deletes_segments,
        };
        let engine = Arc::new(RetentionEngine::new(store, policy));
        let supervisor =
            EncoderSupervisor::new(launcher, Arc::clone(&engine), settings, supervisor_policy);
        StreamPipeline::new(engine, supervisor, reconcile_interval)
    }

    /// Source address with credentials masked, safe for status output.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn pipeline(&self, tag: StreamTag) -> &StreamPipeline {
        match tag {
            StreamTag::Dvr => &self.dvr,
            StreamTag::Live => &self.live,
        }
    }

    pub fn engine(&self, tag: StreamTag) -> &Arc<RetentionEngine> {
        self.pipeline(tag).engine()
    }

    /// Reconciles once before launch so the start index reflects what is
    /// already on disk, then starts the supervisor and the periodic timer.
    pub async fn start(&self, tag: StreamTag) -> SupervisorResult<()> {
        let pipeline = self.pipeline(tag);
        if let Err(error) = pipeline.engine.reconcile().await {
            warn!(%tag, %error, "startup reconcile failed; starting anyway");
        }
        pipeline.start()?;
        info!(%tag, source = %self.source, "stream pipeline started");
        Ok(())
    }

    pub async fn stop(&self, tag: StreamTag) -> SupervisorResult<()> {
        self.pipeline(tag).stop().await
    }

    pub async fn start_all(&self) -> SupervisorResult<()> {
        for tag in StreamTag::ALL {
            self.start(tag).await?;
        }
        Ok(())
    }

    pub async fn stop_all(&self) -> SupervisorResult<()> {
        for tag in StreamTag::ALL {
            self.stop(tag).await?;
        }
        Ok(())
    }

    pub fn status(&self, tag: StreamTag) -> SessionStatus {
        self.pipeline(tag).status()
    }

    pub async fn force_reconcile(&self, tag: StreamTag) -> RetentionResult<ReconcileReport> {
        self.pipeline(tag).engine.reconcile().await
    }
}
