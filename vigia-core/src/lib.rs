pub mod config;
pub mod coordinator;
pub mod encoder;
pub mod error;
pub mod playlist;
pub mod retention;
pub mod segment;
pub mod store;
pub mod supervisor;

pub use config::{load_config, redact_credentials, VigiaConfig};
pub use coordinator::{DualOutputCoordinator, StreamPipeline};
pub use encoder::{
    CaptureSettings, EncoderExit, EncoderInvocation, EncoderLauncher, EncoderProcess,
    SystemEncoderLauncher,
};
pub use error::{ConfigError, Result};
pub use playlist::{Manifest, ManifestEntry, PlaylistError, PlaylistMaintainer};
pub use retention::{ReconcileReport, RetentionEngine, RetentionError, RetentionPolicy};
pub use segment::{Segment, SegmentMap, SegmentNaming, StreamTag, TagParseError};
pub use store::{SegmentStore, StoreError};
pub use supervisor::{
    EncoderSupervisor, SessionState, SessionStatus, SupervisorError, SupervisorPolicy,
};
