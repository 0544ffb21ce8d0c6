use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use thiserror::Error;
use vigia_core::{
    DualOutputCoordinator, ReconcileReport, SessionStatus, StreamTag, SystemEncoderLauncher,
    VigiaConfig,
};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] vigia_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error(transparent)]
    Tag(#[from] vigia_core::TagParseError),
    #[error("retention error: {0}")]
    Retention(#[from] vigia_core::RetentionError),
    #[error("supervisor error: {0}")]
    Supervisor(#[from] vigia_core::SupervisorError),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Camera DVR command-line control interface", long_about = None)]
pub struct Cli {
    /// Path to the main vigia.toml
    #[arg(long, default_value = "configs/vigia.toml")]
    pub config: PathBuf,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Summarize both stream sessions and their retained windows
    Status,
    /// Run the capture pipelines in the foreground until interrupted
    Run(RunArgs),
    /// One-shot emergency retention sweep
    Cleanup(CleanupArgs),
    /// List retained segments for one stream
    Segments(SegmentsArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Restrict to one stream tag (dvr or live); default runs both
    #[arg(long)]
    pub tag: Option<String>,
}

#[derive(Args, Debug)]
pub struct CleanupArgs {
    /// Restrict to one stream tag (dvr or live); default sweeps both
    #[arg(long)]
    pub tag: Option<String>,
}

#[derive(Args, Debug)]
pub struct SegmentsArgs {
    /// Stream tag (dvr or live)
    #[arg(long, default_value = "dvr")]
    pub tag: String,
}

pub fn run(cli: Cli) -> Result<()> {
    let config = vigia_core::load_config(&cli.config)?;
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(dispatch(cli, config))
}

async fn dispatch(cli: Cli, config: VigiaConfig) -> Result<()> {
    let coordinator = Arc::new(DualOutputCoordinator::new(
        &config,
        Arc::new(SystemEncoderLauncher),
    ));
    match cli.command {
        Commands::Status => status(&coordinator, cli.format).await,
        Commands::Run(args) => run_pipelines(&coordinator, parse_tags(args.tag.as_deref())?).await,
        Commands::Cleanup(args) => {
            cleanup(&coordinator, parse_tags(args.tag.as_deref())?, cli.format).await
        }
        Commands::Segments(args) => segments(&coordinator, args.tag.parse()?, cli.format).await,
    }
}

fn parse_tags(tag: Option<&str>) -> Result<Vec<StreamTag>> {
    match tag {
        Some(tag) => Ok(vec![tag.parse()?]),
        None => Ok(StreamTag::ALL.to_vec()),
    }
}

#[derive(Debug, Serialize)]
struct StatusReport {
    source: String,
    sessions: Vec<TagStatus>,
}

#[derive(Debug, Serialize)]
struct TagStatus {
    #[serde(flatten)]
    session: SessionStatus,
    on_disk: usize,
    on_disk_bytes: u64,
    window: String,
}

async fn status(coordinator: &DualOutputCoordinator, format: OutputFormat) -> Result<()> {
    let mut sessions = Vec::new();
    for tag in StreamTag::ALL {
        let engine = coordinator.engine(tag);
        let on_disk = engine.inspect().await?;
        let session = coordinator.status(tag);
        let window_secs =
            on_disk.len() as u64 * engine.policy().segment_duration().as_secs();
        sessions.push(TagStatus {
            session,
            on_disk: on_disk.len(),
            on_disk_bytes: on_disk.total_bytes(),
            window: format_duration(window_secs),
        });
    }
    let report = StatusReport {
        source: coordinator.source().to_string(),
        sessions,
    };
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => {
            println!("source: {}", report.source);
            for entry in &report.sessions {
                println!(
                    "{:<5} {:<16} segments={:<6} size={:<10} window={}",
                    entry.session.tag,
                    entry.session.state,
                    entry.on_disk,
                    format_bytes(entry.on_disk_bytes),
                    entry.window,
                );
            }
        }
    }
    Ok(())
}

async fn run_pipelines(coordinator: &DualOutputCoordinator, tags: Vec<StreamTag>) -> Result<()> {
    for tag in &tags {
        coordinator.start(*tag).await?;
    }
    tokio::signal::ctrl_c().await?;
    for tag in &tags {
        coordinator.stop(*tag).await?;
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct CleanupSummary {
    tag: StreamTag,
    #[serde(flatten)]
    report: ReconcileReport,
}

async fn cleanup(
    coordinator: &DualOutputCoordinator,
    tags: Vec<StreamTag>,
    format: OutputFormat,
) -> Result<()> {
    let mut summaries = Vec::new();
    for tag in tags {
        let report = coordinator.force_reconcile(tag).await?;
        summaries.push(CleanupSummary { tag, report });
    }
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summaries)?),
        OutputFormat::Text => {
            for summary in &summaries {
                println!(
                    "{:<5} removed={} reclaimed={} kept={}",
                    summary.tag,
                    summary.report.evicted,
                    format_bytes(summary.report.reclaimed_bytes),
                    summary.report.retained,
                );
            }
        }
    }
    Ok(())
}

async fn segments(
    coordinator: &DualOutputCoordinator,
    tag: StreamTag,
    format: OutputFormat,
) -> Result<()> {
    let map = coordinator.engine(tag).inspect().await?;
    match format {
        OutputFormat::Json => {
            let listing: Vec<_> = map.chronological();
            println!("{}", serde_json::to_string_pretty(&listing)?);
        }
        OutputFormat::Text => {
            println!("{} segments retained for {}", map.len(), tag);
            for segment in map.chronological() {
                println!(
                    "{:>8}  {}  {}",
                    segment.index,
                    segment.created_at.format("%Y-%m-%d %H:%M:%S"),
                    format_bytes(segment.size_bytes),
                );
            }
        }
    }
    Ok(())
}

/// Formats a second count the way operators read retained windows: `47h 59m`,
/// `12m 30s`, or `45s`.
pub fn format_duration(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let secs = total_secs % 60;
    if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m {secs}s")
    } else {
        format!("{secs}s")
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_read_like_the_status_page() {
        assert_eq!(format_duration(45), "45s");
        assert_eq!(format_duration(750), "12m 30s");
        assert_eq!(format_duration(48 * 3600 - 60), "47h 59m");
    }

    #[test]
    fn bytes_scale_through_units() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert!(parse_tags(Some("vod")).is_err());
        assert_eq!(parse_tags(None).unwrap().len(), 2);
    }
}
