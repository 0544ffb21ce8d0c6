use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, Command};

/// Exit information for an encoder process. A `None` code means the process
/// was terminated by a signal or the platform reported no code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderExit {
    pub code: Option<i32>,
}

impl std::fmt::Display for EncoderExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "code {code}"),
            None => write!(f, "unknown code"),
        }
    }
}

/// Fully resolved external-encoder command line.
#[derive(Debug, Clone)]
pub struct EncoderInvocation {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl EncoderInvocation {
    pub fn command_line(&self) -> String {
        format!("{} {}", self.program.display(), self.args.join(" "))
    }
}

/// Configuration knobs the core hands to the external encoder for one
/// stream tag. Only the existence of these knobs matters to the engine; the
/// flag spelling below targets the ffmpeg HLS muxer.
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub program: PathBuf,
    pub source_url: String,
    pub transport: String,
    pub log_level: String,
    pub segment_duration: StdDuration,
    pub list_size: usize,
    /// Output filename pattern parameterized by segment index.
    pub segment_pattern: PathBuf,
    pub playlist_path: PathBuf,
    /// Ring-reuse offset: the index the encoder starts writing at.
    pub start_index: u64,
    /// Whether the encoder deletes old segment files itself or leaves
    /// eviction to the retention engine.
    pub encoder_deletes_segments: bool,
}

impl CaptureSettings {
    pub fn invocation(&self) -> EncoderInvocation {
        let mut args = vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            self.log_level.clone(),
            "-rtsp_transport".to_string(),
            self.transport.clone(),
            "-i".to_string(),
            self.source_url.clone(),
            "-c:v".to_string(),
            "copy".to_string(),
            "-c:a".to_string(),
            "copy".to_string(),
            "-f".to_string(),
            "hls".to_string(),
            "-hls_time".to_string(),
            self.segment_duration.as_secs().to_string(),
            "-hls_list_size".to_string(),
            self.list_size.to_string(),
            "-hls_segment_type".to_string(),
            "mpegts".to_string(),
            "-hls_segment_filename".to_string(),
            self.segment_pattern.to_string_lossy().to_string(),
            "-start_number".to_string(),
            self.start_index.to_string(),
            "-hls_flags".to_string(),
        ];
        if self.encoder_deletes_segments {
            args.push("delete_segments+append_list".to_string());
        } else {
            args.push("append_list".to_string());
        }
        args.push(self.playlist_path.to_string_lossy().to_string());
        EncoderInvocation {
            program: self.program.clone(),
            args,
        }
    }
}

/// One running instance of the external encoder, as observed by the
/// supervisor: diagnostic output, exit, and termination controls.
#[async_trait]
pub trait EncoderProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Next line of the encoder's diagnostic stream; `None` once it closes,
    /// which precedes process exit.
    async fn next_diagnostic_line(&mut self) -> Option<String>;

    async fn wait(&mut self) -> io::Result<EncoderExit>;

    /// Asks the process to shut down gracefully.
    fn terminate(&mut self) -> io::Result<()>;

    /// Forceful kill, used after the stop grace period elapses.
    async fn kill(&mut self) -> io::Result<()>;
}

/// Spawns encoder processes. The system implementation runs the real
/// binary; tests substitute a scripted one.
#[async_trait]
pub trait EncoderLauncher: Send + Sync {
    async fn launch(&self, invocation: &EncoderInvocation)
        -> io::Result<Box<dyn EncoderProcess>>;
}

#[derive(Debug, Default)]
pub struct SystemEncoderLauncher;

#[async_trait]
impl EncoderLauncher for SystemEncoderLauncher {
    async fn launch(
        &self,
        invocation: &EncoderInvocation,
    ) -> io::Result<Box<dyn EncoderProcess>> {
        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command.spawn()?;
        let stderr = child
            .stderr
            .take()
            .map(|stderr| BufReader::new(stderr).lines());
        Ok(Box::new(SystemEncoderProcess { child, stderr }))
    }
}

struct SystemEncoderProcess {
    child: Child,
    stderr: Option<Lines<BufReader<ChildStderr>>>,
}

#[async_trait]
impl EncoderProcess for SystemEncoderProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn next_diagnostic_line(&mut self) -> Option<String> {
        match self.stderr.as_mut()?.next_line().await {
            Ok(line) => line,
            Err(_) => None,
        }
    }

    async fn wait(&mut self) -> io::Result<EncoderExit> {
        let status = self.child.wait().await?;
        Ok(EncoderExit {
            code: status.code(),
        })
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> io::Result<()> {
        match self.child.id() {
            Some(pid) => {
                // SAFETY: plain kill(2) on a pid we own; no memory involved.
                let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
                if rc == 0 {
                    Ok(())
                } else {
                    Err(io::Error::last_os_error())
                }
            }
            None => Ok(()),
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.child.kill().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> CaptureSettings {
        CaptureSettings {
            program: PathBuf::from("ffmpeg"),
            source_url: "rtsp://cam/stream".to_string(),
            transport: "udp".to_string(),
            log_level: "warning".to_string(),
            segment_duration: StdDuration::from_secs(30),
            list_size: 5760,
            segment_pattern: PathBuf::from("/rec/dvr/dvr_%d.ts"),
            playlist_path: PathBuf::from("/rec/dvr/dvr.m3u8"),
            start_index: 17,
            encoder_deletes_segments: false,
        }
    }

    #[test]
    fn invocation_carries_all_configuration_knobs() {
        let args = settings().invocation().args;
        let find = |flag: &str| {
            args.iter()
                .position(|arg| arg == flag)
                .map(|at| args[at + 1].clone())
        };
        assert_eq!(find("-i").as_deref(), Some("rtsp://cam/stream"));
        assert_eq!(find("-rtsp_transport").as_deref(), Some("udp"));
        assert_eq!(find("-hls_time").as_deref(), Some("30"));
        assert_eq!(find("-hls_list_size").as_deref(), Some("5760"));
        assert_eq!(find("-start_number").as_deref(), Some("17"));
        assert_eq!(find("-hls_flags").as_deref(), Some("append_list"));
        assert_eq!(args.last().map(String::as_str), Some("/rec/dvr/dvr.m3u8"));
    }

    #[test]
    fn delete_flag_switches_eviction_ownership() {
        let mut settings = settings();
        settings.encoder_deletes_segments = true;
        let args = settings.invocation().args;
        assert!(args.contains(&"delete_segments+append_list".to_string()));
    }
}
