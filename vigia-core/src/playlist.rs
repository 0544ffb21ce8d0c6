use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs as async_fs;
use tracing::{debug, warn};

use crate::segment::SegmentMap;

#[derive(Debug, Error)]
pub enum PlaylistError {
    #[error("failed to read manifest {path}: {source}")]
    Read { source: io::Error, path: PathBuf },
    #[error("failed to write manifest {path}: {source}")]
    Write { source: io::Error, path: PathBuf },
    #[error("malformed manifest line {line}: {reason}")]
    Parse { line: usize, reason: String },
    #[error("manifest write task was cancelled")]
    Cancelled,
}

pub type PlaylistResult<T> = Result<T, PlaylistError>;

/// One `(duration, reference)` pair of the manifest.
///
/// The duration is kept as the raw numeric text from the source line so that
/// parsing a manifest and re-serializing it yields byte-identical output.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestEntry {
    pub duration: String,
    pub uri: String,
}

impl ManifestEntry {
    pub fn duration_secs(&self) -> Option<f64> {
        self.duration.parse().ok()
    }
}

/// Ordered text index of segments with durations, readable by any standard
/// segmented-media player.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub version: u32,
    pub target_duration: u32,
    pub media_sequence: u64,
    pub entries: Vec<ManifestEntry>,
    pub end_list: bool,
}

impl Manifest {
    pub fn new(target_duration: u32) -> Self {
        Self {
            version: 3,
            target_duration,
            media_sequence: 0,
            entries: Vec::new(),
            end_list: false,
        }
    }

    pub fn parse(text: &str) -> PlaylistResult<Self> {
        let mut manifest = Manifest::new(0);
        let mut pending_duration: Option<String> = None;
        let mut saw_header = false;

        for (number, raw) in text.lines().enumerate() {
            let line = raw.trim_end();
            if line.is_empty() {
                continue;
            }
            if line == "#EXTM3U" {
                saw_header = true;
            } else if let Some(value) = line.strip_prefix("#EXT-X-VERSION:") {
                manifest.version = parse_field(value, number, "version")?;
            } else if let Some(value) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
                manifest.target_duration = parse_field(value, number, "target duration")?;
            } else if let Some(value) = line.strip_prefix("#EXT-X-MEDIA-SEQUENCE:") {
                manifest.media_sequence = parse_field(value, number, "media sequence")?;
            } else if let Some(value) = line.strip_prefix("#EXTINF:") {
                let duration = value.split(',').next().unwrap_or(value).trim();
                pending_duration = Some(duration.to_string());
            } else if line == "#EXT-X-ENDLIST" {
                manifest.end_list = true;
            } else if line.starts_with('#') {
                // Other directives (playlist type, cache hints) are dropped;
                // the maintainer owns the manifest from here on.
                continue;
            } else {
                let duration = pending_duration.take().ok_or(PlaylistError::Parse {
                    line: number + 1,
                    reason: format!("segment reference {line} without #EXTINF"),
                })?;
                manifest.entries.push(ManifestEntry {
                    duration,
                    uri: line.to_string(),
                });
            }
        }

        if !saw_header {
            return Err(PlaylistError::Parse {
                line: 1,
                reason: "missing #EXTM3U header".to_string(),
            });
        }
        Ok(manifest)
    }

    pub fn serialize(&self) -> String {
        let mut out = String::new();
        out.push_str("#EXTM3U\n");
        out.push_str(&format!("#EXT-X-VERSION:{}\n", self.version));
        out.push_str(&format!("#EXT-X-TARGETDURATION:{}\n", self.target_duration));
        out.push_str(&format!("#EXT-X-MEDIA-SEQUENCE:{}\n", self.media_sequence));
        for entry in &self.entries {
            out.push_str(&format!("#EXTINF:{},\n{}\n", entry.duration, entry.uri));
        }
        if self.end_list {
            out.push_str("#EXT-X-ENDLIST\n");
        }
        out
    }

    pub async fn load(path: &Path) -> PlaylistResult<Option<Self>> {
        match async_fs::read_to_string(path).await {
            Ok(text) => Manifest::parse(&text).map(Some),
            Err(source) if source.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(PlaylistError::Read {
                source,
                path: path.to_path_buf(),
            }),
        }
    }
}

fn parse_field<T: std::str::FromStr>(
    value: &str,
    line: usize,
    what: &str,
) -> PlaylistResult<T> {
    value.trim().parse().map_err(|_| PlaylistError::Parse {
        line: line + 1,
        reason: format!("invalid {what}: {value}"),
    })
}

/// Rewrites the manifest for one stream tag so every entry refers to a
/// segment that still exists on disk.
#[derive(Debug, Clone)]
pub struct PlaylistMaintainer {
    path: PathBuf,
    target_duration: u32,
    default_duration: String,
}

impl PlaylistMaintainer {
    pub fn new(path: PathBuf, segment_duration_secs: u64) -> Self {
        Self {
            path,
            target_duration: segment_duration_secs as u32,
            // ffmpeg writes EXTINF durations with six decimals; new entries
            // whose true duration is unknown get the nominal one.
            default_duration: format!("{:.6}", segment_duration_secs as f64),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes a manifest with exactly one entry per retained segment, in
    /// ascending chronological order.
    ///
    /// Duration metadata for entries that were already listed is recovered
    /// from the previous manifest; references to evicted segments are
    /// dropped together with their duration lines. The write goes through a
    /// temporary file and an atomic rename, so a reader never observes a
    /// partial manifest and the previous one stays valid if the write fails.
    pub async fn rewrite(&self, map: &SegmentMap) -> PlaylistResult<usize> {
        let known_durations: HashMap<String, String> = match Manifest::load(&self.path).await {
            Ok(Some(previous)) => previous
                .entries
                .into_iter()
                .map(|entry| (entry.uri, entry.duration))
                .collect(),
            Ok(None) => HashMap::new(),
            Err(error) => {
                // A corrupt manifest only costs the recovered durations.
                warn!(path = %self.path.display(), %error, "ignoring unreadable manifest");
                HashMap::new()
            }
        };

        let mut manifest = Manifest::new(self.target_duration);
        for segment in map.chronological() {
            let uri = segment
                .path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            let duration = known_durations
                .get(&uri)
                .cloned()
                .unwrap_or_else(|| self.default_duration.clone());
            manifest.entries.push(ManifestEntry { duration, uri });
        }

        let written = manifest.entries.len();
        let content = manifest.serialize();
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, content.as_bytes()))
            .await
            .map_err(|_| PlaylistError::Cancelled)??;
        debug!(path = %self.path.display(), entries = written, "manifest rewritten");
        Ok(written)
    }
}

fn write_atomic(path: &Path, content: &[u8]) -> PlaylistResult<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let map_err = |source: io::Error| PlaylistError::Write {
        source,
        path: path.to_path_buf(),
    };
    let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(map_err)?;
    temp.write_all(content).map_err(map_err)?;
    temp.persist(path)
        .map_err(|error| PlaylistError::Write {
            source: error.error,
            path: path.to_path_buf(),
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "#EXTM3U\n\
        #EXT-X-VERSION:3\n\
        #EXT-X-TARGETDURATION:30\n\
        #EXT-X-MEDIA-SEQUENCE:0\n\
        #EXTINF:30.000000,\n\
        dvr_0.ts\n\
        #EXTINF:29.960000,\n\
        dvr_1.ts\n";

    #[test]
    fn parse_then_serialize_is_byte_identical() {
        let manifest = Manifest::parse(SAMPLE).unwrap();
        assert_eq!(manifest.entries.len(), 2);
        assert_eq!(manifest.serialize(), SAMPLE);
    }

    #[test]
    fn parse_preserves_raw_duration_text() {
        let manifest = Manifest::parse(SAMPLE).unwrap();
        assert_eq!(manifest.entries[1].duration, "29.960000");
        assert_eq!(manifest.entries[1].duration_secs(), Some(29.96));
    }

    #[test]
    fn end_list_survives_round_trip() {
        let text = format!("{SAMPLE}#EXT-X-ENDLIST\n");
        let manifest = Manifest::parse(&text).unwrap();
        assert!(manifest.end_list);
        assert_eq!(manifest.serialize(), text);
    }

    #[test]
    fn segment_reference_without_extinf_is_rejected() {
        let text = "#EXTM3U\n#EXT-X-VERSION:3\ndvr_0.ts\n";
        assert!(matches!(
            Manifest::parse(text),
            Err(PlaylistError::Parse { .. })
        ));
    }

    #[test]
    fn missing_header_is_rejected() {
        assert!(Manifest::parse("#EXT-X-VERSION:3\n").is_err());
    }
}
