use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TagParseError {
    #[error("invalid stream tag: {0}")]
    Invalid(String),
}

/// The two independent output streams produced from one camera source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamTag {
    Dvr,
    Live,
}

impl StreamTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamTag::Dvr => "dvr",
            StreamTag::Live => "live",
        }
    }

    pub const ALL: [StreamTag; 2] = [StreamTag::Dvr, StreamTag::Live];
}

impl std::fmt::Display for StreamTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for StreamTag {
    type Err = TagParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dvr" => Ok(Self::Dvr),
            "live" => Ok(Self::Live),
            other => Err(TagParseError::Invalid(other.to_string())),
        }
    }
}

/// Deterministic `index -> filename` mapping for one stream tag.
///
/// The mapping is stable across restarts so a startup rescan can attribute
/// every existing file back to its index.
#[derive(Debug, Clone)]
pub struct SegmentNaming {
    tag: StreamTag,
    pattern: Regex,
}

impl SegmentNaming {
    pub fn new(tag: StreamTag) -> Self {
        let pattern = Regex::new(&format!(r"^{}_(\d+)\.ts$", tag.as_str()))
            .expect("segment naming pattern is valid");
        Self { tag, pattern }
    }

    pub fn tag(&self) -> StreamTag {
        self.tag
    }

    pub fn segment_file_name(&self, index: u64) -> String {
        format!("{}_{}.ts", self.tag.as_str(), index)
    }

    pub fn thumbnail_file_name(&self, index: u64) -> String {
        format!("{}_{}.jpg", self.tag.as_str(), index)
    }

    /// Filename pattern handed to the external encoder (`%d` = segment index).
    pub fn encoder_pattern(&self) -> String {
        format!("{}_%d.ts", self.tag.as_str())
    }

    pub fn playlist_file_name(&self) -> String {
        format!("{}.m3u8", self.tag.as_str())
    }

    /// Recovers the segment index from a directory entry name, or `None`
    /// when the file does not belong to this stream.
    pub fn parse_index(&self, file_name: &str) -> Option<u64> {
        let captures = self.pattern.captures(file_name)?;
        captures.get(1)?.as_str().parse().ok()
    }
}

/// One media chunk on disk.
#[derive(Debug, Clone, Serialize)]
pub struct Segment {
    pub index: u64,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    /// Sibling image with the same lifecycle as the segment, if present.
    pub thumbnail_path: Option<PathBuf>,
}

/// Ordered-by-index map of the currently retained segments for one tag.
///
/// The filesystem is the ground truth; this is a rebuildable index over it,
/// owned exclusively by the retention engine for the tag.
#[derive(Debug, Clone, Default)]
pub struct SegmentMap {
    entries: BTreeMap<u64, Segment>,
}

impl SegmentMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, index: u64) -> bool {
        self.entries.contains_key(&index)
    }

    pub fn get(&self, index: u64) -> Option<&Segment> {
        self.entries.get(&index)
    }

    pub fn insert(&mut self, segment: Segment) {
        self.entries.insert(segment.index, segment);
    }

    pub fn remove(&mut self, index: u64) -> Option<Segment> {
        self.entries.remove(&index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Segment> {
        self.entries.values()
    }

    pub fn indices(&self) -> impl Iterator<Item = u64> + '_ {
        self.entries.keys().copied()
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.values().map(|segment| segment.size_bytes).sum()
    }

    /// Entry with the lowest creation timestamp; ties resolve to the lowest
    /// index so eviction order stays deterministic.
    pub fn oldest(&self) -> Option<&Segment> {
        self.entries
            .values()
            .min_by_key(|segment| (segment.created_at, segment.index))
    }

    pub fn newest(&self) -> Option<&Segment> {
        self.entries
            .values()
            .max_by_key(|segment| (segment.created_at, segment.index))
    }

    /// Smallest index in `[0, limit)` not currently occupied.
    pub fn smallest_unused_index(&self, limit: u64) -> u64 {
        (0..limit)
            .find(|index| !self.entries.contains_key(index))
            .unwrap_or(limit)
    }

    /// Retained segments in ascending creation order (the playlist order).
    pub fn chronological(&self) -> Vec<&Segment> {
        let mut segments: Vec<&Segment> = self.entries.values().collect();
        segments.sort_by_key(|segment| (segment.created_at, segment.index));
        segments
    }
}
