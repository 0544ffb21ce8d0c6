use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::fs as async_fs;
use tracing::debug;

use crate::segment::{Segment, SegmentMap, SegmentNaming, StreamTag};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to create segment store {path}: {source}")]
    Create { source: io::Error, path: PathBuf },
    #[error("failed to scan segment store {path}: {source}")]
    Scan { source: io::Error, path: PathBuf },
    #[error("failed to remove {path}: {source}")]
    Remove { source: io::Error, path: PathBuf },
    #[error("segment store scan task was cancelled")]
    Cancelled,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Filesystem directory holding the numbered segment files for one stream
/// tag, plus an optional thumbnail sibling per segment.
///
/// The directory is the single source of truth shared across process
/// restarts; everything else is rebuilt from `scan`.
#[derive(Debug, Clone)]
pub struct SegmentStore {
    dir: PathBuf,
    naming: SegmentNaming,
}

impl SegmentStore {
    pub fn new<P: AsRef<Path>>(recordings_root: P, tag: StreamTag) -> Self {
        Self {
            dir: recordings_root.as_ref().join(tag.as_str()),
            naming: SegmentNaming::new(tag),
        }
    }

    pub fn tag(&self) -> StreamTag {
        self.naming.tag()
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    pub fn naming(&self) -> &SegmentNaming {
        &self.naming
    }

    pub fn segment_path(&self, index: u64) -> PathBuf {
        self.dir.join(self.naming.segment_file_name(index))
    }

    pub fn thumbnail_path(&self, index: u64) -> PathBuf {
        self.dir.join(self.naming.thumbnail_file_name(index))
    }

    pub fn playlist_path(&self) -> PathBuf {
        self.dir.join(self.naming.playlist_file_name())
    }

    pub async fn ensure_dir(&self) -> StoreResult<()> {
        async_fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| StoreError::Create {
                source,
                path: self.dir.clone(),
            })
    }

    /// Rescans the directory and rebuilds the segment map from `stat`
    /// results. Entries that do not match the naming convention are ignored.
    ///
    /// Directory listing plus a stat per file is blocking I/O, so the whole
    /// walk runs on the blocking pool.
    pub async fn scan(&self) -> StoreResult<SegmentMap> {
        let dir = self.dir.clone();
        let naming = self.naming.clone();
        tokio::task::spawn_blocking(move || scan_blocking(&dir, &naming))
            .await
            .map_err(|_| StoreError::Cancelled)?
    }

    /// Deletes a segment file and its thumbnail, returning the bytes freed.
    ///
    /// A file that is already gone counts as evicted: a previous sweep or an
    /// external process may have removed it first.
    pub async fn remove(&self, segment: &Segment) -> StoreResult<u64> {
        let mut reclaimed = 0;
        match async_fs::remove_file(&segment.path).await {
            Ok(()) => reclaimed += segment.size_bytes,
            Err(source) if source.kind() == io::ErrorKind::NotFound => {
                debug!(path = %segment.path.display(), "segment already removed");
            }
            Err(source) => {
                return Err(StoreError::Remove {
                    source,
                    path: segment.path.clone(),
                })
            }
        }
        if let Some(thumbnail) = &segment.thumbnail_path {
            match async_fs::remove_file(thumbnail).await {
                Ok(()) => {}
                Err(source) if source.kind() == io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(StoreError::Remove {
                        source,
                        path: thumbnail.clone(),
                    })
                }
            }
        }
        Ok(reclaimed)
    }
}

fn scan_blocking(dir: &Path, naming: &SegmentNaming) -> StoreResult<SegmentMap> {
    let mut map = SegmentMap::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(source) if source.kind() == io::ErrorKind::NotFound => return Ok(map),
        Err(source) => {
            return Err(StoreError::Scan {
                source,
                path: dir.to_path_buf(),
            })
        }
    };
    for entry in entries {
        let entry = entry.map_err(|source| StoreError::Scan {
            source,
            path: dir.to_path_buf(),
        })?;
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        let Some(index) = naming.parse_index(name) else {
            continue;
        };
        // A file can disappear between the listing and the stat; that is
        // drift, not an error, and the next sweep settles it.
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let created = metadata
            .created()
            .or_else(|_| metadata.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let thumbnail = dir.join(naming.thumbnail_file_name(index));
        map.insert(Segment {
            index,
            path: entry.path(),
            created_at: DateTime::<Utc>::from(created),
            size_bytes: metadata.len(),
            thumbnail_path: thumbnail.exists().then_some(thumbnail),
        });
    }
    Ok(map)
}
