use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration as StdDuration;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::playlist::PlaylistMaintainer;
use crate::segment::{Segment, SegmentMap, StreamTag};
use crate::store::{SegmentStore, StoreError};

#[derive(Debug, Error)]
pub enum RetentionError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub type RetentionResult<T> = Result<T, RetentionError>;

/// Time/count budget for one stream tag.
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    segment_duration: StdDuration,
    max_age: StdDuration,
}

impl RetentionPolicy {
    /// Long-window policy: keep everything younger than `max_age`.
    pub fn from_age(segment_duration: StdDuration, max_age: StdDuration) -> Self {
        Self {
            segment_duration,
            max_age,
        }
    }

    /// Short-window policy: keep a fixed number of segments. An absurd count
    /// from a bad config saturates rather than overflowing.
    pub fn from_count(segment_duration: StdDuration, count: usize) -> Self {
        let max_age = u32::try_from(count)
            .ok()
            .and_then(|count| segment_duration.checked_mul(count))
            .unwrap_or(StdDuration::MAX);
        Self {
            segment_duration,
            max_age,
        }
    }

    pub fn segment_duration(&self) -> StdDuration {
        self.segment_duration
    }

    pub fn max_age(&self) -> StdDuration {
        self.max_age
    }

    pub fn max_segments(&self) -> usize {
        if self.segment_duration.is_zero() {
            return 0;
        }
        (self.max_age.as_secs_f64() / self.segment_duration.as_secs_f64()).floor() as usize
    }
}

/// Outcome of one reconciliation sweep.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ReconcileReport {
    pub retained: usize,
    pub evicted: usize,
    pub reclaimed_bytes: u64,
    /// Files on disk that the previous committed map did not know about.
    pub appeared: usize,
    /// Entries of the previous committed map that vanished from disk.
    pub vanished: usize,
}

/// Decides which segment indices are live, evicts over-budget segments
/// (files and thumbnails), and keeps the manifest consistent with disk.
///
/// Exclusively owns the segment map for its tag. All state is rebuilt from
/// the segment store on every sweep, so an arbitrary process or host restart
/// costs nothing but one reconciliation.
pub struct RetentionEngine {
    tag: StreamTag,
    store: SegmentStore,
    policy: RetentionPolicy,
    playlist: PlaylistMaintainer,
    /// Committed snapshot: the map as of the most recent completed sweep.
    map: Mutex<SegmentMap>,
    /// Single-flight gate; see `reconcile`.
    gate: tokio::sync::Mutex<()>,
    pending: AtomicBool,
    last_report: Mutex<ReconcileReport>,
}

impl RetentionEngine {
    pub fn new(store: SegmentStore, policy: RetentionPolicy) -> Self {
        let playlist = PlaylistMaintainer::new(
            store.playlist_path(),
            policy.segment_duration().as_secs(),
        );
        Self {
            tag: store.tag(),
            store,
            policy,
            playlist,
            map: Mutex::new(SegmentMap::new()),
            gate: tokio::sync::Mutex::new(()),
            pending: AtomicBool::new(false),
            last_report: Mutex::new(ReconcileReport::default()),
        }
    }

    pub fn tag(&self) -> StreamTag {
        self.tag
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    pub fn store(&self) -> &SegmentStore {
        &self.store
    }

    /// Snapshot of the map as of the most recent completed sweep.
    pub fn snapshot(&self) -> SegmentMap {
        self.map.lock().unwrap().clone()
    }

    pub fn last_report(&self) -> ReconcileReport {
        *self.last_report.lock().unwrap()
    }

    /// Rescans the store without applying the policy or touching any file.
    pub async fn inspect(&self) -> RetentionResult<SegmentMap> {
        Ok(self.store.scan().await?)
    }

    /// Index for the next segment the encoder should write.
    ///
    /// Below capacity this is the smallest unused index in
    /// `[0, max_segments)`; at capacity it is the index of the oldest
    /// retained entry, so the slot count never grows past the budget
    /// (ring-buffer reuse).
    pub fn allocate_next_index(&self) -> u64 {
        let map = self.map.lock().unwrap();
        let max = self.policy.max_segments() as u64;
        if (map.len() as u64) < max {
            map.smallest_unused_index(max)
        } else {
            map.oldest().map(|segment| segment.index).unwrap_or(0)
        }
    }

    /// Rebuilds the segment map from disk, applies the retention policy,
    /// and rewrites the manifest.
    ///
    /// Single-flight: a call that lands while a sweep is in flight collapses
    /// into "run once more after this one finishes". Two sweeps for the same
    /// tag never run concurrently, and eviction always precedes the playlist
    /// rewrite that drops the evicted references.
    pub async fn reconcile(&self) -> RetentionResult<ReconcileReport> {
        self.pending.store(true, Ordering::SeqCst);
        let _guard = self.gate.lock().await;
        if !self.pending.swap(false, Ordering::SeqCst) {
            // A sweep that started after this trigger already covered it.
            return Ok(self.last_report());
        }

        let report = self.sweep().await?;
        *self.last_report.lock().unwrap() = report;

        // Rewrite failures leave the previous manifest intact; the next
        // sweep retries with the same committed map.
        let snapshot = self.snapshot();
        if let Err(error) = self.playlist.rewrite(&snapshot).await {
            warn!(tag = %self.tag, %error, "manifest rewrite failed; will retry");
        }
        Ok(report)
    }

    async fn sweep(&self) -> RetentionResult<ReconcileReport> {
        self.store.ensure_dir().await?;
        let scanned = self.store.scan().await?;
        let now = Utc::now();

        let previous: BTreeSet<u64> = {
            let map = self.map.lock().unwrap();
            map.indices().collect()
        };
        let current: BTreeSet<u64> = scanned.indices().collect();
        let appeared = current.difference(&previous).count();
        let vanished = previous.difference(&current).count();
        if vanished > 0 {
            warn!(
                tag = %self.tag,
                vanished,
                "segments disappeared outside a sweep; map rebuilt from disk"
            );
        }

        let mut retained = SegmentMap::new();
        let mut evict: Vec<Segment> = Vec::new();
        for segment in scanned.iter() {
            let age = now
                .signed_duration_since(segment.created_at)
                .to_std()
                .unwrap_or_default();
            if segment.size_bytes == 0 && age > self.policy.segment_duration() {
                // Corrupt leftover from an interrupted encoder write. A
                // just-opened file is legitimately empty for up to one
                // segment duration, and the segment-open fast path can sweep
                // at exactly that moment.
                evict.push(segment.clone());
            } else if age > self.policy.max_age() {
                evict.push(segment.clone());
            } else {
                retained.insert(segment.clone());
            }
        }

        let max = self.policy.max_segments();
        while retained.len() > max {
            let oldest = retained
                .oldest()
                .map(|segment| segment.index)
                .expect("non-empty map has an oldest entry");
            if let Some(segment) = retained.remove(oldest) {
                evict.push(segment);
            }
        }

        let mut evicted = 0;
        let mut reclaimed_bytes = 0;
        for segment in evict {
            match self.store.remove(&segment).await {
                Ok(bytes) => {
                    evicted += 1;
                    reclaimed_bytes += bytes;
                }
                Err(error) => {
                    // Deletion trouble is retried on the next sweep. The file
                    // is still on disk, so it stays in the map and the
                    // manifest keeps resolving.
                    warn!(tag = %self.tag, %error, "eviction skipped");
                    retained.insert(segment);
                }
            }
        }

        let report = ReconcileReport {
            retained: retained.len(),
            evicted,
            reclaimed_bytes,
            appeared,
            vanished,
        };
        *self.map.lock().unwrap() = retained;

        if evicted > 0 {
            info!(
                tag = %self.tag,
                evicted,
                reclaimed_bytes,
                retained = report.retained,
                "retention sweep evicted segments"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_segments_matches_the_48_hour_window() {
        let policy = RetentionPolicy::from_age(
            StdDuration::from_secs(30),
            StdDuration::from_secs(48 * 3600),
        );
        assert_eq!(policy.max_segments(), 5760);
    }

    #[test]
    fn count_policy_round_trips_the_window() {
        let policy = RetentionPolicy::from_count(StdDuration::from_secs(2), 6);
        assert_eq!(policy.max_segments(), 6);
        assert_eq!(policy.max_age(), StdDuration::from_secs(12));
    }

    #[test]
    fn count_policy_saturates_on_absurd_windows() {
        let policy = RetentionPolicy::from_count(StdDuration::from_secs(30), usize::MAX);
        assert_eq!(policy.max_age(), StdDuration::MAX);

        let policy = RetentionPolicy::from_count(StdDuration::from_secs(u64::MAX / 2), 3);
        assert_eq!(policy.max_age(), StdDuration::MAX);
    }
}
