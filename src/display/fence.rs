//! GPU completion tracking
//!
//! Every present is followed by a fence. The tracker keeps at most
//! `depth` unresolved fences per surface and turns signalled ones into latency
//! samples without ever blocking: fences are only ever queried with a zero
//! timeout.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::capture::frame::StereoIds;

/// Result of a zero-timeout fence query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FenceStatus {
    Pending,
    Signaled,
    /// The wait itself failed (device lost, driver error).
    Failed(String),
    /// Nothing was presented, so there is no latency to measure.
    Skipped,
}

/// A GPU-side completion marker
pub trait GpuFence: Send {
    /// Non-blocking query.
    fn status(&self) -> FenceStatus;
}

/// A fence that is signalled from the start, for backends that finished synchronously.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignaledFence;

impl GpuFence for SignaledFence {
    fn status(&self) -> FenceStatus {
        FenceStatus::Signaled
    }
}

/// Stands in for a present that did not happen, e.g. a swapchain timeout.
#[derive(Debug, Clone, Copy, Default)]
pub struct SkippedFence;

impl GpuFence for SkippedFence {
    fn status(&self) -> FenceStatus {
        FenceStatus::Skipped
    }
}

/// One resolved completion marker
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencySample {
    pub surface: usize,
    pub frame_ids: StereoIds,
    /// Completion minus submission; `None` if the fence wait failed.
    pub submit_to_complete: Option<Duration>,
    /// Completion minus the capture instant of the older eye.
    pub capture_to_complete: Option<Duration>,
}

/// A present that has been handed to the GPU
pub struct Submission {
    pub fence: Box<dyn GpuFence>,
    pub submitted_at: Instant,
    pub frame_ids: StereoIds,
    pub captured_at: Option<Instant>,
}

impl Submission {
    pub fn new(fence: Box<dyn GpuFence>, frame_ids: StereoIds, captured_at: Option<Instant>) -> Self {
        Self {
            fence,
            submitted_at: Instant::now(),
            frame_ids,
            captured_at,
        }
    }
}

impl fmt::Debug for Submission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Submission")
            .field("submitted_at", &self.submitted_at)
            .field("frame_ids", &self.frame_ids)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct CompletionTracker {
    surfaces: Vec<VecDeque<Submission>>,
    depth: usize,
    stale_discarded: u64,
    failed: u64,
    skipped: u64,
}

impl CompletionTracker {
    pub fn new(surfaces: usize, depth: usize) -> Self {
        let depth = depth.max(1);
        Self {
            surfaces: (0..surfaces).map(|_| VecDeque::with_capacity(depth)).collect(),
            depth,
            stale_discarded: 0,
            failed: 0,
            skipped: 0,
        }
    }

    /// Records the marker inserted after a present on `surface`.
    ///
    /// If the surface already has `depth` unresolved markers, the oldest is
    /// discarded first. Returns whether that happened.
    pub fn fence_after_submit(&mut self, surface: usize, submission: Submission) -> bool {
        let Some(queue) = self.surfaces.get_mut(surface) else {
            warn!(surface, "fence for unknown surface ignored");
            return false;
        };

        let mut discarded = false;
        while queue.len() >= self.depth {
            if let Some(stale) = queue.pop_front() {
                debug!(surface, ids = ?stale.frame_ids, "discarding unresolved marker");
                self.stale_discarded += 1;
                discarded = true;
            }
        }
        queue.push_back(submission);
        discarded
    }

    /// Resolves every signalled or failed marker; pending ones stay.
    pub fn poll_completed(&mut self) -> Vec<LatencySample> {
        let now = Instant::now();
        let mut samples = Vec::new();

        for (surface, queue) in self.surfaces.iter_mut().enumerate() {
            let mut index = 0;
            while index < queue.len() {
                let sample = match queue[index].fence.status() {
                    FenceStatus::Pending => {
                        index += 1;
                        continue;
                    }
                    FenceStatus::Signaled => {
                        let done = &queue[index];
                        LatencySample {
                            surface,
                            frame_ids: done.frame_ids,
                            submit_to_complete: Some(now.saturating_duration_since(done.submitted_at)),
                            capture_to_complete: done
                                .captured_at
                                .map(|at| now.saturating_duration_since(at)),
                        }
                    }
                    FenceStatus::Skipped => {
                        debug!(surface, ids = ?queue[index].frame_ids, "present skipped");
                        self.skipped += 1;
                        LatencySample {
                            surface,
                            frame_ids: queue[index].frame_ids,
                            submit_to_complete: None,
                            capture_to_complete: None,
                        }
                    }
                    FenceStatus::Failed(reason) => {
                        warn!(surface, %reason, "fence wait failed, latency sample lost");
                        self.failed += 1;
                        LatencySample {
                            surface,
                            frame_ids: queue[index].frame_ids,
                            submit_to_complete: None,
                            capture_to_complete: None,
                        }
                    }
                };
                queue.remove(index);
                samples.push(sample);
            }
        }

        samples
    }

    pub fn outstanding(&self, surface: usize) -> usize {
        self.surfaces.get(surface).map_or(0, VecDeque::len)
    }

    pub fn total_outstanding(&self) -> usize {
        self.surfaces.iter().map(VecDeque::len).sum()
    }

    /// Some surface has used its whole in-flight depth.
    pub fn is_saturated(&self) -> bool {
        self.surfaces.iter().any(|q| q.len() >= self.depth)
    }

    pub fn stale_discarded(&self) -> u64 {
        self.stale_discarded
    }

    pub fn failed(&self) -> u64 {
        self.failed
    }

    /// Presents that never happened; their samples carry no latency.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn surface_count(&self) -> usize {
        self.surfaces.len()
    }

    /// Drops every marker, e.g. before the owning surfaces are destroyed.
    pub fn clear(&mut self) {
        self.surfaces.iter_mut().for_each(VecDeque::clear);
    }
}
