//! Structured pipeline records and rolling statistics

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use flume::Sender;
use ringbuf::traits::{Consumer, RingBuffer};
use ringbuf::HeapRb;

use crate::capture::frame::{Eye, StereoIds};
use crate::display::fence::LatencySample;

/// Records emitted by the pipeline as values, so callers and tests can observe
/// them instead of scraping logs.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    Submitted { ids: StereoIds, surfaces: usize },
    /// `skipped` stale frames discarded by one scheduling cycle.
    Dropped { skipped: u64, total: u64 },
    Latency(LatencySample),
    CaptureFault { eye: Eye, reason: String },
}

/// Snapshot of the pipeline's counters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineStats {
    pub submitted_frames: u64,
    pub dropped_frames: u64,
    pub last_submitted: StereoIds,
    pub latency_samples: u64,
    pub unknown_latency: u64,
    pub avg_latency_ms: f64,
    pub p99_latency_ms: f64,
}

/// Read side of the published statistics
#[derive(Clone)]
pub struct StatsHandle(Arc<ArcSwap<PipelineStats>>);

impl StatsHandle {
    pub fn load(&self) -> Arc<PipelineStats> {
        self.0.load_full()
    }
}

/// Owned by the scheduler; updates counters, metrics and the published snapshot
pub struct StatsRecorder {
    window: HeapRb<Duration>,
    stats: PipelineStats,
    snapshot: Arc<ArcSwap<PipelineStats>>,
    events: Option<Sender<PipelineEvent>>,
}

impl StatsRecorder {
    pub fn new(window: usize, events: Option<Sender<PipelineEvent>>) -> Self {
        Self {
            window: HeapRb::new(window.max(1)),
            stats: PipelineStats::default(),
            snapshot: Arc::new(ArcSwap::from_pointee(PipelineStats::default())),
            events,
        }
    }

    pub fn handle(&self) -> StatsHandle {
        StatsHandle(self.snapshot.clone())
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn record_submit(&mut self, ids: StereoIds, surfaces: usize) {
        self.stats.submitted_frames += 1;
        self.stats.last_submitted = ids;
        metrics::counter!("submitted_frames").increment(1);
        self.emit(PipelineEvent::Submitted { ids, surfaces });
    }

    pub fn record_dropped(&mut self, skipped: u64) {
        if skipped == 0 {
            return;
        }
        self.stats.dropped_frames += skipped;
        metrics::counter!("dropped_frames").increment(skipped);
        self.emit(PipelineEvent::Dropped {
            skipped,
            total: self.stats.dropped_frames,
        });
    }

    pub fn record_latency(&mut self, sample: LatencySample) {
        match sample.submit_to_complete {
            Some(latency) => {
                self.stats.latency_samples += 1;
                self.window.push_overwrite(latency);
                metrics::histogram!("frame_latency_ms").record(latency.as_secs_f64() * 1e3);
                if let Some(glass) = sample.capture_to_complete {
                    metrics::histogram!("capture_to_complete_ms").record(glass.as_secs_f64() * 1e3);
                }
            }
            None => self.stats.unknown_latency += 1,
        }
        self.emit(PipelineEvent::Latency(sample));
    }

    /// Recomputes the rolling figures and swaps in a new snapshot.
    pub fn publish(&mut self) {
        let mut samples: Vec<Duration> = self.window.iter().copied().collect();
        if !samples.is_empty() {
            samples.sort_unstable();
            let total: Duration = samples.iter().sum();
            self.stats.avg_latency_ms = total.as_secs_f64() * 1e3 / samples.len() as f64;
            let rank = ((samples.len() as f64) * 0.99).ceil() as usize;
            self.stats.p99_latency_ms = samples[rank.saturating_sub(1)].as_secs_f64() * 1e3;
        }
        self.snapshot.store(Arc::new(self.stats.clone()));
    }

    fn emit(&self, event: PipelineEvent) {
        if let Some(events) = &self.events {
            let _ = events.try_send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ms: u64) -> LatencySample {
        LatencySample {
            surface: 0,
            frame_ids: StereoIds::new(1, 1),
            submit_to_complete: Some(Duration::from_millis(ms)),
            capture_to_complete: None,
        }
    }

    #[test]
    fn window_keeps_only_recent_samples() {
        let mut recorder = StatsRecorder::new(4, None);
        for ms in [100, 1, 2, 3, 4] {
            recorder.record_latency(sample(ms));
        }
        recorder.publish();

        let stats = recorder.handle().load();
        assert_eq!(stats.latency_samples, 5);
        assert!((stats.avg_latency_ms - 2.5).abs() < 1e-6);
        assert!((stats.p99_latency_ms - 4.0).abs() < 1e-6);
    }

    #[test]
    fn unknown_latency_stays_out_of_the_figures() {
        let mut recorder = StatsRecorder::new(8, None);
        recorder.record_latency(sample(10));
        recorder.record_latency(LatencySample {
            submit_to_complete: None,
            ..sample(0)
        });
        recorder.publish();

        let stats = recorder.handle().load();
        assert_eq!(stats.latency_samples, 1);
        assert_eq!(stats.unknown_latency, 1);
        assert!((stats.avg_latency_ms - 10.0).abs() < 1e-6);
        assert!((stats.p99_latency_ms - 10.0).abs() < 1e-6);
    }

    #[test]
    fn drops_are_emitted_with_running_total() {
        let (tx, rx) = flume::unbounded();
        let mut recorder = StatsRecorder::new(8, Some(tx));
        recorder.record_dropped(0);
        recorder.record_dropped(3);
        recorder.record_dropped(2);

        let events: Vec<_> = rx.drain().collect();
        assert_eq!(
            events,
            vec![
                PipelineEvent::Dropped { skipped: 3, total: 3 },
                PipelineEvent::Dropped { skipped: 2, total: 5 },
            ]
        );
    }
}
