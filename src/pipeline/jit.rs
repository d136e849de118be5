//! Just-in-time presentation scheduler
//!
//! Each cycle waits for new frames, then holds the submission back until the
//! next vblank is inside the submission window. While it waits it keeps
//! polling the streams and moves on to the newest frames it sees, counting
//! every frame it skips as dropped. Frames are never queued.

use std::thread;
use std::time::{Duration, Instant};

use crossbeam::utils::Backoff;
use tracing::{debug, info, warn};

use crate::capture::exchange::StereoReader;
use crate::capture::frame::{Eye, StereoIds};
use crate::display::RenderBackend;
use crate::error::DisplayError;
use crate::lifecycle::Shutdown;
use crate::pipeline::stats::{StatsHandle, StatsRecorder};
use crate::pipeline::vblank::VblankClock;
use crate::PipelineConfig;

/// What one scheduler cycle did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// No stream advanced since the last submission.
    Idle,
    Submitted {
        ids: StereoIds,
        dropped: u64,
        surfaces: usize,
    },
    /// A surface's window asked to close.
    Closed,
}

/// Totals for one `run_until` call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub cycles: u64,
    pub submitted: u64,
    pub dropped: u64,
    pub idle_cycles: u64,
    pub render_failures: u64,
    /// Distinct frame identifiers seen per stream, left then right.
    pub observed: [u64; 2],
    pub last_submitted: StereoIds,
    pub close_requested: bool,
}

pub struct JitScheduler<C: VblankClock> {
    backend: Box<dyn RenderBackend>,
    frames: StereoReader,
    clock: C,
    stats: StatsRecorder,
    submit_window: Duration,
    poll_interval: Duration,
    gpu_wait: Duration,
    frame_timing: bool,
    shutdown: Option<Shutdown>,
    last_submitted: StereoIds,
    last_seen: StereoIds,
    report: RunReport,
}

impl<C: VblankClock> JitScheduler<C> {
    pub fn new(
        backend: Box<dyn RenderBackend>,
        frames: StereoReader,
        clock: C,
        config: &PipelineConfig,
        stats: StatsRecorder,
    ) -> Self {
        Self {
            backend,
            frames,
            clock,
            stats,
            submit_window: config.submit_window(),
            poll_interval: config.poll_interval(),
            gpu_wait: config.gpu_wait_interval(),
            frame_timing: false,
            shutdown: None,
            last_submitted: StereoIds::default(),
            last_seen: StereoIds::default(),
            report: RunReport::default(),
        }
    }

    pub fn with_frame_timing(mut self, enabled: bool) -> Self {
        self.frame_timing = enabled;
        self
    }

    /// Stops `run_until` and the active-drop phase when it fires.
    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn stats(&self) -> StatsHandle {
        self.stats.handle()
    }

    pub fn last_submitted(&self) -> StereoIds {
        self.last_submitted
    }

    pub fn dropped_frames(&self) -> u64 {
        self.stats.stats().dropped_frames
    }

    pub fn backend(&self) -> &dyn RenderBackend {
        self.backend.as_ref()
    }

    fn is_running(&self) -> bool {
        self.shutdown.as_ref().map_or(true, Shutdown::is_running)
    }

    fn note_observed(&mut self, ids: StereoIds) {
        for eye in Eye::BOTH {
            if ids.get(eye) > self.last_seen.get(eye) {
                self.report.observed[eye.index()] += 1;
            }
        }
        self.last_seen = ids;
    }

    fn drain_completions(&mut self) {
        for sample in self.backend.poll_completed() {
            if self.frame_timing {
                debug!(
                    surface = sample.surface,
                    ids = ?sample.frame_ids,
                    latency_us = sample.submit_to_complete.map(|d| d.as_micros() as u64),
                    "frame completed"
                );
            }
            self.stats.record_latency(sample);
        }
    }

    /// One scheduling decision: idle, or submit the freshest frame pair.
    pub fn run_cycle(&mut self) -> Result<CycleOutcome, DisplayError> {
        self.backend.poll_events();
        if self.backend.should_close() {
            return Ok(CycleOutcome::Closed);
        }
        self.drain_completions();

        let ids = self.frames.latest_ids();
        self.note_observed(ids);
        if !ids.is_ready() || !ids.advanced_since(&self.last_submitted) {
            thread::sleep(self.poll_interval);
            return Ok(CycleOutcome::Idle);
        }

        // Too early for the next vblank: keep swapping in newer frames.
        let mut candidate = ids;
        let mut dropped = 0;
        let spin_limit = Instant::now() + self.clock.refresh_interval() + self.submit_window;
        let backoff = Backoff::new();
        while self.clock.time_until_vblank() > self.submit_window {
            if Instant::now() >= spin_limit || !self.is_running() {
                break;
            }
            let newest = self.frames.latest_ids();
            if newest.advanced_since(&candidate) {
                self.note_observed(newest);
                dropped += newest.distance_from(&candidate);
                candidate = newest;
                backoff.reset();
            } else {
                backoff.snooze();
            }
        }

        let gpu_limit = Instant::now() + self.clock.refresh_interval();
        while self.backend.is_saturated() && Instant::now() < gpu_limit {
            self.drain_completions();
            if !self.backend.is_saturated() {
                break;
            }
            thread::sleep(self.gpu_wait);
        }

        {
            let view = self.frames.read_latest();
            self.backend.upload_frame(&view)?;
        }

        let started = Instant::now();
        let presented = self.backend.render_and_present()?;
        let presented_at = Instant::now();
        self.clock.observe_present(presented_at);

        // Surfaces may sample newer frames than the last poll saw. Frames
        // older than the oldest one shown went out nowhere and count as dropped.
        let submitted = presented.newest;
        let surfaces = presented.surfaces;
        dropped += presented.oldest.distance_from(&candidate);
        self.note_observed(submitted);

        self.stats.record_dropped(dropped);
        self.stats.record_submit(submitted, surfaces);
        self.last_submitted = submitted;
        if self.frame_timing {
            debug!(
                ids = ?submitted,
                dropped,
                surfaces,
                render_us = (presented_at - started).as_micros() as u64,
                "frame submitted"
            );
        }

        self.drain_completions();
        self.stats.publish();
        Ok(CycleOutcome::Submitted {
            ids: submitted,
            dropped,
            surfaces,
        })
    }

    /// Runs cycles until the window closes, shutdown fires or `deadline` passes.
    pub fn run_until(&mut self, deadline: Option<Instant>) -> Result<RunReport, DisplayError> {
        info!(backend = self.backend.name(), surfaces = self.backend.surface_count(), "scheduler running");

        while self.is_running() && deadline.map_or(true, |d| Instant::now() < d) {
            self.report.cycles += 1;
            match self.run_cycle() {
                Ok(CycleOutcome::Closed) => {
                    info!("close requested");
                    self.report.close_requested = true;
                    break;
                }
                Ok(CycleOutcome::Idle) => self.report.idle_cycles += 1,
                Ok(CycleOutcome::Submitted { dropped, .. }) => {
                    self.report.submitted += 1;
                    self.report.dropped += dropped;
                }
                Err(e) if e.is_recoverable() => {
                    warn!(error = %e, "render cycle failed");
                    self.report.render_failures += 1;
                }
                Err(e) => return Err(e),
            }
        }

        // Pick up markers that signalled during the last cycle.
        self.drain_completions();
        self.stats.publish();
        self.report.last_submitted = self.last_submitted;

        let stats = self.stats.stats();
        info!(
            submitted = stats.submitted_frames,
            dropped = stats.dropped_frames,
            avg_latency_ms = stats.avg_latency_ms,
            p99_latency_ms = stats.p99_latency_ms,
            "scheduler stopped"
        );
        Ok(self.report.clone())
    }

    pub fn run_for(&mut self, duration: Duration) -> Result<RunReport, DisplayError> {
        self.run_until(Some(Instant::now() + duration))
    }

    pub fn shutdown(&mut self) -> Result<(), DisplayError> {
        self.backend.shutdown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::exchange::{exchange, FramePublisher};
    use crate::capture::frame::FrameFormat;
    use crate::display::headless;
    use crate::pipeline::vblank::RefreshClock;
    use crate::{DisplayConfig, RenderMode};

    const FORMAT: FrameFormat = FrameFormat::rgb(4, 2);

    fn frames() -> (FramePublisher, FramePublisher, StereoReader) {
        let (left, left_reader) = exchange(Eye::Left, FORMAT);
        let (right, right_reader) = exchange(Eye::Right, FORMAT);
        (left, right, StereoReader::new(left_reader, right_reader))
    }

    fn single_backend(frames: &StereoReader) -> Box<dyn RenderBackend> {
        let config = DisplayConfig {
            mode: RenderMode::Single,
            surfaces: 1,
            simulated_gpu_us: 0,
            ..Default::default()
        };
        headless::initialize(&config, FORMAT, frames.clone()).unwrap().0
    }

    fn scheduler(frames: &StereoReader) -> JitScheduler<RefreshClock> {
        JitScheduler::new(
            single_backend(frames),
            frames.clone(),
            RefreshClock::new(Duration::from_millis(16)),
            &PipelineConfig::default(),
            StatsRecorder::new(16, None),
        )
    }

    #[test]
    fn waits_until_both_streams_are_ready() {
        let (mut left, _right, frames) = frames();
        let mut scheduler = scheduler(&frames);

        assert_eq!(scheduler.run_cycle().unwrap(), CycleOutcome::Idle);
        left.publish(&[1; 24]).unwrap();
        assert_eq!(scheduler.run_cycle().unwrap(), CycleOutcome::Idle);
    }

    #[test]
    fn no_resubmission_without_new_frames() {
        let (mut left, mut right, frames) = frames();
        left.publish(&[1; 24]).unwrap();
        right.publish(&[1; 24]).unwrap();
        let mut scheduler = scheduler(&frames);

        assert!(matches!(
            scheduler.run_cycle().unwrap(),
            CycleOutcome::Submitted { ids, dropped: 0, surfaces: 1 } if ids == StereoIds::new(1, 1)
        ));
        assert_eq!(scheduler.run_cycle().unwrap(), CycleOutcome::Idle);
    }

    #[test]
    fn close_request_ends_the_run() {
        let (mut left, mut right, frames) = frames();
        left.publish(&[1; 24]).unwrap();
        right.publish(&[1; 24]).unwrap();

        let config = DisplayConfig {
            mode: RenderMode::Single,
            surfaces: 1,
            ..Default::default()
        };
        let (backend, probe) = headless::initialize(&config, FORMAT, frames.clone()).unwrap();
        let mut scheduler = JitScheduler::new(
            backend,
            frames,
            RefreshClock::new(Duration::from_millis(16)),
            &PipelineConfig::default(),
            StatsRecorder::new(16, None),
        );

        probe.request_close();
        let report = scheduler.run_for(Duration::from_secs(5)).unwrap();
        assert!(report.close_requested);
        assert_eq!(report.submitted, 0);
    }
}
