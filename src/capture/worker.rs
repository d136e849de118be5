//! Capture thread: open with retry, dequeue into the exchange, pace to the interval

use std::io;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use flume::Sender;
use tracing::{debug, info, warn};

use crate::capture::exchange::FramePublisher;
use crate::capture::frame::Eye;
use crate::capture::source::FrameSource;
use crate::lifecycle::Shutdown;
use crate::pipeline::stats::PipelineEvent;

/// What a capture thread did before it stopped
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureReport {
    pub open_attempts: u32,
    pub frames_published: u64,
    pub dequeue_failures: u64,
}

/// Owns one camera stream's source and publisher for the lifetime of its thread
pub struct CaptureWorker {
    source: Box<dyn FrameSource>,
    publisher: FramePublisher,
    interval: Duration,
    retry: Duration,
    frame_timing: bool,
    shutdown: Shutdown,
    events: Option<Sender<PipelineEvent>>,
}

impl CaptureWorker {
    pub fn new(
        source: Box<dyn FrameSource>,
        publisher: FramePublisher,
        interval: Duration,
        retry: Duration,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            source,
            publisher,
            interval,
            retry,
            frame_timing: false,
            shutdown,
            events: None,
        }
    }

    pub fn with_frame_timing(mut self, enabled: bool) -> Self {
        self.frame_timing = enabled;
        self
    }

    pub fn with_events(mut self, events: Sender<PipelineEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn eye(&self) -> Eye {
        self.publisher.eye()
    }

    pub fn spawn(self) -> io::Result<JoinHandle<CaptureReport>> {
        thread::Builder::new()
            .name(format!("capture-{}", self.eye().name()))
            .spawn(move || self.run())
    }

    /// Runs until the shutdown token fires.
    pub fn run(mut self) -> CaptureReport {
        let eye = self.eye();
        let mut report = CaptureReport::default();
        info!(eye = eye.name(), source = %self.source.describe(), "capture thread starting");

        loop {
            report.open_attempts += 1;
            match self.source.open() {
                Ok(()) => break,
                Err(e) => {
                    warn!(
                        eye = eye.name(),
                        attempt = report.open_attempts,
                        error = %e,
                        "camera is retrying connection"
                    );
                    self.emit(PipelineEvent::CaptureFault {
                        eye,
                        reason: e.to_string(),
                    });
                    if !self.shutdown.sleep(self.retry) {
                        return report;
                    }
                }
            }
        }
        info!(eye = eye.name(), attempts = report.open_attempts, "camera opened");

        while self.shutdown.is_running() {
            let started = Instant::now();

            let source = &mut self.source;
            match self.publisher.publish_with(|slot| source.dequeue_into(slot)) {
                Ok(id) => {
                    report.frames_published += 1;
                    if self.frame_timing {
                        debug!(
                            eye = eye.name(),
                            id,
                            elapsed_us = started.elapsed().as_micros() as u64,
                            "frame captured"
                        );
                    }
                }
                Err(e) => {
                    report.dequeue_failures += 1;
                    warn!(eye = eye.name(), error = %e, "frame dequeue failed");
                    self.emit(PipelineEvent::CaptureFault {
                        eye,
                        reason: e.to_string(),
                    });
                    if !self.shutdown.sleep(self.retry) {
                        break;
                    }
                    continue;
                }
            }

            let elapsed = started.elapsed();
            if elapsed < self.interval && !self.shutdown.sleep(self.interval - elapsed) {
                break;
            }
        }

        info!(
            eye = eye.name(),
            frames = report.frames_published,
            failures = report.dequeue_failures,
            "capture thread stopped"
        );
        report
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
    use crate::capture::exchange::exchange;
    use crate::capture::frame::FrameFormat;
    use crate::capture::source::TestPattern;
    use crate::lifecycle::shutdown_channel;

    #[test]
    fn publishes_at_roughly_the_acquisition_interval() {
        let format = FrameFormat::rgb(16, 8);
        let (publisher, reader) = exchange(Eye::Left, format);
        let (mut trigger, token) = shutdown_channel();

        let worker = CaptureWorker::new(
            Box::new(TestPattern::new("left", format)),
            publisher,
            Duration::from_millis(10),
            Duration::from_millis(5),
            token,
        );
        let handle = worker.spawn().unwrap();

        thread::sleep(Duration::from_millis(105));
        trigger.trigger();
        let report = handle.join().unwrap();

        assert!(report.frames_published >= 5, "{report:?}");
        assert!(report.frames_published <= 13, "{report:?}");
        assert_eq!(reader.latest_id(), report.frames_published);
    }

    #[test]
    fn retries_open_until_the_camera_appears() {
        let format = FrameFormat::rgb(4, 4);
        let (publisher, reader) = exchange(Eye::Right, format);
        let (events_tx, events_rx) = flume::unbounded();
        let (mut trigger, token) = shutdown_channel();

        let worker = CaptureWorker::new(
            Box::new(TestPattern::new("right", format).with_open_failures(3)),
            publisher,
            Duration::from_millis(5),
            Duration::from_millis(2),
            token,
        )
        .with_events(events_tx);
        let handle = worker.spawn().unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while reader.latest_id() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        trigger.trigger();
        let report = handle.join().unwrap();

        assert_eq!(report.open_attempts, 4);
        let faults = events_rx
            .drain()
            .filter(|e| matches!(e, PipelineEvent::CaptureFault { eye: Eye::Right, .. }))
            .count();
        assert_eq!(faults, 3);
        assert!(reader.latest_id() > 0);
    }
}
