//! Top-level controller: owns every thread and runs the scheduler

use std::io;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use flume::{Receiver, Sender};
use tracing::{info, instrument, warn};

use crate::capture::exchange::{exchange, FramePublisher, StereoReader};
use crate::capture::frame::Eye;
use crate::capture::source::FrameSource;
use crate::capture::worker::{CaptureReport, CaptureWorker};
use crate::display::RenderBackend;
use crate::error::DisplayError;
use crate::lifecycle::{join_all, shutdown_channel, JoinOutcome, Shutdown, ShutdownTrigger};
use crate::pipeline::jit::{JitScheduler, RunReport};
use crate::pipeline::stats::{PipelineEvent, PipelineStats, StatsHandle, StatsRecorder};
use crate::pipeline::vblank::RefreshClock;
use crate::record::{RecordReport, RecordSink, Recorder};
use crate::Config;

/// Pipeline events kept before new ones are dropped.
const EVENT_BACKLOG: usize = 4096;

/// How a background thread ended during [`Viewer::shutdown`]
#[derive(Debug)]
pub enum ThreadReport {
    Capture(CaptureReport),
    Record(RecordReport),
}

/// Wires capture threads, the recorder and the scheduler together
///
/// The viewer holds the join handle of every thread it starts and joins them
/// all on [`shutdown`](Viewer::shutdown), bounded by the configured timeout.
pub struct Viewer {
    config: Config,
    frames: StereoReader,
    publishers: [Option<FramePublisher>; 2],
    trigger: ShutdownTrigger,
    shutdown: Shutdown,
    events_tx: Sender<PipelineEvent>,
    events_rx: Receiver<PipelineEvent>,
    threads: Vec<(String, JoinHandle<ThreadReport>)>,
    stats: Option<StatsHandle>,
}

impl Viewer {
    pub fn new(config: Config) -> Self {
        let format = config.capture.frame_format();
        let (left, left_reader) = exchange(Eye::Left, format);
        let (right, right_reader) = exchange(Eye::Right, format);
        let (trigger, shutdown) = shutdown_channel();
        let (events_tx, events_rx) = flume::bounded(EVENT_BACKLOG);

        Self {
            config,
            frames: StereoReader::new(left_reader, right_reader),
            publishers: [Some(left), Some(right)],
            trigger,
            shutdown,
            events_tx,
            events_rx,
            threads: Vec::new(),
            stats: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Read access to both streams, e.g. for a display backend.
    pub fn frames(&self) -> StereoReader {
        self.frames.clone()
    }

    /// Structured pipeline records; bounded, oldest kept.
    pub fn events(&self) -> Receiver<PipelineEvent> {
        self.events_rx.clone()
    }

    pub fn shutdown_token(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Starts the capture thread for one eye. Each eye can be started once.
    #[instrument(skip_all, fields(eye = eye.name()))]
    pub fn spawn_capture(&mut self, eye: Eye, source: Box<dyn FrameSource>) -> io::Result<()> {
        let publisher = self.publishers[eye.index()].take().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} capture already running", eye.name()),
            )
        })?;

        let capture = &self.config.capture;
        let worker = CaptureWorker::new(
            source,
            publisher,
            capture.acquire_interval(),
            capture.retry_interval(),
            self.shutdown.clone(),
        )
        .with_frame_timing(self.config.logging.frame_timing)
        .with_events(self.events_tx.clone());

        let name = format!("capture-{}", eye.name());
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || ThreadReport::Capture(worker.run()))?;
        self.threads.push((name, handle));
        Ok(())
    }

    pub fn spawn_recorder(&mut self, sink: Box<dyn RecordSink>) -> io::Result<()> {
        let recorder = Recorder::new(
            self.frames.clone(),
            self.config.record.frame_interval(),
            sink,
            self.shutdown.clone(),
        );
        let handle = thread::Builder::new()
            .name("recorder".into())
            .spawn(move || ThreadReport::Record(recorder.run()))?;
        self.threads.push(("recorder".into(), handle));
        Ok(())
    }

    /// Runs the scheduler on the calling thread until a window closes,
    /// [`stop`](Viewer::stop) is called or `duration` elapses. The backend is
    /// shut down before this returns.
    pub fn run(
        &mut self,
        backend: Box<dyn RenderBackend>,
        duration: Option<Duration>,
    ) -> Result<RunReport, DisplayError> {
        let clock = RefreshClock::new(backend.refresh_interval());
        let stats = StatsRecorder::new(
            self.config.pipeline.latency_window,
            Some(self.events_tx.clone()),
        );
        let mut scheduler = JitScheduler::new(
            backend,
            self.frames.clone(),
            clock,
            &self.config.pipeline,
            stats,
        )
        .with_frame_timing(self.config.logging.frame_timing)
        .with_shutdown(self.shutdown.clone());
        self.stats = Some(scheduler.stats());

        let result = scheduler.run_until(duration.map(|d| Instant::now() + d));
        if let Err(e) = scheduler.shutdown() {
            warn!(error = %e, "display shutdown failed");
        }
        result
    }

    /// Latest published statistics; defaults before the first run.
    pub fn stats(&self) -> PipelineStats {
        self.stats
            .as_ref()
            .map(|handle| (*handle.load()).clone())
            .unwrap_or_default()
    }

    /// Asks every loop to stop without joining anything.
    pub fn stop(&mut self) {
        self.trigger.trigger();
    }

    /// Stops everything and joins all threads, bounded by the shutdown timeout.
    pub fn shutdown(mut self) -> Vec<(String, JoinOutcome<ThreadReport>)> {
        self.trigger.trigger();
        let timeout = self.config.pipeline.shutdown_timeout();
        let outcomes = join_all(std::mem::take(&mut self.threads), timeout);
        let stragglers = outcomes
            .iter()
            .filter(|(_, outcome)| !outcome.is_finished())
            .count();
        info!(threads = outcomes.len(), stragglers, "viewer shut down");
        outcomes
    }
}
