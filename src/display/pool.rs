//! Persistent per-surface render workers
//!
//! One thread per surface, created once and kept for the whole session. The
//! control thread starts a render generation by bumping the generation counter
//! under the barrier lock and waking every worker; each worker samples the
//! newest frames itself, uploads, draws, presents and records its completion
//! marker, then counts itself in. The control thread waits until the count
//! reaches the surface count. Shutdown sets the stop flag and bumps the
//! generation once more so no worker sleeps through it.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::capture::exchange::{StereoReader, StereoView};
use crate::capture::frame::StereoIds;
use crate::display::fence::{CompletionTracker, LatencySample, Submission};
use crate::display::{upload_view, Presented, RenderBackend, SharedResources, SurfaceHost, SurfaceRenderer};
use crate::error::DisplayError;
use crate::RenderMode;

/// How often the control thread re-checks worker liveness while waiting.
const LIVENESS_CHECK: Duration = Duration::from_millis(250);

/// Outcome of one barrier round
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarrierReport {
    pub generation: u64,
    /// Surfaces that finished this round; equals the surface count on success.
    pub completed: usize,
    /// Last generation each surface finished.
    pub rendered: Vec<u64>,
    /// Frame pair each surface showed in its last finished round.
    pub shown: Vec<StereoIds>,
}

impl BarrierReport {
    pub fn presented(&self) -> Presented {
        Presented {
            surfaces: self.completed,
            ..Presented::from_surfaces(&self.shown)
        }
    }
}

struct BarrierState {
    generation: u64,
    completed: usize,
    stop: bool,
    tracker: CompletionTracker,
    rendered: Vec<u64>,
    shown: Vec<StereoIds>,
    failures: Vec<Option<DisplayError>>,
}

struct Barrier {
    state: Mutex<BarrierState>,
    start: Condvar,
    done: Condvar,
    surfaces: usize,
}

impl Barrier {
    fn lock(&self) -> Result<MutexGuard<'_, BarrierState>, DisplayError> {
        self.state.lock().map_err(|_| DisplayError::Poisoned)
    }
}

pub struct WorkerPool<R: SurfaceRenderer> {
    barrier: Arc<Barrier>,
    renderers: Vec<Arc<Mutex<R>>>,
    workers: Vec<Option<JoinHandle<()>>>,
    frames: StereoReader,
    shared: Option<Arc<dyn SharedResources>>,
    serial_rounds: u64,
    shut_down: bool,
}

impl<R: SurfaceRenderer> WorkerPool<R> {
    /// Spawns one worker per renderer. Each renderer is bound on its worker
    /// before the first round.
    pub fn new(
        renderers: Vec<R>,
        frames: StereoReader,
        in_flight_depth: usize,
        pin_workers: bool,
    ) -> Result<Self, DisplayError> {
        let surfaces = renderers.len();
        if surfaces == 0 {
            return Err(DisplayError::Init("worker pool needs at least one surface".into()));
        }

        let barrier = Arc::new(Barrier {
            state: Mutex::new(BarrierState {
                generation: 0,
                completed: 0,
                stop: false,
                tracker: CompletionTracker::new(surfaces, in_flight_depth),
                rendered: vec![0; surfaces],
                shown: vec![StereoIds::default(); surfaces],
                failures: (0..surfaces).map(|_| None).collect(),
            }),
            start: Condvar::new(),
            done: Condvar::new(),
            surfaces,
        });

        let renderers: Vec<_> = renderers
            .into_iter()
            .map(|r| Arc::new(Mutex::new(r)))
            .collect();

        let cores = if pin_workers {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };

        let mut pool = Self {
            barrier,
            renderers,
            workers: Vec::with_capacity(surfaces),
            frames,
            shared: None,
            serial_rounds: 0,
            shut_down: false,
        };

        for index in 0..surfaces {
            // Core 0 is left to the control thread.
            let core = (!cores.is_empty()).then(|| cores[(index + 1) % cores.len()]);
            let worker = Worker {
                index,
                barrier: pool.barrier.clone(),
                renderer: pool.renderers[index].clone(),
                frames: pool.frames.clone(),
                core,
            };
            let handle = thread::Builder::new()
                .name(format!("render-{index}"))
                .spawn(move || worker.run())
                .map_err(|e| DisplayError::Init(format!("failed to spawn render worker: {e}")))?;
            pool.workers.push(Some(handle));
        }

        info!(surfaces, in_flight_depth, pinned = pin_workers, "render workers started");
        Ok(pool)
    }

    /// Releases these after every surface is gone.
    pub fn with_shared_resources(mut self, shared: Arc<dyn SharedResources>) -> Self {
        self.shared = Some(shared);
        self
    }

    pub fn surface_count(&self) -> usize {
        self.barrier.surfaces
    }

    /// Renders every surface concurrently and returns once all of them have
    /// presented and recorded their completion marker.
    pub fn render_all_surfaces_parallel(&mut self) -> Result<BarrierReport, DisplayError> {
        if self.shut_down {
            return Err(DisplayError::ShutDown);
        }

        let generation = {
            let mut state = self.barrier.lock()?;
            state.completed = 0;
            state.generation += 1;
            state.generation
        };
        self.barrier.start.notify_all();

        let mut state = self.barrier.lock()?;
        while state.completed < self.barrier.surfaces && !state.stop {
            let (guard, timeout) = self
                .barrier
                .done
                .wait_timeout(state, LIVENESS_CHECK)
                .map_err(|_| DisplayError::Poisoned)?;
            state = guard;
            if timeout.timed_out() && state.completed < self.barrier.surfaces {
                if let Some(lost) = self.lost_worker() {
                    error!(surface = lost, generation, "render worker died mid-round");
                    return Err(DisplayError::WorkerLost(lost));
                }
            }
        }

        let report = BarrierReport {
            generation,
            completed: state.completed,
            rendered: state.rendered.clone(),
            shown: state.shown.clone(),
        };
        let mut first = None;
        for (surface, failure) in state.failures.iter_mut().enumerate() {
            if let Some(e) = failure.take() {
                warn!(surface, generation, error = %e, "surface failed to render");
                first.get_or_insert(e);
            }
        }
        match first {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Renders every surface one after another on the calling thread.
    pub fn render_all_surfaces_serial(&mut self) -> Result<BarrierReport, DisplayError> {
        if self.shut_down {
            return Err(DisplayError::ShutDown);
        }
        self.serial_rounds += 1;

        let mut completed = 0;
        for (index, renderer) in self.renderers.iter().enumerate() {
            let mut renderer = renderer.lock().map_err(|_| DisplayError::Poisoned)?;
            let submission = render_once(&mut *renderer, &self.frames)?;
            drop(renderer);

            let mut state = self.barrier.lock()?;
            state.shown[index] = submission.frame_ids;
            state.tracker.fence_after_submit(index, submission);
            state.rendered[index] = self.serial_rounds;
            completed += 1;
        }

        let state = self.barrier.lock()?;
        Ok(BarrierReport {
            generation: self.serial_rounds,
            completed,
            rendered: state.rendered.clone(),
            shown: state.shown.clone(),
        })
    }

    pub fn poll_completed(&self) -> Vec<LatencySample> {
        match self.barrier.lock() {
            Ok(mut state) => state.tracker.poll_completed(),
            Err(_) => Vec::new(),
        }
    }

    pub fn is_saturated(&self) -> bool {
        self.barrier
            .lock()
            .map(|state| state.tracker.is_saturated())
            .unwrap_or(false)
    }

    /// Stops and joins every worker, then releases the shared resources once.
    pub fn shutdown(&mut self) -> Result<(), DisplayError> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;

        {
            let mut state = self.barrier.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.stop = true;
            state.generation += 1;
        }
        self.barrier.start.notify_all();
        self.barrier.done.notify_all();

        let mut lost = None;
        for (index, worker) in self.workers.iter_mut().enumerate() {
            let Some(handle) = worker.take() else { continue };
            if handle.join().is_err() {
                error!(surface = index, "render worker panicked");
                lost.get_or_insert(index);
                // The worker could not release its own surface.
                if let Ok(mut renderer) = self.renderers[index].lock() {
                    renderer.release();
                }
            }
        }

        if let Ok(mut state) = self.barrier.state.lock() {
            state.tracker.clear();
        }
        if let Some(shared) = self.shared.take() {
            shared.release();
        }
        info!("render workers stopped");

        match lost {
            Some(index) => Err(DisplayError::WorkerLost(index)),
            None => Ok(()),
        }
    }

    fn lost_worker(&self) -> Option<usize> {
        self.workers.iter().position(|w| match w {
            Some(handle) => handle.is_finished(),
            None => true,
        })
    }
}

impl<R: SurfaceRenderer> Drop for WorkerPool<R> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "render workers did not stop cleanly");
        }
    }
}

/// Samples the exchange, uploads, draws and presents on one surface.
fn render_once<R: SurfaceRenderer>(
    renderer: &mut R,
    frames: &StereoReader,
) -> Result<Submission, DisplayError> {
    let (ids, captured_at) = {
        let view: StereoView<'_> = frames.read_latest();
        upload_view(renderer, &view)?
    };
    let fence = renderer.draw_and_present()?;
    Ok(Submission::new(fence, ids, captured_at))
}

struct Worker<R> {
    index: usize,
    barrier: Arc<Barrier>,
    renderer: Arc<Mutex<R>>,
    frames: StereoReader,
    core: Option<core_affinity::CoreId>,
}

impl<R: SurfaceRenderer> Worker<R> {
    fn run(self) {
        if let Some(core) = self.core {
            if !core_affinity::set_for_current(core) {
                warn!(surface = self.index, core = core.id, "could not pin render worker");
            }
        }

        let Ok(mut renderer) = self.renderer.lock() else {
            error!(surface = self.index, "renderer lock poisoned before start");
            return;
        };
        if let Err(e) = renderer.bind() {
            error!(surface = self.index, error = %e, "failed to bind surface");
            self.record_failure(e);
        }
        drop(renderer);

        let mut local = 0u64;
        loop {
            let state = match self.barrier.state.lock() {
                Ok(state) => state,
                Err(_) => break,
            };
            let state = match self
                .barrier
                .start
                .wait_while(state, |s| s.generation <= local && !s.stop)
            {
                Ok(state) => state,
                Err(_) => break,
            };
            if state.stop {
                break;
            }
            local = state.generation;
            drop(state);

            let started = Instant::now();
            let result = match self.renderer.lock() {
                Ok(mut renderer) => render_once(&mut *renderer, &self.frames),
                Err(_) => Err(DisplayError::Poisoned),
            };
            metrics::histogram!("render_time_us").record(started.elapsed().as_micros() as f64);

            let Ok(mut state) = self.barrier.state.lock() else { break };
            match result {
                Ok(submission) => {
                    debug!(surface = self.index, generation = local, ids = ?submission.frame_ids, "presented");
                    state.shown[self.index] = submission.frame_ids;
                    state.tracker.fence_after_submit(self.index, submission);
                    state.rendered[self.index] = local;
                }
                Err(e) => state.failures[self.index] = Some(e),
            }
            state.completed += 1;
            if state.completed >= self.barrier.surfaces {
                self.barrier.done.notify_all();
            }
        }

        if let Ok(mut renderer) = self.renderer.lock() {
            renderer.release();
        }
        debug!(surface = self.index, "render worker exiting");
    }

    fn record_failure(&self, e: DisplayError) {
        if let Ok(mut state) = self.barrier.state.lock() {
            state.failures[self.index] = Some(e);
        }
    }
}

/// A [`RenderBackend`] over a worker pool, in parallel or serial mode
pub struct PoolBackend<R: SurfaceRenderer> {
    pool: WorkerPool<R>,
    host: Box<dyn SurfaceHost>,
    mode: RenderMode,
    fallback_refresh: Duration,
}

impl<R: SurfaceRenderer> PoolBackend<R> {
    pub fn new(
        pool: WorkerPool<R>,
        host: Box<dyn SurfaceHost>,
        mode: RenderMode,
        fallback_refresh: Duration,
    ) -> Self {
        Self {
            pool,
            host,
            mode,
            fallback_refresh,
        }
    }

    pub fn pool(&self) -> &WorkerPool<R> {
        &self.pool
    }
}

impl<R: SurfaceRenderer> RenderBackend for PoolBackend<R> {
    fn name(&self) -> &'static str {
        match self.mode {
            RenderMode::Serial => "serial",
            _ => "parallel",
        }
    }

    fn surface_count(&self) -> usize {
        self.pool.surface_count()
    }

    // Workers sample the exchange themselves at render time.
    fn upload_frame(&mut self, _frame: &StereoView<'_>) -> Result<(), DisplayError> {
        Ok(())
    }

    fn render_and_present(&mut self) -> Result<Presented, DisplayError> {
        let report = match self.mode {
            RenderMode::Serial => self.pool.render_all_surfaces_serial()?,
            _ => self.pool.render_all_surfaces_parallel()?,
        };
        Ok(report.presented())
    }

    fn poll_events(&mut self) {
        self.host.poll_events();
    }

    fn should_close(&self) -> bool {
        self.host.close_requested()
    }

    fn poll_completed(&mut self) -> Vec<LatencySample> {
        self.pool.poll_completed()
    }

    fn is_saturated(&self) -> bool {
        self.pool.is_saturated()
    }

    fn refresh_interval(&self) -> Duration {
        self.host.refresh_interval().unwrap_or(self.fallback_refresh)
    }

    fn shutdown(&mut self) -> Result<(), DisplayError> {
        self.pool.shutdown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::exchange::{exchange, FrameView};
    use crate::capture::frame::{Eye, FrameFormat, StereoIds};
    use crate::display::fence::{GpuFence, SignaledFence};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const FORMAT: FrameFormat = FrameFormat::rgb(2, 2);

    #[derive(Default)]
    struct Counters {
        presents: AtomicUsize,
        releases: AtomicUsize,
        shared_releases: AtomicUsize,
    }

    struct CountingSurface {
        counters: Arc<Counters>,
        fail: bool,
    }

    impl SurfaceRenderer for CountingSurface {
        fn upload(&mut self, _eye: Eye, _frame: &FrameView<'_>) -> Result<(), DisplayError> {
            Ok(())
        }

        fn draw_and_present(&mut self) -> Result<Box<dyn GpuFence>, DisplayError> {
            if self.fail {
                return Err(DisplayError::Surface {
                    surface: 1,
                    reason: "lost".into(),
                });
            }
            self.counters.presents.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(SignaledFence))
        }

        fn release(&mut self) {
            self.counters.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct CountingShared(Arc<Counters>);

    impl SharedResources for CountingShared {
        fn release(&self) {
            self.0.shared_releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn stereo() -> StereoReader {
        let (mut left, left_reader) = exchange(Eye::Left, FORMAT);
        let (mut right, right_reader) = exchange(Eye::Right, FORMAT);
        left.publish(&[1; 12]).unwrap();
        right.publish(&[2; 12]).unwrap();
        StereoReader::new(left_reader, right_reader)
    }

    fn pool(surfaces: usize, counters: &Arc<Counters>) -> WorkerPool<CountingSurface> {
        let renderers = (0..surfaces)
            .map(|_| CountingSurface {
                counters: counters.clone(),
                fail: false,
            })
            .collect();
        WorkerPool::new(renderers, stereo(), 1, false)
            .unwrap()
            .with_shared_resources(Arc::new(CountingShared(counters.clone())))
    }

    #[test]
    fn every_surface_completes_each_round() {
        let counters = Arc::new(Counters::default());
        let mut pool = pool(3, &counters);

        for round in 1..=4 {
            let report = pool.render_all_surfaces_parallel().unwrap();
            assert_eq!(report.generation, round);
            assert_eq!(report.completed, 3);
            assert_eq!(report.rendered, vec![round; 3]);
        }
        assert_eq!(counters.presents.load(Ordering::SeqCst), 12);

        let samples = pool.poll_completed();
        assert_eq!(samples.len(), 3);
        assert!(samples.iter().all(|s| s.frame_ids == StereoIds::new(1, 1)));
    }

    #[test]
    fn serial_rounds_render_every_surface() {
        let counters = Arc::new(Counters::default());
        let mut pool = pool(2, &counters);

        let report = pool.render_all_surfaces_serial().unwrap();
        assert_eq!(report.completed, 2);
        assert_eq!(counters.presents.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn shutdown_releases_surfaces_then_shared_once() {
        let counters = Arc::new(Counters::default());
        let mut pool = pool(2, &counters);
        pool.render_all_surfaces_parallel().unwrap();

        pool.shutdown().unwrap();
        pool.shutdown().unwrap();
        drop(pool);

        assert_eq!(counters.releases.load(Ordering::SeqCst), 2);
        assert_eq!(counters.shared_releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_surface_still_completes_the_barrier() {
        let counters = Arc::new(Counters::default());
        let renderers = vec![
            CountingSurface {
                counters: counters.clone(),
                fail: false,
            },
            CountingSurface {
                counters: counters.clone(),
                fail: true,
            },
        ];
        let mut pool = WorkerPool::new(renderers, stereo(), 1, false).unwrap();

        let err = pool.render_all_surfaces_parallel().unwrap_err();
        assert!(matches!(err, DisplayError::Surface { surface: 1, .. }));
        assert_eq!(counters.presents.load(Ordering::SeqCst), 1);

        // The next round is not wedged by the failure.
        assert!(pool.render_all_surfaces_parallel().is_err());
    }

    #[test]
    fn rendering_after_shutdown_is_refused() {
        let counters = Arc::new(Counters::default());
        let mut pool = pool(1, &counters);
        pool.shutdown().unwrap();
        assert!(matches!(
            pool.render_all_surfaces_parallel(),
            Err(DisplayError::ShutDown)
        ));
    }
}
