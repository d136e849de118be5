//! Render backends
//!
//! The scheduler only sees [`RenderBackend`]. Concrete backends are built from
//! per-surface [`SurfaceRenderer`]s (one GPU surface each), a [`SurfaceHost`]
//! that owns the windows, and a [`SharedResources`] handle for GPU objects
//! shared by every surface. The backend is picked at startup by
//! [`initialize`].

pub mod fence;
pub mod headless;
pub mod pool;
pub mod single;

#[cfg(feature = "gpu-display")]
pub mod gpu;
#[cfg(feature = "gpu-display")]
pub mod window;

use std::time::{Duration, Instant};

use tracing::info;

use crate::capture::exchange::{FrameView, StereoReader, StereoView};
use crate::capture::frame::{Eye, FrameFormat, StereoIds};
use crate::error::DisplayError;
use crate::{BackendKind, DisplayConfig, RenderMode};

pub use fence::{CompletionTracker, FenceStatus, GpuFence, LatencySample, SkippedFence, Submission};
pub use pool::{BarrierReport, PoolBackend, WorkerPool};
pub use single::SingleSurfaceBackend;

/// One output surface with its own long-lived GPU context
pub trait SurfaceRenderer: Send + 'static {
    /// Called once on the thread that drives this surface, before any rendering.
    fn bind(&mut self) -> Result<(), DisplayError> {
        Ok(())
    }

    /// Copies one eye's newest frame into this surface's texture.
    fn upload(&mut self, eye: Eye, frame: &FrameView<'_>) -> Result<(), DisplayError>;

    /// Clears, draws both eyes, submits and presents.
    /// Returns the completion marker inserted after the present.
    fn draw_and_present(&mut self) -> Result<Box<dyn GpuFence>, DisplayError>;

    /// Destroys per-surface objects. Runs on the thread that drove the surface.
    fn release(&mut self);
}

/// The windowing side: events, close requests and display timing
pub trait SurfaceHost {
    fn poll_events(&mut self);

    /// True once any surface's window asked to close.
    fn close_requested(&self) -> bool;

    /// Refresh interval reported by the display, if it reports one.
    fn refresh_interval(&self) -> Option<Duration>;
}

/// GPU objects shared by all surfaces; released exactly once after every
/// surface is gone.
pub trait SharedResources: Send + Sync {
    fn release(&self);
}

/// Frames one [`RenderBackend::render_and_present`] call put on screen
///
/// Surfaces that sample the exchange themselves may show different frames in
/// the same round, so both ends of the range are kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Presented {
    pub surfaces: usize,
    /// Newest identifier any surface showed, per eye.
    pub newest: StereoIds,
    /// Oldest identifier any surface showed, per eye.
    pub oldest: StereoIds,
}

impl Presented {
    /// Every surface showed the same pair.
    pub fn uniform(surfaces: usize, ids: StereoIds) -> Self {
        Self {
            surfaces,
            newest: ids,
            oldest: ids,
        }
    }

    /// Folds the pairs shown by each surface.
    pub fn from_surfaces(shown: &[StereoIds]) -> Self {
        let Some((&first, rest)) = shown.split_first() else {
            return Self::default();
        };
        rest.iter().fold(Self::uniform(shown.len(), first), |acc, &ids| Self {
            surfaces: acc.surfaces,
            newest: acc.newest.newest(ids),
            oldest: acc.oldest.oldest(ids),
        })
    }
}

/// The capability interface the presentation scheduler drives
pub trait RenderBackend {
    fn name(&self) -> &'static str;

    fn surface_count(&self) -> usize;

    /// Stages the scheduler's chosen frame pair for the next present.
    fn upload_frame(&mut self, frame: &StereoView<'_>) -> Result<(), DisplayError>;

    /// Draws and presents on every surface; reports which frames went out.
    fn render_and_present(&mut self) -> Result<Presented, DisplayError>;

    fn poll_events(&mut self);

    fn should_close(&self) -> bool;

    /// Non-blocking: resolves signalled completion markers.
    fn poll_completed(&mut self) -> Vec<LatencySample>;

    /// Every in-flight slot of some surface is still waiting on the GPU.
    fn is_saturated(&self) -> bool;

    fn refresh_interval(&self) -> Duration;

    fn shutdown(&mut self) -> Result<(), DisplayError>;
}

/// Uploads every ready eye and reports which frames were used.
pub(crate) fn upload_view<R: SurfaceRenderer + ?Sized>(
    renderer: &mut R,
    view: &StereoView<'_>,
) -> Result<(StereoIds, Option<Instant>), DisplayError> {
    for eye in Eye::BOTH {
        if let Some(frame) = view.get(eye) {
            renderer.upload(eye, frame)?;
        }
    }
    Ok((view.ids(), view.oldest_capture()))
}

/// Checks an eye upload against the texture size.
pub(crate) fn check_upload(
    eye: Eye,
    format: FrameFormat,
    frame: &FrameView<'_>,
) -> Result<(), DisplayError> {
    let expected = format.frame_len();
    if frame.len() == expected {
        Ok(())
    } else {
        Err(DisplayError::Upload {
            eye,
            expected,
            actual: frame.len(),
        })
    }
}

/// Builds the backend selected by `config`.
///
/// Any failure here is fatal: there is no degraded mode without a surface.
pub fn initialize(
    config: &DisplayConfig,
    frame: FrameFormat,
    frames: StereoReader,
) -> Result<Box<dyn RenderBackend>, DisplayError> {
    info!(
        backend = ?config.backend,
        mode = ?config.mode,
        surfaces = config.surfaces,
        "initializing display"
    );

    match config.backend {
        BackendKind::Headless => {
            let (backend, _control) = headless::initialize(config, frame, frames)?;
            Ok(backend)
        }
        #[cfg(feature = "gpu-display")]
        BackendKind::Wgpu => gpu::initialize(config, frame, frames),
        #[cfg(not(feature = "gpu-display"))]
        BackendKind::Wgpu => Err(DisplayError::Init(
            "built without the gpu-display feature".into(),
        )),
    }
}

/// Wraps renderers in the backend `mode` asks for.
pub(crate) fn assemble<R: SurfaceRenderer>(
    config: &DisplayConfig,
    mut renderers: Vec<R>,
    host: Box<dyn SurfaceHost>,
    shared: std::sync::Arc<dyn SharedResources>,
    frames: StereoReader,
) -> Result<Box<dyn RenderBackend>, DisplayError> {
    match config.mode {
        RenderMode::Parallel | RenderMode::Serial => {
            let pool = WorkerPool::new(renderers, frames, config.in_flight_depth, config.pin_workers)?
                .with_shared_resources(shared);
            Ok(Box::new(PoolBackend::new(
                pool,
                host,
                config.mode,
                config.fallback_refresh_interval(),
            )))
        }
        RenderMode::Single => {
            if renderers.is_empty() {
                return Err(DisplayError::Init("no surface to render to".into()));
            }
            let first = renderers.swap_remove(0);
            for mut extra in renderers {
                extra.release();
            }
            Ok(Box::new(SingleSurfaceBackend::new(
                first,
                host,
                shared,
                config.in_flight_depth,
                config.fallback_refresh_interval(),
            )?))
        }
    }
}
