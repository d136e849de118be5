//! Off-screen backend for tests and machines without a display
//!
//! Each surface composites both eyes side by side into a CPU canvas. Presents
//! finish immediately; the completion marker signals after a configurable
//! simulated GPU time so latency tracking and backpressure behave like a real
//! device.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::capture::exchange::{FrameView, StereoReader};
use crate::capture::frame::{Eye, FrameFormat};
use crate::display::fence::{FenceStatus, GpuFence};
use crate::display::{assemble, check_upload, RenderBackend, SharedResources, SurfaceHost, SurfaceRenderer};
use crate::error::DisplayError;
use crate::DisplayConfig;

/// Signals once a fixed instant has passed
#[derive(Debug, Clone, Copy)]
pub struct TimedFence {
    ready_at: Instant,
}

impl TimedFence {
    pub fn new(after: Duration) -> Self {
        Self {
            ready_at: Instant::now() + after,
        }
    }
}

impl GpuFence for TimedFence {
    fn status(&self) -> FenceStatus {
        if Instant::now() >= self.ready_at {
            FenceStatus::Signaled
        } else {
            FenceStatus::Pending
        }
    }
}

/// Counters shared by every headless surface, readable from tests
#[derive(Debug, Default)]
pub struct HeadlessProbe {
    presents: Vec<AtomicU64>,
    last_uploaded: Vec<[AtomicU64; 2]>,
    surfaces_released: AtomicUsize,
    shared_releases: AtomicUsize,
    close: AtomicBool,
}

impl HeadlessProbe {
    pub fn new(surfaces: usize) -> Arc<Self> {
        Arc::new(Self {
            presents: (0..surfaces).map(|_| AtomicU64::new(0)).collect(),
            last_uploaded: (0..surfaces)
                .map(|_| [AtomicU64::new(0), AtomicU64::new(0)])
                .collect(),
            ..Default::default()
        })
    }

    pub fn presents(&self, surface: usize) -> u64 {
        self.presents
            .get(surface)
            .map_or(0, |p| p.load(Ordering::SeqCst))
    }

    /// Frame id most recently uploaded to `surface` for `eye`.
    pub fn last_uploaded(&self, surface: usize, eye: Eye) -> u64 {
        self.last_uploaded
            .get(surface)
            .map_or(0, |ids| ids[eye.index()].load(Ordering::SeqCst))
    }

    pub fn surfaces_released(&self) -> usize {
        self.surfaces_released.load(Ordering::SeqCst)
    }

    pub fn shared_releases(&self) -> usize {
        self.shared_releases.load(Ordering::SeqCst)
    }

    /// Acts like the user closing a window.
    pub fn request_close(&self) {
        self.close.store(true, Ordering::SeqCst);
    }
}

pub struct HeadlessSurface {
    index: usize,
    format: FrameFormat,
    canvas: Vec<u8>,
    gpu_time: Duration,
    probe: Arc<HeadlessProbe>,
}

impl HeadlessSurface {
    pub fn new(index: usize, format: FrameFormat, gpu_time: Duration, probe: Arc<HeadlessProbe>) -> Self {
        Self {
            index,
            format,
            canvas: vec![0; format.frame_len() * 2],
            gpu_time,
            probe,
        }
    }

    /// Side-by-side composite: left eye in the left half.
    pub fn canvas(&self) -> &[u8] {
        &self.canvas
    }
}

impl SurfaceRenderer for HeadlessSurface {
    fn upload(&mut self, eye: Eye, frame: &FrameView<'_>) -> Result<(), DisplayError> {
        check_upload(eye, self.format, frame)?;

        let row = self.format.row_len();
        let offset = eye.index() * row;
        for (y, src) in frame.chunks_exact(row).enumerate() {
            let start = y * row * 2 + offset;
            self.canvas[start..start + row].copy_from_slice(src);
        }

        if let Some(ids) = self.probe.last_uploaded.get(self.index) {
            ids[eye.index()].store(frame.id(), Ordering::SeqCst);
        }
        Ok(())
    }

    fn draw_and_present(&mut self) -> Result<Box<dyn GpuFence>, DisplayError> {
        if let Some(presents) = self.probe.presents.get(self.index) {
            presents.fetch_add(1, Ordering::SeqCst);
        }
        Ok(Box::new(TimedFence::new(self.gpu_time)))
    }

    fn release(&mut self) {
        self.canvas = Vec::new();
        self.probe.surfaces_released.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct HeadlessHost {
    probe: Arc<HeadlessProbe>,
    refresh: Duration,
}

impl SurfaceHost for HeadlessHost {
    fn poll_events(&mut self) {}

    fn close_requested(&self) -> bool {
        self.probe.close.load(Ordering::SeqCst)
    }

    fn refresh_interval(&self) -> Option<Duration> {
        Some(self.refresh)
    }
}

pub struct HeadlessShared {
    probe: Arc<HeadlessProbe>,
}

impl HeadlessShared {
    pub fn new(probe: Arc<HeadlessProbe>) -> Self {
        Self { probe }
    }
}

impl SharedResources for HeadlessShared {
    fn release(&self) {
        self.probe.shared_releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// Builds a headless backend and hands back its probe.
pub fn initialize(
    config: &DisplayConfig,
    format: FrameFormat,
    frames: StereoReader,
) -> Result<(Box<dyn RenderBackend>, Arc<HeadlessProbe>), DisplayError> {
    let probe = HeadlessProbe::new(config.surfaces);
    let renderers = (0..config.surfaces)
        .map(|index| HeadlessSurface::new(index, format, config.simulated_gpu_time(), probe.clone()))
        .collect();
    let host = Box::new(HeadlessHost {
        probe: probe.clone(),
        refresh: config.fallback_refresh_interval(),
    });
    let shared = Arc::new(HeadlessShared::new(probe.clone()));

    let backend = assemble(config, renderers, host, shared, frames)?;
    Ok((backend, probe))
}
