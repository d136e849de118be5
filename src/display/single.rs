//! Single-surface backend driven directly by the scheduler

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::capture::exchange::StereoView;
use crate::capture::frame::{Eye, StereoIds};
use crate::display::fence::{CompletionTracker, LatencySample, Submission};
use crate::display::{upload_view, Presented, RenderBackend, SharedResources, SurfaceHost, SurfaceRenderer};
use crate::error::DisplayError;

/// Renders the scheduler's chosen frame pair to one surface on the calling thread
pub struct SingleSurfaceBackend<R: SurfaceRenderer> {
    renderer: R,
    host: Box<dyn SurfaceHost>,
    shared: Option<Arc<dyn SharedResources>>,
    tracker: CompletionTracker,
    staged: StereoIds,
    captured_at: Option<Instant>,
    fallback_refresh: Duration,
    shut_down: bool,
}

impl<R: SurfaceRenderer> SingleSurfaceBackend<R> {
    pub fn new(
        mut renderer: R,
        host: Box<dyn SurfaceHost>,
        shared: Arc<dyn SharedResources>,
        in_flight_depth: usize,
        fallback_refresh: Duration,
    ) -> Result<Self, DisplayError> {
        renderer.bind()?;
        info!(in_flight_depth, "single surface ready");
        Ok(Self {
            renderer,
            host,
            shared: Some(shared),
            tracker: CompletionTracker::new(1, in_flight_depth),
            staged: StereoIds::default(),
            captured_at: None,
            fallback_refresh,
            shut_down: false,
        })
    }
}

impl<R: SurfaceRenderer> RenderBackend for SingleSurfaceBackend<R> {
    fn name(&self) -> &'static str {
        "single"
    }

    fn surface_count(&self) -> usize {
        1
    }

    fn upload_frame(&mut self, frame: &StereoView<'_>) -> Result<(), DisplayError> {
        if self.shut_down {
            return Err(DisplayError::ShutDown);
        }
        let (ids, captured_at) = upload_view(&mut self.renderer, frame)?;
        // An eye with no new frame keeps showing the texture it already has.
        for eye in Eye::BOTH {
            if ids.get(eye) != 0 {
                self.staged.set(eye, ids.get(eye));
            }
        }
        self.captured_at = captured_at.or(self.captured_at);
        Ok(())
    }

    fn render_and_present(&mut self) -> Result<Presented, DisplayError> {
        if self.shut_down {
            return Err(DisplayError::ShutDown);
        }
        let fence = self.renderer.draw_and_present()?;
        debug!(ids = ?self.staged, "presented");
        self.tracker
            .fence_after_submit(0, Submission::new(fence, self.staged, self.captured_at));
        Ok(Presented::uniform(1, self.staged))
    }

    fn poll_events(&mut self) {
        self.host.poll_events();
    }

    fn should_close(&self) -> bool {
        self.host.close_requested()
    }

    fn poll_completed(&mut self) -> Vec<LatencySample> {
        self.tracker.poll_completed()
    }

    fn is_saturated(&self) -> bool {
        self.tracker.is_saturated()
    }

    fn refresh_interval(&self) -> Duration {
        self.host.refresh_interval().unwrap_or(self.fallback_refresh)
    }

    fn shutdown(&mut self) -> Result<(), DisplayError> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;
        self.tracker.clear();
        self.renderer.release();
        if let Some(shared) = self.shared.take() {
            shared.release();
        }
        Ok(())
    }
}

impl<R: SurfaceRenderer> Drop for SingleSurfaceBackend<R> {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::exchange::{exchange, StereoReader};
    use crate::capture::frame::FrameFormat;
    use crate::display::headless::{HeadlessProbe, HeadlessShared, HeadlessSurface};
    use crate::display::SurfaceHost;

    struct NoHost;

    impl SurfaceHost for NoHost {
        fn poll_events(&mut self) {}

        fn close_requested(&self) -> bool {
            false
        }

        fn refresh_interval(&self) -> Option<Duration> {
            None
        }
    }

    #[test]
    fn presents_the_uploaded_pair_and_tracks_it() {
        let format = FrameFormat::rgb(2, 1);
        let (mut left, left_reader) = exchange(Eye::Left, format);
        let (mut right, right_reader) = exchange(Eye::Right, format);
        let frames = StereoReader::new(left_reader, right_reader);
        left.publish(&[1; 6]).unwrap();
        left.publish(&[2; 6]).unwrap();
        right.publish(&[3; 6]).unwrap();

        let probe = HeadlessProbe::new(1);
        let surface = HeadlessSurface::new(0, format, Duration::ZERO, probe.clone());
        let mut backend = SingleSurfaceBackend::new(
            surface,
            Box::new(NoHost),
            Arc::new(HeadlessShared::new(probe.clone())),
            1,
            Duration::from_millis(16),
        )
        .unwrap();

        backend.upload_frame(&frames.read_latest()).unwrap();
        let presented = backend.render_and_present().unwrap();
        assert_eq!(presented, Presented::uniform(1, StereoIds::new(2, 1)));
        assert!(backend.is_saturated());

        let samples = backend.poll_completed();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].frame_ids, StereoIds::new(2, 1));
        assert_eq!(backend.refresh_interval(), Duration::from_millis(16));

        backend.shutdown().unwrap();
        backend.shutdown().unwrap();
        assert_eq!(probe.surfaces_released(), 1);
        assert_eq!(probe.shared_releases(), 1);
        assert!(backend.render_and_present().is_err());
    }
}
