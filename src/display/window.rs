//! SDL2 windows hosting the GPU surfaces

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sdl2::event::{Event, WindowEvent};
use sdl2::video::Window;
use sdl2::{EventPump, Sdl, VideoSubsystem};
use tracing::{debug, info, warn};

use crate::display::SurfaceHost;
use crate::error::DisplayError;
use crate::DisplayConfig;

/// Latest drawable size of a window, shared with the thread rendering into it
#[derive(Debug, Default)]
pub struct SurfaceSize(AtomicU64);

impl SurfaceSize {
    pub fn new(width: u32, height: u32) -> Self {
        let size = Self::default();
        size.store(width, height);
        size
    }

    pub fn store(&self, width: u32, height: u32) {
        self.0
            .store((u64::from(width) << 32) | u64::from(height), Ordering::Release);
    }

    pub fn load(&self) -> (u32, u32) {
        let packed = self.0.load(Ordering::Acquire);
        ((packed >> 32) as u32, packed as u32)
    }
}

/// Owns the SDL context, one window per surface and the event pump
pub struct SdlHost {
    // Windows are declared first so they close before the subsystem.
    windows: Vec<Window>,
    sizes: Vec<Arc<SurfaceSize>>,
    events: EventPump,
    _video: VideoSubsystem,
    _sdl: Sdl,
    refresh: Option<Duration>,
    close: bool,
}

impl SdlHost {
    pub fn new(config: &DisplayConfig, count: usize) -> Result<Self, DisplayError> {
        let sdl = sdl2::init().map_err(DisplayError::Init)?;
        let video = sdl.video().map_err(DisplayError::Init)?;

        let mut windows = Vec::with_capacity(count);
        let mut sizes = Vec::with_capacity(count);
        for index in 0..count {
            let title = if count > 1 {
                format!("{} [{}]", config.title, index)
            } else {
                config.title.clone()
            };
            let x = i32::try_from(index as u32 * config.width).unwrap_or(0);
            let window = video
                .window(&title, config.width, config.height)
                .position(x, 0)
                .resizable()
                .build()
                .map_err(|e| DisplayError::Init(format!("window {index}: {e}")))?;

            let (width, height) = window.size();
            sizes.push(Arc::new(SurfaceSize::new(width, height)));
            windows.push(window);
        }

        let events = sdl.event_pump().map_err(DisplayError::Init)?;
        let refresh = match video.current_display_mode(0) {
            Ok(mode) if mode.refresh_rate > 0 => {
                Some(Duration::from_secs_f64(1.0 / f64::from(mode.refresh_rate)))
            }
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "display did not report a refresh rate");
                None
            }
        };
        info!(windows = count, ?refresh, "SDL windows created");

        Ok(Self {
            windows,
            sizes,
            events,
            _video: video,
            _sdl: sdl,
            refresh,
            close: false,
        })
    }

    pub fn windows(&self) -> &[Window] {
        &self.windows
    }

    pub fn size_handle(&self, index: usize) -> Option<Arc<SurfaceSize>> {
        self.sizes.get(index).cloned()
    }
}

impl SurfaceHost for SdlHost {
    fn poll_events(&mut self) {
        for event in self.events.poll_iter() {
            match event {
                Event::Quit { .. } => {
                    info!("Quit event received");
                    self.close = true;
                }
                Event::Window {
                    window_id,
                    win_event,
                    ..
                } => {
                    let Some(index) = self.windows.iter().position(|w| w.id() == window_id) else {
                        continue;
                    };
                    match win_event {
                        WindowEvent::Close => {
                            info!(surface = index, "window closed");
                            self.close = true;
                        }
                        WindowEvent::SizeChanged(width, height) => {
                            debug!(surface = index, width, height, "window resized");
                            self.sizes[index].store(width.max(1) as u32, height.max(1) as u32);
                        }
                        _ => {}
                    }
                }
                _ => {}
            }
        }
    }

    fn close_requested(&self) -> bool {
        self.close
    }

    fn refresh_interval(&self) -> Option<Duration> {
        self.refresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn surface_size_round_trips_both_halves() {
        let size = SurfaceSize::new(3840, 1080);
        assert_eq!(size.load(), (3840, 1080));
        size.store(1, u32::MAX);
        assert_eq!(size.load(), (1, u32::MAX));
    }
}
