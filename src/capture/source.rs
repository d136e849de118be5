//! Capture collaborators: anything that can fill a frame slot

use std::io;

use super::frame::FrameFormat;
use crate::error::CaptureError;

/// A camera, or anything pretending to be one.
///
/// `open` is retried by the capture worker until it succeeds. `dequeue_into`
/// blocks until the next frame is available and writes it as packed RGB24;
/// any error is treated as a transient dropout.
pub trait FrameSource: Send {
    fn describe(&self) -> String;

    fn open(&mut self) -> Result<(), CaptureError>;

    fn dequeue_into(&mut self, out: &mut [u8]) -> Result<(), CaptureError>;
}

/// Synthetic moving gradient, one frame per dequeue
///
/// Stands in for a camera in headless runs and tests. Each frame differs from
/// the previous one so stale frames are visible on screen.
#[derive(Debug, Clone)]
pub struct TestPattern {
    name: String,
    format: FrameFormat,
    tick: u64,
    open_failures: u32,
    phase: u8,
}

impl TestPattern {
    pub fn new(name: impl Into<String>, format: FrameFormat) -> Self {
        Self {
            name: name.into(),
            format,
            tick: 0,
            open_failures: 0,
            phase: 0,
        }
    }

    /// Fail the first `count` open attempts, as an unplugged camera would.
    pub fn with_open_failures(mut self, count: u32) -> Self {
        self.open_failures = count;
        self
    }

    /// Offset the gradient so the two eyes are distinguishable.
    pub fn with_phase(mut self, phase: u8) -> Self {
        self.phase = phase;
        self
    }

    pub fn frames_produced(&self) -> u64 {
        self.tick
    }
}

impl FrameSource for TestPattern {
    fn describe(&self) -> String {
        format!(
            "test pattern {} ({}x{})",
            self.name, self.format.width, self.format.height
        )
    }

    fn open(&mut self) -> Result<(), CaptureError> {
        if self.open_failures > 0 {
            self.open_failures -= 1;
            return Err(CaptureError::Open {
                device: self.name.clone(),
                source: io::Error::new(io::ErrorKind::NotFound, "simulated unplugged camera"),
            });
        }
        Ok(())
    }

    fn dequeue_into(&mut self, out: &mut [u8]) -> Result<(), CaptureError> {
        let expected = self.format.frame_len();
        if out.len() != expected {
            return Err(CaptureError::SizeMismatch {
                expected,
                actual: out.len(),
            });
        }

        self.tick += 1;
        let shift = (self.tick as usize).wrapping_mul(4);
        let channels = self.format.channels as usize;
        for (y, row) in out.chunks_exact_mut(self.format.row_len()).enumerate() {
            for (x, px) in row.chunks_exact_mut(channels).enumerate() {
                let base = (x.wrapping_add(shift) ^ y) as u8;
                for (c, value) in px.iter_mut().enumerate() {
                    *value = base.wrapping_add(self.phase).wrapping_add((c * 85) as u8);
                }
            }
        }
        Ok(())
    }
}
