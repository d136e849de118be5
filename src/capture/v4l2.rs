//! V4L2 camera source with memory-mapped streaming

use std::io;

use tracing::{info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::decoder;
use crate::capture::frame::{FrameFormat, PixelFormat};
use crate::capture::source::FrameSource;
use crate::error::CaptureError;
use crate::CaptureConfig;

/// One `/dev/videoN` camera
pub struct V4l2Source {
    index: usize,
    frame: FrameFormat,
    requested: PixelFormat,
    negotiated: PixelFormat,
    buffer_count: u32,
    // Declared before `device` so the stream is unmapped first.
    stream: Option<MmapStream<'static>>,
    device: Option<Box<Device>>,
}

impl V4l2Source {
    pub fn new(index: usize, config: &CaptureConfig) -> Self {
        Self {
            index,
            frame: config.frame_format(),
            requested: config.format,
            negotiated: config.format,
            buffer_count: config.buffer_count,
            stream: None,
            device: None,
        }
    }

    fn path(&self) -> String {
        format!("/dev/video{}", self.index)
    }

    fn open_error(&self, source: io::Error) -> CaptureError {
        CaptureError::Open {
            device: self.path(),
            source,
        }
    }
}

fn fourcc_for(format: PixelFormat) -> FourCC {
    match format {
        PixelFormat::Mjpeg => FourCC::new(b"MJPG"),
        PixelFormat::Yuyv4 => FourCC::new(b"YUYV"),
        PixelFormat::Rgb24 => FourCC::new(b"RGB3"),
        PixelFormat::Bgr24 => FourCC::new(b"BGR3"),
    }
}

pub(crate) fn format_for(fourcc: FourCC) -> Option<PixelFormat> {
    match &fourcc.repr {
        b"MJPG" => Some(PixelFormat::Mjpeg),
        b"YUYV" => Some(PixelFormat::Yuyv4),
        b"RGB3" => Some(PixelFormat::Rgb24),
        b"BGR3" => Some(PixelFormat::Bgr24),
        _ => None,
    }
}

impl FrameSource for V4l2Source {
    fn describe(&self) -> String {
        format!("{} ({:?})", self.path(), self.requested)
    }

    #[instrument(skip(self), fields(device = %self.path()))]
    fn open(&mut self) -> Result<(), CaptureError> {
        self.stream = None;
        self.device = None;

        let device = Device::new(self.index).map_err(|e| self.open_error(e))?;

        let caps = device.query_caps().map_err(|e| self.open_error(e))?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(CaptureError::NotCaptureDevice { device: self.path() });
        }

        let mut fmt = device.format().map_err(|e| self.open_error(e))?;
        fmt.width = self.frame.width;
        fmt.height = self.frame.height;
        fmt.fourcc = fourcc_for(self.requested);
        let actual = device.set_format(&fmt).map_err(|e| self.open_error(e))?;

        if actual.width != self.frame.width || actual.height != self.frame.height {
            return Err(self.open_error(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "device negotiated {}x{}, slots are {}x{}",
                    actual.width, actual.height, self.frame.width, self.frame.height
                ),
            )));
        }

        self.negotiated = match format_for(actual.fourcc) {
            Some(format) => format,
            None => {
                return Err(CaptureError::Decode(format!(
                    "device negotiated unsupported fourcc {}",
                    actual.fourcc
                )))
            }
        };
        if self.negotiated != self.requested {
            warn!(
                requested = ?self.requested,
                negotiated = ?self.negotiated,
                "device substituted pixel format"
            );
        }

        let device = Box::new(device);
        let stream = MmapStream::with_buffers(&device, Type::VideoCapture, self.buffer_count)
            .map_err(|e| self.open_error(e))?;

        info!("Capture stream started with {} buffers", self.buffer_count);
        self.stream = Some(stream);
        self.device = Some(device);
        Ok(())
    }

    fn dequeue_into(&mut self, out: &mut [u8]) -> Result<(), CaptureError> {
        let stream = self.stream.as_mut().ok_or(CaptureError::NotStreaming)?;

        let (buf, meta) = stream.next()?;
        let used = match meta.bytesused as usize {
            0 => buf.len(),
            n => n.min(buf.len()),
        };

        decoder::decode_into(&buf[..used], self.negotiated, self.frame, out)
    }
}
