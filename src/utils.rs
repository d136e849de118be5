use std::path::Path;

use tracing::{debug, info};
use v4l::{capability::Flags, video::Capture, Device};

use crate::capture::frame::PixelFormat;
use crate::capture::v4l2::format_for;

/// Highest `/dev/videoN` index probed.
const MAX_DEVICES: usize = 64;

/// A capture device found on this machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundDevice {
    pub index: usize,
    pub path: String,
    pub card: String,
    /// Formats the slots can be filled from, in device order.
    pub formats: Vec<PixelFormat>,
}

impl FoundDevice {
    pub fn preferred_format(&self) -> Option<PixelFormat> {
        preferred_format(&self.formats)
    }
}

/// Prefer compressed MJPEG, then YUYV, then raw RGB.
pub fn preferred_format(formats: &[PixelFormat]) -> Option<PixelFormat> {
    [
        PixelFormat::Mjpeg,
        PixelFormat::Yuyv4,
        PixelFormat::Rgb24,
        PixelFormat::Bgr24,
    ]
    .into_iter()
    .find(|f| formats.contains(f))
}

/// Enumerate every video capture device with at least one usable format
pub fn list_capture_devices() -> Vec<FoundDevice> {
    info!("Scanning for capture devices...");

    let mut found = Vec::new();
    for index in 0..MAX_DEVICES {
        let path = format!("/dev/video{}", index);
        if !Path::new(&path).exists() {
            continue;
        }

        let Ok(dev) = Device::with_path(&path) else {
            debug!(%path, "cannot open device");
            continue;
        };
        let Ok(caps) = dev.query_caps() else { continue };
        // Metadata nodes share the driver but cannot capture.
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            continue;
        }

        let formats: Vec<PixelFormat> = dev
            .enum_formats()
            .map(|descs| descs.iter().filter_map(|d| format_for(d.fourcc)).collect())
            .unwrap_or_default();
        if formats.is_empty() {
            continue;
        }

        info!("Found capture device: {} - {}", path, caps.card);
        found.push(FoundDevice {
            index,
            path,
            card: caps.card,
            formats,
        });
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mjpeg_wins_over_raw_formats() {
        let formats = [PixelFormat::Rgb24, PixelFormat::Yuyv4, PixelFormat::Mjpeg];
        assert_eq!(preferred_format(&formats), Some(PixelFormat::Mjpeg));
        assert_eq!(preferred_format(&formats[..2]), Some(PixelFormat::Yuyv4));
        assert_eq!(preferred_format(&[]), None);
    }
}
