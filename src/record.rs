//! Side-by-side recording from the stable frame slots
//!
//! The recorder is just another reader of the exchange: it pins the newest
//! frame of each eye, copies both into one composite and lets go before
//! encoding, so it never holds up a capture thread.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use tracing::{debug, info, warn};

use crate::capture::exchange::{StereoReader, StereoView};
use crate::capture::frame::{Eye, FrameFormat, StereoIds};
use crate::error::RecordError;
use crate::lifecycle::Shutdown;
use crate::RecordConfig;

/// Both eyes next to each other: left half, right half. A missing eye is black.
#[derive(Debug, Clone)]
pub struct Composite {
    pub width: u32,
    pub height: u32,
    pub ids: StereoIds,
    pub pixels: Bytes,
}

impl Composite {
    /// Returns `None` while neither eye has produced a frame.
    pub fn from_view(view: &StereoView<'_>, format: FrameFormat) -> Option<Self> {
        if view.left.is_none() && view.right.is_none() {
            return None;
        }

        let row = format.row_len();
        let mut pixels = BytesMut::zeroed(format.frame_len() * 2);
        for eye in Eye::BOTH {
            let Some(frame) = view.get(eye) else { continue };
            if frame.len() != format.frame_len() {
                continue;
            }
            for (y, src) in frame.chunks_exact(row).enumerate() {
                let start = y * row * 2 + eye.index() * row;
                pixels[start..start + row].copy_from_slice(src);
            }
        }

        Some(Self {
            width: format.width * 2,
            height: format.height,
            ids: view.ids(),
            pixels: pixels.freeze(),
        })
    }
}

/// Where composites go
pub trait RecordSink: Send {
    fn write(&mut self, frame: &Composite) -> Result<(), RecordError>;

    fn finish(&mut self) -> Result<(), RecordError>;
}

struct Segment {
    path: PathBuf,
    writer: BufWriter<File>,
    started: Instant,
}

/// Concatenated JPEG frames, one file per segment, named by the unix time
/// the segment started.
pub struct MjpegFileSink {
    directory: PathBuf,
    segment_length: Duration,
    quality: u8,
    current: Option<Segment>,
    finished: Vec<PathBuf>,
}

impl MjpegFileSink {
    pub fn new(config: &RecordConfig) -> Result<Self, RecordError> {
        Self::with_options(&config.directory, config.segment_length(), config.jpeg_quality)
    }

    pub fn with_options(directory: &Path, segment_length: Duration, quality: u8) -> Result<Self, RecordError> {
        std::fs::create_dir_all(directory)?;
        Ok(Self {
            directory: directory.to_path_buf(),
            segment_length,
            quality: quality.clamp(1, 100),
            current: None,
            finished: Vec::new(),
        })
    }

    /// Segments closed so far.
    pub fn segments(&self) -> &[PathBuf] {
        &self.finished
    }

    fn open_segment(&self) -> Result<Segment, RecordError> {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        // Short segments can start within the same second.
        let mut suffix = 0;
        loop {
            let name = match suffix {
                0 => format!("{secs}.mjpeg"),
                n => format!("{secs}-{n}.mjpeg"),
            };
            let path = self.directory.join(name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => {
                    info!(path = %path.display(), "recording segment opened");
                    return Ok(Segment {
                        path,
                        writer: BufWriter::new(file),
                        started: Instant::now(),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => suffix += 1,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn close_segment(&mut self) -> Result<(), RecordError> {
        if let Some(mut segment) = self.current.take() {
            segment.writer.flush()?;
            debug!(path = %segment.path.display(), "recording segment closed");
            self.finished.push(segment.path);
        }
        Ok(())
    }
}

impl RecordSink for MjpegFileSink {
    fn write(&mut self, frame: &Composite) -> Result<(), RecordError> {
        let expired = self
            .current
            .as_ref()
            .is_some_and(|s| s.started.elapsed() >= self.segment_length);
        if expired {
            self.close_segment()?;
        }
        if self.current.is_none() {
            self.current = Some(self.open_segment()?);
        }

        let mut jpeg = Vec::with_capacity(frame.pixels.len() / 8);
        JpegEncoder::new_with_quality(&mut jpeg, self.quality)
            .encode(&frame.pixels, frame.width, frame.height, ExtendedColorType::Rgb8)
            .map_err(|e| RecordError::Encode(e.to_string()))?;

        if let Some(segment) = self.current.as_mut() {
            segment.writer.write_all(&jpeg)?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), RecordError> {
        self.close_segment()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordReport {
    pub frames_written: u64,
    pub write_failures: u64,
}

/// Samples the exchange at a fixed rate and feeds a sink
pub struct Recorder {
    frames: StereoReader,
    format: FrameFormat,
    interval: Duration,
    sink: Box<dyn RecordSink>,
    shutdown: Shutdown,
}

impl Recorder {
    pub fn new(frames: StereoReader, interval: Duration, sink: Box<dyn RecordSink>, shutdown: Shutdown) -> Self {
        let format = frames.reader(Eye::Left).format();
        Self {
            frames,
            format,
            interval,
            sink,
            shutdown,
        }
    }

    pub fn spawn(self) -> io::Result<JoinHandle<RecordReport>> {
        thread::Builder::new()
            .name("recorder".into())
            .spawn(move || self.run())
    }

    pub fn run(mut self) -> RecordReport {
        let mut report = RecordReport::default();
        info!(interval_ms = self.interval.as_millis() as u64, "recorder starting");

        while self.shutdown.is_running() {
            let started = Instant::now();

            let composite = {
                let view = self.frames.read_latest();
                Composite::from_view(&view, self.format)
            };
            if let Some(composite) = composite {
                match self.sink.write(&composite) {
                    Ok(()) => report.frames_written += 1,
                    Err(e) => {
                        report.write_failures += 1;
                        warn!(error = %e, "failed to record frame");
                    }
                }
            }

            let elapsed = started.elapsed();
            if elapsed < self.interval && !self.shutdown.sleep(self.interval - elapsed) {
                break;
            }
        }

        if let Err(e) = self.sink.finish() {
            warn!(error = %e, "failed to close recording");
        }
        info!(frames = report.frames_written, "recorder stopped");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::exchange::exchange;
    use crate::lifecycle::shutdown_channel;

    const FORMAT: FrameFormat = FrameFormat::rgb(2, 2);

    fn stereo() -> (crate::capture::FramePublisher, crate::capture::FramePublisher, StereoReader) {
        let (left, left_reader) = exchange(Eye::Left, FORMAT);
        let (right, right_reader) = exchange(Eye::Right, FORMAT);
        (left, right, StereoReader::new(left_reader, right_reader))
    }

    #[test]
    fn composite_places_eyes_side_by_side() {
        let (mut left, _right, frames) = stereo();
        left.publish(&[9; 12]).unwrap();

        let composite = Composite::from_view(&frames.read_latest(), FORMAT).unwrap();
        assert_eq!((composite.width, composite.height), (4, 2));
        assert_eq!(composite.ids, StereoIds::new(1, 0));
        for row in composite.pixels.chunks_exact(12) {
            assert_eq!(&row[..6], &[9; 6]);
            assert_eq!(&row[6..], &[0; 6]);
        }
    }

    #[test]
    fn nothing_to_record_before_first_frame() {
        let (_left, _right, frames) = stereo();
        assert!(Composite::from_view(&frames.read_latest(), FORMAT).is_none());
    }

    #[test]
    fn sink_rotates_segments() {
        let dir = tempfile::tempdir().unwrap();
        let (mut left, mut right, frames) = stereo();
        left.publish(&[40; 12]).unwrap();
        right.publish(&[200; 12]).unwrap();
        let composite = Composite::from_view(&frames.read_latest(), FORMAT).unwrap();

        let mut sink = MjpegFileSink::with_options(dir.path(), Duration::ZERO, 80).unwrap();
        sink.write(&composite).unwrap();
        sink.write(&composite).unwrap();
        sink.finish().unwrap();

        assert_eq!(sink.segments().len(), 2);
        for path in sink.segments() {
            let bytes = std::fs::read(path).unwrap();
            assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        }
    }

    #[test]
    fn recorder_writes_until_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let (mut left, mut right, frames) = stereo();
        left.publish(&[1; 12]).unwrap();
        right.publish(&[2; 12]).unwrap();

        let sink = MjpegFileSink::with_options(dir.path(), Duration::from_secs(60), 85).unwrap();
        let (mut trigger, token) = shutdown_channel();
        let handle = Recorder::new(frames, Duration::from_millis(10), Box::new(sink), token)
            .spawn()
            .unwrap();

        thread::sleep(Duration::from_millis(60));
        trigger.trigger();
        let report = handle.join().unwrap();

        assert!(report.frames_written >= 2, "{report:?}");
        assert_eq!(report.write_failures, 0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
